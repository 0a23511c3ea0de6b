//! Strait - a multi-protocol traffic-forwarding tunnel
//!
//! # Architecture
//!
//! ```text
//! Mixed listener (SOCKS4/SOCKS5/HTTP on one port)
//! → ConnContext (connection + metadata)
//! → Sniffer (TLS SNI / HTTP Host rewrite)
//! → Outbound adapter (direct/ss/socks5/http/vmess/vless/trojan)
//! → Carrier transports (TCP, TLS, WebSocket, gRPC-over-HTTP/2)
//! → Bidirectional splice
//! ```
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/      # Core types: Stream, BufferedStream, Metadata, Address
//! ├── inbound/     # Mixed listener and per-protocol handshakes
//! ├── sniff/       # Sniffer dispatcher, TLS + HTTP sniffers
//! ├── tls/         # ClientHello fingerprint engine
//! ├── transport/   # TCP dial and TLS/WS/gRPC carriers
//! ├── outbound/    # Descriptors, adapter trait, per-kind clients
//! ├── convert/     # Option-map and share-link decoding
//! └── app/         # Tunnel glue, registry, management API
//! ```

// Core types
pub mod common;
pub mod error;

// Layers
pub mod app;
pub mod convert;
pub mod inbound;
pub mod outbound;
pub mod sniff;
pub mod tls;
pub mod transport;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use common::{Address, BufferedStream, ConnContext, Metadata, Network, Stream};
pub use config::Config;
pub use error::{Error, Result};

pub use app::{Runtime, Tunnel};
pub use outbound::{OutboundAdapter, ProxyDescriptor};
pub use sniff::SnifferDispatcher;
