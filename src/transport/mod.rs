//! Transport Layer
//!
//! Responsibilities:
//! - Establish raw outbound connections (TCP)
//! - Wrap streams in carrier layers (TLS, WebSocket, gRPC-over-HTTP/2)
//! - NO proxy protocol parsing, NO content inspection
//!
//! Adapters compose these pieces: dial TCP, then stack the carriers the
//! descriptor asks for, then speak the proxy protocol on top.

pub mod grpc;
pub mod tcp;
pub mod tls;
pub mod ws;

pub use grpc::{GrpcConfig, GrpcFrameReader, GrpcFrameWriter};
pub use tls::TlsConfig;
pub use ws::WsConfig;
