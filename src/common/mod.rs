//! Common types and abstractions
//!
//! This module defines the core types used throughout the application:
//! - Stream / BufferedStream: unified async I/O with bounded lookahead
//! - Metadata: connection context for outbound selection
//! - Address: network address representation (SOCKS5 wire form)
//! - ConnContext: accepted connection + metadata pairing
//! - relay: bidirectional copy with idle timeout

mod address;
mod context;
mod metadata;
pub mod pipe;
mod stream;

pub use address::{Address, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
pub use context::ConnContext;
pub use metadata::{ConnKind, DnsMode, Metadata, Network};
pub use pipe::{relay, DEFAULT_IDLE_TIMEOUT};
pub use stream::{BufferedStream, IntoStream, Stream};

// Re-export error types from crate root
pub use crate::error::{Error, Result};
