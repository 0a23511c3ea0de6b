//! Error types for Strait

use thiserror::Error;

/// Main error type for Strait
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    BadAddress(String),

    #[error("Invalid share link: {0}")]
    ShareLink(String),

    #[error("Unsupported proxy type: {0}")]
    UnsupportedKind(String),

    #[error("Unsupported sniffer: {0}")]
    UnsupportedSniffer(String),

    #[error("All sniffers failed")]
    SniffFailed,

    #[error("Not enough information for making a decision")]
    NoClue,

    #[error("Invalid length")]
    InvalidLength,

    #[error("Buffer too small")]
    SmallBuffer,

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Unexpected ALPN protocol {0}, want h2")]
    BadAlpn(String),

    #[error("Timeout")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// Result type alias for Strait
pub type Result<T> = std::result::Result<T, Error>;
