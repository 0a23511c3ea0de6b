//! In-process inbound
//!
//! Lets components open tunneled connections without a socket: the far
//! side of an in-memory pipe is injected into the tunnel as a ConnContext
//! tagged `Inner`. The URL prober uses this.

use tokio::sync::mpsc::UnboundedSender;

use crate::common::{Address, BufferedStream, ConnContext, ConnKind, Metadata, Network, Result, Stream};

use super::with_in_name;

/// Open an in-process TCP connection through the tunnel.
///
/// `dst` is a "host:port" destination; a non-empty `host` overrides the
/// routing hostname.
pub fn handle_tcp(
    tcp_in: &UnboundedSender<ConnContext>,
    dst: &str,
    host: &str,
) -> Result<Stream> {
    let (near, far) = tokio::io::duplex(32 * 1024);

    let target = Address::parse_host_port(dst, 443)?;
    let mut metadata = Metadata::new(Network::Tcp, ConnKind::Inner).with_destination(&target);
    if !host.is_empty() {
        metadata.host = host.to_string();
    }
    with_in_name("INNER").apply(&mut metadata);

    let context = ConnContext::new(BufferedStream::new(Box::new(far)), metadata);
    tcp_in
        .send(context)
        .map_err(|_| crate::error::Error::Closed)?;

    Ok(Box::new(near))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_inner_context_shape() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _stream = handle_tcp(&tx, "example.com:80", "").unwrap();

        let context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.kind, ConnKind::Inner);
        assert_eq!(context.metadata.host, "example.com");
        assert_eq!(context.metadata.dst_port, 80);
        assert_eq!(context.metadata.in_name, "INNER");
    }

    #[tokio::test]
    async fn test_inner_pipe_carries_bytes() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut stream = handle_tcp(&tx, "1.2.3.4:80", "override.example").unwrap();
        let mut context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.host, "override.example");

        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        context.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
