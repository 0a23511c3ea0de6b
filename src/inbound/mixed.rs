//! Mixed listener
//!
//! A single TCP listener that tells SOCKS4, SOCKS5 and HTTP clients apart
//! by peeking the first byte, then runs the matching handshake.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::common::{BufferedStream, ConnContext};
use crate::error::Result;
use crate::transport::tcp;

use super::http::AuthCache;
use super::socks::{SOCKS4_VERSION, SOCKS5_VERSION};
use super::{http, socks, with_in_name, with_special_rules, Addition, UserPass};

/// Mixed-protocol inbound listener
pub struct MixedListener {
    addr: String,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl MixedListener {
    /// Bind and start accepting. Contexts are delivered on `tcp_in`.
    pub async fn new(
        addr: &str,
        tcp_in: UnboundedSender<ConnContext>,
        authentication: Option<UserPass>,
        mut additions: Vec<Addition>,
    ) -> Result<Self> {
        if additions.is_empty() {
            additions = vec![with_in_name("DEFAULT-MIXED"), with_special_rules("")];
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let closed = Arc::new(AtomicBool::new(false));
        let cache = AuthCache::new();

        let accept_closed = closed.clone();
        let handle = tokio::spawn(async move {
            let authentication = authentication.map(Arc::new);
            let additions = Arc::new(additions);
            loop {
                let (conn, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if accept_closed.load(Ordering::SeqCst) {
                            break;
                        }
                        error!("[Mixed] accept error: {}", e);
                        continue;
                    }
                };

                let tcp_in = tcp_in.clone();
                let cache = cache.clone();
                let authentication = authentication.clone();
                let additions = additions.clone();
                tokio::spawn(async move {
                    handle_conn(
                        conn,
                        peer,
                        &tcp_in,
                        &cache,
                        authentication.as_deref(),
                        &additions,
                    )
                    .await;
                });
            }
        });

        info!("[Mixed] listening on {}", local_addr);
        Ok(Self {
            addr: addr.to_string(),
            local_addr,
            closed,
            handle,
        })
    }

    /// The configured listen address
    pub fn raw_address(&self) -> &str {
        &self.addr
    }

    /// The bound socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. Idempotent; in-flight connections are unaffected.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}

impl Drop for MixedListener {
    fn drop(&mut self) {
        self.close();
    }
}

async fn handle_conn(
    conn: TcpStream,
    peer: SocketAddr,
    tcp_in: &UnboundedSender<ConnContext>,
    cache: &AuthCache,
    authentication: Option<&UserPass>,
    additions: &[Addition],
) {
    tcp::set_keepalive(&conn);
    let local = conn.local_addr().ok();
    let source = Some(peer);

    let mut stream = BufferedStream::new(Box::new(conn));
    let head = match stream.peek(1).await {
        Ok(view) => view[0],
        Err(_) => return,
    };

    let result = match head {
        SOCKS4_VERSION => socks::handle_socks4(stream, tcp_in, source, local, additions).await,
        SOCKS5_VERSION => {
            socks::handle_socks5(stream, tcp_in, authentication, source, local, additions).await
        }
        _ => {
            http::handle_conn(
                stream,
                tcp_in,
                cache,
                authentication,
                source,
                local,
                additions,
            )
            .await
        }
    };

    if let Err(e) = result {
        debug!("[Mixed] connection from {} dropped: {}", peer, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnKind;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    async fn start() -> (MixedListener, mpsc::UnboundedReceiver<ConnContext>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = MixedListener::new("127.0.0.1:0", tx, None, vec![])
            .await
            .unwrap();
        (listener, rx)
    }

    #[tokio::test]
    async fn test_socks5_classification() {
        let (listener, mut rx) = start().await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        // greeting
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        // CONNECT example.com:443
        let mut request = vec![0x05, 0x01, 0x00, 0x03, 11];
        request.extend_from_slice(b"example.com");
        request.extend_from_slice(&443u16.to_be_bytes());
        client.write_all(&request).await.unwrap();
        let mut connect_reply = [0u8; 10];
        client.read_exact(&mut connect_reply).await.unwrap();
        assert_eq!(connect_reply[1], 0x00);

        let context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.kind, ConnKind::Socks5);
        assert_eq!(context.metadata.host, "example.com");
        assert_eq!(context.metadata.dst_port, 443);
        assert_eq!(context.metadata.in_name, "DEFAULT-MIXED");
    }

    #[tokio::test]
    async fn test_socks4_classification() {
        let (listener, mut rx) = start().await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        // SOCKS4 CONNECT 1.2.3.4:80, empty userid
        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&80u16.to_be_bytes());
        request.extend_from_slice(&[1, 2, 3, 4]);
        request.push(0);
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);

        let context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.kind, ConnKind::Socks4);
        assert_eq!(context.metadata.dst_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(context.metadata.dst_port, 80);
    }

    #[tokio::test]
    async fn test_socks4a_hostname() {
        let (listener, mut rx) = start().await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        let mut request = vec![0x04, 0x01];
        request.extend_from_slice(&443u16.to_be_bytes());
        request.extend_from_slice(&[0, 0, 0, 1]);
        request.push(0); // userid
        request.extend_from_slice(b"example.net");
        request.push(0);
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], 0x5A);

        let context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.host, "example.net");
        assert_eq!(context.metadata.dst_port, 443);
    }

    #[tokio::test]
    async fn test_http_connect_classification() {
        let (listener, mut rx) = start().await;
        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();

        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();
        let mut reply = vec![0u8; RESPONSE_200.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        let context = rx.recv().await.unwrap();
        assert_eq!(context.metadata.kind, ConnKind::Http);
        assert_eq!(context.metadata.host, "example.com");
        assert_eq!(context.metadata.dst_port, 443);
    }

    const RESPONSE_200: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

    #[tokio::test]
    async fn test_closed_listener_stops_accepting() {
        let (listener, _rx) = start().await;
        let addr = listener.local_addr();
        listener.close();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Either the connect fails outright or the socket is never served
        if let Ok(mut conn) = TcpStream::connect(addr).await {
            conn.write_all(&[0x05, 0x01, 0x00]).await.ok();
            let mut buf = [0u8; 2];
            let read = tokio::time::timeout(
                std::time::Duration::from_millis(100),
                conn.read_exact(&mut buf),
            )
            .await;
            assert!(matches!(read, Err(_) | Ok(Err(_))));
        }
    }
}
