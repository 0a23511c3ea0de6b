//! HTTP proxy inbound
//!
//! Handles both `CONNECT host:port` tunnels and absolute-URI / Host-header
//! proxied requests. An authenticated source address is remembered for
//! 30 seconds so follow-up connections skip the credential check.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::BytesMut;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::common::{Address, BufferedStream, ConnContext, ConnKind, Result, Stream};
use crate::error::Error;

use super::{new_context, Addition, UserPass};

const RESPONSE_200_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_407_AUTH_REQUIRED: &[u8] = b"HTTP/1.1 407 Proxy Authentication Required\r\n\
    Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\
    Connection: close\r\n\r\n";

const MAX_HEADER_SIZE: usize = 64 * 1024;
const AUTH_CACHE_TTL: Duration = Duration::from_secs(30);
const AUTH_CACHE_CAPACITY: usize = 128;

/// Remembers which source addresses already passed Basic auth
pub struct AuthCache {
    entries: Mutex<LruCache<String, Instant>>,
}

impl AuthCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(LruCache::new(
                NonZeroUsize::new(AUTH_CACHE_CAPACITY).unwrap(),
            )),
        })
    }

    fn check(&self, source: &str) -> bool {
        let mut entries = self.entries.lock();
        match entries.get(source) {
            Some(at) if at.elapsed() < AUTH_CACHE_TTL => true,
            Some(_) => {
                entries.pop(source);
                false
            }
            None => false,
        }
    }

    fn remember(&self, source: &str) {
        self.entries.lock().put(source.to_string(), Instant::now());
    }
}

struct Request {
    method: String,
    target: String,
    version: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn destination(&self) -> Result<Address> {
        if self.is_connect() {
            return Address::parse_host_port(&self.target, 443);
        }

        // Absolute URI
        if let Some(rest) = self.target.strip_prefix("http://") {
            let host_part = rest.split('/').next().unwrap_or(rest);
            return Address::parse_host_port(host_part, 80);
        }

        // Origin form needs the Host header
        if self.target.starts_with('/') {
            if let Some(host) = self.header("host") {
                return Address::parse_host_port(host, 80);
            }
        }

        Err(Error::Protocol(format!(
            "cannot determine target from {}",
            self.target
        )))
    }

    /// Rebuild the request with a relative path for onward forwarding
    fn to_forward_bytes(&self) -> BytesMut {
        let path = if let Some(rest) = self.target.strip_prefix("http://") {
            match rest.find('/') {
                Some(pos) => &rest[pos..],
                None => "/",
            }
        } else {
            &self.target
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(self.method.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(path.as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(self.version.as_bytes());
        buf.extend_from_slice(b"\r\n");

        for (key, value) in &self.headers {
            if key.to_lowercase().starts_with("proxy-") {
                continue;
            }
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        buf.extend_from_slice(b"\r\n");
        buf
    }
}

/// Read the request head off the buffered stream; body bytes stay put.
async fn read_request(stream: &mut BufferedStream) -> Result<Request> {
    let mut want = 1;
    let head = loop {
        stream.peek(want).await?;
        let buffered = stream.buffered();
        let view = stream.peek(buffered).await?;
        if let Some(pos) = find_header_end(view) {
            let mut head = vec![0u8; pos + 4];
            stream.read_exact(&mut head).await?;
            break head;
        }
        if buffered > MAX_HEADER_SIZE {
            return Err(Error::Protocol("request head too large".into()));
        }
        want = buffered + 1;
    };

    let text = String::from_utf8_lossy(&head);
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or_default().to_string();
    let target = parts.next().unwrap_or_default().to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();
    if method.is_empty() || target.is_empty() {
        return Err(Error::Protocol("invalid HTTP request line".into()));
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(Request {
        method,
        target,
        version,
        headers,
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn check_auth(
    request: &Request,
    authentication: Option<&UserPass>,
    cache: &AuthCache,
    source: &str,
) -> bool {
    let expected = match authentication {
        Some(auth) => auth,
        None => return true,
    };

    if cache.check(source) {
        return true;
    }

    let credentials = format!("{}:{}", expected.username, expected.password);
    let header = format!("Basic {}", BASE64.encode(credentials));
    if request.header("proxy-authorization") == Some(header.as_str()) {
        cache.remember(source);
        return true;
    }
    false
}

/// Serve one proxied HTTP client and hand the context to the tunnel.
pub async fn handle_conn(
    mut stream: BufferedStream,
    tcp_in: &UnboundedSender<ConnContext>,
    cache: &AuthCache,
    authentication: Option<&UserPass>,
    source: Option<SocketAddr>,
    local: Option<SocketAddr>,
    additions: &[Addition],
) -> Result<()> {
    let request = read_request(&mut stream).await?;
    debug!(
        "[HTTP] {} {} ({})",
        request.method,
        request.target,
        if request.is_connect() {
            "tunnel"
        } else {
            "forward"
        }
    );

    let source_key = source.map(|s| s.to_string()).unwrap_or_default();
    if !check_auth(&request, authentication, cache, &source_key) {
        stream.write_all(RESPONSE_407_AUTH_REQUIRED).await?;
        return Err(Error::Protocol("proxy authentication required".into()));
    }

    let target = request.destination()?;

    let context = if request.is_connect() {
        stream.write_all(RESPONSE_200_ESTABLISHED).await?;
        stream.flush().await?;
        new_context(ConnKind::Http, &target, source, local, stream, additions)
    } else {
        // Forward mode: the rewritten request rides in front of the body
        let forward = request.to_forward_bytes();
        let stream = BufferedStream::new(Box::new(PrependStream::new(forward, Box::new(stream))));
        new_context(ConnKind::Http, &target, source, local, stream, additions)
    };

    tcp_in.send(context).map_err(|_| Error::Closed)
}

/// Stream wrapper that serves queued bytes before the underlying stream
struct PrependStream {
    prepend: BytesMut,
    inner: Stream,
}

impl PrependStream {
    fn new(prepend: BytesMut, inner: Stream) -> Self {
        Self { prepend, inner }
    }
}

impl AsyncRead for PrependStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prepend.is_empty() {
            let to_copy = self.prepend.len().min(buf.remaining());
            buf.put_slice(&self.prepend[..to_copy]);
            let _ = self.prepend.split_to(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrependStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_cache_expiry() {
        let cache = AuthCache::new();
        assert!(!cache.check("10.0.0.1:1000"));
        cache.remember("10.0.0.1:1000");
        assert!(cache.check("10.0.0.1:1000"));
        assert!(!cache.check("10.0.0.2:1000"));
    }

    #[tokio::test]
    async fn test_read_request_leaves_body() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"POST /x HTTP/1.1\r\nHost: example.com\r\nContent-Length: 4\r\n\r\nbody")
            .await
            .unwrap();

        let mut stream = BufferedStream::new(Box::new(client));
        let request = read_request(&mut stream).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.header("host"), Some("example.com"));

        let mut body = [0u8; 4];
        stream.read_exact(&mut body).await.unwrap();
        assert_eq!(&body, b"body");
    }

    #[test]
    fn test_destination_parsing() {
        let connect = Request {
            method: "CONNECT".into(),
            target: "example.com:443".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert_eq!(
            connect.destination().unwrap(),
            Address::domain("example.com", 443)
        );

        let absolute = Request {
            method: "GET".into(),
            target: "http://example.com/index".into(),
            version: "HTTP/1.1".into(),
            headers: vec![],
        };
        assert_eq!(
            absolute.destination().unwrap(),
            Address::domain("example.com", 80)
        );

        let origin = Request {
            method: "GET".into(),
            target: "/index".into(),
            version: "HTTP/1.1".into(),
            headers: vec![("Host".into(), "example.com:8080".into())],
        };
        assert_eq!(
            origin.destination().unwrap(),
            Address::domain("example.com", 8080)
        );
    }
}
