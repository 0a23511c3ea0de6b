//! gRPC tunnel transport
//!
//! Frames a bidirectional byte stream as a single long-lived
//! `POST /<service>/Tun` request with `content-type: application/grpc`.
//! Each payload travels as one length-delimited protobuf message whose
//! single field is `bytes payload = 1`:
//!
//! ```text
//! 0x00 | be32(varint_len(L) + 1 + L) | 0x0A | varint(L) | payload
//! ```
//!
//! The response round-trip is issued lazily, exactly once, on first read;
//! writes may start immediately. A failed round-trip is cached and
//! returned for every subsequent operation.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use h2::client::{self, ResponseFuture};
use h2::{RecvStream, SendStream};
use http::Request;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use crate::common::{Result, Stream};
use crate::error::Error;
use crate::tls as fingerprint;
use crate::transport::tls::{self as tls_layer, TlsConfig};

const MAX_VARINT_LEN: usize = 10;

/// Headroom writers may reserve to prepend the frame header in place
pub const FRONT_HEADROOM: usize = 6 + MAX_VARINT_LEN;

/// gRPC tunnel options
#[derive(Debug, Clone, Default)]
pub struct GrpcConfig {
    /// Service segment of the request path; empty means "GunService"
    pub service_name: String,
    /// Authority the request is addressed to
    pub host: String,
    /// Optional browser fingerprint for the TLS layer
    pub client_fingerprint: String,
}

fn uvarint_len(mut x: u64) -> usize {
    let mut n = 1;
    while x >= 0x80 {
        x >>= 7;
        n += 1;
    }
    n
}

fn put_uvarint(buf: &mut BytesMut, mut x: u64) {
    while x >= 0x80 {
        buf.extend_from_slice(&[(x as u8) | 0x80]);
        x >>= 7;
    }
    buf.extend_from_slice(&[x as u8]);
}

/// Encode one payload into its full wire frame.
fn encode_frame(payload: &[u8]) -> BytesMut {
    let var_len = uvarint_len(payload.len() as u64);
    let mut buf = BytesMut::with_capacity(6 + var_len + payload.len());
    let grpc_payload_len = (var_len + 1 + payload.len()) as u32;
    buf.extend_from_slice(&[0x00]);
    buf.extend_from_slice(&grpc_payload_len.to_be_bytes());
    buf.extend_from_slice(&[0x0A]);
    put_uvarint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf
}

// ============================================================================
// Framing codec
// ============================================================================

/// Writer half of the framing: every `write` emits one frame.
pub struct GrpcFrameWriter<W> {
    inner: W,
    pending: BytesMut,
    pending_payload: usize,
}

impl<W> GrpcFrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            pending_payload: 0,
        }
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for GrpcFrameWriter<W> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.as_mut().get_mut();

        // A frame survives across polls; never re-encode a partial one
        if this.pending.is_empty() {
            this.pending = encode_frame(buf);
            this.pending_payload = buf.len();
        }

        while !this.pending.is_empty() {
            match Pin::new(&mut this.inner).poll_write(cx, &this.pending) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        "frame write stalled",
                    )))
                }
                Poll::Ready(Ok(n)) => {
                    this.pending.advance(n);
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }

        Poll::Ready(Ok(this.pending_payload))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Reader half of the framing.
///
/// Carries the remainder of a partially-consumed payload in `remain` so a
/// small destination buffer walks a large frame across several reads.
pub struct GrpcFrameReader<R> {
    inner: R,
    buf: BytesMut,
    remain: usize,
    eof: bool,
}

impl<R> GrpcFrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            remain: 0,
            eof: false,
        }
    }

    /// Parse one frame header from the front of `buf`.
    ///
    /// Returns the payload length and header size when complete, `None`
    /// when more bytes are needed.
    fn try_parse_header(&self) -> std::io::Result<Option<(usize, usize)>> {
        // 5-byte gRPC prefix + 1-byte protobuf tag are discarded unchecked
        if self.buf.len() < 6 {
            return Ok(None);
        }
        let mut value: u64 = 0;
        let mut shift = 0;
        for (i, &byte) in self.buf[6..].iter().enumerate() {
            if i >= MAX_VARINT_LEN {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    Error::InvalidLength.to_string(),
                ));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                if i + 1 == MAX_VARINT_LEN && byte > 1 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        Error::InvalidLength.to_string(),
                    ));
                }
                return Ok(Some((value as usize, 6 + i + 1)));
            }
            shift += 7;
        }
        Ok(None)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for GrpcFrameReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.as_mut().get_mut();

        loop {
            // Serve an outstanding payload first
            if this.remain > 0 && !this.buf.is_empty() {
                let n = this.remain.min(this.buf.len()).min(out.remaining());
                out.put_slice(&this.buf[..n]);
                this.buf.advance(n);
                this.remain -= n;
                return Poll::Ready(Ok(()));
            }

            // Between payloads: try to parse the next header
            if this.remain == 0 && !this.eof {
                match this.try_parse_header()? {
                    Some((payload_len, header_len)) if this.buf.len() >= header_len => {
                        this.buf.advance(header_len);
                        this.remain = payload_len;
                        // Zero-length payloads are skipped silently
                        continue;
                    }
                    _ => {}
                }
            }

            if this.eof {
                return if this.buf.is_empty() && this.remain == 0 {
                    Poll::Ready(Ok(()))
                } else {
                    Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "truncated frame",
                    )))
                };
            }

            // Need more bytes from the carrier
            let mut chunk = [0u8; 8 * 1024];
            let mut read_buf = ReadBuf::new(&mut chunk);
            match Pin::new(&mut this.inner).poll_read(cx, &mut read_buf) {
                Poll::Ready(Ok(())) => {
                    let filled = read_buf.filled();
                    if filled.is_empty() {
                        this.eof = true;
                    } else {
                        this.buf.extend_from_slice(filled);
                    }
                }
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ============================================================================
// h2 stream adapters
// ============================================================================

/// AsyncWrite over an h2 send stream
struct H2WriteHalf {
    send: SendStream<Bytes>,
}

impl AsyncWrite for H2WriteHalf {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.send.reserve_capacity(buf.len());
        match self.send.poll_capacity(cx) {
            Poll::Ready(Some(Ok(capacity))) => {
                let to_write = capacity.min(buf.len());
                if to_write == 0 {
                    return Poll::Pending;
                }
                let data = Bytes::copy_from_slice(&buf[..to_write]);
                match self.send.send_data(data, false) {
                    Ok(()) => Poll::Ready(Ok(to_write)),
                    Err(e) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
                }
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            Poll::Ready(None) => Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "h2 stream closed",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let _ = self.send.send_data(Bytes::new(), true);
        Poll::Ready(Ok(()))
    }
}

/// AsyncRead over an h2 receive stream
struct H2ReadHalf {
    recv: RecvStream,
    leftover: Bytes,
}

impl AsyncRead for H2ReadHalf {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.leftover.is_empty() {
            let n = self.leftover.len().min(buf.remaining());
            buf.put_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Poll::Ready(Ok(()));
        }

        match self.recv.poll_data(cx) {
            Poll::Ready(Some(Ok(data))) => {
                let _ = self.recv.flow_control().release_capacity(data.len());
                let n = data.len().min(buf.remaining());
                buf.put_slice(&data[..n]);
                if n < data.len() {
                    self.leftover = data.slice(n..);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

// ============================================================================
// Tunnel stream
// ============================================================================

enum ReaderState {
    /// Round-trip not yet completed
    Pending(ResponseFuture),
    Ready(GrpcFrameReader<H2ReadHalf>),
    Failed,
}

/// The tunneled byte stream handed to proxy protocols
pub struct GrpcStream {
    writer: GrpcFrameWriter<H2WriteHalf>,
    reader: ReaderState,
    closed: Arc<AtomicBool>,
    init_err: Arc<Mutex<Option<String>>>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl GrpcStream {
    fn new(send: SendStream<Bytes>, response: ResponseFuture) -> Self {
        Self {
            writer: GrpcFrameWriter::new(H2WriteHalf { send }),
            reader: ReaderState::Pending(response),
            closed: Arc::new(AtomicBool::new(false)),
            init_err: Arc::new(Mutex::new(None)),
            deadline: None,
        }
    }

    /// Mark the stream closed; all subsequent operations fail with a
    /// stable error.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// (Re)arm the shared read/write deadline. Expiry closes the stream.
    pub fn set_deadline(&mut self, at: tokio::time::Instant) {
        match &mut self.deadline {
            Some(sleep) => sleep.as_mut().reset(at),
            None => self.deadline = Some(Box::pin(tokio::time::sleep_until(at))),
        }
    }

    fn closed_error(&self) -> std::io::Error {
        if let Some(cause) = self.init_err.lock().clone() {
            return std::io::Error::new(std::io::ErrorKind::BrokenPipe, cause);
        }
        std::io::Error::new(std::io::ErrorKind::BrokenPipe, Error::Closed.to_string())
    }

    /// Poll the deadline; expiry closes the stream.
    fn check_deadline(&mut self, cx: &mut Context<'_>) -> bool {
        if let Some(sleep) = &mut self.deadline {
            if sleep.as_mut().poll(cx).is_ready() {
                self.close();
                return true;
            }
        }
        false
    }
}

impl AsyncRead for GrpcStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.as_mut().get_mut();

        if this.check_deadline(cx) || this.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.closed_error()));
        }

        loop {
            match &mut this.reader {
                ReaderState::Pending(response) => match Pin::new(response).poll(cx) {
                    Poll::Ready(Ok(response)) => {
                        if this.closed.load(Ordering::SeqCst) {
                            // Closed while the round-trip was in flight:
                            // drop the body unread
                            drop(response);
                            return Poll::Ready(Err(this.closed_error()));
                        }
                        let recv = response.into_body();
                        this.reader = ReaderState::Ready(GrpcFrameReader::new(H2ReadHalf {
                            recv,
                            leftover: Bytes::new(),
                        }));
                    }
                    Poll::Ready(Err(e)) => {
                        *this.init_err.lock() = Some(e.to_string());
                        this.reader = ReaderState::Failed;
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            e.to_string(),
                        )));
                    }
                    Poll::Pending => return Poll::Pending,
                },
                ReaderState::Ready(reader) => return Pin::new(reader).poll_read(cx, buf),
                ReaderState::Failed => return Poll::Ready(Err(this.closed_error())),
            }
        }
    }
}

impl AsyncWrite for GrpcStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.as_mut().get_mut();

        if this.check_deadline(cx) || this.closed.load(Ordering::SeqCst) {
            return Poll::Ready(Err(this.closed_error()));
        }

        match Pin::new(&mut this.writer).poll_write(cx, buf) {
            // A write error after the pipe closed is replaced with the
            // cached initialization error when one exists
            Poll::Ready(Err(e)) => {
                if let Some(cause) = this.init_err.lock().clone() {
                    return Poll::Ready(Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        cause,
                    )));
                }
                Poll::Ready(Err(e))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.writer).poll_shutdown(cx)
    }
}

// ============================================================================
// Connection construction
// ============================================================================

/// Open a gRPC tunnel over an established raw connection.
///
/// TLS is layered first (fingerprinted when requested), the negotiated
/// ALPN must be `h2`, and the long-poll request is sent without following
/// redirects.
pub async fn stream_grpc_conn(
    conn: Stream,
    tls_config: &TlsConfig,
    config: &GrpcConfig,
) -> Result<Stream> {
    let mut tls_config = tls_config.clone();
    tls_config.alpn = vec!["h2".to_string()];

    let (tls_stream, alpn) = match fingerprint::get_fingerprint(&config.client_fingerprint) {
        Some(profile) if !config.client_fingerprint.is_empty() => {
            fingerprint::uclient(conn, &tls_config, profile)
                .handshake()
                .await?
        }
        _ => tls_layer::wrap_client(conn, &tls_config).await?,
    };

    match alpn.as_deref() {
        Some(b"h2") => {}
        other => {
            let got = other
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default();
            return Err(Error::BadAlpn(got));
        }
    }

    let (send_request, connection) = client::Builder::new()
        .handshake::<_, Bytes>(tls_stream)
        .await
        .map_err(|e| Error::Handshake(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("h2 connection terminated: {}", e);
        }
    });

    let service_name = if config.service_name.is_empty() {
        "GunService"
    } else {
        config.service_name.as_str()
    };

    let uri = format!("https://{}/{}/Tun", config.host, service_name);
    let request = Request::builder()
        .method("POST")
        .uri(&uri)
        .header("content-type", "application/grpc")
        .header("user-agent", "grpc-go/1.36.0")
        .header("te", "trailers")
        .body(())
        .map_err(|e| Error::Handshake(e.to_string()))?;

    let mut send_request = send_request
        .ready()
        .await
        .map_err(|e| Error::Handshake(e.to_string()))?;
    let (response, send_stream) = send_request
        .send_request(request, false)
        .map_err(|e| Error::Handshake(e.to_string()))?;

    Ok(Box::new(GrpcStream::new(send_stream, response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_frame_layout() {
        let frame = encode_frame(b"hi");
        // 0x00, be32(varint(2)=1 byte + tag + 2 = 4), 0x0A, varint, payload
        assert_eq!(&frame[..], &[0x00, 0, 0, 0, 4, 0x0A, 0x02, b'h', b'i']);
    }

    #[test]
    fn test_varint_len() {
        assert_eq!(uvarint_len(0), 1);
        assert_eq!(uvarint_len(127), 1);
        assert_eq!(uvarint_len(128), 2);
        assert_eq!(uvarint_len(65535), 3);
    }

    #[tokio::test]
    async fn test_framing_roundtrip_small_read_buffer() {
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (far_read, _far_write) = tokio::io::split(far);
        let (_near_read, near_write) = tokio::io::split(near);

        let mut writer = GrpcFrameWriter::new(near_write);
        let mut reader = GrpcFrameReader::new(far_read);

        for len in [0usize, 1, 127, 128, 65535, 70000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let written = writer.write(&payload).await.unwrap();
            assert_eq!(written, len);
            writer.flush().await.unwrap();

            // A terminator frame lets the zero-length case produce bytes
            writer.write(b"#").await.unwrap();
            writer.flush().await.unwrap();

            let mut collected = Vec::new();
            let mut small = [0u8; 4];
            while collected.len() < len + 1 {
                let n = reader.read(&mut small).await.unwrap();
                assert!(n > 0, "unexpected EOF");
                collected.extend_from_slice(&small[..n]);
            }
            assert_eq!(&collected[..len], &payload[..]);
            assert_eq!(collected[len], b'#');
            assert_eq!(collected.len(), len + 1);
        }
    }

    #[tokio::test]
    async fn test_reader_rejects_malformed_varint() {
        let (near, far) = tokio::io::duplex(1024);
        let (far_read, _fw) = tokio::io::split(far);
        let (_nr, mut near_write) = tokio::io::split(near);

        // 6 header bytes then an endless varint
        let mut bad = vec![0u8; 6];
        bad.extend_from_slice(&[0xFF; 11]);
        near_write.write_all(&bad).await.unwrap();

        let mut reader = GrpcFrameReader::new(far_read);
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_headroom_constant() {
        assert_eq!(FRONT_HEADROOM, 16);
    }
}
