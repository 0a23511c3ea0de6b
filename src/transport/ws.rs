//! WebSocket client layer

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::{Sink, Stream as FuturesStream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    client_async_with_config,
    tungstenite::{
        handshake::client::Request,
        protocol::{Message, WebSocketConfig as TungsteniteConfig},
    },
    WebSocketStream,
};
use tracing::trace;

use crate::common::{Result, Stream};
use crate::error::Error;

/// WebSocket transport options (the `ws-opts` record)
#[derive(Debug, Clone, Default)]
pub struct WsConfig {
    pub path: String,
    /// Host header; falls back to the dialed host
    pub host: Option<String>,
    pub headers: Vec<(String, String)>,
    pub max_early_data: usize,
    pub early_data_header_name: String,
}

/// Wrap a stream in a client WebSocket session.
pub async fn wrap_client(stream: Stream, config: &WsConfig) -> Result<Stream> {
    let host = config.host.clone().unwrap_or_else(|| "localhost".to_string());
    let path = if config.path.is_empty() {
        "/"
    } else {
        config.path.as_str()
    };
    let uri = format!("ws://{}{}", host, path);

    let mut request = Request::builder()
        .uri(&uri)
        .header("Host", &host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header(
            "Sec-WebSocket-Key",
            tokio_tungstenite::tungstenite::handshake::client::generate_key(),
        );

    for (key, value) in &config.headers {
        // Host is already set from config.host
        if key.eq_ignore_ascii_case("host") {
            continue;
        }
        request = request.header(key.as_str(), value.as_str());
    }

    let request = request
        .body(())
        .map_err(|e| Error::Handshake(format!("bad WebSocket request: {}", e)))?;

    let ws_config = TungsteniteConfig {
        max_message_size: Some(64 << 20),
        max_frame_size: Some(16 << 20),
        ..Default::default()
    };

    let (ws_stream, _response) = client_async_with_config(request, stream, Some(ws_config))
        .await
        .map_err(|e| Error::Handshake(format!("WebSocket handshake failed: {}", e)))?;

    Ok(Box::new(WsStreamWrapper::new(ws_stream)))
}

/// Adapter exposing a WebSocket message stream as a byte stream
struct WsStreamWrapper<S> {
    inner: WebSocketStream<S>,
    read_buf: Vec<u8>,
    read_pos: usize,
    closed: bool,
}

impl<S> WsStreamWrapper<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Vec::new(),
            read_pos: 0,
            closed: false,
        }
    }
}

impl<S> AsyncRead for WsStreamWrapper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Return buffered data first
        if self.read_pos < self.read_buf.len() {
            let remaining = &self.read_buf[self.read_pos..];
            let to_copy = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..to_copy]);
            self.read_pos += to_copy;

            if self.read_pos >= self.read_buf.len() {
                self.read_buf.clear();
                self.read_pos = 0;
            }

            return Poll::Ready(Ok(()));
        }

        if self.closed {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(msg))) => {
                let data = match msg {
                    Message::Binary(data) => data,
                    Message::Text(text) => text.into_bytes(),
                    Message::Ping(_) | Message::Pong(_) => {
                        trace!("WebSocket control frame");
                        cx.waker().wake_by_ref();
                        return Poll::Pending;
                    }
                    Message::Close(_) => {
                        self.closed = true;
                        return Poll::Ready(Ok(()));
                    }
                    Message::Frame(_) => {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "unexpected raw frame",
                        )));
                    }
                };

                let to_copy = data.len().min(buf.remaining());
                buf.put_slice(&data[..to_copy]);

                if to_copy < data.len() {
                    self.read_buf = data;
                    self.read_pos = to_copy;
                }

                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::other(e.to_string())))
            }
            Poll::Ready(None) => {
                self.closed = true;
                Poll::Ready(Ok(()))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S> AsyncWrite for WsStreamWrapper<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "WebSocket connection closed",
            )));
        }

        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Ready(Ok(())) => {}
            Poll::Ready(Err(e)) => {
                self.closed = true;
                return Poll::Ready(Err(std::io::Error::other(e.to_string())));
            }
            Poll::Pending => return Poll::Pending,
        }

        let msg = Message::Binary(buf.to_vec());
        match Pin::new(&mut self.inner).start_send(msg) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(e) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::other(e.to_string())))
            }
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => {
                self.closed = true;
                Poll::Ready(Err(std::io::Error::other(e.to_string())))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        // WebSocket has no half-close; flush and let drop close the stream
        if self.closed {
            return Poll::Ready(Ok(()));
        }
        match Pin::new(&mut self.inner).poll_flush(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) => Poll::Ready(Err(std::io::Error::other(e.to_string()))),
            Poll::Pending => Poll::Pending,
        }
    }
}
