//! Stream abstraction
//!
//! Unified stream type for all layers to operate on, plus the buffered
//! peekable wrapper the inbound demultiplexer and the sniffer rely on.
//! Peeked bytes always survive byte-exact into subsequent reads.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::error::{Error, Result};

/// The core stream type used throughout the application.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// A byte stream with bounded lookahead.
///
/// `peek(n)` blocks until at least `n` bytes are buffered and returns a
/// non-consuming view; reads drain the buffer before touching the inner
/// stream, so the byte sequence observed downstream is unchanged.
pub struct BufferedStream {
    inner: Stream,
    buf: BytesMut,
}

impl BufferedStream {
    pub fn new(inner: Stream) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(4 * 1024),
        }
    }

    /// Number of currently buffered bytes
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Return a view of at least `n` buffered bytes without consuming them.
    ///
    /// Blocks until `n` bytes are available; EOF before that is `Closed`.
    pub async fn peek(&mut self, n: usize) -> Result<&[u8]> {
        while self.buf.len() < n {
            let read = self.inner.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(Error::Closed);
            }
        }
        Ok(&self.buf[..])
    }

    /// `peek` under a read deadline. Expiry maps to `Timeout`, which callers
    /// treat as a network-level failure.
    pub async fn peek_timeout(&mut self, n: usize, deadline: Duration) -> Result<&[u8]> {
        match tokio::time::timeout(deadline, async {
            while self.buf.len() < n {
                let read = self.inner.read_buf(&mut self.buf).await?;
                if read == 0 {
                    return Err(Error::Closed);
                }
            }
            Ok(())
        })
        .await
        {
            Ok(Ok(())) => Ok(&self.buf[..]),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout),
        }
    }
}

impl AsyncRead for BufferedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        // Drain peeked bytes first
        if !self.buf.is_empty() {
            let to_copy = self.buf.len().min(buf.remaining());
            buf.put_slice(&self.buf[..to_copy]);
            self.buf.advance(to_copy);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for BufferedStream {
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
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_peek_preserves_bytes() {
        let (client, mut server) = tokio::io::duplex(64);
        server.write_all(b"hello world").await.unwrap();

        let mut buffered = BufferedStream::new(Box::new(client));
        let head = buffered.peek(1).await.unwrap();
        assert_eq!(head[0], b'h');

        let more = buffered.peek(5).await.unwrap();
        assert_eq!(&more[..5], b"hello");
        assert!(buffered.buffered() >= 5);

        // Reads must see the exact original sequence
        let mut out = vec![0u8; 11];
        buffered.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello world");
    }

    #[tokio::test]
    async fn test_peek_timeout_expires() {
        let (client, _server) = tokio::io::duplex(64);
        let mut buffered = BufferedStream::new(Box::new(client));
        let err = buffered
            .peek_timeout(1, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));
    }

    #[tokio::test]
    async fn test_peek_eof_is_closed() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let mut buffered = BufferedStream::new(Box::new(client));
        assert!(matches!(buffered.peek(1).await.unwrap_err(), Error::Closed));
    }
}
