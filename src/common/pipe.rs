//! Bidirectional relay with lifecycle management
//!
//! Two unidirectional copies run concurrently; the side that observes
//! EOF (or an error) half-closes the peer's write side. An idle watchdog
//! closes both streams when neither direction has made progress within
//! the idle timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::stream::Stream;

/// Default buffer size for relay operations (32KB)
const RELAY_BUFFER_SIZE: usize = 32 * 1024;

/// Default idle timeout (5 minutes)
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Shared progress state between the two copy directions and the watchdog
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
    up: AtomicU64,
    down: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
            up: AtomicU64::new(0),
            down: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.store(elapsed, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let elapsed = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }
}

/// Relay data bidirectionally between two streams.
///
/// Returns (uploaded, downloaded) byte totals. Both streams are closed on
/// return: either both directions terminated, or the idle timeout fired.
pub async fn relay(inbound: Stream, outbound: Stream, idle_timeout: Duration) -> (u64, u64) {
    let (mut in_read, mut in_write) = tokio::io::split(inbound);
    let (mut out_read, mut out_write) = tokio::io::split(outbound);

    let activity = Arc::new(Activity::new());

    let up_activity = activity.clone();
    let upload = async move {
        copy_direction(&mut in_read, &mut out_write, &up_activity.up, &up_activity).await;
    };

    let down_activity = activity.clone();
    let download = async move {
        copy_direction(&mut out_read, &mut in_write, &down_activity.down, &down_activity).await;
    };

    let both = async {
        tokio::join!(upload, download);
    };

    let watchdog = async {
        loop {
            let idle = activity.idle_for();
            if idle >= idle_timeout {
                break;
            }
            tokio::time::sleep(idle_timeout - idle).await;
        }
    };

    tokio::select! {
        _ = both => {}
        _ = watchdog => {}
    }

    (
        activity.up.load(Ordering::Relaxed),
        activity.down.load(Ordering::Relaxed),
    )
}

/// Copy one direction until EOF or error, then half-close the writer
async fn copy_direction<R, W>(reader: &mut R, writer: &mut W, total: &AtomicU64, activity: &Activity)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(RELAY_BUFFER_SIZE);
    buf.resize(RELAY_BUFFER_SIZE, 0);

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }

        total.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }

    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_relay_copies_both_directions() {
        let (client_in, mut peer_in) = tokio::io::duplex(1024);
        let (client_out, mut peer_out) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(
            Box::new(client_in) as Stream,
            Box::new(client_out) as Stream,
            DEFAULT_IDLE_TIMEOUT,
        ));

        peer_in.write_all(b"request bytes").await.unwrap();
        peer_in.shutdown().await.unwrap();

        let mut forwarded = vec![0u8; 13];
        peer_out.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded, b"request bytes");

        peer_out.write_all(b"reply").await.unwrap();
        peer_out.shutdown().await.unwrap();

        let mut reply = Vec::new();
        peer_in.read_to_end(&mut reply).await.unwrap();
        assert_eq!(&reply, b"reply");

        let (up, down) = handle.await.unwrap();
        assert_eq!(up, 13);
        assert_eq!(down, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_relay_idle_timeout_closes() {
        let (client_in, peer_in) = tokio::io::duplex(1024);
        let (client_out, peer_out) = tokio::io::duplex(1024);

        let handle = tokio::spawn(relay(
            Box::new(client_in) as Stream,
            Box::new(client_out) as Stream,
            Duration::from_secs(1),
        ));

        // No traffic in either direction: the watchdog fires
        let (up, down) = handle.await.unwrap();
        assert_eq!((up, down), (0, 0));

        drop(peer_in);
        drop(peer_out);
    }
}
