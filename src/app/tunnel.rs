//! Tunnel glue
//!
//! Drains the inbound channel: sniff, select an outbound, dial, splice.
//! Each context runs on its own task from hand-off to splice completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, info};

use crate::common::{relay, ConnContext, Metadata, DEFAULT_IDLE_TIMEOUT};
use crate::sniff::SnifferDispatcher;

use super::group::{ProxyRegistry, ProxySnapshot};
use super::metrics::{
    format_bytes, OUTBOUND_BYTES_DOWNLOADED, OUTBOUND_BYTES_UPLOADED, TRAFFIC_BYTES_DOWNLOADED,
    TRAFFIC_BYTES_UPLOADED, TUNNEL_CONNECTIONS_ACTIVE, TUNNEL_CONNECTIONS_TOTAL,
    TUNNEL_DIAL_FAILED,
};

/// Outbound selection policy; rule engines plug in here
pub trait OutboundSelector: Send + Sync {
    fn select(&self, metadata: &Metadata) -> String;
}

/// Routes everything to one named outbound
pub struct StaticSelector {
    name: String,
}

impl StaticSelector {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl OutboundSelector for StaticSelector {
    fn select(&self, _metadata: &Metadata) -> String {
        self.name.clone()
    }
}

/// Wires inbound contexts to outbound streams
pub struct Tunnel {
    sniffer: SnifferDispatcher,
    registry: Arc<ProxyRegistry>,
    selector: Box<dyn OutboundSelector>,
    idle_timeout: Duration,
}

impl Tunnel {
    /// Build the tunnel and start draining. Returns the handle and the
    /// `tcp_in` sender inbound listeners feed.
    pub fn start(
        sniffer: SnifferDispatcher,
        registry: Arc<ProxyRegistry>,
        selector: Box<dyn OutboundSelector>,
    ) -> (Arc<Self>, UnboundedSender<ConnContext>) {
        let tunnel = Arc::new(Self {
            sniffer,
            registry,
            selector,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        });

        let (tcp_in, mut rx) = mpsc::unbounded_channel::<ConnContext>();
        let drain = tunnel.clone();
        tokio::spawn(async move {
            while let Some(context) = rx.recv().await {
                let tunnel = drain.clone();
                tokio::spawn(async move {
                    tunnel.handle_tcp_conn(context).await;
                });
            }
        });

        (tunnel, tcp_in)
    }

    /// Read-only snapshot of the registered proxies
    pub fn proxies(&self) -> Vec<ProxySnapshot> {
        self.registry.snapshot()
    }

    pub fn registry(&self) -> &Arc<ProxyRegistry> {
        &self.registry
    }

    async fn handle_tcp_conn(&self, mut context: ConnContext) {
        TUNNEL_CONNECTIONS_TOTAL.inc();
        TUNNEL_CONNECTIONS_ACTIVE.inc();
        let start = Instant::now();

        // The sniffer may rewrite the routing host before selection
        self.sniffer
            .tcp_sniff(&mut context.stream, &mut context.metadata)
            .await;

        if !context.metadata.valid() {
            debug!("[Tunnel] dropping invalid metadata: {}", context.metadata);
            TUNNEL_CONNECTIONS_ACTIVE.dec();
            return;
        }

        let tag = self.selector.select(&context.metadata);
        let adapter = match self.registry.adapter(&tag) {
            Some(adapter) => adapter,
            None => {
                debug!("[Tunnel] unknown outbound {}", tag);
                TUNNEL_CONNECTIONS_ACTIVE.dec();
                return;
            }
        };

        let remote = match adapter.dial(&context.metadata).await {
            Ok(stream) => stream,
            Err(e) => {
                // The client observes a reset
                TUNNEL_DIAL_FAILED.inc();
                TUNNEL_CONNECTIONS_ACTIVE.dec();
                debug!(
                    "[Tunnel] dial {} via [{}] failed: {}",
                    context.metadata.remote_address(),
                    adapter.name(),
                    e
                );
                return;
            }
        };

        info!(
            "[{}] {} --> {} via [{}]",
            context.metadata.in_name,
            context.metadata.source_detail(),
            context.metadata.remote_address(),
            adapter.name()
        );

        let metadata = context.metadata;
        let (up, down) = relay(Box::new(context.stream), remote, self.idle_timeout).await;

        TRAFFIC_BYTES_UPLOADED.inc_by(up);
        TRAFFIC_BYTES_DOWNLOADED.inc_by(down);
        OUTBOUND_BYTES_UPLOADED
            .with_label_values(&[adapter.name()])
            .inc_by(up);
        OUTBOUND_BYTES_DOWNLOADED
            .with_label_values(&[adapter.name()])
            .inc_by(down);
        TUNNEL_CONNECTIONS_ACTIVE.dec();

        info!(
            "[{}] closed {} --> {} (↑{} ↓{} {:?})",
            metadata.in_name,
            metadata.source_detail(),
            metadata.remote_address(),
            format_bytes(up),
            format_bytes(down),
            start.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, BufferedStream, ConnKind, Network};
    use crate::outbound::{OutboundAdapter, ProxyKind};
    use crate::sniff::SnifferDispatcher;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Test outbound that hands back one end of a duplex pipe
    struct PipeAdapter {
        peer: Mutex<Option<tokio::io::DuplexStream>>,
    }

    #[async_trait]
    impl OutboundAdapter for PipeAdapter {
        fn name(&self) -> &str {
            "pipe"
        }
        fn kind(&self) -> ProxyKind {
            ProxyKind::Direct
        }
        fn addr(&self) -> String {
            String::new()
        }
        fn supports_udp(&self) -> bool {
            false
        }
        async fn dial(&self, _metadata: &Metadata) -> crate::error::Result<crate::common::Stream> {
            let stream = self.peer.lock().unwrap().take().expect("single dial");
            Ok(Box::new(stream))
        }
    }

    #[tokio::test]
    async fn test_tunnel_splices_through_selected_outbound() {
        let (remote_near, mut remote_far) = tokio::io::duplex(1024);

        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(PipeAdapter {
            peer: Mutex::new(Some(remote_near)),
        }));

        let (_tunnel, tcp_in) = Tunnel::start(
            SnifferDispatcher::disabled(),
            registry,
            Box::new(StaticSelector::new("pipe")),
        );

        let (client_near, mut client_far) = tokio::io::duplex(1024);
        let metadata = Metadata::new(Network::Tcp, ConnKind::Socks5)
            .with_destination(&Address::domain("example.com", 80));
        let context = ConnContext::new(BufferedStream::new(Box::new(client_near)), metadata);
        tcp_in.send(context).unwrap();

        // Client bytes surface on the outbound side
        client_far.write_all(b"hello out").await.unwrap();
        let mut buf = [0u8; 9];
        remote_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello out");

        // And the reverse direction flows back
        remote_far.write_all(b"hello in").await.unwrap();
        let mut buf = [0u8; 8];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello in");
    }

    #[tokio::test]
    async fn test_tunnel_drops_invalid_metadata() {
        let registry = Arc::new(ProxyRegistry::new());
        let (_tunnel, tcp_in) = Tunnel::start(
            SnifferDispatcher::disabled(),
            registry,
            Box::new(StaticSelector::new("DIRECT")),
        );

        let (client_near, mut client_far) = tokio::io::duplex(64);
        let metadata = Metadata::new(Network::Tcp, ConnKind::Socks5);
        let context = ConnContext::new(BufferedStream::new(Box::new(client_near)), metadata);
        tcp_in.send(context).unwrap();

        // The context is dropped, so the client side sees EOF
        let mut buf = [0u8; 1];
        let n = client_far.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }
}
