//! Proxy registry and groups
//!
//! The registry holds every assembled adapter by name; groups bundle
//! members for delay probing through their own dial path.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::common::{ConnKind, Metadata, Network};
use crate::error::{Error, Result};
use crate::outbound::OutboundAdapter;
use crate::transport::{tls, TlsConfig};

/// Read-only view of a registered proxy
#[derive(Debug, Clone, Serialize)]
pub struct ProxySnapshot {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub addr: String,
    pub udp: bool,
}

/// A named set of member proxies
pub struct ProxyGroup {
    name: String,
    members: Vec<Arc<dyn OutboundAdapter>>,
}

impl ProxyGroup {
    pub fn new(name: impl Into<String>, members: Vec<Arc<dyn OutboundAdapter>>) -> Self {
        Self {
            name: name.into(),
            members,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn members(&self) -> &[Arc<dyn OutboundAdapter>] {
        &self.members
    }

    /// Probe every member against `url` under one shared deadline.
    ///
    /// Returns per-member delays in milliseconds; members that fail inside
    /// the deadline are omitted. Exceeding the deadline is a `Timeout`.
    pub async fn url_test(
        &self,
        url: &str,
        deadline: Duration,
    ) -> Result<HashMap<String, u64>> {
        let probes = self.members.iter().map(|member| {
            let member = member.clone();
            let url = url.to_string();
            async move {
                match probe_delay(member.as_ref(), &url).await {
                    Ok(delay) => Some((member.name().to_string(), delay)),
                    Err(e) => {
                        debug!("[Group] {} probe failed: {}", member.name(), e);
                        None
                    }
                }
            }
        });

        let joined = futures_util::future::join_all(probes);
        match tokio::time::timeout(deadline, joined).await {
            Ok(results) => Ok(results.into_iter().flatten().collect()),
            Err(_) => Err(Error::Timeout),
        }
    }
}

/// Issue one HTTP GET for `url` through the adapter and time it.
async fn probe_delay(adapter: &dyn OutboundAdapter, url: &str) -> Result<u64> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::Config(format!("bad probe url: {e}")))?;
    let https = parsed.scheme() == "https";
    let host = parsed
        .host_str()
        .ok_or_else(|| Error::Config("probe url has no host".into()))?
        .to_string();
    let port = parsed.port().unwrap_or(if https { 443 } else { 80 });
    let path = if parsed.path().is_empty() {
        "/"
    } else {
        parsed.path()
    };

    let metadata = Metadata::new(Network::Tcp, ConnKind::Inner)
        .with_destination(&crate::common::Address::domain(host.clone(), port));

    let start = Instant::now();
    let mut stream = adapter.dial(&metadata).await?;

    if https {
        let config = TlsConfig {
            server_name: host.clone(),
            skip_cert_verify: false,
            alpn: vec![],
        };
        let (wrapped, _alpn) = tls::wrap_client(stream, &config).await?;
        stream = wrapped;
    }

    let request = format!(
        "GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut buf = [0u8; 128];
    let n = stream.read(&mut buf).await?;
    if n == 0 || !buf.starts_with(b"HTTP/") {
        return Err(Error::Protocol("probe got no HTTP response".into()));
    }

    Ok(start.elapsed().as_millis() as u64)
}

/// Name-keyed store of adapters and groups
#[derive(Default)]
pub struct ProxyRegistry {
    proxies: RwLock<Vec<Arc<dyn OutboundAdapter>>>,
    groups: RwLock<HashMap<String, Arc<ProxyGroup>>>,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, adapter: Arc<dyn OutboundAdapter>) {
        self.proxies.write().push(adapter);
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn OutboundAdapter>> {
        self.proxies
            .read()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    pub fn insert_group(&self, group: ProxyGroup) {
        self.groups
            .write()
            .insert(group.name().to_string(), Arc::new(group));
    }

    pub fn group(&self, name: &str) -> Option<Arc<ProxyGroup>> {
        self.groups.read().get(name).cloned()
    }

    /// Read-only snapshot of every registered proxy
    pub fn snapshot(&self) -> Vec<ProxySnapshot> {
        self.proxies
            .read()
            .iter()
            .map(|p| ProxySnapshot {
                name: p.name().to_string(),
                kind: p.kind().to_string(),
                addr: p.addr(),
                udp: p.supports_udp(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::DirectAdapter;

    #[test]
    fn test_registry_snapshot() {
        let registry = ProxyRegistry::new();
        registry.insert(Arc::new(DirectAdapter::default()));

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].name, "DIRECT");
        assert_eq!(snapshot[0].kind, "Direct");
        assert!(registry.adapter("DIRECT").is_some());
        assert!(registry.adapter("missing").is_none());
    }

    /// Outbound whose dial never completes
    struct HangAdapter;

    #[async_trait::async_trait]
    impl OutboundAdapter for HangAdapter {
        fn name(&self) -> &str {
            "hang"
        }
        fn kind(&self) -> crate::outbound::ProxyKind {
            crate::outbound::ProxyKind::Direct
        }
        fn addr(&self) -> String {
            String::new()
        }
        fn supports_udp(&self) -> bool {
            false
        }
        async fn dial(&self, _metadata: &Metadata) -> Result<crate::common::Stream> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(Error::Timeout)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_url_test_deadline() {
        // A member that never answers must surface as Timeout once the
        // shared deadline passes
        let group = ProxyGroup::new("auto", vec![Arc::new(HangAdapter) as Arc<dyn OutboundAdapter>]);
        let result = group
            .url_test("http://probe.example/gen", Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
