//! Traffic sniffing
//!
//! Opportunistic identification of the true destination hostname from the
//! first buffered bytes of a stream. The dispatcher runs registered
//! sniffers against eligible connections and rewrites the metadata host;
//! destinations that repeatedly fail to sniff are skipped via an LRU
//! failure list.

mod http;
mod matcher;
mod tls;

pub use http::HttpSniffer;
pub use matcher::DomainMatcher;
pub use tls::TlsSniffer;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::common::{BufferedStream, DnsMode, Metadata};
use crate::error::{Error, Result};

/// Failure count ceiling; a destination at or above 6 is skipped
const SKIP_AFTER_FAILURES: u8 = 5;
/// Skip-list entry lifetime
const SKIP_TTL: Duration = Duration::from_secs(600);
/// Skip-list capacity
const SKIP_CAPACITY: usize = 128;
/// Deadline for the client's first bytes
const PEEK_DEADLINE: Duration = Duration::from_secs(1);

/// Networks a sniffer can serve
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnifferNetwork {
    Tcp,
    Udp,
    All,
}

/// A protocol-specific destination heuristic
pub trait Sniffer: Send + Sync {
    fn protocol(&self) -> &'static str;
    fn support_network(&self) -> SnifferNetwork;
    fn support_port(&self, port: u16) -> bool;
    fn sniff_tcp(&self, buf: &[u8]) -> Result<String>;
}

/// Inclusive port ranges
#[derive(Debug, Clone, Default)]
pub struct PortRanges(Vec<(u16, u16)>);

impl PortRanges {
    pub fn new(ranges: &[(u16, u16)]) -> Self {
        Self(ranges.to_vec())
    }

    pub fn contains(&self, port: u16) -> bool {
        self.0.iter().any(|&(lo, hi)| port >= lo && port <= hi)
    }

    /// Parse "443" / "8000-9000" entries
    pub fn parse(specs: &[String]) -> Result<Self> {
        let mut ranges = Vec::with_capacity(specs.len());
        for spec in specs {
            let (lo, hi) = match spec.split_once('-') {
                Some((a, b)) => (a.trim(), b.trim()),
                None => (spec.trim(), spec.trim()),
            };
            let lo: u16 = lo
                .parse()
                .map_err(|_| Error::Config(format!("invalid port range: {spec}")))?;
            let hi: u16 = hi
                .parse()
                .map_err(|_| Error::Config(format!("invalid port range: {spec}")))?;
            ranges.push((lo, hi));
        }
        Ok(Self(ranges))
    }
}

/// Per-sniffer settings from configuration
#[derive(Debug, Clone, Default)]
pub struct SnifferConfig {
    /// Whether a sniffed hostname replaces the routing host
    pub override_dest: bool,
    /// Port whitelist; empty means the sniffer's default set
    pub ports: Option<PortRanges>,
}

struct SkipEntry {
    count: u8,
    at: Instant,
}

/// Runs registered sniffers over eligible connections
pub struct SnifferDispatcher {
    enable: bool,
    sniffers: Vec<(Box<dyn Sniffer>, SnifferConfig)>,
    force_domain: DomainMatcher,
    skip_sni: DomainMatcher,
    skip_list: RwLock<LruCache<String, SkipEntry>>,
    force_dns_mapping: bool,
    parse_pure_ip: bool,
}

impl SnifferDispatcher {
    /// A dispatcher that sniffs nothing
    pub fn disabled() -> Self {
        Self {
            enable: false,
            sniffers: Vec::new(),
            force_domain: DomainMatcher::default(),
            skip_sni: DomainMatcher::default(),
            skip_list: RwLock::new(LruCache::new(NonZeroUsize::new(SKIP_CAPACITY).unwrap())),
            force_dns_mapping: false,
            parse_pure_ip: false,
        }
    }

    pub fn new(
        sniffer_config: &HashMap<String, SnifferConfig>,
        force_domain: DomainMatcher,
        skip_sni: DomainMatcher,
        force_dns_mapping: bool,
        parse_pure_ip: bool,
    ) -> Result<Self> {
        let mut sniffers: Vec<(Box<dyn Sniffer>, SnifferConfig)> = Vec::new();
        for (name, config) in sniffer_config {
            let sniffer: Box<dyn Sniffer> = match name.to_lowercase().as_str() {
                "tls" => match &config.ports {
                    Some(ports) => Box::new(TlsSniffer::new(ports.clone())),
                    None => Box::new(TlsSniffer::default()),
                },
                "http" => match &config.ports {
                    Some(ports) => Box::new(HttpSniffer::new(ports.clone())),
                    None => Box::new(HttpSniffer::default()),
                },
                other => return Err(Error::UnsupportedSniffer(other.to_string())),
            };
            sniffers.push((sniffer, config.clone()));
        }

        Ok(Self {
            enable: true,
            sniffers,
            force_domain,
            skip_sni,
            skip_list: RwLock::new(LruCache::new(NonZeroUsize::new(SKIP_CAPACITY).unwrap())),
            force_dns_mapping,
            parse_pure_ip,
        })
    }

    pub fn enabled(&self) -> bool {
        self.enable
    }

    /// Sniff an accepted TCP connection and rewrite its metadata host.
    ///
    /// Failures are recoverable: the connection continues with the original
    /// metadata. A network-level failure waiting for the first bytes closes
    /// the connection.
    pub async fn tcp_sniff(&self, stream: &mut BufferedStream, metadata: &mut Metadata) {
        if !self.enable {
            return;
        }

        let eligible = (metadata.host.is_empty() && self.parse_pure_ip)
            || self.force_domain.search(&metadata.host)
            || (metadata.dns_mode() == DnsMode::Mapping && self.force_dns_mapping);
        if !eligible {
            return;
        }

        // First supporting sniffer decides the whitelist and override flag
        let mut in_whitelist = false;
        let mut override_dest = false;
        for (sniffer, config) in &self.sniffers {
            if matches!(
                sniffer.support_network(),
                SnifferNetwork::Tcp | SnifferNetwork::All
            ) && sniffer.support_port(metadata.dst_port)
            {
                in_whitelist = true;
                override_dest = config.override_dest;
                break;
            }
        }
        if !in_whitelist {
            return;
        }

        let dst = metadata.dst_key();
        {
            let skip_list = self.skip_list.read();
            if let Some(entry) = skip_list.peek(&dst) {
                if entry.at.elapsed() < SKIP_TTL && entry.count > SKIP_AFTER_FAILURES {
                    debug!("[Sniffer] skip sniffing {} due to multiple failures", dst);
                    return;
                }
            }
        }

        match self.sniff_domain(stream).await {
            Ok(host) => {
                if self.skip_sni.search(&host) {
                    debug!("[Sniffer] skip sni {}", host);
                    return;
                }

                self.skip_list.write().pop(&dst);

                debug!(
                    "[Sniffer] sniff TCP [{}] --> [{}] success, replace domain [{}] --> [{}]",
                    metadata.source_detail(),
                    metadata.remote_address(),
                    metadata.host,
                    host
                );
                metadata.set_sniff_host(&host);
                if override_dest {
                    metadata.host = host;
                }
                metadata.set_dns_mode(DnsMode::Normal);
            }
            Err(Error::Timeout) => {
                // The client never sent data; count it and drop the connection
                self.cache_sniff_failed(&dst);
                debug!(
                    "[Sniffer] {} may not have sent any data, consider adding skip",
                    dst
                );
                let _ = stream.shutdown().await;
            }
            Err(_) => {
                self.cache_sniff_failed(&dst);
                debug!(
                    "[Sniffer] all sniffers failed for [{}] to [{}]",
                    metadata.source_detail(),
                    metadata.remote_address()
                );
            }
        }
    }

    async fn sniff_domain(&self, stream: &mut BufferedStream) -> Result<String> {
        // Make sure the client has sent something before inspecting
        stream.peek_timeout(1, PEEK_DEADLINE).await?;

        let buffered = stream.buffered();
        let bytes = stream.peek(buffered).await?.to_vec();

        for (sniffer, _) in &self.sniffers {
            if !matches!(
                sniffer.support_network(),
                SnifferNetwork::Tcp | SnifferNetwork::All
            ) {
                continue;
            }
            match sniffer.sniff_tcp(&bytes) {
                Ok(host) => {
                    // An IP literal is not a useful rewrite
                    if host.parse::<std::net::IpAddr>().is_ok() {
                        continue;
                    }
                    return Ok(host);
                }
                Err(_) => continue,
            }
        }

        Err(Error::SniffFailed)
    }

    fn cache_sniff_failed(&self, dst: &str) {
        let mut skip_list = self.skip_list.write();
        let count = match skip_list.peek(dst) {
            Some(entry) if entry.at.elapsed() < SKIP_TTL => entry.count,
            _ => 0,
        };
        // Saturate at 6
        let count = if count <= SKIP_AFTER_FAILURES {
            count + 1
        } else {
            count
        };
        skip_list.put(
            dst.to_string(),
            SkipEntry {
                count,
                at: Instant::now(),
            },
        );
    }

    #[cfg(test)]
    fn failure_count(&self, dst: &str) -> u8 {
        self.skip_list
            .read()
            .peek(dst)
            .map(|e| e.count)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{ConnKind, Network};
    use tokio::io::AsyncWriteExt;

    fn dispatcher(override_dest: bool) -> SnifferDispatcher {
        let mut configs = HashMap::new();
        configs.insert(
            "tls".to_string(),
            SnifferConfig {
                override_dest,
                ports: None,
            },
        );
        SnifferDispatcher::new(
            &configs,
            DomainMatcher::default(),
            DomainMatcher::default(),
            false,
            true,
        )
        .unwrap()
    }

    fn ip_metadata(ip: &str, port: u16) -> Metadata {
        let mut m = Metadata::new(Network::Tcp, ConnKind::Mixed);
        m.dst_ip = Some(ip.parse().unwrap());
        m.dst_port = port;
        m
    }

    #[tokio::test]
    async fn test_sni_sniff_rewrites_host() {
        let sd = dispatcher(true);
        let (client, mut server) = tokio::io::duplex(4096);
        server
            .write_all(&tls::client_hello_with_sni("target.example"))
            .await
            .unwrap();

        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("1.2.3.4", 443);

        sd.tcp_sniff(&mut stream, &mut metadata).await;

        assert_eq!(metadata.sniff_host(), "target.example");
        assert_eq!(metadata.host, "target.example");
        assert_eq!(metadata.dns_mode(), DnsMode::Normal);
    }

    #[tokio::test]
    async fn test_sniff_without_override_keeps_host() {
        let sd = dispatcher(false);
        let (client, mut server) = tokio::io::duplex(4096);
        server
            .write_all(&tls::client_hello_with_sni("target.example"))
            .await
            .unwrap();

        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("1.2.3.4", 443);

        sd.tcp_sniff(&mut stream, &mut metadata).await;

        assert_eq!(metadata.sniff_host(), "target.example");
        assert!(metadata.host.is_empty());
    }

    #[tokio::test]
    async fn test_skip_list_saturation() {
        let sd = dispatcher(true);

        for expected in 1..=5u8 {
            let (client, mut server) = tokio::io::duplex(4096);
            server.write_all(b"\x00garbage not a hello").await.unwrap();
            let mut stream = BufferedStream::new(Box::new(client));
            let mut metadata = ip_metadata("9.9.9.9", 443);
            sd.tcp_sniff(&mut stream, &mut metadata).await;
            assert_eq!(sd.failure_count("9.9.9.9:443"), expected);
        }

        // Sixth failure saturates the counter
        let (client, mut server) = tokio::io::duplex(4096);
        server.write_all(b"\x00garbage not a hello").await.unwrap();
        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("9.9.9.9", 443);
        sd.tcp_sniff(&mut stream, &mut metadata).await;
        assert_eq!(sd.failure_count("9.9.9.9:443"), 6);

        // Seventh invocation short-circuits without touching the stream:
        // the peer writes nothing, so reaching the peek would time out,
        // yet the call returns immediately.
        let (client, _server) = tokio::io::duplex(4096);
        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("9.9.9.9", 443);
        tokio::time::timeout(
            Duration::from_millis(100),
            sd.tcp_sniff(&mut stream, &mut metadata),
        )
        .await
        .expect("skip path must not wait on the peek deadline");
        assert_eq!(sd.failure_count("9.9.9.9:443"), 6);
    }

    #[tokio::test]
    async fn test_success_clears_skip_entry() {
        let sd = dispatcher(true);

        let (client, mut server) = tokio::io::duplex(4096);
        server.write_all(b"\x00garbage not a hello").await.unwrap();
        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("5.6.7.8", 443);
        sd.tcp_sniff(&mut stream, &mut metadata).await;
        assert_eq!(sd.failure_count("5.6.7.8:443"), 1);

        let (client, mut server) = tokio::io::duplex(4096);
        server
            .write_all(&tls::client_hello_with_sni("ok.example"))
            .await
            .unwrap();
        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("5.6.7.8", 443);
        sd.tcp_sniff(&mut stream, &mut metadata).await;
        assert_eq!(sd.failure_count("5.6.7.8:443"), 0);
    }

    #[tokio::test]
    async fn test_skip_sni_suppresses_rewrite() {
        let mut configs = HashMap::new();
        configs.insert(
            "tls".to_string(),
            SnifferConfig {
                override_dest: true,
                ports: None,
            },
        );
        let sd = SnifferDispatcher::new(
            &configs,
            DomainMatcher::default(),
            DomainMatcher::new(&["+.hidden.example".to_string()]),
            false,
            true,
        )
        .unwrap();

        let (client, mut server) = tokio::io::duplex(4096);
        server
            .write_all(&tls::client_hello_with_sni("a.hidden.example"))
            .await
            .unwrap();
        let mut stream = BufferedStream::new(Box::new(client));
        let mut metadata = ip_metadata("1.2.3.4", 443);
        sd.tcp_sniff(&mut stream, &mut metadata).await;

        assert!(metadata.host.is_empty());
        assert!(metadata.sniff_host().is_empty());
    }
}
