//! Metadata - the unified context for routing decisions
//!
//! The outbound selection layer ONLY depends on Metadata, never on Stream or IO.

use std::net::IpAddr;

/// Network type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Network {
    #[default]
    Tcp,
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "tcp"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

/// Inbound origin of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnKind {
    Http,
    Socks4,
    Socks5,
    #[default]
    Mixed,
    Inner,
    Redir,
    Tun,
}

impl std::fmt::Display for ConnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnKind::Http => write!(f, "HTTP"),
            ConnKind::Socks4 => write!(f, "SOCKS4"),
            ConnKind::Socks5 => write!(f, "SOCKS5"),
            ConnKind::Mixed => write!(f, "Mixed"),
            ConnKind::Inner => write!(f, "Inner"),
            ConnKind::Redir => write!(f, "Redir"),
            ConnKind::Tun => write!(f, "TUN"),
        }
    }
}

/// How the destination was produced by the DNS layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    Normal,
    Mapping,
    FakeIp,
}

/// Metadata extracted from protocol decoding.
///
/// Mutable for the lifetime of its ConnContext; the sniffer may rewrite
/// `host` before the outbound is selected.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Network type (TCP/UDP)
    pub network: Network,
    /// Inbound origin
    pub kind: ConnKind,
    /// Observed client endpoint (may be unset)
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    /// Listener endpoint
    pub in_ip: Option<IpAddr>,
    pub in_port: u16,
    /// Intended remote
    pub dst_ip: Option<IpAddr>,
    pub dst_port: u16,
    /// Destination hostname if known (may be empty)
    pub host: String,
    /// Hostname produced by the sniffer; write-once
    sniff_host: String,
    dns_mode: DnsMode,
    /// Annotations applied by inbound Additions
    pub process_path: Option<String>,
    pub special_rules: String,
    pub in_name: String,
}

impl Metadata {
    pub fn new(network: Network, kind: ConnKind) -> Self {
        Self {
            network,
            kind,
            ..Default::default()
        }
    }

    /// Builder: set destination from an Address
    pub fn with_destination(mut self, addr: &super::Address) -> Self {
        match addr {
            super::Address::Socket(sock) => {
                self.dst_ip = Some(sock.ip());
                self.dst_port = sock.port();
            }
            super::Address::Domain(domain, port) => {
                self.host = domain.clone();
                self.dst_port = *port;
            }
        }
        self
    }

    /// Builder: set observed client endpoint
    pub fn with_source(mut self, addr: std::net::SocketAddr) -> Self {
        self.src_ip = Some(addr.ip());
        self.src_port = addr.port();
        self
    }

    /// Builder: set listener endpoint
    pub fn with_inbound(mut self, addr: std::net::SocketAddr) -> Self {
        self.in_ip = Some(addr.ip());
        self.in_port = addr.port();
        self
    }

    /// Builder: set the initial DNS mode
    pub fn with_dns_mode(mut self, mode: DnsMode) -> Self {
        self.dns_mode = mode;
        self
    }

    pub fn dns_mode(&self) -> DnsMode {
        self.dns_mode
    }

    /// Latch the DNS mode to Normal. Once Normal it never reverts.
    pub fn set_dns_mode(&mut self, mode: DnsMode) {
        if self.dns_mode == DnsMode::Normal {
            return;
        }
        self.dns_mode = mode;
    }

    pub fn sniff_host(&self) -> &str {
        &self.sniff_host
    }

    /// Record the sniffed hostname. The first write wins.
    pub fn set_sniff_host(&mut self, host: &str) {
        if self.sniff_host.is_empty() {
            self.sniff_host = host.to_string();
        }
    }

    /// True when the metadata carries enough routing information:
    /// a port plus either a destination IP or a hostname.
    pub fn valid(&self) -> bool {
        self.dst_port > 0 && (!self.host.is_empty() || self.dst_ip.is_some())
    }

    /// Address string used for dialing, preferring the hostname
    pub fn remote_address(&self) -> String {
        if !self.host.is_empty() {
            format!("{}:{}", self.host, self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            format!("{}:{}", ip, self.dst_port)
        } else {
            format!("0.0.0.0:{}", self.dst_port)
        }
    }

    /// Destination as an Address, preferring the hostname
    pub fn destination(&self) -> super::Address {
        if !self.host.is_empty() {
            super::Address::domain(self.host.clone(), self.dst_port)
        } else if let Some(ip) = self.dst_ip {
            super::Address::ip_port(ip, self.dst_port)
        } else {
            super::Address::unspecified()
        }
    }

    /// "ip:port" key of the intended remote, used by the sniffer skip list
    pub fn dst_key(&self) -> String {
        match self.dst_ip {
            Some(ip) => format!("{}:{}", ip, self.dst_port),
            None => format!(":{}", self.dst_port),
        }
    }

    /// Source endpoint for log lines
    pub fn source_detail(&self) -> String {
        match self.src_ip {
            Some(ip) => format!("{}:{}", ip, self.src_port),
            None => format!(":{}", self.src_port),
        }
    }
}

impl std::fmt::Display for Metadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}] {} --> {}",
            self.network,
            self.source_detail(),
            self.remote_address()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Address;

    #[test]
    fn test_destination_prefers_host() {
        let mut m = Metadata::new(Network::Tcp, ConnKind::Http)
            .with_destination(&Address::ip_port("1.2.3.4".parse().unwrap(), 443));
        assert_eq!(m.remote_address(), "1.2.3.4:443");

        m.host = "example.com".into();
        assert_eq!(m.remote_address(), "example.com:443");
        assert!(m.valid());
    }

    #[test]
    fn test_dns_mode_latch() {
        let mut m = Metadata::new(Network::Tcp, ConnKind::Mixed).with_dns_mode(DnsMode::Mapping);
        m.set_dns_mode(DnsMode::Normal);
        assert_eq!(m.dns_mode(), DnsMode::Normal);
        // Normal never reverts
        m.set_dns_mode(DnsMode::FakeIp);
        assert_eq!(m.dns_mode(), DnsMode::Normal);
    }

    #[test]
    fn test_sniff_host_write_once() {
        let mut m = Metadata::new(Network::Tcp, ConnKind::Mixed);
        m.set_sniff_host("first.example");
        m.set_sniff_host("second.example");
        assert_eq!(m.sniff_host(), "first.example");
    }
}
