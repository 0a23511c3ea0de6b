//! Address type for network connections
//!
//! The wire form follows the SOCKS5 address encoding (ATYP + address + port),
//! which is shared by SOCKS5 itself and the VMess/VLESS/Trojan families.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::{Error, Result};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Network address representation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// IP socket address (IP + port)
    Socket(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl Address {
    /// Create an unspecified address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Address::Socket(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Create from domain and port
    pub fn domain(domain: impl Into<String>, port: u16) -> Self {
        Address::Domain(domain.into(), port)
    }

    /// Create from socket address
    pub fn socket(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Address::Socket(SocketAddr::new(ip, port))
    }

    /// Get the port
    pub fn port(&self) -> u16 {
        match self {
            Address::Socket(addr) => addr.port(),
            Address::Domain(_, port) => *port,
        }
    }

    /// Get the host part as string
    pub fn host(&self) -> String {
        match self {
            Address::Socket(addr) => addr.ip().to_string(),
            Address::Domain(domain, _) => domain.clone(),
        }
    }

    /// Check if this is a domain address
    pub fn is_domain(&self) -> bool {
        matches!(self, Address::Domain(_, _))
    }

    /// Try to get as socket address (fails for domain)
    pub fn as_socket(&self) -> Option<SocketAddr> {
        match self {
            Address::Socket(addr) => Some(*addr),
            Address::Domain(_, _) => None,
        }
    }

    /// Get domain if this is a domain address
    pub fn as_domain(&self) -> Option<(&str, u16)> {
        match self {
            Address::Domain(domain, port) => Some((domain, *port)),
            Address::Socket(_) => None,
        }
    }

    /// Serialize to the SOCKS5 wire form: ATYP + address + big-endian port
    pub fn to_socks_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 16 + 2);
        match self {
            Address::Socket(SocketAddr::V4(v4)) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&v4.ip().octets());
                buf.extend_from_slice(&v4.port().to_be_bytes());
            }
            Address::Socket(SocketAddr::V6(v6)) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&v6.ip().octets());
                buf.extend_from_slice(&v6.port().to_be_bytes());
            }
            Address::Domain(domain, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(domain.len() as u8);
                buf.extend_from_slice(domain.as_bytes());
                buf.extend_from_slice(&port.to_be_bytes());
            }
        }
        buf
    }

    /// Parse the SOCKS5 wire form. The buffer must contain exactly one address.
    pub fn from_socks_bytes(buf: &[u8]) -> Result<Self> {
        if buf.is_empty() {
            return Err(Error::BadAddress("empty address".into()));
        }
        match buf[0] {
            ATYP_IPV4 => {
                if buf.len() != 1 + 4 + 2 {
                    return Err(Error::BadAddress("IPv4 length mismatch".into()));
                }
                let ip = Ipv4Addr::new(buf[1], buf[2], buf[3], buf[4]);
                let port = u16::from_be_bytes([buf[5], buf[6]]);
                Ok(Address::ip_port(ip.into(), port))
            }
            ATYP_DOMAIN => {
                if buf.len() < 2 {
                    return Err(Error::BadAddress("truncated domain address".into()));
                }
                let len = buf[1] as usize;
                if len == 0 {
                    return Err(Error::BadAddress("zero-length domain".into()));
                }
                if buf.len() != 2 + len + 2 {
                    return Err(Error::BadAddress("domain length mismatch".into()));
                }
                let raw = &buf[2..2 + len];
                if !raw
                    .iter()
                    .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
                {
                    return Err(Error::BadAddress("invalid domain characters".into()));
                }
                let domain = std::str::from_utf8(raw)
                    .map_err(|_| Error::BadAddress("non-ASCII domain".into()))?
                    .to_string();
                let port = u16::from_be_bytes([buf[2 + len], buf[3 + len]]);
                Ok(Address::Domain(domain, port))
            }
            ATYP_IPV6 => {
                if buf.len() != 1 + 16 + 2 {
                    return Err(Error::BadAddress("IPv6 length mismatch".into()));
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = u16::from_be_bytes([buf[17], buf[18]]);
                Ok(Address::ip_port(Ipv6Addr::from(octets).into(), port))
            }
            atyp => Err(Error::BadAddress(format!("unknown address type {atyp}"))),
        }
    }

    /// Parse a "host:port" string, as found in CONNECT lines and Host headers
    pub fn parse_host_port(s: &str, default_port: u16) -> Result<Self> {
        if let Ok(addr) = s.parse() {
            return Ok(Address::Socket(addr));
        }

        let (host, port) = if let Some((h, p)) = s.rsplit_once(':') {
            let port: u16 = p
                .parse()
                .map_err(|_| Error::BadAddress(format!("invalid port: {p}")))?;
            (h, port)
        } else {
            (s, default_port)
        };

        // Remove brackets from IPv6
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(Address::ip_port(ip, port));
        }

        Ok(Address::Domain(host.to_string(), port))
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Socket(addr) => write!(f, "{}", addr),
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::Socket(addr)
    }
}

impl From<(String, u16)> for Address {
    fn from((domain, port): (String, u16)) -> Self {
        Address::Domain(domain, port)
    }
}

impl From<(&str, u16)> for Address {
    fn from((domain, port): (&str, u16)) -> Self {
        Address::Domain(domain.to_string(), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socks_roundtrip() {
        let cases = [
            Address::ip_port("1.2.3.4".parse().unwrap(), 443),
            Address::ip_port("2001:db8::1".parse().unwrap(), 8443),
            Address::domain("example.com", 80),
        ];
        for addr in cases {
            let bytes = addr.to_socks_bytes();
            let decoded = Address::from_socks_bytes(&bytes).unwrap();
            assert_eq!(decoded, addr);
            assert_eq!(decoded.to_socks_bytes(), bytes);
        }
    }

    #[test]
    fn test_socks_decode_rejects_bad_input() {
        assert!(Address::from_socks_bytes(&[]).is_err());
        // zero-length domain
        assert!(Address::from_socks_bytes(&[ATYP_DOMAIN, 0, 0, 80]).is_err());
        // length mismatch
        assert!(Address::from_socks_bytes(&[ATYP_IPV4, 1, 2, 3]).is_err());
        // domain with forbidden bytes
        let mut buf = vec![ATYP_DOMAIN, 3];
        buf.extend_from_slice(b"a b");
        buf.extend_from_slice(&443u16.to_be_bytes());
        assert!(Address::from_socks_bytes(&buf).is_err());
    }

    #[test]
    fn test_parse_host_port() {
        let addr = Address::parse_host_port("example.com:8080", 80).unwrap();
        assert_eq!(addr, Address::domain("example.com", 8080));

        let addr = Address::parse_host_port("example.com", 80).unwrap();
        assert_eq!(addr.port(), 80);

        let addr = Address::parse_host_port("10.0.0.1:443", 80).unwrap();
        assert!(!addr.is_domain());

        assert!(Address::parse_host_port("example.com:notaport", 80).is_err());
    }
}
