//! HTTP request sniffer
//!
//! Recognizes an HTTP/1.x request line and extracts the Host header from
//! the already-buffered prefix.

use crate::error::{Error, Result};

use super::{PortRanges, Sniffer, SnifferNetwork};

const METHODS: &[&str] = &[
    "GET", "POST", "HEAD", "PUT", "DELETE", "OPTIONS", "CONNECT", "PATCH", "TRACE",
];

/// Sniffer extracting the Host header from a plaintext HTTP request
pub struct HttpSniffer {
    ports: PortRanges,
}

impl HttpSniffer {
    pub fn new(ports: PortRanges) -> Self {
        Self { ports }
    }
}

impl Default for HttpSniffer {
    fn default() -> Self {
        // Plain HTTP plus the common alternative ranges
        Self::new(PortRanges::new(&[(80, 80), (8080, 8880)]))
    }
}

impl Sniffer for HttpSniffer {
    fn protocol(&self) -> &'static str {
        "http"
    }

    fn support_network(&self) -> SnifferNetwork {
        SnifferNetwork::Tcp
    }

    fn support_port(&self, port: u16) -> bool {
        self.ports.contains(port)
    }

    fn sniff_tcp(&self, buf: &[u8]) -> Result<String> {
        extract_host(buf)
    }
}

fn extract_host(buf: &[u8]) -> Result<String> {
    // Longest method + space is 8 bytes; anything shorter is undecidable
    if buf.len() < 8 {
        return Err(Error::NoClue);
    }
    let text = std::str::from_utf8(buf).map_err(|_| Error::SniffFailed)?;

    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or(Error::SniffFailed)?;
    let method = request_line.split(' ').next().ok_or(Error::SniffFailed)?;
    if !METHODS.contains(&method) {
        return Err(Error::SniffFailed);
    }

    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            if key.trim().eq_ignore_ascii_case("host") {
                let value = value.trim();
                // Strip a port suffix; keep bracketed IPv6 intact
                let host = match value.rsplit_once(':') {
                    Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) => h,
                    _ => value,
                };
                if host.is_empty() {
                    return Err(Error::SniffFailed);
                }
                return Ok(host.to_string());
            }
        }
    }

    // Headers incomplete and no Host seen yet
    if text.contains("\r\n\r\n") {
        Err(Error::SniffFailed)
    } else {
        Err(Error::NoClue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_host() {
        let req = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "example.com");
    }

    #[test]
    fn test_host_with_port() {
        let req = b"POST /p HTTP/1.1\r\nHost: example.com:8080\r\n\r\n";
        assert_eq!(extract_host(req).unwrap(), "example.com");
    }

    #[test]
    fn test_not_http() {
        assert!(matches!(
            extract_host(b"\x16\x03\x01\x00\x05xxxxx"),
            Err(Error::SniffFailed)
        ));
    }

    #[test]
    fn test_incomplete_headers_is_no_clue() {
        assert!(matches!(
            extract_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n"),
            Err(Error::NoClue)
        ));
    }

    #[test]
    fn test_complete_headers_without_host_fails() {
        assert!(matches!(
            extract_host(b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n"),
            Err(Error::SniffFailed)
        ));
    }
}
