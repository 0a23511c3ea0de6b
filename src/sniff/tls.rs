//! TLS ClientHello sniffer
//!
//! Walks the record and handshake framing to the extension list and pulls
//! the first server_name entry out. No allocation before the final host.

use crate::error::{Error, Result};

use super::{PortRanges, Sniffer, SnifferNetwork};

/// Sniffer extracting the SNI from a TLS ClientHello
pub struct TlsSniffer {
    ports: PortRanges,
}

impl TlsSniffer {
    pub fn new(ports: PortRanges) -> Self {
        Self { ports }
    }
}

impl Default for TlsSniffer {
    fn default() -> Self {
        // Standard TLS ports
        Self::new(PortRanges::new(&[(443, 443), (8443, 8443)]))
    }
}

impl Sniffer for TlsSniffer {
    fn protocol(&self) -> &'static str {
        "tls"
    }

    fn support_network(&self) -> SnifferNetwork {
        SnifferNetwork::Tcp
    }

    fn support_port(&self, port: u16) -> bool {
        self.ports.contains(port)
    }

    fn sniff_tcp(&self, buf: &[u8]) -> Result<String> {
        extract_sni(buf)
    }
}

/// Parse a TLS ClientHello prefix and return the SNI host.
///
/// A buffer too short to decide yields `NoClue`; a buffer that cannot be a
/// ClientHello (or carries no server_name) yields `SniffFailed`.
fn extract_sni(buf: &[u8]) -> Result<String> {
    // TLS record header: ContentType(1)=22, Version(2), Length(2)
    if buf.len() < 5 {
        return Err(Error::NoClue);
    }
    if buf[0] != 22 {
        return Err(Error::SniffFailed);
    }
    let record_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if record_len < 4 {
        return Err(Error::SniffFailed);
    }
    if buf.len() < 5 + record_len {
        return Err(Error::NoClue);
    }

    // Handshake header: msg_type(1)=1, length(3)
    let mut p = 5;
    if buf[p] != 1 {
        return Err(Error::SniffFailed);
    }
    let hs_len = ((buf[p + 1] as usize) << 16) | ((buf[p + 2] as usize) << 8) | buf[p + 3] as usize;
    p += 4;
    if p + hs_len > buf.len() {
        return Err(Error::NoClue);
    }
    let end = p + hs_len;

    // version(2) + random(32)
    p += 2 + 32;
    if p >= end {
        return Err(Error::SniffFailed);
    }

    // session_id
    let sid_len = buf[p] as usize;
    p += 1 + sid_len;
    if p + 2 > end {
        return Err(Error::SniffFailed);
    }

    // cipher_suites
    let cs_len = u16::from_be_bytes([buf[p], buf[p + 1]]) as usize;
    p += 2 + cs_len;
    if p + 1 > end {
        return Err(Error::SniffFailed);
    }

    // compression_methods
    let cm_len = buf[p] as usize;
    p += 1 + cm_len;
    if p + 2 > end {
        return Err(Error::SniffFailed);
    }

    // extensions
    let ext_total = u16::from_be_bytes([buf[p], buf[p + 1]]) as usize;
    p += 2;
    if p + ext_total > end {
        return Err(Error::SniffFailed);
    }
    let ext_end = p + ext_total;

    while p + 4 <= ext_end {
        let ext_type = u16::from_be_bytes([buf[p], buf[p + 1]]);
        let ext_len = u16::from_be_bytes([buf[p + 2], buf[p + 3]]) as usize;
        p += 4;
        if p + ext_len > ext_end {
            return Err(Error::SniffFailed);
        }
        if ext_type == 0x0000 {
            // server_name_list: u16 len, entries [type(1)][len(2)][name]
            let data = &buf[p..p + ext_len];
            if data.len() < 2 {
                return Err(Error::SniffFailed);
            }
            let mut q = 2;
            while q + 3 <= data.len() {
                let name_type = data[q];
                let name_len = u16::from_be_bytes([data[q + 1], data[q + 2]]) as usize;
                q += 3;
                if q + name_len > data.len() {
                    break;
                }
                if name_type == 0 {
                    if let Ok(host) = std::str::from_utf8(&data[q..q + name_len]) {
                        if !host.is_empty() {
                            return Ok(host.to_string());
                        }
                    }
                }
                q += name_len;
            }
            return Err(Error::SniffFailed);
        }
        p += ext_len;
    }

    Err(Error::SniffFailed)
}

/// Build a minimal ClientHello carrying the given SNI. Test helper.
#[cfg(test)]
pub(crate) fn client_hello_with_sni(host: &str) -> Vec<u8> {
    let name = host.as_bytes();

    // server_name extension body
    let mut sni_body = Vec::new();
    sni_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
    sni_body.push(0); // host_name
    sni_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
    sni_body.extend_from_slice(name);

    let mut extensions = Vec::new();
    extensions.extend_from_slice(&0u16.to_be_bytes()); // server_name
    extensions.extend_from_slice(&(sni_body.len() as u16).to_be_bytes());
    extensions.extend_from_slice(&sni_body);

    let mut hello = Vec::new();
    hello.extend_from_slice(&[0x03, 0x03]); // version
    hello.extend_from_slice(&[0u8; 32]); // random
    hello.push(0); // session_id
    hello.extend_from_slice(&2u16.to_be_bytes()); // cipher_suites len
    hello.extend_from_slice(&[0x13, 0x01]);
    hello.push(1); // compression_methods
    hello.push(0);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(&extensions);

    let mut handshake = Vec::new();
    handshake.push(1); // ClientHello
    handshake.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = Vec::new();
    record.push(22); // handshake
    record.extend_from_slice(&[0x03, 0x01]);
    record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
    record.extend_from_slice(&handshake);
    record
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_sni() {
        let hello = client_hello_with_sni("target.example");
        assert_eq!(extract_sni(&hello).unwrap(), "target.example");
    }

    #[test]
    fn test_short_buffer_is_no_clue() {
        let hello = client_hello_with_sni("target.example");
        assert!(matches!(extract_sni(&hello[..4]), Err(Error::NoClue)));
        assert!(matches!(extract_sni(&hello[..10]), Err(Error::NoClue)));
    }

    #[test]
    fn test_non_tls_fails() {
        assert!(matches!(
            extract_sni(b"GET / HTTP/1.1\r\n"),
            Err(Error::SniffFailed)
        ));
    }

    #[test]
    fn test_ports() {
        let sniffer = TlsSniffer::default();
        assert!(sniffer.support_port(443));
        assert!(sniffer.support_port(8443));
        assert!(!sniffer.support_port(80));
    }
}
