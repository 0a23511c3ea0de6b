//! VMess client handshake

use std::net::IpAddr;

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::common::{Metadata, Network, Result, Stream};
use crate::error::Error;

use super::aead::seal_vmess_aead_header;
use super::stream::VmessStream;
use super::{Security, VmessConfig};

const VMESS_VERSION: u8 = 1;

// Request options
const REQUEST_OPTION_CHUNK_STREAM: u8 = 0x01;
const REQUEST_OPTION_CHUNK_MASKING: u8 = 0x04;
const REQUEST_OPTION_GLOBAL_PADDING: u8 = 0x08;

// Commands
const COMMAND_TCP: u8 = 0x01;
const COMMAND_UDP: u8 = 0x02;

// VMess address types
const ADDR_TYPE_IPV4: u8 = 0x01;
const ADDR_TYPE_DOMAIN: u8 = 0x02;
const ADDR_TYPE_IPV6: u8 = 0x03;

/// VMess client for outbound connections
pub struct VmessClient {
    config: VmessConfig,
}

impl VmessClient {
    pub fn new(config: VmessConfig) -> Self {
        Self { config }
    }

    /// cmdKey = md5(uuid + "c48619fe-8f02-49e0-b9e9-edf763e17e21")
    fn cmd_key(&self) -> [u8; 16] {
        let uuid_bytes = self.config.uuid.as_bytes();
        let mut data = Vec::with_capacity(uuid_bytes.len() + 36);
        data.extend_from_slice(uuid_bytes);
        data.extend_from_slice(b"c48619fe-8f02-49e0-b9e9-edf763e17e21");

        let result = md5::compute(&data);
        let mut key = [0u8; 16];
        key.copy_from_slice(&result.0);
        key
    }

    /// Perform the VMess handshake over an established carrier stream.
    pub async fn connect(&self, stream: Stream, metadata: &Metadata) -> Result<Stream> {
        debug!("VMess connecting to {}", metadata.remote_address());

        let cmd_key = self.cmd_key();

        let mut request_body_key = [0u8; 16];
        let mut request_body_iv = [0u8; 16];
        let mut response_header = [0u8; 1];
        rand::thread_rng().fill_bytes(&mut request_body_key);
        rand::thread_rng().fill_bytes(&mut request_body_iv);
        rand::thread_rng().fill_bytes(&mut response_header);

        // AEAD response keys are SHA256 halves of the request keys
        let response_body_key = {
            let result = Sha256::digest(request_body_key);
            let mut key = [0u8; 16];
            key.copy_from_slice(&result[..16]);
            key
        };
        let response_body_iv = {
            let result = Sha256::digest(request_body_iv);
            let mut iv = [0u8; 16];
            iv.copy_from_slice(&result[..16]);
            iv
        };

        let header = self.build_request_header(
            metadata,
            &request_body_key,
            &request_body_iv,
            response_header[0],
        )?;
        let sealed_header = seal_vmess_aead_header(&cmd_key, &header)?;

        let security = self.config.security.resolve();
        let vmess_stream = VmessStream::client(
            stream,
            security,
            request_body_key,
            request_body_iv,
            response_body_key,
            response_body_iv,
            sealed_header,
            response_header[0],
        );

        // The header rides with the first payload; the response header is
        // read lazily on first read
        Ok(Box::new(vmess_stream))
    }

    fn build_request_header(
        &self,
        metadata: &Metadata,
        request_body_key: &[u8; 16],
        request_body_iv: &[u8; 16],
        response_header: u8,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(128);

        buf.push(VMESS_VERSION);
        buf.extend_from_slice(request_body_iv);
        buf.extend_from_slice(request_body_key);
        buf.push(response_header);

        let mut options = REQUEST_OPTION_CHUNK_STREAM;
        let security = self.config.security.resolve();

        if matches!(
            security,
            Security::Aes128Gcm | Security::Chacha20Poly1305 | Security::None
        ) {
            options |= REQUEST_OPTION_CHUNK_MASKING;
        }
        // Padding only applies to the AEAD ciphers
        if matches!(security, Security::Aes128Gcm | Security::Chacha20Poly1305) {
            options |= REQUEST_OPTION_GLOBAL_PADDING;
        }
        buf.push(options);

        let padding_len = rand::random::<u8>() % 16;
        buf.push((padding_len << 4) | security.to_byte());

        buf.push(0); // reserved

        buf.push(match metadata.network {
            Network::Tcp => COMMAND_TCP,
            Network::Udp => COMMAND_UDP,
        });

        self.write_address(&mut buf, metadata)?;

        if padding_len > 0 {
            let mut padding = vec![0u8; padding_len as usize];
            rand::thread_rng().fill_bytes(&mut padding);
            buf.extend_from_slice(&padding);
        }

        let hash = fnv1a_hash(&buf);
        buf.extend_from_slice(&hash.to_be_bytes());

        Ok(buf)
    }

    /// VMess address layout: port first, then type + address
    fn write_address(&self, buf: &mut Vec<u8>, metadata: &Metadata) -> Result<()> {
        buf.extend_from_slice(&metadata.dst_port.to_be_bytes());

        if !metadata.host.is_empty() {
            let domain_bytes = metadata.host.as_bytes();
            if domain_bytes.len() > 255 {
                return Err(Error::Protocol("domain too long".into()));
            }
            buf.push(ADDR_TYPE_DOMAIN);
            buf.push(domain_bytes.len() as u8);
            buf.extend_from_slice(domain_bytes);
            return Ok(());
        }

        match metadata.dst_ip {
            Some(IpAddr::V4(ip)) => {
                buf.push(ADDR_TYPE_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            Some(IpAddr::V6(ip)) => {
                buf.push(ADDR_TYPE_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            None => return Err(Error::Protocol("no destination address".into())),
        }
        Ok(())
    }
}

/// FNV1a 32-bit hash
fn fnv1a_hash(data: &[u8]) -> u32 {
    const FNV_OFFSET_BASIS: u32 = 2166136261;
    const FNV_PRIME: u32 = 16777619;

    let mut hash = FNV_OFFSET_BASIS;
    for byte in data {
        hash ^= *byte as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, ConnKind};
    use uuid::Uuid;

    #[test]
    fn test_request_header_layout() {
        let client = VmessClient::new(VmessConfig {
            uuid: Uuid::nil(),
            security: Security::Aes128Gcm,
            alter_id: 0,
        });
        let metadata = Metadata::new(Network::Tcp, ConnKind::Socks5)
            .with_destination(&Address::domain("example.com", 443));

        let key = [1u8; 16];
        let iv = [2u8; 16];
        let header = client.build_request_header(&metadata, &key, &iv, 0x42).unwrap();

        assert_eq!(header[0], VMESS_VERSION);
        assert_eq!(&header[1..17], &iv);
        assert_eq!(&header[17..33], &key);
        assert_eq!(header[33], 0x42);
        // options carry chunk-stream at minimum
        assert_ne!(header[34] & REQUEST_OPTION_CHUNK_STREAM, 0);
        // command
        assert_eq!(header[37], COMMAND_TCP);
        // port + address type
        assert_eq!(&header[38..40], &443u16.to_be_bytes());
        assert_eq!(header[40], ADDR_TYPE_DOMAIN);
    }

    #[test]
    fn test_fnv1a_known_value() {
        // FNV-1a of empty input is the offset basis
        assert_eq!(fnv1a_hash(b""), 2166136261);
        assert_eq!(fnv1a_hash(b"a"), 0xe40c292c);
    }
}
