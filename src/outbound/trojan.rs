//! Trojan client outbound
//!
//! Request: hex(SHA224(password)) CRLF CMD + SOCKS5 address CRLF, then raw
//! payload. The server sends no reply; TLS is the outer layer on every
//! carrier.

use async_trait::async_trait;
use sha2::{Digest, Sha224};
use tokio::io::AsyncWriteExt;

use crate::common::{Metadata, Network, Result, Stream};
use crate::error::Error;
use crate::tls as fingerprint;
use crate::transport::{grpc, tcp, ws, GrpcConfig, TlsConfig, WsConfig};

use super::{server_addr, OutboundAdapter, ProxyKind, TrojanOption};

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

/// Trojan proxy client
pub struct TrojanAdapter {
    option: TrojanOption,
    /// hex(SHA224(password)), precomputed
    password_hash: String,
}

impl TrojanAdapter {
    pub fn new(option: TrojanOption) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "trojan proxy {}: missing server",
                option.name
            )));
        }
        if option.password.is_empty() {
            return Err(Error::Config(format!(
                "trojan proxy {}: missing password",
                option.name
            )));
        }
        match option.network.as_str() {
            "" | "tcp" | "ws" | "grpc" => {}
            other => {
                return Err(Error::Config(format!(
                    "trojan proxy {}: unsupported network {}",
                    option.name, other
                )))
            }
        }

        let digest = Sha224::digest(option.password.as_bytes());
        let password_hash: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

        Ok(Self {
            option,
            password_hash,
        })
    }

    fn sni(&self) -> String {
        if self.option.sni.is_empty() {
            self.option.server.clone()
        } else {
            self.option.sni.clone()
        }
    }

    fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            server_name: self.sni(),
            skip_cert_verify: self.option.skip_cert_verify,
            alpn: self.option.alpn.clone(),
        }
    }

    /// Stack the carrier layers onto a raw connection
    async fn wrap_transport(&self, conn: Stream) -> Result<Stream> {
        match self.option.network.as_str() {
            "grpc" => {
                let grpc_config = GrpcConfig {
                    service_name: self.option.grpc_opts.grpc_service_name.clone(),
                    host: self.sni(),
                    client_fingerprint: self.option.client_fingerprint.clone(),
                };
                grpc::stream_grpc_conn(conn, &self.tls_config(), &grpc_config).await
            }
            "ws" => {
                let tls_stream = fingerprint::wrap_client(
                    conn,
                    &self.tls_config(),
                    &self.option.client_fingerprint,
                    true,
                )
                .await?;
                let ws_config = WsConfig {
                    path: self.option.ws_opts.path.clone(),
                    host: Some(self.sni()),
                    headers: self
                        .option
                        .ws_opts
                        .headers
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect(),
                    max_early_data: self.option.ws_opts.max_early_data,
                    early_data_header_name: self.option.ws_opts.early_data_header_name.clone(),
                };
                ws::wrap_client(tls_stream, &ws_config).await
            }
            _ => {
                fingerprint::wrap_client(
                    conn,
                    &self.tls_config(),
                    &self.option.client_fingerprint,
                    false,
                )
                .await
            }
        }
    }

    fn build_request(&self, metadata: &Metadata) -> Vec<u8> {
        let mut request = Vec::with_capacity(56 + 2 + 1 + 1 + 256 + 2 + 2);
        request.extend_from_slice(self.password_hash.as_bytes());
        request.extend_from_slice(b"\r\n");
        request.push(match metadata.network {
            Network::Tcp => CMD_CONNECT,
            Network::Udp => CMD_UDP_ASSOCIATE,
        });
        request.extend_from_slice(&metadata.destination().to_socks_bytes());
        request.extend_from_slice(b"\r\n");
        request
    }
}

#[async_trait]
impl OutboundAdapter for TrojanAdapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Trojan
    }

    fn addr(&self) -> String {
        server_addr(&self.option.server, self.option.port)
    }

    fn supports_udp(&self) -> bool {
        self.option.udp
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let server = (self.option.server.as_str(), self.option.port).into();
        let conn = tcp::dial(&server).await?;
        let mut stream = self.wrap_transport(conn).await?;

        stream.write_all(&self.build_request(metadata)).await?;
        stream.flush().await?;

        // The server answers with raw payload only
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ConnKind;

    fn option() -> TrojanOption {
        TrojanOption {
            name: "t1".into(),
            server: "server.example".into(),
            port: 443,
            password: "letmein".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_password_hash_is_hex_sha224() {
        let adapter = TrojanAdapter::new(option()).unwrap();
        // 224 bits = 56 hex chars
        assert_eq!(adapter.password_hash.len(), 56);
        assert!(adapter.password_hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_request_layout() {
        let adapter = TrojanAdapter::new(option()).unwrap();
        let metadata = Metadata::new(Network::Tcp, ConnKind::Socks5)
            .with_destination(&crate::common::Address::domain("example.com", 80));
        let request = adapter.build_request(&metadata);

        assert_eq!(&request[56..58], b"\r\n");
        assert_eq!(request[58], CMD_CONNECT);
        // SOCKS5 domain encoding follows
        assert_eq!(request[59], crate::common::ATYP_DOMAIN);
        assert_eq!(request[60] as usize, "example.com".len());
        assert_eq!(&request[request.len() - 2..], b"\r\n");
    }

    #[test]
    fn test_rejects_unknown_network() {
        let mut opt = option();
        opt.network = "quic".into();
        assert!(TrojanAdapter::new(opt).is_err());
    }
}
