//! VMess client outbound
//!
//! AEAD mode only (alter_id = 0). The adapter stacks the configured
//! carrier (tcp / tls / ws / grpc) and runs the VMess handshake on top.

mod aead;
mod client;
mod stream;

pub use client::VmessClient;

use async_trait::async_trait;
use uuid::Uuid;

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;
use crate::tls as fingerprint;
use crate::transport::{grpc, tcp, ws, GrpcConfig, TlsConfig, WsConfig};

use super::{server_addr, OutboundAdapter, ProxyKind, VmessOption};

/// VMess security types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Security {
    #[default]
    Auto,
    Aes128Gcm,
    Chacha20Poly1305,
    None,
    Zero,
}

impl Security {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "aes-128-gcm" | "aes128gcm" => Security::Aes128Gcm,
            "chacha20-poly1305" | "chacha20poly1305" => Security::Chacha20Poly1305,
            "none" => Security::None,
            "zero" => Security::Zero,
            _ => Security::Auto,
        }
    }

    pub fn to_byte(self) -> u8 {
        match self {
            Security::Auto => 0x00,
            Security::Aes128Gcm => 0x03,
            Security::Chacha20Poly1305 => 0x04,
            Security::None => 0x05,
            Security::Zero => 0x06,
        }
    }

    /// Resolve Auto to a concrete cipher
    pub fn resolve(self) -> Security {
        match self {
            Security::Auto => {
                // AES-NI on x86, ChaCha20 elsewhere
                #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
                {
                    Security::Aes128Gcm
                }
                #[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
                {
                    Security::Chacha20Poly1305
                }
            }
            _ => self,
        }
    }
}

/// VMess protocol configuration
#[derive(Debug, Clone)]
pub struct VmessConfig {
    pub uuid: Uuid,
    pub security: Security,
    /// Must be 0 for AEAD
    pub alter_id: u16,
}

/// VMess proxy client adapter
pub struct VmessAdapter {
    option: VmessOption,
    config: VmessConfig,
}

impl VmessAdapter {
    pub fn new(option: VmessOption) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "vmess proxy {}: missing server",
                option.name
            )));
        }
        let uuid = Uuid::parse_str(&option.uuid)
            .map_err(|e| Error::Config(format!("vmess proxy {}: bad uuid: {e}", option.name)))?;
        if option.alter_id != 0 {
            return Err(Error::Config(format!(
                "vmess proxy {}: only AEAD (alter-id 0) is supported",
                option.name
            )));
        }
        match option.network.as_str() {
            "" | "tcp" | "ws" | "grpc" => {}
            other => {
                return Err(Error::Config(format!(
                    "vmess proxy {}: unsupported network {}",
                    option.name, other
                )))
            }
        }

        let config = VmessConfig {
            uuid,
            security: Security::parse(&option.cipher),
            alter_id: option.alter_id,
        };
        Ok(Self { option, config })
    }

    fn sni(&self) -> String {
        if self.option.servername.is_empty() {
            self.option.server.clone()
        } else {
            self.option.servername.clone()
        }
    }

    fn tls_config(&self) -> TlsConfig {
        TlsConfig {
            server_name: self.sni(),
            skip_cert_verify: self.option.skip_cert_verify,
            alpn: vec![],
        }
    }

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
                let stream = if self.option.tls {
                    fingerprint::wrap_client(
                        conn,
                        &self.tls_config(),
                        &self.option.client_fingerprint,
                        true,
                    )
                    .await?
                } else {
                    conn
                };
                let ws_config = WsConfig {
                    path: self.option.ws_opts.path.clone(),
                    host: Some(
                        self.option
                            .ws_opts
                            .headers
                            .get("Host")
                            .cloned()
                            .unwrap_or_else(|| self.sni()),
                    ),
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
                ws::wrap_client(stream, &ws_config).await
            }
            _ => {
                if self.option.tls {
                    fingerprint::wrap_client(
                        conn,
                        &self.tls_config(),
                        &self.option.client_fingerprint,
                        false,
                    )
                    .await
                } else {
                    Ok(conn)
                }
            }
        }
    }
}

#[async_trait]
impl OutboundAdapter for VmessAdapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Vmess
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
        let stream = self.wrap_transport(conn).await?;

        let client = VmessClient::new(self.config.clone());
        client.connect(stream, metadata).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_parse() {
        assert_eq!(Security::parse("aes-128-gcm"), Security::Aes128Gcm);
        assert_eq!(Security::parse("CHACHA20-POLY1305"), Security::Chacha20Poly1305);
        assert_eq!(Security::parse("none"), Security::None);
        assert_eq!(Security::parse("whatever"), Security::Auto);
        assert_ne!(Security::Auto.resolve(), Security::Auto);
    }

    #[test]
    fn test_adapter_validation() {
        let ok = VmessAdapter::new(VmessOption {
            name: "v".into(),
            server: "s.example".into(),
            port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            ..Default::default()
        });
        assert!(ok.is_ok());

        let bad_uuid = VmessAdapter::new(VmessOption {
            name: "v".into(),
            server: "s.example".into(),
            uuid: "xyz".into(),
            ..Default::default()
        });
        assert!(bad_uuid.is_err());

        let legacy = VmessAdapter::new(VmessOption {
            name: "v".into(),
            server: "s.example".into(),
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            alter_id: 4,
            ..Default::default()
        });
        assert!(legacy.is_err());
    }
}
