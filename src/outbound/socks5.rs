//! SOCKS5 client outbound

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::{Metadata, Network, Result, Stream};
use crate::error::Error;
use crate::transport::{tcp, tls, TlsConfig};

use super::{server_addr, OutboundAdapter, ProxyKind, Socks5Option};

const SOCKS5_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCESS: u8 = 0x00;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 proxy client
pub struct Socks5Adapter {
    option: Socks5Option,
}

impl Socks5Adapter {
    pub fn new(option: Socks5Option) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "socks5 proxy {}: missing server",
                option.name
            )));
        }
        Ok(Self { option })
    }

    fn requires_auth(&self) -> bool {
        !self.option.username.is_empty() || !self.option.password.is_empty()
    }
}

#[async_trait]
impl OutboundAdapter for Socks5Adapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Socks5
    }

    fn addr(&self) -> String {
        server_addr(&self.option.server, self.option.port)
    }

    fn supports_udp(&self) -> bool {
        self.option.udp
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let server = (self.option.server.as_str(), self.option.port).into();
        let mut stream = tcp::dial(&server).await?;

        if self.option.tls {
            let config = TlsConfig {
                server_name: self.option.server.clone(),
                skip_cert_verify: self.option.skip_cert_verify,
                alpn: vec![],
            };
            let (wrapped, _alpn) = tls::wrap_client(stream, &config).await?;
            stream = wrapped;
        }

        // Greeting
        let auth_method = if self.requires_auth() {
            AUTH_PASSWORD
        } else {
            AUTH_NONE
        };
        stream.write_all(&[SOCKS5_VERSION, 1, auth_method]).await?;

        let mut response = [0u8; 2];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("invalid SOCKS version from server".into()));
        }
        if response[1] == AUTH_NO_ACCEPTABLE {
            return Err(Error::Protocol("server rejected auth methods".into()));
        }

        if response[1] == AUTH_PASSWORD {
            let username = self.option.username.as_bytes();
            let password = self.option.password.as_bytes();

            let mut auth_request = vec![0x01];
            auth_request.push(username.len() as u8);
            auth_request.extend_from_slice(username);
            auth_request.push(password.len() as u8);
            auth_request.extend_from_slice(password);
            stream.write_all(&auth_request).await?;

            let mut auth_response = [0u8; 2];
            stream.read_exact(&mut auth_response).await?;
            if auth_response[1] != 0x00 {
                return Err(Error::Protocol("authentication failed".into()));
            }
        }

        // Connect request: VER CMD RSV + SOCKS5 address
        let cmd = match metadata.network {
            Network::Tcp => CMD_CONNECT,
            Network::Udp => CMD_UDP_ASSOCIATE,
        };
        let mut request = vec![SOCKS5_VERSION, cmd, 0x00];
        request.extend_from_slice(&metadata.destination().to_socks_bytes());
        stream.write_all(&request).await?;

        // Reply header, then skip the bound address
        let mut response = [0u8; 4];
        stream.read_exact(&mut response).await?;

        if response[0] != SOCKS5_VERSION {
            return Err(Error::Protocol("invalid SOCKS version in response".into()));
        }
        if response[1] != REP_SUCCESS {
            return Err(Error::Dial(format!(
                "SOCKS5 connect rejected with code {}",
                response[1]
            )));
        }

        match response[3] {
            ATYP_IPV4 => {
                let mut skip = [0u8; 6];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                let mut skip = vec![0u8; len[0] as usize + 2];
                stream.read_exact(&mut skip).await?;
            }
            ATYP_IPV6 => {
                let mut skip = [0u8; 18];
                stream.read_exact(&mut skip).await?;
            }
            _ => {}
        }

        Ok(stream)
    }
}
