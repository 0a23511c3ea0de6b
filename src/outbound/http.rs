//! HTTP CONNECT client outbound

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;
use crate::transport::{tcp, tls, TlsConfig};

use super::{server_addr, HttpOption, OutboundAdapter, ProxyKind};

/// HTTP(S) proxy client, always tunneling via CONNECT
pub struct HttpAdapter {
    option: HttpOption,
}

impl HttpAdapter {
    pub fn new(option: HttpOption) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "http proxy {}: missing server",
                option.name
            )));
        }
        Ok(Self { option })
    }

    fn requires_auth(&self) -> bool {
        !self.option.username.is_empty() || !self.option.password.is_empty()
    }

    fn encode_auth(&self) -> String {
        let credentials = format!("{}:{}", self.option.username, self.option.password);
        format!("Basic {}", BASE64.encode(credentials))
    }
}

#[async_trait]
impl OutboundAdapter for HttpAdapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Http
    }

    fn addr(&self) -> String {
        server_addr(&self.option.server, self.option.port)
    }

    fn supports_udp(&self) -> bool {
        false
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let server = (self.option.server.as_str(), self.option.port).into();
        let mut stream = tcp::dial(&server).await?;

        if self.option.tls {
            let server_name = if self.option.sni.is_empty() {
                self.option.server.clone()
            } else {
                self.option.sni.clone()
            };
            let config = TlsConfig {
                server_name,
                skip_cert_verify: self.option.skip_cert_verify,
                alpn: vec![],
            };
            let (wrapped, _alpn) = tls::wrap_client(stream, &config).await?;
            stream = wrapped;
        }

        let target = metadata.remote_address();
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", target, target);
        if self.requires_auth() {
            request.push_str(&format!("Proxy-Authorization: {}\r\n", self.encode_auth()));
        }
        request.push_str("\r\n");
        stream.write_all(request.as_bytes()).await?;

        let mut reader = BufReader::new(stream);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await?;

        let status = response_line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u16>().ok())
            .ok_or_else(|| Error::Protocol("invalid HTTP response".into()))?;
        if status != 200 {
            return Err(Error::Dial(format!(
                "HTTP CONNECT failed: {}",
                response_line.trim()
            )));
        }

        // Drain the remaining response headers
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).await?;
            if line.trim().is_empty() {
                break;
            }
        }

        Ok(Box::new(reader))
    }
}
