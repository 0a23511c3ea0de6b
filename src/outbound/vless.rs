//! VLESS client outbound
//!
//! VMess's stripped-down sibling: no payload encryption of its own, a
//! one-byte version plus UUID header, TLS supplied by the carrier.

use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use uuid::Uuid;

use crate::common::{Metadata, Network, Result, Stream};
use crate::error::Error;
use crate::tls as fingerprint;
use crate::transport::{grpc, tcp, ws, GrpcConfig, TlsConfig, WsConfig};

use super::{server_addr, OutboundAdapter, ProxyKind, VlessOption};

const VLESS_VERSION: u8 = 0x00;

const CMD_TCP: u8 = 0x01;
const CMD_UDP: u8 = 0x02;

// VLESS address types differ from SOCKS5
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x02;
const ATYP_IPV6: u8 = 0x03;

/// VLESS proxy client
pub struct VlessAdapter {
    option: VlessOption,
    uuid: Uuid,
}

impl VlessAdapter {
    pub fn new(option: VlessOption) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "vless proxy {}: missing server",
                option.name
            )));
        }
        let uuid = Uuid::parse_str(&option.uuid)
            .map_err(|e| Error::Config(format!("vless proxy {}: bad uuid: {e}", option.name)))?;
        match option.network.as_str() {
            "" | "tcp" | "ws" | "grpc" => {}
            other => {
                return Err(Error::Config(format!(
                    "vless proxy {}: unsupported network {}",
                    option.name, other
                )))
            }
        }
        Ok(Self { option, uuid })
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

    fn build_request(&self, metadata: &Metadata) -> Vec<u8> {
        let mut request = Vec::with_capacity(128);
        request.push(VLESS_VERSION);
        request.extend_from_slice(self.uuid.as_bytes());
        request.push(0); // no addons
        request.push(match metadata.network {
            Network::Tcp => CMD_TCP,
            Network::Udp => CMD_UDP,
        });
        request.extend_from_slice(&metadata.dst_port.to_be_bytes());

        if !metadata.host.is_empty() {
            request.push(ATYP_DOMAIN);
            request.push(metadata.host.len() as u8);
            request.extend_from_slice(metadata.host.as_bytes());
        } else {
            match metadata.dst_ip {
                Some(IpAddr::V4(ip)) => {
                    request.push(ATYP_IPV4);
                    request.extend_from_slice(&ip.octets());
                }
                Some(IpAddr::V6(ip)) => {
                    request.push(ATYP_IPV6);
                    request.extend_from_slice(&ip.octets());
                }
                None => {
                    request.push(ATYP_IPV4);
                    request.extend_from_slice(&[0, 0, 0, 0]);
                }
            }
        }

        request
    }
}

#[async_trait]
impl OutboundAdapter for VlessAdapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Vless
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

        Ok(Box::new(VlessStream::new(stream)))
    }
}

// ============================================================================
// Response header stripping
// ============================================================================

enum ResponseState {
    /// version byte + addons length
    Head { buf: [u8; 2], pos: usize },
    /// addons payload to discard
    Addons { remain: usize },
    Done,
}

/// Strips the server's `version + addons` preamble off the first read
struct VlessStream {
    inner: Stream,
    state: ResponseState,
}

impl VlessStream {
    fn new(inner: Stream) -> Self {
        Self {
            inner,
            state: ResponseState::Head {
                buf: [0u8; 2],
                pos: 0,
            },
        }
    }
}

impl AsyncRead for VlessStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                ResponseState::Head { buf: head, pos } => {
                    let mut temp = ReadBuf::new(&mut head[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed before response header",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    if *pos < 2 {
                        continue;
                    }
                    let addons = head[1] as usize;
                    this.state = if addons > 0 {
                        ResponseState::Addons { remain: addons }
                    } else {
                        ResponseState::Done
                    };
                }

                ResponseState::Addons { remain } => {
                    let mut scratch = [0u8; 256];
                    let want = (*remain).min(scratch.len());
                    let mut temp = ReadBuf::new(&mut scratch[..want]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "connection closed inside addons",
                                )));
                            }
                            *remain -= n;
                            if *remain == 0 {
                                this.state = ResponseState::Done;
                            }
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }

                ResponseState::Done => return Pin::new(&mut this.inner).poll_read(cx, buf),
            }
        }
    }
}

impl AsyncWrite for VlessStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Address, ConnKind};
    use tokio::io::AsyncReadExt;

    fn adapter() -> VlessAdapter {
        VlessAdapter::new(VlessOption {
            name: "v1".into(),
            server: "server.example".into(),
            port: 443,
            uuid: "b831381d-6324-4d53-ad4f-8cda48b30811".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_request_layout() {
        let metadata = Metadata::new(Network::Tcp, ConnKind::Socks5)
            .with_destination(&Address::domain("example.com", 443));
        let request = adapter().build_request(&metadata);

        assert_eq!(request[0], VLESS_VERSION);
        assert_eq!(request[17], 0); // addons length
        assert_eq!(request[18], CMD_TCP);
        assert_eq!(&request[19..21], &443u16.to_be_bytes());
        assert_eq!(request[21], ATYP_DOMAIN);
        assert_eq!(request[22] as usize, "example.com".len());
    }

    #[test]
    fn test_rejects_bad_uuid() {
        let result = VlessAdapter::new(VlessOption {
            name: "v1".into(),
            server: "server.example".into(),
            uuid: "not-a-uuid".into(),
            ..Default::default()
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_response_header_stripped() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut stream = VlessStream::new(Box::new(client));

        // version 0, addons len 3, addons, then payload
        server.write_all(&[0x00, 0x03, 1, 2, 3]).await.unwrap();
        server.write_all(b"payload").await.unwrap();

        let mut out = vec![0u8; 7];
        stream.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"payload");
    }
}
