//! SOCKS4/4a and SOCKS5 inbound handshakes

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::common::{Address, BufferedStream, ConnContext, ConnKind, Result};
use crate::error::Error;

use super::{new_context, Addition, UserPass};

pub const SOCKS4_VERSION: u8 = 0x04;
pub const SOCKS5_VERSION: u8 = 0x05;

const AUTH_NONE: u8 = 0x00;
const AUTH_PASSWORD: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_GRANTED: u8 = 0x5A;
const SOCKS4_REJECTED: u8 = 0x5B;

/// Serve a SOCKS4/4a CONNECT and hand the context to the tunnel.
pub async fn handle_socks4(
    mut stream: BufferedStream,
    tcp_in: &UnboundedSender<ConnContext>,
    source: Option<SocketAddr>,
    local: Option<SocketAddr>,
    additions: &[Addition],
) -> Result<()> {
    // VN CD DSTPORT(2) DSTIP(4)
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;

    if header[0] != SOCKS4_VERSION {
        return Err(Error::Protocol("not a SOCKS4 request".into()));
    }
    let command = header[1];
    let port = u16::from_be_bytes([header[2], header[3]]);
    let ip = Ipv4Addr::new(header[4], header[5], header[6], header[7]);

    // userid, NUL-terminated
    read_until_nul(&mut stream).await?;

    if command != CMD_CONNECT {
        let reply = [0x00, SOCKS4_REJECTED, 0, 0, 0, 0, 0, 0];
        stream.write_all(&reply).await?;
        return Err(Error::Protocol(format!(
            "SOCKS4 command {} not supported",
            command
        )));
    }

    // 4a marks a trailing hostname with a 0.0.0.x destination
    let octets = ip.octets();
    let target = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
        let raw = read_until_nul(&mut stream).await?;
        let domain = String::from_utf8(raw)
            .map_err(|_| Error::BadAddress("non-UTF8 SOCKS4a hostname".into()))?;
        Address::domain(domain, port)
    } else {
        Address::ip_port(ip.into(), port)
    };

    let mut reply = [0u8; 8];
    reply[1] = SOCKS4_GRANTED;
    reply[2..4].copy_from_slice(&header[2..4]);
    reply[4..8].copy_from_slice(&header[4..8]);
    stream.write_all(&reply).await?;
    stream.flush().await?;

    debug!("[SOCKS4] accepted CONNECT to {}", target);
    let context = new_context(ConnKind::Socks4, &target, source, local, stream, additions);
    tcp_in
        .send(context)
        .map_err(|_| Error::Closed)
}

/// Serve a SOCKS5 CONNECT and hand the context to the tunnel.
pub async fn handle_socks5(
    mut stream: BufferedStream,
    tcp_in: &UnboundedSender<ConnContext>,
    authentication: Option<&UserPass>,
    source: Option<SocketAddr>,
    local: Option<SocketAddr>,
    additions: &[Addition],
) -> Result<()> {
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS5_VERSION {
        return Err(Error::Protocol(format!(
            "unsupported SOCKS version: {}",
            head[0]
        )));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let selected = match authentication {
        Some(_) if methods.contains(&AUTH_PASSWORD) => AUTH_PASSWORD,
        Some(_) => AUTH_NO_ACCEPTABLE,
        None if methods.contains(&AUTH_NONE) => AUTH_NONE,
        None => AUTH_NO_ACCEPTABLE,
    };
    stream.write_all(&[SOCKS5_VERSION, selected]).await?;

    if selected == AUTH_NO_ACCEPTABLE {
        return Err(Error::Protocol("no acceptable auth method".into()));
    }

    if selected == AUTH_PASSWORD {
        if let Some(expected) = authentication {
            verify_password(&mut stream, expected).await?;
        }
    }

    // Request: VER CMD RSV ATYP ...
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != SOCKS5_VERSION {
        return Err(Error::Protocol("invalid SOCKS version in request".into()));
    }

    let target = match read_address(&mut stream, header[3]).await {
        Ok(addr) => addr,
        Err(e) => {
            reply(&mut stream, REP_ATYP_NOT_SUPPORTED).await?;
            return Err(e);
        }
    };

    // CONNECT only for TCP
    if header[1] != CMD_CONNECT {
        reply(&mut stream, REP_CMD_NOT_SUPPORTED).await?;
        return Err(Error::Protocol(format!(
            "SOCKS5 command {} not supported",
            header[1]
        )));
    }

    reply(&mut stream, REP_SUCCESS).await?;

    debug!("[SOCKS5] accepted CONNECT to {}", target);
    let context = new_context(ConnKind::Socks5, &target, source, local, stream, additions);
    tcp_in
        .send(context)
        .map_err(|_| Error::Closed)
}

async fn verify_password(stream: &mut BufferedStream, expected: &UserPass) -> Result<()> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    if version[0] != 0x01 {
        return Err(Error::Protocol("invalid auth sub-negotiation version".into()));
    }

    let mut len = [0u8; 1];
    stream.read_exact(&mut len).await?;
    let mut username = vec![0u8; len[0] as usize];
    stream.read_exact(&mut username).await?;

    stream.read_exact(&mut len).await?;
    let mut password = vec![0u8; len[0] as usize];
    stream.read_exact(&mut password).await?;

    let ok = expected.username.as_bytes() == username.as_slice()
        && expected.password.as_bytes() == password.as_slice();

    if ok {
        stream.write_all(&[0x01, 0x00]).await?;
        Ok(())
    } else {
        stream.write_all(&[0x01, 0x01]).await?;
        Err(Error::Protocol("authentication failed".into()))
    }
}

async fn read_address(stream: &mut BufferedStream, atyp: u8) -> Result<Address> {
    match atyp {
        ATYP_IPV4 => {
            let mut buf = [0u8; 6];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            Ok(Address::ip_port(
                Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]).into(),
                port,
            ))
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut buf = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut buf).await?;
            let port = u16::from_be_bytes([buf[buf.len() - 2], buf[buf.len() - 1]]);
            let domain = String::from_utf8_lossy(&buf[..buf.len() - 2]).to_string();
            Ok(Address::domain(domain, port))
        }
        ATYP_IPV6 => {
            let mut buf = [0u8; 18];
            stream.read_exact(&mut buf).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            Ok(Address::ip_port(Ipv6Addr::from(octets).into(), port))
        }
        other => Err(Error::BadAddress(format!("unknown address type {other}"))),
    }
}

async fn reply(stream: &mut BufferedStream, code: u8) -> Result<()> {
    let reply = [
        SOCKS5_VERSION,
        code,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_until_nul(stream: &mut BufferedStream) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() >= 255 {
            return Err(Error::Protocol("SOCKS4 field too long".into()));
        }
        out.push(byte[0]);
    }
}
