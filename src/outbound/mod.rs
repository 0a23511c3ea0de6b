//! Outbound adapters
//!
//! A descriptor is an immutable, typed record produced by the config
//! decoder; the factory turns it into an adapter that can open forwarding
//! streams. Dispatch is a closed sum over the supported kinds.

mod direct;
mod http;
mod shadowsocks;
mod socks5;
mod trojan;
mod vless;
pub mod vmess;

pub use direct::DirectAdapter;
pub use http::HttpAdapter;
pub use shadowsocks::ShadowsocksAdapter;
pub use socks5::Socks5Adapter;
pub use trojan::TrojanAdapter;
pub use vless::VlessAdapter;
pub use vmess::VmessAdapter;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;

/// Kind tag of an outbound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyKind {
    Direct,
    Shadowsocks,
    ShadowsocksR,
    Socks5,
    Http,
    Vmess,
    Vless,
    Snell,
    Trojan,
    Hysteria,
    WireGuard,
    Tuic,
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Direct => write!(f, "Direct"),
            ProxyKind::Shadowsocks => write!(f, "Shadowsocks"),
            ProxyKind::ShadowsocksR => write!(f, "ShadowsocksR"),
            ProxyKind::Socks5 => write!(f, "Socks5"),
            ProxyKind::Http => write!(f, "Http"),
            ProxyKind::Vmess => write!(f, "Vmess"),
            ProxyKind::Vless => write!(f, "Vless"),
            ProxyKind::Snell => write!(f, "Snell"),
            ProxyKind::Trojan => write!(f, "Trojan"),
            ProxyKind::Hysteria => write!(f, "Hysteria"),
            ProxyKind::WireGuard => write!(f, "WireGuard"),
            ProxyKind::Tuic => write!(f, "Tuic"),
        }
    }
}

/// An outbound capable of opening forwarding streams
#[async_trait]
pub trait OutboundAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ProxyKind;
    /// Remote server endpoint, empty for direct-style outbounds
    fn addr(&self) -> String;
    fn supports_udp(&self) -> bool;

    /// Open a forwarding stream for the destination in `metadata`.
    async fn dial(&self, metadata: &Metadata) -> Result<Stream>;
}

// ============================================================================
// Transport option records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpOpts {
    pub method: String,
    pub path: Vec<String>,
    pub headers: HashMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct H2Opts {
    pub host: Vec<String>,
    pub path: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WsOpts {
    pub path: String,
    pub headers: HashMap<String, String>,
    pub max_early_data: usize,
    pub early_data_header_name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrpcOpts {
    pub grpc_service_name: String,
}

// ============================================================================
// Per-kind descriptors
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowsocksOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub cipher: String,
    pub password: String,
    pub udp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShadowsocksROption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub cipher: String,
    pub password: String,
    pub obfs: String,
    pub obfs_param: String,
    pub protocol: String,
    pub protocol_param: String,
    pub udp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Socks5Option {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub skip_cert_verify: bool,
    pub udp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub skip_cert_verify: bool,
    pub sni: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VmessOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub alter_id: u16,
    pub cipher: String,
    pub udp: bool,
    pub tls: bool,
    pub skip_cert_verify: bool,
    pub servername: String,
    pub network: String,
    pub client_fingerprint: String,
    pub http_opts: HttpOpts,
    pub h2_opts: H2Opts,
    pub ws_opts: WsOpts,
    pub grpc_opts: GrpcOpts,
    pub packet_addr: bool,
    pub xudp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VlessOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub flow: String,
    pub udp: bool,
    pub tls: bool,
    pub skip_cert_verify: bool,
    pub servername: String,
    pub network: String,
    pub client_fingerprint: String,
    pub http_opts: HttpOpts,
    pub h2_opts: H2Opts,
    pub ws_opts: WsOpts,
    pub grpc_opts: GrpcOpts,
    pub packet_addr: bool,
    pub xudp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnellOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub psk: String,
    pub version: u16,
    pub obfs_opts: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrojanOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub password: String,
    pub alpn: Vec<String>,
    pub sni: String,
    pub skip_cert_verify: bool,
    pub udp: bool,
    pub network: String,
    pub client_fingerprint: String,
    pub ws_opts: WsOpts,
    pub grpc_opts: GrpcOpts,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HysteriaOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub protocol: String,
    pub up: String,
    pub down: String,
    pub auth_str: String,
    pub obfs: String,
    pub sni: String,
    pub skip_cert_verify: bool,
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireGuardOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub private_key: String,
    pub public_key: String,
    pub preshared_key: String,
    pub ip: String,
    pub ipv6: String,
    pub mtu: u16,
    pub udp: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuicOption {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub uuid: String,
    pub token: String,
    pub alpn: Vec<String>,
    pub udp_relay_mode: String,
    pub congestion_controller: String,
}

/// Tagged descriptor over the supported kinds
#[derive(Debug, Clone, PartialEq)]
pub enum ProxyDescriptor {
    Shadowsocks(ShadowsocksOption),
    ShadowsocksR(ShadowsocksROption),
    Socks5(Socks5Option),
    Http(HttpOption),
    Vmess(VmessOption),
    Vless(VlessOption),
    Snell(SnellOption),
    Trojan(TrojanOption),
    Hysteria(HysteriaOption),
    WireGuard(WireGuardOption),
    Tuic(TuicOption),
}

impl ProxyDescriptor {
    pub fn kind(&self) -> ProxyKind {
        match self {
            ProxyDescriptor::Shadowsocks(_) => ProxyKind::Shadowsocks,
            ProxyDescriptor::ShadowsocksR(_) => ProxyKind::ShadowsocksR,
            ProxyDescriptor::Socks5(_) => ProxyKind::Socks5,
            ProxyDescriptor::Http(_) => ProxyKind::Http,
            ProxyDescriptor::Vmess(_) => ProxyKind::Vmess,
            ProxyDescriptor::Vless(_) => ProxyKind::Vless,
            ProxyDescriptor::Snell(_) => ProxyKind::Snell,
            ProxyDescriptor::Trojan(_) => ProxyKind::Trojan,
            ProxyDescriptor::Hysteria(_) => ProxyKind::Hysteria,
            ProxyDescriptor::WireGuard(_) => ProxyKind::WireGuard,
            ProxyDescriptor::Tuic(_) => ProxyKind::Tuic,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ProxyDescriptor::Shadowsocks(o) => &o.name,
            ProxyDescriptor::ShadowsocksR(o) => &o.name,
            ProxyDescriptor::Socks5(o) => &o.name,
            ProxyDescriptor::Http(o) => &o.name,
            ProxyDescriptor::Vmess(o) => &o.name,
            ProxyDescriptor::Vless(o) => &o.name,
            ProxyDescriptor::Snell(o) => &o.name,
            ProxyDescriptor::Trojan(o) => &o.name,
            ProxyDescriptor::Hysteria(o) => &o.name,
            ProxyDescriptor::WireGuard(o) => &o.name,
            ProxyDescriptor::Tuic(o) => &o.name,
        }
    }
}

/// Instantiate a stream-opening adapter for a descriptor.
///
/// Kinds whose wire protocols are not carried by this core are rejected
/// here; the error surfaces to the configuration caller and skips the
/// entry without aborting the run.
pub fn new_adapter(descriptor: ProxyDescriptor) -> Result<Arc<dyn OutboundAdapter>> {
    match descriptor {
        ProxyDescriptor::Shadowsocks(option) => {
            Ok(Arc::new(ShadowsocksAdapter::new(option)?))
        }
        ProxyDescriptor::Socks5(option) => Ok(Arc::new(Socks5Adapter::new(option)?)),
        ProxyDescriptor::Http(option) => Ok(Arc::new(HttpAdapter::new(option)?)),
        ProxyDescriptor::Vmess(option) => Ok(Arc::new(VmessAdapter::new(option)?)),
        ProxyDescriptor::Vless(option) => Ok(Arc::new(VlessAdapter::new(option)?)),
        ProxyDescriptor::Trojan(option) => Ok(Arc::new(TrojanAdapter::new(option)?)),
        other => Err(Error::UnsupportedKind(format!(
            "{} outbound is not supported",
            other.kind()
        ))),
    }
}

/// Shared helper: the server endpoint string adapters report via `addr()`
pub(crate) fn server_addr(server: &str, port: u16) -> String {
    format!("{}:{}", server, port)
}
