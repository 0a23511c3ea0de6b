//! Per-kind option decoders
//!
//! Each decoder pulls its typed record out of a normalized option map.
//! Kinds that terminate in TLS (vmess, vless, trojan) inherit the
//! process-wide fingerprint when the entry does not set one.

use crate::error::{Error, Result};
use crate::outbound::{
    GrpcOpts, H2Opts, HttpOption, HttpOpts, HysteriaOption, ProxyDescriptor, ShadowsocksOption,
    ShadowsocksROption, SnellOption, Socks5Option, TrojanOption, TuicOption, VlessOption,
    VmessOption, WireGuardOption, WsOpts,
};
use crate::tls::{global_fingerprint, have_global_fingerprint};

use super::value::Options;

/// Decode one untyped proxy mapping into a typed descriptor.
pub fn decode_descriptor(value: &serde_json::Value) -> Result<ProxyDescriptor> {
    let opts = Options::from_value(value)?;
    let kind = opts
        .string("type")
        .ok_or_else(|| Error::Config("missing type".into()))?;

    match kind.as_str() {
        "ss" => decode_shadowsocks(&opts).map(ProxyDescriptor::Shadowsocks),
        "ssr" => decode_shadowsocks_r(&opts).map(ProxyDescriptor::ShadowsocksR),
        "socks5" => decode_socks5(&opts).map(ProxyDescriptor::Socks5),
        "http" => decode_http(&opts).map(ProxyDescriptor::Http),
        "vmess" => decode_vmess(&opts).map(ProxyDescriptor::Vmess),
        "vless" => decode_vless(&opts).map(ProxyDescriptor::Vless),
        "snell" => decode_snell(&opts).map(ProxyDescriptor::Snell),
        "trojan" => decode_trojan(&opts).map(ProxyDescriptor::Trojan),
        "hysteria" => decode_hysteria(&opts).map(ProxyDescriptor::Hysteria),
        "wireguard" => decode_wireguard(&opts).map(ProxyDescriptor::WireGuard),
        "tuic" => decode_tuic(&opts).map(ProxyDescriptor::Tuic),
        other => Err(Error::UnsupportedKind(other.to_string())),
    }
}

/// The global fingerprint substitutes for an empty per-entry one
fn effective_fingerprint(opts: &Options) -> String {
    let own = opts.string_or("client-fingerprint", "");
    if own.is_empty() && have_global_fingerprint() {
        global_fingerprint()
    } else {
        own
    }
}

fn decode_ws_opts(opts: &Options) -> WsOpts {
    match opts.object("ws-opts") {
        Some(ws) => WsOpts {
            path: ws.string_or("path", ""),
            headers: ws.string_map("headers").unwrap_or_default(),
            max_early_data: ws.integer("max-early-data").unwrap_or(0).max(0) as usize,
            early_data_header_name: ws.string_or("early-data-header-name", ""),
        },
        None => WsOpts::default(),
    }
}

fn decode_grpc_opts(opts: &Options) -> GrpcOpts {
    match opts.object("grpc-opts") {
        Some(grpc) => GrpcOpts {
            grpc_service_name: grpc.string_or("grpc-service-name", ""),
        },
        None => GrpcOpts::default(),
    }
}

fn decode_http_opts(opts: &Options) -> HttpOpts {
    match opts.object("http-opts") {
        Some(http) => HttpOpts {
            method: http.string_or("method", "GET"),
            path: http
                .string_list("path")
                .unwrap_or_else(|| vec!["/".to_string()]),
            headers: http.string_list_map("headers").unwrap_or_default(),
        },
        None => HttpOpts {
            method: "GET".to_string(),
            path: vec!["/".to_string()],
            headers: Default::default(),
        },
    }
}

fn decode_h2_opts(opts: &Options) -> H2Opts {
    match opts.object("h2-opts") {
        Some(h2) => H2Opts {
            host: h2.string_list("host").unwrap_or_default(),
            path: h2
                .string_list("path")
                .unwrap_or_else(|| vec!["/".to_string()]),
        },
        None => H2Opts::default(),
    }
}

fn decode_shadowsocks(opts: &Options) -> Result<ShadowsocksOption> {
    Ok(ShadowsocksOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "ss")?,
        port: opts.port("port", "ss")?,
        cipher: opts.require_string("cipher", "ss")?,
        password: opts.require_string("password", "ss")?,
        udp: opts.boolean_or("udp", false),
    })
}

fn decode_shadowsocks_r(opts: &Options) -> Result<ShadowsocksROption> {
    Ok(ShadowsocksROption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "ssr")?,
        port: opts.port("port", "ssr")?,
        cipher: opts.require_string("cipher", "ssr")?,
        password: opts.require_string("password", "ssr")?,
        obfs: opts.string_or("obfs", ""),
        obfs_param: opts.string_or("obfs-param", ""),
        protocol: opts.string_or("protocol", ""),
        protocol_param: opts.string_or("protocol-param", ""),
        udp: opts.boolean_or("udp", false),
    })
}

fn decode_socks5(opts: &Options) -> Result<Socks5Option> {
    Ok(Socks5Option {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "socks5")?,
        port: opts.port("port", "socks5")?,
        username: opts.string_or("username", ""),
        password: opts.string_or("password", ""),
        tls: opts.boolean_or("tls", false),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        udp: opts.boolean_or("udp", false),
    })
}

fn decode_http(opts: &Options) -> Result<HttpOption> {
    Ok(HttpOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "http")?,
        port: opts.port("port", "http")?,
        username: opts.string_or("username", ""),
        password: opts.string_or("password", ""),
        tls: opts.boolean_or("tls", false),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        sni: opts.string_or("sni", ""),
    })
}

fn decode_vmess(opts: &Options) -> Result<VmessOption> {
    Ok(VmessOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "vmess")?,
        port: opts.port("port", "vmess")?,
        uuid: opts.require_string("uuid", "vmess")?,
        alter_id: opts.integer("alterId").unwrap_or(0).max(0) as u16,
        cipher: opts.string_or("cipher", "auto"),
        udp: opts.boolean_or("udp", false),
        tls: opts.boolean_or("tls", false),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        servername: opts.string_or("servername", ""),
        network: opts.string_or("network", ""),
        client_fingerprint: effective_fingerprint(opts),
        http_opts: decode_http_opts(opts),
        h2_opts: decode_h2_opts(opts),
        ws_opts: decode_ws_opts(opts),
        grpc_opts: decode_grpc_opts(opts),
        packet_addr: opts.boolean_or("packet-addr", false),
        xudp: opts.boolean_or("xudp", false),
    })
}

fn decode_vless(opts: &Options) -> Result<VlessOption> {
    Ok(VlessOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "vless")?,
        port: opts.port("port", "vless")?,
        uuid: opts.require_string("uuid", "vless")?,
        flow: opts.string_or("flow", ""),
        udp: opts.boolean_or("udp", false),
        tls: opts.boolean_or("tls", false),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        servername: opts.string_or("servername", ""),
        network: opts.string_or("network", ""),
        client_fingerprint: effective_fingerprint(opts),
        http_opts: decode_http_opts(opts),
        h2_opts: decode_h2_opts(opts),
        ws_opts: decode_ws_opts(opts),
        grpc_opts: decode_grpc_opts(opts),
        packet_addr: opts.boolean_or("packet-addr", false),
        xudp: opts.boolean_or("xudp", false),
    })
}

fn decode_snell(opts: &Options) -> Result<SnellOption> {
    Ok(SnellOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "snell")?,
        port: opts.port("port", "snell")?,
        psk: opts.require_string("psk", "snell")?,
        version: opts.integer("version").unwrap_or(2).max(0) as u16,
        obfs_opts: opts.string_map("obfs-opts").unwrap_or_default(),
    })
}

fn decode_trojan(opts: &Options) -> Result<TrojanOption> {
    Ok(TrojanOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "trojan")?,
        port: opts.port("port", "trojan")?,
        password: opts.require_string("password", "trojan")?,
        alpn: opts.string_list("alpn").unwrap_or_default(),
        sni: opts.string_or("sni", ""),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        udp: opts.boolean_or("udp", false),
        network: opts.string_or("network", ""),
        client_fingerprint: effective_fingerprint(opts),
        ws_opts: decode_ws_opts(opts),
        grpc_opts: decode_grpc_opts(opts),
    })
}

fn decode_hysteria(opts: &Options) -> Result<HysteriaOption> {
    Ok(HysteriaOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "hysteria")?,
        port: opts.port("port", "hysteria")?,
        protocol: opts.string_or("protocol", ""),
        up: opts.string_or("up", ""),
        down: opts.string_or("down", ""),
        auth_str: opts.string_or("auth-str", ""),
        obfs: opts.string_or("obfs", ""),
        sni: opts.string_or("sni", ""),
        skip_cert_verify: opts.boolean_or("skip-cert-verify", false),
        alpn: opts.string_list("alpn").unwrap_or_default(),
    })
}

fn decode_wireguard(opts: &Options) -> Result<WireGuardOption> {
    Ok(WireGuardOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "wireguard")?,
        port: opts.port("port", "wireguard")?,
        private_key: opts.require_string("private-key", "wireguard")?,
        public_key: opts.require_string("public-key", "wireguard")?,
        preshared_key: opts.string_or("preshared-key", ""),
        ip: opts.string_or("ip", ""),
        ipv6: opts.string_or("ipv6", ""),
        mtu: opts.integer("mtu").unwrap_or(0).max(0) as u16,
        udp: opts.boolean_or("udp", false),
    })
}

fn decode_tuic(opts: &Options) -> Result<TuicOption> {
    Ok(TuicOption {
        name: opts.string_or("name", ""),
        server: opts.require_string("server", "tuic")?,
        port: opts.port("port", "tuic")?,
        uuid: opts.string_or("uuid", ""),
        token: opts.string_or("token", ""),
        alpn: opts.string_list("alpn").unwrap_or_default(),
        udp_relay_mode: opts.string_or("udp-relay-mode", ""),
        congestion_controller: opts.string_or("congestion-controller", ""),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_type() {
        let err = decode_descriptor(&json!({"server": "a"})).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_unknown_kind() {
        let err = decode_descriptor(&json!({"type": "warp"})).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind(_)));
    }

    #[test]
    fn test_ss_decode_weak_types() {
        let descriptor = decode_descriptor(&json!({
            "type": "ss",
            "name": "node",
            "server": "s.example",
            "port": "8388",
            "cipher": "aes-128-gcm",
            "password": 12345,
            "udp": 1,
        }))
        .unwrap();

        match descriptor {
            ProxyDescriptor::Shadowsocks(o) => {
                assert_eq!(o.port, 8388);
                assert_eq!(o.password, "12345");
                assert!(o.udp);
            }
            other => panic!("wrong kind: {:?}", other.kind()),
        }
    }

    #[test]
    fn test_missing_mandatory_field_reports_name() {
        let err = decode_descriptor(&json!({
            "type": "trojan",
            "name": "t",
            "server": "s.example",
            "port": 443,
        }))
        .unwrap_err();
        assert!(err.to_string().contains("password"));
    }

    #[test]
    fn test_vmess_defaults() {
        let descriptor = decode_descriptor(&json!({
            "type": "vmess",
            "name": "v",
            "server": "s.example",
            "port": 443,
            "uuid": "b831381d-6324-4d53-ad4f-8cda48b30811",
        }))
        .unwrap();

        match descriptor {
            ProxyDescriptor::Vmess(o) => {
                assert_eq!(o.cipher, "auto");
                assert_eq!(o.http_opts.method, "GET");
                assert_eq!(o.http_opts.path, vec!["/".to_string()]);
            }
            other => panic!("wrong kind: {:?}", other.kind()),
        }
    }
}
