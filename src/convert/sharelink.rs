//! VMessAEAD / VLESS share-link decoding
//!
//! Follows the Xray share-link convention: scheme picks the kind, the
//! userinfo is the UUID, query parameters carry TLS and transport options.
//! A decoded link becomes the same untyped map the config decoder
//! consumes, so both surfaces produce identical descriptors.

use std::collections::HashMap;

use percent_encoding::percent_decode_str;
use rand::seq::SliceRandom;
use serde_json::{json, Map, Value};
use url::form_urlencoded;

use crate::error::{Error, Result};
use crate::outbound::ProxyDescriptor;

use super::options::decode_descriptor;

/// Deduplicate display names: the first use stays bare, later uses get a
/// `-N` suffix with N counting up from 1.
pub fn unique_name(names: &mut HashMap<String, usize>, name: &str) -> String {
    match names.get_mut(name) {
        Some(index) => {
            *index += 1;
            format!("{}-{}", name, index)
        }
        None => {
            names.insert(name.to_string(), 0);
            name.to_string()
        }
    }
}

/// A plausible browser User-Agent for WebSocket headers
pub fn rand_user_agent() -> String {
    const VERSIONS: &[&str] = &["122.0.0.0", "123.0.0.0", "124.0.0.0", "125.0.0.0"];
    let version = VERSIONS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("124.0.0.0");
    format!(
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
         (KHTML, like Gecko) Chrome/{version} Safari/537.36"
    )
}

struct RawLink {
    scheme: String,
    userinfo: String,
    host: String,
    port: Option<String>,
    query: Vec<(String, String)>,
    fragment: String,
}

/// Split a share link into its raw pieces without rejecting odd ports.
fn split_link(link: &str) -> Result<RawLink> {
    let (scheme, rest) = link
        .split_once("://")
        .ok_or_else(|| Error::ShareLink(format!("not a share link: {link}")))?;

    let (rest, fragment) = match rest.split_once('#') {
        Some((r, f)) => (r, percent_decode_str(f).decode_utf8_lossy().into_owned()),
        None => (rest, String::new()),
    };

    let (authority, query) = match rest.split_once('?') {
        Some((a, q)) => (
            a,
            form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
        ),
        None => (rest, Vec::new()),
    };

    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((u, h)) => (percent_decode_str(u).decode_utf8_lossy().into_owned(), h),
        None => (String::new(), authority),
    };

    // Bracketed IPv6 hosts keep their colons
    let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
        match rest.split_once(']') {
            Some((v6, port_part)) => (
                v6.to_string(),
                port_part.strip_prefix(':').map(str::to_string),
            ),
            None => (hostport.to_string(), None),
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), Some(p.to_string())),
            None => (hostport.to_string(), None),
        }
    };

    Ok(RawLink {
        scheme: scheme.to_lowercase(),
        userinfo,
        host,
        port,
        query,
        fragment,
    })
}

/// Decode a vmess:// or vless:// share link into a descriptor.
///
/// `names` is the caller-supplied uniquification table, shared across a
/// whole subscription list.
pub fn parse_share_link(
    link: &str,
    names: &mut HashMap<String, usize>,
) -> Result<ProxyDescriptor> {
    let raw = split_link(link)?;

    match raw.scheme.as_str() {
        "vmess" | "vless" => {}
        other => return Err(Error::ShareLink(format!("unsupported scheme: {other}"))),
    }
    if raw.host.is_empty() {
        return Err(Error::ShareLink("empty host".into()));
    }

    let query: HashMap<&str, &str> = raw
        .query
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    let get = |key: &str| query.get(key).copied().unwrap_or("");

    // Port falls back to 443 when absent or unparseable
    let port: u16 = raw
        .port
        .as_deref()
        .and_then(|p| p.parse().ok())
        .unwrap_or(443);

    let mut proxy = Map::new();
    proxy.insert("name".into(), json!(unique_name(names, &raw.fragment)));
    proxy.insert("type".into(), json!(raw.scheme));
    proxy.insert("server".into(), json!(raw.host));
    proxy.insert("port".into(), json!(port));
    proxy.insert("uuid".into(), json!(raw.userinfo));
    proxy.insert("udp".into(), json!(true));
    proxy.insert("skip-cert-verify".into(), json!(false));
    proxy.insert("tls".into(), json!(false));

    let security = get("security").to_lowercase();
    if matches!(security.as_str(), "tls" | "reality" | "xtls") {
        proxy.insert("tls".into(), json!(true));
        let fingerprint = get("fp");
        if fingerprint.is_empty() {
            proxy.insert("client-fingerprint".into(), json!("chrome"));
        } else {
            proxy.insert("client-fingerprint".into(), json!(fingerprint));
        }
    }
    if !get("sni").is_empty() {
        proxy.insert("servername".into(), json!(get("sni")));
    }

    match get("packetEncoding") {
        "none" => {}
        "packet" => {
            proxy.insert("packet-addr".into(), json!(true));
        }
        _ => {
            proxy.insert("xudp".into(), json!(true));
        }
    }

    let mut network = get("type").to_lowercase();
    if network.is_empty() {
        network = "tcp".into();
    }
    let fake_type = get("headerType").to_lowercase();
    if fake_type == "http" {
        network = "http".into();
    } else if network == "http" {
        network = "h2".into();
    }
    proxy.insert("network".into(), json!(network));

    match network.as_str() {
        "tcp" => {
            if fake_type != "none" {
                let mut headers = Map::new();
                let mut http_opts = Map::new();
                http_opts.insert("path".into(), json!(["/"]));

                if !get("host").is_empty() {
                    headers.insert("Host".into(), json!([get("host")]));
                }
                if !get("method").is_empty() {
                    http_opts.insert("method".into(), json!(get("method")));
                }
                if !get("path").is_empty() {
                    http_opts.insert("path".into(), json!([get("path")]));
                }
                http_opts.insert("headers".into(), Value::Object(headers));
                proxy.insert("http-opts".into(), Value::Object(http_opts));
            }
        }

        "http" => {
            let mut h2_opts = Map::new();
            h2_opts.insert("path".into(), json!(["/"]));
            if !get("path").is_empty() {
                h2_opts.insert("path".into(), json!([get("path")]));
            }
            if !get("host").is_empty() {
                h2_opts.insert("host".into(), json!([get("host")]));
            }
            proxy.insert("h2-opts".into(), Value::Object(h2_opts));
        }

        "ws" => {
            let mut headers = Map::new();
            headers.insert("User-Agent".into(), json!(rand_user_agent()));
            headers.insert("Host".into(), json!(get("host")));
            let mut ws_opts = Map::new();
            ws_opts.insert("path".into(), json!(get("path")));
            ws_opts.insert("headers".into(), Value::Object(headers));

            if !get("ed").is_empty() {
                let med: i64 = get("ed").parse().map_err(|_| {
                    Error::ShareLink(format!("bad WebSocket max early data size: {}", get("ed")))
                })?;
                ws_opts.insert("max-early-data".into(), json!(med));
            }
            if !get("eh").is_empty() {
                ws_opts.insert("early-data-header-name".into(), json!(get("eh")));
            }

            proxy.insert("ws-opts".into(), Value::Object(ws_opts));
        }

        "grpc" => {
            let mut grpc_opts = Map::new();
            grpc_opts.insert("grpc-service-name".into(), json!(get("serviceName")));
            proxy.insert("grpc-opts".into(), Value::Object(grpc_opts));
        }

        _ => {}
    }

    decode_descriptor(&Value::Object(proxy))
}

/// Re-encode a descriptor's URL-representable fields as a share link.
///
/// Only the vmess and vless kinds have a link form. Decoding the result
/// yields the same descriptor back (modulo name uniquification and the
/// random ws User-Agent).
pub fn encode_share_link(descriptor: &ProxyDescriptor) -> Result<String> {
    let (scheme, uuid, server, port, name, tls, fingerprint, servername, network, packet_addr, xudp) =
        match descriptor {
            ProxyDescriptor::Vmess(o) => (
                "vmess",
                &o.uuid,
                &o.server,
                o.port,
                &o.name,
                o.tls,
                &o.client_fingerprint,
                &o.servername,
                &o.network,
                o.packet_addr,
                o.xudp,
            ),
            ProxyDescriptor::Vless(o) => (
                "vless",
                &o.uuid,
                &o.server,
                o.port,
                &o.name,
                o.tls,
                &o.client_fingerprint,
                &o.servername,
                &o.network,
                o.packet_addr,
                o.xudp,
            ),
            other => {
                return Err(Error::ShareLink(format!(
                    "{} has no share-link form",
                    other.kind()
                )))
            }
        };

    let mut query = form_urlencoded::Serializer::new(String::new());
    if tls {
        query.append_pair("security", "tls");
        if !fingerprint.is_empty() {
            query.append_pair("fp", fingerprint);
        }
    }
    if !servername.is_empty() {
        query.append_pair("sni", servername);
    }
    if packet_addr {
        query.append_pair("packetEncoding", "packet");
    } else if !xudp {
        query.append_pair("packetEncoding", "none");
    }

    let (http_opts, h2_opts) = match descriptor {
        ProxyDescriptor::Vmess(o) => (&o.http_opts, &o.h2_opts),
        ProxyDescriptor::Vless(o) => (&o.http_opts, &o.h2_opts),
        _ => unreachable!(),
    };

    match network.as_str() {
        "" | "tcp" => {
            query.append_pair("type", "tcp");
            let plain = http_opts.method == "GET"
                && http_opts.path == vec!["/".to_string()]
                && http_opts.headers.is_empty();
            if plain {
                query.append_pair("headerType", "none");
            } else {
                if let Some(host) = http_opts.headers.get("Host").and_then(|h| h.first()) {
                    query.append_pair("host", host);
                }
                if let Some(path) = http_opts.path.first() {
                    query.append_pair("path", path);
                }
                query.append_pair("method", &http_opts.method);
            }
        }
        "http" => {
            // headerType=http over tcp round-trips back to network "http"
            query.append_pair("type", "tcp");
            query.append_pair("headerType", "http");
            if let Some(host) = h2_opts.host.first() {
                query.append_pair("host", host);
            }
            if let Some(path) = h2_opts.path.first() {
                query.append_pair("path", path);
            }
        }
        "h2" => {
            query.append_pair("type", "http");
            if let Some(path) = h2_opts.path.first() {
                query.append_pair("path", path);
            }
            if let Some(host) = h2_opts.host.first() {
                query.append_pair("host", host);
            }
        }
        "ws" => {
            query.append_pair("type", "ws");
            let ws_opts = match descriptor {
                ProxyDescriptor::Vmess(o) => &o.ws_opts,
                ProxyDescriptor::Vless(o) => &o.ws_opts,
                _ => unreachable!(),
            };
            query.append_pair("path", &ws_opts.path);
            if let Some(host) = ws_opts.headers.get("Host") {
                query.append_pair("host", host);
            }
            if ws_opts.max_early_data > 0 {
                query.append_pair("ed", &ws_opts.max_early_data.to_string());
            }
            if !ws_opts.early_data_header_name.is_empty() {
                query.append_pair("eh", &ws_opts.early_data_header_name);
            }
        }
        "grpc" => {
            query.append_pair("type", "grpc");
            let grpc_opts = match descriptor {
                ProxyDescriptor::Vmess(o) => &o.grpc_opts,
                ProxyDescriptor::Vless(o) => &o.grpc_opts,
                _ => unreachable!(),
            };
            query.append_pair("serviceName", &grpc_opts.grpc_service_name);
        }
        other => {
            query.append_pair("type", other);
        }
    }

    let query = query.finish();
    let fragment: String =
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string();

    Ok(format!(
        "{scheme}://{uuid}@{server}:{port}?{query}#{fragment}"
    ))
}
