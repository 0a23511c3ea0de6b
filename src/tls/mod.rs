//! TLS fingerprint engine
//!
//! Selects a browser ClientHello profile and wraps raw connections in a
//! TLS client shaped by it. The profile registry is process-wide and
//! immutable; the `random` profile is drawn once per process and stays
//! stable afterwards. Extension-order mimicry beyond the handshake-visible
//! knobs (SNI, ALPN, certificate verification) is delegated to the TLS
//! library backend.

use std::sync::Arc;
use std::sync::OnceLock;

use parking_lot::RwLock;
use rand::Rng;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::common::{Result, Stream};
use crate::error::Error;
use crate::transport::tls::{build_client_config, TlsConfig};

/// An opaque token identifying a browser's ClientHello shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHelloId {
    pub client: &'static str,
    pub version: &'static str,
    alpn: &'static [&'static str],
}

const ALPN_H2_H1: &[&str] = &["h2", "http/1.1"];

const HELLO_CHROME: ClientHelloId = ClientHelloId {
    client: "chrome",
    version: "auto",
    alpn: ALPN_H2_H1,
};
const HELLO_FIREFOX: ClientHelloId = ClientHelloId {
    client: "firefox",
    version: "auto",
    alpn: ALPN_H2_H1,
};
const HELLO_SAFARI: ClientHelloId = ClientHelloId {
    client: "safari",
    version: "auto",
    alpn: ALPN_H2_H1,
};
const HELLO_IOS: ClientHelloId = ClientHelloId {
    client: "ios",
    version: "auto",
    alpn: ALPN_H2_H1,
};
const HELLO_RANDOMIZED: ClientHelloId = ClientHelloId {
    client: "randomized",
    version: "auto",
    alpn: ALPN_H2_H1,
};

/// Process-wide fingerprint profile table
pub fn lookup_profile(name: &str) -> Option<ClientHelloId> {
    match name {
        "chrome" => Some(HELLO_CHROME),
        "firefox" => Some(HELLO_FIREFOX),
        "safari" => Some(HELLO_SAFARI),
        "ios" => Some(HELLO_IOS),
        "randomized" => Some(HELLO_RANDOMIZED),
        _ => None,
    }
}

static INITIAL_RANDOM: OnceLock<ClientHelloId> = OnceLock::new();
static GLOBAL_FINGERPRINT: RwLock<String> = RwLock::new(String::new());

/// Resolve a fingerprint name to a profile.
///
/// `"none"` resolves to nothing; `"random"` draws a weighted profile once
/// per process and returns the same one for every later call.
pub fn get_fingerprint(name: &str) -> Option<ClientHelloId> {
    if name == "none" {
        return None;
    }

    if name == "random" {
        let profile = INITIAL_RANDOM.get_or_init(roll_fingerprint);
        debug!("use initial random HelloID: {}", profile.client);
        return Some(*profile);
    }

    lookup_profile(name)
}

/// Weighted draw over the browser population: chrome 6, safari 3, ios 2,
/// firefox 1.
fn roll_fingerprint() -> ClientHelloId {
    let weights: &[(&str, u32)] = &[("chrome", 6), ("safari", 3), ("ios", 2), ("firefox", 1)];
    let total: u32 = weights.iter().map(|(_, w)| w).sum();
    let mut pick = rand::thread_rng().gen_range(0..total);
    for (name, weight) in weights {
        if pick < *weight {
            debug!("initial random HelloID: {}", name);
            return lookup_profile(name).unwrap_or(HELLO_CHROME);
        }
        pick -= weight;
    }
    HELLO_CHROME
}

/// Write the process-wide fingerprint cell.
pub fn set_global_fingerprint(name: &str) {
    *GLOBAL_FINGERPRINT.write() = name.to_string();
}

/// Read the process-wide fingerprint cell.
pub fn global_fingerprint() -> String {
    GLOBAL_FINGERPRINT.read().clone()
}

/// True iff the cell holds a usable profile name.
pub fn have_global_fingerprint() -> bool {
    let name = GLOBAL_FINGERPRINT.read();
    !name.is_empty() && *name != "none"
}

/// ClientHello extensions the engine controls
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HelloExtension {
    ServerName(String),
    Alpn(Vec<String>),
    SupportedVersions(Vec<u16>),
}

/// A TLS client with a pending, editable ClientHello.
///
/// Each `UClient` builds fresh handshake state; nothing is shared across
/// connections.
pub struct UClient {
    conn: Stream,
    config: TlsConfig,
    profile: ClientHelloId,
    extensions: Vec<HelloExtension>,
}

/// Wrap a raw connection in a TLS client that will emit a ClientHello
/// matching `profile`. Only server name, certificate trust settings and
/// the peer verifier are taken from `config`.
pub fn uclient(conn: Stream, config: &TlsConfig, profile: ClientHelloId) -> UClient {
    let config = copy_config(config);
    let mut client = UClient {
        conn,
        config,
        profile,
        extensions: Vec::new(),
    };
    client.build_handshake_state();
    client
}

/// Propagate only the verification-relevant fields.
fn copy_config(config: &TlsConfig) -> TlsConfig {
    TlsConfig {
        server_name: config.server_name.clone(),
        skip_cert_verify: config.skip_cert_verify,
        alpn: Vec::new(),
    }
}

impl UClient {
    /// Populate the pending hello from the profile and config.
    fn build_handshake_state(&mut self) {
        self.extensions.clear();
        if !self.config.server_name.is_empty() {
            self.extensions
                .push(HelloExtension::ServerName(self.config.server_name.clone()));
        }
        self.extensions.push(HelloExtension::Alpn(
            self.profile.alpn.iter().map(|s| s.to_string()).collect(),
        ));
        self.extensions
            .push(HelloExtension::SupportedVersions(vec![0x0304, 0x0303]));
    }

    /// The pending hello's extension list.
    pub fn extensions(&self) -> &[HelloExtension] {
        &self.extensions
    }

    /// Rewrite the pending hello so its ALPN list is exactly `http/1.1`,
    /// appending the extension when the hello carries none.
    pub fn force_http1_alpn(&mut self) {
        let mut found = false;
        for ext in &mut self.extensions {
            if let HelloExtension::Alpn(protocols) = ext {
                *protocols = vec!["http/1.1".to_string()];
                found = true;
                break;
            }
        }
        if !found {
            self.extensions
                .push(HelloExtension::Alpn(vec!["http/1.1".to_string()]));
        }
    }

    /// Perform the TLS handshake with the pending hello.
    ///
    /// Returns the encrypted stream and the negotiated ALPN protocol.
    pub async fn handshake(self) -> Result<(Stream, Option<Vec<u8>>)> {
        let mut rustls_config = build_client_config(&self.config);
        for ext in &self.extensions {
            if let HelloExtension::Alpn(protocols) = ext {
                rustls_config.alpn_protocols =
                    protocols.iter().map(|p| p.as_bytes().to_vec()).collect();
            }
        }

        let domain = ServerName::try_from(self.config.server_name.clone()).map_err(|_| {
            Error::Config(format!("Invalid server name: {}", self.config.server_name))
        })?;

        let connector = TlsConnector::from(Arc::new(rustls_config));
        let tls_stream = connector
            .connect(domain, self.conn)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        let alpn = tls_stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
        Ok((Box::new(tls_stream), alpn))
    }

    /// Handshake variant for WebSocket carriers: the hello's ALPN list is
    /// rewritten to `http/1.1` before the handshake runs.
    pub async fn websocket_handshake(mut self) -> Result<Stream> {
        self.force_http1_alpn();
        let (stream, _alpn) = self.handshake().await?;
        Ok(stream)
    }
}

/// TLS-wrap a connection, honoring an optional fingerprint name.
///
/// Adapters funnel through here: a resolvable fingerprint goes through the
/// engine (with the WebSocket ALPN rewrite when the carrier is ws), anything
/// else through the plain TLS layer.
pub async fn wrap_client(
    conn: Stream,
    config: &TlsConfig,
    fingerprint_name: &str,
    websocket: bool,
) -> Result<Stream> {
    match get_fingerprint(fingerprint_name) {
        Some(profile) => {
            let client = uclient(conn, config, profile);
            if websocket {
                client.websocket_handshake().await
            } else {
                let (stream, _alpn) = client.handshake().await?;
                Ok(stream)
            }
        }
        None => {
            let (stream, _alpn) = crate::transport::tls::wrap_client(conn, config).await?;
            Ok(stream)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_resolves_to_nothing() {
        assert!(get_fingerprint("none").is_none());
        assert!(get_fingerprint("nonexistent").is_none());
    }

    #[test]
    fn test_random_is_stable_per_process() {
        let first = get_fingerprint("random").unwrap();
        for _ in 0..16 {
            assert_eq!(get_fingerprint("random").unwrap(), first);
        }
    }

    #[test]
    fn test_global_cell() {
        set_global_fingerprint("none");
        assert!(!have_global_fingerprint());
        set_global_fingerprint("firefox");
        assert!(have_global_fingerprint());
        assert_eq!(global_fingerprint(), "firefox");
        set_global_fingerprint("");
        assert!(!have_global_fingerprint());
    }

    #[tokio::test]
    async fn test_websocket_alpn_rewrite() {
        let (client, _server) = tokio::io::duplex(64);
        let config = TlsConfig {
            server_name: "example.com".into(),
            skip_cert_verify: false,
            alpn: vec!["h2".into()],
        };
        let mut uc = uclient(Box::new(client), &config, HELLO_CHROME);
        uc.force_http1_alpn();

        let alpns: Vec<_> = uc
            .extensions()
            .iter()
            .filter_map(|e| match e {
                HelloExtension::Alpn(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(alpns.len(), 1);
        assert_eq!(alpns[0], vec!["http/1.1".to_string()]);
    }

    #[tokio::test]
    async fn test_alpn_appended_when_absent() {
        let (client, _server) = tokio::io::duplex(64);
        let config = TlsConfig {
            server_name: "example.com".into(),
            ..Default::default()
        };
        let mut uc = uclient(Box::new(client), &config, HELLO_CHROME);
        // Strip the ALPN extension entirely, then force it back
        uc.extensions
            .retain(|e| !matches!(e, HelloExtension::Alpn(_)));
        uc.force_http1_alpn();

        let alpns: Vec<_> = uc
            .extensions()
            .iter()
            .filter_map(|e| match e {
                HelloExtension::Alpn(p) => Some(p.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(alpns.len(), 1);
        assert_eq!(alpns[0], vec!["http/1.1".to_string()]);
    }
}
