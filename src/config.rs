//! Configuration module for Strait
//!
//! JSON configuration: listeners, outbound proxies (as raw maps handed to
//! the convert layer), share links, groups and the sniffer settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Log configuration
    pub log: LogConfig,

    /// Management API configuration
    pub api: Option<ApiConfig>,

    /// Mixed listeners
    pub listeners: Vec<ListenerConfig>,

    /// Outbound proxies as untyped maps; decoded by the convert layer
    pub proxies: Vec<serde_json::Value>,

    /// Share-link proxies (vmess:// / vless://)
    pub proxy_links: Vec<String>,

    /// Proxy groups
    pub proxy_groups: Vec<GroupConfig>,

    /// Traffic sniffer settings
    pub sniffer: SnifferSettings,

    /// Process-wide TLS fingerprint name
    pub global_client_fingerprint: String,

    /// Name of the outbound the tunnel routes to
    pub default_outbound: String,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;
        Self::from_json(&content)
    }

    /// Parse configuration from a JSON string
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))
    }

    /// A minimal local-client configuration
    pub fn default_client() -> Self {
        Config {
            listeners: vec![ListenerConfig {
                name: "mixed-in".to_string(),
                listen: "127.0.0.1:7890".to_string(),
                username: None,
                password: None,
            }],
            sniffer: SnifferSettings {
                enable: true,
                parse_pure_ip: true,
                sniff: HashMap::from([
                    (
                        "tls".to_string(),
                        SniffEntry {
                            ports: vec!["443".into(), "8443".into()],
                            override_destination: true,
                        },
                    ),
                    (
                        "http".to_string(),
                        SniffEntry {
                            ports: vec!["80".into(), "8080-8880".into()],
                            override_destination: true,
                        },
                    ),
                ]),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Management API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ApiConfig {
    /// Listen address (e.g., "127.0.0.1:9090")
    pub listen: String,
}

/// One mixed listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ListenerConfig {
    pub name: String,
    /// Listen address ("host:port")
    pub listen: String,
    /// Basic/userpass credentials; both set enables authentication
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

/// A named proxy group
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupConfig {
    pub name: String,
    /// Member proxy names
    pub proxies: Vec<String>,
}

/// Sniffer settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SnifferSettings {
    pub enable: bool,
    /// Hosts that are always sniffed
    pub force_domain: Vec<String>,
    /// Sniffed hostnames that never rewrite the destination
    pub skip_domain: Vec<String>,
    pub force_dns_mapping: bool,
    pub parse_pure_ip: bool,
    /// Per-sniffer configuration, keyed by sniffer name (tls, http)
    pub sniff: HashMap<String, SniffEntry>,
}

/// Per-sniffer entry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SniffEntry {
    /// Port whitelist ("443", "8000-9000"); empty uses the sniffer default
    pub ports: Vec<String>,
    pub override_destination: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_client_config() {
        let config = Config::default_client();
        assert_eq!(config.listeners.len(), 1);
        assert!(config.sniffer.enable);
        assert!(config.sniffer.sniff.contains_key("tls"));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default_client();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed.listeners.len(), config.listeners.len());
        assert_eq!(parsed.sniffer.sniff.len(), config.sniffer.sniff.len());
    }

    #[test]
    fn test_config_parses_proxies_as_raw_maps() {
        let config = Config::from_json(
            r#"{
                "listeners": [{"name": "in", "listen": "127.0.0.1:7890"}],
                "proxies": [{"type": "ss", "name": "node", "server": "s", "port": 1, "cipher": "aes-128-gcm", "password": "p"}],
                "proxy-links": ["vless://u@h:443#n"],
                "global-client-fingerprint": "chrome"
            }"#,
        )
        .unwrap();
        assert_eq!(config.proxies.len(), 1);
        assert_eq!(config.proxy_links.len(), 1);
        assert_eq!(config.global_client_fingerprint, "chrome");
    }
}
