//! Runtime assembly
//!
//! Turns the parsed configuration into running pieces: sniffer, outbound
//! registry, tunnel, listeners and the management API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::common::Result;
use crate::config::Config;
use crate::convert::{decode_descriptor, parse_share_link};
use crate::error::Error;
use crate::inbound::{MixedListener, UserPass};
use crate::outbound::{new_adapter, DirectAdapter};
use crate::sniff::{DomainMatcher, PortRanges, SnifferConfig, SnifferDispatcher};
use crate::tls::set_global_fingerprint;

use super::api::{start_api_server, FakeIpResolver, NoopResolver};
use super::group::{ProxyGroup, ProxyRegistry};
use super::tunnel::{StaticSelector, Tunnel};

/// Runtime manages the tunnel lifecycle
pub struct Runtime {
    config: Config,
    shutdown_tx: broadcast::Sender<()>,
}

impl Runtime {
    pub fn from_config(config: Config) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            shutdown_tx,
        })
    }

    fn build_sniffer(&self) -> Result<SnifferDispatcher> {
        let settings = &self.config.sniffer;
        if !settings.enable {
            return Ok(SnifferDispatcher::disabled());
        }

        let mut sniffers = HashMap::new();
        for (name, entry) in &settings.sniff {
            let ports = if entry.ports.is_empty() {
                None
            } else {
                Some(PortRanges::parse(&entry.ports)?)
            };
            sniffers.insert(
                name.clone(),
                SnifferConfig {
                    override_dest: entry.override_destination,
                    ports,
                },
            );
        }

        SnifferDispatcher::new(
            &sniffers,
            DomainMatcher::new(&settings.force_domain),
            DomainMatcher::new(&settings.skip_domain),
            settings.force_dns_mapping,
            settings.parse_pure_ip,
        )
    }

    fn build_registry(&self) -> Arc<ProxyRegistry> {
        let registry = Arc::new(ProxyRegistry::new());
        registry.insert(Arc::new(DirectAdapter::default()));

        // Entry errors surface here and skip the entry; they never abort
        // the running system
        for raw in &self.config.proxies {
            match decode_descriptor(raw).and_then(new_adapter) {
                Ok(adapter) => {
                    info!(
                        "registered outbound [{}] ({})",
                        adapter.name(),
                        adapter.kind()
                    );
                    registry.insert(adapter);
                }
                Err(e) => warn!("skipping proxy entry: {}", e),
            }
        }

        let mut names = HashMap::new();
        for link in &self.config.proxy_links {
            match parse_share_link(link, &mut names).and_then(new_adapter) {
                Ok(adapter) => {
                    info!(
                        "registered outbound [{}] ({})",
                        adapter.name(),
                        adapter.kind()
                    );
                    registry.insert(adapter);
                }
                Err(e) => warn!("skipping share link: {}", e),
            }
        }

        for group_config in &self.config.proxy_groups {
            let mut members = Vec::new();
            for member in &group_config.proxies {
                match registry.adapter(member) {
                    Some(adapter) => members.push(adapter),
                    None => warn!("group {}: unknown member {}", group_config.name, member),
                }
            }
            registry.insert_group(ProxyGroup::new(group_config.name.clone(), members));
        }

        registry
    }

    /// Run until Ctrl+C.
    pub async fn run(&self) -> Result<()> {
        if !self.config.global_client_fingerprint.is_empty() {
            set_global_fingerprint(&self.config.global_client_fingerprint);
        }

        let sniffer = self.build_sniffer()?;
        let registry = self.build_registry();

        let default_outbound = if self.config.default_outbound.is_empty() {
            "DIRECT".to_string()
        } else {
            self.config.default_outbound.clone()
        };
        let (tunnel, tcp_in) = Tunnel::start(
            sniffer,
            registry,
            Box::new(StaticSelector::new(default_outbound)),
        );

        let mut listeners = Vec::new();
        for listener_config in &self.config.listeners {
            let listener = MixedListener::new(
                &listener_config.listen,
                tcp_in.clone(),
                listener_config.authentication(),
                vec![
                    crate::inbound::with_in_name(listener_config.name.clone()),
                    crate::inbound::with_special_rules(""),
                ],
            )
            .await?;
            listeners.push(listener);
        }
        if listeners.is_empty() {
            return Err(Error::Config("no listeners configured".into()));
        }
        info!("runtime started with {} listeners", listeners.len());

        let api_handle = match self.api_listen()? {
            Some(addr) => {
                let resolver: Arc<dyn FakeIpResolver> = Arc::new(NoopResolver);
                let shutdown_rx = self.shutdown_tx.subscribe();
                let tunnel = tunnel.clone();
                Some(tokio::spawn(async move {
                    start_api_server(addr, tunnel, resolver, shutdown_rx).await;
                }))
            }
            None => None,
        };

        tokio::signal::ctrl_c().await?;
        info!("shutting down");

        let _ = self.shutdown_tx.send(());
        for listener in &listeners {
            listener.close();
        }
        if let Some(handle) = api_handle {
            let _ = handle.await;
        }

        Ok(())
    }

    fn api_listen(&self) -> Result<Option<SocketAddr>> {
        match &self.config.api {
            Some(api) => api
                .listen
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("invalid API listen address: {}", api.listen))),
            None => Ok(None),
        }
    }
}

impl crate::config::ListenerConfig {
    fn authentication(&self) -> Option<UserPass> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(UserPass {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }
}
