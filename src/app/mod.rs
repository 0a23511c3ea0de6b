//! Application Layer
//!
//! This module contains:
//! - Tunnel: core execution flow (inbound channel → sniffer → outbound)
//! - Runtime: configuration-driven assembly
//! - Group/Registry: named proxies and delay probing
//! - Api: management HTTP server
//! - Metrics: Prometheus counters

pub mod api;
pub mod group;
pub mod metrics;
mod runtime;
mod tunnel;

pub use api::{FakeIpResolver, NoopResolver};
pub use group::{ProxyGroup, ProxyRegistry, ProxySnapshot};
pub use runtime::Runtime;
pub use tunnel::{OutboundSelector, StaticSelector, Tunnel};
