//! Inbound listeners
//!
//! One mixed TCP listener serves SOCKS4, SOCKS5 and HTTP proxy clients on
//! the same port, telling them apart by the first byte. Each handler
//! builds a ConnContext and hands it to the tunnel over the `tcp_in`
//! channel.

pub mod http;
pub mod inner;
pub mod mixed;
pub mod socks;

pub use mixed::MixedListener;

use std::net::SocketAddr;

use crate::common::{Address, BufferedStream, ConnContext, ConnKind, Metadata, Network};

/// A deferred mutation applied to metadata at inbound construction
#[derive(Debug, Clone)]
pub enum Addition {
    InName(String),
    SpecialRules(String),
}

impl Addition {
    pub fn apply(&self, metadata: &mut Metadata) {
        match self {
            Addition::InName(name) => metadata.in_name = name.clone(),
            Addition::SpecialRules(rules) => metadata.special_rules = rules.clone(),
        }
    }
}

/// Tag metadata with the listener name
pub fn with_in_name(name: impl Into<String>) -> Addition {
    Addition::InName(name.into())
}

/// Tag metadata with a special rule set
pub fn with_special_rules(rules: impl Into<String>) -> Addition {
    Addition::SpecialRules(rules.into())
}

/// Username/password pair for listener authentication
#[derive(Debug, Clone)]
pub struct UserPass {
    pub username: String,
    pub password: String,
}

/// Build the context for an accepted proxy connection.
///
/// Metadata starts from the requested target, then the Additions run in
/// order, then the observed endpoints are filled in.
pub fn new_context(
    kind: ConnKind,
    target: &Address,
    source: Option<SocketAddr>,
    local: Option<SocketAddr>,
    stream: BufferedStream,
    additions: &[Addition],
) -> ConnContext {
    let mut metadata = Metadata::new(Network::Tcp, kind).with_destination(target);
    for addition in additions {
        addition.apply(&mut metadata);
    }
    if let Some(addr) = source {
        metadata.src_ip = Some(addr.ip());
        metadata.src_port = addr.port();
    }
    if let Some(addr) = local {
        metadata.in_ip = Some(addr.ip());
        metadata.in_port = addr.port();
    }
    ConnContext::new(stream, metadata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_context_applies_additions() {
        let (client, _server) = tokio::io::duplex(64);
        let stream = BufferedStream::new(Box::new(client));

        let context = new_context(
            ConnKind::Http,
            &Address::domain("example.com", 443),
            Some("10.0.0.1:4242".parse().unwrap()),
            Some("127.0.0.1:7890".parse().unwrap()),
            stream,
            &[with_in_name("DEFAULT-MIXED"), with_special_rules("")],
        );

        let m = &context.metadata;
        assert_eq!(m.kind, ConnKind::Http);
        assert_eq!(m.host, "example.com");
        assert_eq!(m.dst_port, 443);
        assert_eq!(m.in_name, "DEFAULT-MIXED");
        assert_eq!(m.src_port, 4242);
        assert_eq!(m.in_port, 7890);
    }
}
