//! Direct outbound

use async_trait::async_trait;

use crate::common::{Metadata, Result, Stream};
use crate::transport::tcp;

use super::{OutboundAdapter, ProxyKind};

/// Dials the destination itself, without any proxy in between.
pub struct DirectAdapter {
    name: String,
}

impl DirectAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for DirectAdapter {
    fn default() -> Self {
        Self::new("DIRECT")
    }
}

#[async_trait]
impl OutboundAdapter for DirectAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Direct
    }

    fn addr(&self) -> String {
        String::new()
    }

    fn supports_udp(&self) -> bool {
        true
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        tcp::dial(&metadata.destination()).await
    }
}
