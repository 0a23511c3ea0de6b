//! ConnContext - an accepted inbound connection paired with its metadata

use super::{BufferedStream, Metadata};

/// Pairing of an accepted inbound connection with its mutable routing
/// metadata. Created by an inbound handler, consumed by the tunnel.
pub struct ConnContext {
    pub stream: BufferedStream,
    pub metadata: Metadata,
}

impl ConnContext {
    pub fn new(stream: BufferedStream, metadata: Metadata) -> Self {
        Self { stream, metadata }
    }
}

impl std::fmt::Debug for ConnContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnContext")
            .field("metadata", &self.metadata)
            .finish()
    }
}
