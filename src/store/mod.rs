//! Store client contract and store-backed node probing.
//!
//! The store is a memcached-style key/value service spread over the configured
//! nodes. Keys are session ids; the node holding a key is the one tagged in the
//! id, so a client implementation routes by [`SessionIdFormat::extract_node_id`].

pub mod memory;

use crate::error::{Result, StoreError};
use crate::node::NodeProber;
use crate::session::SessionIdFormat;
use crate::types::NodeId;
use bytes::Bytes;
use std::sync::Arc;

pub use memory::InMemoryStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key/value store client.
///
/// Node outages must surface as [`StoreError::NodeFailure`] so callers can tell
/// them apart from other errors.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync + std::fmt::Debug {
    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Store `value` under `key` for `ttl_secs` seconds (0 = no expiry).
    async fn set(&self, key: &str, ttl_secs: u32, value: Bytes) -> StoreResult<()>;

    /// Remove `key`.
    async fn delete(&self, key: &str) -> StoreResult<()>;
}

/// Probes a node with a read of a well-known key through the store client.
#[derive(Debug)]
pub struct StoreProber {
    store: Arc<dyn SessionStore>,
    format: SessionIdFormat,
}

impl StoreProber {
    /// Base id used for probe keys.
    pub const PING_ID: &'static str = "ping";

    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            format: SessionIdFormat::new(),
        }
    }
}

#[async_trait::async_trait]
impl NodeProber for StoreProber {
    async fn probe(&self, node: &NodeId) -> Result<()> {
        let key = self.format.encode(Self::PING_ID, node)?;
        self.store.get(&key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_prober_follows_node_state() {
        let store = Arc::new(InMemoryStore::new(["n1", "n2"]));
        let prober = StoreProber::new(store.clone());

        assert!(prober.probe(&"n1".into()).await.is_ok());

        store.set_node_up("n1", false);
        let err = prober.probe(&"n1".into()).await.unwrap_err();
        assert!(err.is_node_failure());
        assert!(prober.probe(&"n2".into()).await.is_ok());
    }
}
