//! In-process multi-node store.
//!
//! Each node keeps its own map and can be switched down or slowed down, which is
//! enough to exercise every failover path without a running memcached.

use super::{SessionStore, StoreResult};
use crate::error::StoreError;
use crate::session::SessionIdFormat;
use crate::types::NodeId;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct NodeState {
    up: AtomicBool,
    latency: Mutex<Option<Duration>>,
    entries: Mutex<HashMap<String, (Bytes, Option<Instant>)>>,
}

impl NodeState {
    fn new() -> Self {
        Self {
            up: AtomicBool::new(true),
            latency: Mutex::new(None),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

/// Operation counters, useful for asserting on remote traffic.
#[derive(Debug, Default)]
pub struct StoreCounters {
    pub gets: AtomicU64,
    pub sets: AtomicU64,
    pub deletes: AtomicU64,
}

/// Store with one in-memory map per node.
#[derive(Debug)]
pub struct InMemoryStore {
    nodes: DashMap<NodeId, NodeState>,
    format: SessionIdFormat,
    counters: StoreCounters,
}

impl InMemoryStore {
    /// Create a store with the given node ids, all up.
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let map = DashMap::new();
        for node in nodes {
            map.insert(node.into(), NodeState::new());
        }
        Self {
            nodes: map,
            format: SessionIdFormat::new(),
            counters: StoreCounters::default(),
        }
    }

    /// Bring a node up or take it down.
    pub fn set_node_up(&self, node: &str, up: bool) {
        if let Some(state) = self.nodes.get(node) {
            state.up.store(up, Ordering::SeqCst);
        }
    }

    /// Delay every operation on `node` by `latency`.
    pub fn set_latency(&self, node: &str, latency: Option<Duration>) {
        if let Some(state) = self.nodes.get(node) {
            *state.latency.lock() = latency;
        }
    }

    /// Whether `key` is present on the node it is tagged with.
    pub fn contains(&self, key: &str) -> bool {
        self.raw_get(key).is_some()
    }

    /// Read `key` directly, bypassing availability and latency.
    pub fn raw_get(&self, key: &str) -> Option<Bytes> {
        let node = self.format.extract_node_id(key).ok()?;
        let state = self.nodes.get(&node)?;
        let entries = state.entries.lock();
        match entries.get(key) {
            Some((value, expires)) if expires.map_or(true, |at| at > Instant::now()) => {
                Some(value.clone())
            }
            _ => None,
        }
    }

    /// Write `key` directly, bypassing availability and latency.
    pub fn raw_set(&self, key: &str, value: Bytes) {
        if let Ok(node) = self.format.extract_node_id(key) {
            if let Some(state) = self.nodes.get(&node) {
                state.entries.lock().insert(key.to_string(), (value, None));
            }
        }
    }

    /// Remaining TTL of `key`, if it has one.
    pub fn ttl_of(&self, key: &str) -> Option<Duration> {
        let node = self.format.extract_node_id(key).ok()?;
        let state = self.nodes.get(&node)?;
        let entries = state.entries.lock();
        entries
            .get(key)
            .and_then(|(_, expires)| *expires)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn counters(&self) -> &StoreCounters {
        &self.counters
    }

    pub fn get_count(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }

    pub fn set_count(&self) -> u64 {
        self.counters.sets.load(Ordering::Relaxed)
    }

    pub fn delete_count(&self) -> u64 {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    /// Resolve the node of `key`, apply latency and check that it is up.
    async fn node_for(&self, key: &str) -> StoreResult<NodeId> {
        let node = self
            .format
            .extract_node_id(key)
            .map_err(|_| StoreError::UnknownNode(key.to_string()))?;

        let latency = {
            let state = self
                .nodes
                .get(&node)
                .ok_or_else(|| StoreError::UnknownNode(key.to_string()))?;
            let latency = *state.latency.lock();
            latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let up = self
            .nodes
            .get(&node)
            .map(|state| state.up.load(Ordering::SeqCst))
            .unwrap_or(false);
        if !up {
            return Err(StoreError::NodeFailure {
                node,
                reason: "connection refused".to_string(),
            });
        }
        Ok(node)
    }
}

#[async_trait::async_trait]
impl SessionStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.node_for(key).await?;
        Ok(self.raw_get(key))
    }

    async fn set(&self, key: &str, ttl_secs: u32, value: Bytes) -> StoreResult<()> {
        self.counters.sets.fetch_add(1, Ordering::Relaxed);
        let node = self.node_for(key).await?;
        let expires =
            (ttl_secs > 0).then(|| Instant::now() + Duration::from_secs(u64::from(ttl_secs)));
        if let Some(state) = self.nodes.get(&node) {
            state.entries.lock().insert(key.to_string(), (value, expires));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        let node = self.node_for(key).await?;
        if let Some(state) = self.nodes.get(&node) {
            state.entries.lock().remove(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = InMemoryStore::new(["n1", "n2"]);

        store.set("ABC-n1", 60, Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(store.get("ABC-n1").await.unwrap(), Some(Bytes::from_static(b"data")));
        assert!(store.raw_get("ABC-n2").is_none());

        store.delete("ABC-n1").await.unwrap();
        assert_eq!(store.get("ABC-n1").await.unwrap(), None);
        assert_eq!(store.get_count(), 2);
        assert_eq!(store.set_count(), 1);
        assert_eq!(store.delete_count(), 1);
    }

    #[tokio::test]
    async fn test_node_down_is_node_failure() {
        let store = InMemoryStore::new(["n1"]);
        store.set_node_up("n1", false);

        let err = store.get("ABC-n1").await.unwrap_err();
        assert!(matches!(err, StoreError::NodeFailure { .. }));

        let err = store.get("ABC-n9").await.unwrap_err();
        assert!(matches!(err, StoreError::UnknownNode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = InMemoryStore::new(["n1"]);
        store.set("ABC-n1", 2, Bytes::from_static(b"data")).await.unwrap();
        assert!(store.ttl_of("ABC-n1").unwrap() <= Duration::from_secs(2));

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.get("ABC-n1").await.unwrap(), None);
    }
}
