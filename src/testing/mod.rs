//! Testing utilities for session replication.
//!
//! This module provides test doubles for the injected collaborators and a
//! fixture wiring them together:
//! - [`ScriptedProber`]: node probes answered from a switchable up/down table
//! - [`RecordingStatistics`]: a statistics sink that keeps every sample
//! - [`Fixture`]: registry, in-memory store, availability cache and selector
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                           Fixture                               │
//! │                                                                 │
//! │  ┌─────────────────┐   ┌──────────────────┐   ┌──────────────┐ │
//! │  │ ScriptedProber  │──►│ AvailabilityCache│──►│ NodeSelector │ │
//! │  └─────────────────┘   └──────────────────┘   └──────────────┘ │
//! │                                                                 │
//! │  ┌─────────────────┐   ┌──────────────────────┐                │
//! │  │  InMemoryStore  │   │ RecordingStatistics  │                │
//! │  └─────────────────┘   └──────────────────────┘                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use session_failover::testing::Fixture;
//! use std::time::Duration;
//!
//! let fixture = Fixture::new("n1:h:1 n2:h:2", "");
//! fixture.prober.set_down("n1");
//! fixture.store.set_node_up("n1", false);
//!
//! let backups = fixture.backup_service(false, Duration::from_millis(100));
//! // backups.backup(&session, false).await;
//! ```


use crate::backup::BackupService;
use crate::codec::BincodeCodec;
use crate::error::{Error, Result};
use crate::metrics::StatisticsSink;
use crate::node::{NodeAvailabilityCache, NodeProber, NodeRegistry, NodeSelector};
use crate::store::InMemoryStore;
use crate::types::{BackupStatus, NodeId};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Prober whose answers are set by the test. Unknown nodes are up.
#[derive(Debug, Default)]
pub struct ScriptedProber {
    down: Mutex<HashSet<NodeId>>,
    probes: DashMap<NodeId, u64>,
}

impl ScriptedProber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make probes of `node` fail.
    pub fn set_down(&self, node: &str) {
        self.down.lock().insert(NodeId::new(node));
    }

    /// Make probes of `node` succeed.
    pub fn set_up(&self, node: &str) {
        self.down.lock().remove(node);
    }

    /// Number of probes issued for `node`.
    pub fn probes_for(&self, node: &str) -> u64 {
        self.probes.get(node).map(|count| *count).unwrap_or(0)
    }

    /// Number of probes issued for any node.
    pub fn total_probes(&self) -> u64 {
        self.probes.iter().map(|entry| *entry.value()).sum()
    }
}

#[async_trait::async_trait]
impl NodeProber for ScriptedProber {
    async fn probe(&self, node: &NodeId) -> Result<()> {
        *self.probes.entry(node.clone()).or_insert(0) += 1;
        if self.down.lock().contains(node) {
            return Err(Error::NodeFailure {
                node: node.clone(),
                reason: "scripted down".to_string(),
            });
        }
        Ok(())
    }
}

/// Statistics sink that keeps every sample for assertions.
#[derive(Debug, Default)]
pub struct RecordingStatistics {
    backups: Mutex<Vec<BackupStatus>>,
    failures: Mutex<Vec<Error>>,
    relocations: AtomicU64,
    loads: Mutex<Vec<bool>>,
    missing_cache_hits: AtomicU64,
    expiration_updates: Mutex<Vec<bool>>,
    serialized_bytes: AtomicU64,
}

impl RecordingStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backup statuses in the order they were recorded.
    pub fn backups(&self) -> Vec<BackupStatus> {
        self.backups.lock().clone()
    }

    pub fn failures(&self) -> Vec<Error> {
        self.failures.lock().clone()
    }

    pub fn relocations(&self) -> u64 {
        self.relocations.load(Ordering::Relaxed)
    }

    /// `found` flags of remote lookups.
    pub fn loads(&self) -> Vec<bool> {
        self.loads.lock().clone()
    }

    pub fn missing_cache_hits(&self) -> u64 {
        self.missing_cache_hits.load(Ordering::Relaxed)
    }

    pub fn expiration_updates(&self) -> Vec<bool> {
        self.expiration_updates.lock().clone()
    }

    pub fn serialized_bytes(&self) -> u64 {
        self.serialized_bytes.load(Ordering::Relaxed)
    }
}

impl StatisticsSink for RecordingStatistics {
    fn record_backup(&self, status: BackupStatus, _duration: Duration) {
        self.backups.lock().push(status);
    }

    fn record_backup_failure(&self, error: &Error) {
        self.failures.lock().push(error.clone());
    }

    fn record_relocation(&self, _duration: Duration) {
        self.relocations.fetch_add(1, Ordering::Relaxed);
    }

    fn record_serialization(&self, _duration: Duration, size: usize) {
        self.serialized_bytes.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn record_load(&self, found: bool, _duration: Duration) {
        self.loads.lock().push(found);
    }

    fn record_missing_cache_hit(&self) {
        self.missing_cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expiration_update(&self, success: bool) {
        self.expiration_updates.lock().push(success);
    }
}

/// Node components wired over an [`InMemoryStore`] and a [`ScriptedProber`].
#[derive(Debug)]
pub struct Fixture {
    pub registry: Arc<NodeRegistry>,
    pub store: Arc<InMemoryStore>,
    pub prober: Arc<ScriptedProber>,
    pub availability: Arc<NodeAvailabilityCache>,
    pub selector: Arc<NodeSelector>,
    pub stats: Arc<RecordingStatistics>,
}

impl Fixture {
    /// Build a fixture from node syntax, e.g. `("n1:h:1 n2:h:2", "n2")`.
    ///
    /// Availability records are trusted for a minute so probes only happen on
    /// first use. Panics on invalid node syntax.
    pub fn new(nodes: &str, failover: &str) -> Self {
        Self::with_ttl(nodes, failover, Duration::from_secs(60))
    }

    /// Same as [`Fixture::new`] with a custom availability TTL.
    pub fn with_ttl(nodes: &str, failover: &str, ttl: Duration) -> Self {
        let registry = match NodeRegistry::parse(nodes, failover) {
            Ok(registry) => Arc::new(registry),
            Err(e) => panic!("invalid fixture nodes {nodes:?}: {e}"),
        };
        let store = Arc::new(InMemoryStore::new(registry.all().cloned()));
        let prober = Arc::new(ScriptedProber::new());
        let availability = Arc::new(NodeAvailabilityCache::new(
            registry.len(),
            ttl,
            prober.clone(),
        ));
        let selector = Arc::new(NodeSelector::new(registry.clone(), availability.clone()));

        Self {
            registry,
            store,
            prober,
            availability,
            selector,
            stats: Arc::new(RecordingStatistics::new()),
        }
    }

    /// Backup service over this fixture's store, with bincode encoding.
    pub fn backup_service(&self, backup_async: bool, timeout: Duration) -> BackupService {
        BackupService::new(
            self.selector.clone(),
            self.store.clone(),
            Arc::new(BincodeCodec),
            self.stats.clone(),
            backup_async,
            timeout,
        )
    }

    /// Take `node` down both in the store and for probes.
    pub fn fail_node(&self, node: &str) {
        self.store.set_node_up(node, false);
        self.prober.set_down(node);
    }

    /// Bring `node` back in the store and for probes.
    pub fn recover_node(&self, node: &str) {
        self.store.set_node_up(node, true);
        self.prober.set_up(node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_prober() {
        let prober = ScriptedProber::new();
        let n1 = NodeId::new("n1");

        assert!(prober.probe(&n1).await.is_ok());
        prober.set_down("n1");
        assert!(prober.probe(&n1).await.unwrap_err().is_node_failure());
        prober.set_up("n1");
        assert!(prober.probe(&n1).await.is_ok());

        assert_eq!(prober.probes_for("n1"), 3);
        assert_eq!(prober.probes_for("n2"), 0);
        assert_eq!(prober.total_probes(), 3);
    }

    #[test]
    fn test_fixture_wires_all_nodes() {
        let fixture = Fixture::new("n1:h:1 n2:h:2 n3:h:3", "n3");
        assert_eq!(fixture.registry.primaries().len(), 2);
        assert_eq!(fixture.selector.registry().failover(), &[NodeId::new("n3")]);
        assert!(!fixture.store.contains("ABC-n3"));
    }
}
