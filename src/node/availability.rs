//! Node availability tracking with TTL-based re-probing.
//!
//! Each node has one record holding the last known availability and when it was
//! determined. A record younger than the TTL is trusted as is. An older or
//! missing record is refreshed by awaiting the injected [`NodeProber`] on the
//! calling task, so callers always get a resolved boolean.
//!
//! Real traffic short-circuits probing: a failed write marks the node down at
//! once through [`NodeAvailabilityCache::set_available`], and a successful read
//! marks it back up.
//!
//! Concurrent callers that find the same stale record may each probe the node.
//! Those duplicate probes are bounded by the number of callers and are accepted.

use crate::error::Result;
use crate::types::{NodeId, NodeStatus};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lightweight liveness check against a node.
#[async_trait::async_trait]
pub trait NodeProber: Send + Sync + std::fmt::Debug {
    /// Probe `node`. Any error means the node is unavailable.
    async fn probe(&self, node: &NodeId) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct AvailabilityRecord {
    available: bool,
    checked_at: Instant,
}

/// Per-node availability with a bounded number of records.
#[derive(Debug)]
pub struct NodeAvailabilityCache {
    ttl: Duration,
    capacity: usize,
    records: RwLock<HashMap<NodeId, AvailabilityRecord>>,
    prober: Arc<dyn NodeProber>,
    probes: AtomicU64,
}

impl NodeAvailabilityCache {
    /// Create a cache holding at most `capacity` records, trusted for `ttl`.
    pub fn new(capacity: usize, ttl: Duration, prober: Arc<dyn NodeProber>) -> Self {
        Self {
            ttl,
            capacity: capacity.max(1),
            records: RwLock::new(HashMap::with_capacity(capacity)),
            prober,
            probes: AtomicU64::new(0),
        }
    }

    /// Whether `node` is available, probing it if the record is missing or stale.
    pub async fn is_available(&self, node: &NodeId) -> bool {
        if let Some(available) = self.fresh(node) {
            return available;
        }

        self.probes.fetch_add(1, Ordering::Relaxed);
        let available = match self.prober.probe(node).await {
            Ok(()) => true,
            Err(e) => {
                debug!(node = %node, error = %e, "Node probe failed");
                false
            }
        };
        debug!(node = %node, available, "Probed node");
        self.store(node, available);
        available
    }

    /// Record an availability observed by real traffic, bypassing the prober.
    pub fn set_available(&self, node: &NodeId, available: bool) {
        let previous = self.records.read().get(node).map(|r| r.available);
        match (previous, available) {
            (Some(true) | None, false) => warn!(node = %node, "Marking node unavailable"),
            (Some(false), true) => info!(node = %node, "Node available again"),
            _ => {}
        }
        self.store(node, available);
    }

    /// The trusted value for `node`, if any, without probing.
    pub fn cached(&self, node: &NodeId) -> Option<bool> {
        self.fresh(node)
    }

    /// Number of probes issued so far.
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }

    /// Number of nodes whose last known state is available.
    pub fn available_count(&self) -> usize {
        self.records.read().values().filter(|r| r.available).count()
    }

    /// Current view of every tracked node, sorted by node id.
    pub fn snapshot(&self) -> Vec<NodeStatus> {
        let now = Instant::now();
        let mut statuses: Vec<NodeStatus> = self
            .records
            .read()
            .iter()
            .map(|(node, record)| NodeStatus {
                node_id: node.clone(),
                available: record.available,
                stale: now.saturating_duration_since(record.checked_at) >= self.ttl,
            })
            .collect();
        statuses.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        statuses
    }

    /// Configured TTL.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn fresh(&self, node: &NodeId) -> Option<bool> {
        let records = self.records.read();
        let record = records.get(node)?;
        (record.checked_at.elapsed() < self.ttl).then_some(record.available)
    }

    fn store(&self, node: &NodeId, available: bool) {
        let mut records = self.records.write();
        if !records.contains_key(node) && records.len() >= self.capacity {
            // Evict the record checked longest ago.
            if let Some(oldest) = records
                .iter()
                .min_by_key(|(_, r)| r.checked_at)
                .map(|(k, _)| k.clone())
            {
                records.remove(&oldest);
            }
        }
        records.insert(
            node.clone(),
            AvailabilityRecord {
                available,
                checked_at: Instant::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProber;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_probe_is_trusted_until_ttl() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_down("n1");
        let cache = NodeAvailabilityCache::new(4, Duration::from_millis(1000), prober.clone());

        assert!(!cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(!cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 1);

        prober.set_up("n1");
        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_available_overrides_without_probe() {
        let prober = Arc::new(ScriptedProber::new());
        let cache = NodeAvailabilityCache::new(4, Duration::from_secs(1), prober.clone());

        cache.set_available(&node("n1"), false);
        assert!(!cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 0);

        cache.set_available(&node("n1"), true);
        assert!(cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.is_available(&node("n1")).await);
        assert_eq!(prober.probes_for("n1"), 1);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let prober = Arc::new(ScriptedProber::new());
        let cache = NodeAvailabilityCache::new(2, Duration::from_secs(60), prober);

        cache.set_available(&node("n1"), true);
        cache.set_available(&node("n2"), false);
        cache.set_available(&node("n3"), true);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.iter().any(|s| s.node_id == "n3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_marks_stale_records() {
        let prober = Arc::new(ScriptedProber::new());
        let cache = NodeAvailabilityCache::new(4, Duration::from_millis(100), prober);

        cache.set_available(&node("n1"), true);
        assert!(!cache.snapshot()[0].stale);
        assert_eq!(cache.cached(&node("n1")), Some(true));

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cache.snapshot()[0].stale);
        assert_eq!(cache.cached(&node("n1")), None);
        assert_eq!(cache.available_count(), 1);
    }
}
