//! Node choice for new and relocated sessions.

use crate::error::{Error, Result};
use crate::node::availability::NodeAvailabilityCache;
use crate::node::registry::NodeRegistry;
use crate::types::NodeId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Picks store nodes from the registry using current availability.
///
/// Ordering is deterministic: new sessions rotate over primaries in registration
/// order, replacements walk the primaries after the failed node and then the
/// failover nodes.
#[derive(Debug)]
pub struct NodeSelector {
    registry: Arc<NodeRegistry>,
    availability: Arc<NodeAvailabilityCache>,
    next_primary: AtomicUsize,
}

impl NodeSelector {
    pub fn new(registry: Arc<NodeRegistry>, availability: Arc<NodeAvailabilityCache>) -> Self {
        Self {
            registry,
            availability,
            next_primary: AtomicUsize::new(0),
        }
    }

    /// Node for a newly created session.
    ///
    /// Rotates over the primaries and skips those currently unavailable. Failover
    /// nodes are never handed out here; if every primary is down the rotation's
    /// primary is returned and the first backup relocates the session.
    pub async fn pick_node_for_new_session(&self) -> NodeId {
        let primaries = self.registry.primaries();
        if primaries.is_empty() {
            // Unreachable with a validated registry.
            return self.registry.failover().first().cloned().unwrap_or_default();
        }

        let start = self.next_primary.fetch_add(1, Ordering::Relaxed) % primaries.len();
        for offset in 0..primaries.len() {
            let candidate = &primaries[(start + offset) % primaries.len()];
            if self.availability.is_available(candidate).await {
                return candidate.clone();
            }
        }

        debug!(
            node = %primaries[start],
            "No primary node available, assigning new session to rotation primary"
        );
        primaries[start].clone()
    }

    /// Node to move a session to when `failed` cannot be used.
    ///
    /// Tries the primaries following `failed` (wrapping around), then the failover
    /// nodes, and returns the first available one. `failed` itself is never
    /// returned.
    pub async fn pick_replacement_node(&self, failed: &NodeId) -> Result<NodeId> {
        for candidate in self.replacement_candidates(failed) {
            if self.availability.is_available(&candidate).await {
                debug!(failed = %failed, replacement = %candidate, "Picked replacement node");
                return Ok(candidate);
            }
        }
        Err(Error::NoAvailableNode {
            failed: failed.clone(),
        })
    }

    /// Whether `node` is currently considered available.
    pub async fn is_node_available(&self, node: &NodeId) -> bool {
        self.availability.is_available(node).await
    }

    /// Forward an observed availability to the cache.
    pub fn set_node_available(&self, node: &NodeId, available: bool) {
        self.availability.set_available(node, available);
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Candidates in preference order, excluding `failed`.
    fn replacement_candidates(&self, failed: &NodeId) -> Vec<NodeId> {
        let primaries = self.registry.primaries();
        let start = primaries
            .iter()
            .position(|id| id == failed)
            .map(|pos| pos + 1)
            .unwrap_or(0);

        (0..primaries.len())
            .map(|offset| &primaries[(start + offset) % primaries.len()])
            .chain(self.registry.failover().iter())
            .filter(|id| *id != failed)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedProber;
    use std::time::Duration;

    fn selector(prober: Arc<ScriptedProber>) -> NodeSelector {
        let registry = Arc::new(
            NodeRegistry::parse("n1:h:1 n2:h:2 n3:h:3 n4:h:4", "n4").unwrap(),
        );
        let availability = Arc::new(NodeAvailabilityCache::new(
            registry.len(),
            Duration::from_secs(60),
            prober,
        ));
        NodeSelector::new(registry, availability)
    }

    #[tokio::test]
    async fn test_new_sessions_rotate_over_primaries() {
        let selector = selector(Arc::new(ScriptedProber::new()));

        let mut picked = Vec::new();
        for _ in 0..4 {
            picked.push(selector.pick_node_for_new_session().await);
        }
        assert_eq!(picked, vec!["n1", "n2", "n3", "n1"]);
    }

    #[tokio::test]
    async fn test_new_session_skips_unavailable_and_never_uses_failover() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_down("n1");
        prober.set_down("n2");
        prober.set_down("n3");
        let selector = selector(prober);

        // All primaries down: still a primary, never the failover node.
        let node = selector.pick_node_for_new_session().await;
        assert_ne!(node, "n4");
        assert!(selector.registry().primaries().contains(&node));
    }

    #[tokio::test]
    async fn test_replacement_order() {
        let selector = selector(Arc::new(ScriptedProber::new()));

        assert_eq!(selector.replacement_candidates(&"n2".into()), vec!["n3", "n1", "n4"]);
        assert_eq!(selector.replacement_candidates(&"n4".into()), vec!["n1", "n2", "n3"]);
        assert_eq!(selector.pick_replacement_node(&"n1".into()).await.unwrap(), "n2");
    }

    #[tokio::test]
    async fn test_replacement_skips_unavailable() {
        let prober = Arc::new(ScriptedProber::new());
        prober.set_down("n2");
        prober.set_down("n3");
        let selector = selector(prober);

        let replacement = selector.pick_replacement_node(&"n1".into()).await.unwrap();
        assert_eq!(replacement, "n4");
    }

    #[tokio::test]
    async fn test_no_available_node() {
        let prober = Arc::new(ScriptedProber::new());
        for id in ["n1", "n2", "n3", "n4"] {
            prober.set_down(id);
        }
        let selector = selector(prober);

        let err = selector.pick_replacement_node(&"n1".into()).await.unwrap_err();
        assert_eq!(err, Error::NoAvailableNode { failed: "n1".into() });
    }
}
