//! Short-lived memory of session ids that were not found remotely.
//!
//! A request may look up the same session id many times. When the id is neither
//! local nor in the store, each lookup would otherwise reach the store again,
//! which makes unknown or forged ids an easy way to flood the store nodes. This
//! cache remembers confirmed misses for a short TTL so repeated lookups are
//! answered locally.
//!
//! Entries are not invalidated when a session with the same id is created
//! elsewhere; such a session stays invisible to this process until the entry
//! ages out.

use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Bounded LRU cache of missing session ids with a time-to-live.
pub struct MissingSessionCache {
    cache: Cache<String, ()>,
    hits: AtomicU64,
}

impl MissingSessionCache {
    /// Create a cache holding at most `capacity` ids for `ttl` each.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            cache,
            hits: AtomicU64::new(0),
        }
    }

    /// Whether `session_id` was recently confirmed missing.
    pub async fn contains(&self, session_id: &str) -> bool {
        let hit = self.cache.get(session_id).await.is_some();
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        hit
    }

    /// Remember `session_id` as missing.
    pub async fn insert(&self, session_id: impl Into<String>) {
        self.cache.insert(session_id.into(), ()).await;
    }

    /// Forget `session_id`.
    pub async fn remove(&self, session_id: &str) {
        self.cache.invalidate(session_id).await;
    }

    /// Approximate number of remembered ids.
    pub fn len(&self) -> u64 {
        self.cache.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups answered from this cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Run pending maintenance tasks (eviction, expiry).
    pub async fn run_pending_tasks(&self) {
        self.cache.run_pending_tasks().await;
    }
}

impl std::fmt::Debug for MissingSessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MissingSessionCache")
            .field("entry_count", &self.len())
            .field("hits", &self.hits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_contains() {
        let cache = MissingSessionCache::new(10, Duration::from_secs(60));

        assert!(!cache.contains("ABC-n1").await);
        cache.insert("ABC-n1").await;
        assert!(cache.contains("ABC-n1").await);
        assert_eq!(cache.hits(), 1);

        cache.remove("ABC-n1").await;
        assert!(!cache.contains("ABC-n1").await);
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let cache = MissingSessionCache::new(10, Duration::from_millis(50));

        cache.insert("ABC-n1").await;
        assert!(cache.contains("ABC-n1").await);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!cache.contains("ABC-n1").await);
    }

    #[tokio::test]
    async fn test_capacity_is_bounded() {
        let cache = MissingSessionCache::new(2, Duration::from_secs(60));

        for id in ["A-n1", "B-n1", "C-n1", "D-n1"] {
            cache.insert(id).await;
            cache.run_pending_tasks().await;
        }

        assert!(cache.len() <= 2);
        assert!(cache.contains("D-n1").await);
    }
}
