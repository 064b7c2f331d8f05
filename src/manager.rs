//! Session manager with store-backed failover.
//!
//! The manager owns the local session map and wires the replication components
//! together:
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!  create/find ──►│ SessionManager                               │
//!                 │   sessions ─── MissingSessionCache           │
//!                 │       │                                      │
//!                 │       ▼                                      │
//!  backup ───────►│   BackupService ──► NodeSelector             │
//!                 │       │                  │                   │
//!                 │       ▼                  ▼                   │
//!                 │   SessionStore ◄── NodeAvailabilityCache     │
//!                 │                     (StoreProber)            │
//!                 └──────────────────────────────────────────────┘
//! ```
//!
//! Sessions are served from local memory. The store holds a copy on the node
//! tagged in each session id, so another process sharing the store can take a
//! session over by looking it up.

use crate::backup::{attributes_hash, BackupResult, BackupService, ExpirationUpdate};
use crate::codec::{BincodeCodec, SessionCodec};
use crate::config::SessionManagerConfig;
use crate::error::{Error, Result};
use crate::lookup::MissingSessionCache;
use crate::metrics::{NoopStatistics, SessionMetrics, StatisticsSink};
use crate::node::{NodeAvailabilityCache, NodeRegistry, NodeSelector};
use crate::session::{Session, SessionIdFormat};
use crate::store::{SessionStore, StoreProber};
use crate::types::{NodeId, NodeStatus};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Counts from one housekeeping pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HousekeepingReport {
    /// Sessions expired locally.
    pub expired: usize,
    /// Remote TTLs refreshed.
    pub expiration_updates: usize,
    /// Remote TTL refreshes that failed.
    pub expiration_update_failures: usize,
}

/// Local session map replicated to the store nodes.
#[derive(Debug)]
pub struct SessionManager {
    config: SessionManagerConfig,
    registry: Arc<NodeRegistry>,
    availability: Arc<NodeAvailabilityCache>,
    selector: Arc<NodeSelector>,
    backup: BackupService,
    store: Arc<dyn SessionStore>,
    codec: Arc<dyn SessionCodec>,
    stats: Arc<dyn StatisticsSink>,
    metrics: Option<Arc<SessionMetrics>>,
    sessions: DashMap<String, Arc<Session>>,
    missing: MissingSessionCache,
    format: SessionIdFormat,
}

impl SessionManager {
    /// Create a manager with bincode encoding and the built-in metrics.
    ///
    /// Metrics are replaced by [`NoopStatistics`] when statistics are disabled.
    pub fn new(config: SessionManagerConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let metrics = config
            .enable_statistics
            .then(|| Arc::new(SessionMetrics::new()));
        let stats: Arc<dyn StatisticsSink> = match &metrics {
            Some(metrics) => metrics.clone(),
            None => Arc::new(NoopStatistics),
        };
        Self::build(config, store, Arc::new(BincodeCodec), stats, metrics)
    }

    /// Create a manager with a custom codec and statistics sink.
    pub fn with_components(
        config: SessionManagerConfig,
        store: Arc<dyn SessionStore>,
        codec: Arc<dyn SessionCodec>,
        stats: Arc<dyn StatisticsSink>,
    ) -> Result<Self> {
        Self::build(config, store, codec, stats, None)
    }

    fn build(
        config: SessionManagerConfig,
        store: Arc<dyn SessionStore>,
        codec: Arc<dyn SessionCodec>,
        stats: Arc<dyn StatisticsSink>,
        metrics: Option<Arc<SessionMetrics>>,
    ) -> Result<Self> {
        let registry = Arc::new(config.validate()?);

        let prober = Arc::new(StoreProber::new(store.clone()));
        let availability = Arc::new(NodeAvailabilityCache::new(
            registry.len(),
            config.node_availability_ttl,
            prober,
        ));
        let selector = Arc::new(NodeSelector::new(registry.clone(), availability.clone()));
        let backup = BackupService::new(
            selector.clone(),
            store.clone(),
            codec.clone(),
            stats.clone(),
            config.backup_async,
            config.backup_timeout,
        );
        let missing = MissingSessionCache::new(
            config.missing_session_cache_size,
            config.missing_session_cache_ttl,
        );

        info!(
            nodes = ?registry.primaries(),
            failover = ?registry.failover(),
            backup_async = config.backup_async,
            backup_timeout = ?config.backup_timeout,
            "Session manager started"
        );
        stats.update_node_stats(registry.len(), registry.len());

        Ok(Self {
            config,
            registry,
            availability,
            selector,
            backup,
            store,
            codec,
            stats,
            metrics,
            sessions: DashMap::new(),
            missing,
            format: SessionIdFormat::new(),
        })
    }

    // ==================== Sessions ====================

    /// Create a session, or take over `requested_id` if the store still has it.
    ///
    /// Fails only if the generated id cannot be encoded.
    pub async fn create_session(&self, requested_id: Option<&str>) -> Result<Arc<Session>> {
        if let Some(id) = requested_id.filter(|id| self.format.is_valid(id)) {
            if let Some(session) = self.load_from_store(id).await {
                debug!(session_id = %id, "Took over existing session");
                self.add(session.clone());
                return Ok(session);
            }
        }

        let node = self.selector.pick_node_for_new_session().await;
        let base = Uuid::new_v4().simple().to_string().to_uppercase();
        let local_id = match &self.config.jvm_route {
            Some(route) => format!("{base}.{route}"),
            None => base,
        };
        let id = self.format.encode(&local_id, &node)?;

        let session = Arc::new(Session::new(id, self.config.max_inactive_interval));
        debug!(session_id = %session.id(), node = %node, "Created new session");
        self.add(session.clone());
        Ok(session)
    }

    /// Find a session locally or, failing that, in the store.
    ///
    /// Ids recently confirmed missing are answered without a store call.
    pub async fn find_session(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.session(id) {
            return Some(session);
        }

        if self.missing.contains(id).await {
            debug!(session_id = %id, "Session recently confirmed missing");
            self.stats.record_missing_cache_hit();
            return None;
        }

        match self.load_from_store(id).await {
            Some(session) => {
                self.add(session.clone());
                Some(session)
            }
            None => {
                self.missing.insert(id).await;
                None
            }
        }
    }

    /// The local session with `id`, without a store lookup.
    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Load a session from the node tagged in `id`.
    ///
    /// Returns `None` for malformed ids, unavailable nodes, absent entries and
    /// undecodable data. Only a node failure downgrades the node.
    pub async fn load_from_store(&self, id: &str) -> Option<Arc<Session>> {
        let node = match self.format.extract_node_id(id) {
            Ok(node) => node,
            Err(e) => {
                debug!(session_id = %id, error = %e, "Not loading malformed session id");
                return None;
            }
        };

        if !self.selector.is_node_available(&node).await {
            debug!(
                session_id = %id,
                node = %node,
                "Node marked unavailable, not loading session"
            );
            return None;
        }

        debug!(session_id = %id, node = %node, "Loading session from store");
        let start = Instant::now();
        let data = match self.store.get(id).await {
            Ok(data) => data,
            Err(e) => {
                let e = Error::from(e);
                if e.is_node_failure() {
                    self.selector.set_node_available(&node, false);
                }
                warn!(session_id = %id, node = %node, error = %e, "Could not load session");
                return None;
            }
        };
        self.selector.set_node_available(&node, true);
        self.stats.record_load(data.is_some(), start.elapsed());

        let Some(data) = data else {
            debug!(session_id = %id, "Session not found in store");
            return None;
        };

        match self.codec.decode(&data) {
            Ok(snapshot) => {
                let session = Session::from_snapshot(snapshot);
                if session.id() != id {
                    session.set_id(id.to_string());
                }
                session.record_loaded(data, attributes_hash(&session.attributes()));
                Some(Arc::new(session))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Could not decode stored session");
                None
            }
        }
    }

    /// Back up the local session `id`.
    ///
    /// A relocated session is re-keyed under its new id. Returns `None` if no
    /// such local session exists.
    pub async fn backup_session(&self, id: &str, force: bool) -> Option<BackupResult> {
        let session = self.session(id)?;
        let result = self.backup.backup(&session, force).await;

        if let Some(previous) = &result.previous_id {
            self.sessions.remove(previous);
            self.sessions.insert(result.session_id.clone(), session);
        }
        self.update_node_stats();
        Some(result)
    }

    /// Remove a session locally and from the store.
    pub async fn remove_session(&self, id: &str) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(id)?;
        session.invalidate();
        self.delete_remote(&session).await;
        self.stats.update_session_count(self.sessions.len());
        Some(session)
    }

    /// Expire a session. Returns whether it existed locally.
    pub async fn expire_session(&self, id: &str) -> bool {
        debug!(session_id = %id, "Expiring session");
        if let Some(session) = self.session(id) {
            session.set_expiring(true);
        }
        self.remove_session(id).await.is_some()
    }

    /// Expire idle sessions, then refresh remote TTLs of the remaining ones.
    pub async fn run_housekeeping(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for session in sessions {
            if !session.is_valid() || session.is_idle_expired() {
                if self.expire_session(&session.id()).await {
                    report.expired += 1;
                }
                continue;
            }

            match self
                .backup
                .update_expiration(&session, self.config.housekeeping_interval)
                .await
            {
                ExpirationUpdate::Updated => report.expiration_updates += 1,
                ExpirationUpdate::Failed(_) => report.expiration_update_failures += 1,
                ExpirationUpdate::NotNeeded
                | ExpirationUpdate::Busy
                | ExpirationUpdate::NodeUnavailable => {}
            }
        }

        self.stats.update_session_count(self.sessions.len());
        self.update_node_stats();
        debug!(
            expired = report.expired,
            expiration_updates = report.expiration_updates,
            "Housekeeping pass finished"
        );
        report
    }

    /// Run housekeeping every `housekeeping_interval` until the returned sender
    /// fires or is dropped.
    pub fn spawn_housekeeping(self: &Arc<Self>) -> mpsc::Sender<()> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_housekeeping_loop(shutdown_rx).await;
        });
        shutdown_tx
    }

    /// Housekeeping loop driven by a fixed interval.
    pub async fn run_housekeeping_loop(self: Arc<Self>, mut shutdown_rx: mpsc::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.housekeeping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_housekeeping().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Session housekeeping shutting down");
                    break;
                }
            }
        }
    }

    // ==================== Accessors ====================

    /// All configured node ids, primaries first.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.registry.all().cloned().collect()
    }

    pub fn failover_node_ids(&self) -> Vec<NodeId> {
        self.registry.failover().to_vec()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Built-in metrics, if this manager records them.
    pub fn metrics(&self) -> Option<&SessionMetrics> {
        self.metrics.as_deref()
    }

    /// Availability of every node seen so far.
    pub fn node_statuses(&self) -> Vec<NodeStatus> {
        self.availability.snapshot()
    }

    pub fn missing_session_cache(&self) -> &MissingSessionCache {
        &self.missing
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    // ==================== Internals ====================

    fn add(&self, session: Arc<Session>) {
        self.sessions.insert(session.id(), session);
        self.stats.update_session_count(self.sessions.len());
    }

    async fn delete_remote(&self, session: &Session) {
        let id = session.id();
        if !self.format.is_valid(&id) || session.has_node_failure() {
            debug!(session_id = %id, "Not deleting session from store");
            return;
        }

        debug!(session_id = %id, "Deleting session from store");
        if let Err(e) = self.store.delete(&id).await {
            let e = Error::from(e);
            if e.is_node_failure() {
                debug!(session_id = %id, error = %e, "Ignoring node failure on delete");
            } else {
                warn!(session_id = %id, error = %e, "Could not delete session from store");
            }
        }
    }

    fn update_node_stats(&self) {
        self.stats
            .update_node_stats(self.registry.len(), self.availability.available_count());
    }
}
