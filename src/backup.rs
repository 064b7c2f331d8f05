//! Session backup to the store, with relocation on node failure.
//!
//! # Flow
//!
//! ```text
//! NotStarted ─► DecidingRelocation ─► Serializing ─► Writing ─┬─► Succeeded
//!                      │                                      ├─► Relocated
//!                      └──────────────► Failed ◄──────────────┘
//! ```
//!
//! A backup writes a session under its current id. When the node tagged in the
//! id is unavailable, the session is first given a new id on a replacement node
//! and written there. A failed write marks the node unavailable so the next
//! attempt relocates. Nothing is retried within one call.
//!
//! Each session has a single in-flight slot shared by backups and expiration
//! updates. An operation that cannot claim it is skipped, not queued.

use crate::codec::SessionCodec;
use crate::error::{Error, Result};
use crate::metrics::StatisticsSink;
use crate::node::NodeSelector;
use crate::session::{
    ChangeMarkers, Session, SessionAttributes, SessionIdFormat, SessionOperation,
};
use crate::store::SessionStore;
use crate::types::{BackupStatus, NodeId};
use bytes::Bytes;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use twox_hash::XxHash64;

/// Stage of a backup attempt, logged at trace level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupPhase {
    NotStarted,
    DecidingRelocation,
    Serializing,
    Writing,
    Succeeded,
    Failed,
    Relocated,
}

impl BackupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupPhase::NotStarted => "not_started",
            BackupPhase::DecidingRelocation => "deciding_relocation",
            BackupPhase::Serializing => "serializing",
            BackupPhase::Writing => "writing",
            BackupPhase::Succeeded => "succeeded",
            BackupPhase::Failed => "failed",
            BackupPhase::Relocated => "relocated",
        }
    }
}

impl From<BackupStatus> for BackupPhase {
    fn from(status: BackupStatus) -> Self {
        match status {
            BackupStatus::Succeeded | BackupStatus::Skipped => BackupPhase::Succeeded,
            BackupStatus::Relocated => BackupPhase::Relocated,
            BackupStatus::Failed => BackupPhase::Failed,
        }
    }
}

/// Id a session will be written under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetId {
    /// Full session id, possibly re-tagged.
    pub id: String,
    /// Node tagged in `id`.
    pub node: NodeId,
    /// Whether `id` differs from the session's current id.
    pub relocated: bool,
}

/// Outcome of [`BackupService::backup`].
#[derive(Debug, Clone, PartialEq)]
pub struct BackupResult {
    pub status: BackupStatus,
    /// Session id after the attempt.
    pub session_id: String,
    /// Id before relocation, if the session was relocated.
    pub previous_id: Option<String>,
    /// Failure observed during the attempt.
    pub error: Option<Error>,
}

impl BackupResult {
    fn skipped(session_id: String) -> Self {
        Self {
            status: BackupStatus::Skipped,
            session_id,
            previous_id: None,
            error: None,
        }
    }

    pub fn is_relocated(&self) -> bool {
        self.status == BackupStatus::Relocated
    }

    /// Whether the session is stored remotely after this attempt.
    ///
    /// In asynchronous mode this reflects the submission, not the write.
    pub fn is_stored(&self) -> bool {
        match self.status {
            BackupStatus::Succeeded => true,
            BackupStatus::Relocated => self.error.is_none(),
            BackupStatus::Skipped | BackupStatus::Failed => false,
        }
    }
}

/// Outcome of [`BackupService::update_expiration`].
#[derive(Debug, Clone, PartialEq)]
pub enum ExpirationUpdate {
    /// The session does not need a refresh yet, or is not eligible.
    NotNeeded,
    /// Another backup or expiration update holds the session.
    Busy,
    /// The node holding the remote copy is marked unavailable; nothing was sent.
    NodeUnavailable,
    /// The remote copy's TTL was extended.
    Updated,
    /// The refresh write failed.
    Failed(Error),
}

/// Hash of session attributes, used to detect unchanged sessions.
pub(crate) fn attributes_hash(attributes: &SessionAttributes) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    attributes.hash(&mut hasher);
    hasher.finish()
}

/// Remote TTL in whole seconds, never zero since zero means "no expiry".
fn ttl_secs(ttl: Duration) -> u32 {
    ttl.as_secs().clamp(1, u64::from(u32::MAX)) as u32
}

fn trace_phase(session_id: &str, phase: BackupPhase) {
    trace!(session_id = %session_id, phase = phase.as_str(), "Backup phase");
}

/// Writes sessions to the store and keeps node availability up to date.
#[derive(Debug)]
pub struct BackupService {
    selector: Arc<NodeSelector>,
    store: Arc<dyn SessionStore>,
    codec: Arc<dyn SessionCodec>,
    stats: Arc<dyn StatisticsSink>,
    format: SessionIdFormat,
    backup_async: bool,
    backup_timeout: Duration,
}

impl BackupService {
    pub fn new(
        selector: Arc<NodeSelector>,
        store: Arc<dyn SessionStore>,
        codec: Arc<dyn SessionCodec>,
        stats: Arc<dyn StatisticsSink>,
        backup_async: bool,
        backup_timeout: Duration,
    ) -> Self {
        Self {
            selector,
            store,
            codec,
            stats,
            format: SessionIdFormat::new(),
            backup_async,
            backup_timeout,
        }
    }

    pub fn is_async(&self) -> bool {
        self.backup_async
    }

    pub fn backup_timeout(&self) -> Duration {
        self.backup_timeout
    }

    /// Id the session should be written under.
    ///
    /// The current id if its node is available, otherwise the same base and route
    /// re-tagged with a replacement node.
    pub async fn determine_target_id(&self, session: &Session) -> Result<TargetId> {
        let current = session.id();
        let node = self.format.extract_node_id(&current)?;

        if self.selector.is_node_available(&node).await {
            return Ok(TargetId {
                id: current,
                node,
                relocated: false,
            });
        }

        let replacement = self.selector.pick_replacement_node(&node).await?;
        Ok(TargetId {
            id: self.format.relocate(&current, &replacement)?,
            node: replacement,
            relocated: true,
        })
    }

    /// Back up `session` if it is new, modified or `force` is set.
    ///
    /// Never returns an error; failures are reported through the result and the
    /// statistics sink.
    pub async fn backup(&self, session: &Arc<Session>, force: bool) -> BackupResult {
        let start = Instant::now();
        let session_id = session.id();
        trace_phase(&session_id, BackupPhase::NotStarted);

        if !force && !session.is_new() && !session.is_dirty() {
            debug!(session_id = %session_id, "Session unchanged, skipping backup");
            self.stats.record_backup(BackupStatus::Skipped, start.elapsed());
            return BackupResult::skipped(session_id);
        }

        let Some(_guard) = session.try_begin(SessionOperation::Backup) else {
            debug!(session_id = %session_id, "Session busy, skipping backup");
            self.stats.record_backup(BackupStatus::Skipped, start.elapsed());
            return BackupResult::skipped(session_id);
        };
        let markers = session.take_change_markers();

        trace_phase(&session_id, BackupPhase::DecidingRelocation);
        let target = match self.determine_target_id(session).await {
            Ok(target) => target,
            Err(e) => {
                session.restore_change_markers(markers);
                if let Error::NoAvailableNode { failed } = &e {
                    self.selector.set_node_available(failed, false);
                    warn!(
                        session_id = %session_id,
                        node = %failed,
                        "No store node available, session not backed up"
                    );
                } else {
                    warn!(session_id = %session_id, error = %e, "Cannot determine backup target");
                }
                return self.finish(start, session_id, None, BackupStatus::Failed, Some(e));
            }
        };

        let previous_id = if target.relocated {
            info!(
                from = %session_id,
                to = %target.id,
                node = %target.node,
                "Relocating session"
            );
            session.set_id(target.id.clone());
            Some(session_id)
        } else {
            None
        };
        let failed_status = if target.relocated {
            BackupStatus::Relocated
        } else {
            BackupStatus::Failed
        };

        trace_phase(&target.id, BackupPhase::Serializing);
        let serialize_start = Instant::now();
        let snapshot = session.snapshot();
        let payload = match self.codec.encode(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                session.restore_change_markers(markers);
                warn!(session_id = %target.id, error = %e, "Could not serialize session");
                return self.finish(start, target.id, previous_id, failed_status, Some(e));
            }
        };
        self.stats
            .record_serialization(serialize_start.elapsed(), payload.len());

        let hash = attributes_hash(&snapshot.attributes);
        if !force
            && !target.relocated
            && !session.is_new()
            && session.last_payload_hash() == Some(hash)
        {
            debug!(session_id = %target.id, "Attributes unchanged, skipping write");
            session.restore_change_markers(ChangeMarkers {
                dirty: false,
                ..markers
            });
            self.stats.record_backup(BackupStatus::Skipped, start.elapsed());
            return BackupResult::skipped(target.id);
        }

        trace_phase(&target.id, BackupPhase::Writing);
        let ttl = session.remaining_lifetime();
        let success_status = if target.relocated {
            BackupStatus::Relocated
        } else {
            BackupStatus::Succeeded
        };

        if self.backup_async {
            session.record_backup(payload.clone(), hash, ttl);
            self.spawn_write(session.clone(), target.clone(), ttl, payload, markers);
            return self.finish(start, target.id, previous_id, success_status, None);
        }

        let write_start = Instant::now();
        match self.write(&target, ttl, payload.clone()).await {
            Ok(()) => {
                self.stats.record_store_write(write_start.elapsed());
                self.selector.set_node_available(&target.node, true);
                session.record_backup(payload, hash, ttl);
                debug!(session_id = %target.id, node = %target.node, "Session backed up");
                self.finish(start, target.id, previous_id, success_status, None)
            }
            Err(e) => {
                session.restore_change_markers(markers);
                if e.is_node_failure() {
                    self.selector.set_node_available(&target.node, false);
                    session.set_node_failure(true);
                }
                warn!(
                    session_id = %target.id,
                    node = %target.node,
                    error = %e,
                    "Session backup failed"
                );
                self.finish(start, target.id, previous_id, failed_status, Some(e))
            }
        }
    }

    /// Extend the remote TTL of `session` if it is about to run out.
    ///
    /// Only sessions that are valid, not expiring, accessed since their last
    /// backup and whose remote copy expires within two housekeeping intervals are
    /// refreshed. The last written payload is re-sent; nothing is re-serialized.
    /// Sessions on a node marked unavailable are left to the next backup, which
    /// relocates them.
    pub async fn update_expiration(
        &self,
        session: &Session,
        housekeeping_interval: Duration,
    ) -> ExpirationUpdate {
        let session_id = session.id();
        let Some(expires_in) = session.remote_expires_in() else {
            return ExpirationUpdate::NotNeeded;
        };
        if !session.is_valid()
            || session.is_expiring()
            || !session.was_accessed_since_last_backup()
            || expires_in > housekeeping_interval.saturating_mul(2)
        {
            return ExpirationUpdate::NotNeeded;
        }

        let node = match self.format.extract_node_id(&session_id) {
            Ok(node) => node,
            Err(e) => return ExpirationUpdate::Failed(e),
        };
        if !self.selector.is_node_available(&node).await {
            debug!(
                session_id = %session_id,
                node = %node,
                "Node marked unavailable, skipping expiration update"
            );
            return ExpirationUpdate::NodeUnavailable;
        }

        let Some(_guard) = session.try_begin(SessionOperation::ExpirationUpdate) else {
            debug!(session_id = %session_id, "Session busy, skipping expiration update");
            return ExpirationUpdate::Busy;
        };
        let Some(payload) = session.last_payload() else {
            return ExpirationUpdate::NotNeeded;
        };

        let target = TargetId {
            id: session_id.clone(),
            node,
            relocated: false,
        };
        let ttl = session.remaining_lifetime();

        match self.write(&target, ttl, payload).await {
            Ok(()) => {
                self.selector.set_node_available(&target.node, true);
                session.record_expiration_update(ttl);
                self.stats.record_expiration_update(true);
                debug!(session_id = %session_id, ttl_secs = ttl_secs(ttl), "Updated remote expiration");
                ExpirationUpdate::Updated
            }
            Err(e) => {
                if e.is_node_failure() {
                    self.selector.set_node_available(&target.node, false);
                    session.set_node_failure(true);
                }
                self.stats.record_expiration_update(false);
                info!(session_id = %session_id, error = %e, "Could not update remote expiration");
                ExpirationUpdate::Failed(e)
            }
        }
    }

    /// Bounded synchronous write.
    async fn write(&self, target: &TargetId, ttl: Duration, payload: Bytes) -> Result<()> {
        let set = self.store.set(&target.id, ttl_secs(ttl), payload);
        match tokio::time::timeout(self.backup_timeout, set).await {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::BackupTimeout {
                node: target.node.clone(),
                timeout: self.backup_timeout,
            }),
        }
    }

    /// Fire-and-forget write. A failure only marks the node unavailable.
    fn spawn_write(
        &self,
        session: Arc<Session>,
        target: TargetId,
        ttl: Duration,
        payload: Bytes,
        markers: ChangeMarkers,
    ) {
        let store = self.store.clone();
        let selector = self.selector.clone();
        tokio::spawn(async move {
            if let Err(e) = store.set(&target.id, ttl_secs(ttl), payload).await {
                let e = Error::from(e);
                session.restore_change_markers(markers);
                if e.is_node_failure() {
                    selector.set_node_available(&target.node, false);
                    session.set_node_failure(true);
                }
                warn!(
                    session_id = %target.id,
                    node = %target.node,
                    error = %e,
                    "Asynchronous session backup failed"
                );
            }
        });
    }

    fn finish(
        &self,
        start: Instant,
        session_id: String,
        previous_id: Option<String>,
        status: BackupStatus,
        error: Option<Error>,
    ) -> BackupResult {
        let elapsed = start.elapsed();
        if let Some(e) = &error {
            self.stats.record_backup_failure(e);
        }
        if previous_id.is_some() {
            self.stats.record_relocation(elapsed);
        }
        self.stats.record_backup(status, elapsed);
        trace_phase(&session_id, status.into());

        BackupResult {
            status,
            session_id,
            previous_id,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;

    fn session(id: &str) -> Arc<Session> {
        Arc::new(Session::new(id, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn test_new_session_is_written_to_its_node() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");

        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Succeeded);
        assert!(result.is_stored());
        assert!(fixture.store.contains("ABC-n1"));
        assert!(!session.is_new());
        assert_eq!(fixture.stats.backups(), vec![BackupStatus::Succeeded]);
    }

    #[tokio::test]
    async fn test_unchanged_session_is_skipped() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");

        service.backup(&session, false).await;
        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Skipped);
        assert_eq!(fixture.store.set_count(), 1);
    }

    #[tokio::test]
    async fn test_identical_attributes_skip_write() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");
        session.set_attribute("user", Bytes::from_static(b"alice"));
        service.backup(&session, false).await;

        session.set_attribute("user", Bytes::from_static(b"alice"));
        let result = service.backup(&session, false).await;
        assert_eq!(result.status, BackupStatus::Skipped);
        assert_eq!(fixture.store.set_count(), 1);

        let forced = service.backup(&session, true).await;
        assert_eq!(forced.status, BackupStatus::Succeeded);
        assert_eq!(fixture.store.set_count(), 2);
    }

    #[tokio::test]
    async fn test_equal_hash_skip_clears_dirty() {
        let fixture = Fixture::new("n1:h:1", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");
        session.set_attribute("user", Bytes::from_static(b"alice"));
        service.backup(&session, false).await;
        let serialized = fixture.stats.serialized_bytes();

        session.set_attribute("user", Bytes::from_static(b"alice"));
        assert_eq!(service.backup(&session, false).await.status, BackupStatus::Skipped);
        assert!(!session.is_dirty());
        let after_skip = fixture.stats.serialized_bytes();
        assert!(after_skip > serialized);

        // Nothing left to serialize on the next trigger.
        assert_eq!(service.backup(&session, false).await.status, BackupStatus::Skipped);
        assert_eq!(fixture.stats.serialized_bytes(), after_skip);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_session_dirty() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");
        service.backup(&session, false).await;

        fixture.store.set_node_up("n1", false);
        session.set_attribute("user", Bytes::from_static(b"bob"));
        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Failed);
        assert!(session.is_dirty());
        assert!(session.was_accessed_since_last_backup());
    }

    #[tokio::test]
    async fn test_unavailable_node_relocates() {
        let fixture = Fixture::new("n1:h:1 n2:h:2 n3:h:3", "");
        fixture.prober.set_down("n1");
        fixture.store.set_node_up("n1", false);
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1.r1");

        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Relocated);
        assert!(result.error.is_none());
        assert_eq!(result.previous_id.as_deref(), Some("ABC-n1.r1"));
        assert_eq!(result.session_id, "ABC-n2.r1");
        assert_eq!(session.id(), "ABC-n2.r1");
        assert!(fixture.store.contains("ABC-n2.r1"));
        assert_eq!(fixture.stats.relocations(), 1);
    }

    #[tokio::test]
    async fn test_no_available_node_fails() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        fixture.prober.set_down("n1");
        fixture.prober.set_down("n2");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");

        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Failed);
        assert!(matches!(result.error, Some(Error::NoAvailableNode { .. })));
        assert_eq!(session.id(), "ABC-n1");
        assert!(session.is_new());
        assert_eq!(fixture.store.set_count(), 0);
    }

    #[tokio::test]
    async fn test_write_failure_marks_node_down() {
        let fixture = Fixture::new("n1:h:1 n2:h:2", "");
        fixture.store.set_node_up("n1", false);
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");

        let result = service.backup(&session, false).await;

        assert_eq!(result.status, BackupStatus::Failed);
        assert!(result.error.as_ref().is_some_and(Error::is_node_failure));
        assert_eq!(fixture.availability.cached(&"n1".into()), Some(false));
        assert!(session.has_node_failure());

        // The next attempt moves the session.
        let retry = service.backup(&session, false).await;
        assert_eq!(retry.status, BackupStatus::Relocated);
        assert_eq!(session.id(), "ABC-n2");
        assert!(!session.has_node_failure());
    }

    #[tokio::test]
    async fn test_busy_session_is_skipped() {
        let fixture = Fixture::new("n1:h:1", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = session("ABC-n1");

        let _guard = session.try_begin(SessionOperation::ExpirationUpdate).unwrap();
        let result = service.backup(&session, true).await;

        assert_eq!(result.status, BackupStatus::Skipped);
        assert_eq!(fixture.store.set_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_expiration_rewrites_last_payload() {
        let fixture = Fixture::new("n1:h:1", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = Arc::new(Session::new("ABC-n1", Duration::from_secs(30)));
        service.backup(&session, false).await;
        let written = fixture.store.raw_get("ABC-n1").unwrap();

        // Not accessed since the backup.
        tokio::time::advance(Duration::from_secs(15)).await;
        assert_eq!(
            service.update_expiration(&session, Duration::from_secs(10)).await,
            ExpirationUpdate::NotNeeded
        );

        session.access();
        assert_eq!(
            service.update_expiration(&session, Duration::from_secs(10)).await,
            ExpirationUpdate::Updated
        );
        assert_eq!(fixture.store.raw_get("ABC-n1").unwrap(), written);
        assert_eq!(fixture.store.ttl_of("ABC-n1"), Some(Duration::from_secs(30)));
        assert!(!session.was_accessed_since_last_backup());
        assert_eq!(fixture.stats.expiration_updates(), vec![true]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_expiration_not_needed_when_far_from_expiry() {
        let fixture = Fixture::new("n1:h:1", "");
        let service = fixture.backup_service(false, Duration::from_millis(100));
        let session = Arc::new(Session::new("ABC-n1", Duration::from_secs(300)));
        service.backup(&session, false).await;

        session.access();
        assert_eq!(
            service.update_expiration(&session, Duration::from_secs(10)).await,
            ExpirationUpdate::NotNeeded
        );
        assert_eq!(fixture.store.set_count(), 1);
    }

    #[test]
    fn test_ttl_secs_never_zero() {
        assert_eq!(ttl_secs(Duration::ZERO), 1);
        assert_eq!(ttl_secs(Duration::from_millis(2500)), 2);
    }
}
