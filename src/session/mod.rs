//! Session state as seen by the replication layer.
//!
//! A [`Session`] is shared between request tasks and housekeeping as an
//! `Arc<Session>`; every field uses interior mutability so the backup service can
//! operate on it through a shared reference.

pub mod id;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

pub use id::{SessionIdFormat, SessionIdParts};

/// Session attributes, ordered so that equal maps serialize to equal bytes.
pub type SessionAttributes = BTreeMap<String, Bytes>;

const IDLE: u8 = 0;

/// Operation holding a session's in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionOperation {
    /// Full backup (serialize and write).
    Backup = 1,
    /// Remote TTL refresh from housekeeping.
    ExpirationUpdate = 2,
}

/// Serializable form of a session, as written to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub creation_time_ms: u64,
    pub last_accessed_ms: u64,
    pub max_inactive_secs: u64,
    pub attributes: SessionAttributes,
}

/// Modification markers taken by a backup when it starts.
///
/// Changes made while the write is in flight set the markers again, so they are
/// picked up by the next backup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChangeMarkers {
    pub dirty: bool,
    pub accessed: bool,
}

/// Bookkeeping about the last successful write of this session.
#[derive(Debug, Default)]
struct BackupState {
    payload: Option<Bytes>,
    payload_hash: Option<u64>,
    remote_expires_at: Option<Instant>,
}

/// A replicated session.
#[derive(Debug)]
pub struct Session {
    id: RwLock<String>,
    creation_time_ms: u64,
    last_accessed: Mutex<(Instant, u64)>,
    max_inactive_interval: Duration,
    attributes: RwLock<SessionAttributes>,

    is_new: AtomicBool,
    valid: AtomicBool,
    expiring: AtomicBool,
    /// Attributes modified since the last successful backup.
    dirty: AtomicBool,
    accessed_since_last_backup: AtomicBool,
    /// A store node failure was observed for this session; skip remote deletes.
    node_failure: AtomicBool,

    in_flight: AtomicU8,
    backup: Mutex<BackupState>,
}

impl Session {
    /// Create a brand-new session with the given id.
    pub fn new(id: impl Into<String>, max_inactive_interval: Duration) -> Self {
        let now_ms = now_ms();
        Self {
            id: RwLock::new(id.into()),
            creation_time_ms: now_ms,
            last_accessed: Mutex::new((Instant::now(), now_ms)),
            max_inactive_interval,
            attributes: RwLock::new(SessionAttributes::new()),
            is_new: AtomicBool::new(true),
            valid: AtomicBool::new(true),
            expiring: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            accessed_since_last_backup: AtomicBool::new(true),
            node_failure: AtomicBool::new(false),
            in_flight: AtomicU8::new(IDLE),
            backup: Mutex::new(BackupState::default()),
        }
    }

    /// Rebuild a session loaded from the store.
    ///
    /// The loaded session counts as accessed now and as already backed up.
    pub fn from_snapshot(snapshot: SessionSnapshot) -> Self {
        Self {
            id: RwLock::new(snapshot.id),
            creation_time_ms: snapshot.creation_time_ms,
            last_accessed: Mutex::new((Instant::now(), now_ms())),
            max_inactive_interval: Duration::from_secs(snapshot.max_inactive_secs),
            attributes: RwLock::new(snapshot.attributes),
            is_new: AtomicBool::new(false),
            valid: AtomicBool::new(true),
            expiring: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            accessed_since_last_backup: AtomicBool::new(false),
            node_failure: AtomicBool::new(false),
            in_flight: AtomicU8::new(IDLE),
            backup: Mutex::new(BackupState::default()),
        }
    }

    /// Current session id.
    pub fn id(&self) -> String {
        self.id.read().clone()
    }

    /// Replace the session id (relocation).
    pub(crate) fn set_id(&self, id: String) {
        *self.id.write() = id;
    }

    pub fn creation_time_ms(&self) -> u64 {
        self.creation_time_ms
    }

    pub fn max_inactive_interval(&self) -> Duration {
        self.max_inactive_interval
    }

    // ==================== Attributes ====================

    /// Get an attribute value.
    pub fn attribute(&self, name: &str) -> Option<Bytes> {
        self.access();
        self.attributes.read().get(name).cloned()
    }

    /// Set an attribute, marking the session modified.
    pub fn set_attribute(&self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.attributes.write().insert(name.into(), value.into());
        self.mark_modified();
    }

    /// Remove an attribute, marking the session modified if it existed.
    pub fn remove_attribute(&self, name: &str) -> Option<Bytes> {
        let removed = self.attributes.write().remove(name);
        if removed.is_some() {
            self.mark_modified();
        }
        removed
    }

    /// Copy of all attributes.
    pub fn attributes(&self) -> SessionAttributes {
        self.attributes.read().clone()
    }

    /// Record a modification made outside the attribute API.
    pub fn mark_modified(&self) {
        self.dirty.store(true, Ordering::Release);
        self.access();
    }

    /// Record an access from a request.
    pub fn access(&self) {
        *self.last_accessed.lock() = (Instant::now(), now_ms());
        self.accessed_since_last_backup.store(true, Ordering::Release);
    }

    // ==================== Lifecycle flags ====================

    pub fn is_new(&self) -> bool {
        self.is_new.load(Ordering::Acquire)
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn is_expiring(&self) -> bool {
        self.expiring.load(Ordering::Acquire)
    }

    pub(crate) fn set_expiring(&self, expiring: bool) {
        self.expiring.store(expiring, Ordering::Release);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn was_accessed_since_last_backup(&self) -> bool {
        self.accessed_since_last_backup.load(Ordering::Acquire)
    }

    pub fn has_node_failure(&self) -> bool {
        self.node_failure.load(Ordering::Acquire)
    }

    pub(crate) fn set_node_failure(&self, failed: bool) {
        self.node_failure.store(failed, Ordering::Release);
    }

    /// Time since the last access.
    pub fn idle_time(&self) -> Duration {
        self.last_accessed.lock().0.elapsed()
    }

    /// Whether the session outlived its max inactive interval.
    pub fn is_idle_expired(&self) -> bool {
        self.idle_time() >= self.max_inactive_interval
    }

    /// Time left before the session expires from inactivity.
    pub fn remaining_lifetime(&self) -> Duration {
        self.max_inactive_interval.saturating_sub(self.idle_time())
    }

    // ==================== In-flight guard ====================

    /// Claim the session for `op`. Returns `None` if any operation is in flight.
    pub fn try_begin(&self, op: SessionOperation) -> Option<OperationGuard<'_>> {
        self.in_flight
            .compare_exchange(IDLE, op as u8, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| OperationGuard { session: self })
    }

    pub fn is_backup_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == SessionOperation::Backup as u8
    }

    pub fn is_expiration_update_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) == SessionOperation::ExpirationUpdate as u8
    }

    // ==================== Backup bookkeeping ====================

    /// Serializable view of the session.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id(),
            creation_time_ms: self.creation_time_ms,
            last_accessed_ms: self.last_accessed.lock().1,
            max_inactive_secs: self.max_inactive_interval.as_secs(),
            attributes: self.attributes(),
        }
    }

    /// Payload of the last successful backup.
    pub fn last_payload(&self) -> Option<Bytes> {
        self.backup.lock().payload.clone()
    }

    /// Hash of the last successfully written payload.
    pub fn last_payload_hash(&self) -> Option<u64> {
        self.backup.lock().payload_hash
    }

    /// Time left before the remote copy expires. `None` if never written.
    pub fn remote_expires_in(&self) -> Option<Duration> {
        self.backup
            .lock()
            .remote_expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Clear the modification markers before the session is serialized.
    pub(crate) fn take_change_markers(&self) -> ChangeMarkers {
        ChangeMarkers {
            dirty: self.dirty.swap(false, Ordering::AcqRel),
            accessed: self.accessed_since_last_backup.swap(false, Ordering::AcqRel),
        }
    }

    /// Put back markers taken by a backup that did not write.
    pub(crate) fn restore_change_markers(&self, markers: ChangeMarkers) {
        if markers.dirty {
            self.dirty.store(true, Ordering::Release);
        }
        if markers.accessed {
            self.accessed_since_last_backup.store(true, Ordering::Release);
        }
    }

    /// Record a successful write of `payload` with remote TTL `ttl`.
    ///
    /// The modification markers are left alone; they were taken before the
    /// payload was serialized.
    pub(crate) fn record_backup(&self, payload: Bytes, hash: u64, ttl: Duration) {
        {
            let mut state = self.backup.lock();
            state.payload = Some(payload);
            state.payload_hash = Some(hash);
            state.remote_expires_at = Some(Instant::now() + ttl);
        }
        self.is_new.store(false, Ordering::Release);
        self.node_failure.store(false, Ordering::Release);
    }

    /// Record a successful remote TTL refresh.
    pub(crate) fn record_expiration_update(&self, ttl: Duration) {
        self.backup.lock().remote_expires_at = Some(Instant::now() + ttl);
        self.accessed_since_last_backup.store(false, Ordering::Release);
    }

    /// Mark a payload as already present remotely, e.g. after loading it.
    pub(crate) fn record_loaded(&self, payload: Bytes, hash: u64) {
        let ttl = self.remaining_lifetime();
        let mut state = self.backup.lock();
        state.payload = Some(payload);
        state.payload_hash = Some(hash);
        state.remote_expires_at = Some(Instant::now() + ttl);
    }
}

/// Releases the session's in-flight slot when dropped.
#[derive(Debug)]
pub struct OperationGuard<'a> {
    session: &'a Session,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        self.session.in_flight.store(IDLE, Ordering::Release);
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("ABC-n1", Duration::from_secs(60))
    }

    #[test]
    fn test_new_session_flags() {
        let session = session();
        assert!(session.is_new());
        assert!(session.is_valid());
        assert!(!session.is_dirty());
        assert!(session.was_accessed_since_last_backup());
    }

    #[test]
    fn test_set_attribute_marks_dirty() {
        let session = session();
        session.set_attribute("user", Bytes::from_static(b"alice"));
        assert!(session.is_dirty());
        assert_eq!(session.attribute("user"), Some(Bytes::from_static(b"alice")));

        assert!(session.remove_attribute("missing").is_none());
        assert!(session.remove_attribute("user").is_some());
    }

    #[tokio::test]
    async fn test_record_backup_after_taking_markers() {
        let session = session();
        session.set_attribute("k", Bytes::from_static(b"v"));
        let markers = session.take_change_markers();
        assert_eq!(
            markers,
            ChangeMarkers {
                dirty: true,
                accessed: true
            }
        );
        session.record_backup(Bytes::from_static(b"payload"), 42, Duration::from_secs(60));

        assert!(!session.is_new());
        assert!(!session.is_dirty());
        assert!(!session.was_accessed_since_last_backup());
        assert_eq!(session.last_payload_hash(), Some(42));
        assert!(session.remote_expires_in().unwrap() <= Duration::from_secs(60));
    }

    #[test]
    fn test_modification_after_taking_markers_survives_backup() {
        let session = session();
        session.set_attribute("k", Bytes::from_static(b"v1"));
        session.take_change_markers();

        session.set_attribute("k", Bytes::from_static(b"v2"));
        session.record_backup(Bytes::from_static(b"v1"), 1, Duration::from_secs(60));

        assert!(session.is_dirty());
        assert!(session.was_accessed_since_last_backup());
    }

    #[test]
    fn test_restore_change_markers() {
        let session = session();
        session.set_attribute("k", Bytes::from_static(b"v"));
        let markers = session.take_change_markers();
        assert!(!session.is_dirty());
        assert!(!session.was_accessed_since_last_backup());

        session.restore_change_markers(markers);
        assert!(session.is_dirty());
        assert!(session.was_accessed_since_last_backup());
    }

    #[test]
    fn test_in_flight_guard_is_exclusive() {
        let session = session();

        let guard = session.try_begin(SessionOperation::Backup).unwrap();
        assert!(session.is_backup_running());
        assert!(session.try_begin(SessionOperation::ExpirationUpdate).is_none());
        assert!(session.try_begin(SessionOperation::Backup).is_none());

        drop(guard);
        assert!(!session.is_backup_running());

        let _guard = session.try_begin(SessionOperation::ExpirationUpdate).unwrap();
        assert!(session.is_expiration_update_running());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let session = session();
        session.set_attribute("cart", Bytes::from_static(b"3 items"));

        let restored = Session::from_snapshot(session.snapshot());
        assert_eq!(restored.id(), "ABC-n1");
        assert!(!restored.is_new());
        assert_eq!(restored.attributes(), session.attributes());
        assert_eq!(restored.max_inactive_interval(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_expiry() {
        let session = Session::new("ABC-n1", Duration::from_secs(10));
        assert!(!session.is_idle_expired());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(session.is_idle_expired());
        assert_eq!(session.remaining_lifetime(), Duration::ZERO);
    }
}
