//! Session failover through replication to memcached-style store nodes.
//!
//! Sessions live in local memory and are backed up to one of several store
//! nodes. The node holding a session is encoded in the session id itself, so any
//! process sharing the store can find a session from its id alone:
//! - **Session ids** of the form `<base>-<node>[.<route>]`
//! - **Node availability** cached per node with TTL-based re-probing
//! - **Relocation** of a session to a replacement node when its node is down
//! - **Missing-session cache** bounding store traffic for unknown ids
//!
//! # Features
//!
//! - Deterministic round-robin node choice for new sessions
//! - Failover nodes that only receive relocated sessions
//! - Synchronous backups with a hard timeout, or fire-and-forget asynchronous ones
//! - Remote TTL refresh from housekeeping without re-serializing
//! - Prometheus-style statistics
//!
//! # Example
//!
//! ```rust,no_run
//! use session_failover::{InMemoryStore, SessionManager, SessionManagerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionManagerConfig::from_node_spec(
//!         "n1:localhost:11211 n2:localhost:11212 n3:localhost:11213",
//!         "n3",
//!     )?;
//!     let store = Arc::new(InMemoryStore::new(["n1", "n2", "n3"]));
//!     let manager = SessionManager::new(config, store)?;
//!
//!     // New sessions are tagged with a primary node
//!     let session = manager.create_session(None).await?;
//!     session.set_attribute("user", "alice");
//!
//!     // Write it to its node (relocating if the node is down)
//!     if let Some(result) = manager.backup_session(&session.id(), false).await {
//!         println!("{} -> {}", result.status, result.session_id);
//!     }
//!
//!     // Another process sharing the store can now find it
//!     let found = manager.find_session(&session.id()).await;
//!     assert!(found.is_some());
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            Request handling                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │              SessionManager                  │
//! │  • create_session / find_session            │
//! │  • backup_session / remove_session          │
//! │  • run_housekeeping                         │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌──────────┐  ┌────────────┐  ┌──────────┐
//! │  Backup  │  │    Node    │  │ Missing  │
//! │ Service  │  │  Selector  │  │ Sessions │
//! └──────────┘  └────────────┘  └──────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │        SessionStore (memcached nodes)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Availability** means the last probe or observed store call succeeded
//! - **Backups** are best effort: a failure is retried on the next trigger only
//! - **Asynchronous mode** reports success before the write is observed

pub mod backup;
pub mod codec;
pub mod config;
pub mod error;
pub mod lookup;
pub mod manager;
pub mod metrics;
pub mod node;
pub mod session;
pub mod store;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use backup::{BackupPhase, BackupResult, BackupService, ExpirationUpdate, TargetId};
pub use codec::{BincodeCodec, SessionCodec};
pub use config::{NodeDefinition, SessionManagerConfig};
pub use error::{Error, Result, StoreError};
pub use lookup::MissingSessionCache;
pub use manager::{HousekeepingReport, SessionManager};
pub use types::{BackupStatus, NodeId, NodeStatus};

// Re-export node types
pub use node::{NodeAvailabilityCache, NodeProber, NodeRegistry, NodeSelector};

// Re-export session types
pub use session::{
    Session, SessionAttributes, SessionIdFormat, SessionIdParts, SessionOperation,
    SessionSnapshot,
};

// Re-export store types
pub use store::{InMemoryStore, SessionStore, StoreProber, StoreResult};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, MetricsSnapshot,
    NoopStatistics, SessionMetrics, StatisticsSink, SERIALIZATION_BUCKETS, SIZE_BUCKETS,
    STORE_LATENCY_BUCKETS,
};

// Re-export testing types
pub use testing::{Fixture, RecordingStatistics, ScriptedProber};
