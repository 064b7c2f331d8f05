//! Statistics for session replication.
//!
//! The replication core reports timings and outcomes to a [`StatisticsSink`].
//! Nothing it records feeds back into control flow. [`SessionMetrics`] is the
//! default sink: Prometheus-style counters, gauges and histograms with a text
//! export. [`NoopStatistics`] discards everything and is used when statistics
//! are disabled.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       SessionMetrics                          │
//! │  ┌──────────────┐  ┌──────────────┐  ┌───────────────────┐  │
//! │  │  Counters    │  │   Gauges     │  │   Histograms      │  │
//! │  │ - backups    │  │ - sessions   │  │ - backup time     │  │
//! │  │ - failures   │  │ - nodes up   │  │ - serialization   │  │
//! │  │ - loads      │  │              │  │ - payload size    │  │
//! │  └──────────────┘  └──────────────┘  └───────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//! ```

mod counters;
mod gauges;
mod histograms;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;
pub use histograms::{Histogram, HistogramSnapshot};

use crate::error::Error;
use crate::types::BackupStatus;
use std::fmt::Write;
use std::time::Duration;

/// Latency buckets for store round-trips (in seconds).
pub const STORE_LATENCY_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Latency buckets for serialization (in seconds).
pub const SERIALIZATION_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1,
];

/// Payload size buckets (in bytes).
pub const SIZE_BUCKETS: &[f64] = &[
    256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
];

/// Receiver of replication statistics.
///
/// All methods default to doing nothing.
pub trait StatisticsSink: Send + Sync + std::fmt::Debug {
    /// A backup attempt finished with `status` after `duration`.
    fn record_backup(&self, _status: BackupStatus, _duration: Duration) {}

    /// A backup attempt failed with `error`.
    fn record_backup_failure(&self, _error: &Error) {}

    /// A session was moved to another node; `duration` covers the whole attempt.
    fn record_relocation(&self, _duration: Duration) {}

    /// A session was serialized into `size` bytes.
    fn record_serialization(&self, _duration: Duration, _size: usize) {}

    /// A store write completed (sync mode only).
    fn record_store_write(&self, _duration: Duration) {}

    /// A remote lookup finished.
    fn record_load(&self, _found: bool, _duration: Duration) {}

    /// A lookup was answered by the missing-session cache.
    fn record_missing_cache_hit(&self) {}

    /// A remote expiration refresh finished.
    fn record_expiration_update(&self, _success: bool) {}

    /// Current node availability.
    fn update_node_stats(&self, _total: usize, _available: usize) {}

    /// Current number of local sessions.
    fn update_session_count(&self, _count: usize) {}
}

/// Sink that drops every sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStatistics;

impl StatisticsSink for NoopStatistics {}

/// Default statistics sink.
#[derive(Debug)]
pub struct SessionMetrics {
    /// Backup attempts by status.
    pub backups: LabeledCounter,
    /// Failed backup attempts by error kind.
    pub backup_failures: LabeledCounter,
    /// Sessions moved to another node.
    pub relocations: Counter,
    /// Duration of backups that did not relocate.
    pub backup_duration: Histogram,
    /// Duration of backups that relocated.
    pub relocation_duration: Histogram,
    /// Serialization duration.
    pub serialization_duration: Histogram,
    /// Serialized payload size.
    pub payload_size: Histogram,
    /// Store write duration.
    pub store_write_duration: Histogram,

    /// Sessions found remotely.
    pub sessions_loaded: Counter,
    /// Remote lookups that found nothing.
    pub load_misses: Counter,
    /// Remote lookup duration.
    pub load_duration: Histogram,
    /// Lookups answered by the missing-session cache.
    pub missing_cache_hits: Counter,

    /// Successful remote TTL refreshes.
    pub expiration_updates: Counter,
    /// Failed remote TTL refreshes.
    pub expiration_update_failures: Counter,

    /// Configured nodes.
    pub nodes_total: Gauge,
    /// Nodes currently considered available.
    pub nodes_available: Gauge,
    /// Local sessions.
    pub active_sessions: Gauge,
}

impl SessionMetrics {
    /// Create a new metrics instance.
    pub fn new() -> Self {
        Self {
            backups: LabeledCounter::new("session_backups_total", "Backup attempts by status", "status"),
            backup_failures: LabeledCounter::new(
                "session_backup_failures_total",
                "Failed backup attempts by error kind",
                "kind",
            ),
            relocations: Counter::new("session_relocations_total", "Sessions moved to another node"),
            backup_duration: Histogram::with_buckets(
                "session_backup_duration_seconds",
                "Duration of backups without relocation",
                STORE_LATENCY_BUCKETS.to_vec(),
            ),
            relocation_duration: Histogram::with_buckets(
                "session_relocation_duration_seconds",
                "Duration of backups with relocation",
                STORE_LATENCY_BUCKETS.to_vec(),
            ),
            serialization_duration: Histogram::with_buckets(
                "session_serialization_duration_seconds",
                "Session serialization duration",
                SERIALIZATION_BUCKETS.to_vec(),
            ),
            payload_size: Histogram::with_buckets(
                "session_payload_size_bytes",
                "Serialized session size",
                SIZE_BUCKETS.to_vec(),
            ),
            store_write_duration: Histogram::with_buckets(
                "session_store_write_duration_seconds",
                "Store write duration",
                STORE_LATENCY_BUCKETS.to_vec(),
            ),
            sessions_loaded: Counter::new("session_loads_found_total", "Sessions loaded from the store"),
            load_misses: Counter::new("session_loads_missing_total", "Remote lookups that found nothing"),
            load_duration: Histogram::with_buckets(
                "session_load_duration_seconds",
                "Remote lookup duration",
                STORE_LATENCY_BUCKETS.to_vec(),
            ),
            missing_cache_hits: Counter::new(
                "session_missing_cache_hits_total",
                "Lookups answered by the missing-session cache",
            ),
            expiration_updates: Counter::new(
                "session_expiration_updates_total",
                "Successful remote TTL refreshes",
            ),
            expiration_update_failures: Counter::new(
                "session_expiration_update_failures_total",
                "Failed remote TTL refreshes",
            ),
            nodes_total: Gauge::new("store_nodes", "Configured store nodes"),
            nodes_available: Gauge::new("store_nodes_available", "Store nodes considered available"),
            active_sessions: Gauge::new("sessions_active", "Local sessions"),
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            backups_succeeded: self.backups.get(BackupStatus::Succeeded.as_str()),
            backups_relocated: self.backups.get(BackupStatus::Relocated.as_str()),
            backups_failed: self.backups.get(BackupStatus::Failed.as_str()),
            backups_skipped: self.backups.get(BackupStatus::Skipped.as_str()),
            backup_timeouts: self.backup_failures.get("backup_timeout"),
            relocations: self.relocations.get(),
            sessions_loaded: self.sessions_loaded.get(),
            load_misses: self.load_misses.get(),
            missing_cache_hits: self.missing_cache_hits.get(),
            expiration_updates: self.expiration_updates.get(),
            nodes_available: self.nodes_available.get(),
            active_sessions: self.active_sessions.get(),
            backup_duration: self.backup_duration.snapshot(),
            payload_size: self.payload_size.snapshot(),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.relocations,
            &self.sessions_loaded,
            &self.load_misses,
            &self.missing_cache_hits,
            &self.expiration_updates,
            &self.expiration_update_failures,
        ] {
            let _ = write!(
                out,
                "# HELP {name} {}\n# TYPE {name} counter\n{name} {}\n",
                counter.help(),
                counter.get(),
                name = counter.name(),
            );
        }

        for labeled in [&self.backups, &self.backup_failures] {
            let _ = write!(
                out,
                "# HELP {name} {}\n# TYPE {name} counter\n",
                labeled.help(),
                name = labeled.name(),
            );
            for (value, count) in labeled.get_all() {
                let _ = writeln!(out, "{}{{{}=\"{}\"}} {}", labeled.name(), labeled.label(), value, count);
            }
        }

        for gauge in [&self.nodes_total, &self.nodes_available, &self.active_sessions] {
            let _ = write!(
                out,
                "# HELP {name} {}\n# TYPE {name} gauge\n{name} {}\n",
                gauge.help(),
                gauge.get(),
                name = gauge.name(),
            );
        }

        for histogram in [
            &self.backup_duration,
            &self.relocation_duration,
            &self.serialization_duration,
            &self.payload_size,
            &self.store_write_duration,
            &self.load_duration,
        ] {
            let snap = histogram.snapshot();
            let _ = write!(
                out,
                "# HELP {name} {}\n# TYPE {name} histogram\n",
                histogram.help(),
                name = histogram.name(),
            );
            for (upper, count) in snap.buckets.iter().zip(&snap.bucket_counts) {
                let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", histogram.name(), upper, count);
            }
            let _ = write!(
                out,
                "{name}_bucket{{le=\"+Inf\"}} {count}\n{name}_sum {}\n{name}_count {count}\n",
                snap.sum,
                name = histogram.name(),
                count = snap.count,
            );
        }

        out
    }
}

impl Default for SessionMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl StatisticsSink for SessionMetrics {
    fn record_backup(&self, status: BackupStatus, duration: Duration) {
        self.backups.inc(status.as_str());
        match status {
            BackupStatus::Succeeded => self.backup_duration.observe_duration(duration),
            BackupStatus::Relocated => self.relocation_duration.observe_duration(duration),
            BackupStatus::Failed | BackupStatus::Skipped => {}
        }
    }

    fn record_backup_failure(&self, error: &Error) {
        self.backup_failures.inc(error.kind());
    }

    fn record_relocation(&self, _duration: Duration) {
        self.relocations.inc();
    }

    fn record_serialization(&self, duration: Duration, size: usize) {
        self.serialization_duration.observe_duration(duration);
        self.payload_size.observe(size as f64);
    }

    fn record_store_write(&self, duration: Duration) {
        self.store_write_duration.observe_duration(duration);
    }

    fn record_load(&self, found: bool, duration: Duration) {
        if found {
            self.sessions_loaded.inc();
        } else {
            self.load_misses.inc();
        }
        self.load_duration.observe_duration(duration);
    }

    fn record_missing_cache_hit(&self) {
        self.missing_cache_hits.inc();
    }

    fn record_expiration_update(&self, success: bool) {
        if success {
            self.expiration_updates.inc();
        } else {
            self.expiration_update_failures.inc();
        }
    }

    fn update_node_stats(&self, total: usize, available: usize) {
        self.nodes_total.set(total as i64);
        self.nodes_available.set(available as i64);
    }

    fn update_session_count(&self, count: usize) {
        self.active_sessions.set(count as i64);
    }
}

/// A snapshot of session metrics.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub backups_succeeded: u64,
    pub backups_relocated: u64,
    pub backups_failed: u64,
    pub backups_skipped: u64,
    pub backup_timeouts: u64,
    pub relocations: u64,
    pub sessions_loaded: u64,
    pub load_misses: u64,
    pub missing_cache_hits: u64,
    pub expiration_updates: u64,
    pub nodes_available: i64,
    pub active_sessions: i64,
    pub backup_duration: HistogramSnapshot,
    pub payload_size: HistogramSnapshot,
}

impl MetricsSnapshot {
    /// Share of non-skipped backups that did not fail.
    pub fn backup_success_rate(&self) -> f64 {
        let attempted = self.backups_succeeded + self.backups_relocated + self.backups_failed;
        if attempted == 0 {
            0.0
        } else {
            (self.backups_succeeded + self.backups_relocated) as f64 / attempted as f64
        }
    }

    /// Average backup duration in milliseconds.
    pub fn avg_backup_latency_ms(&self) -> f64 {
        self.backup_duration.mean() * 1000.0
    }
}
