//! Core types used throughout session replication.

use smol_str::SmolStr;
use std::fmt;

/// Short tag identifying one store node, e.g. `n1`.
pub type NodeId = SmolStr;

/// Outcome of one backup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupStatus {
    /// Nothing to write: the session was unchanged or another operation held it.
    Skipped,
    /// The session was written to its current node.
    Succeeded,
    /// The session was moved to another node during this attempt.
    ///
    /// Reported whether or not the write to the new node went through; the
    /// attached error tells the two apart.
    Relocated,
    /// The write did not happen and the session was not moved.
    Failed,
}

impl BackupStatus {
    /// Label used in metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Skipped => "skipped",
            BackupStatus::Succeeded => "succeeded",
            BackupStatus::Relocated => "relocated",
            BackupStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time availability of a node as seen by this process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    /// Node tag.
    pub node_id: NodeId,
    /// Whether the last probe or observation succeeded.
    pub available: bool,
    /// Whether the entry is older than the availability TTL.
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_status_display() {
        assert_eq!(BackupStatus::Relocated.to_string(), "relocated");
        assert_eq!(BackupStatus::Skipped.as_str(), "skipped");
    }
}
