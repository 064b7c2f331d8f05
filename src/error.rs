//! Error types for session replication.

use crate::types::NodeId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for session replication operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for session replication.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    /// The session id does not have the `<base>-<node>[.<route>]` shape.
    #[error("malformed session id: {0}")]
    MalformedIdentifier(String),

    /// The store node was unreachable or answered with an error.
    #[error("node {node} failed: {reason}")]
    NodeFailure { node: NodeId, reason: String },

    /// A synchronous backup did not complete within its bound.
    #[error("backup to node {node} timed out after {timeout:?}")]
    BackupTimeout { node: NodeId, timeout: Duration },

    /// Every configured node is currently marked unavailable.
    #[error("no node available to replace {failed}")]
    NoAvailableNode { failed: NodeId },

    /// Stored data could not be turned back into a session.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Session data could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Store error that is not attributable to a node outage.
    #[error("store error: {0}")]
    Store(String),

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether this error should downgrade the availability of the node involved.
    ///
    /// Timeouts are reported separately but count as node failures for control flow.
    pub fn is_node_failure(&self) -> bool {
        matches!(self, Error::NodeFailure { .. } | Error::BackupTimeout { .. })
    }

    /// Short label used for the error counter.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::MalformedIdentifier(_) => "malformed_identifier",
            Error::NodeFailure { .. } => "node_failure",
            Error::BackupTimeout { .. } => "backup_timeout",
            Error::NoAvailableNode { .. } => "no_available_node",
            Error::Deserialization(_) => "deserialization",
            Error::Serialization(_) => "serialization",
            Error::Store(_) => "store",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

/// Errors surfaced by a [`SessionStore`](crate::store::SessionStore).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// The node owning the key could not be reached.
    #[error("node {node} unavailable: {reason}")]
    NodeFailure { node: NodeId, reason: String },

    /// The key does not resolve to any configured node.
    #[error("no node for key {0}")]
    UnknownNode(String),

    /// Any other store-side failure.
    #[error("{0}")]
    Other(String),
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NodeFailure { node, reason } => Error::NodeFailure { node, reason },
            StoreError::UnknownNode(key) => Error::MalformedIdentifier(key),
            StoreError::Other(msg) => Error::Store(msg),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_failure_classification() {
        let failure = Error::NodeFailure {
            node: "n1".into(),
            reason: "connection refused".to_string(),
        };
        let timeout = Error::BackupTimeout {
            node: "n1".into(),
            timeout: Duration::from_millis(100),
        };

        assert!(failure.is_node_failure());
        assert!(timeout.is_node_failure());
        assert!(!Error::Deserialization("bad".to_string()).is_node_failure());
        assert!(!Error::NoAvailableNode { failed: "n1".into() }.is_node_failure());
    }

    #[test]
    fn test_store_error_conversion() {
        let err: Error = StoreError::NodeFailure {
            node: "n2".into(),
            reason: "down".to_string(),
        }
        .into();
        assert_eq!(err.kind(), "node_failure");

        let err: Error = StoreError::Other("oops".to_string()).into();
        assert_eq!(err, Error::Store("oops".to_string()));
    }
}
