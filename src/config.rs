//! Configuration types for session replication.

use crate::error::{Error, Result};
use crate::node::NodeRegistry;
use crate::types::NodeId;
use std::time::Duration;

/// One store node: its tag and `host:port` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDefinition {
    /// Tag embedded in session ids.
    pub id: NodeId,
    /// `host:port` of the store node.
    pub address: String,
}

impl NodeDefinition {
    /// Create a node definition.
    pub fn new(id: impl Into<NodeId>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
        }
    }

    /// Parse `id:host:port`.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid node definition {s:?}, expected id:host:port"));

        let mut parts = s.splitn(3, ':');
        let (id, host, port) = match (parts.next(), parts.next(), parts.next()) {
            (Some(id), Some(host), Some(port)) if !id.is_empty() && !host.is_empty() => {
                (id, host, port)
            }
            _ => return Err(invalid()),
        };
        port.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self::new(id, format!("{host}:{port}")))
    }
}

/// Main configuration for the session manager.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Store nodes in preference order.
    pub nodes: Vec<NodeDefinition>,

    /// Ids of nodes used only as relocation targets.
    pub failover_nodes: Vec<NodeId>,

    /// Write backups without waiting for the store.
    ///
    /// Async writes are not observed: a failed write is still reported as a
    /// success and the session is not relocated until a later failure is seen.
    pub backup_async: bool,

    /// Bound on a synchronous backup write.
    pub backup_timeout: Duration,

    /// How long a node availability result is trusted.
    pub node_availability_ttl: Duration,

    /// Maximum number of remembered missing session ids.
    pub missing_session_cache_size: u64,

    /// How long a missing session id is remembered.
    pub missing_session_cache_ttl: Duration,

    /// Idle time after which a session expires.
    pub max_inactive_interval: Duration,

    /// Interval of the housekeeping pass.
    pub housekeeping_interval: Duration,

    /// Route suffix stamped into new session ids.
    pub jvm_route: Option<String>,

    /// Whether to gather statistics.
    pub enable_statistics: bool,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            failover_nodes: Vec::new(),
            backup_async: false,
            backup_timeout: Duration::from_millis(100),
            node_availability_ttl: Duration::from_millis(1000),
            missing_session_cache_size: 200,
            missing_session_cache_ttl: Duration::from_millis(500),
            max_inactive_interval: Duration::from_secs(30 * 60),
            housekeeping_interval: Duration::from_secs(10),
            jvm_route: None,
            enable_statistics: true,
        }
    }
}

impl SessionManagerConfig {
    /// Create a configuration for the given nodes.
    pub fn new(nodes: Vec<NodeDefinition>) -> Self {
        Self {
            nodes,
            ..Default::default()
        }
    }

    /// Create a configuration from the textual node syntax,
    /// e.g. `"n1:localhost:11211 n2:localhost:11212"` and failover `"n2"`.
    pub fn from_node_spec(nodes: &str, failover: &str) -> Result<Self> {
        let registry = NodeRegistry::parse(nodes, failover)?;
        Ok(Self {
            nodes: registry.definitions().to_vec(),
            failover_nodes: registry.failover().to_vec(),
            ..Default::default()
        })
    }

    /// Set failover node ids.
    pub fn with_failover_nodes<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.failover_nodes = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Enable or disable asynchronous backups.
    pub fn with_backup_async(mut self, enabled: bool) -> Self {
        self.backup_async = enabled;
        self
    }

    /// Set the synchronous backup timeout.
    pub fn with_backup_timeout(mut self, timeout: Duration) -> Self {
        self.backup_timeout = timeout;
        self
    }

    /// Set how long node availability is trusted.
    pub fn with_node_availability_ttl(mut self, ttl: Duration) -> Self {
        self.node_availability_ttl = ttl;
        self
    }

    /// Set the missing-session cache bounds.
    pub fn with_missing_session_cache(mut self, size: u64, ttl: Duration) -> Self {
        self.missing_session_cache_size = size;
        self.missing_session_cache_ttl = ttl;
        self
    }

    /// Set the session idle timeout.
    pub fn with_max_inactive_interval(mut self, interval: Duration) -> Self {
        self.max_inactive_interval = interval;
        self
    }

    /// Set the housekeeping interval.
    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval = interval;
        self
    }

    /// Set the route suffix for new session ids.
    pub fn with_jvm_route(mut self, route: impl Into<String>) -> Self {
        self.jvm_route = Some(route.into());
        self
    }

    /// Enable or disable statistics.
    pub fn with_statistics(mut self, enabled: bool) -> Self {
        self.enable_statistics = enabled;
        self
    }

    /// Check the configuration and build the node registry.
    pub fn validate(&self) -> Result<NodeRegistry> {
        for (name, value) in [
            ("backup_timeout", self.backup_timeout),
            ("node_availability_ttl", self.node_availability_ttl),
            ("missing_session_cache_ttl", self.missing_session_cache_ttl),
            ("max_inactive_interval", self.max_inactive_interval),
            ("housekeeping_interval", self.housekeeping_interval),
        ] {
            if value.is_zero() {
                return Err(Error::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.missing_session_cache_size == 0 {
            return Err(Error::Config(
                "missing_session_cache_size must be greater than zero".to_string(),
            ));
        }
        if let Some(route) = &self.jvm_route {
            if !crate::session::id::is_tag(route) {
                return Err(Error::Config(format!(
                    "invalid jvm_route {route:?}: must match [A-Za-z0-9_]+"
                )));
            }
        }

        NodeRegistry::new(self.nodes.clone(), &self.failover_nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionManagerConfig::default();
        assert!(!config.backup_async);
        assert_eq!(config.backup_timeout, Duration::from_millis(100));
        assert_eq!(config.node_availability_ttl, Duration::from_millis(1000));
        assert_eq!(config.missing_session_cache_size, 200);
        assert_eq!(config.missing_session_cache_ttl, Duration::from_millis(500));
    }

    #[test]
    fn test_config_builder() {
        let config = SessionManagerConfig::from_node_spec("n1:localhost:11211 n2:localhost:11212", "n2")
            .unwrap()
            .with_backup_async(true)
            .with_backup_timeout(Duration::from_millis(250))
            .with_jvm_route("web1");

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.failover_nodes, vec![NodeId::new("n2")]);
        assert!(config.backup_async);
        assert_eq!(config.backup_timeout, Duration::from_millis(250));

        let registry = config.validate().unwrap();
        assert_eq!(registry.primaries(), &["n1"]);
    }

    #[test]
    fn test_node_definition_parse() {
        let def = NodeDefinition::parse("n1:cache.local:11211").unwrap();
        assert_eq!(def.id, "n1");
        assert_eq!(def.address, "cache.local:11211");

        assert!(NodeDefinition::parse("n1:cache.local").is_err());
        assert!(NodeDefinition::parse("n1:cache.local:port").is_err());
        assert!(NodeDefinition::parse(":cache.local:11211").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let nodes = vec![NodeDefinition::new("n1", "localhost:11211")];

        let config = SessionManagerConfig::new(nodes.clone()).with_backup_timeout(Duration::ZERO);
        assert!(config.validate().is_err());

        let config = SessionManagerConfig::new(nodes.clone()).with_jvm_route("bad.route");
        assert!(config.validate().is_err());

        let config = SessionManagerConfig::new(nodes).with_failover_nodes(["n1"]);
        assert!(config.validate().is_err());
    }
}
