//! Static registry of store nodes.
//!
//! The registry is built once at startup and never changes. Nodes are split into
//! primaries, which receive new sessions, and failover nodes, which are only used
//! as relocation targets. Registration order is preserved and drives every
//! selection decision.

use crate::config::NodeDefinition;
use crate::error::{Error, Result};
use crate::session::id::is_tag;
use crate::types::NodeId;
use std::collections::HashSet;

/// Ordered primary and failover node sets.
#[derive(Debug, Clone)]
pub struct NodeRegistry {
    primaries: Vec<NodeId>,
    failover: Vec<NodeId>,
    /// Every node in configuration order, with its address.
    definitions: Vec<NodeDefinition>,
}

impl NodeRegistry {
    /// Build a registry from node definitions and the ids to treat as failover.
    ///
    /// Fails if a failover id is unknown, ids are duplicated or malformed, or no
    /// primary node remains once the failover ids are taken out.
    pub fn new(definitions: Vec<NodeDefinition>, failover_ids: &[NodeId]) -> Result<Self> {
        let mut seen = HashSet::new();
        for def in &definitions {
            if !is_tag(&def.id) {
                return Err(Error::Config(format!(
                    "invalid node id {:?}: must match [A-Za-z0-9_]+",
                    def.id.as_str()
                )));
            }
            if !seen.insert(def.id.clone()) {
                return Err(Error::Config(format!("duplicate node id {}", def.id)));
            }
        }

        let mut failover = Vec::with_capacity(failover_ids.len());
        for id in failover_ids {
            if !seen.contains(id) {
                return Err(Error::Config(format!(
                    "invalid failover node id {id}: not a configured node"
                )));
            }
            if failover.contains(id) {
                return Err(Error::Config(format!("duplicate failover node id {id}")));
            }
            failover.push(id.clone());
        }

        let primaries: Vec<NodeId> = definitions
            .iter()
            .map(|def| def.id.clone())
            .filter(|id| !failover.contains(id))
            .collect();

        if primaries.is_empty() {
            return Err(Error::Config(
                "all nodes are configured as failover nodes, at least one primary node is required"
                    .to_string(),
            ));
        }

        Ok(Self {
            primaries,
            failover,
            definitions,
        })
    }

    /// Parse the textual node syntax, e.g. `"n1:localhost:11211 n2:localhost:11212"`
    /// with failover ids `"n2"`. Entries are separated by whitespace or commas.
    pub fn parse(nodes: &str, failover: &str) -> Result<Self> {
        let definitions = split_list(nodes)
            .map(NodeDefinition::parse)
            .collect::<Result<Vec<_>>>()?;
        if definitions.is_empty() {
            return Err(Error::Config("no store nodes configured".to_string()));
        }

        let failover_ids: Vec<NodeId> = split_list(failover).map(NodeId::new).collect();
        Self::new(definitions, &failover_ids)
    }

    /// Primary node ids in registration order.
    pub fn primaries(&self) -> &[NodeId] {
        &self.primaries
    }

    /// Failover node ids in registration order.
    pub fn failover(&self) -> &[NodeId] {
        &self.failover
    }

    /// Every node id, primaries first.
    pub fn all(&self) -> impl Iterator<Item = &NodeId> {
        self.primaries.iter().chain(self.failover.iter())
    }

    /// Total number of nodes.
    pub fn len(&self) -> usize {
        self.primaries.len() + self.failover.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `node` is configured (primary or failover).
    pub fn contains(&self, node: &str) -> bool {
        self.definitions.iter().any(|def| def.id == node)
    }

    pub fn is_failover(&self, node: &str) -> bool {
        self.failover.iter().any(|id| id == node)
    }

    /// Address of a configured node.
    pub fn address(&self, node: &str) -> Option<&str> {
        self.definitions
            .iter()
            .find(|def| def.id == node)
            .map(|def| def.address.as_str())
    }

    /// Node definitions in configuration order.
    pub fn definitions(&self) -> &[NodeDefinition] {
        &self.definitions
    }
}

fn split_list(s: &str) -> impl Iterator<Item = &str> {
    s.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|part| !part.is_empty())
}
