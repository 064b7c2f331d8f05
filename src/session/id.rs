//! Session id format carrying the owning store node.
//!
//! A session id has the shape `<base>-<node>[.<route>]`:
//!
//! ```text
//!   5F3A9C0E1B2D4F60-n1.web3
//!   └──── base ────┘ └┬┘ └┬─┘
//!                  node  route (optional)
//! ```
//!
//! The base is the locally generated id and never contains `-` or `.`. The node
//! tag and the optional route are made of ASCII alphanumerics and `_`. Relocating
//! a session swaps the node tag and keeps base and route, so the part a client
//! correlates with stays stable.

use crate::error::{Error, Result};
use crate::types::NodeId;

const NODE_DELIMITER: char = '-';
const ROUTE_DELIMITER: char = '.';

/// Encodes and decodes the node tag embedded in session ids.
///
/// All operations are pure; the format holds no state and is `Copy`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionIdFormat;

/// Borrowed view of a parsed session id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionIdParts<'a> {
    pub base: &'a str,
    pub node: &'a str,
    pub route: Option<&'a str>,
}

impl SessionIdFormat {
    /// Create a new format.
    pub const fn new() -> Self {
        Self
    }

    /// Stamp `node_id` into `local_id`.
    ///
    /// `local_id` is either a bare base id or `<base>.<route>`; the route stays at
    /// the end of the result. Input that would not parse back, such as a base
    /// containing `-`, is rejected.
    pub fn encode(&self, local_id: &str, node_id: &str) -> Result<String> {
        let (base, route) = match local_id.split_once(ROUTE_DELIMITER) {
            Some((base, route)) => (base, Some(route)),
            None => (local_id, None),
        };
        if !is_base(base) || route.is_some_and(|r| !is_tag(r)) || !is_tag(node_id) {
            return Err(Error::MalformedIdentifier(format!(
                "{local_id} (node {node_id})"
            )));
        }

        Ok(match route {
            Some(route) => format!("{base}{NODE_DELIMITER}{node_id}{ROUTE_DELIMITER}{route}"),
            None => format!("{base}{NODE_DELIMITER}{node_id}"),
        })
    }

    /// Structural check of the id shape. Does not check that the node exists.
    pub fn is_valid(&self, session_id: &str) -> bool {
        self.parse(session_id).is_ok()
    }

    /// Split a session id into its parts.
    pub fn parse<'a>(&self, session_id: &'a str) -> Result<SessionIdParts<'a>> {
        let malformed = || Error::MalformedIdentifier(session_id.to_string());

        let (base, rest) = session_id.split_once(NODE_DELIMITER).ok_or_else(malformed)?;
        if !is_base(base) {
            return Err(malformed());
        }

        let (node, route) = match rest.split_once(ROUTE_DELIMITER) {
            Some((node, route)) => (node, Some(route)),
            None => (rest, None),
        };
        if !is_tag(node) || route.is_some_and(|r| !is_tag(r)) {
            return Err(malformed());
        }

        Ok(SessionIdParts { base, node, route })
    }

    /// Extract the node tag from a session id.
    pub fn extract_node_id(&self, session_id: &str) -> Result<NodeId> {
        self.parse(session_id).map(|parts| NodeId::new(parts.node))
    }

    /// Re-encode `session_id` for `new_node`, keeping base and route.
    pub fn relocate(&self, session_id: &str, new_node: &str) -> Result<String> {
        let parts = self.parse(session_id)?;
        match parts.route {
            Some(route) => self.encode(&format!("{}{ROUTE_DELIMITER}{route}", parts.base), new_node),
            None => self.encode(parts.base, new_node),
        }
    }

    /// The locally generated part of the id, without node tag or route.
    pub fn base_id<'a>(&self, session_id: &'a str) -> Result<&'a str> {
        self.parse(session_id).map(|parts| parts.base)
    }

    /// The route suffix, if any.
    pub fn route<'a>(&self, session_id: &'a str) -> Result<Option<&'a str>> {
        self.parse(session_id).map(|parts| parts.route)
    }

    /// Stamp or replace the route suffix of an encoded id.
    pub fn with_route(&self, session_id: &str, route: &str) -> Result<String> {
        if !is_tag(route) {
            return Err(Error::MalformedIdentifier(format!("{session_id} (route {route})")));
        }
        let parts = self.parse(session_id)?;
        Ok(format!(
            "{}{NODE_DELIMITER}{}{ROUTE_DELIMITER}{route}",
            parts.base, parts.node
        ))
    }
}

fn is_base(s: &str) -> bool {
    !s.is_empty() && !s.contains(NODE_DELIMITER) && !s.contains(ROUTE_DELIMITER)
}

/// Whether `s` is usable as a node tag or route: non-empty `[A-Za-z0-9_]+`.
pub fn is_tag(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
