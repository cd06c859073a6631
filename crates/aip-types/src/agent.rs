//! Logical agent addressing.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Instance key used for singleton agents (tool servers, the config hub).
pub const DEFAULT_AGENT_KEY: &str = "default";

/// Logical address of a message endpoint: `(kind, key)`.
///
/// The `kind` selects which worker hosts the agent; the `key` selects the
/// instance within that worker. Neither says anything about the physical
/// process, which may change across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId {
    /// Agent type, routed by the hub.
    pub kind: String,
    /// Instance key, resolved by the hosting worker.
    pub key: String,
}

impl AgentId {
    /// Create an agent id from its parts.
    pub fn new(kind: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            key: key.into(),
        }
    }

    /// Address the singleton instance of `kind`.
    pub fn singleton(kind: impl Into<String>) -> Self {
        Self::new(kind, DEFAULT_AGENT_KEY)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.key)
    }
}

impl FromStr for AgentId {
    type Err = String;

    /// Parse `kind/key`; a bare `kind` addresses the default instance.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, key) = match s.split_once('/') {
            Some((kind, key)) => (kind, key),
            None => (s, DEFAULT_AGENT_KEY),
        };
        if kind.is_empty() || key.is_empty() {
            return Err(format!("Invalid agent id: '{s}'"));
        }
        Ok(AgentId::new(kind, key))
    }
}
