//! Discoverable endpoint records and the discovery store contract.

use crate::error::{AipError, AipResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Record type announced by tool servers.
pub const RECORD_TYPE_TOOL: &str = "tool";

/// Liveness state of a discoverable endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Running,
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Running => f.write_str("running"),
            ServerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// The metadata part of a [`ServerRecord`].
///
/// Unknown keys announced by an endpoint are preserved in `extra` and take
/// part in metadata filtering like the known ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `"tool"` for tool servers; free-form otherwise.
    #[serde(rename = "type", default = "default_record_type")]
    pub record_type: String,
    #[serde(default)]
    pub state: ServerState,
    #[serde(default)]
    pub url: String,
    /// `"grpc"` for hub-routed endpoints, `"sse"` for public HTTP ones.
    #[serde(default)]
    pub transport: String,
    /// When the endpoint last announced itself.
    #[serde(default, alias = "timestamp", skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// When the record last moved to `stopped`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_record_type() -> String {
    RECORD_TYPE_TOOL.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            record_type: default_record_type(),
            state: ServerState::Running,
            url: String::new(),
            transport: String::new(),
            last_seen: None,
            stopped_at: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A directory entry describing a discoverable tool/agent endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    /// Primary key; also the agent kind the endpoint is hosted under.
    pub name: String,
    pub description: String,
    pub config: ServerConfig,
}

impl ServerRecord {
    pub fn is_running(&self) -> bool {
        self.config.state == ServerState::Running
    }

    /// Move the record to `state`, stamping `stopped_at` on the way down.
    pub fn set_state(&mut self, state: ServerState, now: DateTime<Utc>) {
        if self.config.state == state {
            return;
        }
        self.config.state = state;
        self.config.stopped_at = match state {
            ServerState::Stopped => Some(now),
            ServerState::Running => None,
        };
    }
}

/// Filter for [`DiscoveryStore::query`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordFilter {
    /// Whitespace-separated terms; each must occur in name or description.
    pub query: String,
    /// Exact-match constraints on config keys (`state`, `type`, ...).
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Substring the description must contain.
    pub content: Option<String>,
    /// Maximum number of results. `None` = unlimited.
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Match every record.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match records in `state`.
    pub fn with_state(state: ServerState) -> Self {
        let mut filter = Self::default();
        filter
            .metadata
            .insert("state".into(), serde_json::Value::String(state.to_string()));
        filter
    }

    /// Whether `record` passes this filter (ignores `limit`).
    pub fn matches(&self, record: &ServerRecord) -> bool {
        let haystack = format!("{} {}", record.name, record.description).to_lowercase();
        let query_ok = self
            .query
            .split_whitespace()
            .all(|term| haystack.contains(&term.to_lowercase()));
        if !query_ok {
            return false;
        }

        if let Some(content) = &self.content {
            if !record.description.contains(content.as_str()) {
                return false;
            }
        }

        if self.metadata.is_empty() {
            return true;
        }
        let Ok(serde_json::Value::Object(config)) = serde_json::to_value(&record.config) else {
            return false;
        };
        self.metadata
            .iter()
            .all(|(key, expected)| config.get(key) == Some(expected))
    }
}

/// Document store holding [`ServerRecord`]s keyed by name.
#[async_trait]
pub trait DiscoveryStore: Send + Sync {
    async fn exists(&self, name: &str) -> AipResult<bool>;

    /// Insert a new record. Fails if the name is taken.
    async fn add(&self, record: ServerRecord) -> AipResult<()>;

    /// Replace an existing record. Fails if the name is unknown.
    async fn update(&self, record: ServerRecord) -> AipResult<()>;

    async fn get(&self, name: &str) -> AipResult<Option<ServerRecord>>;

    /// Records passing `filter`, ordered by name.
    async fn query(&self, filter: &RecordFilter) -> AipResult<Vec<ServerRecord>>;

    /// Delete a record; returns whether it existed.
    async fn remove(&self, name: &str) -> AipResult<bool>;

    /// Insert or replace.
    async fn upsert(&self, record: ServerRecord) -> AipResult<()> {
        if self.exists(&record.name).await? {
            self.update(record).await
        } else {
            self.add(record).await
        }
    }

    /// Change only the state of an existing record.
    async fn set_state(&self, name: &str, state: ServerState) -> AipResult<()> {
        let mut record = self
            .get(name)
            .await?
            .ok_or_else(|| AipError::Store(format!("No record named '{name}'")))?;
        record.set_state(state, Utc::now());
        self.update(record).await
    }
}
