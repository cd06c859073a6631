//! Configuration types for the AIP runtime.
//!
//! Every section is `#[serde(default)]` so a partial (or empty) TOML file
//! yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default hub listen address.
pub const DEFAULT_HUB_ADDR: &str = "127.0.0.1:50060";
/// Default public gateway listen address.
pub const DEFAULT_GATEWAY_ADDR: &str = "0.0.0.0:8081";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AipConfig {
    /// Other config files merged underneath this one.
    pub include: Vec<String>,
    /// `"text"` or `"json"`.
    pub log_format: LogFormat,
    pub hub: HubConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub gateway: GatewayConfig,
    pub identity: IdentityConfig,
    pub store: StoreConfig,
}

impl AipConfig {
    /// Apply `AIP_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary lookup (the environment in production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(addr) = lookup("AIP_HUB_ADDR").filter(|v| !v.is_empty()) {
            self.worker.hub_addr = addr;
        }
        if let Some(id) = lookup("AIP_AGENT_ID").filter(|v| !v.is_empty()) {
            self.gateway.owner_id = id;
        }
        if let Some(url) = lookup("AIP_SSE_URL").filter(|v| !v.is_empty()) {
            self.gateway.public_url = Some(url);
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Hub process settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address the hub listens on.
    pub listen_addr: String,
    /// Optional HMAC secret workers must prove knowledge of. Empty = open mesh.
    pub shared_secret: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_HUB_ADDR.to_string(),
            shared_secret: String::new(),
        }
    }
}

/// Worker runtime settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address of the hub to connect to.
    pub hub_addr: String,
    /// Human-readable worker name used in logs and the handshake.
    pub worker_name: String,
    /// Default timeout for `send_message`. Default: 30.
    pub request_timeout_secs: u64,
    /// How long `stop()` waits for in-flight calls. Default: 30.
    pub drain_timeout_secs: u64,
    /// Must match the hub's secret when the hub requires one.
    pub shared_secret: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hub_addr: DEFAULT_HUB_ADDR.to_string(),
            worker_name: "aip-worker".to_string(),
            request_timeout_secs: 30,
            drain_timeout_secs: 30,
            shared_secret: String::new(),
        }
    }
}

/// Health monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Seconds between check cycles. Default: 300.
    pub check_interval_secs: u64,
    /// Per-heartbeat timeout. Default: 10.
    pub heartbeat_timeout_secs: u64,
    /// Consecutive failures before a record is marked stopped. Default: 3.
    pub failure_threshold: u32,
    /// Delete records stopped for longer than this. Unset = keep forever.
    pub purge_stopped_after_secs: Option<u64>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval_secs: 300,
            heartbeat_timeout_secs: 10,
            failure_threshold: 3,
            purge_stopped_after_secs: None,
        }
    }
}

/// Public HTTP tool endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub listen_addr: String,
    /// The agent id that owns this endpoint; callers must be authorized
    /// against it.
    pub owner_id: String,
    /// URL announced to the config hub. Derived from `listen_addr` if unset.
    pub public_url: Option<String>,
    /// Maximum accepted age of an auth timestamp. Default: 300.
    pub replay_window_secs: u64,
    /// Maximum accepted clock skew for future timestamps. Default: 30.
    pub max_future_skew_secs: u64,
    /// Requests per minute per client IP. 0 disables limiting. Default: 500.
    pub rate_limit_per_minute: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_GATEWAY_ADDR.to_string(),
            owner_id: String::new(),
            public_url: None,
            replay_window_secs: 300,
            max_future_skew_secs: 30,
            rate_limit_per_minute: 500,
        }
    }
}

/// Identity material and the static authorization table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// File holding this process's hex-encoded ed25519 seed.
    pub key_file: Option<PathBuf>,
    pub agents: Vec<AgentKeyEntry>,
    pub authorizations: Vec<AuthorizationEntry>,
}

/// A known agent and its public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentKeyEntry {
    pub id: String,
    /// Hex-encoded 32-byte ed25519 public key.
    pub public_key: String,
}

/// `caller` may open sessions against endpoints owned by `owner`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationEntry {
    pub owner: String,
    pub caller: String,
}

/// Discovery store settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. Unset = in-memory store.
    pub path: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: AipConfig = toml::from_str("").unwrap();
        assert_eq!(config.hub.listen_addr, DEFAULT_HUB_ADDR);
        assert_eq!(config.worker.request_timeout_secs, 30);
        assert_eq!(config.health.failure_threshold, 3);
        assert_eq!(config.health.check_interval_secs, 300);
        assert!(config.health.purge_stopped_after_secs.is_none());
        assert_eq!(config.gateway.replay_window_secs, 300);
        assert_eq!(config.gateway.max_future_skew_secs, 30);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_partial_sections() {
        let config: AipConfig = toml::from_str(
            r#"
            log_format = "json"

            [health]
            check_interval_secs = 30

            [[identity.agents]]
            id = "alice"
            public_key = "00"

            [[identity.authorizations]]
            owner = "tools"
            caller = "alice"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.health.check_interval_secs, 30);
        assert_eq!(config.health.heartbeat_timeout_secs, 10);
        assert_eq!(config.identity.agents.len(), 1);
        assert_eq!(config.identity.authorizations[0].caller, "alice");
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("AIP_HUB_ADDR", "10.0.0.1:50060"),
            ("AIP_AGENT_ID", "tools_owner"),
            ("AIP_SSE_URL", "http://example.net:8081"),
        ]
        .into_iter()
        .collect();
        let mut config = AipConfig::default();
        config.apply_overrides(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.worker.hub_addr, "10.0.0.1:50060");
        assert_eq!(config.gateway.owner_id, "tools_owner");
        assert_eq!(
            config.gateway.public_url.as_deref(),
            Some("http://example.net:8081")
        );
    }
}
