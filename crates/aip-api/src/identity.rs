//! Config-backed identity registry and client-side header signing.

use crate::auth::{HEADER_AGENT, HEADER_SIGN, HEADER_TIMESTAMP};
use aip_types::config::IdentityConfig;
use aip_types::error::{AipError, AipResult};
use aip_types::identity::{parse_public_key, AgentKeypair, IdentityRegistry};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::path::Path;
use tracing::{debug, info};

/// An in-process [`IdentityRegistry`] seeded from `[identity]` config.
///
/// An owner is always authorized against its own endpoints.
#[derive(Debug, Default)]
pub struct StaticIdentityRegistry {
    keys: DashMap<String, [u8; 32]>,
    authorizations: DashSet<(String, String)>,
}

impl StaticIdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &IdentityConfig) -> AipResult<Self> {
        let registry = Self::new();
        for entry in &config.agents {
            registry.insert_key(&entry.id, &entry.public_key)?;
        }
        for grant in &config.authorizations {
            registry.authorize(&grant.owner, &grant.caller);
        }
        info!(
            agents = registry.keys.len(),
            authorizations = registry.authorizations.len(),
            "Identity registry loaded"
        );
        Ok(registry)
    }

    /// Bind `agent_id` to a hex-encoded public key.
    pub fn insert_key(&self, agent_id: &str, public_key_hex: &str) -> AipResult<()> {
        let key = parse_public_key(public_key_hex)
            .map_err(|e| AipError::Identity(format!("agent '{agent_id}': {e}")))?;
        self.keys.insert(agent_id.to_string(), key);
        Ok(())
    }

    pub fn authorize(&self, owner_id: &str, caller_id: &str) {
        self.authorizations
            .insert((owner_id.to_string(), caller_id.to_string()));
    }
}

#[async_trait]
impl IdentityRegistry for StaticIdentityRegistry {
    async fn register(&self, agent_id: &str, public_key: [u8; 32]) -> AipResult<()> {
        debug!(agent = %agent_id, "Registering agent key");
        self.keys.insert(agent_id.to_string(), public_key);
        Ok(())
    }

    async fn get_public_key(&self, agent_id: &str) -> AipResult<Option<[u8; 32]>> {
        Ok(self.keys.get(agent_id).map(|k| *k.value()))
    }

    async fn is_authorized(&self, owner_id: &str, caller_id: &str) -> AipResult<bool> {
        Ok(owner_id == caller_id
            || self
                .authorizations
                .contains(&(owner_id.to_string(), caller_id.to_string())))
    }
}

/// Headers a caller attaches to prove it is `agent_id` at time `now`.
pub fn sign_auth_headers(
    keypair: &AgentKeypair,
    agent_id: &str,
    now: i64,
) -> [(&'static str, String); 3] {
    let timestamp = now.to_string();
    let signature = keypair.sign(timestamp.as_bytes());
    [
        (HEADER_AGENT, agent_id.to_string()),
        (HEADER_TIMESTAMP, timestamp),
        (HEADER_SIGN, signature),
    ]
}

/// Read a key file holding a hex-encoded seed.
pub fn read_keypair(path: &Path) -> AipResult<AgentKeypair> {
    let seed = std::fs::read_to_string(path)?;
    AgentKeypair::from_seed_hex(&seed)
}

/// Write `keypair`'s seed to `path`, readable by the owner only.
pub fn write_keypair(path: &Path, keypair: &AgentKeypair) -> AipResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, keypair.seed_hex().as_bytes())?;
    restrict_file_permissions(path);
    Ok(())
}

#[cfg(unix)]
fn restrict_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_file_permissions(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use aip_types::config::{AgentKeyEntry, AuthorizationEntry};

    #[tokio::test]
    async fn test_from_config() {
        let kp = AgentKeypair::generate();
        let config = IdentityConfig {
            key_file: None,
            agents: vec![AgentKeyEntry {
                id: "alice".into(),
                public_key: kp.public_key_hex(),
            }],
            authorizations: vec![AuthorizationEntry {
                owner: "bob".into(),
                caller: "alice".into(),
            }],
        };
        let registry = StaticIdentityRegistry::from_config(&config).unwrap();

        assert!(registry.verify("alice", b"42", &kp.sign(b"42")).await.unwrap());
        assert!(!registry.verify("carol", b"42", &kp.sign(b"42")).await.unwrap());
        assert!(registry.is_authorized("bob", "alice").await.unwrap());
        assert!(!registry.is_authorized("alice", "bob").await.unwrap());
        assert!(registry.is_authorized("bob", "bob").await.unwrap());
    }

    #[test]
    fn test_bad_public_key_rejected() {
        let config = IdentityConfig {
            key_file: None,
            agents: vec![AgentKeyEntry {
                id: "alice".into(),
                public_key: "nothex".into(),
            }],
            authorizations: vec![],
        };
        let err = StaticIdentityRegistry::from_config(&config).unwrap_err();
        assert!(err.to_string().contains("alice"));
    }

    #[tokio::test]
    async fn test_register_overrides_key() {
        let registry = StaticIdentityRegistry::new();
        let old = AgentKeypair::generate();
        let new = AgentKeypair::generate();
        registry.insert_key("a", &old.public_key_hex()).unwrap();
        let pk = parse_public_key(&new.public_key_hex()).unwrap();
        registry.register("a", pk).await.unwrap();
        assert_eq!(registry.get_public_key("a").await.unwrap(), Some(pk));
    }

    #[tokio::test]
    async fn test_signed_headers_verify() {
        let kp = AgentKeypair::generate();
        let registry = StaticIdentityRegistry::new();
        registry.insert_key("alice", &kp.public_key_hex()).unwrap();

        let headers = sign_auth_headers(&kp, "alice", 1_700_000_000);
        assert_eq!(headers[0], (HEADER_AGENT, "alice".to_string()));
        assert_eq!(headers[1], (HEADER_TIMESTAMP, "1700000000".to_string()));
        assert!(registry
            .verify("alice", b"1700000000", &headers[2].1)
            .await
            .unwrap());
    }

    #[test]
    fn test_key_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("agent.key");
        let kp = AgentKeypair::generate();
        write_keypair(&path, &kp).unwrap();
        let loaded = read_keypair(&path).unwrap();
        assert_eq!(loaded.public_key_hex(), kp.public_key_hex());
    }
}
