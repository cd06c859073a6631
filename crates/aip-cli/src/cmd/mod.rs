//! Command implementations.

pub mod client;
pub mod config_hub;
pub mod hub;
pub mod keygen;
pub mod tool_server;

use aip_api::auth::AuthPolicy;
use aip_api::{AppState, AuthGateway, StaticIdentityRegistry};
use aip_kernel::ToolDispatcher;
use aip_types::config::AipConfig;
use aip_types::identity::AgentKeypair;
use anyhow::Context;
use std::sync::Arc;

/// Shared state for a public endpoint serving `dispatcher`.
pub(crate) fn public_endpoint(
    config: &AipConfig,
    registry: Arc<StaticIdentityRegistry>,
    dispatcher: Arc<ToolDispatcher>,
) -> anyhow::Result<Arc<AppState>> {
    if config.gateway.owner_id.is_empty() {
        anyhow::bail!("[gateway].owner_id must be set (or AIP_AGENT_ID) to serve the public endpoint");
    }
    let gateway = Arc::new(AuthGateway::new(
        registry,
        AuthPolicy::from_config(&config.gateway),
    ));
    Ok(AppState::new(gateway, dispatcher))
}

/// The identity registry from `[identity]`.
pub(crate) fn identity_registry(config: &AipConfig) -> anyhow::Result<Arc<StaticIdentityRegistry>> {
    let registry = StaticIdentityRegistry::from_config(&config.identity)
        .context("loading [identity] agents")?;
    Ok(Arc::new(registry))
}

/// This process's key, when `[identity].key_file` is set.
pub(crate) fn own_keypair(config: &AipConfig) -> anyhow::Result<Option<AgentKeypair>> {
    let Some(path) = &config.identity.key_file else {
        return Ok(None);
    };
    let keypair = aip_api::identity::read_keypair(path)
        .with_context(|| format!("reading key file {}", path.display()))?;
    Ok(Some(keypair))
}
