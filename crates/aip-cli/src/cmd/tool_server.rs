use super::{identity_registry, public_endpoint};
use aip_api::rate_limiter::create_rate_limiter;
use aip_api::run_server;
use aip_kernel::config_hub::{config_hub_tools, CONFIG_HUB_DESCRIPTION};
use aip_kernel::ToolDispatcher;
use aip_types::config::AipConfig;
use anyhow::Context;
use std::sync::Arc;

/// Serve the config hub tools over the public endpoint, without joining a hub.
///
/// Point `[store].path` at the config hub's database to share its records.
pub async fn run(mut config: AipConfig, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.gateway.listen_addr = addr;
    }
    let store = aip_memory::open_store(&config.store).context("opening discovery store")?;
    let dispatcher = Arc::new(ToolDispatcher::new(
        CONFIG_HUB_DESCRIPTION,
        config_hub_tools(store),
    )?);

    let state = public_endpoint(&config, identity_registry(&config)?, dispatcher)?;
    let limiter = create_rate_limiter(config.gateway.rate_limit_per_minute);
    run_server(
        &config.gateway,
        state,
        limiter,
        aip_wire::lifecycle::shutdown_signal(),
    )
    .await?;
    Ok(())
}
