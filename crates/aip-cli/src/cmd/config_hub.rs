use super::{identity_registry, own_keypair, public_endpoint};
use aip_api::rate_limiter::create_rate_limiter;
use aip_api::run_server;
use aip_kernel::config_hub::{config_hub_tools, CONFIG_HUB_DESCRIPTION};
use aip_kernel::{HealthMonitor, ToolHost, ToolHostOptions, CONFIG_HUB_KIND};
use aip_types::config::AipConfig;
use aip_types::identity::parse_public_key;
use aip_wire::RuntimeOptions;
use anyhow::Context;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

pub struct Flags {
    pub health_check: bool,
    pub check_interval: Option<u64>,
    pub serve_sse: bool,
}

pub async fn run(mut config: AipConfig, flags: Flags) -> anyhow::Result<()> {
    if let Some(secs) = flags.check_interval {
        config.health.check_interval_secs = secs;
    }
    config.health.enabled &= flags.health_check;

    let store = aip_memory::open_store(&config.store).context("opening discovery store")?;
    let registry = identity_registry(&config)?;

    let mut options = ToolHostOptions::new(CONFIG_HUB_KIND, CONFIG_HUB_DESCRIPTION);
    // The config hub is where announcements go; it does not announce itself.
    options.config_hub = None;
    options.url = config.gateway.public_url.clone();
    let mut host = ToolHost::new(
        options,
        RuntimeOptions::from_config(&config.worker),
        config_hub_tools(store.clone()),
    )?;
    if let Some(keypair) = own_keypair(&config)? {
        let public_key = parse_public_key(&keypair.public_key_hex()).map_err(anyhow::Error::msg)?;
        host = host.with_identity(registry.clone(), public_key);
    }
    let host = Arc::new(host);
    host.start().await.context("starting config hub")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let monitor = HealthMonitor::new(
        store,
        Arc::new(host.runtime().clone()),
        host.agent_id(),
        config.health.clone(),
    );
    let monitor_task = tokio::spawn(monitor.run(shutdown_rx.clone()));

    let server_task = if flags.serve_sse {
        let state = public_endpoint(&config, registry, host.dispatcher().clone())?;
        let limiter = create_rate_limiter(config.gateway.rate_limit_per_minute);
        let gateway_config = config.gateway.clone();
        let mut rx = shutdown_rx;
        Some(tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.wait_for(|v| *v).await;
            };
            if let Err(e) = run_server(&gateway_config, state, limiter, shutdown).await {
                error!(error = %e, "Public endpoint failed");
            }
        }))
    } else {
        None
    };

    info!(kind = CONFIG_HUB_KIND, "Config hub running");
    host.stop_when_signal().await?;

    let _ = shutdown_tx.send(true);
    let _ = monitor_task.await;
    if let Some(task) = server_task {
        let _ = task.await;
    }
    Ok(())
}
