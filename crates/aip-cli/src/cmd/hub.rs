use aip_types::config::AipConfig;
use aip_wire::{Hub, HubOptions};
use tracing::info;

pub async fn run(mut config: AipConfig, listen: Option<String>) -> anyhow::Result<()> {
    if let Some(addr) = listen {
        config.hub.listen_addr = addr;
    }
    let options = HubOptions::from_config(&config.hub)?;
    let (hub, accept_task) = Hub::start(options).await?;

    tokio::select! {
        _ = aip_wire::lifecycle::shutdown_signal() => info!("Shutdown signal received"),
        _ = hub.wait_shutdown() => {}
    }
    hub.shutdown();
    let _ = accept_task.await;
    info!("Hub stopped");
    Ok(())
}
