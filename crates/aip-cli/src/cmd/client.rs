//! One-shot calls into the mesh.

use aip_kernel::{standard_codecs, RemoteToolClient};
use aip_types::agent::AgentId;
use aip_types::config::AipConfig;
use aip_wire::{RuntimeOptions, WorkerRuntime};
use anyhow::Context;
use std::time::Duration;

async fn connect(config: &AipConfig) -> anyhow::Result<RemoteToolClient> {
    let runtime = WorkerRuntime::new(RuntimeOptions::from_config(&config.worker), standard_codecs());
    runtime
        .start()
        .await
        .with_context(|| format!("connecting to hub at {}", config.worker.hub_addr))?;
    let identity = AgentId::new("aip-cli", uuid::Uuid::new_v4().to_string());
    Ok(RemoteToolClient::new(runtime, identity))
}

pub async fn call(
    config: AipConfig,
    server: &str,
    tool: &str,
    args: &str,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let arguments: serde_json::Value =
        serde_json::from_str(args).context("arguments must be a JSON object")?;
    if !arguments.is_object() {
        anyhow::bail!("arguments must be a JSON object");
    }

    let client = connect(&config)
        .await?
        .with_timeout(Duration::from_secs(timeout_secs));
    let result = client.call(server, tool, &arguments).await;
    client.runtime().stop().await?;

    let result = result?;
    if result.is_error {
        anyhow::bail!("{}", result.content);
    }
    println!("{}", result.content);
    Ok(())
}

pub async fn list_tools(config: AipConfig, server: &str) -> anyhow::Result<()> {
    let client = connect(&config).await?;
    let tools = client.list_tools(server).await;
    client.runtime().stop().await?;

    let tools = tools?;
    println!("{}", serde_json::to_string_pretty(&tools)?);
    Ok(())
}
