//! `aip`: run the hub, the config hub and tool endpoints, or talk to them.

mod cli;
mod cmd;

use crate::cli::{Cli, Commands};
use aip_types::config::{AipConfig, LogFormat};
use clap::Parser;
use std::path::Path;

fn env_filter() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
}

fn init_tracing(json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load config with a temporary stderr subscriber so load warnings are not
/// lost before the real one (whose format depends on the config) exists.
fn load_config(path: Option<&Path>) -> AipConfig {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::with_default(subscriber, || aip_kernel::config::load(path))
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_tracing(cli.log_json || config.log_format == LogFormat::Json);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        match cli.command {
            Commands::Hub { listen } => cmd::hub::run(config, listen).await,
            Commands::ConfigHub {
                no_health_check,
                check_interval,
                serve_sse,
            } => {
                cmd::config_hub::run(
                    config,
                    cmd::config_hub::Flags {
                        health_check: !no_health_check,
                        check_interval,
                        serve_sse,
                    },
                )
                .await
            }
            Commands::ToolServer { listen } => cmd::tool_server::run(config, listen).await,
            Commands::Call {
                server,
                tool,
                args,
                timeout,
            } => cmd::client::call(config, &server, &tool, &args, timeout).await,
            Commands::ListTools { server } => cmd::client::list_tools(config, &server).await,
            Commands::Keygen { out, force } => cmd::keygen::run(&config, out, force),
        }
    })
}
