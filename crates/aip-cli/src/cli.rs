//! Clap CLI definitions for `aip`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  aip hub                                   Run the hub on [hub].listen_addr
  aip config-hub --serve-sse                Config hub + health monitor + public endpoint
  aip tool-server                           Public endpoint for the config hub tools
  aip list-tools weather                    Show the tools a server exposes
  aip call weather forecast '{\"city\":\"Oslo\"}'
  aip keygen                                Write a new agent key to ~/.aip/agent.key";

/// AIP: agents addressing each other through a hub and exposing tools.
#[derive(Parser)]
#[command(name = "aip", version, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.aip/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the hub workers connect to.
    Hub {
        /// Override [hub].listen_addr.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Run the config hub: discovery tools plus the health monitor.
    ConfigHub {
        /// Do not probe announced servers.
        #[arg(long)]
        no_health_check: bool,
        /// Seconds between health cycles (overrides [health].check_interval_secs).
        #[arg(long)]
        check_interval: Option<u64>,
        /// Also serve the config hub tools on the public endpoint.
        #[arg(long)]
        serve_sse: bool,
    },
    /// Serve the config hub tools on the public endpoint only.
    ToolServer {
        /// Override [gateway].listen_addr.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Call a tool on a server reachable through the hub.
    Call {
        /// Kind the tool server is hosted under.
        server: String,
        /// Tool name.
        tool: String,
        /// Arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,
        /// Seconds to wait for the reply.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
    /// List the tools a server exposes.
    ListTools {
        /// Kind the tool server is hosted under.
        server: String,
    },
    /// Generate an ed25519 agent key.
    Keygen {
        /// Where to write the seed (default: [identity].key_file or ~/.aip/agent.key).
        #[arg(long)]
        out: Option<PathBuf>,
        /// Overwrite an existing key file.
        #[arg(long)]
        force: bool,
    },
}
