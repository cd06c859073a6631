//! Core kernel for the AIP agent runtime.
//!
//! Everything that sits on top of the worker runtime: the tool dispatcher and
//! the agent that exposes it, tool hosting with hub announcement, the config
//! hub tools, the health monitor, and the client side of remote tool servers.

pub mod aggregator;
pub mod config;
pub mod config_hub;
pub mod dispatcher;
pub mod error;
pub mod heartbeat;
pub mod tool;
pub mod tool_agent;
pub mod tool_host;

pub use aggregator::{CallToolResult, RemoteToolClient, ToolAggregator};
pub use dispatcher::ToolDispatcher;
pub use error::{KernelError, KernelResult};
pub use heartbeat::{HealthMonitor, HeartbeatProbe};
pub use tool::{FunctionTool, Tool};
pub use tool_agent::ToolAgent;
pub use tool_host::{ToolHost, ToolHostOptions};

use aip_wire::CodecRegistry;

/// Kind the config hub is hosted under.
pub const CONFIG_HUB_KIND: &str = "config_hub";

/// A codec registry with every payload tool agents exchange.
pub fn standard_codecs() -> CodecRegistry {
    let codecs = CodecRegistry::new();
    codecs.register_json::<aip_types::tool::FunctionCall>();
    codecs.register_json::<aip_types::tool::FunctionExecutionResult>();
    codecs.register_json::<aip_types::tool::ToolException>();
    codecs.register_json::<aip_types::message::Interaction>();
    codecs
}
