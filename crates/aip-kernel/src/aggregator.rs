//! Client side of hub-routed tool servers.
//!
//! [`RemoteToolClient`] talks to one tool agent at a time. [`ToolAggregator`]
//! loads several and exposes their tools under namespaced names
//! (`"<server>-<tool>"`).

use aip_types::agent::AgentId;
use aip_types::error::{AipError, AipResult};
use aip_types::message::Interaction;
use aip_types::tool::{FunctionCall, FunctionExecutionResult, ToolDescriptor, ToolException};
use aip_wire::WorkerRuntime;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

/// Joins server and tool names in namespaced tool names.
pub const TOOL_NAME_SEPARATOR: &str = "-";

/// Outcome of a remote tool call as the caller sees it.
///
/// Dispatch faults on the far side arrive here with `is_error = true`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub content: String,
}

impl CallToolResult {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            is_error: false,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            is_error: true,
            content: content.into(),
        }
    }
}

/// Calls tool agents through a worker runtime.
#[derive(Clone)]
pub struct RemoteToolClient {
    runtime: WorkerRuntime,
    identity: AgentId,
    timeout: Option<Duration>,
}

impl RemoteToolClient {
    pub fn new(runtime: WorkerRuntime, identity: AgentId) -> Self {
        Self {
            runtime,
            identity,
            timeout: None,
        }
    }

    /// Per-call timeout. `None` uses the runtime's default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    async fn interact(&self, server: &str, msg: Interaction) -> AipResult<serde_json::Value> {
        let reply: Interaction = self
            .runtime
            .call(
                &msg,
                AgentId::singleton(server),
                self.identity.clone(),
                self.timeout,
            )
            .await?;
        match reply {
            Interaction::Response { content, .. } => Ok(content),
            other => Err(AipError::UnexpectedPayload {
                expected: "response".into(),
                actual: other.action().to_string(),
            }),
        }
    }

    /// Fetch the tool table of `server`. Malformed entries are skipped.
    pub async fn list_tools(&self, server: &str) -> AipResult<Vec<ToolDescriptor>> {
        let content = self.interact(server, Interaction::list_tools()).await?;
        let Some(entries) = content.get("tools").and_then(|t| t.as_array()) else {
            return Err(AipError::UnexpectedPayload {
                expected: "tool listing".into(),
                actual: content.to_string(),
            });
        };
        let mut tools = Vec::with_capacity(entries.len());
        for entry in entries {
            match serde_json::from_value::<ToolDescriptor>(entry.clone()) {
                Ok(tool) if !tool.name.is_empty() => tools.push(tool),
                Ok(_) => warn!(server, "Skipping unnamed tool"),
                Err(e) => warn!(server, error = %e, "Skipping malformed tool entry"),
            }
        }
        Ok(tools)
    }

    pub async fn capabilities(&self, server: &str) -> AipResult<serde_json::Value> {
        self.interact(server, Interaction::get_capabilities()).await
    }

    /// Invoke `tool` on `server`. Transport faults are errors; dispatch faults
    /// are an `is_error` result.
    pub async fn call(
        &self,
        server: &str,
        tool: &str,
        arguments: &serde_json::Value,
    ) -> AipResult<CallToolResult> {
        let call = FunctionCall::new(tool, arguments);
        let reply = self
            .runtime
            .send_message(
                &call,
                AgentId::singleton(server),
                self.identity.clone(),
                self.timeout,
            )
            .await?;
        let reply = match reply.downcast::<FunctionExecutionResult>() {
            Ok(result) => {
                return Ok(if result.is_error {
                    CallToolResult::error(if result.content.is_empty() {
                        "Tool execution failed".to_string()
                    } else {
                        result.content
                    })
                } else {
                    CallToolResult::ok(result.content)
                })
            }
            Err(other) => other,
        };
        match reply.downcast::<ToolException>() {
            Ok(exception) => Ok(CallToolResult::error(exception.content())),
            Err(other) => {
                warn!(server, tool, actual = other.type_name(), "Invalid response format");
                Ok(CallToolResult::error("Invalid response format"))
            }
        }
    }
}

/// Tools of several servers behind one namespace.
pub struct ToolAggregator {
    client: RemoteToolClient,
    /// Loaded servers in load order with their tools.
    servers: RwLock<Vec<(String, Vec<ToolDescriptor>)>>,
}

impl ToolAggregator {
    pub fn new(client: RemoteToolClient) -> Self {
        Self {
            client,
            servers: RwLock::new(Vec::new()),
        }
    }

    pub fn client(&self) -> &RemoteToolClient {
        &self.client
    }

    /// Fetch and cache the tools of `server`, replacing any earlier listing.
    /// Returns how many tools it has.
    pub async fn load_server(&self, server: &str) -> AipResult<usize> {
        let tools = self.client.list_tools(server).await?;
        let count = tools.len();
        for tool in &tools {
            info!(server, tool = %tool.name, "Loaded remote tool");
        }
        let mut servers = self.servers.write().unwrap_or_else(|e| e.into_inner());
        match servers.iter_mut().find(|(name, _)| name == server) {
            Some(entry) => entry.1 = tools,
            None => servers.push((server.to_string(), tools)),
        }
        Ok(count)
    }

    pub fn list_servers(&self) -> Vec<String> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.iter().map(|(name, _)| name.clone()).collect()
    }

    /// Every cached tool, renamed to `"<server>-<tool>"`.
    pub fn list_tools(&self) -> Vec<ToolDescriptor> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers
            .iter()
            .flat_map(|(server, tools)| {
                tools.iter().map(move |tool| ToolDescriptor {
                    name: namespaced(server, &tool.name),
                    ..tool.clone()
                })
            })
            .collect()
    }

    /// Cached tools of one server, un-namespaced.
    pub fn server_tools(&self, server: &str) -> Option<Vec<ToolDescriptor>> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        servers
            .iter()
            .find(|(name, _)| name == server)
            .map(|(_, tools)| tools.clone())
    }

    /// Map a namespaced or bare tool name to `(server, tool)`. First match wins.
    pub fn resolve(&self, name: &str) -> Option<(String, String)> {
        let servers = self.servers.read().unwrap_or_else(|e| e.into_inner());
        let namespaced_hit = servers.iter().find_map(|(server, tools)| {
            tools
                .iter()
                .find(|t| namespaced(server, &t.name) == name)
                .map(|t| (server.clone(), t.name.clone()))
        });
        namespaced_hit.or_else(|| {
            servers.iter().find_map(|(server, tools)| {
                tools
                    .iter()
                    .find(|t| t.name == name)
                    .map(|t| (server.clone(), t.name.clone()))
            })
        })
    }

    /// Call a tool by namespaced or bare name.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
    ) -> AipResult<CallToolResult> {
        let Some((server, tool)) = self.resolve(name) else {
            warn!(tool = name, "Tool not found in any loaded server");
            return Ok(CallToolResult::error(format!("Tool '{name}' not found")));
        };
        info!(requested = name, server = %server, tool = %tool, "Routing tool call");
        self.client.call(&server, &tool, arguments).await
    }
}

fn namespaced(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_NAME_SEPARATOR}{tool}")
}
