//! Host a tool table on the worker runtime and keep the config hub informed.
//!
//! A [`ToolHost`] registers its identity, starts a worker runtime with the
//! standard codecs, hosts a [`ToolAgent`] under its name and announces itself
//! to the config hub as `running`. On stop it announces `stopped` first. An
//! optional self-heartbeat notices when its own hub route is dead and stops
//! the host.

use crate::dispatcher::ToolDispatcher;
use crate::heartbeat::HeartbeatProbe;
use crate::tool::Tool;
use crate::tool_agent::ToolAgent;
use crate::{standard_codecs, CONFIG_HUB_KIND};
use aip_types::agent::AgentId;
use aip_types::discovery::{ServerState, RECORD_TYPE_TOOL};
use aip_types::error::{AipError, AipResult};
use aip_types::identity::IdentityRegistry;
use aip_types::tool::{FunctionCall, FunctionExecutionResult, ToolException};
use aip_wire::{ConnectionState, RuntimeOptions, WorkerRuntime};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Self-heartbeat tuning.
#[derive(Debug, Clone)]
pub struct SelfHeartbeat {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_failures: u32,
    /// Wait `backoff * failures` before retrying after a failure.
    pub backoff: Duration,
}

impl Default for SelfHeartbeat {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(10),
            max_failures: 3,
            backoff: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolHostOptions {
    /// Agent kind the tools are hosted under.
    pub name: String,
    pub description: String,
    /// Where to announce; `None` skips announcing.
    pub config_hub: Option<AgentId>,
    /// `transport` written into the announced config.
    pub transport: String,
    /// Public URL written into the announced config.
    pub url: Option<String>,
    pub announce_timeout: Duration,
    pub self_heartbeat: Option<SelfHeartbeat>,
}

impl ToolHostOptions {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            config_hub: Some(AgentId::singleton(CONFIG_HUB_KIND)),
            transport: "grpc".into(),
            url: None,
            announce_timeout: Duration::from_secs(10),
            self_heartbeat: Some(SelfHeartbeat::default()),
        }
    }
}

pub struct ToolHost {
    options: ToolHostOptions,
    runtime: WorkerRuntime,
    dispatcher: Arc<ToolDispatcher>,
    identity: Option<(Arc<dyn IdentityRegistry>, [u8; 32])>,
    heartbeat_cancel: CancellationToken,
    stopped: AtomicBool,
}

impl ToolHost {
    pub fn new(
        options: ToolHostOptions,
        runtime_options: RuntimeOptions,
        tools: Vec<Arc<dyn Tool>>,
    ) -> AipResult<Self> {
        let dispatcher = Arc::new(ToolDispatcher::new(options.description.clone(), tools)?);
        Ok(Self {
            runtime: WorkerRuntime::new(runtime_options, standard_codecs()),
            options,
            dispatcher,
            identity: None,
            heartbeat_cancel: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    /// Bind `public_key` to this host's name in `registry` during `start`.
    pub fn with_identity(mut self, registry: Arc<dyn IdentityRegistry>, public_key: [u8; 32]) -> Self {
        self.identity = Some((registry, public_key));
        self
    }

    pub fn agent_id(&self) -> AgentId {
        AgentId::singleton(self.options.name.clone())
    }

    pub fn runtime(&self) -> &WorkerRuntime {
        &self.runtime
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    /// The description announced to the config hub: the host description
    /// followed by each tool's name, description and argument schema.
    pub fn announcement_description(&self) -> String {
        let mut out = self.options.description.clone();
        for tool in self.dispatcher.descriptors() {
            out.push('\n');
            out.push_str(&tool.name);
            out.push('\n');
            out.push_str(&tool.description);
            out.push('\n');
            out.push_str(&tool.input_schema.to_string());
        }
        out
    }

    pub async fn start(self: &Arc<Self>) -> AipResult<()> {
        let name = &self.options.name;
        info!(agent = %name, "Tool host initializing");

        if let Some((registry, public_key)) = &self.identity {
            registry.register(name, *public_key).await?;
            info!(agent = %name, "Identity registered");
        }

        self.runtime
            .register_singleton(name.clone(), Arc::new(ToolAgent::new(self.dispatcher.clone())))
            .await?;
        self.runtime.start().await?;
        info!(agent = %name, tools = self.dispatcher.len(), "Tool host started");

        if let Some(hb) = self.options.self_heartbeat.clone() {
            let host = Arc::clone(self);
            tokio::spawn(async move { host.self_heartbeat(hb).await });
        }

        if let Err(e) = self.announce(ServerState::Running).await {
            warn!(agent = %name, error = %e, "Failed to announce to config hub");
        }
        Ok(())
    }

    /// Send `register_server` for this host with `state` to the config hub.
    pub async fn announce(&self, state: ServerState) -> AipResult<()> {
        let Some(hub) = self.options.config_hub.clone() else {
            return Ok(());
        };
        let mut config = json!({
            "type": RECORD_TYPE_TOOL,
            "transport": self.options.transport,
            "state": state,
            "last_seen": Utc::now(),
        });
        if let Some(url) = &self.options.url {
            config["url"] = json!(url);
        }
        let call = FunctionCall::new(
            "register_server",
            &json!({
                "name": self.options.name,
                "description": self.announcement_description(),
                "config": config,
            }),
        );

        let reply = self
            .runtime
            .send_message(&call, hub, self.agent_id(), Some(self.options.announce_timeout))
            .await?;
        if let Some(exception) = reply.downcast_ref::<ToolException>() {
            return Err(AipError::Store(format!(
                "Config hub rejected announcement: {}",
                exception.content()
            )));
        }
        if !reply.is::<FunctionExecutionResult>() {
            return Err(AipError::UnexpectedPayload {
                expected: "FunctionExecutionResult".into(),
                actual: reply.type_name().to_string(),
            });
        }
        info!(agent = %self.options.name, %state, "Announced to config hub");
        Ok(())
    }

    async fn self_heartbeat(self: Arc<Self>, hb: SelfHeartbeat) {
        let me = self.agent_id();
        let mut failures = 0u32;
        loop {
            let outcome = tokio::select! {
                _ = self.heartbeat_cancel.cancelled() => return,
                r = self.runtime.probe(&me, &me, hb.timeout) => r,
            };
            let wait = match outcome {
                Ok(()) => {
                    failures = 0;
                    hb.interval
                }
                Err(e) => {
                    failures += 1;
                    warn!(agent = %me, failures, error = %e, "Self-heartbeat failed");
                    hb.backoff * failures
                }
            };
            if failures >= hb.max_failures {
                error!(agent = %me, failures, "Too many heartbeat failures, stopping tool host");
                if let Err(e) = self.stop().await {
                    warn!(agent = %me, error = %e, "Tool host stop failed");
                }
                return;
            }
            tokio::select! {
                _ = self.heartbeat_cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Announce `stopped`, then drain and close the runtime. Idempotent.
    pub async fn stop(&self) -> AipResult<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.heartbeat_cancel.cancel();
        if self.runtime.state() == ConnectionState::Connected {
            if let Err(e) = self.announce(ServerState::Stopped).await {
                warn!(agent = %self.options.name, error = %e, "Failed to announce stop to config hub");
            }
        }
        self.runtime.stop().await?;
        info!(agent = %self.options.name, "Tool host stopped");
        Ok(())
    }

    /// Run until SIGINT/SIGTERM or until the runtime closes on its own, then stop.
    pub async fn stop_when_signal(&self) -> AipResult<()> {
        tokio::select! {
            _ = aip_wire::lifecycle::shutdown_signal() => info!("Shutdown signal received"),
            _ = self.runtime.closed() => info!("Runtime closed"),
        }
        self.stop().await
    }
}
