//! The agent that fronts a [`ToolDispatcher`] on the worker runtime.

use crate::dispatcher::ToolDispatcher;
use aip_types::message::{AnyPayload, Interaction};
use aip_types::tool::FunctionCall;
use aip_wire::{Agent, HandlerError, MessageContext};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Answers `FunctionCall`s and the introspection side of [`Interaction`].
///
/// Dispatch faults go back as `ToolException` payloads. The only case without
/// a reply is cancellation: the caller has already stopped waiting.
#[derive(Clone)]
pub struct ToolAgent {
    dispatcher: Arc<ToolDispatcher>,
}

impl ToolAgent {
    pub fn new(dispatcher: Arc<ToolDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<ToolDispatcher> {
        &self.dispatcher
    }

    fn on_interaction(&self, msg: Interaction, ctx: &MessageContext) -> Interaction {
        let content = match msg {
            Interaction::ListTools { .. } => self.dispatcher.list_tools(),
            Interaction::GetCapabilities { .. } => self.dispatcher.capabilities(),
            Interaction::Heartbeat { .. } => json!("ok"),
            other => json!({
                "error": format!(
                    "Unsupported action '{}'; tool agents answer list_tools, get_capabilities and FunctionCall",
                    other.action()
                )
            }),
        };
        Interaction::Response {
            source: Some(ctx.recipient.kind.clone()),
            content,
        }
    }
}

#[async_trait]
impl Agent for ToolAgent {
    async fn on_message(
        &self,
        message: AnyPayload,
        ctx: MessageContext,
    ) -> Result<AnyPayload, HandlerError> {
        let message = match message.downcast::<FunctionCall>() {
            Ok(call) => {
                debug!(tool = %call.name, sender = %ctx.sender, "Function call received");
                return match self.dispatcher.dispatch(&call, &ctx.cancellation).await {
                    Some(Ok(result)) => Ok(AnyPayload::new(result)),
                    Some(Err(exception)) => Ok(AnyPayload::new(exception)),
                    None => Err(HandlerError::Failed("cancelled".into())),
                };
            }
            Err(other) => other,
        };

        match message.downcast::<Interaction>() {
            Ok(msg) => {
                debug!(action = %msg.action(), sender = %ctx.sender, "Interaction received");
                Ok(AnyPayload::new(self.on_interaction(msg, &ctx)))
            }
            Err(other) => Err(HandlerError::Unsupported(other.type_name().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{FunctionTool, Tool};
    use aip_types::agent::AgentId;
    use aip_types::tool::{FunctionExecutionResult, ToolException};
    use tokio_util::sync::CancellationToken;

    fn agent() -> ToolAgent {
        let echo: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "echo",
            "Echo the text back",
            json!({"type": "object", "properties": {"text": {"type": "string"}}, "required": ["text"]}),
            |args| async move { Ok(args["text"].clone()) },
        ));
        ToolAgent::new(Arc::new(ToolDispatcher::new("echo agent", vec![echo]).unwrap()))
    }

    fn ctx() -> MessageContext {
        MessageContext {
            sender: AgentId::singleton("caller"),
            recipient: AgentId::singleton("echo_tools"),
            correlation_id: "c-1".into(),
            cancellation: CancellationToken::new(),
        }
    }

    async fn interact(agent: &ToolAgent, msg: Interaction) -> Interaction {
        agent
            .on_message(AnyPayload::new(msg), ctx())
            .await
            .unwrap()
            .downcast::<Interaction>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_function_call_result() {
        let agent = agent();
        let call = FunctionCall::new("echo", &json!({"text": "hi"}));
        let reply = agent
            .on_message(AnyPayload::new(call.clone()), ctx())
            .await
            .unwrap();
        let result = reply.downcast::<FunctionExecutionResult>().unwrap();
        assert_eq!(result.call_id, call.id);
        assert_eq!(result.content, "hi");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_data() {
        let agent = agent();
        let call = FunctionCall::new("nope", &json!({}));
        let reply = agent
            .on_message(AnyPayload::new(call.clone()), ctx())
            .await
            .unwrap();
        let exception = reply.downcast::<ToolException>().unwrap();
        assert_eq!(exception, ToolException::not_found(call.id, "nope"));
    }

    #[tokio::test]
    async fn test_list_tools() {
        let reply = interact(&agent(), Interaction::list_tools()).await;
        let content = reply.response_content().unwrap();
        assert_eq!(content["total"], 1);
        assert_eq!(content["tools"][0]["name"], "echo");
        assert_eq!(reply.source(), Some("echo_tools"));
    }

    #[tokio::test]
    async fn test_get_capabilities() {
        let reply = interact(&agent(), Interaction::get_capabilities()).await;
        let content = reply.response_content().unwrap();
        assert_eq!(content["description"], "echo agent");
        assert_eq!(content["tool_count"], 1);
    }

    #[tokio::test]
    async fn test_heartbeat_answers_ok() {
        let reply = interact(&agent(), Interaction::heartbeat("monitor")).await;
        assert_eq!(reply.response_content(), Some(&json!("ok")));
    }

    #[tokio::test]
    async fn test_ask_is_answered_with_error_field() {
        let reply = interact(&agent(), Interaction::ask("what can you do?")).await;
        let content = reply.response_content().unwrap();
        assert!(content["error"].as_str().unwrap().contains("ask"));
    }

    #[tokio::test]
    async fn test_cancelled_call_has_no_reply() {
        let agent = agent();
        let ctx = ctx();
        ctx.cancellation.cancel();
        let call = FunctionCall::new("echo", &json!({"text": "hi"}));
        assert!(agent.on_message(AnyPayload::new(call), ctx).await.is_err());
    }
}
