//! Message envelopes and payload typing.
//!
//! Every value that crosses the wire is a [`Payload`]: a serde type with a
//! stable name. The name travels in the [`Envelope`] next to the encoded bytes
//! so the receiving side can pick the right codec without guessing.

use crate::agent::AgentId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// A typed message body that can be put on the wire.
pub trait Payload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable type name used to select the codec on the receiving side.
    const TYPE_NAME: &'static str;
}

/// A message in flight between two agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Name of the payload type, resolved against the codec registry.
    pub payload_type: String,
    /// Encoded payload.
    #[serde(with = "crate::serde_compat::base64_bytes")]
    pub payload: Vec<u8>,
    /// The agent that produced this envelope.
    pub sender: AgentId,
    /// The agent this envelope is addressed to.
    pub target: AgentId,
    /// Links a request to its response. Generated by the caller, echoed by
    /// the callee, never rewritten in between.
    pub correlation_id: String,
}

impl Envelope {
    /// Build the reply envelope for this request: sender and target swap,
    /// the correlation id is echoed.
    pub fn reply(&self, payload_type: impl Into<String>, payload: Vec<u8>) -> Envelope {
        Envelope {
            payload_type: payload_type.into(),
            payload,
            sender: self.target.clone(),
            target: self.sender.clone(),
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// A decoded payload whose concrete type is only known at runtime.
pub struct AnyPayload {
    type_name: String,
    value: Box<dyn Any + Send>,
}

impl AnyPayload {
    /// Wrap a typed payload.
    pub fn new<T: Payload>(value: T) -> Self {
        Self {
            type_name: T::TYPE_NAME.to_string(),
            value: Box::new(value),
        }
    }

    /// Wrap an already type-erased value produced by a codec.
    pub fn from_boxed(type_name: impl Into<String>, value: Box<dyn Any + Send>) -> Self {
        Self {
            type_name: type_name.into(),
            value,
        }
    }

    /// The payload's registered type name.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Whether the payload holds a `T`.
    pub fn is<T: Payload>(&self) -> bool {
        self.type_name == T::TYPE_NAME && self.value.is::<T>()
    }

    /// Borrow the payload as a `T`.
    pub fn downcast_ref<T: Payload>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    /// Take the payload as a `T`, handing it back unchanged on mismatch.
    pub fn downcast<T: Payload>(self) -> Result<T, AnyPayload> {
        let type_name = self.type_name;
        match self.value.downcast::<T>() {
            Ok(v) => Ok(*v),
            Err(value) => Err(AnyPayload { type_name, value }),
        }
    }

    /// Borrow the inner value for codec use.
    pub fn as_any(&self) -> &(dyn Any + Send) {
        self.value.as_ref()
    }
}

impl fmt::Debug for AnyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyPayload")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// The interaction verbs agents understand besides function calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionAction {
    ListTools,
    GetCapabilities,
    Heartbeat,
    Ask,
    Response,
}

impl InteractionAction {
    /// Wire name of the action.
    pub fn as_str(&self) -> &'static str {
        match self {
            InteractionAction::ListTools => "list_tools",
            InteractionAction::GetCapabilities => "get_capabilities",
            InteractionAction::Heartbeat => "heartbeat",
            InteractionAction::Ask => "ask",
            InteractionAction::Response => "response",
        }
    }
}

impl fmt::Display for InteractionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic agent-to-agent interaction, tagged by `action`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Interaction {
    /// Ask a tool agent to describe its tool table.
    ListTools {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Ask an agent to describe itself.
    GetCapabilities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Liveness probe with no business payload.
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
    },
    /// Free-form question for conversational agents.
    Ask {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
    },
    /// Answer to any of the above.
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<String>,
        #[serde(default)]
        content: serde_json::Value,
    },
}

impl Interaction {
    /// Which action this message carries.
    pub fn action(&self) -> InteractionAction {
        match self {
            Interaction::ListTools { .. } => InteractionAction::ListTools,
            Interaction::GetCapabilities { .. } => InteractionAction::GetCapabilities,
            Interaction::Heartbeat { .. } => InteractionAction::Heartbeat,
            Interaction::Ask { .. } => InteractionAction::Ask,
            Interaction::Response { .. } => InteractionAction::Response,
        }
    }

    /// Who sent this interaction, if they said.
    pub fn source(&self) -> Option<&str> {
        match self {
            Interaction::ListTools { source }
            | Interaction::GetCapabilities { source }
            | Interaction::Heartbeat { source }
            | Interaction::Ask { source, .. }
            | Interaction::Response { source, .. } => source.as_deref(),
        }
    }

    pub fn list_tools() -> Self {
        Interaction::ListTools { source: None }
    }

    pub fn get_capabilities() -> Self {
        Interaction::GetCapabilities { source: None }
    }

    pub fn heartbeat(source: impl Into<String>) -> Self {
        Interaction::Heartbeat {
            source: Some(source.into()),
        }
    }

    pub fn ask(content: impl Into<String>) -> Self {
        Interaction::Ask {
            source: None,
            content: serde_json::Value::String(content.into()),
        }
    }

    /// Build a response carrying `content`.
    pub fn response(content: serde_json::Value) -> Self {
        Interaction::Response {
            source: None,
            content,
        }
    }

    /// The response content, if this is a response.
    pub fn response_content(&self) -> Option<&serde_json::Value> {
        match self {
            Interaction::Response { content, .. } => Some(content),
            _ => None,
        }
    }
}

impl Payload for Interaction {
    const TYPE_NAME: &'static str = "InteractionMessage";
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interaction_wire_shape() {
        let msg = Interaction::list_tools();
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"action": "list_tools"})
        );

        let msg: Interaction =
            serde_json::from_value(json!({"action": "heartbeat", "source": "config_hub"})).unwrap();
        assert_eq!(msg.action(), InteractionAction::Heartbeat);
        assert_eq!(msg.source(), Some("config_hub"));
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let res = serde_json::from_value::<Interaction>(json!({"action": "custom_action"}));
        assert!(res.is_err());
    }

    #[test]
    fn test_action_names_match_serde() {
        for action in [
            InteractionAction::ListTools,
            InteractionAction::GetCapabilities,
            InteractionAction::Heartbeat,
            InteractionAction::Ask,
            InteractionAction::Response,
        ] {
            let v = serde_json::to_value(action).unwrap();
            assert_eq!(v, json!(action.as_str()));
        }
    }

    #[test]
    fn test_envelope_reply_swaps_addresses() {
        let req = Envelope {
            payload_type: "InteractionMessage".into(),
            payload: b"{}".to_vec(),
            sender: AgentId::new("caller", "a"),
            target: AgentId::new("tools", "default"),
            correlation_id: "corr-1".into(),
        };
        let reply = req.reply("InteractionMessage", b"{\"x\":1}".to_vec());
        assert_eq!(reply.sender, req.target);
        assert_eq!(reply.target, req.sender);
        assert_eq!(reply.correlation_id, "corr-1");
    }

    #[test]
    fn test_any_payload_downcast() {
        let p = AnyPayload::new(Interaction::heartbeat("me"));
        assert!(p.is::<Interaction>());
        assert_eq!(p.type_name(), "InteractionMessage");
        let msg = p.downcast::<Interaction>().unwrap();
        assert_eq!(msg.action(), InteractionAction::Heartbeat);
    }
}
