//! Resolve function calls against a local tool table.
//!
//! Every failure a caller can cause (unknown tool, bad arguments, a tool that
//! errors) comes back as a [`ToolException`] value so the channel it arrived
//! on stays healthy.

use crate::tool::Tool;
use aip_types::error::{AipError, AipResult};
use aip_types::tool::{
    validate_arguments, FunctionCall, FunctionExecutionResult, ToolDescriptor, ToolException,
    ToolOutcome,
};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Version reported by `get_capabilities`.
pub const CAPABILITIES_VERSION: &str = "1.0";

/// Introspection requests a tool agent answers.
pub const SUPPORTED_REQUEST_TYPES: [&str; 2] = ["list_tools", "get_capabilities"];

/// A read-only tool table plus the logic to invoke it.
pub struct ToolDispatcher {
    description: String,
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolDispatcher {
    /// Build a dispatcher. Tool names must be unique.
    pub fn new(description: impl Into<String>, tools: Vec<Arc<dyn Tool>>) -> AipResult<Self> {
        let mut by_name = HashMap::with_capacity(tools.len());
        for (idx, tool) in tools.iter().enumerate() {
            let name = tool.descriptor().name.clone();
            if by_name.insert(name.clone(), idx).is_some() {
                return Err(AipError::Config(format!("Duplicate tool name '{name}'")));
            }
        }
        Ok(Self {
            description: description.into(),
            tools,
            by_name,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|t| t.descriptor().clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&idx| &self.tools[idx])
    }

    /// `{ tools: [{name, description, inputSchema}], total }`
    pub fn list_tools(&self) -> serde_json::Value {
        let tools = self.descriptors();
        json!({
            "total": tools.len(),
            "tools": tools,
        })
    }

    /// `{ description, supported_request_types, tool_count, version }`
    pub fn capabilities(&self) -> serde_json::Value {
        json!({
            "description": self.description,
            "supported_request_types": SUPPORTED_REQUEST_TYPES,
            "tool_count": self.tools.len(),
            "version": CAPABILITIES_VERSION,
        })
    }

    /// Run `call` to completion.
    ///
    /// Returns `None` when `cancel` fires first; no outcome is produced then.
    pub async fn dispatch(
        &self,
        call: &FunctionCall,
        cancel: &CancellationToken,
    ) -> Option<ToolOutcome> {
        let Some(tool) = self.get(&call.name) else {
            warn!(tool = %call.name, call_id = %call.id, "Tool not found");
            return Some(Err(ToolException::not_found(&call.id, &call.name)));
        };

        let args = match parse_arguments(&call.arguments) {
            Ok(args) => args,
            Err(e) => {
                debug!(tool = %call.name, error = %e, "Unparseable tool arguments");
                return Some(Err(ToolException::invalid_arguments(
                    &call.id,
                    &call.arguments,
                )));
            }
        };
        if let Err(e) = validate_arguments(&tool.descriptor().input_schema, &args) {
            debug!(tool = %call.name, error = %e, "Tool arguments rejected by schema");
            return Some(Err(ToolException::invalid_arguments(
                &call.id,
                &call.arguments,
            )));
        }

        debug!(tool = %call.name, call_id = %call.id, "Executing tool");
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(tool = %call.name, call_id = %call.id, "Tool call cancelled");
                return None;
            }
            result = tool.run(args, cancel.clone()) => result,
        };
        if cancel.is_cancelled() {
            return None;
        }

        Some(match result {
            Ok(value) => Ok(FunctionExecutionResult {
                call_id: call.id.clone(),
                content: stringify(value),
                is_error: false,
                name: call.name.clone(),
            }),
            Err(cause) => {
                warn!(tool = %call.name, call_id = %call.id, error = %cause, "Tool execution failed");
                Err(ToolException::execution(&call.id, cause))
            }
        })
    }
}

fn parse_arguments(raw: &str) -> Result<serde_json::Value, serde_json::Error> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw)
}

/// Strings go out verbatim; anything else as compact JSON.
fn stringify(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::FunctionTool;
    use std::time::Duration;

    fn dispatcher() -> ToolDispatcher {
        let add: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "add",
            "Add two integers",
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            }),
            |args| async move {
                Ok(json!(args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0)))
            },
        ));
        let greet: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "greet",
            "Say hello",
            json!({"type": "object", "properties": {"name": {"type": "string"}}}),
            |args| async move {
                Ok(json!(format!(
                    "hello {}",
                    args["name"].as_str().unwrap_or("world")
                )))
            },
        ));
        let fail: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "fail",
            "Always fails",
            json!({"type": "object"}),
            |_args| async move { Err("disk full".to_string()) },
        ));
        let slow: Arc<dyn Tool> = Arc::new(FunctionTool::new(
            "slow",
            "Takes a while",
            json!({"type": "object"}),
            |_args| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(json!("done"))
            },
        ));
        ToolDispatcher::new("math and greetings", vec![add, greet, fail, slow]).unwrap()
    }

    fn call(name: &str, arguments: &str) -> FunctionCall {
        FunctionCall {
            id: "call-1".into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    #[tokio::test]
    async fn test_successful_call() {
        let d = dispatcher();
        let out = d
            .dispatch(&call("add", r#"{"a": 2, "b": 40}"#), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.call_id, "call-1");
        assert_eq!(out.content, "42");
        assert_eq!(out.name, "add");
        assert!(!out.is_error);
    }

    #[tokio::test]
    async fn test_string_results_are_not_quoted() {
        let d = dispatcher();
        let out = d
            .dispatch(&call("greet", r#"{"name": "bob"}"#), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.content, "hello bob");
    }

    #[tokio::test]
    async fn test_empty_arguments_mean_empty_object() {
        let d = dispatcher();
        let out = d
            .dispatch(&call("greet", ""), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(out.content, "hello world");
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let d = dispatcher();
        let err = d
            .dispatch(&call("divide", "{}"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ToolException::not_found("call-1", "divide"));
        assert_eq!(err.content(), "Tool not found: divide");
    }

    #[tokio::test]
    async fn test_unparseable_arguments() {
        let d = dispatcher();
        let err = d
            .dispatch(&call("add", "{not json"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ToolException::InvalidArguments { .. }));
        assert_eq!(err.content(), "Invalid arguments: {not json");
        assert_eq!(err.call_id(), "call-1");
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_invalid_arguments() {
        let d = dispatcher();
        let err = d
            .dispatch(&call("add", r#"{"a": "two", "b": 1}"#), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ToolException::InvalidArguments { .. }));

        let err = d
            .dispatch(&call("add", r#"{"a": 1}"#), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ToolException::InvalidArguments { .. }));
    }

    #[tokio::test]
    async fn test_execution_error() {
        let d = dispatcher();
        let err = d
            .dispatch(&call("fail", "{}"), &CancellationToken::new())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err, ToolException::execution("call-1", "disk full"));
        assert_eq!(err.content(), "Error: disk full");
    }

    #[tokio::test]
    async fn test_cancel_produces_no_outcome() {
        let d = dispatcher();
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let outcome = tokio::time::timeout(
            Duration::from_secs(2),
            d.dispatch(&call("slow", "{}"), &token),
        )
        .await
        .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_list_tools_shape() {
        let d = dispatcher();
        let listing = d.list_tools();
        assert_eq!(listing["total"], 4);
        assert_eq!(listing["tools"][0]["name"], "add");
        assert_eq!(listing["tools"][0]["inputSchema"]["required"][0], "a");
    }

    #[test]
    fn test_capabilities_shape() {
        let d = dispatcher();
        let caps = d.capabilities();
        assert_eq!(caps["description"], "math and greetings");
        assert_eq!(caps["tool_count"], 4);
        assert_eq!(caps["version"], "1.0");
        assert_eq!(
            caps["supported_request_types"],
            json!(["list_tools", "get_capabilities"])
        );
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let a: Arc<dyn Tool> = Arc::new(FunctionTool::new("x", "", json!({}), |_| async {
            Ok(json!(null))
        }));
        let b: Arc<dyn Tool> = Arc::new(FunctionTool::new("x", "", json!({}), |_| async {
            Ok(json!(null))
        }));
        assert!(ToolDispatcher::new("", vec![a, b]).is_err());
    }
}
