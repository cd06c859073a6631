//! Tool descriptors, function calls and their outcomes.

use crate::message::Payload;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Definition of a tool an agent exposes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Unique within the hosting agent's tool table.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema for the tool's arguments.
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object_schema")]
    pub input_schema: serde_json::Value,
}

/// The schema used when a tool takes no arguments.
pub fn empty_object_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {},
        "required": []
    })
}

/// A request to invoke a named tool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCall {
    /// Caller-chosen id, echoed as `call_id` in the outcome.
    pub id: String,
    /// Tool to invoke.
    pub name: String,
    /// Arguments as raw JSON text.
    #[serde(deserialize_with = "crate::serde_compat::string_or_json")]
    pub arguments: String,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, arguments: &serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            arguments: arguments.to_string(),
        }
    }
}

impl Payload for FunctionCall {
    const TYPE_NAME: &'static str = "FunctionCall";
}

/// Successful outcome of a [`FunctionCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionExecutionResult {
    /// Equals the originating `FunctionCall.id`.
    pub call_id: String,
    /// Stringified tool output.
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
    /// Name of the tool that ran.
    pub name: String,
}

impl Payload for FunctionExecutionResult {
    const TYPE_NAME: &'static str = "FunctionExecutionResult";
}

/// A dispatch fault, carried back to the caller as data.
///
/// Every variant keeps the originating call id so the caller can still
/// correlate the failure with its request.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolException {
    /// The requested tool is not in the table.
    #[error("{content}")]
    NotFound { call_id: String, content: String },
    /// The arguments did not parse or did not match the schema.
    #[error("{content}")]
    InvalidArguments { call_id: String, content: String },
    /// The tool itself failed.
    #[error("{content}")]
    Execution { call_id: String, content: String },
}

impl ToolException {
    pub fn not_found(call_id: impl Into<String>, name: &str) -> Self {
        ToolException::NotFound {
            call_id: call_id.into(),
            content: format!("Tool not found: {name}"),
        }
    }

    pub fn invalid_arguments(call_id: impl Into<String>, raw: &str) -> Self {
        ToolException::InvalidArguments {
            call_id: call_id.into(),
            content: format!("Invalid arguments: {raw}"),
        }
    }

    pub fn execution(call_id: impl Into<String>, cause: impl std::fmt::Display) -> Self {
        ToolException::Execution {
            call_id: call_id.into(),
            content: format!("Error: {cause}"),
        }
    }

    /// The id of the call that failed.
    pub fn call_id(&self) -> &str {
        match self {
            ToolException::NotFound { call_id, .. }
            | ToolException::InvalidArguments { call_id, .. }
            | ToolException::Execution { call_id, .. } => call_id,
        }
    }

    /// The human-readable failure text.
    pub fn content(&self) -> &str {
        match self {
            ToolException::NotFound { content, .. }
            | ToolException::InvalidArguments { content, .. }
            | ToolException::Execution { content, .. } => content,
        }
    }
}

impl Payload for ToolException {
    const TYPE_NAME: &'static str = "ToolException";
}

/// What dispatching a `FunctionCall` produces.
pub type ToolOutcome = Result<FunctionExecutionResult, ToolException>;

/// Check `args` against a tool's JSON Schema.
///
/// Only the subset tool schemas actually use is enforced: the top level must
/// be an object, `required` keys must be present, and declared property types
/// must match. Unknown keys are allowed.
pub fn validate_arguments(
    schema: &serde_json::Value,
    args: &serde_json::Value,
) -> Result<(), String> {
    let obj = args
        .as_object()
        .ok_or_else(|| "arguments must be a JSON object".to_string())?;

    if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
        for key in required.iter().filter_map(|k| k.as_str()) {
            if !obj.contains_key(key) {
                return Err(format!("missing required argument '{key}'"));
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (key, value) in obj {
        let Some(expected) = props.get(key).and_then(|p| p.get("type")) else {
            continue;
        };
        let ok = match expected {
            serde_json::Value::String(t) => type_matches(t, value),
            serde_json::Value::Array(ts) => ts
                .iter()
                .filter_map(|t| t.as_str())
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(format!("argument '{key}' must be of type {expected}"));
        }
    }
    Ok(())
}

fn type_matches(ty: &str, value: &serde_json::Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}
