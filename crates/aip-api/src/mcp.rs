//! MCP JSON-RPC handling over a [`ToolDispatcher`].
//!
//! Transport-agnostic: the SSE server feeds posted requests through
//! [`handle_mcp_request`] and pushes whatever comes back onto the session's
//! event stream.

use aip_kernel::ToolDispatcher;
use aip_types::tool::FunctionCall;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// MCP protocol version supported by this server.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

const INVALID_REQUEST: i64 = -32600;
const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const REQUEST_CANCELLED: i64 = -32800;

/// Handle one JSON-RPC message.
///
/// Returns `None` for notifications (messages without an `id`), which get no
/// reply.
pub async fn handle_mcp_request(
    request: &serde_json::Value,
    server_name: &str,
    dispatcher: &ToolDispatcher,
    cancel: &CancellationToken,
) -> Option<serde_json::Value> {
    let id = request.get("id").cloned();
    let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
        return Some(make_error(id, INVALID_REQUEST, "Invalid request: missing method"));
    };
    if id.is_none() {
        debug!(method, "MCP notification");
        return None;
    }

    let response = match method {
        "initialize" => make_response(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {
                    "tools": {}
                },
                "serverInfo": {
                    "name": server_name,
                    "version": env!("CARGO_PKG_VERSION")
                },
                "instructions": dispatcher.description(),
            }),
        ),
        "ping" => make_response(id, json!({})),
        "tools/list" => {
            let tool_list: Vec<serde_json::Value> = dispatcher
                .descriptors()
                .into_iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "inputSchema": t.input_schema,
                    })
                })
                .collect();

            make_response(id, json!({ "tools": tool_list }))
        }
        "tools/call" => {
            let Some(tool_name) = request["params"]["name"].as_str() else {
                return Some(make_error(id, INVALID_PARAMS, "Missing tool name"));
            };
            let arguments = request["params"]
                .get("arguments")
                .filter(|a| !a.is_null())
                .cloned()
                .unwrap_or(json!({}));

            let call = FunctionCall::new(tool_name, &arguments);
            match dispatcher.dispatch(&call, cancel).await {
                Some(Ok(result)) => make_response(
                    id,
                    json!({
                        "content": [{"type": "text", "text": result.content}],
                        "isError": result.is_error,
                    }),
                ),
                Some(Err(exception)) => make_response(
                    id,
                    json!({
                        "content": [{"type": "text", "text": exception.content()}],
                        "isError": true,
                    }),
                ),
                None => make_error(id, REQUEST_CANCELLED, "Request cancelled"),
            }
        }
        _ => make_error(id, METHOD_NOT_FOUND, &format!("Method not found: {method}")),
    };
    Some(response)
}

/// Build a JSON-RPC 2.0 success response.
fn make_response(id: Option<serde_json::Value>, result: serde_json::Value) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

/// Build a JSON-RPC 2.0 error response.
fn make_error(id: Option<serde_json::Value>, code: i64, message: &str) -> serde_json::Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": code,
            "message": message,
        },
    })
}
