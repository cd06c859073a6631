//! The tool abstraction and a closure-backed implementation.

use aip_types::tool::ToolDescriptor;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A named, schema-described callable.
///
/// `run` receives arguments that already passed schema validation. Tools that
/// do long work should watch `cancel` at natural boundaries; the dispatcher
/// also drops the future once it fires.
#[async_trait]
pub trait Tool: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    async fn run(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, String>;
}

type ToolFn = Arc<
    dyn Fn(serde_json::Value, CancellationToken) -> BoxFuture<'static, Result<serde_json::Value, String>>
        + Send
        + Sync,
>;

/// A [`Tool`] backed by an async closure.
#[derive(Clone)]
pub struct FunctionTool {
    descriptor: ToolDescriptor,
    func: ToolFn,
}

impl FunctionTool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        func: F,
    ) -> Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        Self::cancellable(name, description, input_schema, move |args, _cancel| {
            func(args)
        })
    }

    /// Like [`FunctionTool::new`], but the closure also sees the cancellation token.
    pub fn cancellable<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
        func: F,
    ) -> Self
    where
        F: Fn(serde_json::Value, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
    {
        Self {
            descriptor: ToolDescriptor {
                name: name.into(),
                description: description.into(),
                input_schema,
            },
            func: Arc::new(move |args, cancel| Box::pin(func(args, cancel))),
        }
    }
}

impl std::fmt::Debug for FunctionTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTool")
            .field("name", &self.descriptor.name)
            .finish()
    }
}

#[async_trait]
impl Tool for FunctionTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    async fn run(
        &self,
        args: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<serde_json::Value, String> {
        (self.func)(args, cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_tool_runs_closure() {
        let tool = FunctionTool::new(
            "add",
            "Add two numbers",
            json!({"type": "object"}),
            |args| async move {
                let a = args["a"].as_i64().unwrap_or(0);
                let b = args["b"].as_i64().unwrap_or(0);
                Ok(json!(a + b))
            },
        );
        assert_eq!(tool.descriptor().name, "add");
        let out = tool
            .run(json!({"a": 2, "b": 3}), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, json!(5));
    }

    #[tokio::test]
    async fn test_cancellable_tool_sees_token() {
        let tool = FunctionTool::cancellable(
            "wait",
            "Wait for cancellation",
            json!({"type": "object"}),
            |_args, cancel| async move {
                cancel.cancelled().await;
                Err("stopped".to_string())
            },
        );
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(tool.run(json!({}), token).await.unwrap_err(), "stopped");
    }
}
