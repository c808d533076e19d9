//! In-process backend.
//!
//! Tools are handler functions registered before the backend is shared.
//! There is no sandbox. Handlers run on the caller's runtime and a panic is
//! reported as `Internal`. Cancelling the context, or exceeding its resource
//! timeout, drops the handler future.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Backend, BackendKind, BackendState, HealthStatus, ProgressCapable};
use crate::context::ExecContext;
use crate::recovery::{with_recovery, with_recovery_async};
use crate::tools::{Arguments, Tool};
use crate::types::{Error, Result};
use crate::validation::validate_tool_name;

pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// Type-erased tool handler.
pub type ToolHandler = Arc<dyn Fn(ExecContext, Arguments) -> HandlerFuture + Send + Sync>;

struct LocalTool {
    tool: Tool,
    handler: ToolHandler,
    progress: bool,
}

pub struct LocalBackend {
    state: BackendState,
    tools: Vec<LocalTool>,
}

impl fmt::Debug for LocalBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalBackend")
            .field("name", &self.state.name())
            .field("enabled", &self.state.enabled())
            .field(
                "tools",
                &self.tools.iter().map(|t| t.tool.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl LocalBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            state: BackendState::new(name),
            tools: Vec::new(),
        }
    }

    /// Register a tool with an untyped handler.
    pub fn add_tool<F, Fut>(&mut self, tool: Tool, handler: F) -> Result<&mut Self>
    where
        F: Fn(ExecContext, Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        validate_tool_name(&tool.name)?;
        if self.find(&tool.name).is_some() {
            return Err(Error::AlreadyRegistered(format!(
                "tool '{}' in backend '{}'",
                tool.name,
                self.state.name()
            )));
        }
        let tool = tool.with_namespace(self.state.name());
        let handler: ToolHandler =
            Arc::new(move |ctx: ExecContext, args: Arguments| -> HandlerFuture {
                handler(ctx, args).boxed()
            });
        self.tools.push(LocalTool {
            tool,
            handler,
            progress: false,
        });
        Ok(self)
    }

    /// Register a tool whose input is decoded into `I`. The input schema is
    /// generated from `I`.
    pub fn add_typed<I, O, F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        handler: F,
    ) -> Result<&mut Self>
    where
        I: DeserializeOwned + JsonSchema + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ExecContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let schema = serde_json::to_value(schemars::schema_for!(I))?;
        let tool = Tool::new(name, description).with_input_schema(schema);
        let handler = Arc::new(handler);
        self.add_tool(tool, move |ctx, args| {
            let handler = Arc::clone(&handler);
            async move {
                let input: I = serde_json::from_value(Value::Object(args))
                    .map_err(|e| Error::validation(format!("invalid input: {}", e)))?;
                let output = handler(ctx, input).await?;
                Ok(serde_json::to_value(output)?)
            }
        })
    }

    /// Mark a registered tool as emitting progress events.
    pub fn with_progress(&mut self, tool: &str) -> Result<&mut Self> {
        let name = self.state.name().to_string();
        let entry = self
            .tools
            .iter_mut()
            .find(|t| t.tool.name == tool)
            .ok_or_else(|| Error::tool_not_found(format!("{}/{}", name, tool)))?;
        entry.progress = true;
        Ok(self)
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.tool.name.as_str()).collect()
    }

    fn find(&self, name: &str) -> Option<&LocalTool> {
        self.tools.iter().find(|t| t.tool.name == name)
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &str {
        self.state.name()
    }

    fn enabled(&self) -> bool {
        self.state.enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.set_enabled(enabled)
    }

    async fn list_tools(&self, _ctx: &ExecContext) -> Result<Vec<Tool>> {
        Ok(self.tools.iter().map(|t| t.tool.clone()).collect())
    }

    async fn execute(&self, ctx: &ExecContext, tool: &str, args: Arguments) -> Result<Value> {
        let entry = self
            .find(tool)
            .ok_or_else(|| Error::tool_not_found(format!("{}/{}", self.name(), tool)))?;
        let operation = entry.tool.qualified_id();
        debug!(tool = %operation, "invoking local handler");

        let handler = Arc::clone(&entry.handler);
        let future = with_recovery(|| Ok(handler(ctx.clone(), args)), &operation)?;

        let run = with_recovery_async(future, &operation);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::cancelled(format!("{} cancelled", operation))),
            result = run_with_deadline(ctx.resources().timeout.or(entry.tool.timeout), run) => result,
        }
    }

    async fn health(&self, _ctx: &ExecContext) -> Result<HealthStatus> {
        let started = Instant::now();
        let mut status = HealthStatus::healthy(started.elapsed());
        status.message = format!("{} in-process tools", self.tools.len());
        Ok(status)
    }

    async fn start(&self, _ctx: &ExecContext) -> Result<()> {
        debug!(backend = %self.name(), tools = self.tools.len(), "local backend ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }

    fn progress_capability(&self) -> Option<&dyn ProgressCapable> {
        Some(self)
    }
}

impl ProgressCapable for LocalBackend {
    fn supports_progress(&self, tool: &str) -> bool {
        self.find(tool).map(|t| t.progress).unwrap_or(false)
    }
}

/// Await a handler, bounded by the context timeout or else the tool's own.
async fn run_with_deadline<F>(deadline: Option<Duration>, run: F) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, run)
            .await
            .unwrap_or_else(|_| Err(Error::timeout(limit, None))),
        None => run.await,
    }
}

/// Echo handler body shared by the builtin backend and tests: returns the
/// `message` argument.
pub(crate) fn echo_message(args: &Arguments) -> Result<Value> {
    match args.get("message") {
        Some(message) => Ok(message.clone()),
        None => Err(Error::validation("missing required argument 'message'")),
    }
}

/// Schema of the echo tool.
pub(crate) fn echo_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "message": { "type": "string", "description": "Text to return" } },
        "required": ["message"]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    fn echo_backend() -> LocalBackend {
        let mut backend = LocalBackend::new("local");
        backend
            .add_tool(
                Tool::new("echo", "Echo").with_input_schema(echo_schema()),
                |_ctx, args| async move { echo_message(&args) },
            )
            .unwrap();
        backend
    }

    fn args(value: Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_execute_echo() {
        let backend = echo_backend();
        let out = backend
            .execute(&ExecContext::new(), "echo", args(json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(out, json!("hi"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let backend = echo_backend();
        let err = backend
            .execute(&ExecContext::new(), "nope", Arguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(ref m) if m == "local/nope"));
    }

    #[tokio::test]
    async fn test_tools_are_namespaced_in_registration_order() {
        let mut backend = echo_backend();
        backend
            .add_tool(Tool::new("alpha", ""), |_ctx, _args| async { Ok(Value::Null) })
            .unwrap();
        let tools = backend.list_tools(&ExecContext::new()).await.unwrap();
        let ids: Vec<_> = tools.iter().map(Tool::qualified_id).collect();
        assert_eq!(ids, vec!["local/echo", "local/alpha"]);
    }

    #[test]
    fn test_duplicate_tool_rejected() {
        let mut backend = echo_backend();
        let err = backend
            .add_tool(Tool::new("echo", ""), |_ctx, _args| async { Ok(Value::Null) })
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_internal_error() {
        let mut backend = LocalBackend::new("local");
        backend
            .add_tool(Tool::new("boom", ""), |_ctx, _args| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(Value::Null)
            })
            .unwrap();
        let err = backend
            .execute(&ExecContext::new(), "boom", Arguments::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(err.to_string().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_cancellation_drops_handler() {
        let mut backend = LocalBackend::new("local");
        backend
            .add_tool(Tool::new("hang", ""), |_ctx, _args| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .unwrap();
        let ctx = ExecContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        let err = backend.execute(&ctx, "hang", Arguments::new()).await.unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_context_timeout_bounds_handler() {
        let mut backend = LocalBackend::new("local");
        backend
            .add_tool(Tool::new("hang", ""), |_ctx, _args| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(Value::Null)
            })
            .unwrap();
        let ctx = ExecContext::new()
            .with_resources(crate::runtime::Resources::default().with_timeout(Duration::from_millis(20)));
        let err = backend.execute(&ctx, "hang", Arguments::new()).await.unwrap_err();
        assert!(matches!(err, Error::ExecutionTimeout { .. }));
    }

    #[derive(Debug, Deserialize, JsonSchema)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    #[tokio::test]
    async fn test_typed_tool_schema_and_decoding() {
        let mut backend = LocalBackend::new("math");
        backend
            .add_typed("add", "Add two integers", |_ctx, input: AddInput| async move {
                Ok(input.a + input.b)
            })
            .unwrap();

        let tools = backend.list_tools(&ExecContext::new()).await.unwrap();
        let schema = &tools[0].input_schema;
        assert_eq!(schema["properties"]["a"]["type"], "integer");

        let out = backend
            .execute(&ExecContext::new(), "add", args(json!({"a": 2, "b": 40})))
            .await
            .unwrap();
        assert_eq!(out, json!(42));

        let err = backend
            .execute(&ExecContext::new(), "add", args(json!({"a": "two"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_progress_capability() {
        let mut backend = echo_backend();
        assert!(!backend.supports_progress("echo"));
        backend.with_progress("echo").unwrap();
        assert!(backend.supports_progress("echo"));
        assert!(backend.with_progress("ghost").is_err());
    }
}
