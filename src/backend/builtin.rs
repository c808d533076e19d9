//! Built-in in-process tools.
//!
//! - `echo`: returns its `message` argument.
//! - `sleep`: waits `millis` milliseconds in `steps` increments, emitting a
//!   progress event after each one.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::local::{echo_message, echo_schema, LocalBackend};
use crate::context::ExecContext;
use crate::tools::Tool;
use crate::types::{Error, Result};

pub const ECHO: &str = "echo";
pub const SLEEP: &str = "sleep";

/// Every built-in tool name.
pub const BUILTIN_TOOLS: &[&str] = &[ECHO, SLEEP];

const MAX_SLEEP_STEPS: u32 = 1000;

fn default_steps() -> u32 {
    1
}

/// Input of the `sleep` tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SleepInput {
    /// Total time to wait.
    pub millis: u64,
    /// Number of progress steps.
    #[serde(default = "default_steps")]
    pub steps: u32,
}

#[derive(Debug, Serialize)]
pub struct SleepOutput {
    pub slept_ms: u64,
    pub steps: u32,
}

async fn sleep_tool(ctx: ExecContext, input: SleepInput) -> Result<SleepOutput> {
    if input.steps == 0 || input.steps > MAX_SLEEP_STEPS {
        return Err(Error::validation(format!(
            "steps must be between 1 and {}",
            MAX_SLEEP_STEPS
        )));
    }
    let step = Duration::from_millis(input.millis) / input.steps;
    for i in 1..=input.steps {
        tokio::time::sleep(step).await;
        if let Some(sink) = ctx.progress() {
            sink.fraction(
                format!("step {}/{}", i, input.steps),
                f64::from(i) / f64::from(input.steps),
            )
            .await;
        }
    }
    Ok(SleepOutput {
        slept_ms: input.millis,
        steps: input.steps,
    })
}

/// Local backend exposing every built-in tool.
pub fn builtin_backend(name: &str) -> Result<LocalBackend> {
    builtin_backend_with(name, BUILTIN_TOOLS)
}

/// Local backend exposing the named subset of built-in tools.
pub fn builtin_backend_with<S: AsRef<str>>(name: &str, tools: &[S]) -> Result<LocalBackend> {
    let mut backend = LocalBackend::new(name);
    for tool in tools {
        match tool.as_ref() {
            ECHO => {
                backend.add_tool(
                    Tool::new(ECHO, "Return the message argument unchanged")
                        .with_title("Echo")
                        .with_input_schema(echo_schema()),
                    |_ctx, args| async move { echo_message(&args) },
                )?;
            }
            SLEEP => {
                backend
                    .add_typed(SLEEP, "Wait, reporting progress", sleep_tool)?
                    .with_progress(SLEEP)?;
            }
            other => {
                return Err(Error::config(format!(
                    "unknown builtin tool '{}' (available: {})",
                    other,
                    BUILTIN_TOOLS.join(", ")
                )))
            }
        }
    }
    Ok(backend)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, ProgressCapable};
    use crate::context::ProgressSink;
    use crate::tools::Arguments;
    use serde_json::json;

    fn args(value: serde_json::Value) -> Arguments {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_builtins_listed_in_order() {
        let backend = builtin_backend("local").unwrap();
        let tools = backend.list_tools(&ExecContext::new()).await.unwrap();
        let ids: Vec<_> = tools.iter().map(Tool::qualified_id).collect();
        assert_eq!(ids, vec!["local/echo", "local/sleep"]);
    }

    #[tokio::test]
    async fn test_sleep_emits_progress() {
        let backend = builtin_backend("local").unwrap();
        assert!(backend.supports_progress(SLEEP));
        assert!(!backend.supports_progress(ECHO));

        let (sink, mut rx) = ProgressSink::channel(16);
        let ctx = ExecContext::new().with_progress(sink);
        let out = backend
            .execute(&ctx, SLEEP, args(json!({"millis": 30, "steps": 3})))
            .await
            .unwrap();
        assert_eq!(out, json!({"slept_ms": 30, "steps": 3}));

        drop(ctx);
        let mut fractions = Vec::new();
        while let Some(event) = rx.recv().await {
            fractions.push(event.fraction.unwrap());
        }
        assert_eq!(fractions.len(), 3);
        assert!((fractions[2] - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_sleep_rejects_zero_steps() {
        let backend = builtin_backend("local").unwrap();
        let err = backend
            .execute(&ExecContext::new(), SLEEP, args(json!({"millis": 1, "steps": 0})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_subset_and_unknown() {
        let backend = builtin_backend_with("tiny", &["echo"]).unwrap();
        assert_eq!(backend.tool_names(), vec!["echo"]);
        let err = builtin_backend_with("bad", &["teleport"]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
