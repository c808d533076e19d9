//! Canonical result of one pipeline invocation.
//!
//! A [`ToolResult`] is terminal: once the respond stage builds it, it is
//! handed to the caller and never touched again. Failures are carried in
//! [`ToolResult::error`] rather than returned as `Err`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use super::stages::StageTiming;
use crate::types::{Error, ErrorKind, RequestId};

/// Content block exposed at the protocol boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Content {
    Text { text: String },
    Json { value: Value },
}

impl Content {
    /// Normalize raw backend output: strings become text, everything else
    /// stays structured.
    pub fn from_output(output: &Value) -> Vec<Content> {
        match output {
            Value::Null => Vec::new(),
            Value::String(text) => vec![Content::Text { text: text.clone() }],
            other => vec![Content::Json {
                value: other.clone(),
            }],
        }
    }
}

/// Structured error attached to a failed result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default)]
    pub retryable: bool,
}

impl From<&Error> for ToolError {
    fn from(err: &Error) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            stderr: err.stderr().map(str::to_string),
            retryable: err.is_retryable(),
        }
    }
}

impl From<Error> for ToolError {
    fn from(err: Error) -> Self {
        ToolError::from(&err)
    }
}

/// Execution metrics of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    /// Wall-clock time across all stages.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,

    /// Execute-stage attempts (0 when the pipeline halted earlier).
    pub attempts: u32,

    /// Exit code reported by a sandboxed tool that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Progress events observed, when streaming.
    #[serde(default)]
    pub progress_events: u64,

    /// Stages that ran, in order.
    pub stages: Vec<StageTiming>,
}

/// Terminal result of a pipeline invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: RequestId,

    /// Tool id as resolved (qualified) or as requested when resolution
    /// failed.
    pub tool: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<Content>,

    pub metrics: ExecutionMetrics,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Output on success, the structured error otherwise.
    pub fn into_output(self) -> std::result::Result<Value, ToolError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.output.unwrap_or(Value::Null)),
        }
    }
}
