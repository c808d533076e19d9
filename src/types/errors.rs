//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context. Every variant maps onto a stable
//! [`ErrorKind`] so per-request failures can be returned as structured results.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Application result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A single backend's failure inside an aggregate operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFailure {
    pub backend: String,
    pub message: String,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.message)
    }
}

/// Main error enum for the tool execution core.
#[derive(Error, Debug)]
pub enum Error {
    /// Input did not satisfy the tool's schema, or a request was malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The authorizer refused the call.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The owning backend does not expose the named tool.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// No backend with that name is registered.
    #[error("backend not found: {0}")]
    BackendNotFound(String),

    /// The backend exists but is disabled.
    #[error("backend disabled: {0}")]
    BackendDisabled(String),

    /// Qualified tool id did not match `backend/tool`.
    #[error("invalid tool id: {0}")]
    InvalidToolId(String),

    /// A backend with the same name is already registered.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// The sandbox could not be acquired. Always retryable.
    #[error("sandbox unavailable: {0}")]
    SandboxUnavailable(String),

    /// The tool exceeded its wall-clock deadline and was terminated.
    #[error("execution timed out after {}ms", .timeout.as_millis())]
    ExecutionTimeout {
        timeout: Duration,
        stderr: Option<String>,
    },

    /// The task asked for more than the active security profile allows.
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A chain step mapping could not be resolved.
    #[error("chain mapping error: {0}")]
    ChainMapping(String),

    /// The tool ran and reported failure.
    #[error("execution failed: {message}")]
    ExecutionFailed {
        message: String,
        exit_code: Option<i32>,
        stderr: Option<String>,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Configuration could not be decoded or is inconsistent.
    #[error("configuration error: {0}")]
    Config(String),

    /// A backend failed to start; startup aborted.
    #[error("backend '{backend}' failed to start: {reason}")]
    StartFailed { backend: String, reason: String },

    /// One or more backends failed to stop.
    #[error("{} backend(s) failed to stop: {}", .0.len(), join_failures(.0))]
    StopFailed(Vec<BackendFailure>),

    /// A remote backend answered with an unexpected response.
    #[error("remote error: {0}")]
    Remote(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_failures(failures: &[BackendFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Stable, serializable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ValidationError,
    Unauthorized,
    ToolNotFound,
    BackendNotFound,
    BackendDisabled,
    InvalidToolId,
    AlreadyRegistered,
    SandboxUnavailable,
    ExecutionTimeout,
    SecurityViolation,
    ChainMappingError,
    ExecutionFailed,
    Cancelled,
    ConfigError,
    StartFailed,
    StopFailed,
    RemoteError,
    /// Non-fatal warning attached to an otherwise successful aggregate listing.
    AggregationPartialFailure,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::ToolNotFound => "TOOL_NOT_FOUND",
            ErrorKind::BackendNotFound => "BACKEND_NOT_FOUND",
            ErrorKind::BackendDisabled => "BACKEND_DISABLED",
            ErrorKind::InvalidToolId => "INVALID_TOOL_ID",
            ErrorKind::AlreadyRegistered => "ALREADY_REGISTERED",
            ErrorKind::SandboxUnavailable => "SANDBOX_UNAVAILABLE",
            ErrorKind::ExecutionTimeout => "EXECUTION_TIMEOUT",
            ErrorKind::SecurityViolation => "SECURITY_VIOLATION",
            ErrorKind::ChainMappingError => "CHAIN_MAPPING_ERROR",
            ErrorKind::ExecutionFailed => "EXECUTION_FAILED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ConfigError => "CONFIG_ERROR",
            ErrorKind::StartFailed => "START_FAILED",
            ErrorKind::StopFailed => "STOP_FAILED",
            ErrorKind::RemoteError => "REMOTE_ERROR",
            ErrorKind::AggregationPartialFailure => "AGGREGATION_PARTIAL_FAILURE",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::ValidationError,
            Error::Unauthorized(_) => ErrorKind::Unauthorized,
            Error::ToolNotFound(_) => ErrorKind::ToolNotFound,
            Error::BackendNotFound(_) => ErrorKind::BackendNotFound,
            Error::BackendDisabled(_) => ErrorKind::BackendDisabled,
            Error::InvalidToolId(_) => ErrorKind::InvalidToolId,
            Error::AlreadyRegistered(_) => ErrorKind::AlreadyRegistered,
            Error::SandboxUnavailable(_) => ErrorKind::SandboxUnavailable,
            Error::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Error::SecurityViolation(_) => ErrorKind::SecurityViolation,
            Error::ChainMapping(_) => ErrorKind::ChainMappingError,
            Error::ExecutionFailed { .. } => ErrorKind::ExecutionFailed,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            Error::Config(_) => ErrorKind::ConfigError,
            Error::StartFailed { .. } => ErrorKind::StartFailed,
            Error::StopFailed(_) => ErrorKind::StopFailed,
            Error::Remote(_) => ErrorKind::RemoteError,
            Error::Internal(_) | Error::Serialization(_) | Error::Io(_) => ErrorKind::Internal,
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only sandbox acquisition failures qualify: they reflect infrastructure
    /// availability, not tool behavior.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::SandboxUnavailable(_))
    }

    /// Captured stderr for sandbox-level failures, if any.
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ExecutionTimeout { stderr, .. } | Error::ExecutionFailed { stderr, .. } => {
                stderr.as_deref()
            }
            _ => None,
        }
    }
}

// Convenience constructors
impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn tool_not_found(msg: impl Into<String>) -> Self {
        Self::ToolNotFound(msg.into())
    }

    pub fn backend_not_found(msg: impl Into<String>) -> Self {
        Self::BackendNotFound(msg.into())
    }

    pub fn backend_disabled(msg: impl Into<String>) -> Self {
        Self::BackendDisabled(msg.into())
    }

    pub fn invalid_tool_id(msg: impl Into<String>) -> Self {
        Self::InvalidToolId(msg.into())
    }

    pub fn sandbox_unavailable(msg: impl Into<String>) -> Self {
        Self::SandboxUnavailable(msg.into())
    }

    pub fn security_violation(msg: impl Into<String>) -> Self {
        Self::SecurityViolation(msg.into())
    }

    pub fn chain_mapping(msg: impl Into<String>) -> Self {
        Self::ChainMapping(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn timeout(timeout: Duration, stderr: Option<String>) -> Self {
        Self::ExecutionTimeout { timeout, stderr }
    }

    pub fn execution_failed(
        msg: impl Into<String>,
        exit_code: Option<i32>,
        stderr: Option<String>,
    ) -> Self {
        Self::ExecutionFailed {
            message: msg.into(),
            exit_code,
            stderr,
        }
    }
}
