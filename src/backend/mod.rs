//! Backends: named sources of tools.
//!
//! A [`Backend`] lists and executes tools and has its own lifecycle. The
//! registry and aggregator only ever see `Arc<dyn Backend>`; optional
//! capabilities are discovered through methods such as
//! [`Backend::progress_capability`], never by inspecting the kind.
//!
//! Adapters:
//! - [`LocalBackend`]: in-process handler functions.
//! - [`SandboxedBackend`]: tools described by a manifest, executed by a
//!   [`Runtime`](crate::runtime::Runtime) (`process`, `docker`, `wasm`).
//! - [`RemoteBackend`]: tools served over HTTP.

pub mod builtin;
pub mod factory;
pub mod local;
pub mod monitor;
pub mod registry;
pub mod remote;
pub mod sandboxed;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::context::ExecContext;
use crate::tools::{Arguments, Tool};
use crate::types::Result;

pub use builtin::builtin_backend;
pub use factory::{
    settings_schema, BackendConstructor, BackendFactory, DockerBackendConfig, LocalBackendConfig,
    ProcessBackendConfig, SandboxBackendConfig,
};
#[cfg(feature = "wasm")]
pub use factory::WasmBackendConfig;
pub use local::LocalBackend;
pub use monitor::{HealthMonitor, MonitorConfig};
pub use registry::BackendRegistry;
pub use remote::{RemoteBackend, RemoteBackendConfig};
pub use sandboxed::{SandboxedBackend, ToolManifest};

// =============================================================================
// Backend kind
// =============================================================================

/// Adapter kind. Unknown names deserialize as `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum BackendKind {
    Local,
    Process,
    Docker,
    Wasm,
    Remote,
    Mcp,
    Custom(String),
}

impl BackendKind {
    pub fn as_str(&self) -> &str {
        match self {
            BackendKind::Local => "local",
            BackendKind::Process => "process",
            BackendKind::Docker => "docker",
            BackendKind::Wasm => "wasm",
            BackendKind::Remote => "remote",
            BackendKind::Mcp => "mcp",
            BackendKind::Custom(name) => name,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for BackendKind {
    fn from(raw: String) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "local" => BackendKind::Local,
            "process" => BackendKind::Process,
            "docker" => BackendKind::Docker,
            "wasm" => BackendKind::Wasm,
            "remote" => BackendKind::Remote,
            "mcp" => BackendKind::Mcp,
            _ => BackendKind::Custom(raw),
        }
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

impl FromStr for BackendKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(BackendKind::from(s.to_string()))
    }
}

// =============================================================================
// Health status
// =============================================================================

/// Result of one backend health probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub message: String,
    #[serde(with = "humantime_serde")]
    pub latency: Duration,
    pub last_checked: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            healthy: true,
            message: "ok".to_string(),
            latency,
            last_checked: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>, latency: Duration) -> Self {
        Self {
            healthy: false,
            message: message.into(),
            latency,
            last_checked: Utc::now(),
        }
    }
}

// =============================================================================
// Backend trait
// =============================================================================

/// Backends that can stream progress for some of their tools.
pub trait ProgressCapable: Send + Sync {
    /// Whether executing `tool` emits progress to the context's sink.
    fn supports_progress(&self, tool: &str) -> bool;
}

/// A named source of tools.
#[async_trait]
pub trait Backend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    /// Instance name, unique within a registry.
    fn name(&self) -> &str;

    fn enabled(&self) -> bool;

    fn set_enabled(&self, enabled: bool);

    /// Tools in this backend's own order, namespaced to [`Backend::name`].
    async fn list_tools(&self, ctx: &ExecContext) -> Result<Vec<Tool>>;

    /// Execute a tool by bare name. Unknown names fail with `ToolNotFound`
    /// before any resource is allocated.
    async fn execute(&self, ctx: &ExecContext, tool: &str, args: Arguments) -> Result<Value>;

    async fn health(&self, ctx: &ExecContext) -> Result<HealthStatus>;

    async fn start(&self, ctx: &ExecContext) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn progress_capability(&self) -> Option<&dyn ProgressCapable> {
        None
    }
}

/// Identity and enable flag shared by every adapter.
#[derive(Debug)]
pub struct BackendState {
    name: String,
    enabled: AtomicBool,
}

impl BackendState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}
