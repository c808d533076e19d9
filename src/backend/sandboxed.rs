//! Backend whose tools run inside a sandbox runtime.
//!
//! Tools are declared by [`ToolManifest`]s in configuration. Executing one
//! resolves the manifest to a [`Task`] and hands it to the owned
//! [`Runtime`]. A non-zero exit becomes `ExecutionFailed` carrying the
//! captured (bounded) stderr.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{Backend, BackendKind, BackendState, HealthStatus, ProgressCapable};
use crate::context::ExecContext;
use crate::runtime::{Entrypoint, Resources, Runtime, SecurityRequirements, Task, TaskResult};
use crate::tools::{Arguments, Tool};
use crate::types::{Error, Result};
use crate::validation::validate_tool_name;

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

/// One tool as declared in a sandboxed backend's configuration.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct ToolManifest {
    pub name: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub description: String,

    /// JSON Schema of the tool input.
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,

    #[serde(default)]
    pub output_schema: Option<Value>,

    /// How the sandbox starts the tool.
    pub entrypoint: Entrypoint,

    /// Network and filesystem access the tool needs.
    #[serde(default)]
    pub requirements: SecurityRequirements,

    /// Tool-level resources; unset fields fall back to runtime defaults.
    #[serde(default)]
    pub resources: Resources,

    /// Environment variables set for every run.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// The tool writes progress lines on stdout.
    #[serde(default)]
    pub progress: bool,
}

impl ToolManifest {
    pub fn new(name: impl Into<String>, entrypoint: Entrypoint) -> Self {
        Self {
            name: name.into(),
            title: None,
            description: String::new(),
            input_schema: default_input_schema(),
            output_schema: None,
            entrypoint,
            requirements: SecurityRequirements::default(),
            resources: Resources::default(),
            env: BTreeMap::new(),
            progress: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_requirements(mut self, requirements: SecurityRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_progress(mut self) -> Self {
        self.progress = true;
        self
    }

    /// Published tool. The manifest timeout wins over the runtime default.
    fn to_tool(&self, namespace: &str, default_timeout: Option<Duration>) -> Tool {
        let mut tool = Tool::new(&self.name, &self.description)
            .with_namespace(namespace)
            .with_input_schema(self.input_schema.clone());
        tool.title = self.title.clone();
        tool.output_schema = self.output_schema.clone();
        tool.timeout = self.resources.timeout.or(default_timeout);
        tool
    }
}

pub struct SandboxedBackend {
    state: BackendState,
    kind: BackendKind,
    runtime: Arc<dyn Runtime>,
    manifests: Vec<ToolManifest>,
}

impl fmt::Debug for SandboxedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxedBackend")
            .field("name", &self.state.name())
            .field("kind", &self.kind)
            .field("runtime", &self.runtime.backend())
            .field("security", &self.runtime.security())
            .field("tools", &self.manifests.len())
            .finish()
    }
}

impl SandboxedBackend {
    pub fn new(
        name: impl Into<String>,
        kind: BackendKind,
        runtime: Arc<dyn Runtime>,
        manifests: Vec<ToolManifest>,
    ) -> Result<Self> {
        let state = BackendState::new(name);
        let mut seen = std::collections::HashSet::new();
        for manifest in &manifests {
            validate_tool_name(&manifest.name)?;
            if !seen.insert(manifest.name.as_str()) {
                return Err(Error::config(format!(
                    "backend '{}' declares tool '{}' twice",
                    state.name(),
                    manifest.name
                )));
            }
            manifest.resources.validate()?;
        }
        Ok(Self {
            state,
            kind,
            runtime,
            manifests,
        })
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    fn manifest(&self, tool: &str) -> Option<&ToolManifest> {
        self.manifests.iter().find(|m| m.name == tool)
    }

    /// Resolve a manifest and input into a task. Context environment
    /// overrides manifest environment.
    fn prepare(&self, ctx: &ExecContext, manifest: &ToolManifest, args: Arguments) -> Task {
        let mut env = manifest.env.clone();
        env.extend(ctx.env().iter().map(|(k, v)| (k.clone(), v.clone())));
        Task::new(manifest.to_tool(self.name(), self.runtime.default_timeout()), args)
            .with_env(env)
            .with_resources(manifest.resources)
            .with_requirements(manifest.requirements)
            .with_entrypoint(manifest.entrypoint.clone())
            .with_progress(manifest.progress)
    }
}

/// Map a finished task to the tool output, or `ExecutionFailed` on a
/// non-zero exit.
pub(crate) fn task_output(tool: &str, result: TaskResult) -> Result<Value> {
    if result.succeeded() {
        return Ok(result.output_value());
    }
    let stderr = {
        let trimmed = result.stderr.trim_end();
        if trimmed.is_empty() {
            None
        } else if result.stderr_truncated {
            Some(format!("{}\n[truncated]", trimmed))
        } else {
            Some(trimmed.to_string())
        }
    };
    let message = match result.exit_code {
        Some(code) => format!("tool '{}' exited with code {}", tool, code),
        None => format!("tool '{}' was terminated by a signal", tool),
    };
    Err(Error::execution_failed(message, result.exit_code, stderr))
}

#[async_trait]
impl Backend for SandboxedBackend {
    fn kind(&self) -> BackendKind {
        self.kind.clone()
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
        Ok(self
            .manifests
            .iter()
            .map(|m| m.to_tool(self.name(), self.runtime.default_timeout()))
            .collect())
    }

    async fn execute(&self, ctx: &ExecContext, tool: &str, args: Arguments) -> Result<Value> {
        let manifest = self
            .manifest(tool)
            .ok_or_else(|| Error::tool_not_found(format!("{}/{}", self.name(), tool)))?;
        let task = self.prepare(ctx, manifest, args);
        debug!(task_id = %task.id, tool = %tool, runtime = %self.runtime.backend(), "dispatching task");
        let result = self.runtime.execute(ctx, task).await?;
        task_output(tool, result)
    }

    async fn health(&self, _ctx: &ExecContext) -> Result<HealthStatus> {
        let started = Instant::now();
        Ok(match self.runtime.probe().await {
            Ok(()) => HealthStatus::healthy(started.elapsed()),
            Err(e) => HealthStatus::unhealthy(e.to_string(), started.elapsed()),
        })
    }

    async fn start(&self, _ctx: &ExecContext) -> Result<()> {
        self.runtime.probe().await
    }

    async fn stop(&self) -> Result<()> {
        self.runtime.close().await
    }

    fn progress_capability(&self) -> Option<&dyn ProgressCapable> {
        if self.runtime.supports_progress() {
            Some(self)
        } else {
            None
        }
    }
}

impl ProgressCapable for SandboxedBackend {
    fn supports_progress(&self, tool: &str) -> bool {
        self.runtime.supports_progress() && self.manifest(tool).is_some_and(|m| m.progress)
    }
}
