//! Backend construction from configuration.
//!
//! Backend settings arrive as untyped JSON maps. The factory decodes each
//! entry into the typed config of its kind before building anything, so a
//! bad document fails at startup rather than at first use. Kinds without a
//! built-in adapter (`mcp`, custom kinds) need a registered constructor.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use super::builtin::{builtin_backend_with, BUILTIN_TOOLS};
use super::remote::{RemoteBackend, RemoteBackendConfig};
use super::sandboxed::{SandboxedBackend, ToolManifest};
use super::{Backend, BackendKind};
use crate::runtime::{
    DockerSandbox, DockerSettings, ProcessSandbox, Resources, Sandbox, SandboxRuntime,
    SandboxSettings, SecurityProfile,
};
use crate::types::{BackendConfig, Config, Error, Result, RuntimeConfig};

/// Builds a backend for a kind the factory does not know natively.
pub type BackendConstructor =
    Arc<dyn Fn(&str, &BackendConfig, &RuntimeConfig) -> Result<Arc<dyn Backend>> + Send + Sync>;

// =============================================================================
// Typed per-kind configs
// =============================================================================

/// Settings of a `local` backend: which built-in tools to expose.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LocalBackendConfig {
    /// Built-in tool names; all of them when absent.
    #[serde(default)]
    pub tools: Option<Vec<String>>,
}

/// Settings shared by every sandboxed kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct SandboxBackendConfig {
    /// Overrides the deployment-wide security profile for this backend.
    #[serde(default)]
    pub security_profile: Option<SecurityProfile>,

    /// Overrides the deployment-wide default resources field by field.
    #[serde(default)]
    pub resources: Resources,

    /// Overrides the per-stream output cap.
    #[serde(default)]
    pub max_output_bytes: Option<usize>,

    /// Tools this backend serves.
    #[serde(default)]
    pub tools: Vec<ToolManifest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ProcessBackendConfig {
    #[serde(flatten)]
    pub sandbox: SandboxBackendConfig,

    /// Scratch parent directory; defaults to `<runtime scratch root>/<name>`.
    #[serde(default)]
    pub scratch_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct DockerBackendConfig {
    #[serde(flatten)]
    pub sandbox: SandboxBackendConfig,

    #[serde(flatten)]
    pub docker: DockerSettings,
}

#[cfg(feature = "wasm")]
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct WasmBackendConfig {
    #[serde(flatten)]
    pub sandbox: SandboxBackendConfig,

    #[serde(flatten)]
    pub wasm: crate::runtime::WasmSettings,
}

// =============================================================================
// Factory
// =============================================================================

pub struct BackendFactory {
    runtime: RuntimeConfig,
    constructors: BTreeMap<String, BackendConstructor>,
}

impl fmt::Debug for BackendFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendFactory")
            .field("profile", &self.runtime.security_profile)
            .field("constructors", &self.constructors.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BackendFactory {
    pub fn new(runtime: RuntimeConfig) -> Self {
        Self {
            runtime,
            constructors: BTreeMap::new(),
        }
    }

    /// Register a constructor for `kind`. It takes precedence over the
    /// built-in adapter of the same kind.
    pub fn register<F>(&mut self, kind: BackendKind, constructor: F)
    where
        F: Fn(&str, &BackendConfig, &RuntimeConfig) -> Result<Arc<dyn Backend>>
            + Send
            + Sync
            + 'static,
    {
        self.constructors
            .insert(kind.as_str().to_string(), Arc::new(constructor));
    }

    pub fn with_constructor<F>(mut self, kind: BackendKind, constructor: F) -> Self
    where
        F: Fn(&str, &BackendConfig, &RuntimeConfig) -> Result<Arc<dyn Backend>>
            + Send
            + Sync
            + 'static,
    {
        self.register(kind, constructor);
        self
    }

    /// Build one backend. Its enabled flag follows the config entry.
    pub fn build(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        let backend = match self.constructors.get(config.kind.as_str()) {
            Some(constructor) => constructor(name, config, &self.runtime)?,
            None => self.build_native(name, config)?,
        };
        if backend.name() != name {
            return Err(Error::config(format!(
                "constructor for '{}' built a backend named '{}'",
                name,
                backend.name()
            )));
        }
        backend.set_enabled(config.enabled);
        info!(backend = %name, kind = %config.kind, enabled = config.enabled, "backend_built");
        Ok(backend)
    }

    /// Build every configured backend, name-sorted. The first failure aborts.
    pub fn build_all(&self, config: &Config) -> Result<Vec<Arc<dyn Backend>>> {
        config
            .backends
            .iter()
            .map(|(name, entry)| self.build(name, entry))
            .collect()
    }

    fn build_native(&self, name: &str, config: &BackendConfig) -> Result<Arc<dyn Backend>> {
        match &config.kind {
            BackendKind::Local => {
                let typed: LocalBackendConfig = config.decode(name)?;
                let backend = match &typed.tools {
                    Some(tools) => builtin_backend_with(name, tools)?,
                    None => builtin_backend_with(name, BUILTIN_TOOLS)?,
                };
                Ok(Arc::new(backend))
            }
            BackendKind::Process => {
                let typed: ProcessBackendConfig = config.decode(name)?;
                let root = typed
                    .scratch_root
                    .unwrap_or_else(|| self.runtime.scratch_root().join(name));
                self.sandboxed(name, BackendKind::Process, ProcessSandbox::new(root), typed.sandbox)
            }
            BackendKind::Docker => {
                let typed: DockerBackendConfig = config.decode(name)?;
                self.sandboxed(
                    name,
                    BackendKind::Docker,
                    DockerSandbox::new(typed.docker),
                    typed.sandbox,
                )
            }
            #[cfg(feature = "wasm")]
            BackendKind::Wasm => {
                let typed: WasmBackendConfig = config.decode(name)?;
                self.sandboxed(
                    name,
                    BackendKind::Wasm,
                    crate::runtime::WasmSandbox::new(typed.wasm),
                    typed.sandbox,
                )
            }
            #[cfg(not(feature = "wasm"))]
            BackendKind::Wasm => Err(Error::config(format!(
                "backend '{}': built without the 'wasm' feature",
                name
            ))),
            BackendKind::Remote => {
                let typed: RemoteBackendConfig = config.decode(name)?;
                Ok(Arc::new(RemoteBackend::new(name, typed)?))
            }
            kind @ (BackendKind::Mcp | BackendKind::Custom(_)) => Err(Error::config(format!(
                "backend '{}': no constructor registered for kind '{}'",
                name, kind
            ))),
        }
    }

    fn sandboxed<S: Sandbox>(
        &self,
        name: &str,
        kind: BackendKind,
        sandbox: S,
        options: SandboxBackendConfig,
    ) -> Result<Arc<dyn Backend>> {
        let mut settings = SandboxSettings::from_config(&self.runtime)
            .with_defaults(self.runtime.defaults.overlay(&options.resources));
        if let Some(profile) = options.security_profile {
            settings = settings.with_profile(profile);
        }
        if let Some(max) = options.max_output_bytes {
            if max == 0 {
                return Err(Error::config(format!(
                    "backend '{}': max_output_bytes must be positive",
                    name
                )));
            }
            settings.max_output_bytes = max;
        }
        let runtime = SandboxRuntime::new(sandbox, settings)
            .map_err(|e| Error::config(format!("backend '{}': {}", name, e)))?;
        Ok(Arc::new(SandboxedBackend::new(
            name,
            kind,
            Arc::new(runtime),
            options.tools,
        )?))
    }
}

/// JSON Schema of the settings a native kind accepts.
pub fn settings_schema(kind: &BackendKind) -> Option<Value> {
    let schema = match kind {
        BackendKind::Local => schemars::schema_for!(LocalBackendConfig),
        BackendKind::Process => schemars::schema_for!(ProcessBackendConfig),
        BackendKind::Docker => schemars::schema_for!(DockerBackendConfig),
        #[cfg(feature = "wasm")]
        BackendKind::Wasm => schemars::schema_for!(WasmBackendConfig),
        BackendKind::Remote => schemars::schema_for!(RemoteBackendConfig),
        _ => return None,
    };
    serde_json::to_value(schema).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use serde_json::json;

    fn entry(value: Value) -> BackendConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_local_builds_builtin_subset() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let backend = factory
            .build("local", &entry(json!({"kind": "local", "tools": ["echo"]})))
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Local);
        assert!(backend.enabled());
    }

    #[test]
    fn test_disabled_flag_applied() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let backend = factory
            .build("local", &entry(json!({"kind": "local", "enabled": false})))
            .unwrap();
        assert!(!backend.enabled());
    }

    #[test]
    fn test_process_requires_none_profile() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let err = factory
            .build("sh", &entry(json!({"kind": "process"})))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("cannot enforce"));

        let backend = factory
            .build(
                "sh",
                &entry(json!({
                    "kind": "process",
                    "security_profile": "none",
                    "tools": [{ "name": "cat", "entrypoint": { "type": "command", "program": "cat" } }]
                })),
            )
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Process);
    }

    #[test]
    fn test_docker_settings_decode_flattened() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let backend = factory
            .build(
                "box",
                &entry(json!({
                    "kind": "docker",
                    "default_image": "alpine:3.20",
                    "security_profile": "hardened",
                    "tools": []
                })),
            )
            .unwrap();
        assert_eq!(backend.kind(), BackendKind::Docker);
    }

    #[test]
    fn test_bad_settings_fail_fast() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let err = factory
            .build("api", &entry(json!({"kind": "remote"})))
            .unwrap_err();
        assert!(err.to_string().contains("backend 'api'"));
    }

    #[test]
    fn test_mcp_needs_constructor() {
        let factory = BackendFactory::new(RuntimeConfig::default());
        let err = factory
            .build("tools", &entry(json!({"kind": "mcp", "command": "server"})))
            .unwrap_err();
        assert!(err.to_string().contains("no constructor registered"));

        let factory = factory.with_constructor(BackendKind::Mcp, |name, _cfg, _rt| {
            Ok(Arc::new(LocalBackend::new(name)) as Arc<dyn Backend>)
        });
        let backend = factory
            .build("tools", &entry(json!({"kind": "mcp"})))
            .unwrap();
        assert_eq!(backend.name(), "tools");
    }

    #[test]
    fn test_constructor_must_keep_name() {
        let factory = BackendFactory::new(RuntimeConfig::default()).with_constructor(
            BackendKind::Custom("odd".into()),
            |_name, _cfg, _rt| Ok(Arc::new(LocalBackend::new("other")) as Arc<dyn Backend>),
        );
        let err = factory
            .build("mine", &entry(json!({"kind": "odd"})))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_settings_schema_known_kinds() {
        let schema = settings_schema(&BackendKind::Remote).unwrap();
        assert!(schema["properties"]["base_url"].is_object());
        assert!(settings_schema(&BackendKind::Mcp).is_none());
    }
}
