//! Configuration structures.
//!
//! Configuration is loaded from JSON documents (file or string). Durations use
//! humantime notation (`"30s"`, `"250ms"`). Backend entries keep their
//! kind-specific settings untyped here; `backend::factory` decodes them into
//! typed per-kind structs before anything is constructed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::backend::{BackendKind, MonitorConfig};
use crate::runtime::{Resources, SecurityProfile};
use crate::tools::HealthConfig;
use crate::types::{Error, Result};
use crate::validation::validate_backend_name;

/// Global executor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Sandbox runtime defaults.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Tool aggregation settings.
    #[serde(default)]
    pub aggregator: AggregatorConfig,

    /// Request pipeline settings.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Streaming executor settings.
    #[serde(default)]
    pub streaming: StreamingConfig,

    /// Background backend health probing.
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Backend instances keyed by instance name.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

impl Config {
    /// Parse a JSON configuration document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(raw)
            .map_err(|e| Error::config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("failed reading config {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Reject configurations the executor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.aggregator.max_parallelism == 0 {
            return Err(Error::config("aggregator.max_parallelism must be positive"));
        }
        if self.aggregator.list_timeout.is_zero() {
            return Err(Error::config("aggregator.list_timeout must be positive"));
        }
        if self.pipeline.default_timeout.is_zero() {
            return Err(Error::config("pipeline.default_timeout must be positive"));
        }
        if self.pipeline.retry.max_attempts == 0 {
            return Err(Error::config("pipeline.retry.max_attempts must be at least 1"));
        }
        if self.streaming.channel_capacity == 0 {
            return Err(Error::config("streaming.channel_capacity must be positive"));
        }
        if self.runtime.acquire_timeout.is_zero() {
            return Err(Error::config("runtime.acquire_timeout must be positive"));
        }
        if self.monitor.enabled
            && (self.monitor.interval.is_zero() || self.monitor.probe_timeout.is_zero())
        {
            return Err(Error::config("monitor.interval and monitor.probe_timeout must be positive"));
        }
        if self.runtime.max_output_bytes == 0 {
            return Err(Error::config("runtime.max_output_bytes must be positive"));
        }
        match self.runtime.defaults.timeout {
            Some(timeout) if !timeout.is_zero() => {}
            _ => {
                return Err(Error::config(
                    "runtime.defaults.timeout must be set to a positive duration",
                ))
            }
        }
        for name in self.backends.keys() {
            validate_backend_name(name).map_err(|e| Error::config(e.to_string()))?;
        }
        Ok(())
    }

    /// Names of backends enabled in configuration, sorted.
    pub fn enabled_backends(&self) -> Vec<&str> {
        self.backends
            .iter()
            .filter(|(_, cfg)| cfg.enabled)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Tracing log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable JSON log formatting.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Sandbox runtime defaults shared by every sandboxed backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Active isolation ceiling for this deployment.
    pub security_profile: SecurityProfile,

    /// Resources applied when neither the tool nor the request sets a field.
    pub defaults: Resources,

    /// Per-stream capture cap for stdout and stderr, in bytes.
    pub max_output_bytes: usize,

    /// Whether the hardened profile may grant network access to tools that
    /// declare they need it.
    pub hardened_allow_network: bool,

    /// Parent directory for per-task scratch directories.
    pub scratch_root: Option<PathBuf>,

    /// Host environment variables passed through to sandboxed processes.
    pub inherit_env: Vec<String>,

    /// Deadline for acquiring a sandbox; expiry is reported as unavailable.
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            security_profile: SecurityProfile::Standard,
            defaults: Resources {
                memory_bytes: Some(512 * 1024 * 1024),
                cpus: Some(1.0),
                timeout: Some(Duration::from_secs(30)),
                disk_bytes: None,
            },
            max_output_bytes: 1024 * 1024,
            hardened_allow_network: false,
            scratch_root: None,
            inherit_env: vec!["PATH".to_string(), "LANG".to_string()],
            acquire_timeout: Duration::from_secs(30),
        }
    }
}

impl RuntimeConfig {
    /// Scratch root, falling back to the system temp directory.
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("toolexec"))
    }
}

/// Tool aggregation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Maximum concurrent backend listings.
    pub max_parallelism: usize,

    /// Per-backend listing deadline.
    #[serde(with = "humantime_serde")]
    pub list_timeout: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            max_parallelism: 8,
            list_timeout: Duration::from_secs(10),
        }
    }
}

/// Request pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout for requests that set none, on tools that declare no limit
    /// of their own.
    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Extra time granted to a backend past its timeout (or past
    /// cancellation) to tear its sandbox down before the pipeline stops
    /// waiting.
    #[serde(with = "humantime_serde")]
    pub timeout_grace: Duration,

    /// Retry policy for retryable failures.
    pub retry: RetryConfig,

    /// Execution health thresholds.
    pub health: HealthConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(60),
            timeout_grace: Duration::from_secs(2),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

/// Retry policy. Only retryable errors (sandbox unavailability) are retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,

    /// Delay between attempts.
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::from_millis(200),
        }
    }
}

/// Streaming executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Bounded channel capacity for progress events.
    pub channel_capacity: usize,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// One configured backend instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Adapter kind (`local`, `process`, `docker`, `wasm`, `remote`, ...).
    pub kind: BackendKind,

    /// Disabled backends are never started and never contribute tools.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Kind-specific settings, decoded by the backend factory.
    #[serde(flatten)]
    pub settings: Map<String, Value>,
}

impl BackendConfig {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            enabled: true,
            settings: Map::new(),
        }
    }

    /// Decode the untyped settings into a typed per-kind config.
    pub fn decode<T: serde::de::DeserializeOwned>(&self, name: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.settings.clone())).map_err(|e| {
            Error::config(format!(
                "backend '{}' ({}) has invalid settings: {}",
                name, self.kind, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_parse_minimal_document() {
        let config = Config::from_json_str("{}").unwrap();
        assert_eq!(config.aggregator.max_parallelism, 8);
        assert_eq!(config.runtime.security_profile, SecurityProfile::Standard);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_parse_backends_and_durations() {
        let raw = r#"{
            "pipeline": { "default_timeout": "5s", "retry": { "max_attempts": 3, "backoff": "50ms" } },
            "runtime": { "security_profile": "hardened", "defaults": { "timeout": "2s" } },
            "backends": {
                "sh": { "kind": "process", "tools": [] },
                "box": { "kind": "docker", "enabled": false, "image": "alpine:3.20" }
            }
        }"#;
        let config = Config::from_json_str(raw).unwrap();
        assert_eq!(config.pipeline.default_timeout, Duration::from_secs(5));
        assert_eq!(config.pipeline.retry.max_attempts, 3);
        assert_eq!(config.pipeline.retry.backoff, Duration::from_millis(50));
        assert_eq!(config.runtime.security_profile, SecurityProfile::Hardened);
        assert_eq!(config.runtime.defaults.timeout, Some(Duration::from_secs(2)));

        let sh = &config.backends["sh"];
        assert_eq!(sh.kind, BackendKind::Process);
        assert!(sh.enabled);
        assert!(sh.settings.contains_key("tools"));

        let docker = &config.backends["box"];
        assert!(!docker.enabled);
        assert_eq!(docker.settings["image"], "alpine:3.20");
        assert_eq!(config.enabled_backends(), vec!["sh"]);
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = Config::from_json_str(r#"{"aggregator": {"max_parallelism": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("max_parallelism"));
    }

    #[test]
    fn test_rejects_missing_default_timeout() {
        let err =
            Config::from_json_str(r#"{"runtime": {"defaults": {"memory_bytes": 1024}}}"#).unwrap_err();
        assert!(err.to_string().contains("runtime.defaults.timeout"));
    }

    #[test]
    fn test_rejects_backend_name_with_separator() {
        let raw = r#"{"backends": {"a/b": {"kind": "local"}}}"#;
        let err = Config::from_json_str(raw).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_decode_reports_backend_name() {
        let mut cfg = BackendConfig::new(BackendKind::Remote);
        cfg.settings.insert("base_url".into(), Value::from(42));

        #[derive(Debug, Deserialize)]
        struct Remote {
            #[allow(dead_code)]
            base_url: String,
        }

        let err = cfg.decode::<Remote>("api").unwrap_err();
        assert!(err.to_string().contains("backend 'api'"));
    }
}
