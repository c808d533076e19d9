//! Resource limits for one task.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{Error, Result};

/// Wall-clock timeout used when no layer sets one.
pub const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Resource request. Every field is optional; an unset field inherits the
/// next layer down (request → tool → runtime defaults).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct Resources {
    /// Memory ceiling in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_bytes: Option<u64>,

    /// CPU share (fractional cores).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,

    /// Hard wall-clock deadline.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,

    /// Scratch disk quota in bytes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disk_bytes: Option<u64>,
}

impl Resources {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = Some(bytes);
        self
    }

    pub fn with_cpus(mut self, cpus: f64) -> Self {
        self.cpus = Some(cpus);
        self
    }

    pub fn with_disk_bytes(mut self, bytes: u64) -> Self {
        self.disk_bytes = Some(bytes);
        self
    }

    /// Field-wise overlay: set fields of `over` win, unset fields keep `self`.
    pub fn overlay(&self, over: &Resources) -> Resources {
        Resources {
            memory_bytes: over.memory_bytes.or(self.memory_bytes),
            cpus: over.cpus.or(self.cpus),
            timeout: over.timeout.or(self.timeout),
            disk_bytes: over.disk_bytes.or(self.disk_bytes),
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Resources::default()
    }

    /// Reject nonsensical values.
    pub fn validate(&self) -> Result<()> {
        if self.memory_bytes == Some(0) {
            return Err(Error::validation("memory_bytes must be positive"));
        }
        if let Some(cpus) = self.cpus {
            if !cpus.is_finite() || cpus <= 0.0 {
                return Err(Error::validation(format!("cpus must be positive, got {}", cpus)));
            }
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::validation("timeout must be positive"));
        }
        if self.disk_bytes == Some(0) {
            return Err(Error::validation("disk_bytes must be positive"));
        }
        Ok(())
    }

    /// Resolve against runtime defaults into the limits a sandbox enforces.
    pub fn resolve(&self, defaults: &Resources) -> Result<EffectiveResources> {
        let merged = defaults.overlay(self);
        merged.validate()?;
        Ok(EffectiveResources {
            memory_bytes: merged.memory_bytes,
            cpus: merged.cpus,
            timeout: merged.timeout.unwrap_or(FALLBACK_TIMEOUT),
            disk_bytes: merged.disk_bytes,
        })
    }
}

/// Fully resolved limits. The timeout is always present.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveResources {
    pub memory_bytes: Option<u64>,
    pub cpus: Option<f64>,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub disk_bytes: Option<u64>,
}
