//! Execution health tracking per qualified tool.
//!
//! Sliding-window success rate, latency and error-kind counts for every tool
//! the pipeline has executed. The pipeline records one sample per request;
//! the CLI `health` command and the engine surface the resulting reports.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::{Duration, Instant};

use crate::types::ErrorKind;

// =============================================================================
// Configuration
// =============================================================================

/// Health assessment thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Minimum success rate for `healthy` (default: 0.95).
    pub success_rate_healthy: f64,
    /// Minimum success rate for `degraded` (default: 0.80).
    pub success_rate_degraded: f64,
    /// Maximum average latency for `healthy` (default: 2s).
    #[serde(with = "humantime_serde")]
    pub latency_healthy: Duration,
    /// Maximum average latency for `degraded` (default: 5s).
    #[serde(with = "humantime_serde")]
    pub latency_degraded: Duration,
    /// Samples required before a tool is assessed (default: 5).
    pub min_calls_for_assessment: usize,
    /// Failures within `circuit_break_window` that open the circuit (default: 5).
    pub circuit_break_error_threshold: usize,
    /// Window for counting recent failures (default: 5 minutes).
    #[serde(with = "humantime_serde")]
    pub circuit_break_window: Duration,
    /// Samples kept per tool (default: 100).
    pub window_size: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_rate_healthy: 0.95,
            success_rate_degraded: 0.80,
            latency_healthy: Duration::from_secs(2),
            latency_degraded: Duration::from_secs(5),
            min_calls_for_assessment: 5,
            circuit_break_error_threshold: 5,
            circuit_break_window: Duration::from_secs(300),
            window_size: 100,
        }
    }
}

/// Assessed health of a tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthLevel {
    fn severity(self) -> u8 {
        match self {
            HealthLevel::Healthy => 0,
            HealthLevel::Degraded => 1,
            HealthLevel::Unhealthy => 2,
            HealthLevel::Unknown => 3,
        }
    }

    fn worse(self, other: HealthLevel) -> HealthLevel {
        if self.severity() >= other.severity() {
            self
        } else {
            other
        }
    }
}

impl fmt::Display for HealthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HealthLevel::Healthy => "healthy",
            HealthLevel::Degraded => "degraded",
            HealthLevel::Unhealthy => "unhealthy",
            HealthLevel::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// =============================================================================
// Samples
// =============================================================================

#[derive(Debug, Clone)]
struct Sample {
    success: bool,
    latency: Duration,
    at: Instant,
    error: Option<ErrorKind>,
}

#[derive(Debug)]
struct SampleWindow {
    samples: VecDeque<Sample>,
    capacity: usize,
}

impl SampleWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, sample: Sample) {
        if self.samples.len() >= self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn failures(&self) -> usize {
        self.samples.iter().filter(|s| !s.success).count()
    }

    fn success_rate(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        (self.len() - self.failures()) as f64 / self.len() as f64
    }

    fn avg_latency(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = self.samples.iter().map(|s| s.latency).sum();
        total / self.len() as u32
    }

    fn failures_since(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.samples
            .iter()
            .filter(|s| !s.success && now.duration_since(s.at) <= window)
            .count()
    }

    fn error_patterns(&self) -> Vec<(ErrorKind, usize)> {
        let mut counts: HashMap<ErrorKind, usize> = HashMap::new();
        for sample in self.samples.iter().filter(|s| !s.success) {
            let kind = sample.error.unwrap_or(ErrorKind::Internal);
            *counts.entry(kind).or_default() += 1;
        }
        let mut patterns: Vec<(ErrorKind, usize)> = counts.into_iter().collect();
        patterns.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.as_str().cmp(b.0.as_str())));
        patterns
    }
}

// =============================================================================
// Reports
// =============================================================================

/// Health report for one tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolHealthReport {
    pub tool: String,
    pub status: HealthLevel,
    pub success_rate: f64,
    #[serde(with = "humantime_serde")]
    pub avg_latency: Duration,
    pub total_calls: usize,
    pub recent_errors: usize,
    pub issues: Vec<String>,
    pub circuit_open: bool,
}

/// Health across every tracked tool.
#[derive(Debug, Clone, Serialize)]
pub struct SystemHealthReport {
    pub status: HealthLevel,
    pub tools: Vec<ToolHealthReport>,
    pub summary: HealthSummary,
}

/// Counts by health level.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSummary {
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

// =============================================================================
// Tracker
// =============================================================================

/// In-memory execution health tracker keyed by qualified tool id.
#[derive(Debug)]
pub struct ToolHealthTracker {
    config: HealthConfig,
    windows: BTreeMap<String, SampleWindow>,
}

impl ToolHealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            windows: BTreeMap::new(),
        }
    }

    /// Record one execution outcome.
    pub fn record(&mut self, tool: &str, latency: Duration, error: Option<ErrorKind>) {
        let capacity = self.config.window_size;
        self.windows
            .entry(tool.to_string())
            .or_insert_with(|| SampleWindow::new(capacity))
            .push(Sample {
                success: error.is_none(),
                latency,
                at: Instant::now(),
                error,
            });
    }

    /// Assess a single tool.
    pub fn tool_health(&self, tool: &str) -> ToolHealthReport {
        let Some(window) = self.windows.get(tool) else {
            return ToolHealthReport {
                tool: tool.to_string(),
                status: HealthLevel::Unknown,
                success_rate: 0.0,
                avg_latency: Duration::ZERO,
                total_calls: 0,
                recent_errors: 0,
                issues: vec!["no execution history".to_string()],
                circuit_open: false,
            };
        };

        let total = window.len();
        let success_rate = window.success_rate();
        let avg_latency = window.avg_latency();

        if total < self.config.min_calls_for_assessment {
            return ToolHealthReport {
                tool: tool.to_string(),
                status: HealthLevel::Unknown,
                success_rate,
                avg_latency,
                total_calls: total,
                recent_errors: window.failures(),
                issues: vec![format!(
                    "insufficient data ({}/{})",
                    total, self.config.min_calls_for_assessment
                )],
                circuit_open: false,
            };
        }

        let recent_errors = window.failures_since(self.config.circuit_break_window);
        let circuit_open = recent_errors >= self.config.circuit_break_error_threshold;

        let rate_level = if success_rate >= self.config.success_rate_healthy {
            HealthLevel::Healthy
        } else if success_rate >= self.config.success_rate_degraded {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        };
        let latency_level = if avg_latency <= self.config.latency_healthy {
            HealthLevel::Healthy
        } else if avg_latency <= self.config.latency_degraded {
            HealthLevel::Degraded
        } else {
            HealthLevel::Unhealthy
        };

        let mut issues = Vec::new();
        if success_rate < self.config.success_rate_healthy {
            issues.push(format!(
                "success rate {:.1}% below {:.0}% threshold",
                success_rate * 100.0,
                self.config.success_rate_healthy * 100.0
            ));
        }
        if avg_latency > self.config.latency_healthy {
            issues.push(format!(
                "average latency {}ms exceeds {}ms threshold",
                avg_latency.as_millis(),
                self.config.latency_healthy.as_millis()
            ));
        }
        if circuit_open {
            issues.push(format!(
                "circuit open: {} failures in the last {}s",
                recent_errors,
                self.config.circuit_break_window.as_secs()
            ));
        }

        ToolHealthReport {
            tool: tool.to_string(),
            status: rate_level.worse(latency_level),
            success_rate,
            avg_latency,
            total_calls: total,
            recent_errors,
            issues,
            circuit_open,
        }
    }

    /// Whether recent failures for `tool` reached the circuit threshold.
    pub fn is_circuit_open(&self, tool: &str) -> bool {
        self.windows
            .get(tool)
            .map(|w| {
                w.failures_since(self.config.circuit_break_window)
                    >= self.config.circuit_break_error_threshold
            })
            .unwrap_or(false)
    }

    /// Assess every tracked tool, sorted by tool id.
    pub fn system_health(&self) -> SystemHealthReport {
        let tools: Vec<ToolHealthReport> =
            self.windows.keys().map(|t| self.tool_health(t)).collect();

        let mut summary = HealthSummary::default();
        for report in &tools {
            match report.status {
                HealthLevel::Healthy => summary.healthy += 1,
                HealthLevel::Degraded => summary.degraded += 1,
                HealthLevel::Unhealthy => summary.unhealthy += 1,
                HealthLevel::Unknown => summary.unknown += 1,
            }
        }

        let status = if summary.unhealthy > 0 {
            HealthLevel::Unhealthy
        } else if summary.degraded > 0 {
            HealthLevel::Degraded
        } else if summary.healthy > 0 {
            HealthLevel::Healthy
        } else {
            HealthLevel::Unknown
        };

        SystemHealthReport {
            status,
            tools,
            summary,
        }
    }

    /// Failure counts by error kind, most frequent first.
    pub fn error_patterns(&self, tool: &str) -> Vec<(ErrorKind, usize)> {
        self.windows
            .get(tool)
            .map(SampleWindow::error_patterns)
            .unwrap_or_default()
    }

    /// Number of tracked tools.
    pub fn tool_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for ToolHealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
