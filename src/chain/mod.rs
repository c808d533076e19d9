//! Sequential tool chains.
//!
//! A [`Chain`] is an ordered list of steps. Each step names a tool, carries
//! static input and may map fields of the *immediately preceding* step's
//! output into its own input. Steps run strictly one after another through
//! the [`Pipeline`]; the first failure stops the chain.

pub mod path;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, Instrument};

use crate::context::ExecContext;
use crate::pipeline::{Pipeline, ToolError, ToolRequest, ToolResult};
use crate::tools::Arguments;
use crate::types::{ChainId, Error, RequestId, Result};

pub use path::{extract, insert_dotted, PathExpr, Segment};

// =============================================================================
// Chain document
// =============================================================================

/// One step of a chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ChainStep {
    /// Label used in logs and results. Defaults to the tool id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Qualified (`backend/tool`) or bare tool id.
    pub tool: String,

    /// Static input.
    #[serde(default)]
    pub input: Arguments,

    /// Input field (dotted target) → path into the previous step's output.
    /// Mapped values replace static input at the same target.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mapping: BTreeMap<String, String>,

    /// Per-step timeout, e.g. `"10s"`.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    #[schemars(with = "Option<String>")]
    pub timeout: Option<Duration>,
}

impl ChainStep {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            name: None,
            tool: tool.into(),
            input: Arguments::new(),
            mapping: BTreeMap::new(),
            timeout: None,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input.insert(key.into(), value);
        self
    }

    pub fn map(mut self, target: impl Into<String>, path: impl Into<String>) -> Self {
        self.mapping.insert(target.into(), path.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.tool)
    }

    /// Static input overlaid with the mapped fields of `previous`.
    pub fn build_input(&self, previous: Option<&Value>) -> Result<Arguments> {
        let mut input = self.input.clone();
        if self.mapping.is_empty() {
            return Ok(input);
        }
        let Some(previous) = previous else {
            return Err(Error::chain_mapping(format!(
                "step '{}' maps input but has no previous step",
                self.label()
            )));
        };
        for (target, expr) in &self.mapping {
            let value = PathExpr::parse(expr)?.extract(previous)?.clone();
            insert_dotted(&mut input, target, value)?;
        }
        Ok(input)
    }
}

/// Ordered, fail-fast sequence of tool invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Chain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub steps: Vec<ChainStep>,
}

impl Chain {
    pub fn new(steps: Vec<ChainStep>) -> Self {
        Self { name: None, steps }
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| Error::validation(format!("invalid chain document: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw).map_err(|e| match e {
            Error::Validation(msg) => Error::validation(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Static checks run before any step executes. Returns the offending
    /// step index with the error.
    pub fn validate(&self) -> std::result::Result<(), (usize, Error)> {
        if self.steps.is_empty() {
            return Err((0, Error::validation("chain has no steps")));
        }
        for (index, step) in self.steps.iter().enumerate() {
            if step.tool.trim().is_empty() {
                return Err((index, Error::validation(format!("step {} has no tool", index))));
            }
            if index == 0 && !step.mapping.is_empty() {
                return Err((
                    0,
                    Error::chain_mapping(format!(
                        "first step '{}' cannot map from a previous step",
                        step.label()
                    )),
                ));
            }
            for expr in step.mapping.values() {
                PathExpr::parse(expr).map_err(|e| (index, e))?;
            }
        }
        Ok(())
    }
}

/// JSON Schema of the chain document.
pub fn chain_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(Chain)).unwrap_or(Value::Null)
}

// =============================================================================
// Results
// =============================================================================

/// Result of one executed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    pub index: usize,
    pub name: String,
    pub result: ToolResult,
}

/// The step that stopped the chain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainFailure {
    pub step: usize,
    pub name: String,
    pub error: ToolError,
}

/// Outcome of a chain run: every step that ran, in order, plus the failure
/// that stopped it, if any.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChainResult {
    pub chain_id: ChainId,
    pub steps: Vec<StepResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ChainFailure>,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl ChainResult {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Output of the last step, when the chain completed.
    pub fn output(&self) -> Option<&Value> {
        if !self.is_success() {
            return None;
        }
        self.steps.last().and_then(|s| s.result.output.as_ref())
    }
}

// =============================================================================
// Executor
// =============================================================================

#[derive(Debug, Clone)]
pub struct ChainExecutor {
    pipeline: Arc<Pipeline>,
}

impl ChainExecutor {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn execute(&self, ctx: &ExecContext, chain: &Chain) -> ChainResult {
        let chain_id = ChainId::new();
        let span = info_span!("chain", chain_id = %chain_id, steps = chain.steps.len());
        self.run(ctx, chain, chain_id).instrument(span).await
    }

    async fn run(&self, ctx: &ExecContext, chain: &Chain, chain_id: ChainId) -> ChainResult {
        let started = Instant::now();
        let mut steps: Vec<StepResult> = Vec::with_capacity(chain.steps.len());
        let mut failure = None;

        if let Err((index, err)) = chain.validate() {
            failure = Some(failed(chain, index, &err));
        }

        if failure.is_none() {
            for (index, step) in chain.steps.iter().enumerate() {
                if ctx.is_cancelled() {
                    let err = Error::cancelled(format!("chain cancelled before step {}", index));
                    failure = Some(failed(chain, index, &err));
                    break;
                }

                let previous = steps.last().and_then(|s| s.result.output.as_ref());
                let input = match step.build_input(previous) {
                    Ok(input) => input,
                    Err(err) => {
                        failure = Some(failed(chain, index, &err));
                        break;
                    }
                };

                let mut request = ToolRequest::new(step.tool.clone()).with_arguments(input);
                request.caller = ctx.caller().map(str::to_string);
                if let Some(timeout) = step.timeout {
                    request = request.with_timeout(timeout);
                }

                debug!(step = index, tool = %step.tool, "chain_step_started");
                let step_ctx = ctx.child().with_request_id(RequestId::new());
                let result = self.pipeline.execute(&step_ctx, request).await;
                let step_error = result.error.clone();
                steps.push(StepResult {
                    index,
                    name: step.label().to_string(),
                    result,
                });

                if let Some(error) = step_error {
                    failure = Some(ChainFailure {
                        step: index,
                        name: step.label().to_string(),
                        error,
                    });
                    break;
                }
            }
        }

        match &failure {
            Some(f) => info!(step = f.step, kind = %f.error.kind, "chain_failed"),
            None => info!(steps = steps.len(), "chain_completed"),
        }

        ChainResult {
            chain_id,
            steps,
            failure,
            duration: started.elapsed(),
        }
    }
}

fn failed(chain: &Chain, index: usize, err: &Error) -> ChainFailure {
    ChainFailure {
        step: index,
        name: chain
            .steps
            .get(index)
            .map(|s| s.label().to_string())
            .unwrap_or_default(),
        error: ToolError::from(err),
    }
}
