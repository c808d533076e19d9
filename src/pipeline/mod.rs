//! Request pipeline.
//!
//! [`Pipeline::execute`] drives one tool invocation through the six stages
//! (validate → authorize → prepare → execute → transform → respond) and
//! always returns a [`ToolResult`]; per-request failures never escape as
//! errors or panics.
//!
//! Only the execute stage blocks on tool work. It is retried for retryable
//! failures (sandbox unavailability) and bounded by a ceiling of the resolved
//! timeout plus a grace period. The timeout resolves from the request, then
//! the limit the tool declares, then the pipeline default. A runtime that
//! enforces the timeout itself always gets to tear its sandbox down first.

pub mod request;
pub mod result;
pub mod stages;

use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info_span, warn, Instrument};

use crate::aggregator::ToolAggregator;
use crate::context::ExecContext;
use crate::tools::{
    AllowAll, Arguments, Authorizer, JsonSchemaValidator, QualifiedToolId, SchemaValidator,
    SystemHealthReport, Tool, ToolHealthReport, ToolHealthTracker,
};
use crate::types::{Error, PipelineConfig, Result};

pub use request::{RequestOptions, ToolRequest};
pub use result::{Content, ExecutionMetrics, ToolError, ToolResult};
pub use stages::{Stage, StageTimer, StageTiming};

/// Request-bound context and limits produced by the prepare stage.
#[derive(Debug, Clone)]
pub struct PreparedCall {
    pub id: QualifiedToolId,
    pub tool: Tool,
    pub ctx: ExecContext,
    pub timeout: Duration,
}

/// Six-stage request controller.
pub struct Pipeline {
    aggregator: Arc<ToolAggregator>,
    validator: Arc<dyn SchemaValidator>,
    authorizer: Arc<dyn Authorizer>,
    health: Mutex<ToolHealthTracker>,
    config: PipelineConfig,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("aggregator", &self.aggregator)
            .field("validator", &self.validator)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(aggregator: Arc<ToolAggregator>, config: PipelineConfig) -> Self {
        Self {
            aggregator,
            validator: Arc::new(JsonSchemaValidator::new()),
            authorizer: Arc::new(AllowAll),
            health: Mutex::new(ToolHealthTracker::new(config.health.clone())),
            config,
        }
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    pub fn aggregator(&self) -> &Arc<ToolAggregator> {
        &self.aggregator
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run one request through every stage.
    pub async fn execute(&self, ctx: &ExecContext, request: ToolRequest) -> ToolResult {
        let span = info_span!(
            "pipeline",
            request_id = %ctx.request_id(),
            tool = %request.tool,
        );
        self.run(ctx, request).instrument(span).await
    }

    async fn run(&self, ctx: &ExecContext, request: ToolRequest) -> ToolResult {
        let mut timer = StageTimer::new();
        let mut metrics = ExecutionMetrics::default();
        let mut tool_id = request.tool.clone();

        let outcome = self
            .run_stages(ctx, request, &mut timer, &mut metrics, &mut tool_id)
            .await;

        // Respond
        timer.enter(Stage::Respond);
        let (output, content, error) = match outcome {
            Ok((output, content)) => (Some(output), content, None),
            Err(err) => {
                if let Error::ExecutionFailed { exit_code, .. } = &err {
                    metrics.exit_code = *exit_code;
                }
                debug!(kind = %err.kind(), error = %err, "request_failed");
                (None, Vec::new(), Some(ToolError::from(&err)))
            }
        };
        timer.exit(true);
        metrics.duration = timer.elapsed();
        metrics.stages = timer.into_timings();

        ToolResult {
            request_id: ctx.request_id().clone(),
            tool: tool_id,
            output,
            content,
            metrics,
            error,
        }
    }

    async fn run_stages(
        &self,
        ctx: &ExecContext,
        request: ToolRequest,
        timer: &mut StageTimer,
        metrics: &mut ExecutionMetrics,
        tool_id: &mut String,
    ) -> Result<(Value, Vec<Content>)> {
        let ToolRequest {
            tool: requested,
            arguments,
            caller,
            options,
        } = request;
        let ctx = match caller {
            Some(caller) => ctx.child().with_caller(caller),
            None => ctx.child(),
        };

        let (id, tool, arguments) = stage(timer, Stage::Validate, async {
            let id = self.aggregator.qualify(&ctx, &requested).await?;
            let tool = self.aggregator.find_tool(&ctx, &id.to_string()).await?;
            let arguments = self.validator.validate(&tool, arguments)?;
            Ok((id, tool, arguments))
        })
        .await?;
        *tool_id = id.to_string();

        stage(timer, Stage::Authorize, async {
            self.authorizer.authorize(&ctx, &tool, &arguments).await
        })
        .await?;

        let call = stage(timer, Stage::Prepare, async {
            self.prepare(&ctx, id, tool, &options)
        })
        .await?;

        let output = stage(
            timer,
            Stage::Execute,
            self.execute_with_retry(&call, arguments, metrics),
        )
        .await?;

        let content = stage(timer, Stage::Transform, async {
            Ok(Content::from_output(&output))
        })
        .await?;

        Ok((output, content))
    }

    /// Bind the request options to an execution context. Pure.
    pub fn prepare(
        &self,
        ctx: &ExecContext,
        id: QualifiedToolId,
        tool: Tool,
        options: &RequestOptions,
    ) -> Result<PreparedCall> {
        let requested = options
            .timeout
            .or(options.resources.timeout)
            .or(ctx.resources().timeout);
        // A tool that declares its own limit has it enforced by its backend.
        let mut resources = ctx.resources().overlay(&options.resources);
        resources.timeout =
            requested.or_else(|| tool.timeout.is_none().then_some(self.config.default_timeout));
        let timeout = requested
            .or(tool.timeout)
            .unwrap_or(self.config.default_timeout);
        resources.validate()?;

        let mut call = ctx
            .clone()
            .with_resources(resources)
            .with_env_map(options.env.clone());
        if let Some(requested) = options.security_profile {
            let profile = ctx
                .security_profile()
                .map_or(requested, |current| current.max(requested));
            call = call.with_security_profile(profile);
        }

        Ok(PreparedCall {
            id,
            tool,
            ctx: call,
            timeout,
        })
    }

    async fn execute_with_retry(
        &self,
        call: &PreparedCall,
        mut arguments: Arguments,
        metrics: &mut ExecutionMetrics,
    ) -> Result<Value> {
        let max_attempts = self.config.retry.max_attempts.max(1);
        let qualified = call.id.to_string();
        let mut attempt = 0;

        loop {
            attempt += 1;
            metrics.attempts = attempt;
            let args = if attempt < max_attempts {
                arguments.clone()
            } else {
                std::mem::take(&mut arguments)
            };

            let started = Instant::now();
            let result = self.attempt(call, &qualified, args).await;
            self.lock_health().record(
                &qualified,
                started.elapsed(),
                result.as_ref().err().map(Error::kind),
            );

            match result {
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(attempt, max_attempts, error = %err, "retrying_execution");
                    tokio::select! {
                        biased;
                        _ = call.ctx.cancelled() => {
                            return Err(Error::cancelled(format!("{} cancelled during retry backoff", qualified)));
                        }
                        _ = tokio::time::sleep(self.config.retry.backoff) => {}
                    }
                }
                other => return other,
            }
        }
    }

    /// One execution attempt bounded by `timeout + grace`. Past the ceiling
    /// the attempt is cancelled and given one more grace period to unwind.
    async fn attempt(&self, call: &PreparedCall, qualified: &str, args: Arguments) -> Result<Value> {
        let attempt_ctx = call.ctx.child();
        let grace = self.config.timeout_grace;
        let execution = self.aggregator.execute(&attempt_ctx, qualified, args);
        tokio::pin!(execution);

        tokio::select! {
            result = &mut execution => result,
            _ = tokio::time::sleep(call.timeout.saturating_add(grace)) => {
                warn!(tool = %qualified, timeout_ms = call.timeout.as_millis() as u64, "execution_ceiling_exceeded");
                attempt_ctx.cancel();
                if tokio::time::timeout(grace, &mut execution).await.is_err() {
                    warn!(tool = %qualified, "execution_abandoned_after_cancel");
                }
                Err(Error::timeout(call.timeout, None))
            }
        }
    }

    fn lock_health(&self) -> MutexGuard<'_, ToolHealthTracker> {
        self.health.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Execution health of one qualified tool.
    pub fn tool_health(&self, qualified_id: &str) -> ToolHealthReport {
        self.lock_health().tool_health(qualified_id)
    }

    /// Execution health of every tool this pipeline has run.
    pub fn system_health(&self) -> SystemHealthReport {
        self.lock_health().system_health()
    }
}

async fn stage<T, F>(timer: &mut StageTimer, stage: Stage, work: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    if !timer.enter(stage) {
        return Err(Error::internal(format!("stage '{}' entered out of order", stage)));
    }
    let result = work.await;
    timer.exit(result.is_ok());
    if let Err(err) = &result {
        debug!(stage = %stage, error = %err, "stage_failed");
    }
    result
}
