//! Sandbox abstraction and the generic runtime that drives it.
//!
//! A [`Sandbox`] knows how to acquire, run, terminate and release one
//! isolated environment. [`SandboxRuntime`] implements everything else once
//! for every technology: resource resolution, the security ceiling,
//! cancellable acquisition, the hard wall-clock deadline, cancellation and
//! unconditional release.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::output::CapturedOutput;
use super::resources::{EffectiveResources, Resources, FALLBACK_TIMEOUT};
use super::security::{effective_profile, SecurityPolicy, SecurityProfile};
use super::task::{Task, TaskResult, TaskState};
use super::Runtime;
use crate::context::{ExecContext, ProgressSink};
use crate::types::{Error, Result, RuntimeConfig, TaskId};

// =============================================================================
// Sandbox trait
// =============================================================================

/// Everything a sandbox needs to set up and run one task.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub task_id: TaskId,
    pub tool_id: String,
    pub resources: EffectiveResources,
    pub policy: SecurityPolicy,
    /// Final environment: inherited host variables plus task variables.
    pub env: BTreeMap<String, String>,
    pub max_output_bytes: usize,
    /// Present when the task opted into progress. Marker lines are stripped
    /// from stdout and dropped when the caller does not listen.
    pub progress: Option<ProgressSink>,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct RawOutcome {
    pub exit_code: Option<i32>,
    pub stdout: CapturedOutput,
    pub stderr: CapturedOutput,
}

/// One isolation technology.
///
/// Implementations must not leak: whatever `acquire` allocates, `release`
/// frees, and `abort_acquire` frees anything an interrupted `acquire` left
/// behind.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    /// Live sandbox state owned by one task.
    type Handle: Send + 'static;

    /// Sandbox technology name (`process`, `docker`, `wasm`, ...).
    fn kind(&self) -> &str;

    /// Strictest profile this technology can enforce.
    fn max_profile(&self) -> SecurityProfile;

    /// Whether tool progress lines are forwarded.
    fn supports_progress(&self) -> bool {
        false
    }

    /// Check that the technology is usable right now.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    async fn acquire(&self, task: &Task, plan: &ExecutionPlan) -> Result<Self::Handle>;

    /// Clean up after an acquisition that was cancelled, timed out or failed.
    async fn abort_acquire(&self, _task: &Task, _plan: &ExecutionPlan) -> Result<()> {
        Ok(())
    }

    /// Run the tool to completion. May be dropped mid-flight on timeout or
    /// cancellation, after which `terminate` is called.
    async fn run(
        &self,
        handle: &mut Self::Handle,
        task: &Task,
        plan: &ExecutionPlan,
    ) -> Result<RawOutcome>;

    /// Force-stop a running tool.
    async fn terminate(&self, handle: &mut Self::Handle) -> Result<()>;

    /// Stderr captured so far, for timeout reports.
    fn partial_stderr(&self, _handle: &Self::Handle) -> Option<String> {
        None
    }

    async fn release(&self, handle: Self::Handle) -> Result<()>;

    /// Tear down shared state. Idempotent.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Per-runtime settings, usually taken from `RuntimeConfig`.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    pub profile: SecurityProfile,
    pub defaults: Resources,
    pub max_output_bytes: usize,
    pub hardened_allow_network: bool,
    pub acquire_timeout: Duration,
    pub inherit_env: Vec<String>,
}

impl SandboxSettings {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            profile: config.security_profile,
            defaults: config.defaults,
            max_output_bytes: config.max_output_bytes,
            hardened_allow_network: config.hardened_allow_network,
            acquire_timeout: config.acquire_timeout,
            inherit_env: config.inherit_env.clone(),
        }
    }

    pub fn with_profile(mut self, profile: SecurityProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_defaults(mut self, defaults: Resources) -> Self {
        self.defaults = defaults;
        self
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self::from_config(&RuntimeConfig::default())
    }
}

// =============================================================================
// Lifecycle bookkeeping
// =============================================================================

#[derive(Debug)]
struct Lifecycle {
    task_id: TaskId,
    states: Vec<TaskState>,
}

impl Lifecycle {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            states: vec![TaskState::Prepared],
        }
    }

    fn current(&self) -> TaskState {
        self.states
            .last()
            .copied()
            .unwrap_or(TaskState::Prepared)
    }

    fn advance(&mut self, to: TaskState) {
        let from = self.current();
        if from.can_transition_to(to) {
            debug!(task_id = %self.task_id, ?from, ?to, "task_transition");
            self.states.push(to);
        } else {
            error!(task_id = %self.task_id, ?from, ?to, "invalid task transition ignored");
        }
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Acquisition<H> {
    Ready(H),
    Failed(Error),
    TimedOut,
    Cancelled,
}

enum RunEnd {
    Finished(Result<RawOutcome>),
    TimedOut,
    Cancelled,
}

// =============================================================================
// SandboxRuntime
// =============================================================================

struct Inner<S> {
    sandbox: S,
    settings: SandboxSettings,
    closed: AtomicBool,
    in_flight: AtomicUsize,
}

/// [`Runtime`] over any [`Sandbox`].
///
/// Each task is driven on its own tokio task, so the sandbox is released even
/// if the caller stops awaiting the result.
pub struct SandboxRuntime<S: Sandbox> {
    inner: Arc<Inner<S>>,
}

impl<S: Sandbox> std::fmt::Debug for SandboxRuntime<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("sandbox", &self.inner.sandbox.kind())
            .field("profile", &self.inner.settings.profile)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl<S: Sandbox> SandboxRuntime<S> {
    /// Fails when the sandbox cannot enforce the configured profile.
    pub fn new(sandbox: S, settings: SandboxSettings) -> Result<Self> {
        if settings.profile > sandbox.max_profile() {
            return Err(Error::config(format!(
                "{} sandbox cannot enforce the '{}' profile (maximum '{}')",
                sandbox.kind(),
                settings.profile,
                sandbox.max_profile()
            )));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                sandbox,
                settings,
                closed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
            }),
        })
    }

    pub fn sandbox(&self) -> &S {
        &self.inner.sandbox
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.inner.settings
    }

    /// Tasks currently between planning and release.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }
}

impl<S: Sandbox> Inner<S> {
    fn plan(&self, ctx: &ExecContext, task: &Task) -> Result<ExecutionPlan> {
        let requested = ctx.security_profile().max(task.requirements.profile);
        let profile = effective_profile(self.settings.profile, requested, self.sandbox.max_profile())?;
        let policy = SecurityPolicy::for_profile(profile, self.settings.hardened_allow_network);
        policy.check(&task.requirements)?;

        let resources = task
            .resources
            .overlay(ctx.resources())
            .resolve(&self.settings.defaults)?;

        let mut env: BTreeMap<String, String> = self
            .settings
            .inherit_env
            .iter()
            .filter_map(|key| std::env::var(key).ok().map(|value| (key.clone(), value)))
            .collect();
        env.extend(task.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let progress = if task.stream_progress && self.sandbox.supports_progress() {
            Some(ctx.progress().cloned().unwrap_or_else(ProgressSink::discard))
        } else {
            None
        };

        Ok(ExecutionPlan {
            task_id: task.id.clone(),
            tool_id: task.tool.qualified_id(),
            resources,
            policy,
            env,
            max_output_bytes: self.settings.max_output_bytes,
            progress,
        })
    }

    async fn drive(&self, ctx: &ExecContext, task: Task) -> Result<TaskResult> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        let kind = self.sandbox.kind();
        let mut life = Lifecycle::new(task.id.clone());

        let plan = match self.plan(ctx, &task) {
            Ok(plan) => plan,
            Err(e) => {
                debug!(error = %e, "task rejected before acquisition");
                life.advance(TaskState::Failed);
                return Err(e);
            }
        };

        // Acquire
        life.advance(TaskState::SandboxAcquiring);
        let acquisition = tokio::select! {
            biased;
            _ = ctx.cancelled() => Acquisition::Cancelled,
            acquired = tokio::time::timeout(
                self.settings.acquire_timeout,
                self.sandbox.acquire(&task, &plan),
            ) => match acquired {
                Ok(Ok(handle)) => Acquisition::Ready(handle),
                Ok(Err(e)) => Acquisition::Failed(e),
                Err(_) => Acquisition::TimedOut,
            },
        };

        let acquired = match acquisition {
            Acquisition::Ready(handle) => Ok(handle),
            Acquisition::Cancelled => Err((
                TaskState::Cancelled,
                Error::cancelled(format!("task {} cancelled during sandbox acquisition", task.id)),
            )),
            Acquisition::TimedOut => Err((
                TaskState::Failed,
                Error::sandbox_unavailable(format!(
                    "{} sandbox not acquired within {}ms",
                    kind,
                    self.settings.acquire_timeout.as_millis()
                )),
            )),
            Acquisition::Failed(e) => Err((TaskState::Failed, normalize_acquire_error(kind, e))),
        };

        let mut handle = match acquired {
            Ok(handle) => handle,
            Err((state, err)) => {
                if let Err(cleanup) = self.sandbox.abort_acquire(&task, &plan).await {
                    warn!(error = %cleanup, "cleanup after failed acquisition failed");
                }
                life.advance(state);
                life.advance(TaskState::Released);
                warn!(error = %err, "sandbox acquisition failed");
                return Err(err);
            }
        };

        // Run
        life.advance(TaskState::Running);
        let timeout = plan.resources.timeout;
        let started = Instant::now();
        let started_at = Utc::now();
        let ended = tokio::select! {
            biased;
            _ = ctx.cancelled() => RunEnd::Cancelled,
            finished = self.sandbox.run(&mut handle, &task, &plan) => RunEnd::Finished(finished),
            _ = tokio::time::sleep(timeout) => RunEnd::TimedOut,
        };
        let duration = started.elapsed();

        let finished = match ended {
            RunEnd::Finished(Ok(raw)) => {
                life.advance(if raw.exit_code == Some(0) {
                    TaskState::Succeeded
                } else {
                    TaskState::Failed
                });
                Ok(raw)
            }
            RunEnd::Finished(Err(e)) => {
                life.advance(TaskState::Failed);
                Err(e)
            }
            RunEnd::TimedOut => {
                self.terminate(&mut handle).await;
                let stderr = self.sandbox.partial_stderr(&handle);
                life.advance(TaskState::TimedOut);
                Err(Error::timeout(timeout, stderr))
            }
            RunEnd::Cancelled => {
                self.terminate(&mut handle).await;
                life.advance(TaskState::Cancelled);
                Err(Error::cancelled(format!("task {} cancelled while running", task.id)))
            }
        };

        // Release, whatever happened above
        if let Err(e) = self.sandbox.release(handle).await {
            warn!(error = %e, "sandbox release failed");
        }
        life.advance(TaskState::Released);

        match finished {
            Ok(raw) => {
                info!(
                    exit_code = ?raw.exit_code,
                    duration_ms = duration.as_millis() as u64,
                    "task finished"
                );
                Ok(TaskResult {
                    task_id: task.id,
                    exit_code: raw.exit_code,
                    stdout: raw.stdout.text,
                    stderr: raw.stderr.text,
                    stdout_truncated: raw.stdout.truncated,
                    stderr_truncated: raw.stderr.truncated,
                    duration,
                    started_at,
                    profile: plan.policy.profile,
                    resources: plan.resources,
                    states: life.states,
                })
            }
            Err(e) => {
                info!(error = %e, duration_ms = duration.as_millis() as u64, "task ended");
                Err(e)
            }
        }
    }

    async fn terminate(&self, handle: &mut S::Handle) {
        if let Err(e) = self.sandbox.terminate(handle).await {
            warn!(error = %e, "sandbox terminate failed");
        }
    }
}

/// Acquisition failures are infrastructure problems unless the sandbox
/// already classified them.
fn normalize_acquire_error(kind: &str, err: Error) -> Error {
    match err {
        Error::SandboxUnavailable(_)
        | Error::SecurityViolation(_)
        | Error::Config(_)
        | Error::Validation(_) => err,
        other => Error::sandbox_unavailable(format!("{} sandbox: {}", kind, other)),
    }
}

#[async_trait]
impl<S: Sandbox> Runtime for SandboxRuntime<S> {
    async fn execute(&self, ctx: &ExecContext, task: Task) -> Result<TaskResult> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::sandbox_unavailable(format!(
                "{} runtime is closed",
                self.inner.sandbox.kind()
            )));
        }

        let span = info_span!(
            "runtime.execute",
            task_id = %task.id,
            tool = %task.tool.qualified_id(),
            sandbox = %self.inner.sandbox.kind(),
        );
        let inner = Arc::clone(&self.inner);
        let ctx = ctx.clone();
        let driver = tokio::spawn(async move { inner.drive(&ctx, task).await }.instrument(span));

        match driver.await {
            Ok(result) => result,
            Err(e) => Err(Error::internal(format!("task driver failed: {}", e))),
        }
    }

    fn backend(&self) -> &str {
        self.inner.sandbox.kind()
    }

    fn security(&self) -> SecurityProfile {
        self.inner.settings.profile
    }

    fn supports_progress(&self) -> bool {
        self.inner.sandbox.supports_progress()
    }

    fn default_timeout(&self) -> Option<Duration> {
        Some(self.inner.settings.defaults.timeout.unwrap_or(FALLBACK_TIMEOUT))
    }

    async fn probe(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::sandbox_unavailable("runtime is closed"));
        }
        self.inner.sandbox.probe().await
    }

    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(sandbox = %self.inner.sandbox.kind(), "closing runtime");
        self.inner.sandbox.close().await
    }
}
