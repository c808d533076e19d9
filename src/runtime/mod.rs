//! Sandboxed execution.
//!
//! A [`Runtime`] executes one [`Task`] inside an isolation boundary chosen by
//! the active [`SecurityProfile`], enforcing resource limits and a hard
//! wall-clock deadline. Every concrete runtime in this crate is a
//! [`SandboxRuntime`] over one [`Sandbox`] technology.

mod child;
pub mod docker;
pub mod output;
pub mod process;
pub mod resources;
pub mod sandbox;
pub mod security;
pub mod task;
#[cfg(feature = "wasm")]
pub mod wasm;

use async_trait::async_trait;
use std::time::Duration;

use crate::context::ExecContext;
use crate::types::Result;

pub use docker::{DockerSandbox, DockerSettings};
pub use output::{BoundedBuffer, CapturedOutput, PROGRESS_MARKER};
pub use process::ProcessSandbox;
pub use resources::{EffectiveResources, Resources};
pub use sandbox::{ExecutionPlan, RawOutcome, Sandbox, SandboxRuntime, SandboxSettings};
pub use security::{FilesystemAccess, SecurityPolicy, SecurityProfile, SecurityRequirements};
pub use task::{Entrypoint, Task, TaskResult, TaskState};
#[cfg(feature = "wasm")]
pub use wasm::{WasmSandbox, WasmSettings};

/// Executes tasks inside a sandbox.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Run one task to a single outcome. Non-zero exits are `Ok` results;
    /// timeouts, cancellation and infrastructure failures are errors.
    async fn execute(&self, ctx: &ExecContext, task: Task) -> Result<TaskResult>;

    /// Sandbox technology this runtime wraps.
    fn backend(&self) -> &str;

    /// Active security profile.
    fn security(&self) -> SecurityProfile;

    /// Release shared resources. Idempotent.
    async fn close(&self) -> Result<()>;

    /// Check that the sandbox technology is usable.
    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    /// Whether tasks that opt in can stream progress.
    fn supports_progress(&self) -> bool {
        false
    }

    /// Timeout applied to tasks whose resources leave it unset.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }
}
