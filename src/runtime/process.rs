//! Host child-process sandbox.
//!
//! Runs the tool as a plain child process in a per-task scratch directory
//! with a cleared environment. Provides no isolation beyond that, so it only
//! accepts the `none` profile and is meant for development.
//!
//! Protocol: the input arguments arrive as one JSON document on stdin; the
//! tool writes its result to stdout (JSON or text) and diagnostics to stderr.
//! Lines starting with [`PROGRESS_MARKER`](super::output::PROGRESS_MARKER)
//! become progress events when the tool opted in.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

use super::child::CapturedChild;
use super::sandbox::{ExecutionPlan, RawOutcome, Sandbox};
use super::security::SecurityProfile;
use super::task::{Entrypoint, Task};
use crate::types::{Error, Result};

/// Environment variables every tool receives.
pub const ENV_TASK_ID: &str = "TOOLEXEC_TASK_ID";
pub const ENV_TOOL_ID: &str = "TOOLEXEC_TOOL";
pub const ENV_SCRATCH: &str = "TOOLEXEC_SCRATCH";

#[derive(Debug, Clone)]
pub struct ProcessSandbox {
    scratch_root: PathBuf,
}

/// One spawned tool process and its scratch directory.
#[derive(Debug)]
pub struct ProcessHandle {
    child: CapturedChild,
    scratch: PathBuf,
}

impl ProcessSandbox {
    pub fn new(scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            scratch_root: scratch_root.into(),
        }
    }

    pub fn scratch_root(&self) -> &Path {
        &self.scratch_root
    }

    fn scratch_dir(&self, task: &Task) -> PathBuf {
        self.scratch_root.join(format!("task-{}", task.id))
    }
}

async fn remove_scratch(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

#[async_trait]
impl Sandbox for ProcessSandbox {
    type Handle = ProcessHandle;

    fn kind(&self) -> &str {
        "process"
    }

    fn max_profile(&self) -> SecurityProfile {
        SecurityProfile::None
    }

    fn supports_progress(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.scratch_root).await.map_err(|e| {
            Error::sandbox_unavailable(format!(
                "scratch root {} is not usable: {}",
                self.scratch_root.display(),
                e
            ))
        })
    }

    async fn acquire(&self, task: &Task, plan: &ExecutionPlan) -> Result<ProcessHandle> {
        let Entrypoint::Command { program, args } = &task.entrypoint else {
            return Err(Error::config(format!(
                "tool '{}' needs a command entrypoint to run as a process",
                plan.tool_id
            )));
        };

        let scratch = self.scratch_dir(task);
        tokio::fs::create_dir_all(&scratch).await.map_err(|e| {
            Error::sandbox_unavailable(format!(
                "cannot create scratch dir {}: {}",
                scratch.display(),
                e
            ))
        })?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(&plan.env)
            .env(ENV_TASK_ID, plan.task_id.as_str())
            .env(ENV_TOOL_ID, &plan.tool_id)
            .env(ENV_SCRATCH, &scratch)
            .current_dir(&scratch);

        match CapturedChild::spawn(cmd, plan) {
            Ok(child) => {
                debug!(pid = ?child.id(), program = %program, "spawned tool process");
                Ok(ProcessHandle { child, scratch })
            }
            Err(e) => {
                let _ = remove_scratch(&scratch).await;
                Err(Error::sandbox_unavailable(format!(
                    "failed to spawn '{}': {}",
                    program, e
                )))
            }
        }
    }

    async fn abort_acquire(&self, task: &Task, _plan: &ExecutionPlan) -> Result<()> {
        remove_scratch(&self.scratch_dir(task)).await
    }

    async fn run(
        &self,
        handle: &mut ProcessHandle,
        task: &Task,
        _plan: &ExecutionPlan,
    ) -> Result<RawOutcome> {
        handle.child.feed_and_wait(task.input_json().as_bytes()).await
    }

    async fn terminate(&self, handle: &mut ProcessHandle) -> Result<()> {
        handle.child.kill().await
    }

    fn partial_stderr(&self, handle: &ProcessHandle) -> Option<String> {
        handle.child.partial_stderr()
    }

    async fn release(&self, mut handle: ProcessHandle) -> Result<()> {
        handle.child.start_kill();
        handle.child.abort_readers();
        remove_scratch(&handle.scratch).await
    }
}
