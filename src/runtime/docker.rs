//! Container sandbox driven through the `docker` CLI.
//!
//! Acquire creates a stopped container whose flags are derived from the
//! security policy and resources; run attaches to it with the input on
//! stdin; release removes it with `rm -f`. Containers are named after the
//! task id, so an interrupted `create` can still be cleaned up.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use super::child::CapturedChild;
use super::sandbox::{ExecutionPlan, RawOutcome, Sandbox};
use super::security::{FilesystemAccess, SecurityProfile};
use super::task::{Entrypoint, Task};
use crate::types::{Error, Result};

/// Container mount point for the scratch filesystem.
pub const SCRATCH_MOUNT: &str = "/scratch";

fn default_binary() -> String {
    "docker".to_string()
}

fn default_name_prefix() -> String {
    "toolexec".to_string()
}

/// Docker CLI settings.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct DockerSettings {
    /// Docker CLI binary.
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Image used by tools whose entrypoint is a plain command.
    #[serde(default)]
    pub default_image: Option<String>,

    /// Container name prefix.
    #[serde(default = "default_name_prefix")]
    pub name_prefix: String,

    /// Extra `docker create` arguments placed before the image.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for DockerSettings {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            default_image: None,
            name_prefix: default_name_prefix(),
            extra_args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DockerSandbox {
    settings: DockerSettings,
}

/// A created container and, while running, its attached client.
#[derive(Debug)]
pub struct DockerHandle {
    container: String,
    attached: Option<CapturedChild>,
}

impl DockerHandle {
    pub fn container(&self) -> &str {
        &self.container
    }
}

impl DockerSandbox {
    pub fn new(settings: DockerSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &DockerSettings {
        &self.settings
    }

    pub fn container_name(&self, task: &Task) -> String {
        format!("{}-{}", self.settings.name_prefix, task.id)
    }

    fn command(&self) -> Command {
        Command::new(&self.settings.binary)
    }

    /// Image and command for a task.
    fn image_and_command<'a>(&'a self, task: &'a Task) -> Result<(&'a str, Vec<String>)> {
        match &task.entrypoint {
            Entrypoint::Image { image, command } => Ok((image.as_str(), command.clone())),
            Entrypoint::Command { program, args } => {
                let image = self.settings.default_image.as_deref().ok_or_else(|| {
                    Error::config(format!(
                        "tool '{}' has a command entrypoint but no default image is configured",
                        task.tool.qualified_id()
                    ))
                })?;
                let mut command = vec![program.clone()];
                command.extend(args.iter().cloned());
                Ok((image, command))
            }
            other => Err(Error::config(format!(
                "tool '{}' has entrypoint {:?}, which docker cannot run",
                task.tool.qualified_id(),
                other
            ))),
        }
    }

    /// Arguments for `docker create`.
    pub fn create_args(&self, task: &Task, plan: &ExecutionPlan) -> Result<Vec<String>> {
        let (image, command) = self.image_and_command(task)?;
        let policy = &plan.policy;
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            self.container_name(task),
            "--interactive".into(),
            "--label".into(),
            format!("toolexec.task={}", task.id),
            "--label".into(),
            format!("toolexec.tool={}", plan.tool_id),
        ];

        // Resources
        if let Some(memory) = plan.resources.memory_bytes {
            args.push("--memory".into());
            args.push(format!("{}b", memory));
            args.push("--memory-swap".into());
            args.push(format!("{}b", memory));
        }
        if let Some(cpus) = plan.resources.cpus {
            args.push("--cpus".into());
            args.push(format!("{}", cpus));
        }
        if let Some(pids) = policy.pids_limit {
            args.push("--pids-limit".into());
            args.push(pids.to_string());
        }

        // Isolation
        if !(task.requirements.network && policy.allow_network) {
            args.push("--network".into());
            args.push("none".into());
        }
        if policy.read_only_root {
            args.push("--read-only".into());
        }
        if policy.drop_all_capabilities {
            args.push("--cap-drop".into());
            args.push("ALL".into());
        }
        if policy.no_new_privileges {
            args.push("--security-opt".into());
            args.push("no-new-privileges".into());
        }
        if let Some(user) = &policy.run_as {
            args.push("--user".into());
            args.push(user.clone());
        }

        // Scratch filesystem
        let scratch_access = task.requirements.filesystem.min(policy.max_filesystem);
        if scratch_access != FilesystemAccess::None {
            let mode = if scratch_access == FilesystemAccess::ReadWrite {
                "rw"
            } else {
                "ro"
            };
            let mut spec = format!("{}:{},noexec,nosuid", SCRATCH_MOUNT, mode);
            if let Some(disk) = plan.resources.disk_bytes {
                spec.push_str(&format!(",size={}", disk));
            }
            args.push("--tmpfs".into());
            args.push(spec);
            args.push("--workdir".into());
            args.push(SCRATCH_MOUNT.into());
        }

        // Environment: task variables only, never the host's.
        for (key, value) in &task.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }
        args.push("--env".into());
        args.push(format!("TOOLEXEC_TASK_ID={}", task.id));
        args.push("--env".into());
        args.push(format!("TOOLEXEC_TOOL={}", plan.tool_id));

        args.extend(self.settings.extra_args.iter().cloned());
        args.push(image.to_string());
        args.extend(command);
        Ok(args)
    }

    async fn remove(&self, container: &str) -> Result<()> {
        let output = self
            .command()
            .args(["rm", "--force", container])
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("No such container") {
            return Ok(());
        }
        Err(Error::internal(format!(
            "docker rm {} failed: {}",
            container,
            stderr.trim()
        )))
    }
}

#[async_trait]
impl Sandbox for DockerSandbox {
    type Handle = DockerHandle;

    fn kind(&self) -> &str {
        "docker"
    }

    fn max_profile(&self) -> SecurityProfile {
        SecurityProfile::Hardened
    }

    fn supports_progress(&self) -> bool {
        true
    }

    async fn probe(&self) -> Result<()> {
        let output = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::sandbox_unavailable(format!("docker CLI unavailable: {}", e)))?;
        if output.status.success() {
            debug!(
                server = %String::from_utf8_lossy(&output.stdout).trim(),
                "docker daemon reachable"
            );
            Ok(())
        } else {
            Err(Error::sandbox_unavailable(format!(
                "docker daemon unreachable: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )))
        }
    }

    async fn acquire(&self, task: &Task, plan: &ExecutionPlan) -> Result<DockerHandle> {
        let args = self.create_args(task, plan)?;
        let output = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::sandbox_unavailable(format!("docker CLI unavailable: {}", e)))?;
        if !output.status.success() {
            return Err(Error::sandbox_unavailable(format!(
                "docker create failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let container = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(container = %container, "container created");
        Ok(DockerHandle {
            container,
            attached: None,
        })
    }

    async fn abort_acquire(&self, task: &Task, _plan: &ExecutionPlan) -> Result<()> {
        self.remove(&self.container_name(task)).await
    }

    async fn run(
        &self,
        handle: &mut DockerHandle,
        task: &Task,
        plan: &ExecutionPlan,
    ) -> Result<RawOutcome> {
        let mut cmd = self.command();
        cmd.args(["start", "--attach", "--interactive", handle.container.as_str()]);
        let child = CapturedChild::spawn(cmd, plan)
            .map_err(|e| Error::sandbox_unavailable(format!("docker start failed: {}", e)))?;
        let attached = handle.attached.insert(child);
        attached.feed_and_wait(task.input_json().as_bytes()).await
    }

    async fn terminate(&self, handle: &mut DockerHandle) -> Result<()> {
        let output = self
            .command()
            .args(["kill", handle.container.as_str()])
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            warn!(
                container = %handle.container,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "docker kill failed"
            );
        }
        if let Some(attached) = handle.attached.as_mut() {
            attached.kill().await?;
        }
        Ok(())
    }

    fn partial_stderr(&self, handle: &DockerHandle) -> Option<String> {
        handle.attached.as_ref().and_then(CapturedChild::partial_stderr)
    }

    async fn release(&self, mut handle: DockerHandle) -> Result<()> {
        if let Some(attached) = handle.attached.as_mut() {
            attached.start_kill();
        }
        self.remove(&handle.container).await
    }
}
