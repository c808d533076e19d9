//! Child processes with bounded output capture.
//!
//! Shared by the process and docker sandboxes: both end up running a host
//! process (the tool itself, or the `docker start --attach` client) whose
//! stdin receives the task input and whose output is captured.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::output::{capture, capture_with_progress, SharedBuffer};
use super::sandbox::{ExecutionPlan, RawOutcome};
use crate::types::{Error, Result};

/// How long to wait for output readers after the process exited. Readers can
/// outlive the process when a grandchild inherited the pipes.
const READER_DRAIN: Duration = Duration::from_secs(2);

/// A spawned process plus its capture tasks.
#[derive(Debug)]
pub struct CapturedChild {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: SharedBuffer,
    stderr: SharedBuffer,
    readers: Vec<JoinHandle<std::io::Result<()>>>,
}

impl CapturedChild {
    /// Spawn `cmd` with piped stdio and start capturing its output.
    pub fn spawn(mut cmd: Command, plan: &ExecutionPlan) -> std::io::Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;

        let stdout = SharedBuffer::new(plan.max_output_bytes);
        let stderr = SharedBuffer::new(plan.max_output_bytes);
        let mut readers = Vec::with_capacity(2);

        if let Some(out) = child.stdout.take() {
            let buffer = stdout.clone();
            readers.push(match plan.progress.clone() {
                Some(sink) => tokio::spawn(capture_with_progress(out, buffer, sink)),
                None => tokio::spawn(capture(out, buffer)),
            });
        }
        if let Some(err) = child.stderr.take() {
            readers.push(tokio::spawn(capture(err, stderr.clone())));
        }

        Ok(Self {
            stdin: child.stdin.take(),
            child,
            stdout,
            stderr,
            readers,
        })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Write the input document, close stdin, wait for exit and collect output.
    pub async fn feed_and_wait(&mut self, input: &[u8]) -> Result<RawOutcome> {
        if let Some(mut stdin) = self.stdin.take() {
            match stdin.write_all(input).await {
                Ok(()) => {}
                // The tool is free to ignore its input.
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(Error::Io(e)),
            }
            let _ = stdin.shutdown().await;
        }

        let status = self.child.wait().await?;
        self.drain_readers().await;

        Ok(RawOutcome {
            exit_code: status.code(),
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        })
    }

    async fn drain_readers(&mut self) {
        for reader in self.readers.iter_mut() {
            match tokio::time::timeout(READER_DRAIN, reader).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => debug!(error = %e, "output reader failed"),
                Ok(Err(e)) => debug!(error = %e, "output reader panicked"),
                Err(_) => debug!("output reader still open after exit; abandoning"),
            }
        }
        self.abort_readers();
    }

    /// Kill the process and reap it.
    pub async fn kill(&mut self) -> Result<()> {
        self.stdin = None;
        match self.child.kill().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Non-blocking kill used at release.
    pub fn start_kill(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.start_kill();
        }
    }

    pub fn partial_stderr(&self) -> Option<String> {
        self.stderr.snapshot().non_empty()
    }

    pub fn abort_readers(&mut self) {
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

impl Drop for CapturedChild {
    fn drop(&mut self) {
        self.abort_readers();
    }
}
