//! Per-request execution context.
//!
//! Every blocking call in the crate takes an [`ExecContext`]. It carries the
//! caller's cancellation token plus the request-scoped overlays (environment,
//! resources, requested security profile) and an optional progress sink used
//! by the streaming executor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::runtime::{Resources, SecurityProfile};
use crate::types::RequestId;

// =============================================================================
// Progress
// =============================================================================

/// One intermediate progress event emitted while a tool runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Monotonic sequence number within one execution, starting at 0.
    pub sequence: u64,

    pub message: String,

    /// Completion fraction in `[0.0, 1.0]`, when the tool knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fraction: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    pub timestamp: DateTime<Utc>,
}

/// Sending half of a progress channel.
///
/// Cloning shares the sequence counter, so events from every clone are
/// numbered in emission order. Emission never fails: once the receiver is
/// gone events are discarded.
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::Sender<ProgressEvent>,
    sequence: Arc<AtomicU64>,
}

impl ProgressSink {
    /// Create a sink with a bounded channel of `capacity` events.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProgressEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                sequence: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Sink whose events go nowhere.
    pub fn discard() -> Self {
        Self::channel(1).0
    }

    /// Emit a plain message.
    pub async fn message(&self, message: impl Into<String>) {
        self.emit(message.into(), None, None).await;
    }

    /// Emit a message with a completion fraction (clamped into `[0, 1]`).
    pub async fn fraction(&self, message: impl Into<String>, fraction: f64) {
        let fraction = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.emit(message.into(), Some(fraction), None).await;
    }

    /// Emit a message carrying structured data.
    pub async fn data(&self, message: impl Into<String>, data: Value) {
        self.emit(message.into(), None, Some(data)).await;
    }

    async fn emit(&self, message: String, fraction: Option<f64>, data: Option<Value>) {
        if self.tx.is_closed() {
            return;
        }
        let event = ProgressEvent {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            message,
            fraction,
            data,
            timestamp: Utc::now(),
        };
        if self.tx.send(event).await.is_err() {
            tracing::trace!("progress receiver dropped; discarding event");
        }
    }

    /// Number of events emitted so far.
    pub fn emitted(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

// =============================================================================
// ExecContext
// =============================================================================

/// Request-scoped execution context.
#[derive(Debug, Clone)]
pub struct ExecContext {
    cancel: CancellationToken,
    request_id: RequestId,
    caller: Option<String>,
    env: BTreeMap<String, String>,
    resources: Resources,
    security: Option<SecurityProfile>,
    progress: Option<ProgressSink>,
}

impl Default for ExecContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            request_id: RequestId::new(),
            caller: None,
            env: BTreeMap::new(),
            resources: Resources::default(),
            security: None,
            progress: None,
        }
    }

    /// Use an externally owned cancellation token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_request_id(mut self, request_id: RequestId) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_env_map(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    /// Resource overrides; set fields win over tool and runtime defaults.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Request a specific security profile for this call.
    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.security = Some(profile);
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Derive a context whose cancellation follows this one but can also be
    /// cancelled on its own without affecting the parent.
    pub fn child(&self) -> Self {
        Self {
            cancel: self.cancel.child_token(),
            ..self.clone()
        }
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn caller(&self) -> Option<&str> {
        self.caller.as_deref()
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    pub fn security_profile(&self) -> Option<SecurityProfile> {
        self.security
    }

    pub fn progress(&self) -> Option<&ProgressSink> {
        self.progress.as_ref()
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_child_cancellation_is_one_way() {
        let parent = ExecContext::new();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        tokio::time::timeout(Duration::from_secs(1), child.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_child_keeps_overlays() {
        let ctx = ExecContext::new()
            .with_caller("ops")
            .with_env("MODE", "fast")
            .with_security_profile(SecurityProfile::Hardened);
        let child = ctx.child();
        assert_eq!(child.caller(), Some("ops"));
        assert_eq!(child.env()["MODE"], "fast");
        assert_eq!(child.security_profile(), Some(SecurityProfile::Hardened));
        assert_eq!(child.request_id(), ctx.request_id());
    }

    #[tokio::test]
    async fn test_progress_sequence_shared_across_clones() {
        let (sink, mut rx) = ProgressSink::channel(8);
        let other = sink.clone();
        sink.message("first").await;
        other.fraction("second", 1.7).await;
        sink.data("third", serde_json::json!({"n": 3})).await;

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!((a.sequence, b.sequence, c.sequence), (0, 1, 2));
        assert_eq!(b.fraction, Some(1.0));
        assert_eq!(c.data.unwrap()["n"], 3);
        assert_eq!(sink.emitted(), 3);
    }

    #[tokio::test]
    async fn test_progress_after_receiver_dropped_is_silent() {
        let (sink, rx) = ProgressSink::channel(1);
        drop(rx);
        sink.message("nobody listens").await;
        assert_eq!(sink.emitted(), 0);
    }
}
