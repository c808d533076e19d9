//! Streaming execution.
//!
//! [`StreamingExecutor::execute`] runs a request through the pipeline on a
//! background task and returns an [`ExecutionStream`]: zero or more
//! [`StreamEvent::Progress`] events followed by exactly one
//! [`StreamEvent::Completed`], after which the stream ends.
//!
//! Progress is a capability. Tools whose backend does not stream progress
//! (see [`ExecutionStream::progress_supported`]) yield only the terminal
//! result. Dropping the stream cancels the execution.

use futures::{Stream, StreamExt};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::DropGuard;
use tracing::{debug, warn, Instrument};

use crate::context::{ExecContext, ProgressEvent, ProgressSink};
use crate::pipeline::{ExecutionMetrics, Pipeline, ToolError, ToolRequest, ToolResult};
use crate::types::{Error, RequestId, StreamingConfig};

/// One item of an execution stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Progress(ProgressEvent),
    Completed(ToolResult),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Completed(_))
    }
}

#[derive(Debug, Clone)]
pub struct StreamingExecutor {
    pipeline: Arc<Pipeline>,
    config: StreamingConfig,
}

impl StreamingExecutor {
    pub fn new(pipeline: Arc<Pipeline>, config: StreamingConfig) -> Self {
        Self { pipeline, config }
    }

    /// Whether `tool` (qualified or bare) streams progress. Unresolvable ids
    /// report `false`.
    pub async fn supports_progress(&self, ctx: &ExecContext, tool: &str) -> bool {
        let aggregator = self.pipeline.aggregator();
        match aggregator.qualify(ctx, tool).await {
            Ok(id) => aggregator.supports_progress(&id),
            Err(_) => false,
        }
    }

    /// Start executing `request` and stream its events.
    pub async fn execute(&self, ctx: &ExecContext, mut request: ToolRequest) -> ExecutionStream {
        let progress_supported = self.supports_progress(ctx, &request.tool).await;
        request.options.stream = true;

        let (sink, progress) = ProgressSink::channel(self.config.channel_capacity);
        let exec_ctx = ctx.child().with_progress(sink);
        let cancel_on_drop = exec_ctx.cancellation_token().clone().drop_guard();

        let request_id = exec_ctx.request_id().clone();
        let tool = request.tool.clone();
        let pipeline = Arc::clone(&self.pipeline);
        debug!(tool = %tool, progress_supported, "stream_started");
        let handle = tokio::spawn(
            async move { pipeline.execute(&exec_ctx, request).await }.in_current_span(),
        );

        ExecutionStream {
            progress: Some(progress),
            handle,
            terminal: None,
            finished: false,
            emitted: 0,
            progress_supported,
            request_id,
            tool,
            _cancel_on_drop: cancel_on_drop,
        }
    }
}

/// Lazy, finite, non-restartable sequence of execution events.
pub struct ExecutionStream {
    progress: Option<mpsc::Receiver<ProgressEvent>>,
    handle: JoinHandle<ToolResult>,
    terminal: Option<ToolResult>,
    finished: bool,
    emitted: u64,
    progress_supported: bool,
    request_id: RequestId,
    tool: String,
    _cancel_on_drop: DropGuard,
}

impl fmt::Debug for ExecutionStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionStream")
            .field("request_id", &self.request_id)
            .field("tool", &self.tool)
            .field("progress_supported", &self.progress_supported)
            .field("emitted", &self.emitted)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ExecutionStream {
    /// Whether the backend streams progress for this tool. When false the
    /// stream yields only the terminal result.
    pub fn progress_supported(&self) -> bool {
        self.progress_supported
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Drain the stream: every progress event and the terminal result.
    pub async fn collect_all(mut self) -> (Vec<ProgressEvent>, ToolResult) {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                StreamEvent::Progress(progress) => events.push(progress),
                StreamEvent::Completed(result) => return (events, result),
            }
        }
        let err = Error::internal("stream ended without a result");
        (events, self.failed_result(&err))
    }

    fn failed_result(&self, err: &Error) -> ToolResult {
        ToolResult {
            request_id: self.request_id.clone(),
            tool: self.tool.clone(),
            output: None,
            content: Vec::new(),
            metrics: ExecutionMetrics::default(),
            error: Some(ToolError::from(err)),
        }
    }

    fn joined(&self, joined: std::result::Result<ToolResult, JoinError>) -> ToolResult {
        match joined {
            Ok(result) => result,
            Err(e) => {
                warn!(tool = %self.tool, error = %e, "stream_task_failed");
                self.failed_result(&Error::internal(format!("execution task failed: {}", e)))
            }
        }
    }
}

impl Stream for ExecutionStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        if this.terminal.is_none() {
            if let Some(rx) = this.progress.as_mut() {
                match rx.poll_recv(cx) {
                    Poll::Ready(Some(event)) => {
                        this.emitted += 1;
                        return Poll::Ready(Some(StreamEvent::Progress(event)));
                    }
                    Poll::Ready(None) => this.progress = None,
                    Poll::Pending => {}
                }
            }
            match Pin::new(&mut this.handle).poll(cx) {
                Poll::Ready(joined) => this.terminal = Some(this.joined(joined)),
                Poll::Pending => return Poll::Pending,
            }
        }

        // Execution finished: flush buffered progress, then the result.
        if let Some(rx) = this.progress.as_mut() {
            match rx.try_recv() {
                Ok(event) => {
                    this.emitted += 1;
                    return Poll::Ready(Some(StreamEvent::Progress(event)));
                }
                Err(_) => this.progress = None,
            }
        }

        this.finished = true;
        match this.terminal.take() {
            Some(mut result) => {
                result.metrics.progress_events = this.emitted;
                Poll::Ready(Some(StreamEvent::Completed(result)))
            }
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::ToolAggregator;
    use crate::backend::{builtin_backend, Backend, BackendRegistry, LocalBackend};
    use crate::tools::Tool;
    use crate::types::{AggregatorConfig, ErrorKind, PipelineConfig};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn executor_with(backend: LocalBackend) -> StreamingExecutor {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(Arc::new(backend) as Arc<dyn Backend>)
            .unwrap();
        let aggregator = Arc::new(ToolAggregator::new(registry, AggregatorConfig::default()));
        let pipeline = Arc::new(Pipeline::new(aggregator, PipelineConfig::default()));
        StreamingExecutor::new(pipeline, StreamingConfig::default())
    }

    #[tokio::test]
    async fn test_progress_then_single_result() {
        let executor = executor_with(builtin_backend("local").unwrap());
        let stream = executor
            .execute(
                &ExecContext::new(),
                ToolRequest::new("local/sleep")
                    .with_argument("millis", json!(30))
                    .with_argument("steps", json!(3)),
            )
            .await;
        assert!(stream.progress_supported());

        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(events.len(), 4);
        assert!(events[..3]
            .iter()
            .all(|e| matches!(e, StreamEvent::Progress(_))));
        let sequences: Vec<u64> = events[..3]
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Progress(p) => Some(p.sequence),
                StreamEvent::Completed(_) => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2]);
        match &events[3] {
            StreamEvent::Completed(result) => {
                assert!(result.is_success());
                assert_eq!(result.metrics.progress_events, 3);
            }
            other => panic!("expected completion, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_progress_capability_yields_only_result() {
        let executor = executor_with(builtin_backend("local").unwrap());
        let stream = executor
            .execute(
                &ExecContext::new(),
                ToolRequest::new("echo").with_argument("message", json!("hi")),
            )
            .await;
        assert!(!stream.progress_supported());

        let (events, result) = stream.collect_all().await;
        assert!(events.is_empty());
        assert_eq!(result.output, Some(json!("hi")));
    }

    #[tokio::test]
    async fn test_errors_arrive_as_terminal_result() {
        let executor = executor_with(builtin_backend("local").unwrap());
        let stream = executor
            .execute(&ExecContext::new(), ToolRequest::new("ghost/tool"))
            .await;
        assert!(!stream.progress_supported());
        let (events, result) = stream.collect_all().await;
        assert!(events.is_empty());
        assert_eq!(result.error_kind(), Some(ErrorKind::BackendNotFound));
    }

    #[tokio::test]
    async fn test_dropping_stream_cancels_execution() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let cancelled = Arc::new(AtomicBool::new(false));
        let observed = Arc::clone(&cancelled);
        let mut backend = LocalBackend::new("local");
        backend
            .add_tool(Tool::new("hang", ""), move |_ctx, _args| {
                let guard = SetOnDrop(Arc::clone(&observed));
                async move {
                    let _guard = guard;
                    std::future::pending::<()>().await;
                    Ok(Value::Null)
                }
            })
            .unwrap();
        let executor = executor_with(backend);

        let stream = executor
            .execute(&ExecContext::new(), ToolRequest::new("local/hang"))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(stream);

        tokio::time::timeout(Duration::from_secs(2), async {
            while !cancelled.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stream_is_fused_after_completion() {
        let executor = executor_with(builtin_backend("local").unwrap());
        let mut stream = executor
            .execute(
                &ExecContext::new(),
                ToolRequest::new("local/echo").with_argument("message", json!("x")),
            )
            .await;
        assert!(stream.next().await.unwrap().is_terminal());
        assert!(stream.next().await.is_none());
        assert!(stream.next().await.is_none());
    }
}
