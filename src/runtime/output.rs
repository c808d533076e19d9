//! Bounded output capture.
//!
//! Sandboxes never buffer unbounded tool output. Each stream is copied into a
//! [`BoundedBuffer`] that keeps the first `cap` bytes and counts the rest.
//! Stdout may additionally be scanned line by line for progress markers.

use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::context::ProgressSink;

/// Lines starting with this marker are progress events, not output.
pub const PROGRESS_MARKER: &str = "::progress ";

const READ_CHUNK: usize = 8 * 1024;
const MAX_PENDING_LINE: usize = 64 * 1024;

/// Byte buffer that stops growing at `cap`.
#[derive(Debug)]
pub struct BoundedBuffer {
    data: Vec<u8>,
    cap: usize,
    total: u64,
}

impl BoundedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(READ_CHUNK)),
            cap,
            total: 0,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len() as u64;
        let room = self.cap.saturating_sub(self.data.len());
        let take = room.min(bytes.len());
        self.data.extend_from_slice(&bytes[..take]);
    }

    pub fn truncated(&self) -> bool {
        self.total > self.data.len() as u64
    }

    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn snapshot(&self) -> CapturedOutput {
        CapturedOutput {
            text: String::from_utf8_lossy(&self.data).into_owned(),
            truncated: self.truncated(),
            total_bytes: self.total,
        }
    }
}

/// Captured text of one stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
    pub total_bytes: u64,
}

impl CapturedOutput {
    /// Text for error reports; `None` when nothing was written.
    pub fn non_empty(&self) -> Option<String> {
        let trimmed = self.text.trim_end();
        if trimmed.is_empty() {
            None
        } else if self.truncated {
            Some(format!("{}\n[truncated, {} bytes total]", trimmed, self.total_bytes))
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Buffer shared between a reader task and its sandbox handle, so partial
/// output survives termination of the run.
#[derive(Debug, Clone)]
pub struct SharedBuffer(Arc<Mutex<BoundedBuffer>>);

impl SharedBuffer {
    pub fn new(cap: usize) -> Self {
        Self(Arc::new(Mutex::new(BoundedBuffer::new(cap))))
    }

    pub fn push(&self, bytes: &[u8]) {
        if let Ok(mut buf) = self.0.lock() {
            buf.push(bytes);
        }
    }

    pub fn snapshot(&self) -> CapturedOutput {
        self.0
            .lock()
            .map(|buf| buf.snapshot())
            .unwrap_or_default()
    }
}

/// Copy a stream into `buffer` until EOF.
pub async fn capture<R>(mut reader: R, buffer: SharedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buffer.push(&chunk[..n]);
    }
}

/// Copy stdout into `buffer`, diverting progress-marker lines to `sink`.
pub async fn capture_with_progress<R>(
    mut reader: R,
    buffer: SharedBuffer,
    sink: ProgressSink,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    let mut pending: Vec<u8> = Vec::new();
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if !pending.is_empty() {
                route_line(&pending, &buffer, &sink).await;
            }
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);
        while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=pos).collect();
            route_line(&line, &buffer, &sink).await;
        }
        if pending.len() > MAX_PENDING_LINE {
            buffer.push(&pending);
            pending.clear();
        }
    }
}

async fn route_line(line: &[u8], buffer: &SharedBuffer, sink: &ProgressSink) {
    let text = String::from_utf8_lossy(line);
    match text.trim_end_matches(['\r', '\n']).strip_prefix(PROGRESS_MARKER) {
        Some(payload) => emit_progress(payload.trim(), sink).await,
        None => buffer.push(line),
    }
}

/// Progress payloads are either plain text or a JSON object with optional
/// `message`, `fraction` and `data` keys.
async fn emit_progress(payload: &str, sink: &ProgressSink) {
    match serde_json::from_str::<Value>(payload) {
        Ok(Value::Object(map)) => {
            let message = map
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            if let Some(fraction) = map.get("fraction").and_then(Value::as_f64) {
                sink.fraction(message, fraction).await;
            } else if let Some(data) = map.get("data") {
                sink.data(message, data.clone()).await;
            } else {
                sink.message(message).await;
            }
        }
        _ => sink.message(payload).await,
    }
}
