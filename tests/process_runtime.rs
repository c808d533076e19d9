//! Process sandbox integration tests with real `/bin/sh` tools driven through
//! the engine. Covers the stdin/stdout protocol, failures, deadlines, progress
//! and scratch cleanup.
#![cfg(unix)]

use futures::StreamExt;
use serde_json::json;
use std::time::Duration;
use tempfile::TempDir;
use toolexec_core::{Config, ErrorKind, ExecContext, StreamEvent, ToolEngine, ToolRequest};

fn sh(name: &str, script: &str) -> serde_json::Value {
    json!({
        "name": name,
        "entrypoint": {"type": "command", "program": "/bin/sh", "args": ["-c", script]}
    })
}

/// Helper: engine with one `process` backend named `sh` rooted in a temp dir.
async fn start_engine() -> (ToolEngine, TempDir) {
    let scratch = TempDir::new().unwrap();

    let mut progress = sh(
        "progress",
        "echo '::progress {\"message\": \"half\", \"fraction\": 0.5}'; echo '::progress done'; echo '{\"ok\": true}'",
    );
    progress["progress"] = json!(true);
    let mut limited = sh("limited", "exec sleep 2");
    limited["resources"] = json!({"timeout": "200ms"});
    let mut greet = sh("greet", "printf '%s' \"$GREETING\"");
    greet["env"] = json!({"GREETING": "hello"});

    let config = Config::from_json_str(
        &json!({
            "pipeline": {"timeout_grace": "2s"},
            "backends": {
                "sh": {
                    "kind": "process",
                    "security_profile": "none",
                    "scratch_root": scratch.path(),
                    "tools": [
                        sh("echo_input", "read -r line; printf '%s' \"$line\""),
                        sh("fail", "echo oops >&2; exit 3"),
                        sh("sleepy", "exec sleep 5"),
                        sh("where", "printf '%s' \"$TOOLEXEC_TOOL\""),
                        progress,
                        greet,
                        limited
                    ]
                }
            }
        })
        .to_string(),
    )
    .unwrap();

    let engine = ToolEngine::from_config(config).unwrap();
    engine.start(&ExecContext::new()).await.unwrap();
    (engine, scratch)
}

fn leftover_task_dirs(scratch: &TempDir) -> usize {
    std::fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("task-"))
        .count()
}

#[tokio::test]
async fn test_arguments_arrive_on_stdin_and_json_stdout_is_parsed() {
    let (engine, scratch) = start_engine().await;

    let result = engine
        .call(
            &ExecContext::new(),
            ToolRequest::new("sh/echo_input")
                .with_argument("city", json!("Oslo"))
                .with_argument("days", json!(3)),
        )
        .await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.output, Some(json!({"city": "Oslo", "days": 3})));
    assert_eq!(leftover_task_dirs(&scratch), 0);
}

#[tokio::test]
async fn test_tool_identity_is_exported() {
    let (engine, _scratch) = start_engine().await;
    let result = engine
        .call(&ExecContext::new(), ToolRequest::new("sh/where"))
        .await;
    assert_eq!(result.output, Some(json!("sh/where")));
}

#[tokio::test]
async fn test_nonzero_exit_carries_code_and_stderr() {
    let (engine, scratch) = start_engine().await;

    let result = engine
        .call(&ExecContext::new(), ToolRequest::new("sh/fail"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionFailed));
    assert_eq!(result.metrics.exit_code, Some(3));
    let error = result.error.unwrap();
    assert_eq!(error.stderr.as_deref(), Some("oops"));
    assert!(!error.retryable);
    assert_eq!(leftover_task_dirs(&scratch), 0);
}

#[tokio::test]
async fn test_deadline_kills_the_process() {
    let (engine, scratch) = start_engine().await;

    let started = std::time::Instant::now();
    let result = engine
        .call(
            &ExecContext::new(),
            ToolRequest::new("sh/sleepy").with_timeout(Duration::from_millis(300)),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(leftover_task_dirs(&scratch), 0);
}

#[tokio::test]
async fn test_manifest_timeout_applies_without_request_timeout() {
    let (engine, scratch) = start_engine().await;

    let started = std::time::Instant::now();
    let result = engine
        .call(&ExecContext::new(), ToolRequest::new("sh/limited"))
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ExecutionTimeout));
    assert!(started.elapsed() < Duration::from_millis(1500));
    assert_eq!(leftover_task_dirs(&scratch), 0);

    let listed = engine
        .list_tools(&ExecContext::new())
        .await
        .tools
        .into_iter()
        .find(|t| t.name == "limited")
        .unwrap();
    assert_eq!(listed.timeout, Some(Duration::from_millis(200)));
}

#[tokio::test]
async fn test_request_env_overrides_manifest_env() {
    let (engine, _scratch) = start_engine().await;
    let ctx = ExecContext::new();

    let default = engine.call(&ctx, ToolRequest::new("sh/greet")).await;
    assert_eq!(default.output, Some(json!("hello")));

    let overridden = engine
        .call(&ctx, ToolRequest::new("sh/greet").with_env("GREETING", "bye"))
        .await;
    assert_eq!(overridden.output, Some(json!("bye")));
}

#[tokio::test]
async fn test_progress_lines_become_stream_events() {
    let (engine, _scratch) = start_engine().await;

    let stream = engine
        .stream(&ExecContext::new(), ToolRequest::new("sh/progress"))
        .await;
    assert!(stream.progress_supported());

    let events: Vec<StreamEvent> = stream.collect().await;
    assert_eq!(events.len(), 3);
    match (&events[0], &events[1], &events[2]) {
        (StreamEvent::Progress(first), StreamEvent::Progress(second), StreamEvent::Completed(done)) => {
            assert_eq!(first.message, "half");
            assert_eq!(first.fraction, Some(0.5));
            assert_eq!(second.message, "done");
            assert_eq!(second.sequence, 1);
            assert_eq!(done.output, Some(json!({"ok": true})));
            assert_eq!(done.metrics.progress_events, 2);
        }
        other => panic!("unexpected events: {:?}", other),
    }
}

#[tokio::test]
async fn test_plain_call_hides_progress_lines_from_output() {
    let (engine, _scratch) = start_engine().await;
    let result = engine
        .call(&ExecContext::new(), ToolRequest::new("sh/progress"))
        .await;
    assert_eq!(result.output, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_stricter_requested_profile_is_refused() {
    let (engine, _scratch) = start_engine().await;
    let result = engine
        .call(
            &ExecContext::new(),
            ToolRequest::new("sh/echo_input")
                .with_security_profile(toolexec_core::runtime::SecurityProfile::Hardened),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::SecurityViolation));
}
