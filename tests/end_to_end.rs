//! End-to-end tests: registry, aggregator, pipeline and chains wired the way
//! the engine wires them.

use pretty_assertions::assert_eq;
use serde_json::{json, Map, Value};
use std::io::Write;
use std::sync::Arc;
use toolexec_core::backend::{builtin_backend, Backend, BackendRegistry};
use toolexec_core::types::AggregatorConfig;
use toolexec_core::{
    Chain, Config, Error, ErrorKind, ExecContext, ToolAggregator, ToolEngine, ToolRequest,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn args(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Registry with one built-in backend named `local`, and its aggregator.
fn local_aggregator() -> (Arc<BackendRegistry>, ToolAggregator) {
    let registry = Arc::new(BackendRegistry::new());
    registry
        .register(Arc::new(builtin_backend("local").unwrap()))
        .unwrap();
    let aggregator = ToolAggregator::new(Arc::clone(&registry), AggregatorConfig::default());
    (registry, aggregator)
}

async fn engine() -> ToolEngine {
    let config = Config::from_json_str(
        r#"{ "backends": { "local": { "kind": "local" }, "tools": { "kind": "local", "tools": ["echo"] } } }"#,
    )
    .unwrap();
    let engine = ToolEngine::from_config(config).unwrap();
    engine.start(&ExecContext::new()).await.unwrap();
    engine
}

// =============================================================================
// Aggregator scenarios
// =============================================================================

#[tokio::test]
async fn test_local_echo_round_trip() {
    let (_registry, aggregator) = local_aggregator();
    let output = aggregator
        .execute(&ExecContext::new(), "local/echo", args(json!({"message": "hi"})))
        .await
        .unwrap();
    assert_eq!(output, json!("hi"));
}

#[tokio::test]
async fn test_unknown_backend_is_backend_not_found() {
    let (_registry, aggregator) = local_aggregator();
    let err = aggregator
        .execute(&ExecContext::new(), "ghost/tool", Map::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendNotFound);
}

#[tokio::test]
async fn test_disabled_backend_is_refused_and_unlisted() {
    let (registry, aggregator) = local_aggregator();
    let ctx = ExecContext::new();
    assert!(!aggregator.list_all_tools(&ctx).await.tools.is_empty());

    registry.disable("local").unwrap();

    let err = aggregator
        .execute(&ctx, "local/echo", args(json!({"message": "hi"})))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BackendDisabled);

    let listing = aggregator.list_all_tools(&ctx).await;
    assert!(listing.tools.is_empty());
    assert!(!listing.is_partial());

    registry.enable("local").unwrap();
    assert!(!aggregator.list_all_tools(&ctx).await.tools.is_empty());
}

#[tokio::test]
async fn test_malformed_ids_are_invalid() {
    let (_registry, aggregator) = local_aggregator();
    for id in ["", "noslash", "/tool", "local/", "a/b/c"] {
        let err = aggregator
            .execute(&ExecContext::new(), id, Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidToolId, "{id:?}");
    }
}

// =============================================================================
// Registry properties
// =============================================================================

#[test]
fn test_registry_lists_in_stable_name_order() {
    let registry = BackendRegistry::new();
    for name in ["zeta", "alpha", "mid"] {
        registry
            .register(Arc::new(builtin_backend(name).unwrap()) as Arc<dyn Backend>)
            .unwrap();
    }
    let first: Vec<String> = registry.list().iter().map(|b| b.name().to_string()).collect();
    let second: Vec<String> = registry.list().iter().map(|b| b.name().to_string()).collect();
    assert_eq!(first, vec!["alpha", "mid", "zeta"]);
    assert_eq!(first, second);
}

#[test]
fn test_duplicate_registration_leaves_registry_unchanged() {
    let registry = BackendRegistry::new();
    registry
        .register(Arc::new(builtin_backend("local").unwrap()))
        .unwrap();
    let err = registry
        .register(Arc::new(builtin_backend("local").unwrap()))
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyRegistered(_)));
    assert_eq!(registry.len(), 1);
}

// =============================================================================
// Pipeline through the engine
// =============================================================================

#[tokio::test]
async fn test_bare_name_resolves_only_when_unique() {
    let engine = engine().await;
    let ctx = ExecContext::new();

    let sleep = engine
        .call(&ctx, ToolRequest::new("sleep").with_argument("millis", json!(1)))
        .await;
    assert!(sleep.is_success(), "{:?}", sleep.error);
    assert_eq!(sleep.tool, "local/sleep");

    // Both backends serve `echo`.
    let echo = engine
        .call(&ctx, ToolRequest::new("echo").with_argument("message", json!("x")))
        .await;
    assert_eq!(echo.error_kind(), Some(ErrorKind::InvalidToolId));
}

#[tokio::test]
async fn test_schema_violation_is_reported_not_executed() {
    let engine = engine().await;
    let result = engine
        .call(
            &ExecContext::new(),
            ToolRequest::new("tools/echo").with_argument("message", json!(42)),
        )
        .await;
    assert_eq!(result.error_kind(), Some(ErrorKind::ValidationError));
    assert_eq!(engine.tool_health().tools.len(), 0);
}

#[tokio::test]
async fn test_results_carry_content_and_metrics() {
    let engine = engine().await;
    let result = engine
        .call(
            &ExecContext::new(),
            ToolRequest::new("tools/echo").with_argument("message", json!("hello")),
        )
        .await;
    assert!(result.is_success());
    assert_eq!(result.metrics.attempts, 1);
    assert_eq!(result.metrics.stages.len(), 6);
    let encoded = serde_json::to_value(&result).unwrap();
    assert_eq!(encoded["content"], json!([{"type": "text", "text": "hello"}]));
}

// =============================================================================
// Chains
// =============================================================================

#[tokio::test]
async fn test_chain_from_document_pipes_outputs() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        "{}",
        json!({
            "name": "relay",
            "steps": [
                {"tool": "local/echo", "input": {"message": "ping"}},
                {"name": "again", "tool": "tools/echo", "mapping": {"message": "$"}}
            ]
        })
    )
    .unwrap();

    let engine = engine().await;
    let chain = Chain::from_file(file.path()).unwrap();
    let result = engine.run_chain(&ExecContext::new(), &chain).await;
    assert!(result.is_success(), "{:?}", result.failure);
    assert_eq!(result.steps.len(), 2);
    assert_eq!(result.steps[1].name, "again");
    assert_eq!(result.output(), Some(&json!("ping")));
}

#[tokio::test]
async fn test_chain_stops_at_first_failure() {
    let chain = Chain::from_json_str(
        &json!({
            "steps": [
                {"name": "a", "tool": "local/sleep", "input": {"millis": 1}},
                {"name": "b", "tool": "local/echo", "mapping": {"message": "$.slept_ms"}},
                {"name": "c", "tool": "local/echo", "input": {"message": "never"}}
            ]
        })
        .to_string(),
    )
    .unwrap();

    let engine = engine().await;
    let result = engine.run_chain(&ExecContext::new(), &chain).await;

    assert_eq!(result.steps.len(), 2);
    assert!(result.steps[0].result.is_success());
    assert_eq!(
        result.steps[1].result.error_kind(),
        Some(ErrorKind::ValidationError)
    );
    let failure = result.failure.unwrap();
    assert_eq!(failure.step, 1);
    assert_eq!(failure.name, "b");
    // Only a and b ever reached the pipeline.
    let executed: usize = engine
        .tool_health()
        .tools
        .iter()
        .map(|t| t.total_calls)
        .sum();
    assert_eq!(executed, 1);
}
