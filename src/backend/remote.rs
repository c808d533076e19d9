//! HTTP backend.
//!
//! Talks JSON to a tool server:
//!
//! | Operation | Request                         | Success body            |
//! |-----------|---------------------------------|-------------------------|
//! | list      | `GET {base}/tools`              | `{"tools": [Tool, ..]}` |
//! | execute   | `POST {base}/tools/{name}/invoke` with `{"arguments": {..}}` | `{"output": value}` |
//! | health    | `GET {base}/health`             | any 2xx                 |
//!
//! Error responses may carry `{"error": {"kind": "..", "message": ".."}}`
//! or `{"error": ".."}`; the status code decides the error kind.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{Backend, BackendKind, BackendState, HealthStatus};
use crate::context::ExecContext;
use crate::tools::{Arguments, Tool};
use crate::types::{Error, Result};
use crate::validation::validate_tool_name;

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Settings of a `remote` backend.
#[derive(Debug, Clone, Serialize, Deserialize, schemars::JsonSchema)]
pub struct RemoteBackendConfig {
    /// Base URL of the tool server.
    pub base_url: String,

    /// Per-request deadline.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    #[schemars(with = "String")]
    pub timeout: Duration,

    /// Extra headers sent with every request.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Sent as `Authorization: Bearer <token>`.
    #[serde(default)]
    pub bearer_token: Option<String>,
}

impl RemoteBackendConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout: default_timeout(),
            headers: BTreeMap::new(),
            bearer_token: None,
        }
    }
}

#[derive(Debug)]
pub struct RemoteBackend {
    state: BackendState,
    base: Url,
    client: Client,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ToolListing {
    Wrapped { tools: Vec<Tool> },
    Bare(Vec<Tool>),
}

#[derive(Deserialize)]
struct InvokeResponse {
    #[serde(default)]
    output: Value,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Detailed { error: ErrorDetail },
    Plain { error: String },
}

#[derive(Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    kind: Option<String>,
    message: String,
}

impl RemoteBackend {
    pub fn new(name: impl Into<String>, config: RemoteBackendConfig) -> Result<Self> {
        let name = name.into();
        let base = Url::parse(&config.base_url).map_err(|e| {
            Error::config(format!(
                "backend '{}': invalid base_url '{}': {}",
                name, config.base_url, e
            ))
        })?;
        if base.cannot_be_a_base() {
            return Err(Error::config(format!(
                "backend '{}': base_url '{}' cannot be a base",
                name, config.base_url
            )));
        }

        let mut headers = HeaderMap::new();
        for (key, value) in &config.headers {
            let header = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| Error::config(format!("backend '{}': header '{}': {}", name, key, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::config(format!("backend '{}': header '{}': {}", name, key, e)))?;
            headers.insert(header, value);
        }
        if let Some(token) = &config.bearer_token {
            let mut value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| Error::config(format!("backend '{}': bearer token: {}", name, e)))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(config.timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::config(format!("backend '{}': http client: {}", name, e)))?;

        Ok(Self {
            state: BackendState::new(name),
            base,
            client,
            timeout: config.timeout,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::config(format!("base_url '{}' cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Request deadline: the context's timeout when set, else the configured one.
    fn deadline(&self, ctx: &ExecContext) -> Duration {
        ctx.resources().timeout.unwrap_or(self.timeout)
    }

    fn transport_error(&self, err: reqwest::Error, deadline: Duration) -> Error {
        if err.is_timeout() {
            Error::timeout(deadline, None)
        } else if err.is_connect() {
            Error::sandbox_unavailable(format!("remote backend '{}' unreachable: {}", self.name(), err))
        } else {
            Error::remote(format!("backend '{}': {}", self.name(), err))
        }
    }

    async fn send(&self, ctx: &ExecContext, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
        let deadline = self.deadline(ctx);
        let request = request
            .header("x-request-id", ctx.request_id().as_str())
            .timeout(deadline);
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::cancelled(format!("request to '{}' cancelled", self.name()))),
            sent = request.send() => sent.map_err(|e| self.transport_error(e, deadline)),
        }
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let body = response
            .bytes()
            .await
            .map_err(|e| self.transport_error(e, self.timeout))?;
        serde_json::from_slice(&body).map_err(|e| {
            Error::remote(format!("backend '{}' sent an invalid response: {}", self.name(), e))
        })
    }
}

/// Translate a non-success HTTP response into an error.
async fn status_error(tool: &str, response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let (kind, message) = match serde_json::from_str::<ErrorBody>(&body) {
        Ok(ErrorBody::Detailed { error }) => (error.kind, error.message),
        Ok(ErrorBody::Plain { error }) => (None, error),
        Err(_) if body.trim().is_empty() => (
            None,
            status.canonical_reason().unwrap_or("unknown status").to_string(),
        ),
        Err(_) => (None, body.trim().chars().take(512).collect()),
    };
    debug!(status = status.as_u16(), kind = ?kind, "remote error response");

    match status {
        StatusCode::NOT_FOUND => Error::tool_not_found(format!("{} ({})", tool, message)),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => Error::validation(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::unauthorized(message),
        StatusCode::SERVICE_UNAVAILABLE => Error::sandbox_unavailable(message),
        _ if kind.as_deref() == Some("EXECUTION_FAILED") => {
            Error::execution_failed(message, None, None)
        }
        _ => Error::remote(format!("HTTP {}: {}", status.as_u16(), message)),
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn name(&self) -> &str {
        self.state.name()
    }

    fn enabled(&self) -> bool {
        self.state.enabled()
    }

    fn set_enabled(&self, enabled: bool) {
        self.state.set_enabled(enabled)
    }

    async fn list_tools(&self, ctx: &ExecContext) -> Result<Vec<Tool>> {
        let url = self.endpoint(&["tools"])?;
        let response = self.send(ctx, self.client.get(url)).await?;
        if !response.status().is_success() {
            return Err(status_error("*", response).await);
        }
        let tools = match self.read_json::<ToolListing>(response).await? {
            ToolListing::Wrapped { tools } | ToolListing::Bare(tools) => tools,
        };

        Ok(tools
            .into_iter()
            .filter_map(|tool| match validate_tool_name(&tool.name) {
                Ok(()) => Some(tool.with_namespace(self.name()).with_timeout(self.timeout)),
                Err(e) => {
                    warn!(backend = %self.name(), error = %e, "skipping remote tool");
                    None
                }
            })
            .collect())
    }

    async fn execute(&self, ctx: &ExecContext, tool: &str, args: Arguments) -> Result<Value> {
        let url = self.endpoint(&["tools", tool, "invoke"])?;
        let qualified = format!("{}/{}", self.name(), tool);
        debug!(tool = %qualified, url = %url, "invoking remote tool");

        let body = json!({ "arguments": args, "request_id": ctx.request_id().as_str() });
        let response = self.send(ctx, self.client.post(url).json(&body)).await?;
        if !response.status().is_success() {
            return Err(status_error(&qualified, response).await);
        }
        let parsed: InvokeResponse = self.read_json(response).await?;
        Ok(parsed.output)
    }

    async fn health(&self, ctx: &ExecContext) -> Result<HealthStatus> {
        let started = Instant::now();
        let url = self.endpoint(&["health"])?;
        Ok(match self.send(ctx, self.client.get(url)).await {
            Ok(response) if response.status().is_success() => {
                HealthStatus::healthy(started.elapsed())
            }
            Ok(response) => HealthStatus::unhealthy(
                format!("health endpoint returned HTTP {}", response.status().as_u16()),
                started.elapsed(),
            ),
            Err(e) => HealthStatus::unhealthy(e.to_string(), started.elapsed()),
        })
    }

    async fn start(&self, _ctx: &ExecContext) -> Result<()> {
        debug!(backend = %self.name(), base = %self.base, "remote backend ready");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_keeps_base_path_and_encodes_tool() {
        let backend =
            RemoteBackend::new("api", RemoteBackendConfig::new("http://localhost:9000/v1/")).unwrap();
        let url = backend.endpoint(&["tools", "a b?", "invoke"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:9000/v1/tools/a%20b%3F/invoke");
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let err = RemoteBackend::new("api", RemoteBackendConfig::new("not a url")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_header_is_config_error() {
        let mut config = RemoteBackendConfig::new("http://localhost:1");
        config.headers.insert("bad header".into(), "x".into());
        assert!(matches!(RemoteBackend::new("api", config), Err(Error::Config(_))));
    }

    #[test]
    fn test_config_durations() {
        let config: RemoteBackendConfig =
            serde_json::from_value(json!({"base_url": "http://x", "timeout": "250ms"})).unwrap();
        assert_eq!(config.timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_unhealthy_and_unavailable() {
        // Port 9 (discard) on localhost is closed in test environments.
        let mut config = RemoteBackendConfig::new("http://127.0.0.1:9");
        config.timeout = Duration::from_secs(2);
        let backend = RemoteBackend::new("api", config).unwrap();
        let ctx = ExecContext::new();

        let status = backend.health(&ctx).await.unwrap();
        assert!(!status.healthy);

        let err = backend.execute(&ctx, "echo", Arguments::new()).await.unwrap_err();
        assert!(err.is_retryable(), "unexpected error: {err}");
    }
}
