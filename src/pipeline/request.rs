//! Tool invocation requests.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::runtime::{Resources, SecurityProfile};
use crate::tools::Arguments;

/// Per-request options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestOptions {
    /// Overrides the pipeline's default timeout.
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Ask for progress events. Only meaningful to the streaming executor.
    pub stream: bool,

    /// Resource overrides for this call. The timeout above wins over
    /// `resources.timeout`.
    #[serde(skip_serializing_if = "Resources::is_empty")]
    pub resources: Resources,

    /// Stricter isolation than the deployment default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<SecurityProfile>,

    /// Extra environment passed to sandboxed tools.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// One tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolRequest {
    /// Qualified (`backend/tool`) or bare tool id.
    pub tool: String,

    #[serde(default)]
    pub arguments: Arguments,

    /// Caller identity, checked by the authorizer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caller: Option<String>,

    #[serde(default)]
    pub options: RequestOptions,
}

impl ToolRequest {
    pub fn new(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            arguments: Arguments::new(),
            caller: None,
            options: RequestOptions::default(),
        }
    }

    pub fn with_arguments(mut self, arguments: Arguments) -> Self {
        self.arguments = arguments;
        self
    }

    pub fn with_argument(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.arguments.insert(key.into(), value);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.options.resources = resources;
        self
    }

    pub fn with_security_profile(mut self, profile: SecurityProfile) -> Self {
        self.options.security_profile = Some(profile);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    pub fn streaming(mut self) -> Self {
        self.options.stream = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_minimal_request() {
        let request: ToolRequest = serde_json::from_value(json!({"tool": "local/echo"})).unwrap();
        assert_eq!(request, ToolRequest::new("local/echo"));
    }

    #[test]
    fn test_options_use_humantime() {
        let request: ToolRequest = serde_json::from_value(json!({
            "tool": "echo",
            "arguments": {"message": "hi"},
            "options": {"timeout": "1500ms", "stream": true, "env": {"A": "1"}}
        }))
        .unwrap();
        assert_eq!(request.options.timeout, Some(Duration::from_millis(1500)));
        assert!(request.options.stream);
        assert_eq!(request.options.env["A"], "1");
        assert_eq!(request.arguments["message"], "hi");
    }
}
