//! Tool metadata as published by a backend.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

use super::id::format_tool_id;

/// Arguments passed to a tool: a string-keyed map of arbitrary JSON values.
pub type Arguments = serde_json::Map<String, Value>;

/// Tool definition.
///
/// Immutable once published; owned by the backend named in `namespace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// Bare tool name, unique within its backend.
    pub name: String,

    /// Human-friendly display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Owning backend name. Empty until the aggregator tags the tool.
    #[serde(default)]
    pub namespace: String,

    #[serde(default)]
    pub description: String,

    /// JSON Schema for the tool input.
    #[serde(default = "default_input_schema")]
    pub input_schema: Value,

    /// JSON Schema for the tool output, if declared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,

    /// Wall-clock limit the owning backend enforces when a request sets
    /// none. `None` when the backend declares no limit of its own.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

fn default_input_schema() -> Value {
    json!({ "type": "object" })
}

impl Tool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            title: None,
            namespace: String::new(),
            description: description.into(),
            input_schema: default_input_schema(),
            output_schema: None,
            timeout: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Display name, falling back to the bare name.
    pub fn display_name(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// `namespace/name`, or the bare name when not yet namespaced.
    pub fn qualified_id(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format_tool_id(&self.namespace, &self.name)
        }
    }

    pub fn is_namespaced(&self) -> bool {
        !self.namespace.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_id() {
        let tool = Tool::new("echo", "Echo input");
        assert_eq!(tool.qualified_id(), "echo");
        assert!(!tool.is_namespaced());

        let tool = tool.with_namespace("local");
        assert_eq!(tool.qualified_id(), "local/echo");
    }

    #[test]
    fn test_display_name_fallback() {
        let tool = Tool::new("echo", "");
        assert_eq!(tool.display_name(), "echo");
        assert_eq!(tool.with_title("Echo").display_name(), "Echo");
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let tool: Tool = serde_json::from_value(json!({ "name": "ls" })).unwrap();
        assert_eq!(tool.input_schema, json!({ "type": "object" }));
        assert!(tool.namespace.is_empty());
        assert!(tool.output_schema.is_none());
        assert!(tool.timeout.is_none());
    }

    #[test]
    fn test_timeout_uses_humantime() {
        let tool: Tool = serde_json::from_value(json!({ "name": "ls", "timeout": "1500ms" })).unwrap();
        assert_eq!(tool.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(serde_json::to_value(&tool).unwrap()["timeout"], json!("1s 500ms"));
    }
}
