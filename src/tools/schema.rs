//! Input schema validation.
//!
//! The pipeline does not interpret schemas itself; it calls a
//! [`SchemaValidator`]. The default implementation compiles the tool's JSON
//! Schema with the `jsonschema` crate and, before validating, fills top-level
//! `default` values for properties the caller omitted.

use serde_json::Value;
use std::fmt;

use super::tool::{Arguments, Tool};
use crate::types::{Error, Result};

/// Validates (and may normalize) tool input against the tool's schema.
pub trait SchemaValidator: Send + Sync + fmt::Debug {
    /// Returns the input to execute with, or `Error::Validation`.
    fn validate(&self, tool: &Tool, input: Arguments) -> Result<Arguments>;
}

/// JSON Schema validator backed by the `jsonschema` crate.
#[derive(Debug, Clone)]
pub struct JsonSchemaValidator {
    fill_defaults: bool,
    max_reported_errors: usize,
}

impl Default for JsonSchemaValidator {
    fn default() -> Self {
        Self {
            fill_defaults: true,
            max_reported_errors: 8,
        }
    }
}

impl JsonSchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Disable filling of schema defaults.
    pub fn without_defaults(mut self) -> Self {
        self.fill_defaults = false;
        self
    }
}

impl SchemaValidator for JsonSchemaValidator {
    fn validate(&self, tool: &Tool, mut input: Arguments) -> Result<Arguments> {
        if self.fill_defaults {
            fill_defaults(&tool.input_schema, &mut input);
        }

        let validator = jsonschema::validator_for(&tool.input_schema).map_err(|e| {
            Error::validation(format!(
                "tool '{}' publishes an invalid input schema: {}",
                tool.qualified_id(),
                e
            ))
        })?;

        let instance = Value::Object(input);
        let errors: Vec<String> = validator
            .iter_errors(&instance)
            .take(self.max_reported_errors)
            .map(|e| e.to_string())
            .collect();

        if !errors.is_empty() {
            return Err(Error::validation(format!(
                "input for '{}' does not match schema: {}",
                tool.qualified_id(),
                errors.join("; ")
            )));
        }

        match instance {
            Value::Object(map) => Ok(map),
            _ => Err(Error::internal("validated input is no longer an object")),
        }
    }
}

/// Accepts any input unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl SchemaValidator for AcceptAll {
    fn validate(&self, _tool: &Tool, input: Arguments) -> Result<Arguments> {
        Ok(input)
    }
}

/// Fill in default values for absent top-level properties.
pub fn fill_defaults(schema: &Value, input: &mut Arguments) {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return;
    };
    for (name, property) in properties {
        if input.contains_key(name) {
            continue;
        }
        if let Some(default) = property.get("default") {
            input.insert(name.clone(), default.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn search_tool() -> Tool {
        Tool::new("search", "Search the index")
            .with_namespace("local")
            .with_input_schema(json!({
                "type": "object",
                "properties": {
                    "query": { "type": "string" },
                    "max_results": { "type": "integer", "default": 10 }
                },
                "required": ["query"],
                "additionalProperties": false
            }))
    }

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("test arguments must be an object"),
        }
    }

    #[test]
    fn test_valid_input_gets_defaults() {
        let validated = JsonSchemaValidator::new()
            .validate(&search_tool(), args(json!({ "query": "rust" })))
            .unwrap();
        assert_eq!(validated["max_results"], 10);
        assert_eq!(validated["query"], "rust");
    }

    #[test]
    fn test_defaults_do_not_overwrite() {
        let validated = JsonSchemaValidator::new()
            .validate(
                &search_tool(),
                args(json!({ "query": "rust", "max_results": 3 })),
            )
            .unwrap();
        assert_eq!(validated["max_results"], 3);
    }

    #[test]
    fn test_missing_required_is_validation_error() {
        let err = JsonSchemaValidator::new()
            .validate(&search_tool(), args(json!({})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(err.to_string().contains("local/search"));
        assert!(err.to_string().contains("query"));
    }

    #[test]
    fn test_wrong_type_is_validation_error() {
        let err = JsonSchemaValidator::new()
            .validate(&search_tool(), args(json!({ "query": 42 })))
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_unknown_property_rejected() {
        let err = JsonSchemaValidator::new()
            .validate(
                &search_tool(),
                args(json!({ "query": "x", "bogus": true })),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_without_defaults() {
        let validated = JsonSchemaValidator::new()
            .without_defaults()
            .validate(&search_tool(), args(json!({ "query": "rust" })))
            .unwrap();
        assert!(!validated.contains_key("max_results"));
    }

    #[test]
    fn test_invalid_schema_reported() {
        let tool = Tool::new("broken", "").with_input_schema(json!({ "type": 12 }));
        let err = JsonSchemaValidator::new()
            .validate(&tool, Arguments::new())
            .unwrap_err();
        assert!(err.to_string().contains("invalid input schema"));
    }

    #[test]
    fn test_accept_all() {
        let input = args(json!({ "anything": [1, 2, 3] }));
        let out = AcceptAll.validate(&search_tool(), input.clone()).unwrap();
        assert_eq!(out, input);
    }
}
