//! Request validation utilities.

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate a backend instance name.
///
/// Names become the first half of qualified tool ids, so they must be
/// non-empty printable ASCII without whitespace or `/`.
pub fn validate_backend_name(name: &str) -> Result<()> {
    validate_non_empty(name, "backend name")?;
    if let Some(bad) = name
        .chars()
        .find(|c| !c.is_ascii_graphic() || *c == '/')
    {
        return Err(Error::validation(format!(
            "backend name '{}' contains invalid character {:?}",
            name, bad
        )));
    }
    Ok(())
}

/// Validate a tool name published by a backend.
pub fn validate_tool_name(name: &str) -> Result<()> {
    validate_non_empty(name, "tool name")?;
    if let Some(bad) = name
        .chars()
        .find(|c| !c.is_ascii_graphic() || *c == '/')
    {
        return Err(Error::validation(format!(
            "tool name '{}' contains invalid character {:?}",
            name, bad
        )));
    }
    Ok(())
}
