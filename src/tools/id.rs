//! Qualified tool ids: `<backend-name>/<tool-name>`.
//!
//! The sole routing key the aggregator understands. ASCII only, both segments
//! non-empty, exactly one separating `/`. No fuzzy matching.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Separator between backend and tool name.
pub const SEPARATOR: char = '/';

/// A parsed `backend/tool` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QualifiedToolId {
    pub backend: String,
    pub tool: String,
}

impl QualifiedToolId {
    pub fn new(backend: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            tool: tool.into(),
        }
    }
}

impl fmt::Display for QualifiedToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.backend, SEPARATOR, self.tool)
    }
}

impl FromStr for QualifiedToolId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_tool_id(s)
    }
}

/// Split a qualified id into backend and tool.
pub fn parse_tool_id(id: &str) -> Result<QualifiedToolId> {
    if !id.is_ascii() {
        return Err(Error::invalid_tool_id(format!(
            "'{}' is not ASCII",
            id.escape_debug()
        )));
    }
    let (backend, tool) = id.split_once(SEPARATOR).ok_or_else(|| {
        Error::invalid_tool_id(format!("'{}' has no '{}' separator", id, SEPARATOR))
    })?;
    if backend.is_empty() {
        return Err(Error::invalid_tool_id(format!("'{}' has an empty backend", id)));
    }
    if tool.is_empty() {
        return Err(Error::invalid_tool_id(format!("'{}' has an empty tool name", id)));
    }
    if tool.contains(SEPARATOR) {
        return Err(Error::invalid_tool_id(format!(
            "'{}' has more than one '{}' separator",
            id, SEPARATOR
        )));
    }
    Ok(QualifiedToolId::new(backend, tool))
}

/// Join backend and tool into a qualified id.
pub fn format_tool_id(backend: &str, tool: &str) -> String {
    format!("{}{}{}", backend, SEPARATOR, tool)
}

/// Whether `id` looks qualified (contains the separator).
pub fn is_qualified(id: &str) -> bool {
    id.contains(SEPARATOR)
}
