//! Tool access control.
//!
//! The pipeline's authorize stage calls an [`Authorizer`]. Policy evaluation
//! belongs to the embedding application; this module ships the trait, a
//! permissive [`AllowAll`] and a grant-table [`ToolAccessPolicy`].

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

use super::id::{parse_tool_id, SEPARATOR};
use super::tool::{Arguments, Tool};
use crate::context::ExecContext;
use crate::types::{Error, Result};

/// Caller name used when the context carries none.
pub const ANONYMOUS_CALLER: &str = "anonymous";

/// Decides whether a caller may invoke a tool.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// `Ok(())` to allow, `Error::Unauthorized` to refuse.
    async fn authorize(&self, ctx: &ExecContext, tool: &Tool, input: &Arguments) -> Result<()>;
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _ctx: &ExecContext, _tool: &Tool, _input: &Arguments) -> Result<()> {
        Ok(())
    }
}

/// Caller → tool grant table.
///
/// Grants are qualified tool ids (`backend/tool`), backend wildcards
/// (`backend/*`) or `*`. A caller without grants may use nothing.
#[derive(Debug, Default, Clone)]
pub struct ToolAccessPolicy {
    grants: HashMap<String, BTreeSet<String>>,
}

impl ToolAccessPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant a caller access to a tool id or wildcard pattern.
    pub fn grant(&mut self, caller: &str, pattern: &str) -> Result<()> {
        validate_pattern(pattern)?;
        self.grants
            .entry(caller.to_string())
            .or_default()
            .insert(pattern.to_string());
        Ok(())
    }

    /// Grant several patterns at once; stops at the first invalid pattern.
    pub fn grant_many<I, S>(&mut self, caller: &str, patterns: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for pattern in patterns {
            self.grant(caller, pattern.as_ref())?;
        }
        Ok(())
    }

    pub fn revoke(&mut self, caller: &str, pattern: &str) {
        if let Some(set) = self.grants.get_mut(caller) {
            set.remove(pattern);
        }
    }

    /// Whether `caller` may invoke the qualified tool id.
    pub fn check_access(&self, caller: &str, tool_id: &str) -> bool {
        let Some(patterns) = self.grants.get(caller) else {
            return false;
        };
        let backend = tool_id.split_once(SEPARATOR).map(|(b, _)| b);
        patterns.iter().any(|p| {
            p == "*"
                || p == tool_id
                || match (p.strip_suffix("/*"), backend) {
                    (Some(prefix), Some(backend)) => prefix == backend,
                    _ => false,
                }
        })
    }

    /// Grant patterns held by a caller, sorted.
    pub fn grants_for(&self, caller: &str) -> Vec<String> {
        self.grants
            .get(caller)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn clear_caller(&mut self, caller: &str) {
        self.grants.remove(caller);
    }
}

fn validate_pattern(pattern: &str) -> Result<()> {
    if pattern == "*" {
        return Ok(());
    }
    if let Some(backend) = pattern.strip_suffix("/*") {
        if backend.is_empty() || backend.contains(SEPARATOR) {
            return Err(Error::validation(format!("invalid grant pattern '{}'", pattern)));
        }
        return Ok(());
    }
    parse_tool_id(pattern).map(|_| ())
}

#[async_trait]
impl Authorizer for ToolAccessPolicy {
    async fn authorize(&self, ctx: &ExecContext, tool: &Tool, _input: &Arguments) -> Result<()> {
        let caller = ctx.caller().unwrap_or(ANONYMOUS_CALLER);
        let tool_id = tool.qualified_id();
        if self.check_access(caller, &tool_id) {
            Ok(())
        } else {
            Err(Error::unauthorized(format!(
                "caller '{}' may not invoke '{}'",
                caller, tool_id
            )))
        }
    }
}
