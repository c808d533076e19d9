//! Tool aggregation and routing.
//!
//! Merges the catalogs of every enabled backend into one namespaced catalog
//! and routes qualified tool ids (`backend/tool`) to their owning backend.
//! The aggregator never interprets tool semantics.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinError, JoinSet};
use tracing::{debug, warn};

use crate::backend::{Backend, BackendRegistry};
use crate::context::ExecContext;
use crate::recovery::with_recovery_async;
use crate::tools::{self, Arguments, QualifiedToolId, Tool};
use crate::types::{AggregatorConfig, Error, ErrorKind, Result};

// =============================================================================
// Listing results
// =============================================================================

/// A backend whose listing failed while the aggregate listing succeeded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationWarning {
    /// Always `AGGREGATION_PARTIAL_FAILURE`.
    pub kind: ErrorKind,
    pub backend: String,
    /// Kind of the underlying failure.
    pub cause: ErrorKind,
    pub message: String,
}

impl AggregationWarning {
    fn new(backend: &str, err: &Error) -> Self {
        Self {
            kind: ErrorKind::AggregationPartialFailure,
            backend: backend.to_string(),
            cause: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Merged catalog plus per-backend failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ToolListing {
    /// Ordered by backend name; each backend's tools keep their own order.
    pub tools: Vec<Tool>,
    pub warnings: Vec<AggregationWarning>,
}

impl ToolListing {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }
}

// =============================================================================
// Aggregator
// =============================================================================

#[derive(Debug, Clone)]
pub struct ToolAggregator {
    registry: Arc<BackendRegistry>,
    config: AggregatorConfig,
}

impl ToolAggregator {
    pub fn new(registry: Arc<BackendRegistry>, config: AggregatorConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn parse_tool_id(id: &str) -> Result<QualifiedToolId> {
        tools::parse_tool_id(id)
    }

    pub fn format_tool_id(backend: &str, tool: &str) -> String {
        tools::format_tool_id(backend, tool)
    }

    /// Backend by name, failing for unknown or disabled backends.
    pub fn resolve_backend(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let backend = self
            .registry
            .get(name)
            .ok_or_else(|| Error::backend_not_found(name))?;
        if !backend.enabled() {
            return Err(Error::backend_disabled(name));
        }
        Ok(backend)
    }

    /// List every enabled backend concurrently with bounded parallelism.
    /// A failing or slow backend becomes a warning; the others still count.
    pub async fn list_all_tools(&self, ctx: &ExecContext) -> ToolListing {
        let backends = self.registry.list_enabled();
        let permits = Arc::new(Semaphore::new(self.config.max_parallelism.max(1)));
        let list_timeout = self.config.list_timeout;
        let mut join_set = JoinSet::new();
        let mut task_names: HashMap<task::Id, String> = HashMap::new();

        for backend in backends {
            let permits = Arc::clone(&permits);
            let ctx = ctx.child();
            let name = backend.name().to_string();
            let handle = join_set.spawn({
                let name = name.clone();
                async move {
                    let result = match permits.acquire_owned().await {
                        Ok(_permit) => list_one(&ctx, backend.as_ref(), list_timeout).await,
                        Err(_) => Err(Error::internal("listing semaphore closed")),
                    };
                    (name, result)
                }
            });
            task_names.insert(handle.id(), name);
        }

        let mut per_backend: BTreeMap<String, Vec<Tool>> = BTreeMap::new();
        let mut warnings = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(tools))) => {
                    debug!(backend = %name, count = tools.len(), "backend listed");
                    per_backend.insert(name, tools);
                }
                Ok((name, Err(e))) => {
                    warn!(backend = %name, error = %e, "backend_listing_failed");
                    warnings.push(AggregationWarning::new(&name, &e));
                }
                Err(e) => warnings.push(join_failure(&task_names, e)),
            }
        }
        warnings.sort_by(|a, b| a.backend.cmp(&b.backend));

        ToolListing {
            tools: per_backend.into_values().flatten().collect(),
            warnings,
        }
    }

    /// Tools of one enabled backend, namespaced.
    pub async fn list_backend_tools(&self, ctx: &ExecContext, backend: &str) -> Result<Vec<Tool>> {
        let backend = self.resolve_backend(backend)?;
        list_one(ctx, backend.as_ref(), self.config.list_timeout).await
    }

    /// Resolve a qualified id to its tool definition.
    pub async fn find_tool(&self, ctx: &ExecContext, qualified_id: &str) -> Result<Tool> {
        let id = tools::parse_tool_id(qualified_id)?;
        self.list_backend_tools(ctx, &id.backend)
            .await?
            .into_iter()
            .find(|t| t.name == id.tool)
            .ok_or_else(|| Error::tool_not_found(qualified_id))
    }

    /// Qualify a tool id. Qualified ids pass through; a bare name must match
    /// exactly one tool across enabled backends.
    pub async fn qualify(&self, ctx: &ExecContext, id: &str) -> Result<QualifiedToolId> {
        if id.contains(tools::id::SEPARATOR) {
            return tools::parse_tool_id(id);
        }
        if id.is_empty() {
            return Err(Error::invalid_tool_id("tool id is empty"));
        }

        let listing = self.list_all_tools(ctx).await;
        let mut matches: Vec<QualifiedToolId> = listing
            .tools
            .iter()
            .filter(|t| t.name == id)
            .map(|t| QualifiedToolId::new(&t.namespace, &t.name))
            .collect();
        match matches.len() {
            1 => Ok(matches.remove(0)),
            0 => Err(Error::tool_not_found(id)),
            _ => Err(Error::invalid_tool_id(format!(
                "'{}' is ambiguous; qualify it as one of: {}",
                id,
                matches
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            ))),
        }
    }

    /// Route an execution to the owning backend.
    pub async fn execute(
        &self,
        ctx: &ExecContext,
        qualified_id: &str,
        args: Arguments,
    ) -> Result<Value> {
        let id = tools::parse_tool_id(qualified_id)?;
        let backend = self.resolve_backend(&id.backend)?;
        debug!(backend = %id.backend, tool = %id.tool, "routing execution");
        backend.execute(ctx, &id.tool, args).await
    }

    /// Whether executing this tool streams progress events.
    pub fn supports_progress(&self, id: &QualifiedToolId) -> bool {
        self.registry
            .get(&id.backend)
            .and_then(|backend| {
                backend
                    .progress_capability()
                    .map(|cap| cap.supports_progress(&id.tool))
            })
            .unwrap_or(false)
    }
}

/// Warning for a listing task that ended without reporting its result.
fn join_failure(task_names: &HashMap<task::Id, String>, err: JoinError) -> AggregationWarning {
    let backend = task_names.get(&err.id()).map_or("<unknown>", String::as_str);
    warn!(backend = %backend, error = %err, "listing_task_failed");
    AggregationWarning::new(backend, &Error::internal(format!("listing task failed: {}", err)))
}

async fn list_one(ctx: &ExecContext, backend: &dyn Backend, limit: Duration) -> Result<Vec<Tool>> {
    let name = backend.name();
    let listing = async {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(Error::cancelled(format!("listing '{}' cancelled", name))),
            listed = tokio::time::timeout(limit, backend.list_tools(ctx)) => match listed {
                Ok(result) => result,
                Err(_) => Err(Error::remote(format!(
                    "listing '{}' timed out after {}ms",
                    name,
                    limit.as_millis()
                ))),
            },
        }
    };
    let tools = with_recovery_async(listing, "list_tools").await?;

    Ok(tools
        .into_iter()
        .map(|tool| {
            if tool.namespace != name {
                if tool.is_namespaced() {
                    debug!(backend = %name, claimed = %tool.namespace, tool = %tool.name, "re-namespacing tool");
                }
                tool.with_namespace(name)
            } else {
                tool
            }
        })
        .collect())
}
