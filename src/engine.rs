//! Engine facade.
//!
//! [`ToolEngine`] wires the pieces together from a [`Config`]:
//!
//! ```text
//! Config ─▶ BackendFactory ─▶ BackendRegistry ─▶ ToolAggregator ─▶ Pipeline
//!                                                                  ├─▶ ChainExecutor
//!                                                                  └─▶ StreamingExecutor
//! ```
//!
//! Construction and startup are fail-fast; shutdown is best-effort.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use crate::aggregator::{ToolAggregator, ToolListing};
use crate::backend::{
    Backend, BackendFactory, BackendKind, BackendRegistry, HealthMonitor, HealthStatus,
};
use crate::chain::{Chain, ChainExecutor, ChainResult};
use crate::context::ExecContext;
use crate::pipeline::{Pipeline, ToolRequest, ToolResult};
use crate::streaming::{ExecutionStream, StreamingExecutor};
use crate::tools::{Authorizer, SchemaValidator, SystemHealthReport};
use crate::types::{BackendConfig, Config, RuntimeConfig, Result};

/// Builder for [`ToolEngine`].
pub struct ToolEngineBuilder {
    config: Config,
    factory: BackendFactory,
    extra: Vec<Arc<dyn Backend>>,
    authorizer: Option<Arc<dyn Authorizer>>,
    validator: Option<Arc<dyn SchemaValidator>>,
}

impl std::fmt::Debug for ToolEngineBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolEngineBuilder")
            .field("backends", &self.config.backends.keys().collect::<Vec<_>>())
            .field("extra", &self.extra.len())
            .finish_non_exhaustive()
    }
}

impl ToolEngineBuilder {
    pub fn new(config: Config) -> Self {
        let factory = BackendFactory::new(config.runtime.clone());
        Self {
            config,
            factory,
            extra: Vec::new(),
            authorizer: None,
            validator: None,
        }
    }

    /// Register an already-constructed backend next to the configured ones.
    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.extra.push(backend);
        self
    }

    /// Constructor for a backend kind the factory does not build natively
    /// (e.g. `mcp`).
    pub fn with_constructor<F>(mut self, kind: BackendKind, constructor: F) -> Self
    where
        F: Fn(&str, &BackendConfig, &RuntimeConfig) -> Result<Arc<dyn Backend>>
            + Send
            + Sync
            + 'static,
    {
        self.factory.register(kind, constructor);
        self
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SchemaValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Validate the configuration, build and register every backend.
    /// Nothing is started.
    pub fn build(self) -> Result<ToolEngine> {
        self.config.validate()?;

        let registry = Arc::new(BackendRegistry::new());
        for backend in self.factory.build_all(&self.config)? {
            registry.register(backend)?;
        }
        for backend in self.extra {
            registry.register(backend)?;
        }

        let aggregator = Arc::new(ToolAggregator::new(
            Arc::clone(&registry),
            self.config.aggregator.clone(),
        ));
        let mut pipeline = Pipeline::new(Arc::clone(&aggregator), self.config.pipeline.clone());
        if let Some(authorizer) = self.authorizer {
            pipeline = pipeline.with_authorizer(authorizer);
        }
        if let Some(validator) = self.validator {
            pipeline = pipeline.with_validator(validator);
        }
        let pipeline = Arc::new(pipeline);

        info!(backends = registry.len(), "engine_built");
        Ok(ToolEngine {
            chains: ChainExecutor::new(Arc::clone(&pipeline)),
            streaming: StreamingExecutor::new(Arc::clone(&pipeline), self.config.streaming.clone()),
            monitor: Mutex::new(None),
            config: self.config,
            registry,
            aggregator,
            pipeline,
        })
    }
}

/// The assembled tool execution core.
#[derive(Debug)]
pub struct ToolEngine {
    config: Config,
    registry: Arc<BackendRegistry>,
    aggregator: Arc<ToolAggregator>,
    pipeline: Arc<Pipeline>,
    chains: ChainExecutor,
    streaming: StreamingExecutor,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl ToolEngine {
    pub fn builder(config: Config) -> ToolEngineBuilder {
        ToolEngineBuilder::new(config)
    }

    pub fn from_config(config: Config) -> Result<Self> {
        ToolEngineBuilder::new(config).build()
    }

    /// Start every enabled backend in name order, stopping at the first
    /// failure, then the health monitor when configured. Already-started
    /// backends are not rolled back; call [`ToolEngine::shutdown`].
    pub async fn start(&self, ctx: &ExecContext) -> Result<()> {
        self.registry.start_all(ctx).await?;
        if self.config.monitor.enabled {
            let mut slot = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                let mut monitor =
                    HealthMonitor::new(Arc::clone(&self.registry), self.config.monitor.clone());
                monitor.start();
                *slot = Some(monitor);
            }
        }
        info!(enabled = self.registry.list_enabled().len(), "engine_started");
        Ok(())
    }

    /// Stop the monitor and every backend. Stop failures are collected into
    /// one `StopFailed` error after all backends were asked to stop.
    pub async fn shutdown(&self) -> Result<()> {
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut monitor) = monitor {
            monitor.stop();
        }
        let result = self.registry.stop_all().await;
        match &result {
            Ok(()) => info!("engine_stopped"),
            Err(e) => warn!(error = %e, "engine_stopped_with_errors"),
        }
        result
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    pub fn aggregator(&self) -> &Arc<ToolAggregator> {
        &self.aggregator
    }

    pub fn pipeline(&self) -> &Arc<Pipeline> {
        &self.pipeline
    }

    pub async fn list_tools(&self, ctx: &ExecContext) -> ToolListing {
        self.aggregator.list_all_tools(ctx).await
    }

    pub async fn call(&self, ctx: &ExecContext, request: ToolRequest) -> ToolResult {
        self.pipeline.execute(ctx, request).await
    }

    pub async fn run_chain(&self, ctx: &ExecContext, chain: &Chain) -> ChainResult {
        self.chains.execute(ctx, chain).await
    }

    pub async fn stream(&self, ctx: &ExecContext, request: ToolRequest) -> ExecutionStream {
        self.streaming.execute(ctx, request).await
    }

    /// Probe every enabled backend now.
    pub async fn check_health(&self, ctx: &ExecContext) -> BTreeMap<String, HealthStatus> {
        self.registry
            .check_health(ctx, self.config.monitor.probe_timeout)
            .await
    }

    /// Execution health of every tool run so far.
    pub fn tool_health(&self) -> SystemHealthReport {
        self.pipeline.system_health()
    }
}
