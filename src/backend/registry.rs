//! Backend registry.
//!
//! Owns the live backend instances. The map is the only broadly shared
//! mutable state in the executor and sits behind a read-mostly lock; no lock
//! is held across an await, so lifecycle hooks run on cloned handles.

use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{Backend, BackendKind, HealthStatus};
use crate::context::ExecContext;
use crate::types::{BackendFailure, Error, Result};
use crate::validation::validate_backend_name;

/// Registered backends keyed (and therefore sorted) by name.
#[derive(Debug, Default)]
pub struct BackendRegistry {
    backends: RwLock<BTreeMap<String, Arc<dyn Backend>>>,
    health: RwLock<BTreeMap<String, HealthStatus>>,
    started: RwLock<BTreeSet<String>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, Arc<dyn Backend>>> {
        self.backends.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, Arc<dyn Backend>>> {
        self.backends.write().unwrap_or_else(|e| e.into_inner())
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Register a backend under its own name.
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let name = backend.name().to_string();
        validate_backend_name(&name)?;

        let mut backends = self.write();
        if backends.contains_key(&name) {
            return Err(Error::AlreadyRegistered(format!("backend '{}'", name)));
        }
        info!(backend = %name, kind = %backend.kind(), enabled = backend.enabled(), "backend_registered");
        backends.insert(name, backend);
        Ok(())
    }

    /// Remove a backend and stop it. Stop errors are logged, not returned.
    pub async fn unregister(&self, name: &str) -> Result<Arc<dyn Backend>> {
        let removed = self
            .write()
            .remove(name)
            .ok_or_else(|| Error::backend_not_found(name))?;
        self.health
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name);
        self.mark_started(name, false);

        if let Err(e) = removed.stop().await {
            warn!(backend = %name, error = %e, "backend_stop_failed_on_unregister");
        }
        info!(backend = %name, "backend_unregistered");
        Ok(removed)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.read().get(name).cloned()
    }

    /// All backends, name-sorted.
    pub fn list(&self) -> Vec<Arc<dyn Backend>> {
        self.read().values().cloned().collect()
    }

    /// Enabled backends, name-sorted.
    pub fn list_enabled(&self) -> Vec<Arc<dyn Backend>> {
        self.read()
            .values()
            .filter(|b| b.enabled())
            .cloned()
            .collect()
    }

    pub fn list_by_kind(&self, kind: &BackendKind) -> Vec<Arc<dyn Backend>> {
        self.read()
            .values()
            .filter(|b| &b.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    // =========================================================================
    // Enable / disable
    // =========================================================================

    /// Route to the backend again. Does not call `start`: a backend that was
    /// disabled during [`start_all`](Self::start_all) is never started by
    /// this; use [`enable_and_start`](Self::enable_and_start) for that.
    pub fn enable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, true)
    }

    /// Start the backend if it has not been started yet, then enable it.
    /// On a start failure the backend stays disabled.
    pub async fn enable_and_start(&self, ctx: &ExecContext, name: &str) -> Result<()> {
        let backend = self.get(name).ok_or_else(|| Error::backend_not_found(name))?;
        if !self.is_started(name) {
            backend.start(ctx).await.map_err(|e| {
                warn!(backend = %name, error = %e, "backend_start_failed");
                Error::StartFailed {
                    backend: name.to_string(),
                    reason: e.to_string(),
                }
            })?;
            self.mark_started(name, true);
        }
        self.set_enabled(name, true)
    }

    /// Disabled backends stay registered but contribute no tools and reject
    /// executions.
    pub fn disable(&self, name: &str) -> Result<()> {
        self.set_enabled(name, false)
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let backend = self.get(name).ok_or_else(|| Error::backend_not_found(name))?;
        backend.set_enabled(enabled);
        info!(backend = %name, enabled, "backend_enabled_changed");
        Ok(())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start enabled backends in name order. The first failure aborts and
    /// names the backend; backends started before it are left running.
    pub async fn start_all(&self, ctx: &ExecContext) -> Result<()> {
        for backend in self.list_enabled() {
            let name = backend.name().to_string();
            debug!(backend = %name, "starting backend");
            if let Err(e) = backend.start(ctx).await {
                warn!(backend = %name, error = %e, "backend_start_failed");
                return Err(Error::StartFailed {
                    backend: name,
                    reason: e.to_string(),
                });
            }
            self.mark_started(&name, true);
        }
        info!(count = self.len(), "backends_started");
        Ok(())
    }

    /// Stop every backend. Never stops early; failures are collected into
    /// one `StopFailed`.
    pub async fn stop_all(&self) -> Result<()> {
        let mut failures = Vec::new();
        for backend in self.list() {
            self.mark_started(backend.name(), false);
            if let Err(e) = backend.stop().await {
                warn!(backend = %backend.name(), error = %e, "backend_stop_failed");
                failures.push(BackendFailure {
                    backend: backend.name().to_string(),
                    message: e.to_string(),
                });
            }
        }
        if failures.is_empty() {
            info!("backends_stopped");
            Ok(())
        } else {
            Err(Error::StopFailed(failures))
        }
    }

    /// Whether `start` has succeeded since the last `stop_all`.
    pub fn is_started(&self, name: &str) -> bool {
        self.started
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name)
    }

    fn mark_started(&self, name: &str, started: bool) {
        let mut set = self.started.write().unwrap_or_else(|e| e.into_inner());
        if started {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    // =========================================================================
    // Health
    // =========================================================================

    pub fn record_health(&self, name: &str, status: HealthStatus) {
        self.health
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), status);
    }

    /// Latest recorded status for one backend.
    pub fn health(&self, name: &str) -> Option<HealthStatus> {
        self.health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn health_snapshot(&self) -> BTreeMap<String, HealthStatus> {
        self.health
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Probe every enabled backend concurrently, record and return the
    /// results. A probe error or timeout counts as unhealthy.
    pub async fn check_health(
        &self,
        ctx: &ExecContext,
        probe_timeout: Duration,
    ) -> BTreeMap<String, HealthStatus> {
        let probes = self.list_enabled().into_iter().map(|backend| {
            let ctx = ctx.child();
            async move {
                let started = Instant::now();
                let status =
                    match tokio::time::timeout(probe_timeout, backend.health(&ctx)).await {
                        Ok(Ok(status)) => status,
                        Ok(Err(e)) => HealthStatus::unhealthy(e.to_string(), started.elapsed()),
                        Err(_) => HealthStatus::unhealthy(
                            format!("health probe timed out after {}ms", probe_timeout.as_millis()),
                            started.elapsed(),
                        ),
                    };
                (backend.name().to_string(), status)
            }
        });

        let results: BTreeMap<String, HealthStatus> = join_all(probes).await.into_iter().collect();
        for (name, status) in &results {
            if !status.healthy {
                warn!(backend = %name, message = %status.message, "backend_unhealthy");
            }
            self.record_health(name, status.clone());
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendState;
    use crate::tools::{Arguments, Tool};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug)]
    struct StubBackend {
        state: BackendState,
        kind: BackendKind,
        fail_start: bool,
        fail_stop: bool,
        healthy: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        log: Option<Arc<Mutex<Vec<String>>>>,
    }

    impl StubBackend {
        fn new(name: &str) -> Self {
            Self {
                state: BackendState::new(name),
                kind: BackendKind::Local,
                fail_start: false,
                fail_stop: false,
                healthy: true,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                log: None,
            }
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        fn kind(&self) -> BackendKind {
            self.kind.clone()
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
        async fn list_tools(&self, _ctx: &ExecContext) -> Result<Vec<Tool>> {
            Ok(vec![])
        }
        async fn execute(&self, _ctx: &ExecContext, tool: &str, _args: Arguments) -> Result<Value> {
            Err(Error::tool_not_found(tool))
        }
        async fn health(&self, _ctx: &ExecContext) -> Result<HealthStatus> {
            if self.healthy {
                Ok(HealthStatus::healthy(Duration::ZERO))
            } else {
                Err(Error::remote("connection refused"))
            }
        }
        async fn start(&self, _ctx: &ExecContext) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(log) = &self.log {
                log.lock().unwrap().push(self.name().to_string());
            }
            if self.fail_start {
                return Err(Error::sandbox_unavailable("docker daemon not running"));
            }
            Ok(())
        }
        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            if self.fail_stop {
                return Err(Error::internal("stuck"));
            }
            Ok(())
        }
    }

    #[test]
    fn test_register_twice_fails_and_count_unchanged() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(StubBackend::new("local"))).unwrap();
        let err = registry
            .register(Arc::new(StubBackend::new("local")))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_is_name_sorted_and_stable() {
        let registry = BackendRegistry::new();
        for name in ["zeta", "alpha", "mid"] {
            registry.register(Arc::new(StubBackend::new(name))).unwrap();
        }
        let first: Vec<String> = registry.list().iter().map(|b| b.name().to_string()).collect();
        let second: Vec<String> = registry.list().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(first, vec!["alpha", "mid", "zeta"]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_list_enabled_and_by_kind() {
        let registry = BackendRegistry::new();
        let mut docker = StubBackend::new("box");
        docker.kind = BackendKind::Docker;
        registry.register(Arc::new(docker)).unwrap();
        registry.register(Arc::new(StubBackend::new("local"))).unwrap();
        registry.disable("local").unwrap();

        let enabled: Vec<_> = registry.list_enabled().iter().map(|b| b.name().to_string()).collect();
        assert_eq!(enabled, vec!["box"]);
        assert_eq!(registry.list_by_kind(&BackendKind::Docker).len(), 1);
        assert_eq!(registry.list_by_kind(&BackendKind::Remote).len(), 0);

        registry.enable("local").unwrap();
        assert_eq!(registry.list_enabled().len(), 2);
        assert!(matches!(registry.disable("ghost"), Err(Error::BackendNotFound(_))));
    }

    #[test]
    fn test_register_rejects_invalid_name() {
        let registry = BackendRegistry::new();
        let err = registry.register(Arc::new(StubBackend::new("a/b"))).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_start_all_is_fail_fast_in_name_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = BackendRegistry::new();
        for (name, fail) in [("a", false), ("b", true), ("c", false)] {
            let mut stub = StubBackend::new(name);
            stub.fail_start = fail;
            stub.log = Some(Arc::clone(&log));
            registry.register(Arc::new(stub)).unwrap();
        }

        let err = registry.start_all(&ExecContext::new()).await.unwrap_err();
        match err {
            Error::StartFailed { backend, reason } => {
                assert_eq!(backend, "b");
                assert!(reason.contains("docker daemon"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_start_all_skips_disabled() {
        let registry = BackendRegistry::new();
        let mut stub = StubBackend::new("off");
        stub.fail_start = true;
        registry.register(Arc::new(stub)).unwrap();
        registry.disable("off").unwrap();
        registry.start_all(&ExecContext::new()).await.unwrap();
    }

    #[tokio::test]
    async fn test_enable_and_start_starts_backend_skipped_by_start_all() {
        let registry = BackendRegistry::new();
        let stub = Arc::new(StubBackend::new("late"));
        registry.register(stub.clone()).unwrap();
        registry.disable("late").unwrap();
        let ctx = ExecContext::new();

        registry.start_all(&ctx).await.unwrap();
        assert_eq!(stub.starts.load(Ordering::SeqCst), 0);
        assert!(!registry.is_started("late"));

        registry.enable_and_start(&ctx, "late").await.unwrap();
        assert!(stub.enabled());
        assert!(registry.is_started("late"));
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);

        // Toggling an already started backend does not start it again.
        registry.disable("late").unwrap();
        registry.enable_and_start(&ctx, "late").await.unwrap();
        assert_eq!(stub.starts.load(Ordering::SeqCst), 1);

        registry.stop_all().await.unwrap();
        assert!(!registry.is_started("late"));
    }

    #[tokio::test]
    async fn test_enable_and_start_failure_leaves_backend_disabled() {
        let registry = BackendRegistry::new();
        let mut stub = StubBackend::new("broken");
        stub.fail_start = true;
        let stub = Arc::new(stub);
        registry.register(stub.clone()).unwrap();
        registry.disable("broken").unwrap();

        let err = registry
            .enable_and_start(&ExecContext::new(), "broken")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StartFailed { ref backend, .. } if backend == "broken"));
        assert!(!stub.enabled());
        assert!(registry.list_enabled().is_empty());

        assert!(matches!(
            registry.enable_and_start(&ExecContext::new(), "ghost").await,
            Err(Error::BackendNotFound(_))
        ));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_stop_all_collects_every_failure() {
        let registry = BackendRegistry::new();
        let a = Arc::new({
            let mut s = StubBackend::new("a");
            s.fail_stop = true;
            s
        });
        let b = Arc::new(StubBackend::new("b"));
        let c = Arc::new({
            let mut s = StubBackend::new("c");
            s.fail_stop = true;
            s
        });
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();
        registry.register(c.clone()).unwrap();

        let err = registry.stop_all().await.unwrap_err();
        match err {
            Error::StopFailed(failures) => {
                let names: Vec<_> = failures.iter().map(|f| f.backend.as_str()).collect();
                assert_eq!(names, vec!["a", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(b.stops.load(Ordering::SeqCst), 1);
        assert_eq!(c.stops.load(Ordering::SeqCst), 1);
        assert!(logs_contain("backend_stop_failed"));
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_unregister_stops_and_swallows_stop_error() {
        let registry = BackendRegistry::new();
        let stub = Arc::new({
            let mut s = StubBackend::new("flaky");
            s.fail_stop = true;
            s
        });
        registry.register(stub.clone()).unwrap();
        registry.unregister("flaky").await.unwrap();
        assert!(registry.is_empty());
        assert_eq!(stub.stops.load(Ordering::SeqCst), 1);
        assert!(logs_contain("backend_stop_failed_on_unregister"));
        assert!(matches!(
            registry.unregister("flaky").await,
            Err(Error::BackendNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_check_health_records_status() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(StubBackend::new("ok"))).unwrap();
        let mut sick = StubBackend::new("sick");
        sick.healthy = false;
        registry.register(Arc::new(sick)).unwrap();

        let results = registry
            .check_health(&ExecContext::new(), Duration::from_secs(1))
            .await;
        assert!(results["ok"].healthy);
        assert!(!results["sick"].healthy);
        assert!(results["sick"].message.contains("connection refused"));
        assert!(!registry.health("sick").unwrap().healthy);
        assert_eq!(registry.health_snapshot().len(), 2);
    }
}
