//! Background backend health probing.
//!
//! `HealthMonitor` periodically probes every enabled backend and records the
//! latest [`HealthStatus`](super::HealthStatus) in the registry, where the
//! CLI and callers read it without paying for a probe.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::BackendRegistry;
use crate::context::ExecContext;

/// Health monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Run the monitor alongside the engine.
    pub enabled: bool,

    /// Time between probe rounds (default: 30s).
    #[serde(with = "humantime_serde")]
    pub interval: Duration,

    /// Deadline for a single backend probe (default: 5s).
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    registry: Arc<BackendRegistry>,
    config: MonitorConfig,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl HealthMonitor {
    pub fn new(registry: Arc<BackendRegistry>, config: MonitorConfig) -> Self {
        Self {
            registry,
            config,
            stop_tx: None,
        }
    }

    /// Start probing in a background task. The first round runs immediately.
    pub fn start(&mut self) -> JoinHandle<()> {
        let registry = Arc::clone(&self.registry);
        let config = self.config.clone();
        let (stop_tx, mut stop_rx) = oneshot::channel();
        self.stop_tx = Some(stop_tx);

        tokio::spawn(async move {
            let mut ticker = interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let ctx = ExecContext::new();

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let results = registry.check_health(&ctx, config.probe_timeout).await;
                        let unhealthy = results.values().filter(|s| !s.healthy).count();
                        tracing::debug!(probed = results.len(), unhealthy, "health_round_completed");
                    }
                    _ = &mut stop_rx => {
                        ctx.cancel();
                        tracing::info!("health_monitor_stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Stop the probe loop. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.is_some()
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::builtin_backend;

    #[tokio::test]
    async fn test_monitor_records_health_and_stops() {
        let registry = Arc::new(BackendRegistry::new());
        registry
            .register(Arc::new(builtin_backend("local").unwrap()))
            .unwrap();

        let mut monitor = HealthMonitor::new(
            Arc::clone(&registry),
            MonitorConfig {
                enabled: true,
                interval: Duration::from_millis(10),
                probe_timeout: Duration::from_secs(1),
            },
        );
        let handle = monitor.start();
        assert!(monitor.is_running());

        tokio::time::timeout(Duration::from_secs(2), async {
            while registry.health("local").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(registry.health("local").unwrap().healthy);

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
