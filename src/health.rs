//! Health monitor component
//!
//! Polls every registered component's status on a timer and on demand.
//! Aggregate health is `healthy` when everything is up, `degraded` while
//! only non-critical components (vector index, doc crawler, cache) are
//! down, and `unhealthy` once a critical component fails.

use crate::core::component::{Component, ComponentHealth, ComponentStatus};
use crate::core::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Aggregated view served by `/health`
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: ComponentHealth,
    pub components: BTreeMap<String, ComponentStatus>,
}

/// Periodic status poller over the component registry
pub struct HealthMonitor {
    components: Vec<Arc<dyn Component>>,
    statuses: DashMap<&'static str, ComponentStatus>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl HealthMonitor {
    pub fn new(components: Vec<Arc<dyn Component>>, poll_interval: Duration) -> Self {
        Self {
            components,
            statuses: DashMap::new(),
            poll_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Poll every component once and refresh the cached statuses
    pub async fn poll_once(&self) {
        for component in &self.components {
            let status = component.status().await;
            self.statuses.insert(component.name(), status);
        }
    }

    /// Fresh on-demand snapshot (used by `/health`)
    pub async fn snapshot(&self) -> HealthSnapshot {
        self.poll_once().await;
        self.aggregate()
    }

    /// Aggregate from the cached statuses without re-polling
    pub fn aggregate(&self) -> HealthSnapshot {
        let mut aggregate = ComponentHealth::Healthy;
        let mut components = BTreeMap::new();

        for component in &self.components {
            let status = self
                .statuses
                .get(component.name())
                .map(|s| s.clone())
                .unwrap_or_else(|| ComponentStatus::unhealthy("not yet polled"));

            match status.health {
                ComponentHealth::Healthy => {}
                ComponentHealth::Degraded => {
                    if aggregate == ComponentHealth::Healthy {
                        aggregate = ComponentHealth::Degraded;
                    }
                }
                ComponentHealth::Unhealthy => {
                    if component.is_critical() {
                        aggregate = ComponentHealth::Unhealthy;
                    } else if aggregate == ComponentHealth::Healthy {
                        aggregate = ComponentHealth::Degraded;
                    }
                }
            }
            components.insert(component.name().to_string(), status);
        }

        HealthSnapshot {
            status: aggregate,
            components,
        }
    }
}

#[async_trait]
impl Component for HealthMonitor {
    fn name(&self) -> &'static str {
        "health-monitor"
    }

    async fn initialize(&self) -> Result<()> {
        self.poll_once().await;
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        self.shutdown.cancel();
        Ok(())
    }

    async fn status(&self) -> ComponentStatus {
        ComponentStatus::healthy()
    }

    fn is_critical(&self) -> bool {
        false
    }
}

/// Spawn the background polling loop; separate from `initialize` so the
/// monitor can be polled synchronously in tests without a running timer
pub fn spawn_poll_loop(monitor: Arc<HealthMonitor>) -> tokio::task::JoinHandle<()> {
    let shutdown = monitor.shutdown.clone();
    let interval = monitor.poll_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => monitor.poll_once().await,
                _ = shutdown.cancelled() => break,
            }
        }
    })
}
