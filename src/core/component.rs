//! Component lifecycle contract
//!
//! Every long-lived part of the server implements [`Component`]: it is
//! initialized in dependency order at startup, polled for status by the
//! health monitor, and cleaned up in reverse order at shutdown.

use crate::core::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Health of a single component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Status snapshot reported by a component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub health: ComponentHealth,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ComponentStatus {
    pub fn healthy() -> Self {
        Self {
            health: ComponentHealth::Healthy,
            detail: None,
        }
    }

    pub fn degraded<S: Into<String>>(detail: S) -> Self {
        Self {
            health: ComponentHealth::Degraded,
            detail: Some(detail.into()),
        }
    }

    pub fn unhealthy<S: Into<String>>(detail: S) -> Self {
        Self {
            health: ComponentHealth::Unhealthy,
            detail: Some(detail.into()),
        }
    }
}

/// Lifecycle contract implemented by every server component
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable component name used in health and log output
    fn name(&self) -> &'static str;

    /// Bring the component up; called once, in dependency order
    async fn initialize(&self) -> Result<()>;

    /// Best-effort teardown; called in reverse init order
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Current status; must be cheap enough to poll on a timer
    async fn status(&self) -> ComponentStatus;

    /// Whether the aggregate health is `unhealthy` (rather than `degraded`)
    /// when this component is down
    fn is_critical(&self) -> bool {
        true
    }
}
