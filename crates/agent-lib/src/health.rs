//! Component health for the VM agent
//!
//! The supervisor, the action pool, the manager API and every monitor
//! (`monitor:<name>`) report here. The agent's `/healthz` and `/readyz`
//! endpoints render the registry as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component, ordered from best to worst
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Still doing useful work, e.g. a monitor in error backoff
    Degraded,
    Unhealthy,
}

impl ComponentStatus {
    pub fn is_operational(&self) -> bool {
        *self != ComponentStatus::Unhealthy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            checked_at: Utc::now(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::new(ComponentStatus::Unhealthy, Some(message.into()))
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Worst status over all components
    pub status: ComponentStatus,
    pub components: BTreeMap<String, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Fixed component names
pub mod components {
    pub const SUPERVISOR: &str = "supervisor";
    pub const ACTION_POOL: &str = "action_pool";
    pub const MANAGER_API: &str = "manager_api";
}

const MONITOR_PREFIX: &str = "monitor:";

/// Health component name of one monitor
pub fn monitor_component(monitor: &str) -> String {
    format!("{MONITOR_PREFIX}{monitor}")
}

#[derive(Debug, Default)]
struct RegistryState {
    components: BTreeMap<String, ComponentHealth>,
    ready: bool,
}

/// Shared, cloneable view of component health
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as healthy
    pub async fn register(&self, name: &str) {
        self.set(name, ComponentHealth::healthy()).await;
    }

    pub async fn set(&self, name: &str, health: ComponentHealth) {
        self.state
            .write()
            .await
            .components
            .insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.set(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.set(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        self.state.write().await.ready = ready;
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.state.read().await.components.get(name).cloned()
    }

    /// Status of every registered monitor, keyed by monitor name
    pub async fn monitors(&self) -> BTreeMap<String, ComponentStatus> {
        self.state
            .read()
            .await
            .components
            .iter()
            .filter_map(|(name, health)| {
                name.strip_prefix(MONITOR_PREFIX)
                    .map(|monitor| (monitor.to_string(), health.status))
            })
            .collect()
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.state.read().await.components.clone();
        let status = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse { status, components }
    }

    /// Ready once startup finished and no component is unhealthy
    ///
    /// Degraded components (a monitor in backoff, a rejected API key) keep
    /// the agent ready.
    pub async fn readiness(&self) -> ReadinessResponse {
        let state = self.state.read().await;
        if !state.ready {
            return ReadinessResponse {
                ready: false,
                reason: Some("Agent not yet initialized".to_string()),
            };
        }

        let failed: Vec<&str> = state
            .components
            .iter()
            .filter(|(_, health)| !health.status.is_operational())
            .map(|(name, _)| name.as_str())
            .collect();

        if failed.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", failed.join(", "))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy_but_not_ready() {
        let registry = HealthRegistry::new();

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_overall_status_is_worst_component() {
        let registry = HealthRegistry::new();
        let monitor = monitor_component("security");
        registry.register(components::SUPERVISOR).await;
        registry.register(&monitor).await;

        registry
            .set_degraded(&monitor, "permission denied; long backoff 60s")
            .await;
        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert_eq!(
            health.components["monitor:security"].message.as_deref(),
            Some("permission denied; long backoff 60s")
        );

        registry.set_unhealthy(components::SUPERVISOR, "Stopped").await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_manager_api_degraded_keeps_ready() {
        let registry = HealthRegistry::new();
        registry.register(components::MANAGER_API).await;
        registry.set_ready(true).await;
        registry
            .set_degraded(components::MANAGER_API, "API key rejected (401)")
            .await;

        assert!(registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_readiness_names_unhealthy_components() {
        let registry = HealthRegistry::new();
        registry.register(components::SUPERVISOR).await;
        registry.register(components::ACTION_POOL).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry.set_unhealthy(components::ACTION_POOL, "Shut down").await;
        registry.set_unhealthy(components::SUPERVISOR, "Stopped").await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(
            readiness.reason.as_deref(),
            Some("Unhealthy: action_pool, supervisor")
        );
    }

    #[tokio::test]
    async fn test_monitors_lists_only_monitor_components() {
        let registry = HealthRegistry::new();
        registry.register(components::SUPERVISOR).await;
        registry.register(&monitor_component("auth")).await;
        registry
            .set_degraded(&monitor_component("syslog"), "not found")
            .await;

        let monitors = registry.monitors().await;
        assert_eq!(monitors.len(), 2);
        assert_eq!(monitors["auth"], ComponentStatus::Healthy);
        assert_eq!(monitors["syslog"], ComponentStatus::Degraded);
    }
}
