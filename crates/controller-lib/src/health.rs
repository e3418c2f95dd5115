//! Health tracking for the placement controller
//!
//! Each long-running loop (reconciler, reallocation watcher, device sweep)
//! reports every pass here. A single failed pass degrades the component;
//! a streak of [`UNHEALTHY_AFTER`] failures marks it unhealthy. Readiness
//! only looks at the components placement cannot work without.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failed passes before a component is unhealthy
pub const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn new(status: ComponentStatus, message: Option<String>, consecutive_failures: u32) -> Self {
        Self {
            status,
            message,
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::new(ComponentStatus::Healthy, None, 0)
    }

    /// Next state after a failed pass
    fn failed(previous: Option<&ComponentHealth>, message: String) -> Self {
        let streak = previous.map_or(0, |h| h.consecutive_failures) + 1;
        let status = if streak >= UNHEALTHY_AFTER {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        Self::new(status, Some(message), streak)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status across components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        components
            .values()
            .map(|h| h.status)
            .max_by_key(|s| match s {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

pub mod components {
    pub const RECONCILER: &str = "reconciler";
    pub const WATCHER: &str = "reallocation_watcher";
    pub const DEVICE_SWEEP: &str = "device_sweep";

    /// Components whose failure makes the controller unready
    pub const CRITICAL: &[&str] = &[RECONCILER, WATCHER];
}

#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, name: &str) {
        self.record_success(name).await;
    }

    /// A pass of `name` completed; clears any failure streak
    pub async fn record_success(&self, name: &str) {
        self.components
            .write()
            .await
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let next = ComponentHealth::failed(components.get(name), message.into());
        components.insert(name.to_string(), next);
    }

    /// Mark a component unhealthy regardless of its streak, e.g. when its
    /// loop has exited
    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let streak = components
            .get(name)
            .map_or(0, |h| h.consecutive_failures)
            .max(UNHEALTHY_AFTER);
        components.insert(
            name.to_string(),
            ComponentHealth::new(ComponentStatus::Unhealthy, Some(message.into()), streak),
        );
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Controller not yet running".to_string()),
            };
        }

        let components = self.components.read().await;
        let failing: Vec<&str> = components::CRITICAL
            .iter()
            .copied()
            .filter(|name| {
                components
                    .get(*name)
                    .is_some_and(|h| h.status == ComponentStatus::Unhealthy)
            })
            .collect();

        if failing.is_empty() {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        } else {
            ReadinessResponse {
                ready: false,
                reason: Some(format!("Unhealthy: {}", failing.join(", "))),
            }
        }
    }
}
