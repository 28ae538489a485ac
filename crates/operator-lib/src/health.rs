//! Liveness and readiness state of the operator's control loops
//!
//! The watcher reports each attempt to open its stream. A failed open
//! degrades it and bumps its consecutive-failure count; after
//! [`WATCHER_UNHEALTHY_AFTER`] failures in a row it turns unhealthy and
//! liveness fails. The reconciler and the load monitor work per instance,
//! so they track failures per instance: the loop stays degraded while any
//! instance is failing, and never escalates since a restart would not fix
//! a broken instance.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Failed watch opens in a row before the watcher is unhealthy
pub const WATCHER_UNHEALTHY_AFTER: u32 = 6;

/// The long-running loops whose health is tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlLoop {
    Watcher,
    Reconciler,
    Monitor,
}

impl ControlLoop {
    pub const ALL: [ControlLoop; 3] = [
        ControlLoop::Watcher,
        ControlLoop::Reconciler,
        ControlLoop::Monitor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ControlLoop::Watcher => "watcher",
            ControlLoop::Reconciler => "reconciler",
            ControlLoop::Monitor => "monitor",
        }
    }

    /// Consecutive failures that make the loop unhealthy, if any do
    pub fn unhealthy_after(&self) -> Option<u32> {
        match self {
            ControlLoop::Watcher => Some(WATCHER_UNHEALTHY_AFTER),
            ControlLoop::Reconciler | ControlLoop::Monitor => None,
        }
    }
}

impl fmt::Display for ControlLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered from best to worst, so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Recent attempts failed; the loop retries on its own
    Degraded,
    /// Failing persistently; the process should be restarted
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// For per-instance loops, the worst run among failing instances
    pub consecutive_failures: u32,
    /// Failing instances and their consecutive failures
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failing_instances: BTreeMap<String, u32>,
    /// When the status last changed
    pub since: DateTime<Utc>,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            failing_instances: BTreeMap::new(),
            since: Utc::now(),
        }
    }
}

impl ComponentHealth {
    fn transition(&mut self, status: ComponentStatus, message: Option<String>) {
        if self.status != status {
            self.since = Utc::now();
        }
        self.status = status;
        self.message = message;
    }

    /// Recompute a per-instance loop after its failing set changed
    fn settle_instances(&mut self, message: Option<String>) {
        self.consecutive_failures = self.failing_instances.values().copied().max().unwrap_or(0);
        if self.failing_instances.is_empty() {
            self.transition(ComponentStatus::Healthy, None);
        } else {
            let message = message.or_else(|| self.message.clone());
            self.transition(ComponentStatus::Degraded, message);
        }
    }
}

/// Body of `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: BTreeMap<ControlLoop, ComponentHealth>,
}

/// Body of `/readyz`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_watch_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct HealthState {
    components: BTreeMap<ControlLoop, ComponentHealth>,
    first_watch_at: Option<DateTime<Utc>>,
}

/// Shared health state; clones report into the same registry
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    state: Arc<RwLock<HealthState>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    /// Registry with every component healthy and no watch opened yet
    pub fn new() -> Self {
        let components = ControlLoop::ALL
            .into_iter()
            .map(|c| (c, ComponentHealth::default()))
            .collect();
        Self {
            state: Arc::new(RwLock::new(HealthState {
                components,
                first_watch_at: None,
            })),
        }
    }

    pub async fn record_success(&self, component: ControlLoop) {
        let mut state = self.state.write().await;
        let health = state.components.entry(component).or_default();
        health.consecutive_failures = 0;
        health.transition(ComponentStatus::Healthy, None);
    }

    /// Count a failed attempt, escalating to unhealthy at the loop's
    /// threshold
    pub async fn record_failure(&self, component: ControlLoop, message: impl Into<String>) {
        let mut state = self.state.write().await;
        let health = state.components.entry(component).or_default();
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);

        let status = match component.unhealthy_after() {
            Some(limit) if health.consecutive_failures >= limit => ComponentStatus::Unhealthy,
            _ => ComponentStatus::Degraded,
        };
        health.transition(status, Some(message.into()));
    }

    pub async fn record_instance_success(&self, component: ControlLoop, instance: &str) {
        let mut state = self.state.write().await;
        let health = state.components.entry(component).or_default();
        if health.failing_instances.remove(instance).is_some() {
            health.settle_instances(None);
        }
    }

    pub async fn record_instance_failure(
        &self,
        component: ControlLoop,
        instance: &str,
        message: impl fmt::Display,
    ) {
        let mut state = self.state.write().await;
        let health = state.components.entry(component).or_default();
        *health
            .failing_instances
            .entry(instance.to_string())
            .or_insert(0) += 1;
        health.settle_instances(Some(format!("{}: {}", instance, message)));
    }

    /// Drop every per-instance record of a removed instance
    pub async fn forget_instance(&self, instance: &str) {
        let mut state = self.state.write().await;
        for health in state.components.values_mut() {
            if health.failing_instances.remove(instance).is_some() {
                health.settle_instances(None);
            }
        }
    }

    /// Record when the first watch opened; later calls are no-ops
    pub async fn mark_watch_opened(&self) {
        let mut state = self.state.write().await;
        state.first_watch_at.get_or_insert_with(Utc::now);
    }

    pub async fn component(&self, component: ControlLoop) -> Option<ComponentHealth> {
        self.state.read().await.components.get(&component).cloned()
    }

    pub async fn health(&self) -> HealthResponse {
        let state = self.state.read().await;
        let status = state
            .components
            .values()
            .map(|h| h.status)
            .max()
            .unwrap_or(ComponentStatus::Healthy);
        HealthResponse {
            status,
            components: state.components.clone(),
        }
    }

    /// Ready once the watcher has opened a stream, and while no loop is
    /// unhealthy
    pub async fn readiness(&self) -> ReadinessResponse {
        let health = self.health().await;
        let first_watch_at = self.state.read().await.first_watch_at;

        let reason = match (first_watch_at, health.status) {
            (None, _) => Some("Watcher has not opened its first stream".to_string()),
            (Some(_), ComponentStatus::Unhealthy) => Some("Control loop unhealthy".to_string()),
            _ => None,
        };

        ReadinessResponse {
            ready: reason.is_none(),
            reason,
            first_watch_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail_watcher(registry: &HealthRegistry, times: u32) {
        for _ in 0..times {
            registry.record_failure(ControlLoop::Watcher, "connection refused").await;
        }
    }

    #[tokio::test]
    async fn test_new_registry_tracks_every_loop() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert_eq!(health.components.len(), ControlLoop::ALL.len());
    }

    #[tokio::test]
    async fn test_failures_count_until_success() {
        let registry = HealthRegistry::new();
        registry.record_failure(ControlLoop::Watcher, "stream closed").await;
        registry.record_failure(ControlLoop::Watcher, "connection refused").await;

        let watcher = registry.component(ControlLoop::Watcher).await.unwrap();
        assert_eq!(watcher.status, ComponentStatus::Degraded);
        assert_eq!(watcher.consecutive_failures, 2);
        assert_eq!(watcher.message.as_deref(), Some("connection refused"));
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        registry.record_success(ControlLoop::Watcher).await;
        let watcher = registry.component(ControlLoop::Watcher).await.unwrap();
        assert_eq!(watcher.status, ComponentStatus::Healthy);
        assert_eq!(watcher.consecutive_failures, 0);
        assert!(watcher.message.is_none());
    }

    #[tokio::test]
    async fn test_watcher_escalates_at_threshold() {
        let registry = HealthRegistry::new();

        fail_watcher(&registry, WATCHER_UNHEALTHY_AFTER - 1).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);

        fail_watcher(&registry, 1).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        fail_watcher(&registry, 1000).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Unhealthy);

        registry.record_success(ControlLoop::Watcher).await;
        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_since_only_moves_on_status_change() {
        let registry = HealthRegistry::new();
        registry.record_failure(ControlLoop::Watcher, "try 1").await;
        let first = registry.component(ControlLoop::Watcher).await.unwrap().since;

        registry.record_failure(ControlLoop::Watcher, "try 2").await;
        let second = registry.component(ControlLoop::Watcher).await.unwrap().since;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_healthy_instance_does_not_mask_failing_one() {
        let registry = HealthRegistry::new();
        for _ in 0..3 {
            registry
                .record_instance_failure(ControlLoop::Monitor, "broken", "deployment not found")
                .await;
            registry.record_instance_success(ControlLoop::Monitor, "good").await;
        }

        let monitor = registry.component(ControlLoop::Monitor).await.unwrap();
        assert_eq!(monitor.status, ComponentStatus::Degraded);
        assert_eq!(monitor.consecutive_failures, 3);
        assert_eq!(monitor.failing_instances.get("broken"), Some(&3));
        assert_eq!(
            monitor.message.as_deref(),
            Some("broken: deployment not found")
        );
    }

    #[tokio::test]
    async fn test_instance_loop_recovers_when_all_instances_do() {
        let registry = HealthRegistry::new();
        registry
            .record_instance_failure(ControlLoop::Reconciler, "room1", "api error")
            .await;
        registry
            .record_instance_failure(ControlLoop::Reconciler, "room2", "api error")
            .await;

        registry.record_instance_success(ControlLoop::Reconciler, "room1").await;
        let reconciler = registry.component(ControlLoop::Reconciler).await.unwrap();
        assert_eq!(reconciler.status, ComponentStatus::Degraded);
        assert_eq!(reconciler.failing_instances.len(), 1);

        registry.record_instance_success(ControlLoop::Reconciler, "room2").await;
        let reconciler = registry.component(ControlLoop::Reconciler).await.unwrap();
        assert_eq!(reconciler.status, ComponentStatus::Healthy);
        assert_eq!(reconciler.consecutive_failures, 0);
        assert!(reconciler.message.is_none());
    }

    #[tokio::test]
    async fn test_instance_loops_never_escalate() {
        let registry = HealthRegistry::new();
        for _ in 0..100 {
            registry
                .record_instance_failure(ControlLoop::Monitor, "broken", "no backend")
                .await;
        }
        assert_eq!(registry.health().await.status, ComponentStatus::Degraded);
    }

    #[tokio::test]
    async fn test_forget_instance_clears_every_loop() {
        let registry = HealthRegistry::new();
        registry
            .record_instance_failure(ControlLoop::Reconciler, "room1", "api error")
            .await;
        registry
            .record_instance_failure(ControlLoop::Monitor, "room1", "no backend")
            .await;

        registry.forget_instance("room1").await;

        assert_eq!(registry.health().await.status, ComponentStatus::Healthy);
    }

    #[tokio::test]
    async fn test_readiness_waits_for_first_watch() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert!(readiness.first_watch_at.is_none());

        registry.mark_watch_opened().await;
        let opened = registry.readiness().await.first_watch_at;
        registry.mark_watch_opened().await;

        let readiness = registry.readiness().await;
        assert!(readiness.ready);
        assert_eq!(readiness.first_watch_at, opened);
    }

    #[tokio::test]
    async fn test_not_ready_when_watcher_keeps_failing() {
        let registry = HealthRegistry::new();
        registry.mark_watch_opened().await;
        fail_watcher(&registry, WATCHER_UNHEALTHY_AFTER).await;

        let readiness = registry.readiness().await;
        assert!(!readiness.ready);
        assert_eq!(readiness.reason.as_deref(), Some("Control loop unhealthy"));
    }

    #[test]
    fn test_components_serialize_as_lowercase_keys() {
        let response = HealthResponse {
            status: ComponentStatus::Healthy,
            components: BTreeMap::from([(ControlLoop::Watcher, ComponentHealth::default())]),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["components"]["watcher"]["status"], "healthy");
        assert_eq!(json["components"]["watcher"]["consecutiveFailures"], 0);
        assert!(json["components"]["watcher"].get("failingInstances").is_none());
    }
}
