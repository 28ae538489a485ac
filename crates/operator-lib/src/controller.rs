//! Routes instance events to the reconciler or the cleanup manager

use crate::cleanup::{CleanupManager, CleanupReport};
use crate::cluster::{ClusterApi, InstanceEvent};
use crate::error::ReconcileError;
use crate::health::HealthRegistry;
use crate::monitor::{JobMetricsSource, LoadMonitor, MonitorConfig, MonitorSupervisor};
use crate::reconciler::Reconciler;
use kube::ResourceExt;
use std::sync::Arc;

/// Result of handling one event
#[derive(Debug)]
pub enum Dispatch {
    Reconciled(Result<(), ReconcileError>),
    CleanedUp(CleanupReport),
}

pub struct Controller {
    reconciler: Reconciler,
    cleanup: CleanupManager,
    monitors: Arc<MonitorSupervisor>,
    health: HealthRegistry,
}

impl Controller {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        jobs: Arc<dyn JobMetricsSource>,
        monitor_config: MonitorConfig,
        health: HealthRegistry,
    ) -> Self {
        let monitor = LoadMonitor::new(cluster.clone(), jobs, monitor_config, health.clone());
        let monitors = Arc::new(MonitorSupervisor::new(monitor));
        Self {
            reconciler: Reconciler::new(cluster.clone(), monitors.clone(), health.clone()),
            cleanup: CleanupManager::new(cluster, monitors.clone()),
            monitors,
            health,
        }
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn monitors(&self) -> &Arc<MonitorSupervisor> {
        &self.monitors
    }

    /// Handle one event to completion. Failures are already logged and
    /// recorded on the instance status.
    pub async fn handle(&self, event: InstanceEvent) -> Dispatch {
        match event {
            InstanceEvent::Upserted(instance) => {
                let name = instance.name_any();
                Dispatch::Reconciled(self.reconciler.reconcile(&name, &instance.spec).await)
            }
            InstanceEvent::Removed(instance) => {
                let name = instance.name_any();
                let report = self.cleanup.cleanup(&name).await;
                self.health.forget_instance(&name).await;
                Dispatch::CleanedUp(report)
            }
        }
    }

    /// Stop every load monitor
    pub async fn shutdown(&self) {
        self.monitors.stop_all().await;
    }
}
