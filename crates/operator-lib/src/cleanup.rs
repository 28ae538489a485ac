//! Teardown of an instance's derived resources
//!
//! Deletion is best effort and exhaustive: a missing object counts as
//! removed and any other failure is recorded without stopping the rest.

use crate::cluster::{ClusterApi, ResourceKind};
use crate::error::ClusterError;
use crate::monitor::MonitorSupervisor;
use crate::observability::{OperatorMetrics, StructuredLogger};
use crate::resources::DerivedNames;
use std::sync::Arc;
use tracing::{debug, warn};

/// What happened to each derived resource during cleanup
#[derive(Debug, Default)]
pub struct CleanupReport {
    pub deleted: Vec<(ResourceKind, String)>,
    /// Already absent
    pub absent: Vec<(ResourceKind, String)>,
    pub failed: Vec<(ResourceKind, String, ClusterError)>,
    pub monitor_stopped: bool,
}

impl CleanupReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct CleanupManager {
    cluster: Arc<dyn ClusterApi>,
    monitors: Arc<MonitorSupervisor>,
    metrics: OperatorMetrics,
    logger: StructuredLogger,
}

impl CleanupManager {
    pub fn new(cluster: Arc<dyn ClusterApi>, monitors: Arc<MonitorSupervisor>) -> Self {
        let logger = StructuredLogger::new(cluster.namespace());
        Self {
            cluster,
            monitors,
            metrics: OperatorMetrics::new(),
            logger,
        }
    }

    /// Stop the instance's monitor, then delete every derived resource
    pub async fn cleanup(&self, name: &str) -> CleanupReport {
        let mut report = CleanupReport {
            monitor_stopped: self.monitors.stop(name).await,
            ..Default::default()
        };

        for (kind, resource) in DerivedNames::new(name).all() {
            match self.cluster.delete(kind, &resource).await {
                Ok(()) => {
                    debug!(instance = %name, kind = %kind, resource = %resource, "Deleted");
                    report.deleted.push((kind, resource));
                }
                Err(e) if e.is_not_found() => report.absent.push((kind, resource)),
                Err(e) => {
                    warn!(
                        instance = %name,
                        kind = %kind,
                        resource = %resource,
                        error = %e,
                        "Failed to delete derived resource"
                    );
                    self.metrics.inc_cleanup_failures();
                    report.failed.push((kind, resource, e));
                }
            }
        }

        self.logger.log_instance_cleaned_up(
            name,
            report.deleted.len(),
            report.absent.len(),
            report.failed.len(),
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DerivedObject, FailOn, InMemoryCluster};
    use crate::health::HealthRegistry;
    use crate::models::InstanceSpec;
    use crate::monitor::{LoadMonitor, MonitorConfig, StaticJobSource};
    use crate::resources::ResourceBuilder;

    fn manager(cluster: Arc<InMemoryCluster>) -> (CleanupManager, Arc<MonitorSupervisor>) {
        let monitor = LoadMonitor::new(
            cluster.clone(),
            Arc::new(StaticJobSource::default()),
            MonitorConfig::default(),
            HealthRegistry::new(),
        );
        let monitors = Arc::new(MonitorSupervisor::new(monitor));
        (CleanupManager::new(cluster, monitors.clone()), monitors)
    }

    #[tokio::test]
    async fn test_cleanup_of_missing_resources_is_clean() {
        let cluster = Arc::new(InMemoryCluster::new("canvas"));
        let (manager, _) = manager(cluster);

        let report = manager.cleanup("room1").await;
        assert!(report.is_complete());
        assert!(report.deleted.is_empty());
        assert_eq!(report.absent.len(), 8);
        assert!(!report.monitor_stopped);
    }

    #[tokio::test]
    async fn test_cleanup_continues_past_failures() {
        let cluster = Arc::new(InMemoryCluster::new("canvas"));
        let spec = InstanceSpec::default();
        let builder = ResourceBuilder::new("room1", "canvas", &spec);
        cluster
            .create(&DerivedObject::ConfigMap(builder.config_map()))
            .await
            .unwrap();
        cluster
            .create(&DerivedObject::Ingress(builder.ingress()))
            .await
            .unwrap();
        cluster.fail_on(
            FailOn::Delete,
            ResourceKind::ConfigMap,
            "room1-config",
            ClusterError::Api {
                code: 403,
                message: "forbidden".to_string(),
            },
        );
        let (manager, _) = manager(cluster.clone());

        let report = manager.cleanup("room1").await;
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.deleted, vec![(ResourceKind::Ingress, "room1-ingress".to_string())]);
        assert_eq!(report.absent.len(), 6);
        assert!(!cluster.contains(ResourceKind::Ingress, "room1-ingress"));
    }

    #[tokio::test]
    async fn test_cleanup_stops_monitor() {
        let cluster = Arc::new(InMemoryCluster::new("canvas"));
        let (manager, monitors) = manager(cluster);
        monitors.ensure_running("room1");

        let report = manager.cleanup("room1").await;
        assert!(report.monitor_stopped);
        assert!(!monitors.is_running("room1"));
        assert!(monitors.state("room1").is_none());
    }
}
