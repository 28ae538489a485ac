//! Status subresource writes
//!
//! Both operations read the whole instance, modify its status and write it
//! back without a resource version. Concurrent writers for the same
//! instance can overwrite each other.

use crate::cluster::ClusterApi;
use crate::error::ClusterError;
use crate::models::{Condition, MonitoringState, Phase};
use crate::resources::DerivedNames;
use chrono::Utc;
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct StatusReporter {
    cluster: Arc<dyn ClusterApi>,
}

impl StatusReporter {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Set the phase and append a `Ready` condition, keeping the newest five
    pub async fn set_phase(
        &self,
        name: &str,
        phase: Phase,
        message: &str,
    ) -> Result<(), ClusterError> {
        let mut instance = self.cluster.get_instance(name).await?;
        let mut status = instance.status.take().unwrap_or_default();

        status.phase = phase;
        status.last_update_time = Some(Utc::now());
        status.push_condition(Condition::ready(phase, message));
        instance.status = Some(status);

        self.cluster.replace_instance_status(&instance).await?;
        debug!(instance = %name, phase = %phase, "Updated phase");
        Ok(())
    }

    /// Write ready replica counts and job counters onto the status
    pub async fn publish_runtime_status(
        &self,
        name: &str,
        state: &MonitoringState,
    ) -> Result<(), ClusterError> {
        let names = DerivedNames::new(name);
        let frontend_replicas = self.ready_replicas(&names.frontend).await?;
        let backend_replicas = self.ready_replicas(&names.backend).await?;

        let mut instance = self.cluster.get_instance(name).await?;
        let mut status = instance.status.take().unwrap_or_default();

        status.frontend_replicas = frontend_replicas;
        status.backend_replicas = backend_replicas;
        status.active_jobs = state.active_jobs;
        status.total_jobs = state.total_jobs;
        status.queue_length = state.queue_length;
        status.last_update_time = Some(Utc::now());
        instance.status = Some(status);

        self.cluster.replace_instance_status(&instance).await
    }

    /// Ready replicas of a workload; a missing workload has none
    async fn ready_replicas(&self, deployment: &str) -> Result<i32, ClusterError> {
        match self.cluster.get_deployment(deployment).await {
            Ok(d) => Ok(d.status.and_then(|s| s.ready_replicas).unwrap_or(0)),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{DerivedObject, InMemoryCluster};
    use crate::models::{CanvasInstance, InstanceSpec, MAX_CONDITIONS};
    use crate::resources::ResourceBuilder;

    fn setup() -> (Arc<InMemoryCluster>, StatusReporter) {
        let cluster = Arc::new(InMemoryCluster::new("canvas"));
        cluster.insert_instance(CanvasInstance::new("room1", InstanceSpec::default()));
        let reporter = StatusReporter::new(cluster.clone());
        (cluster, reporter)
    }

    #[tokio::test]
    async fn test_set_phase_appends_ready_condition() {
        let (cluster, reporter) = setup();

        reporter.set_phase("room1", Phase::Running, "All resources created").await.unwrap();

        let status = cluster.instance("room1").unwrap().status.unwrap();
        assert_eq!(status.phase, Phase::Running);
        let condition = status.last_condition().unwrap();
        assert_eq!(condition.type_, "Ready");
        assert!(condition.is_true());
        assert_eq!(condition.message, "All resources created");
    }

    #[tokio::test]
    async fn test_condition_history_is_fifo_capped() {
        let (cluster, reporter) = setup();

        for i in 0..8 {
            reporter
                .set_phase("room1", Phase::Pending, &format!("transition {}", i))
                .await
                .unwrap();
        }

        let status = cluster.instance("room1").unwrap().status.unwrap();
        assert_eq!(status.conditions.len(), MAX_CONDITIONS);
        assert_eq!(status.conditions[0].message, "transition 3");
        assert_eq!(status.conditions[4].message, "transition 7");
    }

    #[tokio::test]
    async fn test_set_phase_for_missing_instance_fails() {
        let (_, reporter) = setup();
        let err = reporter.set_phase("ghost", Phase::Running, "").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_publish_runtime_status() {
        let (cluster, reporter) = setup();
        let spec = InstanceSpec::default();
        let builder = ResourceBuilder::new("room1", "canvas", &spec);
        cluster
            .create(&DerivedObject::Deployment(builder.frontend_deployment()))
            .await
            .unwrap();
        cluster
            .create(&DerivedObject::Deployment(builder.backend_deployment()))
            .await
            .unwrap();
        cluster.set_ready_replicas("room1-frontend", 2);

        let state = MonitoringState {
            total_jobs: 7,
            active_jobs: 2,
            queue_length: 4,
            ..Default::default()
        };
        reporter.publish_runtime_status("room1", &state).await.unwrap();

        let status = cluster.instance("room1").unwrap().status.unwrap();
        assert_eq!(status.frontend_replicas, 2);
        assert_eq!(status.backend_replicas, 1);
        assert_eq!(status.total_jobs, 7);
        assert_eq!(status.active_jobs, 2);
        assert_eq!(status.queue_length, 4);
    }

    #[tokio::test]
    async fn test_publish_without_workloads_reports_zero() {
        let (cluster, reporter) = setup();
        reporter
            .publish_runtime_status("room1", &MonitoringState::default())
            .await
            .unwrap();

        let status = cluster.instance("room1").unwrap().status.unwrap();
        assert_eq!(status.frontend_replicas, 0);
        assert_eq!(status.backend_replicas, 0);
    }
}
