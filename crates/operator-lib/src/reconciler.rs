//! Drives the derived resource set of one instance to match its spec
//!
//! Steps run strictly in order and each one is idempotent. Every object is
//! upserted: create, and on `AlreadyExists` replace with the full desired
//! object. A failing step stops the pass and marks the instance `Failed`;
//! steps that already succeeded are left in place.

use crate::cluster::{ClusterApi, DerivedObject};
use crate::error::{ClusterError, ReconcileError, ReconcileStep};
use crate::health::{ControlLoop, HealthRegistry};
use crate::models::{InstanceSpec, Phase};
use crate::monitor::MonitorSupervisor;
use crate::observability::{OperatorMetrics, StructuredLogger};
use crate::resources::ResourceBuilder;
use crate::scale::{BackendScaler, ScaleDirection, ScaleOutcome};
use crate::status::StatusReporter;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    reporter: StatusReporter,
    scaler: BackendScaler,
    monitors: Arc<MonitorSupervisor>,
    health: HealthRegistry,
    metrics: OperatorMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        monitors: Arc<MonitorSupervisor>,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(cluster.namespace());
        Self {
            reporter: StatusReporter::new(cluster.clone()),
            scaler: BackendScaler::new(cluster.clone()),
            cluster,
            monitors,
            health,
            metrics: OperatorMetrics::new(),
            logger,
        }
    }

    pub async fn reconcile(&self, name: &str, spec: &InstanceSpec) -> Result<(), ReconcileError> {
        let start = Instant::now();
        info!(instance = %name, "Reconciling instance");

        self.report_phase(name, Phase::Pending, "Reconciling derived resources")
            .await;

        match self.apply(name, spec).await {
            Ok(()) => {
                self.report_phase(name, Phase::Running, "All resources created successfully")
                    .await;
                self.metrics.observe_reconcile(start.elapsed(), true);
                self.logger.log_reconcile_completed(name, start.elapsed());
                self.health
                    .record_instance_success(ControlLoop::Reconciler, name)
                    .await;
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                self.report_phase(name, Phase::Failed, &message).await;
                self.metrics.observe_reconcile(start.elapsed(), false);
                self.logger
                    .log_reconcile_failed(name, &e.step.to_string(), &e.source.to_string());
                self.health
                    .record_instance_failure(ControlLoop::Reconciler, name, &message)
                    .await;
                Err(e)
            }
        }
    }

    /// Steps 2-9 of a pass
    async fn apply(&self, name: &str, spec: &InstanceSpec) -> Result<(), ReconcileError> {
        let builder = ResourceBuilder::new(name, self.cluster.namespace(), spec);

        self.upsert(DerivedObject::ConfigMap(builder.config_map()))
            .await
            .map_err(|e| ReconcileError::new(ReconcileStep::ConfigMap, e))?;

        match builder.secret() {
            Some(secret) => self
                .upsert(DerivedObject::Secret(secret))
                .await
                .map_err(|e| ReconcileError::new(ReconcileStep::Secret, e))?,
            None => debug!(instance = %name, "No credentials, skipping secret"),
        }

        self.ensure_claim(DerivedObject::PersistentVolumeClaim(builder.storage_claim()))
            .await
            .map_err(|e| ReconcileError::new(ReconcileStep::Storage, e))?;

        self.upsert(DerivedObject::Deployment(builder.frontend_deployment()))
            .await
            .map_err(|e| ReconcileError::new(ReconcileStep::Frontend, e))?;

        self.upsert(DerivedObject::Deployment(builder.backend_deployment()))
            .await
            .map_err(|e| ReconcileError::new(ReconcileStep::Backend, e))?;

        for service in [builder.frontend_service(), builder.backend_service()] {
            self.upsert(DerivedObject::Service(service))
                .await
                .map_err(|e| ReconcileError::new(ReconcileStep::Services, e))?;
        }

        self.upsert(DerivedObject::Ingress(builder.ingress()))
            .await
            .map_err(|e| ReconcileError::new(ReconcileStep::Ingress, e))?;

        if self.monitors.ensure_running(name) {
            debug!(instance = %name, "Started load monitor");
        }

        Ok(())
    }

    async fn upsert(&self, object: DerivedObject) -> Result<(), ClusterError> {
        match self.cluster.create(&object).await {
            Ok(()) => {
                debug!(kind = %object.kind(), resource = %object.name(), "Created");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                self.cluster.replace(&object).await?;
                debug!(kind = %object.kind(), resource = %object.name(), "Replaced");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Claims are immutable once bound; an existing claim is kept as is
    async fn ensure_claim(&self, object: DerivedObject) -> Result<(), ClusterError> {
        match self.cluster.create(&object).await {
            Err(e) if e.is_already_exists() => {
                debug!(resource = %object.name(), "Storage claim already exists");
                Ok(())
            }
            other => other,
        }
    }

    /// Status writes never fail a pass
    async fn report_phase(&self, name: &str, phase: Phase, message: &str) {
        if let Err(e) = self.reporter.set_phase(name, phase, message).await {
            warn!(instance = %name, phase = %phase, error = %e, "Failed to update status");
        }
    }

    /// Add or remove one backend replica within `[1, 5]`
    pub async fn scale_backend(
        &self,
        name: &str,
        direction: ScaleDirection,
    ) -> Result<ScaleOutcome, ClusterError> {
        self.scaler.scale(name, direction).await
    }
}
