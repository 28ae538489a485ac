//! Per-instance load monitoring and backend autoscaling
//!
//! Every reconciled instance gets one [`LoadMonitor`] task, owned by the
//! [`MonitorSupervisor`]. A tick samples backend CPU and memory usage
//! against the workload's requests, scales the backend by one replica when
//! CPU crosses a threshold, folds in job figures and publishes the runtime
//! status. Only CPU drives scaling; memory is reported.

mod jobs;

pub use jobs::{JobMetricsSource, PrometheusJobSource, StaticJobSource};

use crate::cluster::ClusterApi;
use crate::error::ClusterError;
use crate::health::{ControlLoop, HealthRegistry};
use crate::models::MonitoringState;
use crate::observability::{OperatorMetrics, StructuredLogger};
use crate::quantity::{
    cpu_request_millis, cpu_usage_nanos, cpu_usage_percent, memory_request_mib, memory_usage_kib,
    memory_usage_percent,
};
use crate::resources::{pod_selector, Component, DerivedNames};
use crate::scale::{BackendScaler, ScaleDirection, ScaleOutcome};
use crate::status::StatusReporter;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

/// CPU percentage above which the backend gains a replica
pub const SCALE_UP_THRESHOLD: f64 = 80.0;
/// CPU percentage below which the backend loses a replica
pub const SCALE_DOWN_THRESHOLD: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Time between ticks; the first tick fires one interval after start
    pub interval: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up,
    Down,
    Hold,
}

impl ScaleDecision {
    pub fn from_cpu_percent(cpu_percent: f64) -> Self {
        if cpu_percent > SCALE_UP_THRESHOLD {
            ScaleDecision::Up
        } else if cpu_percent < SCALE_DOWN_THRESHOLD {
            ScaleDecision::Down
        } else {
            ScaleDecision::Hold
        }
    }

    pub fn direction(&self) -> Option<ScaleDirection> {
        match self {
            ScaleDecision::Up => Some(ScaleDirection::Up),
            ScaleDecision::Down => Some(ScaleDirection::Down),
            ScaleDecision::Hold => None,
        }
    }
}

/// Backend usage summed over all matching pods, against summed requests
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadSample {
    pub pods: usize,
    pub cpu_usage_nanos: f64,
    pub memory_usage_kib: f64,
    pub cpu_request_millis: f64,
    pub memory_request_mib: f64,
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub sample: LoadSample,
    pub decision: ScaleDecision,
    pub outcome: Option<ScaleOutcome>,
}

/// Monitoring state per instance name
pub type MonitorStates = Arc<DashMap<String, MonitoringState>>;

#[derive(Clone)]
pub struct LoadMonitor {
    cluster: Arc<dyn ClusterApi>,
    scaler: BackendScaler,
    reporter: StatusReporter,
    jobs: Arc<dyn JobMetricsSource>,
    states: MonitorStates,
    config: MonitorConfig,
    health: HealthRegistry,
    metrics: OperatorMetrics,
    logger: StructuredLogger,
}

impl LoadMonitor {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        jobs: Arc<dyn JobMetricsSource>,
        config: MonitorConfig,
        health: HealthRegistry,
    ) -> Self {
        let logger = StructuredLogger::new(cluster.namespace());
        Self {
            scaler: BackendScaler::new(cluster.clone()),
            reporter: StatusReporter::new(cluster.clone()),
            cluster,
            jobs,
            states: Arc::new(DashMap::new()),
            config,
            health,
            metrics: OperatorMetrics::new(),
            logger,
        }
    }

    pub fn states(&self) -> &MonitorStates {
        &self.states
    }

    /// Sum usage across backend pods and requests across backend replicas
    pub async fn sample(&self, name: &str) -> Result<LoadSample, ClusterError> {
        let pods = self
            .cluster
            .pod_usage(&pod_selector(name, Component::Backend))
            .await?;

        let (cpu_used, memory_used) = pods
            .iter()
            .flat_map(|p| p.containers.iter())
            .fold((0.0, 0.0), |(cpu, mem), c| {
                (cpu + cpu_usage_nanos(&c.cpu), mem + memory_usage_kib(&c.memory))
            });

        let deployment = self
            .cluster
            .get_deployment(&DerivedNames::new(name).backend)
            .await?;
        let spec = deployment.spec.unwrap_or_default();
        let replicas = spec.replicas.unwrap_or(1).max(0) as f64;
        let requests = spec
            .template
            .spec
            .and_then(|p| p.containers.into_iter().next())
            .and_then(|c| c.resources)
            .and_then(|r| r.requests)
            .unwrap_or_default();

        let cpu_request = requests
            .get("cpu")
            .map(|q| cpu_request_millis(&q.0))
            .unwrap_or(0.0)
            * replicas;
        let memory_request = requests
            .get("memory")
            .map(|q| memory_request_mib(&q.0))
            .unwrap_or(0.0)
            * replicas;

        Ok(LoadSample {
            pods: pods.len(),
            cpu_usage_nanos: cpu_used,
            memory_usage_kib: memory_used,
            cpu_request_millis: cpu_request,
            memory_request_mib: memory_request,
            cpu_percent: cpu_usage_percent(cpu_used, cpu_request),
            memory_percent: memory_usage_percent(memory_used, memory_request),
        })
    }

    /// One monitoring pass for `name`
    pub async fn tick(&self, name: &str) -> Result<TickReport, ClusterError> {
        let sample = self.sample(name).await?;
        self.metrics
            .set_usage(name, sample.cpu_percent, sample.memory_percent);
        debug!(
            instance = %name,
            cpu_percent = sample.cpu_percent,
            memory_percent = sample.memory_percent,
            pods = sample.pods,
            "Sampled backend load"
        );

        let decision = ScaleDecision::from_cpu_percent(sample.cpu_percent);
        let outcome = match decision.direction() {
            Some(direction) => Some(self.apply_scale(name, direction, sample.cpu_percent).await?),
            None => None,
        };

        let jobs = match self.jobs.job_metrics(name).await {
            Ok(jobs) => Some(jobs),
            Err(e) => {
                warn!(instance = %name, error = %e, "Job metrics unavailable, keeping previous figures");
                None
            }
        };

        let state = {
            let mut entry = self.states.entry(name.to_string()).or_default();
            if let Some(jobs) = jobs {
                entry.observe_jobs(jobs);
            }
            entry.last_cpu_percent = sample.cpu_percent;
            entry.last_memory_percent = sample.memory_percent;
            if matches!(outcome, Some(ScaleOutcome::Scaled { .. })) {
                entry.last_scale_time = Utc::now();
            }
            entry.value().clone()
        };

        self.reporter.publish_runtime_status(name, &state).await?;

        Ok(TickReport {
            sample,
            decision,
            outcome,
        })
    }

    async fn apply_scale(
        &self,
        name: &str,
        direction: ScaleDirection,
        cpu_percent: f64,
    ) -> Result<ScaleOutcome, ClusterError> {
        let outcome = self.scaler.scale(name, direction).await?;
        if let ScaleOutcome::Scaled { from, to } = outcome {
            self.metrics.inc_scale_action(direction.as_str());
            self.logger
                .log_backend_scaled(name, direction.as_str(), from, to, cpu_percent);
        }
        Ok(outcome)
    }

    /// Tick until shutdown; failed ticks are logged and retried next interval
    pub async fn run(self, name: String, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.interval;
        info!(instance = %name, interval_secs = period.as_secs(), "Starting load monitor");

        let mut ticker = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(&name).await {
                        Ok(_) => {
                            self.health
                                .record_instance_success(ControlLoop::Monitor, &name)
                                .await;
                        }
                        Err(e) => {
                            warn!(instance = %name, error = %e, "Monitor tick failed");
                            self.health
                                .record_instance_failure(ControlLoop::Monitor, &name, &e)
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!(instance = %name, "Stopping load monitor");
                    break;
                }
            }
        }
    }
}

struct MonitorTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// Owns the monitor task and state of every live instance
pub struct MonitorSupervisor {
    monitor: LoadMonitor,
    tasks: DashMap<String, MonitorTask>,
    metrics: OperatorMetrics,
}

impl MonitorSupervisor {
    pub fn new(monitor: LoadMonitor) -> Self {
        Self {
            monitor,
            tasks: DashMap::new(),
            metrics: OperatorMetrics::new(),
        }
    }

    pub fn monitor(&self) -> &LoadMonitor {
        &self.monitor
    }

    /// Start a monitor for `name` unless one is alive. Returns whether a
    /// new task was spawned.
    pub fn ensure_running(&self, name: &str) -> bool {
        self.monitor
            .states
            .entry(name.to_string())
            .or_default();

        let started = match self.tasks.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                if entry.get().handle.is_finished() {
                    entry.insert(self.spawn(name));
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(self.spawn(name));
                true
            }
        };

        self.metrics.set_monitored_instances(self.tasks.len());
        started
    }

    fn spawn(&self, name: &str) -> MonitorTask {
        let (shutdown, rx) = broadcast::channel(1);
        let handle = tokio::spawn(self.monitor.clone().run(name.to_string(), rx));
        MonitorTask { shutdown, handle }
    }

    /// Stop the monitor for `name`, wait for it and drop its state
    pub async fn stop(&self, name: &str) -> bool {
        let stopped = match self.tasks.remove(name) {
            Some((_, task)) => {
                let _ = task.shutdown.send(());
                if let Err(e) = task.handle.await {
                    warn!(instance = %name, error = %e, "Monitor task ended abnormally");
                }
                true
            }
            None => false,
        };

        self.monitor.states.remove(name);
        self.metrics.forget_instance(name);
        self.metrics.set_monitored_instances(self.tasks.len());
        stopped
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for name in names {
            self.stop(&name).await;
        }
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.tasks
            .get(name)
            .map(|t| !t.handle.is_finished())
            .unwrap_or(false)
    }

    pub fn running_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn state(&self, name: &str) -> Option<MonitoringState> {
        self.monitor.states.get(name).map(|s| s.value().clone())
    }
}

#[cfg(test)]
mod tests;
