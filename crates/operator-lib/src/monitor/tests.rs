use super::*;
use crate::cluster::{ContainerUsage, DerivedObject, InMemoryCluster, PodUsage};
use crate::models::{BackendSpec, CanvasInstance, InstanceSpec, JobMetrics, ResourceSpec};
use crate::resources::ResourceBuilder;
use async_trait::async_trait;
use std::collections::BTreeMap;

struct FailingJobSource;

#[async_trait]
impl JobMetricsSource for FailingJobSource {
    async fn job_metrics(&self, _instance: &str) -> anyhow::Result<JobMetrics> {
        anyhow::bail!("collector offline")
    }
}

fn spec(replicas: i32) -> InstanceSpec {
    InstanceSpec {
        backend: BackendSpec {
            replicas: Some(replicas),
            resources: Some(ResourceSpec {
                requests: BTreeMap::from([
                    ("cpu".to_string(), "1".to_string()),
                    ("memory".to_string(), "2Gi".to_string()),
                ]),
                limits: BTreeMap::new(),
            }),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Cluster with one instance, its backend workload, and `pods` backend pods
/// each using `cpu` and 1GiB of memory
async fn cluster_with_load(replicas: i32, pods: usize, cpu: &str) -> Arc<InMemoryCluster> {
    let cluster = Arc::new(InMemoryCluster::new("canvas"));
    let spec = spec(replicas);
    cluster.insert_instance(CanvasInstance::new("room1", spec.clone()));

    let deployment = ResourceBuilder::new("room1", "canvas", &spec).backend_deployment();
    cluster
        .create(&DerivedObject::Deployment(deployment))
        .await
        .unwrap();

    let usage = (0..pods)
        .map(|i| PodUsage {
            pod_name: format!("room1-backend-{}", i),
            containers: vec![ContainerUsage {
                name: "backend".to_string(),
                cpu: cpu.to_string(),
                memory: "1048576Ki".to_string(),
            }],
        })
        .collect();
    cluster.set_pod_usage(&pod_selector("room1", Component::Backend), usage);
    cluster
}

fn monitor(cluster: Arc<InMemoryCluster>, jobs: Arc<dyn JobMetricsSource>) -> LoadMonitor {
    LoadMonitor::new(cluster, jobs, MonitorConfig::default(), HealthRegistry::new())
}

fn backend_replicas(cluster: &InMemoryCluster) -> i32 {
    cluster
        .deployment("room1-backend")
        .and_then(|d| d.spec)
        .and_then(|s| s.replicas)
        .unwrap()
}

#[test]
fn test_decision_thresholds() {
    assert_eq!(ScaleDecision::from_cpu_percent(81.0), ScaleDecision::Up);
    assert_eq!(ScaleDecision::from_cpu_percent(80.0), ScaleDecision::Hold);
    assert_eq!(ScaleDecision::from_cpu_percent(50.0), ScaleDecision::Hold);
    assert_eq!(ScaleDecision::from_cpu_percent(20.0), ScaleDecision::Hold);
    assert_eq!(ScaleDecision::from_cpu_percent(19.0), ScaleDecision::Down);
}

#[tokio::test]
async fn test_sample_sums_pods_and_replicas() {
    let cluster = cluster_with_load(2, 2, "810000000n").await;
    let monitor = monitor(cluster, Arc::new(StaticJobSource::default()));

    let sample = monitor.sample("room1").await.unwrap();
    assert_eq!(sample.pods, 2);
    assert_eq!(sample.cpu_request_millis, 2000.0);
    assert_eq!(sample.memory_request_mib, 4096.0);
    assert!((sample.cpu_percent - 81.0).abs() < 1e-9);
    assert_eq!(sample.memory_percent, 50.0);
}

#[tokio::test]
async fn test_tick_scales_up_under_load() {
    let cluster = cluster_with_load(2, 2, "810000000n").await;
    let monitor = monitor(cluster.clone(), Arc::new(StaticJobSource::default()));

    let report = monitor.tick("room1").await.unwrap();
    assert_eq!(report.decision, ScaleDecision::Up);
    assert_eq!(report.outcome, Some(ScaleOutcome::Scaled { from: 2, to: 3 }));
    assert_eq!(backend_replicas(&cluster), 3);
}

#[tokio::test]
async fn test_tick_at_max_replicas_is_noop() {
    let cluster = cluster_with_load(5, 5, "900000000n").await;
    let monitor = monitor(cluster.clone(), Arc::new(StaticJobSource::default()));

    let report = monitor.tick("room1").await.unwrap();
    assert_eq!(report.decision, ScaleDecision::Up);
    assert_eq!(report.outcome, Some(ScaleOutcome::Unchanged { replicas: 5 }));
    assert_eq!(backend_replicas(&cluster), 5);
}

#[tokio::test]
async fn test_tick_scale_down_at_min_is_noop() {
    let cluster = cluster_with_load(1, 1, "190000000n").await;
    let monitor = monitor(cluster.clone(), Arc::new(StaticJobSource::default()));

    let report = monitor.tick("room1").await.unwrap();
    assert_eq!(report.decision, ScaleDecision::Down);
    assert_eq!(report.outcome, Some(ScaleOutcome::Unchanged { replicas: 1 }));
    assert_eq!(backend_replicas(&cluster), 1);
}

#[tokio::test]
async fn test_memory_pressure_alone_does_not_scale() {
    // 50% CPU, memory far above requests
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    cluster.set_pod_usage(
        &pod_selector("room1", Component::Backend),
        vec![PodUsage {
            pod_name: "room1-backend-0".to_string(),
            containers: vec![ContainerUsage {
                name: "backend".to_string(),
                cpu: "1".to_string(),
                memory: "8Gi".to_string(),
            }],
        }],
    );
    let monitor = monitor(cluster.clone(), Arc::new(StaticJobSource::default()));

    let report = monitor.tick("room1").await.unwrap();
    assert!(report.sample.memory_percent > 100.0);
    assert_eq!(report.decision, ScaleDecision::Hold);
    assert_eq!(report.outcome, None);
}

#[tokio::test]
async fn test_tick_publishes_job_counters() {
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    let jobs = StaticJobSource::new(JobMetrics {
        active_jobs: 3,
        queue_length: 6,
    });
    let monitor = monitor(cluster.clone(), Arc::new(jobs));

    monitor.tick("room1").await.unwrap();

    let state = monitor.states().get("room1").map(|s| s.value().clone()).unwrap();
    assert_eq!(state.active_jobs, 3);
    assert_eq!(state.total_jobs, 3);

    let status = cluster.instance("room1").unwrap().status.unwrap();
    assert_eq!(status.active_jobs, 3);
    assert_eq!(status.queue_length, 6);
    assert_eq!(status.backend_replicas, 2);
}

#[tokio::test]
async fn test_job_source_failure_keeps_previous_figures() {
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    let monitor = monitor(cluster.clone(), Arc::new(FailingJobSource));
    monitor.states().insert(
        "room1".to_string(),
        MonitoringState {
            active_jobs: 4,
            total_jobs: 9,
            ..Default::default()
        },
    );

    assert!(monitor.tick("room1").await.is_ok());

    let state = monitor.states().get("room1").map(|s| s.value().clone()).unwrap();
    assert_eq!(state.active_jobs, 4);
    assert_eq!(state.total_jobs, 9);
}

#[tokio::test]
async fn test_tick_fails_without_backend() {
    let cluster = Arc::new(InMemoryCluster::new("canvas"));
    let monitor = monitor(cluster, Arc::new(StaticJobSource::default()));

    let err = monitor.tick("room1").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_supervisor_starts_once() {
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    let supervisor = MonitorSupervisor::new(monitor(cluster, Arc::new(StaticJobSource::default())));

    assert!(supervisor.ensure_running("room1"));
    assert!(!supervisor.ensure_running("room1"));
    assert!(supervisor.is_running("room1"));
    assert_eq!(supervisor.running_count(), 1);
    assert!(supervisor.state("room1").is_some());

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_supervisor_stop_removes_state() {
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    let supervisor = MonitorSupervisor::new(monitor(cluster, Arc::new(StaticJobSource::default())));

    supervisor.ensure_running("room1");
    assert!(supervisor.stop("room1").await);

    assert!(!supervisor.is_running("room1"));
    assert!(supervisor.state("room1").is_none());
    assert_eq!(supervisor.running_count(), 0);
    // Stopping twice is harmless
    assert!(!supervisor.stop("room1").await);
}

#[tokio::test]
async fn test_running_monitor_ticks_on_interval() {
    let cluster = cluster_with_load(2, 2, "500000000n").await;
    let jobs = StaticJobSource::new(JobMetrics {
        active_jobs: 2,
        queue_length: 0,
    });
    let monitor = LoadMonitor::new(
        cluster.clone(),
        Arc::new(jobs),
        MonitorConfig {
            interval: Duration::from_millis(20),
        },
        HealthRegistry::new(),
    );
    let supervisor = MonitorSupervisor::new(monitor);

    supervisor.ensure_running("room1");
    tokio::time::sleep(Duration::from_millis(150)).await;
    supervisor.stop("room1").await;

    let status = cluster.instance("room1").unwrap().status.unwrap();
    assert_eq!(status.active_jobs, 2);
    assert_eq!(status.total_jobs, 2);
    assert_eq!(backend_replicas(&cluster), 2);
}
