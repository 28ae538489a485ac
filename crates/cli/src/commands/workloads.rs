//! Deployment and pod commands

use crate::output::{color_phase, format_age, print_success, print_table, print_warning, OutputFormat};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use operator_lib::resources::APP_LABEL;
use serde::Serialize;
use tabled::Tabled;

const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Pod row for table display
#[derive(Tabled, Serialize)]
pub struct PodRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Instance")]
    pub instance: String,
    #[tabled(rename = "Component")]
    pub component: String,
    #[tabled(rename = "Phase")]
    pub phase: String,
    #[tabled(rename = "Ready")]
    pub ready: String,
    #[tabled(rename = "Restarts")]
    pub restarts: i32,
    #[tabled(rename = "Age")]
    pub age: String,
}

impl PodRow {
    pub fn from_pod(pod: &Pod, now: DateTime<Utc>) -> Self {
        let labels = pod.labels();
        let label = |key: &str| labels.get(key).cloned().unwrap_or_else(|| "-".to_string());

        let statuses = pod
            .status
            .as_ref()
            .and_then(|s| s.container_statuses.clone())
            .unwrap_or_default();
        let total = pod
            .spec
            .as_ref()
            .map(|s| s.containers.len())
            .unwrap_or(statuses.len());
        let ready = statuses.iter().filter(|c| c.ready).count();
        let restarts = statuses.iter().map(|c| c.restart_count).sum();

        Self {
            name: pod.name_any(),
            instance: label("instance"),
            component: label("component"),
            phase: pod
                .status
                .as_ref()
                .and_then(|s| s.phase.clone())
                .unwrap_or_else(|| "Unknown".to_string()),
            ready: format!("{}/{}", ready, total),
            restarts,
            age: format_age(pod.creation_timestamp().map(|t| t.0), now),
        }
    }
}

pub fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < 0 {
        bail!("Replica count must be non-negative, got {}", replicas);
    }
    Ok(())
}

/// Merge patch that stamps the pod template, as `kubectl rollout restart` does
pub fn restart_patch(at: DateTime<Utc>) -> serde_json::Value {
    serde_json::json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: at.to_rfc3339()
                    }
                }
            }
        }
    })
}

pub async fn scale_deployment(
    client: Client,
    namespace: &str,
    name: &str,
    replicas: i32,
) -> Result<()> {
    validate_replicas(replicas)?;

    let api: Api<Deployment> = Api::namespaced(client, namespace);
    let mut deployment = api
        .get(name)
        .await
        .with_context(|| format!("Deployment {}/{} not found", namespace, name))?;

    let current = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    if current == replicas {
        print_warning(&format!("{} already has {} replicas", name, replicas));
        return Ok(());
    }

    if let Some(spec) = deployment.spec.as_mut() {
        spec.replicas = Some(replicas);
    }
    api.replace(name, &PostParams::default(), &deployment)
        .await
        .with_context(|| format!("Failed to scale {}", name))?;

    print_success(&format!("Scaled {} from {} to {} replicas", name, current, replicas));
    Ok(())
}

pub async fn restart_deployment(client: Client, namespace: &str, name: &str) -> Result<()> {
    let api: Api<Deployment> = Api::namespaced(client, namespace);
    api.patch(
        name,
        &PatchParams::default(),
        &Patch::Merge(&restart_patch(Utc::now())),
    )
    .await
    .with_context(|| format!("Failed to restart {}", name))?;

    print_success(&format!("Restarted deployment {}", name));
    Ok(())
}

pub async fn list_pods(client: Client, namespace: &str, format: OutputFormat) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let params = ListParams::default().labels(&format!("app={}", APP_LABEL));
    let list = api
        .list(&params)
        .await
        .with_context(|| format!("Failed to list pods in {}", namespace))?;

    let now = Utc::now();
    let mut rows: Vec<PodRow> = list.items.iter().map(|pod| PodRow::from_pod(pod, now)).collect();
    rows.sort_by(|a, b| (&a.instance, &a.component, &a.name).cmp(&(&b.instance, &b.component, &b.name)));

    if let OutputFormat::Table = format {
        for row in &mut rows {
            row.phase = color_phase(&row.phase);
        }
    }

    print_table(&rows, format)
}

pub async fn print_logs(
    client: Client,
    namespace: &str,
    pod: &str,
    container: Option<String>,
    tail: Option<i64>,
) -> Result<()> {
    let api: Api<Pod> = Api::namespaced(client, namespace);
    let params = LogParams {
        container,
        tail_lines: tail,
        ..Default::default()
    };

    let logs = api
        .logs(pod, &params)
        .await
        .with_context(|| format!("Failed to fetch logs for {}", pod))?;
    print!("{}", logs);
    Ok(())
}
