//! Canvas instance commands

use crate::output::{color_phase, format_age, print_table, OutputFormat};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use kube::api::ListParams;
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use operator_lib::CanvasInstance;
use serde::Serialize;
use tabled::Tabled;

/// Instance row for table display
#[derive(Tabled, Serialize)]
pub struct InstanceRow {
    #[tabled(rename = "Name")]
    pub name: String,
    #[tabled(rename = "Phase")]
    pub phase: String,
    #[tabled(rename = "Frontend")]
    pub frontend: String,
    #[tabled(rename = "Backend")]
    pub backend: String,
    #[tabled(rename = "Jobs (active/total)")]
    pub jobs: String,
    #[tabled(rename = "Queue")]
    pub queue: u64,
    #[tabled(rename = "Last Condition")]
    pub condition: String,
    #[tabled(rename = "Age")]
    pub age: String,
}

impl InstanceRow {
    pub fn from_instance(instance: &CanvasInstance, now: DateTime<Utc>) -> Self {
        let created = instance.creation_timestamp().map(|t| t.0);
        let status = instance.status.clone().unwrap_or_default();

        let condition = status
            .last_condition()
            .map(|c| format!("{}: {}", c.reason, c.message))
            .unwrap_or_else(|| "-".to_string());

        Self {
            name: instance.name_any(),
            phase: status.phase.to_string(),
            frontend: format!("{}/{}", status.frontend_replicas, instance.spec.frontend.replicas()),
            backend: format!("{}/{}", status.backend_replicas, instance.spec.backend.replicas()),
            jobs: format!("{}/{}", status.active_jobs, status.total_jobs),
            queue: status.queue_length,
            condition,
            age: format_age(created, now),
        }
    }
}

/// Print the CRD so it can be piped into `kubectl apply -f -`
pub fn print_crd() -> Result<()> {
    let crd = CanvasInstance::crd();
    let yaml = serde_yaml::to_string(&crd).context("Failed to render CRD")?;
    print!("{}", yaml);
    Ok(())
}

pub async fn list_instances(client: Client, namespace: &str, format: OutputFormat) -> Result<()> {
    let api: Api<CanvasInstance> = Api::namespaced(client, namespace);
    let list = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("Failed to list instances in {}", namespace))?;

    let now = Utc::now();
    let mut rows: Vec<InstanceRow> = list
        .items
        .iter()
        .map(|instance| InstanceRow::from_instance(instance, now))
        .collect();

    if let OutputFormat::Table = format {
        for row in &mut rows {
            row.phase = color_phase(&row.phase);
        }
    }

    print_table(&rows, format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use operator_lib::{Condition, InstanceSpec, InstanceStatus, Phase};

    fn instance(status: Option<InstanceStatus>, created: DateTime<Utc>) -> CanvasInstance {
        let mut instance = CanvasInstance::new("canvas-a", InstanceSpec::default());
        instance.metadata.creation_timestamp = Some(Time(created));
        instance.status = status;
        instance
    }

    #[test]
    fn test_row_for_running_instance() {
        let now = Utc::now();
        let mut status = InstanceStatus {
            phase: Phase::Running,
            frontend_replicas: 3,
            backend_replicas: 2,
            active_jobs: 4,
            total_jobs: 120,
            queue_length: 7,
            ..Default::default()
        };
        status.push_condition(Condition::ready(
            Phase::Running,
            "All resources created successfully",
        ));

        let row = InstanceRow::from_instance(&instance(Some(status), now - Duration::hours(2)), now);

        assert_eq!(row.name, "canvas-a");
        assert_eq!(row.phase, "Running");
        assert_eq!(row.frontend, "3/3");
        assert_eq!(row.backend, "2/1");
        assert_eq!(row.jobs, "4/120");
        assert_eq!(row.queue, 7);
        assert!(row.condition.ends_with("All resources created successfully"));
        assert_eq!(row.age, "2h");
    }

    #[test]
    fn test_row_without_status() {
        let now = Utc::now();
        let row = InstanceRow::from_instance(&instance(None, now), now);

        assert_eq!(row.phase, "Pending");
        assert_eq!(row.frontend, "0/3");
        assert_eq!(row.jobs, "0/0");
        assert_eq!(row.condition, "-");
    }

    #[test]
    fn test_crd_names() {
        let crd = CanvasInstance::crd();
        assert_eq!(crd.spec.names.plural, "sdmultiplayers");
        assert_eq!(crd.spec.group, "ai.example.com");
    }
}
