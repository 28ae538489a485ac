//! Custom resource model for SD multiplayer canvas instances
//!
//! One `SDMultiplayer` object describes a complete canvas stack. The
//! operator reads the spec and owns the status subresource.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Maximum number of conditions kept in the status history
pub const MAX_CONDITIONS: usize = 5;

pub const DEFAULT_FRONTEND_IMAGE: &str = "primay73/sd-multiplayer-frontend:test";
pub const DEFAULT_BACKEND_IMAGE: &str = "primay73/sd-multiplayer-backend:test";
pub const DEFAULT_FRONTEND_REPLICAS: i32 = 3;
pub const DEFAULT_BACKEND_REPLICAS: i32 = 1;
pub const DEFAULT_STORAGE_SIZE: &str = "10Gi";
pub const DEFAULT_STORAGE_CLASS: &str = "standard";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_MAX_CONCURRENT_TASKS: u32 = 10;

/// Desired state of one canvas instance
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[kube(
    group = "ai.example.com",
    version = "v1",
    kind = "SDMultiplayer",
    plural = "sdmultiplayers",
    shortname = "sdm",
    status = "InstanceStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Frontend","type":"integer","jsonPath":".status.frontendReplicas"}"#,
    printcolumn = r#"{"name":"Backend","type":"integer","jsonPath":".status.backendReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    #[serde(default)]
    pub frontend: FrontendSpec,
    #[serde(default)]
    pub backend: BackendSpec,
    #[serde(default)]
    pub storage: StorageSpec,
    #[serde(default)]
    pub config: RuntimeConfig,
}

/// The generated custom resource, named for what it manages
pub type CanvasInstance = SDMultiplayer;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FrontendSpec {
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub resources: Option<ResourceSpec>,
}

impl FrontendSpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_FRONTEND_IMAGE)
    }

    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_FRONTEND_REPLICAS)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendSpec {
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub resources: Option<ResourceSpec>,
    /// Request one accelerator unit per backend pod
    #[serde(default)]
    pub gpu_required: bool,
}

impl BackendSpec {
    pub fn image(&self) -> &str {
        self.image.as_deref().unwrap_or(DEFAULT_BACKEND_IMAGE)
    }

    pub fn replicas(&self) -> i32 {
        self.replicas.unwrap_or(DEFAULT_BACKEND_REPLICAS)
    }
}

/// Container resource requests and limits, as quantity strings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    pub size: Option<String>,
    pub storage_class: Option<String>,
}

impl StorageSpec {
    pub fn size(&self) -> &str {
        self.size.as_deref().unwrap_or(DEFAULT_STORAGE_SIZE)
    }

    pub fn storage_class(&self) -> &str {
        self.storage_class.as_deref().unwrap_or(DEFAULT_STORAGE_CLASS)
    }
}

/// Runtime knobs and credential material for the stack
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub log_level: Option<String>,
    pub max_concurrent_tasks: Option<u32>,
    /// Credential material keyed by camelCase name, e.g. `stabilityApiKey`
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub api_keys: BTreeMap<String, String>,
}

impl RuntimeConfig {
    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn max_concurrent_tasks(&self) -> u32 {
        self.max_concurrent_tasks
            .unwrap_or(DEFAULT_MAX_CONCURRENT_TASKS)
    }

    /// Api keys that carry a non-empty value
    pub fn credentials(&self) -> impl Iterator<Item = (&String, &String)> {
        self.api_keys.iter().filter(|(_, v)| !v.is_empty())
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials().next().is_some()
    }
}

/// Coarse lifecycle state of an instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Failed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pending => write!(f, "Pending"),
            Phase::Running => write!(f, "Running"),
            Phase::Failed => write!(f, "Failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            ConditionStatus::True
        } else {
            ConditionStatus::False
        }
    }
}

/// A timestamped fact about instance health
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub last_transition_time: DateTime<Utc>,
    pub reason: String,
    pub message: String,
}

impl Condition {
    /// `Ready` condition derived from a phase transition
    pub fn ready(phase: Phase, message: impl Into<String>) -> Self {
        Self {
            type_: "Ready".to_string(),
            status: (phase == Phase::Running).into(),
            last_transition_time: Utc::now(),
            reason: phase.to_string(),
            message: message.into(),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Observed state written back by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: Phase,
    pub last_update_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default)]
    pub frontend_replicas: i32,
    #[serde(default)]
    pub backend_replicas: i32,
    #[serde(default)]
    pub active_jobs: u64,
    #[serde(default)]
    pub total_jobs: u64,
    #[serde(default)]
    pub queue_length: u64,
}

impl InstanceStatus {
    /// Append a condition, evicting the oldest entries beyond the cap
    pub fn push_condition(&mut self, condition: Condition) {
        self.conditions.push(condition);
        if self.conditions.len() > MAX_CONDITIONS {
            let excess = self.conditions.len() - MAX_CONDITIONS;
            self.conditions.drain(0..excess);
        }
    }

    pub fn last_condition(&self) -> Option<&Condition> {
        self.conditions.last()
    }
}

/// Live job figures for one instance, reported by the metrics collector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMetrics {
    pub active_jobs: u64,
    pub queue_length: u64,
}

/// Per-instance monitoring record
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringState {
    pub total_jobs: u64,
    pub active_jobs: u64,
    pub queue_length: u64,
    pub last_scale_time: DateTime<Utc>,
    pub last_cpu_percent: f64,
    pub last_memory_percent: f64,
}

impl Default for MonitoringState {
    fn default() -> Self {
        Self {
            total_jobs: 0,
            active_jobs: 0,
            queue_length: 0,
            last_scale_time: Utc::now(),
            last_cpu_percent: 0.0,
            last_memory_percent: 0.0,
        }
    }
}

impl MonitoringState {
    /// Fold a new job observation into the counters. Every increase in
    /// active jobs counts as newly observed work.
    pub fn observe_jobs(&mut self, jobs: JobMetrics) {
        if jobs.active_jobs > self.active_jobs {
            self.total_jobs += jobs.active_jobs - self.active_jobs;
        }
        self.active_jobs = jobs.active_jobs;
        self.queue_length = jobs.queue_length;
    }
}
