//! Orchestrator access
//!
//! Every call the operator makes against the cluster goes through the
//! [`ClusterApi`] trait. [`KubeCluster`] talks to a real API server and
//! [`InMemoryCluster`] backs tests and dry runs.

mod kube_cluster;
mod memory;

pub use kube_cluster::KubeCluster;
pub use memory::{FailOn, InMemoryCluster};

use crate::error::ClusterError;
use crate::models::CanvasInstance;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use async_trait::async_trait;

/// Kinds of derived resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    ConfigMap,
    Secret,
    PersistentVolumeClaim,
    Deployment,
    Service,
    Ingress,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::Secret => "Secret",
            ResourceKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::Service => "Service",
            ResourceKind::Ingress => "Ingress",
        };
        f.write_str(name)
    }
}

/// A fully-specified desired object
#[derive(Debug, Clone, PartialEq)]
pub enum DerivedObject {
    ConfigMap(ConfigMap),
    Secret(Secret),
    PersistentVolumeClaim(PersistentVolumeClaim),
    Deployment(Deployment),
    Service(Service),
    Ingress(Ingress),
}

impl DerivedObject {
    pub fn kind(&self) -> ResourceKind {
        match self {
            DerivedObject::ConfigMap(_) => ResourceKind::ConfigMap,
            DerivedObject::Secret(_) => ResourceKind::Secret,
            DerivedObject::PersistentVolumeClaim(_) => ResourceKind::PersistentVolumeClaim,
            DerivedObject::Deployment(_) => ResourceKind::Deployment,
            DerivedObject::Service(_) => ResourceKind::Service,
            DerivedObject::Ingress(_) => ResourceKind::Ingress,
        }
    }

    pub fn name(&self) -> &str {
        let metadata = match self {
            DerivedObject::ConfigMap(o) => &o.metadata,
            DerivedObject::Secret(o) => &o.metadata,
            DerivedObject::PersistentVolumeClaim(o) => &o.metadata,
            DerivedObject::Deployment(o) => &o.metadata,
            DerivedObject::Service(o) => &o.metadata,
            DerivedObject::Ingress(o) => &o.metadata,
        };
        metadata.name.as_deref().unwrap_or_default()
    }
}

/// Resource usage of one container as reported by the metrics API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerUsage {
    pub name: String,
    /// CPU quantity, typically nanocores (`123456n`)
    pub cpu: String,
    /// Memory quantity, typically KiB (`1048576Ki`)
    pub memory: String,
}

/// Resource usage of one pod
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PodUsage {
    pub pod_name: String,
    pub containers: Vec<ContainerUsage>,
}

/// Classified change notification for an instance
#[derive(Debug, Clone)]
pub enum InstanceEvent {
    /// Created or modified
    Upserted(CanvasInstance),
    Removed(CanvasInstance),
}

pub type InstanceEventStream = BoxStream<'static, Result<InstanceEvent, ClusterError>>;

/// Namespaced view of the cluster orchestrator
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Namespace every call is scoped to
    fn namespace(&self) -> &str;

    /// Create an object; fails with `AlreadyExists` when the name is taken
    async fn create(&self, object: &DerivedObject) -> Result<(), ClusterError>;

    /// Replace an existing object with the given full state
    async fn replace(&self, object: &DerivedObject) -> Result<(), ClusterError>;

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError>;

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError>;

    /// Usage for every pod matching a label selector
    async fn pod_usage(&self, label_selector: &str) -> Result<Vec<PodUsage>, ClusterError>;

    async fn get_instance(&self, name: &str) -> Result<CanvasInstance, ClusterError>;

    /// Write the instance's status subresource from the given object
    async fn replace_instance_status(&self, instance: &CanvasInstance)
        -> Result<(), ClusterError>;

    /// Open a change stream for instances. The stream starts with an
    /// upsert for every existing instance.
    async fn watch_instances(&self) -> Result<InstanceEventStream, ClusterError>;
}
