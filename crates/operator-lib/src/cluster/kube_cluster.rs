//! Kubernetes API server backend

use super::{
    ClusterApi, ContainerUsage, DerivedObject, InstanceEvent, InstanceEventStream, PodUsage,
    ResourceKind,
};
use crate::error::ClusterError;
use crate::models::CanvasInstance;
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, PostParams,
    WatchEvent, WatchParams,
};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::debug;

/// Server-side watch timeout; the API server caps watches below 295s
pub const DEFAULT_WATCH_TIMEOUT_SECS: u32 = 290;

/// Container entry of a `metrics.k8s.io/v1beta1` PodMetrics object
#[derive(Debug, Deserialize)]
struct RawContainerMetrics {
    name: String,
    #[serde(default)]
    usage: BTreeMap<String, String>,
}

/// Cluster access backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
    watch_timeout_secs: u32,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            watch_timeout_secs: DEFAULT_WATCH_TIMEOUT_SECS,
        }
    }

    pub fn with_watch_timeout(mut self, secs: u32) -> Self {
        self.watch_timeout_secs = secs.min(DEFAULT_WATCH_TIMEOUT_SECS);
        self
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn create_typed<K>(&self, object: &K) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .create(&PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn replace_typed<K>(&self, object: &K) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let name = object.name_any();
        self.api::<K>()
            .replace(&name, &PostParams::default(), object)
            .await?;
        Ok(())
    }

    async fn delete_typed<K>(&self, name: &str) -> Result<(), ClusterError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.api::<K>()
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    fn pod_metrics_api(&self) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk("metrics.k8s.io", "v1beta1", "PodMetrics");
        let resource = ApiResource::from_gvk_with_plural(&gvk, "pods");
        Api::namespaced_with(self.client.clone(), &self.namespace, &resource)
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, object: &DerivedObject) -> Result<(), ClusterError> {
        match object {
            DerivedObject::ConfigMap(o) => self.create_typed(o).await,
            DerivedObject::Secret(o) => self.create_typed(o).await,
            DerivedObject::PersistentVolumeClaim(o) => self.create_typed(o).await,
            DerivedObject::Deployment(o) => self.create_typed(o).await,
            DerivedObject::Service(o) => self.create_typed(o).await,
            DerivedObject::Ingress(o) => self.create_typed(o).await,
        }
    }

    async fn replace(&self, object: &DerivedObject) -> Result<(), ClusterError> {
        match object {
            DerivedObject::ConfigMap(o) => self.replace_typed(o).await,
            DerivedObject::Secret(o) => self.replace_typed(o).await,
            DerivedObject::PersistentVolumeClaim(o) => self.replace_typed(o).await,
            DerivedObject::Deployment(o) => self.replace_typed(o).await,
            DerivedObject::Service(o) => self.replace_typed(o).await,
            DerivedObject::Ingress(o) => self.replace_typed(o).await,
        }
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        match kind {
            ResourceKind::ConfigMap => self.delete_typed::<ConfigMap>(name).await,
            ResourceKind::Secret => self.delete_typed::<Secret>(name).await,
            ResourceKind::PersistentVolumeClaim => {
                self.delete_typed::<PersistentVolumeClaim>(name).await
            }
            ResourceKind::Deployment => self.delete_typed::<Deployment>(name).await,
            ResourceKind::Service => self.delete_typed::<Service>(name).await,
            ResourceKind::Ingress => self.delete_typed::<Ingress>(name).await,
        }
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        Ok(self.api::<Deployment>().get(name).await?)
    }

    async fn pod_usage(&self, label_selector: &str) -> Result<Vec<PodUsage>, ClusterError> {
        let list = self
            .pod_metrics_api()
            .list(&ListParams::default().labels(label_selector))
            .await?;

        let mut pods = Vec::with_capacity(list.items.len());
        for item in list.items {
            let raw: Vec<RawContainerMetrics> = match item.data.get("containers") {
                Some(value) => serde_json::from_value(value.clone())?,
                None => Vec::new(),
            };
            let containers = raw
                .into_iter()
                .map(|c| ContainerUsage {
                    cpu: c.usage.get("cpu").cloned().unwrap_or_else(|| "0".into()),
                    memory: c.usage.get("memory").cloned().unwrap_or_else(|| "0".into()),
                    name: c.name,
                })
                .collect();
            pods.push(PodUsage {
                pod_name: item.name_any(),
                containers,
            });
        }

        debug!(selector = %label_selector, pods = pods.len(), "Fetched pod metrics");
        Ok(pods)
    }

    async fn get_instance(&self, name: &str) -> Result<CanvasInstance, ClusterError> {
        Ok(self.api::<CanvasInstance>().get(name).await?)
    }

    async fn replace_instance_status(
        &self,
        instance: &CanvasInstance,
    ) -> Result<(), ClusterError> {
        let body = serde_json::to_vec(instance)?;
        self.api::<CanvasInstance>()
            .replace_status(&instance.name_any(), &PostParams::default(), body)
            .await?;
        Ok(())
    }

    async fn watch_instances(&self) -> Result<InstanceEventStream, ClusterError> {
        let params = WatchParams::default().timeout(self.watch_timeout_secs);
        // Resource version "0" replays the current set as ADDED events
        let stream = self.api::<CanvasInstance>().watch(&params, "0").await?;

        let events = stream.filter_map(|event| async move {
            match event {
                Ok(event) => classify(event),
                Err(e) => Some(Err(ClusterError::from(e))),
            }
        });

        Ok(events.boxed())
    }
}

/// Map a raw watch event onto the operator's view. Bookmarks carry no
/// object and are skipped; an in-band error ends the stream's usefulness
/// and is surfaced so the watcher reconnects.
fn classify(event: WatchEvent<CanvasInstance>) -> Option<Result<InstanceEvent, ClusterError>> {
    match event {
        WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Some(Ok(InstanceEvent::Upserted(obj))),
        WatchEvent::Deleted(obj) => Some(Ok(InstanceEvent::Removed(obj))),
        WatchEvent::Bookmark(_) => None,
        WatchEvent::Error(resp) => Some(Err(ClusterError::from(kube::Error::Api(resp)))),
    }
}
