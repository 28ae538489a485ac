//! In-process cluster used by tests and dry runs
//!
//! Deployments converge instantly: ready replicas always equal the
//! desired count unless overridden with [`InMemoryCluster::set_ready_replicas`].

use super::{
    ClusterApi, DerivedObject, InstanceEvent, InstanceEventStream, PodUsage, ResourceKind,
};
use crate::error::ClusterError;
use crate::models::CanvasInstance;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use kube::ResourceExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

type ObjectKey = (ResourceKind, String);

/// Which call an injected failure applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailOn {
    Write,
    Delete,
}

pub struct InMemoryCluster {
    namespace: String,
    objects: DashMap<ObjectKey, DerivedObject>,
    instances: DashMap<String, CanvasInstance>,
    pod_usage: DashMap<String, Vec<PodUsage>>,
    failures: DashMap<(FailOn, ResourceKind, String), ClusterError>,
    pending_events: Mutex<VecDeque<Result<InstanceEvent, ClusterError>>>,
    open_failures: Mutex<VecDeque<ClusterError>>,
    watch_opens: AtomicUsize,
    creates: AtomicUsize,
    status_writes: AtomicUsize,
}

impl InMemoryCluster {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            objects: DashMap::new(),
            instances: DashMap::new(),
            pod_usage: DashMap::new(),
            failures: DashMap::new(),
            pending_events: Mutex::new(VecDeque::new()),
            open_failures: Mutex::new(VecDeque::new()),
            watch_opens: AtomicUsize::new(0),
            creates: AtomicUsize::new(0),
            status_writes: AtomicUsize::new(0),
        }
    }

    /// Store an instance without emitting an event; it is replayed on the
    /// next watch open
    pub fn insert_instance(&self, mut instance: CanvasInstance) {
        if instance.metadata.namespace.is_none() {
            instance.metadata.namespace = Some(self.namespace.clone());
        }
        self.instances.insert(instance.name_any(), instance);
    }

    /// Remove an instance and queue a `Removed` event for the watch stream
    pub fn delete_instance(&self, name: &str) {
        if let Some((_, instance)) = self.instances.remove(name) {
            self.push_event(InstanceEvent::Removed(instance));
        }
    }

    pub fn push_event(&self, event: InstanceEvent) {
        if let Ok(mut events) = self.pending_events.lock() {
            events.push_back(Ok(event));
        }
    }

    /// Queue an in-band stream error after the pending events
    pub fn push_watch_error(&self, error: ClusterError) {
        if let Ok(mut events) = self.pending_events.lock() {
            events.push_back(Err(error));
        }
    }

    /// Make the next `times` watch opens fail with `error`
    pub fn fail_watch_opens(&self, times: usize, error: ClusterError) {
        if let Ok(mut failures) = self.open_failures.lock() {
            failures.extend(std::iter::repeat(error).take(times));
        }
    }

    pub fn instance(&self, name: &str) -> Option<CanvasInstance> {
        self.instances.get(name).map(|r| r.value().clone())
    }

    pub fn object(&self, kind: ResourceKind, name: &str) -> Option<DerivedObject> {
        self.objects
            .get(&(kind, name.to_string()))
            .map(|r| r.value().clone())
    }

    pub fn deployment(&self, name: &str) -> Option<Deployment> {
        match self.object(ResourceKind::Deployment, name)? {
            DerivedObject::Deployment(d) => Some(d),
            _ => None,
        }
    }

    pub fn contains(&self, kind: ResourceKind, name: &str) -> bool {
        self.objects.contains_key(&(kind, name.to_string()))
    }

    /// Names of all stored objects of a kind, sorted
    pub fn names(&self, kind: ResourceKind) -> Vec<String> {
        let mut names: Vec<String> = self
            .objects
            .iter()
            .filter(|r| r.key().0 == kind)
            .map(|r| r.key().1.clone())
            .collect();
        names.sort();
        names
    }

    /// Total number of derived objects stored
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn fail_on(&self, call: FailOn, kind: ResourceKind, name: &str, error: ClusterError) {
        self.failures.insert((call, kind, name.to_string()), error);
    }

    pub fn clear_failures(&self) {
        self.failures.clear();
    }

    pub fn set_pod_usage(&self, label_selector: &str, pods: Vec<PodUsage>) {
        self.pod_usage.insert(label_selector.to_string(), pods);
    }

    pub fn set_ready_replicas(&self, name: &str, ready: i32) {
        let key = (ResourceKind::Deployment, name.to_string());
        if let Some(mut entry) = self.objects.get_mut(&key) {
            if let DerivedObject::Deployment(d) = entry.value_mut() {
                d.status.get_or_insert_with(Default::default).ready_replicas = Some(ready);
            }
        }
    }

    pub fn watch_opens(&self) -> usize {
        self.watch_opens.load(Ordering::SeqCst)
    }

    /// Successful create calls, across all kinds
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn status_writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst)
    }

    fn injected(&self, call: FailOn, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        match self.failures.get(&(call, kind, name.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn converge(object: &DerivedObject) -> DerivedObject {
        match object {
            DerivedObject::Deployment(d) => {
                let mut d = d.clone();
                let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                d.status = Some(DeploymentStatus {
                    replicas: Some(desired),
                    ready_replicas: Some(desired),
                    ..Default::default()
                });
                DerivedObject::Deployment(d)
            }
            other => other.clone(),
        }
    }
}

#[async_trait]
impl ClusterApi for InMemoryCluster {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn create(&self, object: &DerivedObject) -> Result<(), ClusterError> {
        let kind = object.kind();
        let name = object.name().to_string();
        self.injected(FailOn::Write, kind, &name)?;

        match self.objects.entry((kind, name.clone())) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ClusterError::AlreadyExists(
                format!("{} \"{}\" already exists", kind, name),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Self::converge(object));
                self.creates.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
    }

    async fn replace(&self, object: &DerivedObject) -> Result<(), ClusterError> {
        let kind = object.kind();
        let name = object.name().to_string();
        self.injected(FailOn::Write, kind, &name)?;

        match self.objects.get_mut(&(kind, name.clone())) {
            Some(mut entry) => {
                *entry = Self::converge(object);
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!(
                "{} \"{}\" not found",
                kind, name
            ))),
        }
    }

    async fn delete(&self, kind: ResourceKind, name: &str) -> Result<(), ClusterError> {
        self.injected(FailOn::Delete, kind, name)?;
        self.objects
            .remove(&(kind, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound(format!("{} \"{}\" not found", kind, name)))
    }

    async fn get_deployment(&self, name: &str) -> Result<Deployment, ClusterError> {
        self.deployment(name)
            .ok_or_else(|| ClusterError::NotFound(format!("Deployment \"{}\" not found", name)))
    }

    async fn pod_usage(&self, label_selector: &str) -> Result<Vec<PodUsage>, ClusterError> {
        Ok(self
            .pod_usage
            .get(label_selector)
            .map(|r| r.value().clone())
            .unwrap_or_default())
    }

    async fn get_instance(&self, name: &str) -> Result<CanvasInstance, ClusterError> {
        self.instance(name)
            .ok_or_else(|| ClusterError::NotFound(format!("SDMultiplayer \"{}\" not found", name)))
    }

    async fn replace_instance_status(
        &self,
        instance: &CanvasInstance,
    ) -> Result<(), ClusterError> {
        let name = instance.name_any();
        match self.instances.get_mut(&name) {
            Some(mut stored) => {
                stored.status = instance.status.clone();
                self.status_writes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(ClusterError::NotFound(format!(
                "SDMultiplayer \"{}\" not found",
                name
            ))),
        }
    }

    async fn watch_instances(&self) -> Result<InstanceEventStream, ClusterError> {
        self.watch_opens.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.open_failures.lock().ok().and_then(|mut f| f.pop_front()) {
            return Err(error);
        }

        let mut events: Vec<Result<InstanceEvent, ClusterError>> = self
            .instances
            .iter()
            .map(|r| Ok(InstanceEvent::Upserted(r.value().clone())))
            .collect();
        if let Ok(mut pending) = self.pending_events.lock() {
            events.extend(pending.drain(..));
        }

        // The stream ends after the queued events, like a server-side timeout
        Ok(futures::stream::iter(events).boxed())
    }
}
