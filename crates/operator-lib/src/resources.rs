//! Desired-state builders for the resources derived from one instance
//!
//! Every object is named deterministically from the instance name; the
//! name is the only correlation key between an instance and its resources.

use crate::cluster::ResourceKind;
use crate::models::{InstanceSpec, ResourceSpec};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapKeySelector, Container, ContainerPort, EnvVar, EnvVarSource,
    HTTPGetAction, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    Secret, SecretKeySelector, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use k8s_openapi::ByteString;
use std::collections::BTreeMap;

pub const APP_LABEL: &str = "sd-multiplayer";
pub const MANAGED_BY: &str = "sd-controller";
pub const GPU_RESOURCE: &str = "nvidia.com/gpu";
pub const FRONTEND_PORT: i32 = 80;
pub const BACKEND_PORT: i32 = 7860;
pub const STORAGE_MOUNT_PATH: &str = "/app/stablediffusion-infinity/local_storage";
pub const HOST_SUFFIX: &str = "sd-multiplayer.local";

const STORAGE_VOLUME: &str = "storage-volume";

/// Which half of the stack a workload belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Frontend,
    Backend,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Frontend => "frontend",
            Component::Backend => "backend",
        }
    }
}

/// Deterministic names of every derived resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNames {
    pub config: String,
    pub secret: String,
    pub storage: String,
    pub frontend: String,
    pub backend: String,
    pub frontend_service: String,
    pub backend_service: String,
    pub ingress: String,
}

impl DerivedNames {
    pub fn new(instance: &str) -> Self {
        Self {
            config: format!("{}-config", instance),
            secret: format!("{}-secrets", instance),
            storage: format!("{}-storage-pvc", instance),
            frontend: format!("{}-frontend", instance),
            backend: format!("{}-backend", instance),
            frontend_service: format!("{}-frontend-service", instance),
            backend_service: format!("{}-backend-service", instance),
            ingress: format!("{}-ingress", instance),
        }
    }

    /// Every (kind, name) pair that may exist for the instance
    pub fn all(&self) -> Vec<(ResourceKind, String)> {
        vec![
            (ResourceKind::Deployment, self.frontend.clone()),
            (ResourceKind::Deployment, self.backend.clone()),
            (ResourceKind::Service, self.frontend_service.clone()),
            (ResourceKind::Service, self.backend_service.clone()),
            (ResourceKind::Ingress, self.ingress.clone()),
            (ResourceKind::ConfigMap, self.config.clone()),
            (ResourceKind::Secret, self.secret.clone()),
            (ResourceKind::PersistentVolumeClaim, self.storage.clone()),
        ]
    }
}

/// Label selector string matching the pods of one component
pub fn pod_selector(instance: &str, component: Component) -> String {
    format!(
        "app={},component={},instance={}",
        APP_LABEL,
        component.as_str(),
        instance
    )
}

/// Builds the desired objects for one instance in one namespace
#[derive(Debug, Clone)]
pub struct ResourceBuilder<'a> {
    instance: &'a str,
    namespace: &'a str,
    spec: &'a InstanceSpec,
    names: DerivedNames,
}

impl<'a> ResourceBuilder<'a> {
    pub fn new(instance: &'a str, namespace: &'a str, spec: &'a InstanceSpec) -> Self {
        Self {
            instance,
            namespace,
            spec,
            names: DerivedNames::new(instance),
        }
    }

    pub fn names(&self) -> &DerivedNames {
        &self.names
    }

    fn instance_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), APP_LABEL.to_string()),
            ("instance".to_string(), self.instance.to_string()),
            ("managed-by".to_string(), MANAGED_BY.to_string()),
        ])
    }

    fn selector_labels(&self, component: Component) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), APP_LABEL.to_string()),
            ("component".to_string(), component.as_str().to_string()),
            ("instance".to_string(), self.instance.to_string()),
        ])
    }

    fn component_labels(&self, component: Component) -> BTreeMap<String, String> {
        let mut labels = self.instance_labels();
        labels.insert("component".to_string(), component.as_str().to_string());
        labels
    }

    fn metadata(&self, name: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        }
    }

    pub fn config_map(&self) -> ConfigMap {
        let config = &self.spec.config;
        let data = BTreeMap::from([
            ("APP_ENV".to_string(), "production".to_string()),
            ("LOG_LEVEL".to_string(), config.log_level().to_string()),
            ("BACKEND_HOST".to_string(), "0.0.0.0".to_string()),
            ("BACKEND_PORT".to_string(), BACKEND_PORT.to_string()),
            (
                "MAX_CONCURRENT_TASKS".to_string(),
                config.max_concurrent_tasks().to_string(),
            ),
            ("NGINX_WORKER_PROCESSES".to_string(), "auto".to_string()),
        ]);

        ConfigMap {
            metadata: self.metadata(&self.names.config, self.instance_labels()),
            data: Some(data),
            ..Default::default()
        }
    }

    /// The secret object, or `None` when the spec carries no credentials
    pub fn secret(&self) -> Option<Secret> {
        let data: BTreeMap<String, ByteString> = self
            .spec
            .config
            .credentials()
            .map(|(key, value)| (secret_key(key), ByteString(value.as_bytes().to_vec())))
            .collect();

        if data.is_empty() {
            return None;
        }

        Some(Secret {
            metadata: self.metadata(&self.names.secret, self.instance_labels()),
            type_: Some("Opaque".to_string()),
            data: Some(data),
            ..Default::default()
        })
    }

    pub fn storage_claim(&self) -> PersistentVolumeClaim {
        let storage = &self.spec.storage;
        PersistentVolumeClaim {
            metadata: self.metadata(&self.names.storage, self.instance_labels()),
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                resources: Some(ResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(storage.size().to_string()),
                    )])),
                    ..Default::default()
                }),
                storage_class_name: Some(storage.storage_class().to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn frontend_deployment(&self) -> Deployment {
        let frontend = &self.spec.frontend;
        let container = Container {
            name: Component::Frontend.as_str().to_string(),
            image: Some(frontend.image().to_string()),
            ports: Some(vec![http_port(FRONTEND_PORT)]),
            env: Some(vec![config_env(&self.names.config, "NGINX_WORKER_PROCESSES")]),
            resources: frontend.resources.as_ref().map(requirements),
            liveness_probe: Some(http_probe("/", FRONTEND_PORT, 30, 30)),
            readiness_probe: Some(http_probe("/", FRONTEND_PORT, 5, 10)),
            ..Default::default()
        };

        self.deployment(
            &self.names.frontend,
            Component::Frontend,
            frontend.replicas(),
            PodSpec {
                containers: vec![container],
                ..Default::default()
            },
        )
    }

    pub fn backend_deployment(&self) -> Deployment {
        let backend = &self.spec.backend;

        let mut env = vec![
            config_env(&self.names.config, "LOG_LEVEL"),
            config_env(&self.names.config, "MAX_CONCURRENT_TASKS"),
            config_env(&self.names.config, "BACKEND_HOST"),
            config_env(&self.names.config, "BACKEND_PORT"),
        ];
        for (key, _) in self.spec.config.credentials() {
            env.push(EnvVar {
                name: env_var_name(key),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(self.names.secret.clone()),
                        key: secret_key(key),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let mut resources = backend
            .resources
            .as_ref()
            .map(requirements)
            .unwrap_or_default();
        if backend.gpu_required {
            resources
                .limits
                .get_or_insert_with(BTreeMap::new)
                .insert(GPU_RESOURCE.to_string(), Quantity("1".to_string()));
        }
        let has_resources = resources.limits.is_some() || resources.requests.is_some();

        let container = Container {
            name: Component::Backend.as_str().to_string(),
            image: Some(backend.image().to_string()),
            ports: Some(vec![http_port(BACKEND_PORT)]),
            env: Some(env),
            resources: has_resources.then_some(resources),
            volume_mounts: Some(vec![VolumeMount {
                name: STORAGE_VOLUME.to_string(),
                mount_path: STORAGE_MOUNT_PATH.to_string(),
                ..Default::default()
            }]),
            liveness_probe: Some(http_probe("/server/api/health", BACKEND_PORT, 60, 30)),
            readiness_probe: Some(http_probe("/server/api/health", BACKEND_PORT, 30, 10)),
            ..Default::default()
        };

        self.deployment(
            &self.names.backend,
            Component::Backend,
            backend.replicas(),
            PodSpec {
                containers: vec![container],
                volumes: Some(vec![Volume {
                    name: STORAGE_VOLUME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: self.names.storage.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            },
        )
    }

    fn deployment(
        &self,
        name: &str,
        component: Component,
        replicas: i32,
        pod_spec: PodSpec,
    ) -> Deployment {
        Deployment {
            metadata: self.metadata(name, self.component_labels(component)),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: LabelSelector {
                    match_labels: Some(self.selector_labels(component)),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.selector_labels(component)),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn frontend_service(&self) -> Service {
        self.service(&self.names.frontend_service, Component::Frontend, FRONTEND_PORT)
    }

    pub fn backend_service(&self) -> Service {
        self.service(&self.names.backend_service, Component::Backend, BACKEND_PORT)
    }

    fn service(&self, name: &str, component: Component, port: i32) -> Service {
        Service {
            metadata: self.metadata(name, self.component_labels(component)),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                selector: Some(self.selector_labels(component)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    pub fn host(&self) -> String {
        format!("{}.{}", self.instance, HOST_SUFFIX)
    }

    pub fn ingress(&self) -> Ingress {
        let mut metadata = self.metadata(&self.names.ingress, self.instance_labels());
        metadata.annotations = Some(BTreeMap::from([
            ("kubernetes.io/ingress.class".to_string(), "nginx".to_string()),
            (
                "nginx.ingress.kubernetes.io/proxy-body-size".to_string(),
                "100m".to_string(),
            ),
        ]));

        Ingress {
            metadata,
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(self.host()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![
                            ingress_path("/", &self.names.frontend_service, FRONTEND_PORT),
                            ingress_path("/server", &self.names.backend_service, BACKEND_PORT),
                        ],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn http_port(port: i32) -> ContainerPort {
    ContainerPort {
        container_port: port,
        name: Some("http".to_string()),
        ..Default::default()
    }
}

fn http_probe(path: &str, port: i32, initial_delay: i32, period: i32) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        ..Default::default()
    }
}

fn config_env(config_map: &str, key: &str) -> EnvVar {
    EnvVar {
        name: key.to_string(),
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: Some(config_map.to_string()),
                key: key.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn ingress_path(path: &str, service: &str, port: i32) -> HTTPIngressPath {
    HTTPIngressPath {
        path: Some(path.to_string()),
        path_type: "Prefix".to_string(),
        backend: IngressBackend {
            service: Some(IngressServiceBackend {
                name: service.to_string(),
                port: Some(ServiceBackendPort {
                    number: Some(port),
                    ..Default::default()
                }),
            }),
            ..Default::default()
        },
    }
}

fn requirements(spec: &ResourceSpec) -> ResourceRequirements {
    let to_quantities = |map: &BTreeMap<String, String>| {
        (!map.is_empty()).then(|| {
            map.iter()
                .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                .collect::<BTreeMap<_, _>>()
        })
    };

    ResourceRequirements {
        requests: to_quantities(&spec.requests),
        limits: to_quantities(&spec.limits),
        ..Default::default()
    }
}

/// `stabilityApiKey` -> `stability-api-key`
pub fn secret_key(api_key: &str) -> String {
    let mut out = String::with_capacity(api_key.len() + 4);
    for c in api_key.chars() {
        if c.is_ascii_uppercase() {
            if !out.is_empty() {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// `stabilityApiKey` -> `STABILITY_API_KEY`
pub fn env_var_name(api_key: &str) -> String {
    secret_key(api_key).replace('-', "_").to_ascii_uppercase()
}
