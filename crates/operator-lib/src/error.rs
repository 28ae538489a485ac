//! Error types shared by the control loops

use std::fmt;
use thiserror::Error;

/// Failure of a single orchestrator call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClusterError {
    /// Target object already exists; triggers the replace branch of an upsert
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The API server rejected the request
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    /// Network or API unavailability, retried by the owning loop
    #[error("transient error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClusterError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

impl From<kube::Error> for ClusterError {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(resp) => match resp.code {
                404 => ClusterError::NotFound(resp.message),
                // 409 also covers optimistic-lock conflicts on replace
                409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
                code => ClusterError::Api {
                    code,
                    message: resp.message,
                },
            },
            kube::Error::SerdeError(e) => ClusterError::Serialization(e.to_string()),
            other => ClusterError::Transient(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for ClusterError {
    fn from(err: serde_json::Error) -> Self {
        ClusterError::Serialization(err.to_string())
    }
}

/// Ordered steps of a reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileStep {
    ConfigMap,
    Secret,
    Storage,
    Frontend,
    Backend,
    Services,
    Ingress,
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileStep::ConfigMap => "configmap",
            ReconcileStep::Secret => "secret",
            ReconcileStep::Storage => "storage",
            ReconcileStep::Frontend => "frontend",
            ReconcileStep::Backend => "backend",
            ReconcileStep::Services => "services",
            ReconcileStep::Ingress => "ingress",
        };
        f.write_str(name)
    }
}

/// A reconciliation pass aborted at `step`
#[derive(Error, Debug, Clone, PartialEq)]
#[error("reconcile failed at {step}: {source}")]
pub struct ReconcileError {
    pub step: ReconcileStep,
    #[source]
    pub source: ClusterError,
}

impl ReconcileError {
    pub fn new(step: ReconcileStep, source: ClusterError) -> Self {
        Self { step, source }
    }
}
