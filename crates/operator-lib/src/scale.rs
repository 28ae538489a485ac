//! Backend replica scaling

use crate::cluster::{ClusterApi, DerivedObject};
use crate::error::ClusterError;
use crate::resources::DerivedNames;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const MIN_BACKEND_REPLICAS: i32 = 1;
pub const MAX_BACKEND_REPLICAS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Up,
    Down,
}

impl ScaleDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScaleDirection::Up => "up",
            ScaleDirection::Down => "down",
        }
    }

    /// Next replica count, or `None` when it would leave `[1, 5]`
    pub fn target(&self, current: i32) -> Option<i32> {
        let next = match self {
            ScaleDirection::Up => current + 1,
            ScaleDirection::Down => current - 1,
        };
        (MIN_BACKEND_REPLICAS..=MAX_BACKEND_REPLICAS)
            .contains(&next)
            .then_some(next)
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleOutcome {
    Scaled { from: i32, to: i32 },
    /// Already at the bound in the requested direction
    Unchanged { replicas: i32 },
}

/// Rewrites the backend workload with a new replica count
#[derive(Clone)]
pub struct BackendScaler {
    cluster: Arc<dyn ClusterApi>,
}

impl BackendScaler {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    pub async fn scale(
        &self,
        instance: &str,
        direction: ScaleDirection,
    ) -> Result<ScaleOutcome, ClusterError> {
        let name = DerivedNames::new(instance).backend;
        let mut deployment = self.cluster.get_deployment(&name).await?;
        let current = deployment
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(MIN_BACKEND_REPLICAS);

        let Some(target) = direction.target(current) else {
            debug!(instance = %instance, replicas = current, direction = %direction, "Backend at scaling bound");
            return Ok(ScaleOutcome::Unchanged { replicas: current });
        };

        if let Some(spec) = deployment.spec.as_mut() {
            spec.replicas = Some(target);
        }
        self.cluster
            .replace(&DerivedObject::Deployment(deployment))
            .await?;

        Ok(ScaleOutcome::Scaled {
            from: current,
            to: target,
        })
    }
}
