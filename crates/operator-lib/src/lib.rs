//! Operator library for SD multiplayer canvas instances
//!
//! This crate provides the control loops that keep each canvas instance's
//! derived resources converged:
//! - Event watching with reconnect
//! - Idempotent reconciliation and status reporting
//! - Per-instance load monitoring and backend autoscaling
//! - Cleanup on deletion
//! - Health checks and observability

pub mod cleanup;
pub mod cluster;
pub mod controller;
pub mod error;
pub mod health;
pub mod models;
pub mod monitor;
pub mod observability;
pub mod quantity;
pub mod reconciler;
pub mod resources;
pub mod scale;
pub mod status;
pub mod watcher;


pub use cleanup::{CleanupManager, CleanupReport};
pub use cluster::{ClusterApi, InMemoryCluster, KubeCluster};
pub use controller::{Controller, Dispatch};
pub use error::{ClusterError, ReconcileError, ReconcileStep};
pub use health::{
    ComponentHealth, ComponentStatus, ControlLoop, HealthRegistry, HealthResponse,
    ReadinessResponse,
};
pub use models::*;
pub use monitor::{
    JobMetricsSource, LoadMonitor, MonitorConfig, MonitorSupervisor, PrometheusJobSource,
    StaticJobSource,
};
pub use observability::{OperatorMetrics, StructuredLogger};
pub use reconciler::Reconciler;
pub use watcher::{EventWatcher, WatcherConfig};
