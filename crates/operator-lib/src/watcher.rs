//! Long-lived subscription to instance change events
//!
//! The stream is not resumed from a cursor. Each (re)open replays an upsert
//! for every existing instance, so delivery is at least once and relies on
//! the reconciler being idempotent. Events are handled one at a time, in
//! stream order.

use crate::cluster::ClusterApi;
use crate::controller::Controller;
use crate::error::ClusterError;
use crate::health::{ControlLoop, HealthRegistry};
use crate::observability::OperatorMetrics;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Pause before reopening a closed or failed stream
    pub reconnect_delay: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(10),
        }
    }
}

pub struct EventWatcher {
    cluster: Arc<dyn ClusterApi>,
    controller: Arc<Controller>,
    config: WatcherConfig,
    health: HealthRegistry,
    metrics: OperatorMetrics,
}

impl EventWatcher {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        controller: Arc<Controller>,
        config: WatcherConfig,
        health: HealthRegistry,
    ) -> Self {
        Self {
            cluster,
            controller,
            config,
            health,
            metrics: OperatorMetrics::new(),
        }
    }

    /// Watch until shutdown. Stream ends and errors never stop the loop.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            namespace = %self.cluster.namespace(),
            reconnect_delay_secs = self.config.reconnect_delay.as_secs(),
            "Starting instance watcher"
        );

        loop {
            tokio::select! {
                result = self.watch_once() => {
                    match result {
                        Ok(events) => debug!(events = events, "Watch stream ended"),
                        Err(e) => {
                            warn!(error = %e, "Watch stream failed");
                            self.health
                                .record_failure(ControlLoop::Watcher, e.to_string())
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => break,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_delay) => {
                    self.metrics.inc_watch_reconnects();
                }
                _ = shutdown.recv() => break,
            }
        }

        info!("Shutting down instance watcher");
    }

    /// Open one stream and dispatch its events until it ends. Returns the
    /// number of events handled.
    pub async fn watch_once(&self) -> Result<usize, ClusterError> {
        let mut stream = self.cluster.watch_instances().await?;
        self.health.mark_watch_opened().await;
        self.health.record_success(ControlLoop::Watcher).await;

        let mut handled = 0;
        while let Some(event) = stream.next().await {
            self.controller.handle(event?).await;
            handled += 1;
        }
        Ok(handled)
    }
}
