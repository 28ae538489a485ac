//! Operator configuration

use anyhow::Result;
use operator_lib::{MonitorConfig, WatcherConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Operator configuration, read from `OPERATOR_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Namespace watched for instances and holding their resources
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,

    /// Server-side watch timeout, capped at 290
    #[serde(default = "default_watch_timeout")]
    pub watch_timeout_secs: u32,

    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,

    /// Prometheus base URL for job figures; unset disables the collector
    #[serde(default)]
    pub prometheus_url: Option<String>,
}

fn default_namespace() -> String {
    "stable-diffusion-multiplayer".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_reconnect_delay() -> u64 {
    10
}

fn default_watch_timeout() -> u32 {
    290
}

fn default_monitor_interval() -> u64 {
    30
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            api_port: default_api_port(),
            reconnect_delay_secs: default_reconnect_delay(),
            watch_timeout_secs: default_watch_timeout(),
            monitor_interval_secs: default_monitor_interval(),
            prometheus_url: None,
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration from an explicit variable map instead of the
    /// process environment
    pub fn load_from(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("OPERATOR")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn watcher_config(&self) -> WatcherConfig {
        WatcherConfig {
            reconnect_delay: Duration::from_secs(self.reconnect_delay_secs),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(self.monitor_interval_secs.max(1)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_unset() {
        let config = OperatorConfig::load_from(Some(HashMap::new())).unwrap();

        assert_eq!(config.namespace, "stable-diffusion-multiplayer");
        assert_eq!(config.api_port, 8080);
        assert_eq!(config.reconnect_delay_secs, 10);
        assert_eq!(config.watch_timeout_secs, 290);
        assert_eq!(config.monitor_interval_secs, 30);
        assert!(config.prometheus_url.is_none());
    }

    #[test]
    fn test_environment_overrides() {
        let vars = HashMap::from([
            ("OPERATOR_NAMESPACE".to_string(), "canvas".to_string()),
            ("OPERATOR_API_PORT".to_string(), "9000".to_string()),
            ("OPERATOR_MONITOR_INTERVAL_SECS".to_string(), "5".to_string()),
            (
                "OPERATOR_PROMETHEUS_URL".to_string(),
                "http://prometheus:9090".to_string(),
            ),
        ]);
        let config = OperatorConfig::load_from(Some(vars)).unwrap();

        assert_eq!(config.namespace, "canvas");
        assert_eq!(config.api_port, 9000);
        assert_eq!(config.monitor_config().interval, Duration::from_secs(5));
        assert_eq!(config.prometheus_url.as_deref(), Some("http://prometheus:9090"));
    }

    #[test]
    fn test_loop_configs() {
        let config = OperatorConfig::default();
        assert_eq!(
            config.watcher_config().reconnect_delay,
            Duration::from_secs(10)
        );
        assert_eq!(config.monitor_config().interval, Duration::from_secs(30));
    }
}
