//! Job figures from an external metrics collector
//!
//! Active-job and queue-length numbers are advisory: they feed the status
//! counters but never a scaling decision.

use crate::models::JobMetrics;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[async_trait]
pub trait JobMetricsSource: Send + Sync {
    async fn job_metrics(&self, instance: &str) -> Result<JobMetrics>;
}

/// Reports fixed figures; used when no collector is configured
#[derive(Debug, Clone, Default)]
pub struct StaticJobSource {
    metrics: JobMetrics,
}

impl StaticJobSource {
    pub fn new(metrics: JobMetrics) -> Self {
        Self { metrics }
    }
}

#[async_trait]
impl JobMetricsSource for StaticJobSource {
    async fn job_metrics(&self, _instance: &str) -> Result<JobMetrics> {
        Ok(self.metrics)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    data: Option<QueryData>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    result: Vec<VectorSample>,
}

#[derive(Debug, Deserialize)]
struct VectorSample {
    /// `[unix_timestamp, "value"]`
    value: (f64, String),
}

/// Queries the Prometheus HTTP API for `sd_active_jobs` and `sd_queue_length`
pub struct PrometheusJobSource {
    client: Client,
    query_url: Url,
}

impl PrometheusJobSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid Prometheus URL")?;
        let query_url = base_url
            .join("api/v1/query")
            .context("Invalid Prometheus URL")?;

        Ok(Self { client, query_url })
    }

    fn url_for(&self, query: &str) -> Url {
        let mut url = self.query_url.clone();
        url.query_pairs_mut().append_pair("query", query);
        url
    }

    async fn scalar(&self, query: &str) -> Result<u64> {
        let response = self
            .client
            .get(self.url_for(query))
            .send()
            .await
            .context("Failed to query Prometheus")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Prometheus error ({}): {}", status, body);
        }

        let body = response.text().await.context("Failed to read response")?;
        parse_scalar(&body)
    }
}

#[async_trait]
impl JobMetricsSource for PrometheusJobSource {
    async fn job_metrics(&self, instance: &str) -> Result<JobMetrics> {
        let active_jobs = self.scalar(&active_jobs_query(instance)).await?;
        let queue_length = self.scalar(&queue_length_query(instance)).await?;
        Ok(JobMetrics {
            active_jobs,
            queue_length,
        })
    }
}

fn active_jobs_query(instance: &str) -> String {
    format!("sum(sd_active_jobs{{instance=\"{}\"}})", instance)
}

fn queue_length_query(instance: &str) -> String {
    format!("sum(sd_queue_length{{instance=\"{}\"}})", instance)
}

/// First sample of an instant vector, truncated; no samples reads as zero
fn parse_scalar(body: &str) -> Result<u64> {
    let response: QueryResponse =
        serde_json::from_str(body).context("Failed to parse Prometheus response")?;

    if response.status != "success" {
        anyhow::bail!(
            "Prometheus query failed: {}",
            response.error.unwrap_or_default()
        );
    }

    let Some(sample) = response.data.and_then(|d| d.result.into_iter().next()) else {
        return Ok(0);
    };
    let value: f64 = sample
        .value
        .1
        .parse()
        .context("Non-numeric sample value")?;

    if value.is_finite() && value > 0.0 {
        Ok(value as u64)
    } else {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queries_select_instance() {
        assert_eq!(
            active_jobs_query("room1"),
            r#"sum(sd_active_jobs{instance="room1"})"#
        );
        assert_eq!(
            queue_length_query("room1"),
            r#"sum(sd_queue_length{instance="room1"})"#
        );
    }

    #[test]
    fn test_query_url_is_encoded() {
        let source = PrometheusJobSource::new("http://prometheus:9090/").unwrap();
        let url = source.url_for(&active_jobs_query("room1"));

        assert_eq!(url.path(), "/api/v1/query");
        let (key, value) = url.query_pairs().next().unwrap();
        assert_eq!(key, "query");
        assert_eq!(value, r#"sum(sd_active_jobs{instance="room1"})"#);
    }

    #[test]
    fn test_parse_vector_result() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[{"metric":{},"value":[1700000000.5,"3"]}]}}"#;
        assert_eq!(parse_scalar(body).unwrap(), 3);
    }

    #[test]
    fn test_parse_empty_result_is_zero() {
        let body = r#"{"status":"success","data":{"resultType":"vector","result":[]}}"#;
        assert_eq!(parse_scalar(body).unwrap(), 0);
    }

    #[test]
    fn test_parse_error_status() {
        let body = r#"{"status":"error","errorType":"bad_data","error":"parse error"}"#;
        let err = parse_scalar(body).unwrap_err();
        assert!(err.to_string().contains("parse error"));
    }

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticJobSource::new(JobMetrics {
            active_jobs: 2,
            queue_length: 5,
        });
        let metrics = source.job_metrics("any").await.unwrap();
        assert_eq!(metrics.active_jobs, 2);
        assert_eq!(metrics.queue_length, 5);
    }
}
