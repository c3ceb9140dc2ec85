//! Post-bake analysis gate for canary rollouts
//!
//! - `AnalysisGate` trait consulted after every bake period
//! - `PrometheusGate` queries Prometheus and compares against thresholds
//! - `ScriptedAnalysisGate` for tests
//!
//! A metric passes when its value is at or below the threshold.

use crate::crd::{AnalysisConfig, MetricConfig, Strategy, UnitedDeployment};
use async_trait::async_trait;
use kube::ResourceExt;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("Prometheus HTTP error: {0}")]
    HttpError(String),

    #[error("metric {0} has no query and no built-in template")]
    UnknownMetric(String),

    #[error("no Prometheus address configured")]
    NoAddress,

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No data returned from Prometheus")]
    NoData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisVerdict {
    pub passed: bool,
    pub message: String,
}

impl AnalysisVerdict {
    pub fn pass(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait AnalysisGate: Send + Sync {
    /// Judge the revision currently being rolled out
    async fn analyze(
        &self,
        ud: &UnitedDeployment,
        revision: &str,
    ) -> Result<AnalysisVerdict, AnalysisError>;
}

/// Analysis block of the canary strategy, if any
pub fn analysis_config(ud: &UnitedDeployment) -> Option<AnalysisConfig> {
    match ud.spec.update_strategy.resolve() {
        Strategy::Canary(canary) => canary.analysis,
        Strategy::Manual(_) => None,
    }
}

/// Build PromQL query for error rate metric
///
/// Calculates: (5xx errors / total requests) * 100
fn build_error_rate_query(ud_name: &str, revision: &str) -> String {
    format!(
        r#"sum(rate(http_requests_total{{status=~"5..",united_deployment="{}",revision="{}"}}[2m])) / sum(rate(http_requests_total{{united_deployment="{}",revision="{}"}}[2m])) * 100"#,
        ud_name, revision, ud_name, revision
    )
}

/// Build PromQL query for latency p95 metric
fn build_latency_p95_query(ud_name: &str, revision: &str) -> String {
    format!(
        r#"histogram_quantile(0.95, rate(http_request_duration_seconds_bucket{{united_deployment="{}",revision="{}"}}[2m]))"#,
        ud_name, revision
    )
}

/// Query for a metric: explicit query wins, otherwise a named template
///
/// `$name` and `$revision` in an explicit query are substituted.
pub fn resolve_query(
    metric: &MetricConfig,
    ud_name: &str,
    revision: &str,
) -> Result<String, AnalysisError> {
    if let Some(query) = &metric.query {
        return Ok(query
            .replace("$name", ud_name)
            .replace("$revision", revision));
    }
    match metric.name.as_str() {
        "error-rate" => Ok(build_error_rate_query(ud_name, revision)),
        "latency-p95" => Ok(build_latency_p95_query(ud_name, revision)),
        other => Err(AnalysisError::UnknownMetric(other.to_string())),
    }
}

/// Prometheus instant query response format
#[derive(Debug, Deserialize)]
struct PrometheusResponse {
    status: String,
    data: PrometheusData,
}

#[derive(Debug, Deserialize)]
struct PrometheusData {
    result: Vec<PrometheusResult>,
}

#[derive(Debug, Deserialize)]
struct PrometheusResult {
    value: (f64, String), // [timestamp, value_as_string]
}

/// Extract the first sample of a /api/v1/query response
fn parse_prometheus_instant_query(json_response: &str) -> Result<f64, AnalysisError> {
    let response: PrometheusResponse = serde_json::from_str(json_response)
        .map_err(|e| AnalysisError::ParseError(format!("Invalid JSON: {}", e)))?;

    if response.status != "success" {
        return Err(AnalysisError::HttpError(format!(
            "Prometheus query failed with status: {}",
            response.status
        )));
    }

    let result = response.data.result.first().ok_or(AnalysisError::NoData)?;

    result
        .value
        .1
        .parse::<f64>()
        .map_err(|e| AnalysisError::ParseError(format!("Invalid value: {}", e)))
}

/// Gate backed by a Prometheus server
///
/// The address comes from the UnitedDeployment's analysis config, falling
/// back to the controller-wide default.
pub struct PrometheusGate {
    client: reqwest::Client,
    default_address: Option<String>,
}

impl PrometheusGate {
    pub fn new(default_address: Option<String>, timeout: Duration) -> Self {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Failed to build Prometheus HTTP client, using default");
                reqwest::Client::new()
            }
        };
        Self {
            client,
            default_address,
        }
    }

    async fn query(&self, address: &str, query: &str) -> Result<f64, AnalysisError> {
        let url = format!("{}/api/v1/query", address.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .query(&[("query", query)])
            .send()
            .await
            .map_err(|e| AnalysisError::HttpError(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AnalysisError::HttpError(e.to_string()))?;
        if !status.is_success() {
            return Err(AnalysisError::HttpError(format!(
                "HTTP {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        parse_prometheus_instant_query(&body)
    }
}

#[async_trait]
impl AnalysisGate for PrometheusGate {
    async fn analyze(
        &self,
        ud: &UnitedDeployment,
        revision: &str,
    ) -> Result<AnalysisVerdict, AnalysisError> {
        let Some(config) = analysis_config(ud) else {
            return Ok(AnalysisVerdict::pass("no analysis configured"));
        };
        if config.metrics.is_empty() {
            return Ok(AnalysisVerdict::pass("no metrics configured"));
        }

        let address = config
            .prometheus
            .as_ref()
            .and_then(|p| p.address.clone())
            .or_else(|| self.default_address.clone())
            .ok_or(AnalysisError::NoAddress)?;

        let name = ud.name_any();
        for metric in &config.metrics {
            let query = resolve_query(metric, &name, revision)?;
            let value = self.query(&address, &query).await?;
            debug!(
                united_deployment = %name,
                metric = %metric.name,
                value,
                threshold = metric.threshold,
                "Evaluated analysis metric"
            );
            if value > metric.threshold {
                return Ok(AnalysisVerdict::fail(format!(
                    "metric {} = {} exceeds threshold {}",
                    metric.name, value, metric.threshold
                )));
            }
        }

        Ok(AnalysisVerdict::pass(format!(
            "{} metric(s) within threshold",
            config.metrics.len()
        )))
    }
}

/// Gate returning queued verdicts in order, then passing
#[cfg(test)]
#[derive(Default, Clone)]
pub struct ScriptedAnalysisGate {
    script: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Result<bool, String>>>>,
    calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl ScriptedAnalysisGate {
    pub fn new(script: Vec<Result<bool, String>>) -> Self {
        Self {
            script: std::sync::Arc::new(std::sync::Mutex::new(script.into())),
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl AnalysisGate for ScriptedAnalysisGate {
    async fn analyze(
        &self,
        _ud: &UnitedDeployment,
        _revision: &str,
    ) -> Result<AnalysisVerdict, AnalysisError> {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        match self.script.lock().unwrap().pop_front() {
            None | Some(Ok(true)) => Ok(AnalysisVerdict::pass("scripted pass")),
            Some(Ok(false)) => Ok(AnalysisVerdict::fail("scripted failure")),
            Some(Err(message)) => Err(AnalysisError::HttpError(message)),
        }
    }
}
