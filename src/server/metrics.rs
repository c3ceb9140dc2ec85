//! Prometheus metrics for the UnitedDeployment controller
//!
//! Exposed on `/metrics` by the health server:
//! - `united_reconciliations_total{result, strategy}`
//! - `united_reconciliation_duration_seconds{strategy}`
//! - `united_subset_partition{namespace, united_deployment, subset}`
//! - `united_revision_collisions_total{namespace, united_deployment}`
//! - `united_analysis_total{result}`

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

const NAMESPACE: &str = "united";

/// Buckets tuned for reconciles that mostly finish well under a second
const DURATION_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];

/// Controller metrics backed by a private registry
pub struct ControllerMetrics {
    registry: Registry,
    reconciliations_total: IntCounterVec,
    reconciliation_duration: HistogramVec,
    subset_partition: IntGaugeVec,
    revision_collisions_total: IntCounterVec,
    analysis_total: IntCounterVec,
}

impl ControllerMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations_total = IntCounterVec::new(
            Opts::new(
                "reconciliations_total",
                "Reconciliations grouped by result and rollout strategy",
            )
            .namespace(NAMESPACE),
            &["result", "strategy"],
        )?;
        let reconciliation_duration = HistogramVec::new(
            HistogramOpts::new(
                "reconciliation_duration_seconds",
                "Time spent in a single reconcile",
            )
            .namespace(NAMESPACE)
            .buckets(DURATION_BUCKETS.to_vec()),
            &["strategy"],
        )?;
        let subset_partition = IntGaugeVec::new(
            Opts::new(
                "subset_partition",
                "Partition last applied to each subset workload",
            )
            .namespace(NAMESPACE),
            &["namespace", "united_deployment", "subset"],
        )?;
        let revision_collisions_total = IntCounterVec::new(
            Opts::new(
                "revision_collisions_total",
                "Revision hash collisions resolved by bumping collisionCount",
            )
            .namespace(NAMESPACE),
            &["namespace", "united_deployment"],
        )?;
        let analysis_total = IntCounterVec::new(
            Opts::new("analysis_total", "Canary analysis gate outcomes").namespace(NAMESPACE),
            &["result"],
        )?;

        registry.register(Box::new(reconciliations_total.clone()))?;
        registry.register(Box::new(reconciliation_duration.clone()))?;
        registry.register(Box::new(subset_partition.clone()))?;
        registry.register(Box::new(revision_collisions_total.clone()))?;
        registry.register(Box::new(analysis_total.clone()))?;

        Ok(Self {
            registry,
            reconciliations_total,
            reconciliation_duration,
            subset_partition,
            revision_collisions_total,
            analysis_total,
        })
    }

    pub fn record_reconciliation_success(&self, strategy: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["success", strategy])
            .inc();
        self.reconciliation_duration
            .with_label_values(&[strategy])
            .observe(duration_secs);
    }

    /// Errors are counted without a duration sample when none is known (0.0)
    pub fn record_reconciliation_error(&self, strategy: &str, duration_secs: f64) {
        self.reconciliations_total
            .with_label_values(&["error", strategy])
            .inc();
        if duration_secs > 0.0 {
            self.reconciliation_duration
                .with_label_values(&[strategy])
                .observe(duration_secs);
        }
    }

    /// Reconcile skipped because this replica does not hold the lease
    pub fn record_reconciliation_skipped(&self) {
        self.reconciliations_total
            .with_label_values(&["skipped", "none"])
            .inc();
    }

    pub fn set_subset_partition(&self, namespace: &str, name: &str, subset: &str, partition: i64) {
        self.subset_partition
            .with_label_values(&[namespace, name, subset])
            .set(partition);
    }

    pub fn record_revision_collision(&self, namespace: &str, name: &str) {
        self.revision_collisions_total
            .with_label_values(&[namespace, name])
            .inc();
    }

    /// `result` is "pass" or "fail"
    pub fn record_analysis(&self, result: &str) {
        self.analysis_total.with_label_values(&[result]).inc();
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

pub type SharedMetrics = Arc<ControllerMetrics>;

pub fn create_metrics() -> Result<SharedMetrics, prometheus::Error> {
    ControllerMetrics::new().map(Arc::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciliation_counters_are_encoded() {
        let metrics = create_metrics().unwrap();
        metrics.record_reconciliation_success("canary", 0.2);
        metrics.record_reconciliation_success("canary", 0.3);
        metrics.record_reconciliation_error("manual", 0.0);
        metrics.record_reconciliation_skipped();

        let body = metrics.encode().unwrap();
        assert!(body
            .contains(r#"united_reconciliations_total{result="success",strategy="canary"} 2"#));
        assert!(
            body.contains(r#"united_reconciliations_total{result="error",strategy="manual"} 1"#)
        );
        assert!(
            body.contains(r#"united_reconciliations_total{result="skipped",strategy="none"} 1"#)
        );
        assert!(body.contains(r#"united_reconciliation_duration_seconds_count{strategy="canary"} 2"#));
        assert!(!body.contains(r#"united_reconciliation_duration_seconds_count{strategy="manual"}"#));
    }

    #[test]
    fn test_subset_partition_gauge_overwrites() {
        let metrics = create_metrics().unwrap();
        metrics.set_subset_partition("default", "web", "zone-a", 4);
        metrics.set_subset_partition("default", "web", "zone-a", 1);

        let body = metrics.encode().unwrap();
        assert!(body.contains(
            r#"united_subset_partition{namespace="default",subset="zone-a",united_deployment="web"} 1"#
        ));
    }

    #[test]
    fn test_collision_and_analysis_counters() {
        let metrics = create_metrics().unwrap();
        metrics.record_revision_collision("default", "web");
        metrics.record_analysis("pass");
        metrics.record_analysis("fail");
        metrics.record_analysis("fail");

        let body = metrics.encode().unwrap();
        assert!(body.contains(
            r#"united_revision_collisions_total{namespace="default",united_deployment="web"} 1"#
        ));
        assert!(body.contains(r#"united_analysis_total{result="fail"} 2"#));
        assert!(body.contains(r#"united_analysis_total{result="pass"} 1"#));
    }

    #[test]
    fn test_registries_are_independent() {
        let first = create_metrics().unwrap();
        let second = create_metrics().unwrap();
        first.record_analysis("pass");

        assert!(!second.encode().unwrap().contains("united_analysis_total{"));
    }
}
