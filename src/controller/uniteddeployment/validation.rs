use crate::controller::allocation::allocate_replicas;
use crate::crd::defaults::apply_defaults;
use crate::crd::UnitedDeployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet};

/// Validate UnitedDeployment specification
///
/// Validates runtime constraints that cannot be enforced via CRD schema.
/// Used by both the reconcile loop (runtime) and the validating webhook (admission).
///
/// # Validation Rules
/// - `spec.replicas` must be >= 0
/// - `spec.revisionHistoryLimit` must be >= 0
/// - pool names must be non-empty, unique DNS labels
/// - a pool declares at most one of `weight` / `replicas`, neither negative
/// - fixed pool replicas must fit into `spec.replicas`
/// - `manualUpdate.partitions` and `canaryUpdate.subsetRollCounts` may only
///   name declared pools
/// - `canaryUpdate.rollCount` must be > 0, `bakeTimeSeconds` >= 0
/// - `spec.selector` must be non-empty and match the template labels
///
/// # Returns
/// * `Ok(())` - Validation passed
/// * `Err(String)` - Validation error message
pub fn validate(ud: &UnitedDeployment) -> Result<(), String> {
    let spec = &ud.spec;

    if spec.replicas < 0 {
        return Err(format!("spec.replicas must be >= 0, got {}", spec.replicas));
    }

    if spec.revision_history_limit < 0 {
        return Err(format!(
            "spec.revisionHistoryLimit must be >= 0, got {}",
            spec.revision_history_limit
        ));
    }

    let mut pools = BTreeSet::new();
    for (i, subset) in spec.topology.subsets.iter().enumerate() {
        if subset.name.is_empty() {
            return Err(format!("topology.subsets[{}].name cannot be empty", i));
        }
        if !is_dns_label(&subset.name) {
            return Err(format!(
                "topology.subsets[{}].name '{}' must be a lowercase DNS label",
                i, subset.name
            ));
        }
        if !pools.insert(subset.name.as_str()) {
            return Err(format!(
                "topology.subsets[{}].name '{}' is declared more than once",
                i, subset.name
            ));
        }
        if subset.weight.is_some() && subset.replicas.is_some() {
            return Err(format!(
                "subset '{}' cannot declare both weight and replicas",
                subset.name
            ));
        }
        if let Some(weight) = subset.weight.filter(|w| *w < 0) {
            return Err(format!(
                "subset '{}' weight must be >= 0, got {}",
                subset.name, weight
            ));
        }
        if let Some(replicas) = subset.replicas.filter(|r| *r < 0) {
            return Err(format!(
                "subset '{}' replicas must be >= 0, got {}",
                subset.name, replicas
            ));
        }
    }

    if let Some(manual) = &spec.update_strategy.manual_update {
        for (pool, partition) in &manual.partitions {
            if !pools.contains(pool.as_str()) {
                return Err(format!(
                    "updateStrategy.manualUpdate.partitions names unknown subset '{}'",
                    pool
                ));
            }
            if *partition < 0 {
                return Err(format!(
                    "updateStrategy.manualUpdate.partitions[{}] must be >= 0, got {}",
                    pool, partition
                ));
            }
        }
    }

    if let Some(canary) = &spec.update_strategy.canary_update {
        if canary.roll_count <= 0 {
            return Err(format!(
                "updateStrategy.canaryUpdate.rollCount must be > 0, got {}",
                canary.roll_count
            ));
        }
        if canary.bake_time_seconds < 0 {
            return Err(format!(
                "updateStrategy.canaryUpdate.bakeTimeSeconds must be >= 0, got {}",
                canary.bake_time_seconds
            ));
        }
        for (pool, count) in &canary.subset_roll_counts {
            if !pools.contains(pool.as_str()) {
                return Err(format!(
                    "updateStrategy.canaryUpdate.subsetRollCounts names unknown subset '{}'",
                    pool
                ));
            }
            if *count <= 0 {
                return Err(format!(
                    "updateStrategy.canaryUpdate.subsetRollCounts[{}] must be > 0, got {}",
                    pool, count
                ));
            }
        }
        if let Some(analysis) = &canary.analysis {
            for (i, metric) in analysis.metrics.iter().enumerate() {
                if metric.name.is_empty() {
                    return Err(format!("analysis.metrics[{}].name cannot be empty", i));
                }
            }
        }
    }

    let template_labels = spec
        .template
        .metadata
        .as_ref()
        .and_then(|m| m.labels.clone())
        .unwrap_or_default();
    validate_selector(&spec.selector, &template_labels)?;

    let mut defaulted = spec.clone();
    apply_defaults(&mut defaulted);
    allocate_replicas(defaulted.replicas, &defaulted.topology.subsets)
        .map_err(|e| format!("topology: {}", e))?;

    Ok(())
}

fn validate_selector(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<(), String> {
    let match_labels = selector.match_labels.clone().unwrap_or_default();
    let expressions = selector.match_expressions.clone().unwrap_or_default();

    if match_labels.is_empty() && expressions.is_empty() {
        return Err("spec.selector cannot be empty".to_string());
    }

    for (key, value) in &match_labels {
        if labels.get(key) != Some(value) {
            return Err(format!(
                "spec.selector label {}={} does not match the template labels",
                key, value
            ));
        }
    }

    for expr in &expressions {
        let values = expr.values.clone().unwrap_or_default();
        let current = labels.get(&expr.key);
        let matched = match expr.operator.as_str() {
            "In" => current.is_some_and(|v| values.contains(v)),
            "NotIn" => current.is_none_or(|v| !values.contains(v)),
            "Exists" => current.is_some(),
            "DoesNotExist" => current.is_none(),
            other => {
                return Err(format!(
                    "spec.selector operator '{}' is not supported",
                    other
                ))
            }
        };
        if !matched {
            return Err(format!(
                "spec.selector expression on '{}' does not match the template labels",
                expr.key
            ));
        }
    }

    Ok(())
}

/// RFC 1123 label: lowercase alphanumerics and '-', alphanumeric at both ends
fn is_dns_label(name: &str) -> bool {
    let bytes = name.as_bytes();
    let edge_ok = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();

    name.len() <= 63
        && bytes.first().is_some_and(edge_ok)
        && bytes.last().is_some_and(edge_ok)
        && bytes.iter().all(|b| edge_ok(b) || *b == b'-')
}
