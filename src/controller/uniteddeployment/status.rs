use crate::controller::subset::Subset;
use crate::crd::{
    ConditionStatus, ConditionType, SubsetStatus, UnitedDeploymentCondition,
    UnitedDeploymentStatus,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;

/// Requeue interval once there is nothing left to drive
pub const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue interval for a spec that failed validation
pub const INVALID_SPEC_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue interval while a manual rollout waits for subsets to report updated pods
pub const MANUAL_PROGRESS_REQUEUE: Duration = Duration::from_secs(30);

/// First retry delay after a transient error
pub const BACKOFF_BASE: Duration = Duration::from_secs(5);

/// Upper bound for error backoff
pub const BACKOFF_MAX: Duration = Duration::from_secs(300);

/// Retry delay after `failures` consecutive errors of the same key
///
/// 5s, 10s, 20s, ... capped at 5 minutes.
pub fn backoff_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    BACKOFF_BASE
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX)
}

/// Everything the aggregate status is computed from
pub struct StatusInputs<'a> {
    pub generation: Option<i64>,
    /// Desired replicas per pool
    pub plan: &'a BTreeMap<String, i32>,
    /// Desired partitions per pool, reported only for pools with no object
    pub partitions: &'a BTreeMap<String, i32>,
    /// Observed subsets; pools without an object count as empty
    pub subsets: &'a [Subset],
    pub current_revision: &'a str,
    pub update_revision: &'a str,
    pub collision_count: i32,
}

/// Fold observed subsets into the aggregate counters
///
/// Only replicas of subsets labelled with the update revision count as
/// updated. Conditions are carried over from `previous` untouched.
pub fn aggregate_status(
    inputs: &StatusInputs<'_>,
    previous: Option<&UnitedDeploymentStatus>,
) -> UnitedDeploymentStatus {
    let mut status = UnitedDeploymentStatus {
        observed_generation: inputs.generation,
        current_revision: Some(inputs.current_revision.to_string()),
        update_revision: Some(inputs.update_revision.to_string()),
        collision_count: Some(inputs.collision_count),
        subset_replicas: inputs.plan.clone(),
        conditions: previous.map(|s| s.conditions.clone()).unwrap_or_default(),
        ..Default::default()
    };

    for (pool, replicas) in inputs.plan {
        let observed = inputs.subsets.iter().find(|s| &s.pool == pool);
        let counts = observed.map(|s| s.observed).unwrap_or_default();
        let on_update = observed
            .and_then(|s| s.revision.as_deref())
            .is_some_and(|rev| rev == inputs.update_revision);

        status.replicas += counts.replicas;
        status.ready_replicas += counts.ready_replicas;
        if on_update {
            status.updated_replicas += counts.updated_replicas;
            status.updated_ready_replicas += counts.updated_ready_replicas;
        }

        status.subsets.push(SubsetStatus {
            name: pool.clone(),
            kind: observed.map(|s| s.kind).unwrap_or_default(),
            replicas: *replicas,
            // what the object runs with; the plan only stands in for a missing object
            partition: observed
                .map(|s| s.partition)
                .or_else(|| inputs.partitions.get(pool).copied())
                .unwrap_or(*replicas),
            observed_replicas: counts.replicas,
            ready_replicas: counts.ready_replicas,
            updated_replicas: if on_update { counts.updated_replicas } else { 0 },
            revision: observed.and_then(|s| s.revision.clone()),
        });
    }

    status
}

/// True when every planned pool runs all of its replicas on `update_revision`
pub fn all_subsets_updated(
    plan: &BTreeMap<String, i32>,
    subsets: &[Subset],
    update_revision: &str,
) -> bool {
    plan.iter().all(|(pool, replicas)| {
        subsets.iter().any(|s| {
            &s.pool == pool
                && s.revision.as_deref() == Some(update_revision)
                && s.partition == 0
                && s.observed.updated_replicas >= *replicas
        })
    })
}

/// Set a condition, keeping `lastTransitionTime` unless the status flips
pub fn set_condition(
    status: &mut UnitedDeploymentStatus,
    type_: ConditionType,
    value: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    now: DateTime<Utc>,
) {
    let message = message.into();
    let message = (!message.is_empty()).then_some(message);

    match status.conditions.iter_mut().find(|c| c.type_ == type_) {
        Some(existing) => {
            if existing.status != value {
                existing.last_transition_time = Some(now.to_rfc3339());
            }
            existing.status = value;
            existing.reason = Some(reason.to_string());
            existing.message = message;
        }
        None => status.conditions.push(UnitedDeploymentCondition {
            type_,
            status: value,
            reason: Some(reason.to_string()),
            message,
            last_transition_time: Some(now.to_rfc3339()),
        }),
    }
}

pub fn condition_status(value: bool) -> ConditionStatus {
    if value {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    }
}
