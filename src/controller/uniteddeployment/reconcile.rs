use crate::controller::allocation::{
    allocate_replicas, clamp_partition, manual_partitions, settled_partitions, AllocationError,
};
use crate::controller::analysis::{analysis_config, AnalysisGate};
use crate::controller::canary::{
    ApplyReport, CanaryController, CanaryState, DecrementPolicy, PartitionApplier, StepAction,
    APPLY_RETRY_DELAY,
};
use crate::controller::clock::Clock;
use crate::controller::events::{
    ControllerEvent, EventRecorder, REASON_INVALID_SPEC, REASON_REVISION_CREATED,
    REASON_SUBSET_APPLY_FAILED, REASON_SUBSET_CREATED, REASON_SUBSET_DELETED,
};
use crate::controller::revision::{
    get_or_create_revision, prune, resolve_current_revision, RevisionError, RevisionStore,
};
use crate::controller::store::{write_status, StoreError, UnitedDeploymentStore};
use crate::controller::subset::{
    subset_object_name, ApplyOutcome, Subset, SubsetControls, SubsetError, SubsetTarget,
};
use crate::crd::defaults::apply_defaults;
use crate::crd::{
    ConditionStatus, ConditionType, FailurePolicy, RolloutPhase, Strategy, SubsetDeclaration,
    UnitedDeployment,
};
use crate::server::{LeaderState, SharedMetrics};
use async_trait::async_trait;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::status::{
    aggregate_status, all_subsets_updated, backoff_delay, condition_status, set_condition,
    StatusInputs, INVALID_SPEC_REQUEUE, MANUAL_PROGRESS_REQUEUE, STEADY_STATE_REQUEUE,
};
use super::validation::validate;

/// Requeue interval for a replica that is not the leader
const NOT_LEADER_REQUEUE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("UnitedDeployment missing namespace")]
    MissingNamespace,

    #[error("Status write conflict: {0}")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Revision error: {0}")]
    Revision(#[from] RevisionError),

    #[error("Subset error: {0}")]
    Subset(#[from] SubsetError),

    #[error("Allocation error: {0}")]
    Allocation(#[from] AllocationError),
}

impl From<StoreError> for ReconcileError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(message) => ReconcileError::Conflict(message),
            other => ReconcileError::Store(other),
        }
    }
}

impl ReconcileError {
    /// Transient errors are retried with backoff; the rest wait for a spec change
    pub fn is_transient(&self) -> bool {
        match self {
            ReconcileError::Conflict(_) => true,
            ReconcileError::Store(e) => e.is_transient(),
            ReconcileError::Revision(e) => e.is_transient(),
            ReconcileError::Subset(e) => e.is_transient(),
            ReconcileError::MissingNamespace | ReconcileError::Allocation(_) => false,
        }
    }
}

pub struct Context {
    pub store: Arc<dyn UnitedDeploymentStore>,
    pub revisions: Arc<dyn RevisionStore>,
    /// Per-kind subset controls, built once at startup
    pub subsets: SubsetControls,
    pub gate: Arc<dyn AnalysisGate>,
    pub events: Arc<dyn EventRecorder>,
    pub clock: Arc<dyn Clock>,
    /// Optional leader state for multi-replica deployments
    /// When Some, reconciliation is skipped if not the leader
    pub leader_state: Option<LeaderState>,
    /// Optional controller metrics for Prometheus
    pub metrics: Option<SharedMetrics>,
    /// Consecutive failures per object key, drives error backoff
    failures: Mutex<HashMap<String, u32>>,
}

impl Context {
    pub fn new(
        store: Arc<dyn UnitedDeploymentStore>,
        revisions: Arc<dyn RevisionStore>,
        subsets: SubsetControls,
        gate: Arc<dyn AnalysisGate>,
        events: Arc<dyn EventRecorder>,
        clock: Arc<dyn Clock>,
        metrics: Option<SharedMetrics>,
    ) -> Self {
        Context {
            store,
            revisions,
            subsets,
            gate,
            events,
            clock,
            leader_state: None,
            metrics,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Only reconcile while `leader_state` says this replica leads
    pub fn with_leader(mut self, leader_state: LeaderState) -> Self {
        self.leader_state = Some(leader_state);
        self
    }

    /// Check if this instance should reconcile
    ///
    /// Returns true if:
    /// - No leader election configured (single instance mode)
    /// - Leader election enabled and this instance is the leader
    pub fn should_reconcile(&self) -> bool {
        match &self.leader_state {
            None => true,
            Some(state) => state.is_leader(),
        }
    }

    /// Count one more failure for `key`, returning the new streak length
    pub fn record_failure(&self, key: &str) -> u32 {
        match self.failures.lock() {
            Ok(mut failures) => {
                let count = failures.entry(key.to_string()).or_insert(0);
                *count = count.saturating_add(1);
                *count
            }
            Err(_) => 1,
        }
    }

    pub fn reset_failures(&self, key: &str) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.remove(key);
        }
    }
}

fn object_key(ud: &UnitedDeployment) -> String {
    format!("{}/{}", ud.namespace().unwrap_or_default(), ud.name_any())
}

/// Reconcile a UnitedDeployment resource
///
/// Wraps [`reconcile_once`] with leader gating, metrics and the failure
/// streak bookkeeping used by [`error_policy`].
pub async fn reconcile(
    ud: Arc<UnitedDeployment>,
    ctx: Arc<Context>,
) -> Result<Action, ReconcileError> {
    if !ctx.should_reconcile() {
        debug!(united_deployment = %ud.name_any(), "Skipping reconciliation - not leader");
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_reconciliation_skipped();
        }
        return Ok(Action::requeue(NOT_LEADER_REQUEUE));
    }

    let start = Instant::now();
    let action = reconcile_once(&ud, &ctx).await?;

    ctx.reset_failures(&object_key(&ud));
    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_success(
            ud.spec.update_strategy.resolve().name(),
            start.elapsed().as_secs_f64(),
        );
    }
    Ok(action)
}

/// Error policy for the controller
///
/// Transient errors back off exponentially per object (5s doubling, capped
/// at 5 minutes); anything else waits for the slow requeue.
pub fn error_policy(
    ud: Arc<UnitedDeployment>,
    error: &ReconcileError,
    ctx: Arc<Context>,
) -> Action {
    if let Some(ref metrics) = ctx.metrics {
        metrics.record_reconciliation_error(ud.spec.update_strategy.resolve().name(), 0.0);
    }

    if !error.is_transient() {
        warn!(united_deployment = %ud.name_any(), error = %error, "Reconcile failed");
        return Action::requeue(STEADY_STATE_REQUEUE);
    }

    let failures = ctx.record_failure(&object_key(&ud));
    let delay = backoff_delay(failures);
    warn!(
        united_deployment = %ud.name_any(),
        error = %error,
        failures,
        retry_in = ?delay,
        "Reconcile error (will retry)"
    );
    Action::requeue(delay)
}

async fn publish(ctx: &Context, ud: &UnitedDeployment, event: ControllerEvent) {
    let reason = event.reason.clone();
    if let Err(e) = ctx.events.record(ud, event).await {
        warn!(
            united_deployment = %ud.name_any(),
            reason = %reason,
            error = %e,
            "Failed to publish event"
        );
    }
}

/// Applies partitions to subsets through the per-kind controls
struct SubsetApplier<'a> {
    ud: &'a UnitedDeployment,
    controls: &'a SubsetControls,
    declarations: &'a BTreeMap<String, SubsetDeclaration>,
    plan: &'a BTreeMap<String, i32>,
    revision: &'a str,
    created: Mutex<Vec<String>>,
    last_report: Mutex<ApplyReport>,
}

impl SubsetApplier<'_> {
    /// Pools whose object was created by this applier
    fn created(&self) -> Vec<String> {
        self.created
            .lock()
            .map(|created| created.clone())
            .unwrap_or_default()
    }

    fn last_report(&self) -> ApplyReport {
        self.last_report
            .lock()
            .map(|report| report.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PartitionApplier for SubsetApplier<'_> {
    async fn apply_partitions(&self, partitions: &BTreeMap<String, i32>) -> ApplyReport {
        let mut report = ApplyReport::default();

        for (pool, partition) in partitions {
            let Some(declaration) = self.declarations.get(pool) else {
                continue;
            };
            let replicas = self.plan.get(pool).copied().unwrap_or(0);
            let target = SubsetTarget {
                declaration: declaration.clone(),
                replicas,
                partition: clamp_partition(*partition, replicas),
            };

            let result = match self.controls.get(target.kind()) {
                Ok(control) => control.apply_subset(self.ud, &target, self.revision).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(ApplyOutcome::Created) => {
                    if let Ok(mut created) = self.created.lock() {
                        created.push(pool.clone());
                    }
                }
                Ok(_) => {}
                Err(e) => report.failed.push((pool.clone(), e.to_string())),
            }
        }

        if let Ok(mut last) = self.last_report.lock() {
            *last = report.clone();
        }
        report
    }
}

/// List subsets of every registered kind
async fn observe_subsets(
    ctx: &Context,
    ud: &UnitedDeployment,
) -> Result<Vec<Subset>, SubsetError> {
    let mut subsets = Vec::new();
    for control in ctx.subsets.all() {
        subsets.extend(control.list_subsets(ud).await?);
    }
    Ok(subsets)
}

/// Delete subsets whose pool is gone, whose kind changed, or that duplicate
/// the pool's canonical object
///
/// Returns the subsets kept and the pools whose deletion failed.
async fn remove_stale_subsets(
    ctx: &Context,
    ud: &UnitedDeployment,
    existing: Vec<Subset>,
    declarations: &BTreeMap<String, SubsetDeclaration>,
) -> (Vec<Subset>, Vec<(String, String)>) {
    let name = ud.name_any();
    let mut kept = Vec::new();
    let mut failed = Vec::new();

    for subset in existing {
        let stale = match declarations.get(&subset.pool) {
            None => Some("pool no longer declared"),
            Some(declared) if declared.kind != subset.kind => Some("pool changed kind"),
            Some(_) if subset.object_name != subset_object_name(&name, &subset.pool) => {
                Some("duplicate object for pool")
            }
            Some(_) => None,
        };

        let Some(why) = stale else {
            kept.push(subset);
            continue;
        };

        let result = match ctx.subsets.get(subset.kind) {
            Ok(control) => control.delete_subset(ud, &subset).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                info!(
                    united_deployment = %name,
                    subset = %subset.pool,
                    object = %subset.object_name,
                    reason = why,
                    "Deleted subset"
                );
                publish(
                    ctx,
                    ud,
                    ControllerEvent::normal(
                        REASON_SUBSET_DELETED,
                        format!("deleted {} {}: {}", subset.kind.as_str(), subset.object_name, why),
                    ),
                )
                .await;
            }
            Err(e) => {
                warn!(
                    united_deployment = %name,
                    subset = %subset.pool,
                    error = %e,
                    "Failed to delete subset"
                );
                failed.push((subset.pool.clone(), e.to_string()));
            }
        }
    }

    (kept, failed)
}

/// Result of driving the subsets for one strategy pass
struct RolloutPass {
    partitions: BTreeMap<String, i32>,
    report: ApplyReport,
    events: Vec<ControllerEvent>,
    action: Action,
    phase: Option<RolloutPhase>,
    canary: Option<CanaryState>,
    degraded: Option<String>,
    converged: bool,
}

/// Every pool must name a kind this controller has a control for
///
/// A kind that is not registered can never be applied, so it is reported like
/// any other spec error instead of being retried.
fn check_kinds(controls: &SubsetControls, ud: &UnitedDeployment) -> Result<(), String> {
    for decl in &ud.spec.topology.subsets {
        if controls.get(decl.kind).is_err() {
            return Err(format!(
                "subset '{}' uses kind {}, which this controller does not manage",
                decl.name,
                decl.kind.as_str()
            ));
        }
    }
    Ok(())
}

/// One reconcile pass; exposed for tests that drive the loop by hand
pub async fn reconcile_once(
    ud: &UnitedDeployment,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let namespace = ud.namespace().ok_or(ReconcileError::MissingNamespace)?;
    let name = ud.name_any();

    // Work from the stored object, not the (possibly stale) watch event
    let Some(mut ud) = ctx.store.get(&namespace, &name).await? else {
        debug!(united_deployment = %name, namespace = %namespace, "UnitedDeployment gone, nothing to do");
        return Ok(Action::await_change());
    };
    let now = ctx.clock.now();
    let previous = ud.status.clone();
    apply_defaults(&mut ud.spec);

    if let Err(message) = validate(&ud).and_then(|()| check_kinds(&ctx.subsets, &ud)) {
        warn!(united_deployment = %name, namespace = %namespace, error = %message, "Invalid UnitedDeployment spec");
        let mut status = previous.clone().unwrap_or_default();
        status.observed_generation = ud.metadata.generation;
        set_condition(
            &mut status,
            ConditionType::SpecValid,
            ConditionStatus::False,
            "InvalidSpec",
            message.clone(),
            now,
        );
        if previous.as_ref() != Some(&status) {
            write_status(ctx.store.as_ref(), &ud, status).await?;
        }
        publish(ctx, &ud, ControllerEvent::warning(REASON_INVALID_SPEC, message)).await;
        return Ok(Action::requeue(INVALID_SPEC_REQUEUE));
    }

    // Revisions
    let recorded_collisions = previous
        .as_ref()
        .and_then(|s| s.collision_count)
        .unwrap_or(0);
    let outcome = get_or_create_revision(ctx.revisions.as_ref(), &ud, recorded_collisions).await?;
    if outcome.collision_count > recorded_collisions {
        warn!(
            united_deployment = %name,
            collision_count = outcome.collision_count,
            "Revision hash collision resolved"
        );
        if let Some(ref metrics) = ctx.metrics {
            metrics.record_revision_collision(&namespace, &name);
        }
    }
    if outcome.created {
        publish(
            ctx,
            &ud,
            ControllerEvent::normal(
                REASON_REVISION_CREATED,
                format!("created revision {}", outcome.revision.name),
            ),
        )
        .await;
    }
    let update_revision = outcome.revision.name.clone();
    let revisions = ctx.revisions.list(&ud).await?;
    let mut current_revision = resolve_current_revision(
        previous.as_ref().and_then(|s| s.current_revision.as_deref()),
        &revisions,
        &outcome.revision,
    );

    // Plan
    let plan = allocate_replicas(ud.spec.replicas, &ud.spec.topology.subsets)?;
    let declarations: BTreeMap<String, SubsetDeclaration> = ud
        .spec
        .topology
        .subsets
        .iter()
        .map(|s| (s.name.clone(), s.clone()))
        .collect();

    let existing = observe_subsets(ctx, &ud).await?;
    let (_, delete_failures) = remove_stale_subsets(ctx, &ud, existing, &declarations).await;

    let applier = SubsetApplier {
        ud: &ud,
        controls: &ctx.subsets,
        declarations: &declarations,
        plan: &plan,
        revision: &update_revision,
        created: Mutex::new(Vec::new()),
        last_report: Mutex::new(ApplyReport::default()),
    };

    let pass = match ud.spec.update_strategy.resolve() {
        Strategy::Manual(manual) => {
            let partitions = if current_revision == update_revision {
                settled_partitions(&plan)
            } else {
                manual_partitions(&plan, &manual)
            };
            let report = applier.apply_partitions(&partitions).await;
            let events = report
                .failed
                .iter()
                .map(|(pool, error)| {
                    ControllerEvent::warning(
                        REASON_SUBSET_APPLY_FAILED,
                        format!("subset {}: {}", pool, error),
                    )
                })
                .collect();
            RolloutPass {
                partitions,
                report,
                events,
                action: Action::requeue(STEADY_STATE_REQUEUE),
                phase: None,
                canary: None,
                degraded: None,
                converged: false,
            }
        }
        Strategy::Canary(canary) => {
            let state = CanaryState::reconstruct(
                previous.as_ref().and_then(|s| s.canary.as_ref()),
                &current_revision,
                &update_revision,
                &plan,
                ud.metadata.generation.unwrap_or(0),
            );
            let previous_analysis = state.last_analysis.clone();
            let controller = CanaryController {
                ud: &ud,
                policy: DecrementPolicy::from_canary(&canary),
                bake: Duration::from_secs(canary.bake_time_seconds.max(0) as u64),
                failure_policy: analysis_config(&ud)
                    .and_then(|a| a.failure_policy)
                    .unwrap_or(FailurePolicy::Pause),
                gate: ctx.gate.as_ref(),
                now,
            };
            let step = controller.step(state, &applier).await;

            if step.state.last_analysis != previous_analysis {
                if let (Some(metrics), Some(analysis)) =
                    (&ctx.metrics, &step.state.last_analysis)
                {
                    metrics.record_analysis(if analysis.passed { "pass" } else { "fail" });
                }
            }

            let action = match step.action {
                StepAction::Requeue(delay) => Action::requeue(delay),
                StepAction::Done | StepAction::Halted => Action::requeue(STEADY_STATE_REQUEUE),
            };
            RolloutPass {
                partitions: step.state.partitions.clone(),
                report: applier.last_report(),
                events: step.events,
                action,
                phase: Some(step.state.phase),
                converged: step.state.phase == RolloutPhase::Converged
                    && step.action == StepAction::Done,
                degraded: step.degraded,
                canary: Some(step.state),
            }
        }
    };

    for pool in applier.created() {
        publish(
            ctx,
            &ud,
            ControllerEvent::normal(
                REASON_SUBSET_CREATED,
                format!("created subset {}", subset_object_name(&name, &pool)),
            ),
        )
        .await;
    }
    for event in pass.events {
        publish(ctx, &ud, event).await;
    }

    // Observe what the pass left behind
    let observed = match observe_subsets(ctx, &ud).await {
        Ok(subsets) => subsets,
        Err(e) => {
            warn!(united_deployment = %name, error = %e, "Failed to observe subsets after apply");
            Vec::new()
        }
    };

    let fully_updated = all_subsets_updated(&plan, &observed, &update_revision);
    let rollout_done = pass.converged || (pass.canary.is_none() && fully_updated);
    if current_revision != update_revision && rollout_done {
        info!(
            united_deployment = %name,
            from = %current_revision,
            to = %update_revision,
            "Rollout complete, advancing current revision"
        );
        current_revision = update_revision.clone();
    }

    match prune(
        ctx.revisions.as_ref(),
        &ud,
        ud.spec.revision_history_limit,
        &[current_revision.as_str(), update_revision.as_str()],
    )
    .await
    {
        Ok(deleted) if !deleted.is_empty() => {
            debug!(united_deployment = %name, deleted = ?deleted, "Pruned old revisions");
        }
        Ok(_) => {}
        Err(e) => warn!(united_deployment = %name, error = %e, "Failed to prune revisions"),
    }

    // Status
    let mut status = aggregate_status(
        &StatusInputs {
            generation: ud.metadata.generation,
            plan: &plan,
            partitions: &pass.partitions,
            subsets: &observed,
            current_revision: &current_revision,
            update_revision: &update_revision,
            collision_count: outcome.collision_count,
        },
        previous.as_ref(),
    );
    status.phase = pass.phase;
    status.canary = pass.canary.as_ref().map(CanaryState::to_status);

    let mut failures = pass.report.failed.clone();
    failures.extend(delete_failures);
    set_condition(&mut status, ConditionType::SpecValid, ConditionStatus::True, "Valid", "", now);
    set_condition(
        &mut status,
        ConditionType::SubsetProvisioned,
        condition_status(failures.is_empty()),
        if failures.is_empty() { "AllSubsetsApplied" } else { "SubsetApplyFailed" },
        failures
            .iter()
            .map(|(pool, error)| format!("{}: {}", pool, error))
            .collect::<Vec<_>>()
            .join("; "),
        now,
    );
    let updated = current_revision == update_revision && fully_updated;
    set_condition(
        &mut status,
        ConditionType::SubsetUpdated,
        condition_status(updated),
        if updated { "RolloutComplete" } else { "RolloutInProgress" },
        "",
        now,
    );
    let aborted = status.phase == Some(RolloutPhase::Aborted);
    let degraded_message = if aborted {
        pass.degraded
            .clone()
            .or_else(|| {
                status
                    .canary
                    .as_ref()
                    .and_then(|c| c.last_analysis.as_ref())
                    .and_then(|a| a.message.clone())
            })
            .unwrap_or_default()
    } else {
        String::new()
    };
    set_condition(
        &mut status,
        ConditionType::RolloutDegraded,
        condition_status(aborted),
        if aborted { "AnalysisFailed" } else { "Healthy" },
        degraded_message,
        now,
    );

    if let Some(ref metrics) = ctx.metrics {
        for (pool, partition) in &pass.partitions {
            metrics.set_subset_partition(&namespace, &name, pool, *partition as i64);
        }
    }

    if previous.as_ref() != Some(&status) {
        write_status(ctx.store.as_ref(), &ud, status).await?;
    }

    info!(
        united_deployment = %name,
        namespace = %namespace,
        phase = pass.phase.map(|p| p.as_str()).unwrap_or("Manual"),
        update_revision = %update_revision,
        "Reconciled UnitedDeployment"
    );

    let action = if !failures.is_empty() {
        Action::requeue(APPLY_RETRY_DELAY)
    } else if pass.canary.is_none() && current_revision != update_revision {
        Action::requeue(MANUAL_PROGRESS_REQUEUE)
    } else {
        pass.action
    };
    Ok(action)
}
