use super::*;
use crate::controller::analysis::ScriptedAnalysisGate;
use crate::controller::clock::MockClock;
use crate::controller::events::{
    MockEventRecorder, REASON_CANARY_ABORTED, REASON_CANARY_CONVERGED, REASON_INVALID_SPEC,
    REASON_SUBSET_APPLY_FAILED, REASON_SUBSET_CREATED, REASON_SUBSET_DELETED,
};
use crate::controller::revision::{compute_revision_hash, revision_name, Revision};
use crate::controller::revision::MemoryRevisionStore;
use crate::controller::store::MemoryUnitedDeploymentStore;
use crate::controller::subset::{MockSubsetControl, SubsetControls};
use crate::crd::{
    ConditionStatus, ConditionType, RolloutPhase, SubsetKind, UnitedDeployment,
    UnitedDeploymentSpec, UnitedDeploymentStatus,
};
use crate::server::LeaderState;
use kube::runtime::controller::Action;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const NS: &str = "default";
const NAME: &str = "web";

/// Context wired to in-memory collaborators
struct Harness {
    store: MemoryUnitedDeploymentStore,
    revisions: MemoryRevisionStore,
    statefulsets: MockSubsetControl,
    advanced: MockSubsetControl,
    gate: ScriptedAnalysisGate,
    events: MockEventRecorder,
    clock: Arc<MockClock>,
    ctx: Arc<Context>,
}

impl Harness {
    fn new(script: Vec<Result<bool, String>>) -> Self {
        Self::build(script, true)
    }

    /// Only the StatefulSet control is registered
    fn statefulsets_only() -> Self {
        Self::build(vec![], false)
    }

    fn build(script: Vec<Result<bool, String>>, advanced_enabled: bool) -> Self {
        let store = MemoryUnitedDeploymentStore::new();
        let revisions = MemoryRevisionStore::new();
        let statefulsets = MockSubsetControl::new(SubsetKind::StatefulSet);
        let advanced = MockSubsetControl::new(SubsetKind::AdvancedStatefulSet);
        let gate = ScriptedAnalysisGate::new(script);
        let events = MockEventRecorder::new();
        let clock = Arc::new(MockClock::at_epoch());

        let mut controls = SubsetControls::new().with(Arc::new(statefulsets.clone()));
        if advanced_enabled {
            controls = controls.with(Arc::new(advanced.clone()));
        }

        let ctx = Context::new(
            Arc::new(store.clone()),
            Arc::new(revisions.clone()),
            controls,
            Arc::new(gate.clone()),
            Arc::new(events.clone()),
            clock.clone(),
            None,
        );

        Harness {
            store,
            revisions,
            statefulsets,
            advanced,
            gate,
            events,
            clock,
            ctx: Arc::new(ctx),
        }
    }

    fn ud(&self) -> UnitedDeployment {
        self.store.current(NS, NAME).expect("object stored")
    }

    fn status(&self) -> UnitedDeploymentStatus {
        self.ud().status.unwrap_or_default()
    }

    /// One reconcile after the clock moved past any bake time
    async fn tick(&self) -> Action {
        self.clock.advance_secs(5);
        reconcile_once(&self.ud(), &self.ctx).await.unwrap()
    }

    fn edit(&self, edit: impl FnOnce(&mut UnitedDeploymentSpec)) {
        self.store.update_spec(NS, NAME, edit);
    }
}

fn spec(value: serde_json::Value) -> UnitedDeploymentSpec {
    serde_json::from_value(value).unwrap()
}

fn base_spec(strategy: serde_json::Value) -> UnitedDeploymentSpec {
    spec(serde_json::json!({
        "replicas": 6,
        "selector": { "matchLabels": { "app": "web" } },
        "template": {
            "metadata": { "labels": { "app": "web" } },
            "spec": { "containers": [{ "name": "web", "image": "nginx:1.25" }] }
        },
        "topology": {
            "subsets": [
                { "name": "a", "weight": 2 },
                { "name": "b", "weight": 1 }
            ]
        },
        "updateStrategy": strategy
    }))
}

fn canary_strategy() -> serde_json::Value {
    serde_json::json!({ "type": "Canary", "canaryUpdate": { "rollCount": 1, "bakeTimeSeconds": 2 } })
}

fn new_ud(spec: UnitedDeploymentSpec) -> UnitedDeployment {
    let mut ud = UnitedDeployment::new(NAME, spec);
    ud.metadata.namespace = Some(NS.to_string());
    ud
}

fn bump_image(spec: &mut UnitedDeploymentSpec) {
    let pod = spec.template.spec.as_mut().unwrap();
    pod.containers[0].image = Some("nginx:1.26".to_string());
}

fn is_converged(status: &UnitedDeploymentStatus) -> bool {
    status.phase == Some(RolloutPhase::Converged)
        && status.current_revision == status.update_revision
}

#[tokio::test]
async fn test_first_reconcile_creates_subsets() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));

    h.tick().await;

    assert_eq!(h.statefulsets.object_names(), vec!["web-a", "web-b"]);
    assert_eq!(h.statefulsets.subset("a").unwrap().replicas, 4);
    assert_eq!(h.statefulsets.subset("b").unwrap().replicas, 2);
    assert_eq!(h.statefulsets.partition("a"), Some(0));

    let status = h.status();
    assert!(is_converged(&status));
    assert_eq!(status.replicas, 6);
    assert_eq!(status.updated_replicas, 6);
    assert_eq!(status.observed_generation, Some(1));
    assert_eq!(status.subset_replicas.get("a"), Some(&4));
    assert_eq!(
        status.condition(ConditionType::SubsetUpdated).unwrap().status,
        ConditionStatus::True
    );
    assert!(h.events.has_reason(REASON_SUBSET_CREATED));
    assert_eq!(h.gate.calls(), 0);
}

#[tokio::test]
async fn test_canary_partitions_step_down_to_convergence() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    h.tick().await;
    let old_revision = h.status().update_revision.unwrap();

    h.edit(bump_image);

    let mut seq_a: Vec<i32> = Vec::new();
    let mut seq_b: Vec<i32> = Vec::new();
    for _ in 0..40 {
        h.tick().await;
        for (seq, pool) in [(&mut seq_a, "a"), (&mut seq_b, "b")] {
            let p = h.statefulsets.partition(pool).unwrap();
            if seq.last() != Some(&p) {
                seq.push(p);
            }
        }
        if is_converged(&h.status()) {
            break;
        }
    }

    assert_eq!(seq_a, vec![4, 3, 2, 1, 0]);
    assert_eq!(seq_b, vec![2, 1, 0]);

    let status = h.status();
    assert!(is_converged(&status));
    assert_ne!(status.update_revision.as_deref(), Some(old_revision.as_str()));
    assert_eq!(status.updated_replicas, 6);
    assert_eq!(h.gate.calls(), 4);
    assert!(h.events.has_reason(REASON_CANARY_CONVERGED));
    assert_eq!(
        h.statefulsets.subset("a").unwrap().revision,
        status.update_revision
    );
}

#[tokio::test]
async fn test_canary_bake_requeues_instead_of_waiting() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    h.tick().await;
    h.edit(bump_image);

    // Initializing, then the first decrement enters Baking
    h.tick().await;
    let action = reconcile_once(&h.ud(), &h.ctx).await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(2)));
    assert_eq!(h.status().phase, Some(RolloutPhase::Baking));

    // Same instant: still baking, the full bake remains
    let action = reconcile_once(&h.ud(), &h.ctx).await.unwrap();
    assert_eq!(action, Action::requeue(Duration::from_secs(2)));
    assert_eq!(h.status().phase, Some(RolloutPhase::Baking));
}

#[tokio::test]
async fn test_canary_analysis_failure_aborts_and_holds() {
    let h = Harness::new(vec![Ok(false)]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    h.tick().await;
    h.edit(bump_image);

    for _ in 0..20 {
        h.tick().await;
        if h.status().phase == Some(RolloutPhase::Aborted) {
            break;
        }
    }

    let status = h.status();
    assert_eq!(status.phase, Some(RolloutPhase::Aborted));
    assert_eq!(h.statefulsets.partition("a"), Some(3));
    assert_eq!(h.statefulsets.partition("b"), Some(1));
    assert_ne!(status.current_revision, status.update_revision);
    let degraded = status.condition(ConditionType::RolloutDegraded).unwrap();
    assert_eq!(degraded.status, ConditionStatus::True);
    assert_eq!(degraded.message.as_deref(), Some("scripted failure"));
    assert!(h.events.has_reason(REASON_CANARY_ABORTED));

    // No further decrements until the spec changes
    for _ in 0..5 {
        let action = h.tick().await;
        assert_eq!(action, Action::requeue(STEADY_STATE_REQUEUE));
    }
    assert_eq!(h.statefulsets.partition("a"), Some(3));
    assert_eq!(h.gate.calls(), 1);

    // An operator edit resumes the rollout from where it stopped
    h.edit(|spec| {
        spec.update_strategy.canary_update.as_mut().unwrap().roll_count = 2;
    });
    h.tick().await;
    assert_eq!(h.statefulsets.partition("a"), Some(1));
    assert_eq!(h.statefulsets.partition("b"), Some(0));
    assert_eq!(h.status().phase, Some(RolloutPhase::Baking));
}

#[tokio::test]
async fn test_pool_removed_mid_rollout() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    h.tick().await;
    h.edit(bump_image);

    // Initializing + first decrement
    h.tick().await;
    h.tick().await;
    assert_eq!(h.statefulsets.partition("a"), Some(3));

    h.edit(|spec| {
        spec.replicas = 4;
        spec.topology.subsets.retain(|s| s.name == "a");
    });

    for _ in 0..40 {
        h.tick().await;
        if is_converged(&h.status()) {
            break;
        }
    }

    assert_eq!(h.statefulsets.object_names(), vec!["web-a"]);
    assert!(h.events.has_reason(REASON_SUBSET_DELETED));
    let status = h.status();
    assert!(is_converged(&status));
    assert_eq!(status.subsets.len(), 1);
    assert_eq!(status.replicas, 4);
    assert_eq!(status.updated_replicas, 4);
    assert_eq!(h.statefulsets.partition("a"), Some(0));
}

#[tokio::test]
async fn test_switch_to_manual_after_pool_removal_clears_canary_status() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    h.tick().await;
    h.edit(bump_image);
    h.tick().await;
    h.tick().await;
    let status = h.status();
    assert!(status.canary.is_some());
    assert_eq!(status.subset_replicas.len(), 2);

    h.edit(|spec| {
        spec.replicas = 4;
        spec.topology.subsets.retain(|s| s.name == "a");
        spec.update_strategy = serde_json::from_value(serde_json::json!({
            "type": "Manual",
            "manualUpdate": { "partitions": { "a": 0 } }
        }))
        .unwrap();
    });
    for _ in 0..5 {
        h.tick().await;
    }

    let status = h.status();
    assert_eq!(status.subset_replicas, BTreeMap::from([("a".to_string(), 4)]));
    assert_eq!(status.subsets.len(), 1);
    assert_eq!(status.phase, None);
    assert_eq!(status.canary, None);
    assert_eq!(status.current_revision, status.update_revision);
    assert_eq!(h.statefulsets.object_names(), vec!["web-a"]);
}

#[tokio::test]
async fn test_manual_partitions_apply_in_one_pass() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.tick().await;
    assert_eq!(h.statefulsets.partition("a"), Some(0));

    h.edit(bump_image);
    let action = h.tick().await;

    // Unset pools keep every replica on the old revision
    assert_eq!(h.statefulsets.partition("a"), Some(4));
    assert_eq!(h.statefulsets.partition("b"), Some(2));
    assert_eq!(action, Action::requeue(MANUAL_PROGRESS_REQUEUE));
    assert_eq!(h.status().phase, None);

    h.edit(|spec| {
        let manual = spec.update_strategy.manual_update.get_or_insert_with(Default::default);
        manual.partitions.insert("a".to_string(), 0);
    });
    h.tick().await;
    assert_eq!(h.statefulsets.partition("a"), Some(0));
    assert_eq!(h.statefulsets.partition("b"), Some(2));
    let status = h.status();
    assert_ne!(status.current_revision, status.update_revision);
    assert_eq!(status.updated_replicas, 4);

    h.edit(|spec| {
        let manual = spec.update_strategy.manual_update.get_or_insert_with(Default::default);
        manual.partitions.insert("b".to_string(), 0);
    });
    let action = h.tick().await;
    let status = h.status();
    assert_eq!(status.current_revision, status.update_revision);
    assert_eq!(
        status.condition(ConditionType::SubsetUpdated).unwrap().status,
        ConditionStatus::True
    );
    assert_eq!(action, Action::requeue(STEADY_STATE_REQUEUE));
}

#[tokio::test]
async fn test_repeated_reconcile_is_idempotent() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));

    h.tick().await;
    let applies = h.statefulsets.apply_count();
    let version = h.ud().metadata.resource_version;

    h.tick().await;
    h.tick().await;

    assert_eq!(h.revisions.names(NAME).len(), 1);
    assert_eq!(h.statefulsets.apply_count(), applies);
    // Nothing changed, so no status write either
    assert_eq!(h.ud().metadata.resource_version, version);
}

#[tokio::test]
async fn test_hash_collision_bumps_collision_count() {
    let h = Harness::new(vec![]);
    let ud = h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));

    let template = serde_json::to_value(&ud.spec.template).unwrap();
    let taken = compute_revision_hash(&template, 0);
    h.revisions.insert(
        NAME,
        Revision {
            name: revision_name(NAME, &taken),
            hash: taken.clone(),
            number: 1,
            template: serde_json::json!({ "metadata": { "labels": { "app": "other" } } }),
        },
    );

    h.tick().await;

    let status = h.status();
    assert_eq!(status.collision_count, Some(1));
    let update = status.update_revision.unwrap();
    assert_eq!(update, revision_name(NAME, &compute_revision_hash(&template, 1)));
    assert_eq!(h.revisions.names(NAME).len(), 2);

    // Stays stable on the next pass
    h.tick().await;
    assert_eq!(h.status().collision_count, Some(1));
    assert_eq!(h.status().update_revision.as_deref(), Some(update.as_str()));
}

#[tokio::test]
async fn test_missing_object_is_success() {
    let h = Harness::new(vec![]);
    let ud = new_ud(base_spec(canary_strategy()));

    let action = reconcile_once(&ud, &h.ctx).await.unwrap();

    assert_eq!(action, Action::await_change());
    assert!(h.statefulsets.object_names().is_empty());
}

#[tokio::test]
async fn test_invalid_spec_sets_condition_and_requeues_slowly() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({
        "type": "Canary",
        "canaryUpdate": { "rollCount": 0 }
    }))));

    let action = h.tick().await;

    assert_eq!(action, Action::requeue(INVALID_SPEC_REQUEUE));
    assert!(h.statefulsets.object_names().is_empty());
    let status = h.status();
    let valid = status.condition(ConditionType::SpecValid).unwrap();
    assert_eq!(valid.status, ConditionStatus::False);
    assert!(valid.message.as_deref().unwrap().contains("rollCount"));
    assert!(h.events.has_reason(REASON_INVALID_SPEC));

    // Fixing the spec flips the condition back
    h.edit(|spec| {
        spec.update_strategy.canary_update.as_mut().unwrap().roll_count = 1;
    });
    h.tick().await;
    assert_eq!(
        h.status().condition(ConditionType::SpecValid).unwrap().status,
        ConditionStatus::True
    );
    assert_eq!(h.statefulsets.object_names().len(), 2);
}

#[tokio::test]
async fn test_unregistered_kind_is_an_invalid_spec() {
    let h = Harness::statefulsets_only();
    let mut spec = base_spec(serde_json::json!({ "type": "Manual" }));
    spec.topology.subsets[1].kind = SubsetKind::AdvancedStatefulSet;
    h.store.insert(new_ud(spec));

    let action = h.tick().await;

    assert_eq!(action, Action::requeue(INVALID_SPEC_REQUEUE));
    assert!(h.statefulsets.object_names().is_empty());
    assert!(h.advanced.object_names().is_empty());
    let status = h.status();
    let valid = status.condition(ConditionType::SpecValid).unwrap();
    assert_eq!(valid.status, ConditionStatus::False);
    let message = valid.message.as_deref().unwrap();
    assert!(message.contains("'b'"));
    assert!(message.contains("AdvancedStatefulSet"));
    assert!(h.events.has_reason(REASON_INVALID_SPEC));

    h.edit(|spec| spec.topology.subsets[1].kind = SubsetKind::StatefulSet);
    h.tick().await;
    assert_eq!(
        h.status().condition(ConditionType::SpecValid).unwrap().status,
        ConditionStatus::True
    );
    assert_eq!(h.statefulsets.object_names(), vec!["web-a", "web-b"]);
}

#[tokio::test]
async fn test_status_conflicts_are_retried() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.store.inject_conflicts(2);

    h.tick().await;

    assert_eq!(h.status().replicas, 6);
}

#[tokio::test]
async fn test_status_conflicts_exhausted_surface_transient_error() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.store.inject_conflicts(10);

    let err = reconcile_once(&h.ud(), &h.ctx).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Conflict(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_partial_subset_failure_does_not_block_others() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.statefulsets.fail_pool("b");

    let action = h.tick().await;

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    assert!(h.statefulsets.subset("a").is_some());
    assert!(h.statefulsets.subset("b").is_none());
    assert!(h.events.has_reason(REASON_SUBSET_APPLY_FAILED));
    let status = h.status();
    let provisioned = status.condition(ConditionType::SubsetProvisioned).unwrap();
    assert_eq!(provisioned.status, ConditionStatus::False);
    assert!(provisioned.message.as_deref().unwrap().starts_with("b:"));

    h.statefulsets.recover_pool("b");
    h.tick().await;
    assert!(h.statefulsets.subset("b").is_some());
    assert_eq!(
        h.status()
            .condition(ConditionType::SubsetProvisioned)
            .unwrap()
            .status,
        ConditionStatus::True
    );
}

#[tokio::test]
async fn test_failed_update_reports_partition_still_on_object() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.tick().await;
    assert_eq!(h.statefulsets.partition("b"), Some(0));

    h.statefulsets.fail_pool("b");
    h.edit(bump_image);
    h.tick().await;

    assert_eq!(h.statefulsets.partition("a"), Some(4));
    assert_eq!(h.statefulsets.partition("b"), Some(0));
    let status = h.status();
    let a = status.subsets.iter().find(|s| s.name == "a").unwrap();
    let b = status.subsets.iter().find(|s| s.name == "b").unwrap();
    assert_eq!(a.partition, 4);
    assert_eq!(b.partition, 0);
}

#[tokio::test]
async fn test_kind_change_recreates_subset() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    h.tick().await;

    h.edit(|spec| spec.topology.subsets[0].kind = SubsetKind::AdvancedStatefulSet);
    h.tick().await;

    assert_eq!(h.statefulsets.object_names(), vec!["web-b"]);
    assert_eq!(h.advanced.object_names(), vec!["web-a"]);
    let status = h.status();
    assert_eq!(status.subsets[0].kind, SubsetKind::AdvancedStatefulSet);
}

#[tokio::test]
async fn test_revision_history_is_pruned() {
    let h = Harness::new(vec![]);
    let mut spec = base_spec(serde_json::json!({ "type": "Manual" }));
    spec.revision_history_limit = 0;
    h.store.insert(new_ud(spec));
    h.tick().await;

    for image in ["nginx:1.26", "nginx:1.27", "nginx:1.28"] {
        h.edit(|spec| {
            spec.template.spec.as_mut().unwrap().containers[0].image = Some(image.to_string());
        });
        h.tick().await;
    }

    // Only the current and the update revision survive
    let status = h.status();
    let mut expected = vec![
        status.current_revision.unwrap(),
        status.update_revision.unwrap(),
    ];
    expected.sort();
    expected.dedup();
    let mut names = h.revisions.names(NAME);
    names.sort();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn test_not_leader_skips_reconcile() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(canary_strategy())));
    let ctx = Arc::new(
        Context::new(
            h.ctx.store.clone(),
            h.ctx.revisions.clone(),
            h.ctx.subsets.clone(),
            h.ctx.gate.clone(),
            h.ctx.events.clone(),
            h.ctx.clock.clone(),
            None,
        )
        .with_leader(LeaderState::new()),
    );

    let action = reconcile(Arc::new(h.ud()), ctx).await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    assert!(h.statefulsets.object_names().is_empty());
}

#[tokio::test]
async fn test_error_policy_backs_off_and_resets() {
    let h = Harness::new(vec![]);
    h.store.insert(new_ud(base_spec(serde_json::json!({ "type": "Manual" }))));
    let ud = Arc::new(h.ud());
    let conflict = ReconcileError::Conflict("busy".to_string());

    assert_eq!(
        error_policy(ud.clone(), &conflict, h.ctx.clone()),
        Action::requeue(Duration::from_secs(5))
    );
    assert_eq!(
        error_policy(ud.clone(), &conflict, h.ctx.clone()),
        Action::requeue(Duration::from_secs(10))
    );
    assert_eq!(
        error_policy(ud.clone(), &ReconcileError::MissingNamespace, h.ctx.clone()),
        Action::requeue(STEADY_STATE_REQUEUE)
    );

    reconcile(ud.clone(), h.ctx.clone()).await.unwrap();
    assert_eq!(
        error_policy(ud, &conflict, h.ctx.clone()),
        Action::requeue(Duration::from_secs(5))
    );
}

#[test]
fn test_reconcile_error_classification() {
    use crate::controller::allocation::AllocationError;
    use crate::controller::store::StoreError;

    assert!(ReconcileError::from(StoreError::Conflict("x".into())).is_transient());
    assert!(matches!(
        ReconcileError::from(StoreError::Conflict("x".into())),
        ReconcileError::Conflict(_)
    ));
    assert!(!ReconcileError::from(StoreError::NotFound("x".into())).is_transient());
    assert!(!ReconcileError::Allocation(AllocationError::NegativeTotal(-1)).is_transient());
    assert!(!ReconcileError::MissingNamespace.is_transient());
}

#[test]
fn test_partition_plan_for_scenario() {
    // replicas=10 over weights 3:1
    let mut spec = base_spec(serde_json::json!({ "type": "Manual" }));
    spec.replicas = 10;
    spec.topology.subsets[0].weight = Some(3);
    spec.topology.subsets[1].weight = Some(1);
    let plan =
        crate::controller::allocation::allocate_replicas(spec.replicas, &spec.topology.subsets)
            .unwrap();
    assert_eq!(
        plan,
        BTreeMap::from([("a".to_string(), 8), ("b".to_string(), 2)])
    );
}
