use k8s_openapi::api::core::v1::{NodeSelectorTerm, PodTemplateSpec, Toleration};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Label carried by every object owned by a UnitedDeployment (value: owner name)
pub const UNITED_DEPLOYMENT_LABEL: &str = "apps.united.io/united-deployment";

/// Label naming the pool a per-pool workload belongs to
pub const SUBSET_LABEL: &str = "apps.united.io/subset";

/// Label carrying the revision name a subset was last applied with
pub const REVISION_LABEL: &str = "apps.united.io/revision";

/// Label carrying the template hash on ControllerRevisions
pub const REVISION_HASH_LABEL: &str = "apps.united.io/revision-hash";

/// UnitedDeployment keeps one logical workload deployed across several pools
///
/// Each pool ("subset") is materialized as an independent per-pool workload
/// object. The controller splits `replicas` across the pools and rolls template
/// changes out by lowering per-subset partitions.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
#[kube(
    group = "apps.united.io",
    version = "v1alpha1",
    kind = "UnitedDeployment",
    namespaced,
    shortname = "ud",
    status = "UnitedDeploymentStatus",
    printcolumn = r#"{"name":"Desired", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Current", "type":"integer", "jsonPath":".status.replicas"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyReplicas"}"#,
    printcolumn = r#"{"name":"Updated", "type":"integer", "jsonPath":".status.updatedReplicas"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct UnitedDeploymentSpec {
    /// Total number of desired pods across all subsets
    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Label selector for pods; must match the template labels
    pub selector: LabelSelector,

    /// Pod template shared by every subset
    pub template: PodTemplateSpec,

    /// Pools the replicas are spread across
    #[serde(default)]
    pub topology: Topology,

    /// How template changes are rolled out across subsets
    #[serde(rename = "updateStrategy", default)]
    pub update_strategy: UpdateStrategy,

    /// Number of old revisions to retain (current and updated are always kept)
    #[serde(
        rename = "revisionHistoryLimit",
        default = "default_revision_history_limit"
    )]
    pub revision_history_limit: i32,
}

pub(crate) fn default_replicas() -> i32 {
    1
}

pub(crate) fn default_revision_history_limit() -> i32 {
    10
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Topology {
    /// Ordered pool declarations; order decides remainder assignment
    #[serde(default)]
    pub subsets: Vec<SubsetDeclaration>,
}

/// A pool declaration
///
/// Exactly one of `weight` or `replicas` selects the allocation mode.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SubsetDeclaration {
    /// Pool name, unique within the UnitedDeployment
    pub name: String,

    /// Placement constraint merged into the pool's required node affinity
    #[serde(rename = "nodeSelectorTerm", skip_serializing_if = "Option::is_none")]
    pub node_selector_term: Option<NodeSelectorTerm>,

    /// Tolerations appended to the pool's pod template
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Workload kind backing this pool
    #[serde(default)]
    pub kind: SubsetKind,

    /// Proportional share of the replicas left after fixed pools
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,

    /// Explicit replica count for this pool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
}

/// Per-pool workload kind
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
pub enum SubsetKind {
    /// `apps/v1` StatefulSet
    #[default]
    StatefulSet,
    /// `apps.kruise.io/v1beta1` StatefulSet
    AdvancedStatefulSet,
}

impl SubsetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubsetKind::StatefulSet => "StatefulSet",
            SubsetKind::AdvancedStatefulSet => "AdvancedStatefulSet",
        }
    }
}

/// Update strategy as written on the wire
///
/// `type` picks the variant; the matching payload carries its parameters.
/// Use [`UpdateStrategy::resolve`] to get the tagged form.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UpdateStrategy {
    #[serde(rename = "type", default)]
    pub type_: UpdateStrategyType,

    #[serde(rename = "manualUpdate", skip_serializing_if = "Option::is_none")]
    pub manual_update: Option<ManualUpdate>,

    #[serde(rename = "canaryUpdate", skip_serializing_if = "Option::is_none")]
    pub canary_update: Option<CanaryUpdate>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum UpdateStrategyType {
    #[default]
    Manual,
    Canary,
}

/// Resolved update strategy
#[derive(Clone, Debug, PartialEq)]
pub enum Strategy {
    Manual(ManualUpdate),
    Canary(CanaryUpdate),
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::Manual(_) => "manual",
            Strategy::Canary(_) => "canary",
        }
    }
}

impl UpdateStrategy {
    /// Resolve the wire form into exactly one strategy variant
    ///
    /// A missing payload for the selected type resolves to that type's defaults.
    pub fn resolve(&self) -> Strategy {
        match self.type_ {
            UpdateStrategyType::Manual => {
                Strategy::Manual(self.manual_update.clone().unwrap_or_default())
            }
            UpdateStrategyType::Canary => {
                Strategy::Canary(self.canary_update.clone().unwrap_or_default())
            }
        }
    }
}

/// Manual strategy: partitions are set per pool by the operator
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ManualUpdate {
    /// Pool name → number of replicas held on the old revision
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub partitions: BTreeMap<String, i32>,
}

/// Canary strategy: partitions are lowered step by step, gated by bake time
/// and analysis
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct CanaryUpdate {
    /// Partition decrement applied to every subset per step
    #[serde(rename = "rollCount", default = "default_roll_count")]
    pub roll_count: i32,

    /// Seconds to wait after each step before analysis
    #[serde(rename = "bakeTimeSeconds", default = "default_bake_time_seconds")]
    pub bake_time_seconds: i32,

    /// Per-pool decrement overriding `rollCount`
    #[serde(
        rename = "subsetRollCounts",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub subset_roll_counts: BTreeMap<String, i32>,

    /// Analysis gate consulted between steps
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<AnalysisConfig>,
}

pub(crate) fn default_roll_count() -> i32 {
    1
}

pub(crate) fn default_bake_time_seconds() -> i32 {
    2
}

impl Default for CanaryUpdate {
    fn default() -> Self {
        Self {
            roll_count: default_roll_count(),
            bake_time_seconds: default_bake_time_seconds(),
            subset_roll_counts: BTreeMap::new(),
            analysis: None,
        }
    }
}

/// What to do when the analysis backend cannot be reached
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum FailurePolicy {
    /// Stay in analysis and retry (default)
    #[default]
    Pause,
    /// Treat the step as passed
    Continue,
    /// Treat the step as failed and abort the rollout
    Abort,
}

/// Analysis configuration for the canary gate
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AnalysisConfig {
    /// Prometheus configuration; falls back to the controller default address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prometheus: Option<PrometheusConfig>,

    /// What to do when Prometheus is unreachable
    #[serde(rename = "failurePolicy", skip_serializing_if = "Option::is_none")]
    pub failure_policy: Option<FailurePolicy>,

    /// Metrics that must stay below their thresholds
    #[serde(default)]
    pub metrics: Vec<MetricConfig>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct PrometheusConfig {
    /// Prometheus server address (e.g., "http://prometheus:9090")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct MetricConfig {
    /// Metric name; `error-rate` and `latency-p95` have built-in queries
    pub name: String,

    /// Explicit PromQL, overrides the built-in template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Upper bound; the metric passes while at or below it
    pub threshold: f64,
}

/// Rollout phase of the canary state machine
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum RolloutPhase {
    #[default]
    Initializing,
    Decrementing,
    Baking,
    Analyzing,
    Converged,
    Aborted,
}

impl RolloutPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutPhase::Initializing => "Initializing",
            RolloutPhase::Decrementing => "Decrementing",
            RolloutPhase::Baking => "Baking",
            RolloutPhase::Analyzing => "Analyzing",
            RolloutPhase::Converged => "Converged",
            RolloutPhase::Aborted => "Aborted",
        }
    }
}

/// Status of the UnitedDeployment
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct UnitedDeploymentStatus {
    /// Generation of the spec the status was computed from
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Observed replicas across all subsets
    #[serde(default)]
    pub replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    /// Replicas running the updated revision
    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(rename = "updatedReadyReplicas", default)]
    pub updated_ready_replicas: i32,

    #[serde(rename = "currentRevision", skip_serializing_if = "Option::is_none")]
    pub current_revision: Option<String>,

    #[serde(rename = "updateRevision", skip_serializing_if = "Option::is_none")]
    pub update_revision: Option<String>,

    /// Hash salt; only ever increases
    #[serde(rename = "collisionCount", skip_serializing_if = "Option::is_none")]
    pub collision_count: Option<i32>,

    /// Pool name → desired replicas
    #[serde(
        rename = "subsetReplicas",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub subset_replicas: BTreeMap<String, i32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<SubsetStatus>,

    /// Rollout phase (canary strategy only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RolloutPhase>,

    /// Persisted canary bookkeeping, resumed on every reconcile
    #[serde(skip_serializing_if = "Option::is_none")]
    pub canary: Option<CanaryStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<UnitedDeploymentCondition>,
}

/// Observed state of one subset
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct SubsetStatus {
    pub name: String,

    #[serde(default)]
    pub kind: SubsetKind,

    /// Desired replicas
    #[serde(default)]
    pub replicas: i32,

    /// Partition set on the workload object
    #[serde(default)]
    pub partition: i32,

    #[serde(rename = "observedReplicas", default)]
    pub observed_replicas: i32,

    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,

    #[serde(rename = "updatedReplicas", default)]
    pub updated_replicas: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

/// Canary rollout bookkeeping
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct CanaryStatus {
    pub phase: RolloutPhase,

    /// Revision being rolled out
    pub revision: String,

    /// Last applied partition per pool
    #[serde(default)]
    pub partitions: BTreeMap<String, i32>,

    /// Number of applied steps (the initial hold-back counts as step 1)
    #[serde(default)]
    pub step: i32,

    /// When the last step was applied (RFC3339)
    #[serde(rename = "stepStartedAt", skip_serializing_if = "Option::is_none")]
    pub step_started_at: Option<String>,

    /// Spec generation the phase was entered at
    #[serde(default)]
    pub generation: i64,

    #[serde(rename = "lastAnalysis", skip_serializing_if = "Option::is_none")]
    pub last_analysis: Option<AnalysisOutcome>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct AnalysisOutcome {
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp
    pub time: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionType {
    /// Every subset object was applied
    SubsetProvisioned,
    /// Every replica runs the updated revision
    SubsetUpdated,
    /// The canary rollout was aborted by analysis
    RolloutDegraded,
    /// The spec passed runtime validation
    SpecValid,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct UnitedDeploymentCondition {
    #[serde(rename = "type")]
    pub type_: ConditionType,

    pub status: ConditionStatus,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// RFC3339 timestamp of the last status flip
    #[serde(rename = "lastTransitionTime", skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl UnitedDeploymentStatus {
    pub fn condition(&self, type_: ConditionType) -> Option<&UnitedDeploymentCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

#[cfg(test)]
#[path = "united_deployment_test.rs"]
mod tests;
