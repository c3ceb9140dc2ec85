//! Per-pool workload objects ("subsets")
//!
//! Each pool of a UnitedDeployment is materialized as one workload object of
//! the pool's declared kind. `SubsetControl` hides the kind behind
//! list/apply/delete, and `SubsetControls` maps each kind to its adapter.
//!
//! Both supported kinds are StatefulSet-shaped, so the desired object is built
//! once here as JSON and each adapter only decides how to talk to the API.

pub mod advanced;
pub mod statefulset;

use crate::controller::revision::compute_revision_hash;
use crate::crd::{
    SubsetDeclaration, SubsetKind, UnitedDeployment, REVISION_LABEL, SUBSET_LABEL,
    UNITED_DEPLOYMENT_LABEL,
};
use async_trait::async_trait;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub use advanced::AdvancedStatefulSetControl;
pub use statefulset::StatefulSetControl;

/// Fingerprint of the last applied desired state
pub const SUBSET_HASH_ANNOTATION: &str = "apps.united.io/subset-hash";

#[derive(Debug, Error)]
pub enum SubsetError {
    #[error("Kubernetes API error: {0}")]
    Api(String),

    #[error("conflict writing subset {0}")]
    Conflict(String),

    #[error("failed to build subset object: {0}")]
    Build(#[from] serde_json::Error),

    #[error("no subset control registered for kind {0}")]
    Unsupported(&'static str),
}

impl SubsetError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SubsetError::Api(_) | SubsetError::Conflict(_))
    }
}

impl From<kube::Error> for SubsetError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(err) if err.code == 409 => SubsetError::Conflict(err.message.clone()),
            other => SubsetError::Api(other.to_string()),
        }
    }
}

/// Counts reported by a subset's workload status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ObservedCounts {
    pub replicas: i32,
    pub ready_replicas: i32,
    pub updated_replicas: i32,
    pub updated_ready_replicas: i32,
}

/// A materialized subset as found in the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subset {
    pub pool: String,
    pub object_name: String,
    pub kind: SubsetKind,
    pub replicas: i32,
    pub partition: i32,
    /// Revision the pod template was built from
    pub revision: Option<String>,
    pub observed: ObservedCounts,
}

/// What a subset should look like
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetTarget {
    pub declaration: SubsetDeclaration,
    pub replicas: i32,
    pub partition: i32,
}

impl SubsetTarget {
    pub fn pool(&self) -> &str {
        &self.declaration.name
    }

    pub fn kind(&self) -> SubsetKind {
        self.declaration.kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
}

#[async_trait]
pub trait SubsetControl: Send + Sync {
    fn kind(&self) -> SubsetKind;

    /// Every object of this kind owned by `ud`, with observed counts
    async fn list_subsets(&self, ud: &UnitedDeployment) -> Result<Vec<Subset>, SubsetError>;

    /// Create or update so the object matches `target` at `revision`
    ///
    /// Applying an unchanged target is a no-op.
    async fn apply_subset(
        &self,
        ud: &UnitedDeployment,
        target: &SubsetTarget,
        revision: &str,
    ) -> Result<ApplyOutcome, SubsetError>;

    /// Remove the object; an already deleted object is not an error
    async fn delete_subset(&self, ud: &UnitedDeployment, subset: &Subset)
        -> Result<(), SubsetError>;
}

/// Adapters by kind, assembled once at startup
#[derive(Clone, Default)]
pub struct SubsetControls {
    controls: BTreeMap<SubsetKind, Arc<dyn SubsetControl>>,
}

impl SubsetControls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, control: Arc<dyn SubsetControl>) -> Self {
        self.controls.insert(control.kind(), control);
        self
    }

    pub fn get(&self, kind: SubsetKind) -> Result<&Arc<dyn SubsetControl>, SubsetError> {
        self.controls
            .get(&kind)
            .ok_or(SubsetError::Unsupported(kind.as_str()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<dyn SubsetControl>> {
        self.controls.values()
    }
}

/// Object name for a pool's subset
pub fn subset_object_name(ud_name: &str, pool: &str) -> String {
    format!("{}-{}", ud_name, pool)
}

/// Desired subset object, kind-neutral
#[derive(Debug, Clone)]
pub struct SubsetObject {
    pub name: String,
    pub value: serde_json::Value,
    pub fingerprint: String,
}

/// Build the StatefulSet-shaped object for `target`
///
/// - labels: owner, pool, revision (object, selector and pod template)
/// - pool placement merged into required node affinity; tolerations appended
/// - `rollingUpdate.partition` holds back `target.partition` replicas
/// - controller owner reference to `ud`
pub fn build_subset_object(
    ud: &UnitedDeployment,
    target: &SubsetTarget,
    revision: &str,
    api_version: &str,
) -> Result<SubsetObject, SubsetError> {
    let ud_name = ud.name_any();
    let pool = target.pool();
    let name = subset_object_name(&ud_name, pool);

    let labels = BTreeMap::from([
        (UNITED_DEPLOYMENT_LABEL.to_string(), ud_name.clone()),
        (SUBSET_LABEL.to_string(), pool.to_string()),
        (REVISION_LABEL.to_string(), revision.to_string()),
    ]);

    let mut selector = ud.spec.selector.clone();
    selector
        .match_labels
        .get_or_insert_with(BTreeMap::new)
        .insert(SUBSET_LABEL.to_string(), pool.to_string());

    let mut template = ud.spec.template.clone();
    template
        .metadata
        .get_or_insert_with(Default::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .extend(labels.clone());

    let pod_spec = template.spec.get_or_insert_with(Default::default);
    if let Some(term) = &target.declaration.node_selector_term {
        let required = pod_spec
            .affinity
            .get_or_insert_with(Default::default)
            .node_affinity
            .get_or_insert_with(Default::default)
            .required_during_scheduling_ignored_during_execution
            .get_or_insert_with(Default::default);
        if required.node_selector_terms.is_empty() {
            required.node_selector_terms.push(term.clone());
        } else {
            // Terms are ORed, so the pool constraint is ANDed into each one
            for existing in &mut required.node_selector_terms {
                if let Some(expressions) = &term.match_expressions {
                    existing
                        .match_expressions
                        .get_or_insert_with(Vec::new)
                        .extend(expressions.iter().cloned());
                }
                if let Some(fields) = &term.match_fields {
                    existing
                        .match_fields
                        .get_or_insert_with(Vec::new)
                        .extend(fields.iter().cloned());
                }
            }
        }
    }
    if !target.declaration.tolerations.is_empty() {
        pod_spec
            .tolerations
            .get_or_insert_with(Vec::new)
            .extend(target.declaration.tolerations.iter().cloned());
    }

    let spec = serde_json::json!({
        "replicas": target.replicas,
        "serviceName": ud_name,
        "selector": selector,
        "template": template,
        "updateStrategy": {
            "type": "RollingUpdate",
            "rollingUpdate": { "partition": target.partition },
        },
    });
    let fingerprint = compute_revision_hash(
        &serde_json::json!({ "labels": labels, "spec": spec }),
        0,
    );

    let owner_references: Vec<_> = ud.controller_owner_ref(&()).into_iter().collect();
    let value = serde_json::json!({
        "apiVersion": api_version,
        "kind": "StatefulSet",
        "metadata": {
            "name": name,
            "namespace": ud.namespace(),
            "labels": labels,
            "annotations": { SUBSET_HASH_ANNOTATION: fingerprint },
            "ownerReferences": owner_references,
        },
        "spec": spec,
    });

    Ok(SubsetObject {
        name,
        value,
        fingerprint,
    })
}

/// In-memory subset control
///
/// Applied subsets report themselves fully rolled out immediately: every
/// replica ready, `replicas - partition` of them updated.
#[cfg(test)]
#[derive(Clone)]
pub struct MockSubsetControl {
    kind: SubsetKind,
    subsets: Arc<std::sync::Mutex<BTreeMap<String, (Subset, String)>>>,
    failing_pools: Arc<std::sync::Mutex<std::collections::BTreeSet<String>>>,
    applies: Arc<std::sync::atomic::AtomicUsize>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockSubsetControl {
    pub fn new(kind: SubsetKind) -> Self {
        Self {
            kind,
            subsets: Default::default(),
            failing_pools: Default::default(),
            applies: Default::default(),
        }
    }

    /// Applies for `pool` fail until `recover_pool`
    pub fn fail_pool(&self, pool: &str) {
        self.failing_pools.lock().unwrap().insert(pool.to_string());
    }

    pub fn recover_pool(&self, pool: &str) {
        self.failing_pools.lock().unwrap().remove(pool);
    }

    /// Seed an object as if created by someone else
    pub fn insert(&self, subset: Subset) {
        self.subsets
            .lock()
            .unwrap()
            .insert(subset.object_name.clone(), (subset, String::new()));
    }

    pub fn subset(&self, pool: &str) -> Option<Subset> {
        self.subsets
            .lock()
            .unwrap()
            .values()
            .map(|(s, _)| s.clone())
            .find(|s| s.pool == pool)
    }

    pub fn partition(&self, pool: &str) -> Option<i32> {
        self.subset(pool).map(|s| s.partition)
    }

    pub fn object_names(&self) -> Vec<String> {
        self.subsets.lock().unwrap().keys().cloned().collect()
    }

    /// Writes that changed something
    pub fn apply_count(&self) -> usize {
        self.applies.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl SubsetControl for MockSubsetControl {
    fn kind(&self) -> SubsetKind {
        self.kind
    }

    async fn list_subsets(&self, _ud: &UnitedDeployment) -> Result<Vec<Subset>, SubsetError> {
        Ok(self
            .subsets
            .lock()
            .unwrap()
            .values()
            .map(|(s, _)| s.clone())
            .collect())
    }

    async fn apply_subset(
        &self,
        ud: &UnitedDeployment,
        target: &SubsetTarget,
        revision: &str,
    ) -> Result<ApplyOutcome, SubsetError> {
        if self.failing_pools.lock().unwrap().contains(target.pool()) {
            return Err(SubsetError::Api(format!(
                "injected failure for {}",
                target.pool()
            )));
        }

        let object = build_subset_object(ud, target, revision, "test/v1")?;
        let mut subsets = self.subsets.lock().unwrap();
        let outcome = match subsets.get(&object.name) {
            Some((_, fingerprint)) if *fingerprint == object.fingerprint => {
                return Ok(ApplyOutcome::Unchanged)
            }
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };

        let updated = target.replicas - target.partition;
        let subset = Subset {
            pool: target.pool().to_string(),
            object_name: object.name.clone(),
            kind: self.kind,
            replicas: target.replicas,
            partition: target.partition,
            revision: Some(revision.to_string()),
            observed: ObservedCounts {
                replicas: target.replicas,
                ready_replicas: target.replicas,
                updated_replicas: updated,
                updated_ready_replicas: updated,
            },
        };
        subsets.insert(object.name, (subset, object.fingerprint));
        self.applies
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        Ok(outcome)
    }

    async fn delete_subset(
        &self,
        _ud: &UnitedDeployment,
        subset: &Subset,
    ) -> Result<(), SubsetError> {
        self.subsets.lock().unwrap().remove(&subset.object_name);
        Ok(())
    }
}
