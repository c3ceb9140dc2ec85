//! Template revision history
//!
//! Every distinct pod template gets an immutable `ControllerRevision` named
//! `<ud>-<hash>`. The hash covers the serialized template salted with the
//! collision count, so two templates that hash alike are separated by bumping
//! the count until a free name is found.

use crate::controller::store::StoreError;
use crate::crd::{UnitedDeployment, REVISION_HASH_LABEL, UNITED_DEPLOYMENT_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ControllerRevision;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::runtime::RawExtension;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info};

/// Attempts at finding a free hash before giving up
pub const MAX_COLLISION_ATTEMPTS: i32 = 16;

const HASH_LEN: usize = 10;

#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("revision store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to serialize pod template: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no free revision name after {0} hash collisions")]
    CollisionsExhausted(i32),
}

impl RevisionError {
    pub fn is_transient(&self) -> bool {
        match self {
            RevisionError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Immutable template snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Revision {
    pub name: String,
    pub hash: String,
    pub number: i64,
    pub template: serde_json::Value,
}

#[async_trait]
pub trait RevisionStore: Send + Sync {
    /// Revisions owned by `ud`, any order
    async fn list(&self, ud: &UnitedDeployment) -> Result<Vec<Revision>, StoreError>;

    async fn get(&self, ud: &UnitedDeployment, name: &str)
        -> Result<Option<Revision>, StoreError>;

    /// Fails with `StoreError::AlreadyExists` when the name is taken
    async fn create(&self, ud: &UnitedDeployment, revision: &Revision)
        -> Result<Revision, StoreError>;

    async fn renumber(
        &self,
        ud: &UnitedDeployment,
        name: &str,
        number: i64,
    ) -> Result<Revision, StoreError>;

    /// Deleting a missing revision succeeds
    async fn delete(&self, ud: &UnitedDeployment, name: &str) -> Result<(), StoreError>;
}

/// FNV-1a over the template JSON, salted with a non-zero collision count
pub fn compute_revision_hash(template: &serde_json::Value, collision_count: i32) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    let mut feed = |bytes: &[u8]| {
        for byte in bytes {
            hash ^= *byte as u64;
            hash = hash.wrapping_mul(PRIME);
        }
    };
    feed(template.to_string().as_bytes());
    if collision_count > 0 {
        feed(&collision_count.to_le_bytes());
    }

    let hex = format!("{:016x}", hash);
    hex[..HASH_LEN].to_string()
}

pub fn revision_name(ud_name: &str, hash: &str) -> String {
    format!("{}-{}", ud_name, hash)
}

/// Result of resolving the revision for the spec's current template
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionOutcome {
    pub revision: Revision,
    pub created: bool,
    /// Collision count to persist; never lower than the one passed in
    pub collision_count: i32,
}

/// Find or create the revision for `ud.spec.template`
///
/// - an equivalent revision is reused; if it is not the newest it is
///   re-numbered to the top (rollback to an earlier template)
/// - a name taken by a different template bumps the collision count and
///   rehashes, at most `MAX_COLLISION_ATTEMPTS` times
/// - a name taken by an equivalent template (concurrent writer) is reused
pub async fn get_or_create_revision(
    store: &dyn RevisionStore,
    ud: &UnitedDeployment,
    collision_count: i32,
) -> Result<RevisionOutcome, RevisionError> {
    let template = serde_json::to_value(&ud.spec.template)?;
    let revisions = store.list(ud).await?;
    let latest_number = revisions.iter().map(|r| r.number).max().unwrap_or(0);

    if let Some(existing) = revisions.iter().find(|r| r.template == template) {
        let revision = if existing.number == latest_number {
            existing.clone()
        } else {
            debug!(
                united_deployment = %ud.name_any(),
                revision = %existing.name,
                number = latest_number + 1,
                "Re-numbering equivalent revision"
            );
            store.renumber(ud, &existing.name, latest_number + 1).await?
        };
        return Ok(RevisionOutcome {
            revision,
            created: false,
            collision_count,
        });
    }

    let ud_name = ud.name_any();
    let mut count = collision_count.max(0);
    for _ in 0..MAX_COLLISION_ATTEMPTS {
        let hash = compute_revision_hash(&template, count);
        let candidate = Revision {
            name: revision_name(&ud_name, &hash),
            hash,
            number: latest_number + 1,
            template: template.clone(),
        };

        match store.create(ud, &candidate).await {
            Ok(revision) => {
                info!(
                    united_deployment = %ud_name,
                    revision = %revision.name,
                    number = revision.number,
                    "Created revision"
                );
                return Ok(RevisionOutcome {
                    revision,
                    created: true,
                    collision_count: count,
                });
            }
            Err(StoreError::AlreadyExists(_)) => {
                match store.get(ud, &candidate.name).await? {
                    Some(existing) if existing.template == template => {
                        return Ok(RevisionOutcome {
                            revision: existing,
                            created: false,
                            collision_count: count,
                        });
                    }
                    _ => {
                        debug!(
                            united_deployment = %ud_name,
                            revision = %candidate.name,
                            collision_count = count + 1,
                            "Revision hash collision"
                        );
                        count += 1;
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(RevisionError::CollisionsExhausted(MAX_COLLISION_ATTEMPTS))
}

/// Current revision: the recorded one while it still exists, else the update revision
pub fn resolve_current_revision(
    recorded: Option<&str>,
    revisions: &[Revision],
    update: &Revision,
) -> String {
    recorded
        .filter(|name| revisions.iter().any(|r| r.name == *name))
        .map(str::to_string)
        .unwrap_or_else(|| update.name.clone())
}

/// Delete the oldest revisions beyond `limit`, never touching `keep`
///
/// Returns the names deleted, oldest first.
pub async fn prune(
    store: &dyn RevisionStore,
    ud: &UnitedDeployment,
    limit: i32,
    keep: &[&str],
) -> Result<Vec<String>, RevisionError> {
    let mut candidates: Vec<Revision> = store
        .list(ud)
        .await?
        .into_iter()
        .filter(|r| !keep.contains(&r.name.as_str()))
        .collect();
    let limit = limit.max(0) as usize;
    if candidates.len() <= limit {
        return Ok(Vec::new());
    }

    candidates.sort_by_key(|r| r.number);
    let excess = candidates.len() - limit;
    let mut deleted = Vec::with_capacity(excess);
    for revision in candidates.into_iter().take(excess) {
        store.delete(ud, &revision.name).await?;
        deleted.push(revision.name);
    }

    debug!(
        united_deployment = %ud.name_any(),
        deleted = ?deleted,
        "Pruned revision history"
    );
    Ok(deleted)
}

pub struct KubeRevisionStore {
    client: kube::Client,
}

impl KubeRevisionStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, ud: &UnitedDeployment) -> Api<ControllerRevision> {
        Api::namespaced(self.client.clone(), &ud.namespace().unwrap_or_default())
    }
}

fn from_controller_revision(cr: ControllerRevision) -> Revision {
    let name = cr.name_any();
    let hash = cr
        .labels()
        .get(REVISION_HASH_LABEL)
        .cloned()
        .unwrap_or_else(|| name.rsplit('-').next().unwrap_or_default().to_string());
    Revision {
        name,
        hash,
        number: cr.revision,
        template: cr.data.map(|d| d.0).unwrap_or(serde_json::Value::Null),
    }
}

fn to_controller_revision(ud: &UnitedDeployment, revision: &Revision) -> ControllerRevision {
    let labels = BTreeMap::from([
        (UNITED_DEPLOYMENT_LABEL.to_string(), ud.name_any()),
        (REVISION_HASH_LABEL.to_string(), revision.hash.clone()),
    ]);
    ControllerRevision {
        metadata: ObjectMeta {
            name: Some(revision.name.clone()),
            namespace: ud.namespace(),
            labels: Some(labels),
            owner_references: ud.controller_owner_ref(&()).map(|r| vec![r]),
            ..Default::default()
        },
        data: Some(RawExtension(revision.template.clone())),
        revision: revision.number,
    }
}

#[async_trait]
impl RevisionStore for KubeRevisionStore {
    async fn list(&self, ud: &UnitedDeployment) -> Result<Vec<Revision>, StoreError> {
        let selector = format!("{}={}", UNITED_DEPLOYMENT_LABEL, ud.name_any());
        let list = self
            .api(ud)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items.into_iter().map(from_controller_revision).collect())
    }

    async fn get(
        &self,
        ud: &UnitedDeployment,
        name: &str,
    ) -> Result<Option<Revision>, StoreError> {
        Ok(self.api(ud).get_opt(name).await?.map(from_controller_revision))
    }

    async fn create(
        &self,
        ud: &UnitedDeployment,
        revision: &Revision,
    ) -> Result<Revision, StoreError> {
        let created = self
            .api(ud)
            .create(&PostParams::default(), &to_controller_revision(ud, revision))
            .await?;
        Ok(from_controller_revision(created))
    }

    async fn renumber(
        &self,
        ud: &UnitedDeployment,
        name: &str,
        number: i64,
    ) -> Result<Revision, StoreError> {
        let patched = self
            .api(ud)
            .patch(
                name,
                &PatchParams::default(),
                &Patch::Merge(&serde_json::json!({ "revision": number })),
            )
            .await?;
        Ok(from_controller_revision(patched))
    }

    async fn delete(&self, ud: &UnitedDeployment, name: &str) -> Result<(), StoreError> {
        match self.api(ud).delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory revision store keyed by owner and revision name
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryRevisionStore {
    revisions: std::sync::Arc<std::sync::Mutex<BTreeMap<(String, String), Revision>>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a revision directly, bypassing name checks
    pub fn insert(&self, owner: &str, revision: Revision) {
        self.revisions
            .lock()
            .unwrap()
            .insert((owner.to_string(), revision.name.clone()), revision);
    }

    pub fn names(&self, owner: &str) -> Vec<String> {
        self.revisions
            .lock()
            .unwrap()
            .keys()
            .filter(|(o, _)| o == owner)
            .map(|(_, name)| name.clone())
            .collect()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl RevisionStore for MemoryRevisionStore {
    async fn list(&self, ud: &UnitedDeployment) -> Result<Vec<Revision>, StoreError> {
        let owner = ud.name_any();
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .iter()
            .filter(|((o, _), _)| *o == owner)
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn get(
        &self,
        ud: &UnitedDeployment,
        name: &str,
    ) -> Result<Option<Revision>, StoreError> {
        Ok(self
            .revisions
            .lock()
            .unwrap()
            .get(&(ud.name_any(), name.to_string()))
            .cloned())
    }

    async fn create(
        &self,
        ud: &UnitedDeployment,
        revision: &Revision,
    ) -> Result<Revision, StoreError> {
        let key = (ud.name_any(), revision.name.clone());
        let mut revisions = self.revisions.lock().unwrap();
        if revisions.contains_key(&key) {
            return Err(StoreError::AlreadyExists(revision.name.clone()));
        }
        revisions.insert(key, revision.clone());
        Ok(revision.clone())
    }

    async fn renumber(
        &self,
        ud: &UnitedDeployment,
        name: &str,
        number: i64,
    ) -> Result<Revision, StoreError> {
        let mut revisions = self.revisions.lock().unwrap();
        let revision = revisions
            .get_mut(&(ud.name_any(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        revision.number = number;
        Ok(revision.clone())
    }

    async fn delete(&self, ud: &UnitedDeployment, name: &str) -> Result<(), StoreError> {
        self.revisions
            .lock()
            .unwrap()
            .remove(&(ud.name_any(), name.to_string()));
        Ok(())
    }
}

#[cfg(test)]
#[path = "revision_test.rs"]
mod tests;
