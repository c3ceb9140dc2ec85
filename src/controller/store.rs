//! Access to UnitedDeployment objects and their status subresource
//!
//! Status writes carry the observed `resourceVersion`; a conflicting write is
//! answered by re-reading the object and trying again within a fixed budget.

use crate::crd::{UnitedDeployment, UnitedDeploymentStatus};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Status write attempts before a conflict is surfaced
pub const STATUS_CONFLICT_RETRIES: usize = 5;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("Kubernetes API error: {0}")]
    Api(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Api(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match error {
            kube::Error::Api(err) if err.code == 404 => StoreError::NotFound(err.message.clone()),
            kube::Error::Api(err) if err.code == 409 && err.reason == "AlreadyExists" => {
                StoreError::AlreadyExists(err.message.clone())
            }
            kube::Error::Api(err) if err.code == 409 => StoreError::Conflict(err.message.clone()),
            other => StoreError::Api(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        StoreError::Serialization(error.to_string())
    }
}

#[async_trait]
pub trait UnitedDeploymentStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<UnitedDeployment>, StoreError>;

    /// Replace the whole status with `ud.status`, guarded by
    /// `ud.metadata.resourceVersion`
    async fn replace_status(&self, ud: &UnitedDeployment) -> Result<UnitedDeployment, StoreError>;
}

pub struct KubeUnitedDeploymentStore {
    client: kube::Client,
}

impl KubeUnitedDeploymentStore {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UnitedDeploymentStore for KubeUnitedDeploymentStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<UnitedDeployment>, StoreError> {
        let api: Api<UnitedDeployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(&self, ud: &UnitedDeployment) -> Result<UnitedDeployment, StoreError> {
        let namespace = ud.namespace().unwrap_or_default();
        let api: Api<UnitedDeployment> = Api::namespaced(self.client.clone(), &namespace);
        Ok(api
            .replace_status(&ud.name_any(), &PostParams::default(), status_body(ud)?)
            .await?)
    }
}

/// Body for a status PUT
///
/// The whole object goes over the wire, so fields missing from `ud.status`
/// are cleared on the server and a stale `resourceVersion` is answered with 409.
fn status_body(ud: &UnitedDeployment) -> Result<Vec<u8>, StoreError> {
    if ud.metadata.resource_version.is_none() {
        return Err(StoreError::Conflict(format!(
            "{} has no resourceVersion",
            ud.name_any()
        )));
    }
    Ok(serde_json::to_vec(ud)?)
}

/// Persist `status`, re-reading the object after every conflict
///
/// Returns the stored object, or `StoreError::Conflict` once
/// `STATUS_CONFLICT_RETRIES` writes have been rejected.
pub async fn write_status(
    store: &dyn UnitedDeploymentStore,
    ud: &UnitedDeployment,
    status: UnitedDeploymentStatus,
) -> Result<UnitedDeployment, StoreError> {
    let namespace = ud.namespace().unwrap_or_default();
    let name = ud.name_any();
    let mut latest = ud.clone();

    for attempt in 1..=STATUS_CONFLICT_RETRIES {
        latest.status = Some(status.clone());
        match store.replace_status(&latest).await {
            Ok(stored) => return Ok(stored),
            Err(StoreError::Conflict(message)) => {
                debug!(
                    united_deployment = %name,
                    attempt,
                    message = %message,
                    "Status write conflicted, re-fetching"
                );
                latest = store
                    .get(&namespace, &name)
                    .await?
                    .ok_or_else(|| StoreError::NotFound(name.clone()))?;
            }
            Err(e) => return Err(e),
        }
    }

    warn!(united_deployment = %name, "Status write retries exhausted");
    Err(StoreError::Conflict(format!(
        "status of {} still conflicting after {} attempts",
        name, STATUS_CONFLICT_RETRIES
    )))
}

/// In-memory store with resourceVersion bookkeeping and conflict injection
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryUnitedDeploymentStore {
    objects: std::sync::Arc<
        std::sync::Mutex<std::collections::BTreeMap<(String, String), UnitedDeployment>>,
    >,
    pending_conflicts: std::sync::Arc<std::sync::atomic::AtomicUsize>,
    version: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MemoryUnitedDeploymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self
            .version
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst)
            + 1)
        .to_string()
    }

    fn key(ud: &UnitedDeployment) -> (String, String) {
        (ud.namespace().unwrap_or_default(), ud.name_any())
    }

    /// Store an object as if created through the API
    pub fn insert(&self, mut ud: UnitedDeployment) -> UnitedDeployment {
        ud.metadata.resource_version = Some(self.next_version());
        if ud.metadata.generation.is_none() {
            ud.metadata.generation = Some(1);
        }
        self.objects
            .lock()
            .unwrap()
            .insert(Self::key(&ud), ud.clone());
        ud
    }

    /// Edit the spec, bumping generation like the API server does
    pub fn update_spec(
        &self,
        namespace: &str,
        name: &str,
        edit: impl FnOnce(&mut crate::crd::UnitedDeploymentSpec),
    ) -> UnitedDeployment {
        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let ud = objects
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap();
        edit(&mut ud.spec);
        ud.metadata.generation = Some(ud.metadata.generation.unwrap_or(1) + 1);
        ud.metadata.resource_version = Some(version);
        ud.clone()
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        self.objects
            .lock()
            .unwrap()
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// The next `n` status writes fail with a conflict
    pub fn inject_conflicts(&self, n: usize) {
        self.pending_conflicts
            .store(n, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn current(&self, namespace: &str, name: &str) -> Option<UnitedDeployment> {
        self.objects
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl UnitedDeploymentStore for MemoryUnitedDeploymentStore {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<UnitedDeployment>, StoreError> {
        Ok(self.current(namespace, name))
    }

    /// Mirrors a status PUT: the stored status is swapped out wholesale
    async fn replace_status(&self, ud: &UnitedDeployment) -> Result<UnitedDeployment, StoreError> {
        use std::sync::atomic::Ordering;

        let pending = self.pending_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_conflicts.store(pending - 1, Ordering::SeqCst);
            // Someone else wrote in between
            let version = self.next_version();
            if let Some(stored) = self.objects.lock().unwrap().get_mut(&Self::key(ud)) {
                stored.metadata.resource_version = Some(version);
            }
            return Err(StoreError::Conflict("injected".to_string()));
        }

        let version = self.next_version();
        let mut objects = self.objects.lock().unwrap();
        let stored = objects
            .get_mut(&Self::key(ud))
            .ok_or_else(|| StoreError::NotFound(ud.name_any()))?;
        if stored.metadata.resource_version != ud.metadata.resource_version {
            return Err(StoreError::Conflict(format!(
                "resourceVersion {:?} is stale",
                ud.metadata.resource_version
            )));
        }
        stored.status = ud.status.clone();
        stored.metadata.resource_version = Some(version);
        Ok(stored.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::UnitedDeploymentSpec;

    fn sample() -> UnitedDeployment {
        let spec: UnitedDeploymentSpec = serde_json::from_value(serde_json::json!({
            "selector": { "matchLabels": { "app": "web" } },
            "template": { "metadata": { "labels": { "app": "web" } } }
        }))
        .unwrap();
        let mut ud = UnitedDeployment::new("web", spec);
        ud.metadata.namespace = Some("default".to_string());
        ud
    }

    fn status(replicas: i32) -> UnitedDeploymentStatus {
        UnitedDeploymentStatus {
            replicas,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_write_status_succeeds_first_try() {
        let store = MemoryUnitedDeploymentStore::new();
        let ud = store.insert(sample());

        let stored = write_status(&store, &ud, status(3)).await.unwrap();

        assert_eq!(stored.status.unwrap().replicas, 3);
    }

    #[tokio::test]
    async fn test_write_status_retries_conflicts_within_budget() {
        let store = MemoryUnitedDeploymentStore::new();
        let ud = store.insert(sample());
        store.inject_conflicts(STATUS_CONFLICT_RETRIES - 1);

        let stored = write_status(&store, &ud, status(2)).await.unwrap();

        assert_eq!(stored.status.unwrap().replicas, 2);
    }

    #[tokio::test]
    async fn test_write_status_surfaces_conflict_after_budget() {
        let store = MemoryUnitedDeploymentStore::new();
        let ud = store.insert(sample());
        store.inject_conflicts(STATUS_CONFLICT_RETRIES);

        let result = write_status(&store, &ud, status(2)).await;

        assert!(matches!(result, Err(StoreError::Conflict(_))));
        assert!(store.current("default", "web").unwrap().status.is_none());
    }

    #[tokio::test]
    async fn test_stale_resource_version_is_refetched() {
        let store = MemoryUnitedDeploymentStore::new();
        let stale = store.insert(sample());
        store.update_spec("default", "web", |spec| spec.replicas = 5);

        let stored = write_status(&store, &stale, status(5)).await.unwrap();

        assert_eq!(stored.spec.replicas, 5);
        assert_eq!(stored.status.unwrap().replicas, 5);
    }

    #[tokio::test]
    async fn test_status_write_drops_fields_absent_from_new_status() {
        let store = MemoryUnitedDeploymentStore::new();
        let ud = store.insert(sample());
        let mut canary = status(6);
        canary.phase = Some(crate::crd::RolloutPhase::Baking);
        canary.subset_replicas.insert("a".to_string(), 4);
        canary.subset_replicas.insert("b".to_string(), 2);
        let ud = write_status(&store, &ud, canary).await.unwrap();

        let mut manual = status(4);
        manual.subset_replicas.insert("a".to_string(), 4);
        let stored = write_status(&store, &ud, manual).await.unwrap();

        let stored = stored.status.unwrap();
        assert_eq!(stored.phase, None);
        assert_eq!(stored.subset_replicas.len(), 1);
    }

    #[test]
    fn test_status_body_is_full_object_with_resource_version() {
        let mut ud = sample();
        ud.metadata.resource_version = Some("42".to_string());
        ud.status = Some(status(3));

        let body: serde_json::Value =
            serde_json::from_slice(&status_body(&ud).unwrap()).unwrap();

        assert_eq!(body["metadata"]["resourceVersion"], "42");
        assert_eq!(body["status"]["replicas"], 3);
        assert!(body["status"].get("phase").is_none());
        assert!(body["status"].get("canary").is_none());
    }

    #[test]
    fn test_status_body_requires_resource_version() {
        let ud = sample();
        assert!(matches!(status_body(&ud), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn test_conflict_is_transient() {
        assert!(StoreError::Conflict("x".into()).is_transient());
        assert!(!StoreError::NotFound("x".into()).is_transient());
    }
}
