//! `apps/v1` StatefulSet subsets

use super::{
    build_subset_object, ApplyOutcome, ObservedCounts, Subset, SubsetControl, SubsetError,
    SubsetTarget, SUBSET_HASH_ANNOTATION,
};
use crate::crd::{SubsetKind, UnitedDeployment, REVISION_LABEL, SUBSET_LABEL, UNITED_DEPLOYMENT_LABEL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::ResourceExt;
use tracing::{debug, info};

pub struct StatefulSetControl {
    client: kube::Client,
}

impl StatefulSetControl {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn api(&self, ud: &UnitedDeployment) -> Api<StatefulSet> {
        Api::namespaced(self.client.clone(), &ud.namespace().unwrap_or_default())
    }
}

/// Read a StatefulSet back into a `Subset`; objects without a pool label are skipped
pub(crate) fn subset_from_statefulset(sts: &StatefulSet) -> Option<Subset> {
    let labels = sts.labels();
    let pool = labels.get(SUBSET_LABEL)?.clone();
    let spec = sts.spec.as_ref();
    let status = sts.status.as_ref();

    let partition = spec
        .and_then(|s| s.update_strategy.as_ref())
        .and_then(|u| u.rolling_update.as_ref())
        .and_then(|r| r.partition)
        .unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);

    Some(Subset {
        pool,
        object_name: sts.name_any(),
        kind: SubsetKind::StatefulSet,
        replicas: spec.and_then(|s| s.replicas).unwrap_or(0),
        partition,
        revision: labels.get(REVISION_LABEL).cloned(),
        observed: ObservedCounts {
            replicas: status.map(|s| s.replicas).unwrap_or(0),
            ready_replicas: ready,
            updated_replicas: updated,
            updated_ready_replicas: ready.min(updated),
        },
    })
}

#[async_trait]
impl SubsetControl for StatefulSetControl {
    fn kind(&self) -> SubsetKind {
        SubsetKind::StatefulSet
    }

    async fn list_subsets(&self, ud: &UnitedDeployment) -> Result<Vec<Subset>, SubsetError> {
        let selector = format!("{}={}", UNITED_DEPLOYMENT_LABEL, ud.name_any());
        let list = self
            .api(ud)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items.iter().filter_map(subset_from_statefulset).collect())
    }

    async fn apply_subset(
        &self,
        ud: &UnitedDeployment,
        target: &SubsetTarget,
        revision: &str,
    ) -> Result<ApplyOutcome, SubsetError> {
        let object = build_subset_object(ud, target, revision, "apps/v1")?;
        let mut desired: StatefulSet = serde_json::from_value(object.value)?;
        let api = self.api(ud);

        match api.get_opt(&object.name).await? {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(
                    united_deployment = %ud.name_any(),
                    subset = %target.pool(),
                    replicas = target.replicas,
                    partition = target.partition,
                    "Created StatefulSet subset"
                );
                Ok(ApplyOutcome::Created)
            }
            Some(existing)
                if existing.annotations().get(SUBSET_HASH_ANNOTATION)
                    == Some(&object.fingerprint) =>
            {
                debug!(subset = %target.pool(), "StatefulSet subset already up to date");
                Ok(ApplyOutcome::Unchanged)
            }
            Some(existing) => {
                desired.metadata.resource_version = existing.resource_version();
                api.replace(&object.name, &PostParams::default(), &desired)
                    .await?;
                info!(
                    united_deployment = %ud.name_any(),
                    subset = %target.pool(),
                    replicas = target.replicas,
                    partition = target.partition,
                    "Updated StatefulSet subset"
                );
                Ok(ApplyOutcome::Updated)
            }
        }
    }

    async fn delete_subset(
        &self,
        ud: &UnitedDeployment,
        subset: &Subset,
    ) -> Result<(), SubsetError> {
        match self
            .api(ud)
            .delete(&subset.object_name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subset_from_statefulset() {
        let sts: StatefulSet = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {
                "name": "web-zone-a",
                "labels": {
                    UNITED_DEPLOYMENT_LABEL: "web",
                    SUBSET_LABEL: "zone-a",
                    REVISION_LABEL: "web-abc"
                }
            },
            "spec": {
                "replicas": 4,
                "serviceName": "web",
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "metadata": { "labels": { "app": "web" } } },
                "updateStrategy": { "type": "RollingUpdate", "rollingUpdate": { "partition": 3 } }
            },
            "status": { "replicas": 4, "readyReplicas": 4, "updatedReplicas": 1 }
        }))
        .unwrap();

        let subset = subset_from_statefulset(&sts).unwrap();

        assert_eq!(subset.pool, "zone-a");
        assert_eq!(subset.replicas, 4);
        assert_eq!(subset.partition, 3);
        assert_eq!(subset.revision.as_deref(), Some("web-abc"));
        assert_eq!(subset.observed.ready_replicas, 4);
        assert_eq!(subset.observed.updated_replicas, 1);
        assert_eq!(subset.observed.updated_ready_replicas, 1);
    }

    #[test]
    fn test_statefulset_without_pool_label_is_skipped() {
        let sts: StatefulSet = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": "stray" }
        }))
        .unwrap();

        assert!(subset_from_statefulset(&sts).is_none());
    }
}
