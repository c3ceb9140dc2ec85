//! OpenKruise Advanced StatefulSet (`apps.kruise.io/v1beta1`) subsets
//!
//! Accessed as `DynamicObject` so no Kruise type crate is needed.

use super::{
    build_subset_object, ApplyOutcome, ObservedCounts, Subset, SubsetControl, SubsetError,
    SubsetTarget, SUBSET_HASH_ANNOTATION,
};
use crate::crd::{SubsetKind, UnitedDeployment, REVISION_LABEL, SUBSET_LABEL, UNITED_DEPLOYMENT_LABEL};
use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::DynamicObject;
use kube::discovery::ApiResource;
use kube::ResourceExt;
use tracing::{debug, info};

pub const KRUISE_API_VERSION: &str = "apps.kruise.io/v1beta1";

pub fn advanced_statefulset_resource() -> ApiResource {
    ApiResource {
        group: "apps.kruise.io".to_string(),
        version: "v1beta1".to_string(),
        api_version: KRUISE_API_VERSION.to_string(),
        kind: "StatefulSet".to_string(),
        plural: "statefulsets".to_string(),
    }
}

pub struct AdvancedStatefulSetControl {
    client: kube::Client,
    resource: ApiResource,
}

impl AdvancedStatefulSetControl {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            resource: advanced_statefulset_resource(),
        }
    }

    fn api(&self, ud: &UnitedDeployment) -> Api<DynamicObject> {
        Api::namespaced_with(
            self.client.clone(),
            &ud.namespace().unwrap_or_default(),
            &self.resource,
        )
    }
}

fn int_at(value: &serde_json::Value, pointer: &str) -> i32 {
    value
        .pointer(pointer)
        .and_then(|v| v.as_i64())
        .unwrap_or(0) as i32
}

pub(crate) fn subset_from_dynamic(obj: &DynamicObject) -> Option<Subset> {
    let labels = obj.labels();
    let pool = labels.get(SUBSET_LABEL)?.clone();
    let data = &obj.data;

    let ready = int_at(data, "/status/readyReplicas");
    let updated = int_at(data, "/status/updatedReplicas");
    let updated_ready = data
        .pointer("/status/updatedReadyReplicas")
        .and_then(|v| v.as_i64())
        .map(|v| v as i32)
        .unwrap_or_else(|| ready.min(updated));

    Some(Subset {
        pool,
        object_name: obj.name_any(),
        kind: SubsetKind::AdvancedStatefulSet,
        replicas: int_at(data, "/spec/replicas"),
        partition: int_at(data, "/spec/updateStrategy/rollingUpdate/partition"),
        revision: labels.get(REVISION_LABEL).cloned(),
        observed: ObservedCounts {
            replicas: int_at(data, "/status/replicas"),
            ready_replicas: ready,
            updated_replicas: updated,
            updated_ready_replicas: updated_ready,
        },
    })
}

#[async_trait]
impl SubsetControl for AdvancedStatefulSetControl {
    fn kind(&self) -> SubsetKind {
        SubsetKind::AdvancedStatefulSet
    }

    async fn list_subsets(&self, ud: &UnitedDeployment) -> Result<Vec<Subset>, SubsetError> {
        let selector = format!("{}={}", UNITED_DEPLOYMENT_LABEL, ud.name_any());
        let list = self
            .api(ud)
            .list(&ListParams::default().labels(&selector))
            .await?;
        Ok(list.items.iter().filter_map(subset_from_dynamic).collect())
    }

    async fn apply_subset(
        &self,
        ud: &UnitedDeployment,
        target: &SubsetTarget,
        revision: &str,
    ) -> Result<ApplyOutcome, SubsetError> {
        let object = build_subset_object(ud, target, revision, KRUISE_API_VERSION)?;
        let mut desired: DynamicObject = serde_json::from_value(object.value)?;
        let api = self.api(ud);

        match api.get_opt(&object.name).await? {
            None => {
                api.create(&PostParams::default(), &desired).await?;
                info!(
                    united_deployment = %ud.name_any(),
                    subset = %target.pool(),
                    replicas = target.replicas,
                    partition = target.partition,
                    "Created Advanced StatefulSet subset"
                );
                Ok(ApplyOutcome::Created)
            }
            Some(existing)
                if existing.annotations().get(SUBSET_HASH_ANNOTATION)
                    == Some(&object.fingerprint) =>
            {
                debug!(subset = %target.pool(), "Advanced StatefulSet subset already up to date");
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
                    "Updated Advanced StatefulSet subset"
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
    fn test_subset_from_dynamic_object() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": KRUISE_API_VERSION,
            "kind": "StatefulSet",
            "metadata": {
                "name": "web-zone-b",
                "labels": { SUBSET_LABEL: "zone-b", REVISION_LABEL: "web-def" }
            },
            "spec": {
                "replicas": 2,
                "updateStrategy": { "rollingUpdate": { "partition": 1 } }
            },
            "status": {
                "replicas": 2,
                "readyReplicas": 2,
                "updatedReplicas": 1,
                "updatedReadyReplicas": 0
            }
        }))
        .unwrap();

        let subset = subset_from_dynamic(&obj).unwrap();

        assert_eq!(subset.kind, SubsetKind::AdvancedStatefulSet);
        assert_eq!(subset.pool, "zone-b");
        assert_eq!(subset.replicas, 2);
        assert_eq!(subset.partition, 1);
        assert_eq!(subset.observed.updated_ready_replicas, 0);
    }

    #[test]
    fn test_resource_coordinates() {
        let ar = advanced_statefulset_resource();
        assert_eq!(ar.api_version, "apps.kruise.io/v1beta1");
        assert_eq!(ar.plural, "statefulsets");
    }
}
