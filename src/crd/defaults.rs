//! Defaulting for UnitedDeployment specs
//!
//! Applied by the mutating admission webhook and again, in memory, by the
//! reconciler so an object that bypassed admission is planned the same way.

use super::united_deployment::{CanaryUpdate, ManualUpdate, UnitedDeploymentSpec, UpdateStrategyType};

/// Weight given to a pool that declares neither weight nor replicas
pub const DEFAULT_SUBSET_WEIGHT: i32 = 1;

/// Fill in unset fields of a spec
///
/// - `manualUpdate` → empty when the type is Manual and the payload is absent
/// - `canaryUpdate` → `{rollCount: 1, bakeTimeSeconds: 2}` when the type is
///   Canary and the payload is absent
/// - pools with neither `weight` nor `replicas` → weight 1
///
/// `replicas` (1), `revisionHistoryLimit` (10) and the strategy type (Manual)
/// already default through serde when absent on the wire. Idempotent.
pub fn apply_defaults(spec: &mut UnitedDeploymentSpec) {
    let strategy = &mut spec.update_strategy;
    match strategy.type_ {
        UpdateStrategyType::Manual => {
            if strategy.manual_update.is_none() {
                strategy.manual_update = Some(ManualUpdate::default());
            }
        }
        UpdateStrategyType::Canary => {
            if strategy.canary_update.is_none() {
                strategy.canary_update = Some(CanaryUpdate::default());
            }
        }
    }

    for subset in &mut spec.topology.subsets {
        if subset.weight.is_none() && subset.replicas.is_none() {
            subset.weight = Some(DEFAULT_SUBSET_WEIGHT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::united_deployment::{SubsetDeclaration, UnitedDeployment};

    fn minimal_spec(yaml_spec: &str) -> UnitedDeploymentSpec {
        let yaml = format!(
            r#"
apiVersion: apps.united.io/v1alpha1
kind: UnitedDeployment
metadata:
  name: sample
spec:
{yaml_spec}
"#
        );
        let ud: UnitedDeployment = serde_yaml::from_str(&yaml).expect("valid fixture");
        ud.spec
    }

    #[test]
    fn test_defaults_for_empty_spec() {
        let mut spec = minimal_spec(
            r#"  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web"#,
        );

        apply_defaults(&mut spec);

        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.revision_history_limit, 10);
        assert_eq!(spec.update_strategy.type_, UpdateStrategyType::Manual);
        assert_eq!(
            spec.update_strategy.manual_update,
            Some(ManualUpdate::default())
        );
        assert!(spec.update_strategy.canary_update.is_none());
    }

    #[test]
    fn test_defaults_canary_parameters() {
        let mut spec = minimal_spec(
            r#"  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
  updateStrategy:
    type: Canary"#,
        );

        apply_defaults(&mut spec);

        let canary = spec.update_strategy.canary_update.expect("canary defaulted");
        assert_eq!(canary.roll_count, 1);
        assert_eq!(canary.bake_time_seconds, 2);
        assert!(spec.update_strategy.manual_update.is_none());
    }

    #[test]
    fn test_defaults_keep_explicit_canary_parameters() {
        let mut spec = minimal_spec(
            r#"  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
  updateStrategy:
    type: Canary
    canaryUpdate:
      rollCount: 3
      bakeTimeSeconds: 60"#,
        );

        apply_defaults(&mut spec);

        let canary = spec.update_strategy.canary_update.expect("canary kept");
        assert_eq!(canary.roll_count, 3);
        assert_eq!(canary.bake_time_seconds, 60);
    }

    #[test]
    fn test_defaults_pool_weight() {
        let mut spec = minimal_spec(
            r#"  replicas: 4
  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
  topology:
    subsets:
    - name: zone-a
    - name: zone-b
      replicas: 1"#,
        );

        apply_defaults(&mut spec);

        assert_eq!(
            spec.topology.subsets[0],
            SubsetDeclaration {
                name: "zone-a".to_string(),
                weight: Some(DEFAULT_SUBSET_WEIGHT),
                ..Default::default()
            }
        );
        assert_eq!(spec.topology.subsets[1].weight, None);
        assert_eq!(spec.topology.subsets[1].replicas, Some(1));
    }

    #[test]
    fn test_defaults_are_idempotent() {
        let mut spec = minimal_spec(
            r#"  selector:
    matchLabels:
      app: web
  template:
    metadata:
      labels:
        app: web
  topology:
    subsets:
    - name: zone-a"#,
        );

        apply_defaults(&mut spec);
        let once = spec.clone();
        apply_defaults(&mut spec);

        assert_eq!(once.topology, spec.topology);
        assert_eq!(once.update_strategy, spec.update_strategy);
    }
}
