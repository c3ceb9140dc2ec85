//! Replica and partition planning across subsets
//!
//! Pure functions: no API access, same output for the same input.

use crate::crd::{ManualUpdate, SubsetDeclaration};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("subset {0} declares both weight and replicas")]
    ConflictingAllocation(String),

    #[error("subset {0} declares neither weight nor replicas")]
    MissingAllocation(String),

    #[error("subset {name} has negative {field}: {value}")]
    Negative {
        name: String,
        field: &'static str,
        value: i32,
    },

    #[error("fixed subset replicas ({fixed}) exceed total replicas ({total})")]
    FixedExceedsTotal { fixed: i64, total: i32 },

    #[error("{0} replicas left after fixed subsets but no weighted subset can absorb them")]
    UnabsorbedReplicas(i64),

    #[error("total replicas must be >= 0, got {0}")]
    NegativeTotal(i32),
}

/// Allocation mode of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolAllocation {
    Weight(i32),
    Fixed(i32),
}

impl PoolAllocation {
    pub fn of(subset: &SubsetDeclaration) -> Result<Self, AllocationError> {
        match (subset.weight, subset.replicas) {
            (Some(_), Some(_)) => Err(AllocationError::ConflictingAllocation(
                subset.name.clone(),
            )),
            (None, None) => Err(AllocationError::MissingAllocation(subset.name.clone())),
            (Some(weight), None) if weight < 0 => Err(AllocationError::Negative {
                name: subset.name.clone(),
                field: "weight",
                value: weight,
            }),
            (None, Some(replicas)) if replicas < 0 => Err(AllocationError::Negative {
                name: subset.name.clone(),
                field: "replicas",
                value: replicas,
            }),
            (Some(weight), None) => Ok(PoolAllocation::Weight(weight)),
            (None, Some(replicas)) => Ok(PoolAllocation::Fixed(replicas)),
        }
    }
}

/// Split `total` replicas across the declared pools
///
/// Fixed-count pools get exactly their count; what is left is shared by the
/// weighted pools in proportion to weight using largest-remainder rounding:
/// every pool first gets `left * weight / total_weight` (integer division),
/// then the leftover units go one each to the pools with the largest
/// fractional remainder, ties broken by declaration order.
///
/// # Errors
/// - a pool with conflicting, missing or negative allocation
/// - fixed pools asking for more than `total`
/// - replicas left over with no weighted pool (or only zero weights) to take them
///
/// # Examples
/// ```ignore
/// // replicas=10, A weight 3, B weight 1 → A=8, B=2
/// let plan = allocate_replicas(10, &subsets)?;
/// assert_eq!(plan["A"], 8);
/// ```
pub fn allocate_replicas(
    total: i32,
    subsets: &[SubsetDeclaration],
) -> Result<BTreeMap<String, i32>, AllocationError> {
    if total < 0 {
        return Err(AllocationError::NegativeTotal(total));
    }

    let modes = subsets
        .iter()
        .map(|s| PoolAllocation::of(s).map(|mode| (s.name.as_str(), mode)))
        .collect::<Result<Vec<_>, _>>()?;

    let fixed: i64 = modes
        .iter()
        .map(|(_, mode)| match mode {
            PoolAllocation::Fixed(n) => *n as i64,
            PoolAllocation::Weight(_) => 0,
        })
        .sum();

    if fixed > total as i64 {
        return Err(AllocationError::FixedExceedsTotal { fixed, total });
    }

    let left = total as i64 - fixed;
    let total_weight: i64 = modes
        .iter()
        .map(|(_, mode)| match mode {
            PoolAllocation::Weight(w) => *w as i64,
            PoolAllocation::Fixed(_) => 0,
        })
        .sum();

    if left > 0 && total_weight == 0 {
        return Err(AllocationError::UnabsorbedReplicas(left));
    }

    let mut result = BTreeMap::new();
    // (declaration index, fractional remainder numerator) for weighted pools
    let mut remainders: Vec<(usize, i64)> = Vec::new();
    let mut assigned: i64 = 0;

    for (index, (name, mode)) in modes.iter().enumerate() {
        let replicas = match mode {
            PoolAllocation::Fixed(n) => *n as i64,
            PoolAllocation::Weight(w) if total_weight > 0 => {
                let share = left * *w as i64;
                remainders.push((index, share % total_weight));
                assigned += share / total_weight;
                share / total_weight
            }
            PoolAllocation::Weight(_) => 0,
        };
        result.insert(name.to_string(), replicas as i32);
    }

    let mut leftover = left - assigned;
    if leftover > 0 {
        // Stable sort keeps declaration order among equal remainders
        remainders.sort_by(|a, b| b.1.cmp(&a.1));
        for (index, remainder) in remainders {
            if leftover == 0 {
                break;
            }
            if remainder == 0 {
                continue;
            }
            let name = modes[index].0;
            if let Some(replicas) = result.get_mut(name) {
                *replicas += 1;
                leftover -= 1;
            }
        }
    }

    Ok(result)
}

/// Clamp a partition into `[0, replicas]`
pub fn clamp_partition(partition: i32, replicas: i32) -> i32 {
    partition.clamp(0, replicas.max(0))
}

/// Partitions for the Manual strategy
///
/// Read from the spec's per-pool setting; an unset pool keeps every replica on
/// the old revision (partition = replicas).
pub fn manual_partitions(
    replicas: &BTreeMap<String, i32>,
    manual: &ManualUpdate,
) -> BTreeMap<String, i32> {
    replicas
        .iter()
        .map(|(name, &count)| {
            let partition = manual.partitions.get(name).copied().unwrap_or(count);
            (name.clone(), clamp_partition(partition, count))
        })
        .collect()
}

/// Starting partitions for a Canary rollout: every subset fully held back
pub fn initial_canary_partitions(replicas: &BTreeMap<String, i32>) -> BTreeMap<String, i32> {
    replicas
        .iter()
        .map(|(name, &count)| (name.clone(), count.max(0)))
        .collect()
}

/// Partitions when there is nothing to roll out (current == updated revision)
pub fn settled_partitions(replicas: &BTreeMap<String, i32>) -> BTreeMap<String, i32> {
    replicas.keys().map(|name| (name.clone(), 0)).collect()
}
