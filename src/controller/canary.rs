//! Canary rollout state machine
//!
//! ```text
//! Initializing → Decrementing → Baking → Analyzing ─┬→ Decrementing
//!                     │                              └→ Aborted
//!                     └→ Converged (nothing left to lower)
//! ```
//!
//! The machine advances exactly one transition per call and never sleeps:
//! bake time is returned as a requeue delay. Its state is persisted in
//! `status.canary` and rebuilt by `CanaryState::reconstruct` on every pass.

use crate::controller::allocation::{clamp_partition, initial_canary_partitions};
use crate::controller::analysis::AnalysisGate;
use crate::controller::clock::parse_timestamp;
use crate::controller::events::{
    ControllerEvent, REASON_ANALYSIS_ERROR, REASON_CANARY_ABORTED, REASON_CANARY_CONVERGED,
    REASON_CANARY_STEP, REASON_SUBSET_APPLY_FAILED,
};
use crate::crd::{
    AnalysisOutcome, CanaryStatus, CanaryUpdate, FailurePolicy, RolloutPhase, UnitedDeployment,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Delay before the next transition when nothing needs to wait
pub const NEXT_STEP_DELAY: Duration = Duration::from_secs(1);

/// Delay before retrying subsets whose apply failed
pub const APPLY_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay before asking an unreachable analysis backend again
pub const ANALYSIS_RETRY_DELAY: Duration = Duration::from_secs(30);

/// How far each subset's partition drops per step
///
/// `uniform` applies to every pool unless `overrides` names it with a
/// positive value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecrementPolicy {
    pub uniform: i32,
    pub overrides: BTreeMap<String, i32>,
}

impl DecrementPolicy {
    pub fn from_canary(canary: &CanaryUpdate) -> Self {
        Self {
            uniform: canary.roll_count,
            overrides: canary.subset_roll_counts.clone(),
        }
    }

    pub fn step_for(&self, pool: &str) -> i32 {
        match self.overrides.get(pool) {
            Some(step) if *step > 0 => *step,
            _ => self.uniform.max(1),
        }
    }
}

/// Lower every positive partition by its step
///
/// `None` when every partition is already 0.
pub fn next_partitions(
    current: &BTreeMap<String, i32>,
    policy: &DecrementPolicy,
) -> Option<BTreeMap<String, i32>> {
    if current.values().all(|p| *p <= 0) {
        return None;
    }
    Some(
        current
            .iter()
            .map(|(pool, partition)| {
                let next = if *partition > 0 {
                    (partition - policy.step_for(pool)).max(0)
                } else {
                    0
                };
                (pool.clone(), next)
            })
            .collect(),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanaryState {
    pub phase: RolloutPhase,
    pub revision: String,
    pub partitions: BTreeMap<String, i32>,
    pub step: i32,
    pub step_started_at: Option<DateTime<Utc>>,
    pub generation: i64,
    pub last_analysis: Option<AnalysisOutcome>,
}

impl CanaryState {
    /// Rebuild the machine from persisted status
    ///
    /// - nothing to roll out (`current == update`) → Converged at partition 0
    /// - no bookkeeping, or bookkeeping for another revision → Initializing
    /// - otherwise resume: removed pools are dropped, new pools start fully
    ///   held back, partitions are clamped to the pool's replicas
    /// - Aborted resumes as Decrementing once the spec generation moves on
    pub fn reconstruct(
        status: Option<&CanaryStatus>,
        current_revision: &str,
        update_revision: &str,
        replicas: &BTreeMap<String, i32>,
        generation: i64,
    ) -> Self {
        if current_revision == update_revision {
            return Self {
                phase: RolloutPhase::Converged,
                revision: update_revision.to_string(),
                partitions: replicas.keys().map(|pool| (pool.clone(), 0)).collect(),
                step: status
                    .filter(|s| s.revision == update_revision)
                    .map(|s| s.step)
                    .unwrap_or(0),
                step_started_at: None,
                generation,
                last_analysis: status
                    .filter(|s| s.revision == update_revision)
                    .and_then(|s| s.last_analysis.clone()),
            };
        }

        let Some(status) = status.filter(|s| s.revision == update_revision) else {
            return Self {
                phase: RolloutPhase::Initializing,
                revision: update_revision.to_string(),
                partitions: initial_canary_partitions(replicas),
                step: 0,
                step_started_at: None,
                generation,
                last_analysis: None,
            };
        };

        let partitions = replicas
            .iter()
            .map(|(pool, count)| {
                let partition = match status.partitions.get(pool) {
                    Some(p) => clamp_partition(*p, *count),
                    None if status.phase == RolloutPhase::Converged => 0,
                    None => *count,
                };
                (pool.clone(), partition)
            })
            .collect();

        let (phase, generation) =
            if status.phase == RolloutPhase::Aborted && generation > status.generation {
                (RolloutPhase::Decrementing, generation)
            } else {
                (status.phase, status.generation)
            };

        Self {
            phase,
            revision: status.revision.clone(),
            partitions,
            step: status.step,
            step_started_at: status.step_started_at.as_deref().and_then(parse_timestamp),
            generation,
            last_analysis: status.last_analysis.clone(),
        }
    }

    pub fn to_status(&self) -> CanaryStatus {
        CanaryStatus {
            phase: self.phase,
            revision: self.revision.clone(),
            partitions: self.partitions.clone(),
            step: self.step,
            step_started_at: self.step_started_at.map(|t| t.to_rfc3339()),
            generation: self.generation,
            last_analysis: self.last_analysis.clone(),
        }
    }

    fn enter(&mut self, phase: RolloutPhase) {
        debug!(
            revision = %self.revision,
            from = self.phase.as_str(),
            to = phase.as_str(),
            "Canary phase transition"
        );
        self.phase = phase;
    }
}

/// Pools whose apply failed, with the error text
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub failed: Vec<(String, String)>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Writes partitions to the subsets; one failing subset must not stop the rest
#[async_trait]
pub trait PartitionApplier: Send + Sync {
    async fn apply_partitions(&self, partitions: &BTreeMap<String, i32>) -> ApplyReport;
}

/// What the reconciler should do after a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Requeue(Duration),
    /// Rollout finished
    Done,
    /// Rollout aborted; waits for a spec change
    Halted,
}

#[derive(Debug, Clone)]
pub struct CanaryStep {
    pub state: CanaryState,
    pub action: StepAction,
    pub events: Vec<ControllerEvent>,
    /// Set when the rollout was aborted by analysis
    pub degraded: Option<String>,
}

pub struct CanaryController<'a> {
    pub ud: &'a UnitedDeployment,
    pub policy: DecrementPolicy,
    pub bake: Duration,
    pub failure_policy: FailurePolicy,
    pub gate: &'a dyn AnalysisGate,
    pub now: DateTime<Utc>,
}

impl CanaryController<'_> {
    /// Advance `state` by one transition
    pub async fn step(&self, state: CanaryState, applier: &dyn PartitionApplier) -> CanaryStep {
        let mut step = CanaryStep {
            state,
            action: StepAction::Requeue(NEXT_STEP_DELAY),
            events: Vec::new(),
            degraded: None,
        };

        match step.state.phase {
            RolloutPhase::Initializing => {
                let start = step.state.partitions.clone();
                if self.apply(&start, applier, &mut step).await {
                    step.state.step = 1;
                    step.state.step_started_at = Some(self.now);
                    step.state.enter(RolloutPhase::Decrementing);
                }
            }
            RolloutPhase::Decrementing => {
                match next_partitions(&step.state.partitions, &self.policy) {
                    None => {
                        step.state.enter(RolloutPhase::Converged);
                        step.action = StepAction::Done;
                        step.events.push(ControllerEvent::normal(
                            REASON_CANARY_CONVERGED,
                            format!("revision {} rolled out to every subset", step.state.revision),
                        ));
                        info!(revision = %step.state.revision, "Canary rollout converged");
                    }
                    Some(next) => {
                        if self.apply(&next, applier, &mut step).await {
                            step.state.partitions = next;
                            step.state.step += 1;
                            step.state.step_started_at = Some(self.now);
                            step.state.enter(RolloutPhase::Baking);
                            step.action = StepAction::Requeue(self.bake);
                            step.events.push(ControllerEvent::normal(
                                REASON_CANARY_STEP,
                                format!(
                                    "step {}: partitions {}",
                                    step.state.step,
                                    describe(&step.state.partitions)
                                ),
                            ));
                            info!(
                                revision = %step.state.revision,
                                step = step.state.step,
                                partitions = %describe(&step.state.partitions),
                                "Canary step applied"
                            );
                        }
                    }
                }
            }
            RolloutPhase::Baking => {
                let persisted = step.state.partitions.clone();
                if self.apply(&persisted, applier, &mut step).await {
                    match step.state.step_started_at {
                        None => {
                            step.state.step_started_at = Some(self.now);
                            step.action = StepAction::Requeue(self.bake);
                        }
                        Some(started) => {
                            let elapsed = (self.now - started).to_std().unwrap_or_default();
                            if elapsed >= self.bake {
                                step.state.enter(RolloutPhase::Analyzing);
                            } else {
                                step.action = StepAction::Requeue(self.bake - elapsed);
                            }
                        }
                    }
                }
            }
            RolloutPhase::Analyzing => {
                let persisted = step.state.partitions.clone();
                if self.apply(&persisted, applier, &mut step).await {
                    self.analyze(&mut step).await;
                }
            }
            RolloutPhase::Converged => {
                let persisted = step.state.partitions.clone();
                if self.apply(&persisted, applier, &mut step).await {
                    step.action = StepAction::Done;
                }
            }
            RolloutPhase::Aborted => {
                let persisted = step.state.partitions.clone();
                if self.apply(&persisted, applier, &mut step).await {
                    step.action = StepAction::Halted;
                }
            }
        }

        step
    }

    /// Apply partitions; on any failure record events and schedule a retry
    async fn apply(
        &self,
        partitions: &BTreeMap<String, i32>,
        applier: &dyn PartitionApplier,
        step: &mut CanaryStep,
    ) -> bool {
        let report = applier.apply_partitions(partitions).await;
        if report.is_success() {
            return true;
        }
        for (pool, error) in &report.failed {
            warn!(subset = %pool, error = %error, "Failed to apply subset partition");
            step.events.push(ControllerEvent::warning(
                REASON_SUBSET_APPLY_FAILED,
                format!("subset {}: {}", pool, error),
            ));
        }
        step.action = StepAction::Requeue(APPLY_RETRY_DELAY);
        false
    }

    async fn analyze(&self, step: &mut CanaryStep) {
        let revision = step.state.revision.clone();
        let verdict = match self.gate.analyze(self.ud, &revision).await {
            Ok(verdict) => Some((verdict.passed, verdict.message)),
            Err(e) => {
                warn!(revision = %revision, error = %e, "Analysis gate failed");
                step.events.push(ControllerEvent::warning(
                    REASON_ANALYSIS_ERROR,
                    format!("analysis unavailable: {}", e),
                ));
                match self.failure_policy {
                    FailurePolicy::Pause => None,
                    FailurePolicy::Continue => {
                        Some((true, format!("analysis unavailable, continuing: {}", e)))
                    }
                    FailurePolicy::Abort => {
                        Some((false, format!("analysis unavailable, aborting: {}", e)))
                    }
                }
            }
        };

        let Some((passed, message)) = verdict else {
            step.action = StepAction::Requeue(ANALYSIS_RETRY_DELAY);
            return;
        };

        step.state.last_analysis = Some(AnalysisOutcome {
            passed,
            message: Some(message.clone()),
            time: self.now.to_rfc3339(),
        });

        if passed {
            step.state.enter(RolloutPhase::Decrementing);
        } else {
            step.state.enter(RolloutPhase::Aborted);
            // Resume only on an edit made after the abort
            step.state.generation = self.ud.metadata.generation.unwrap_or(0);
            step.action = StepAction::Halted;
            step.degraded = Some(message.clone());
            step.events.push(ControllerEvent::warning(
                REASON_CANARY_ABORTED,
                format!(
                    "rollout of {} aborted at step {}: {}",
                    revision, step.state.step, message
                ),
            ));
            warn!(
                revision = %revision,
                step = step.state.step,
                partitions = %describe(&step.state.partitions),
                "Canary rollout aborted by analysis"
            );
        }
    }
}

fn describe(partitions: &BTreeMap<String, i32>) -> String {
    partitions
        .iter()
        .map(|(pool, p)| format!("{}={}", pool, p))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
#[path = "canary_test.rs"]
mod tests;
