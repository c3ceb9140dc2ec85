//! Kubernetes Events for UnitedDeployment lifecycle changes
//!
//! `KubeEventRecorder` publishes through `kube::runtime::events::Recorder`.
//! Tests use `MockEventRecorder`, which keeps events in memory for assertions.
//! Emission is best effort: callers log a failure and carry on.

use crate::crd::UnitedDeployment;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Resource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("failed to publish event: {0}")]
    Publish(#[from] kube::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

/// One event about a UnitedDeployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerEvent {
    pub severity: EventSeverity,
    /// CamelCase reason, e.g. `SubsetCreated`
    pub reason: String,
    pub message: String,
}

impl ControllerEvent {
    pub fn normal(reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Normal,
            reason: reason.to_string(),
            message: message.into(),
        }
    }

    pub fn warning(reason: &str, message: impl Into<String>) -> Self {
        Self {
            severity: EventSeverity::Warning,
            reason: reason.to_string(),
            message: message.into(),
        }
    }
}

// Reasons
pub const REASON_SUBSET_CREATED: &str = "SubsetCreated";
pub const REASON_SUBSET_DELETED: &str = "SubsetDeleted";
pub const REASON_SUBSET_APPLY_FAILED: &str = "SubsetApplyFailed";
pub const REASON_REVISION_CREATED: &str = "RevisionCreated";
pub const REASON_CANARY_STEP: &str = "CanaryStep";
pub const REASON_CANARY_CONVERGED: &str = "CanaryConverged";
pub const REASON_CANARY_ABORTED: &str = "CanaryAborted";
pub const REASON_ANALYSIS_ERROR: &str = "AnalysisError";
pub const REASON_INVALID_SPEC: &str = "InvalidSpec";

#[async_trait]
pub trait EventRecorder: Send + Sync {
    async fn record(&self, ud: &UnitedDeployment, event: ControllerEvent)
        -> Result<(), EventError>;
}

pub struct KubeEventRecorder {
    recorder: Recorder,
}

impl KubeEventRecorder {
    /// `instance` is the pod name when running in-cluster
    pub fn new(client: kube::Client, instance: Option<String>) -> Self {
        let reporter = Reporter {
            controller: "united-controller".into(),
            instance,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventRecorder for KubeEventRecorder {
    async fn record(
        &self,
        ud: &UnitedDeployment,
        event: ControllerEvent,
    ) -> Result<(), EventError> {
        let type_ = match event.severity {
            EventSeverity::Normal => EventType::Normal,
            EventSeverity::Warning => EventType::Warning,
        };
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: event.reason.clone(),
                    note: Some(event.message),
                    action: "Reconcile".into(),
                    secondary: None,
                },
                &ud.object_ref(&()),
            )
            .await?;
        Ok(())
    }
}

/// In-memory recorder for tests
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MockEventRecorder {
    events: std::sync::Arc<std::sync::Mutex<Vec<ControllerEvent>>>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
impl MockEventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ControllerEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    pub fn has_reason(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

#[cfg(test)]
#[async_trait]
#[allow(clippy::unwrap_used)]
impl EventRecorder for MockEventRecorder {
    async fn record(
        &self,
        _ud: &UnitedDeployment,
        event: ControllerEvent,
    ) -> Result<(), EventError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}
