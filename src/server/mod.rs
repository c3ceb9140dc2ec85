//! HTTP surface and process lifecycle around the reconciler
//!
//! - health, readiness, and metrics endpoints
//! - admission webhooks for UnitedDeployment
//! - Lease-based leader election
//! - graceful shutdown on SIGTERM/SIGINT

mod health;
pub mod leader;
pub mod metrics;
pub mod shutdown;
pub mod webhook;

pub use health::{build_router, run_health_server, ReadinessState};
pub use leader::{run_leader_election, LeaderConfig, LeaderState};
pub use metrics::{create_metrics, ControllerMetrics, SharedMetrics};
pub use shutdown::{shutdown_channel, wait_for_signal, ShutdownController, ShutdownSignal};

#[cfg(test)]
#[path = "health_test.rs"]
mod health_tests;

#[cfg(test)]
#[path = "leader_test.rs"]
mod leader_tests;

#[cfg(test)]
#[path = "shutdown_test.rs"]
mod shutdown_tests;
