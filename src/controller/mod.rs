pub mod allocation;
pub mod analysis;
pub mod canary;
pub mod clock;
pub mod events;
pub mod revision;
pub mod store;
pub mod subset;
pub mod uniteddeployment;

pub use uniteddeployment::{error_policy, reconcile, Context, ReconcileError};
