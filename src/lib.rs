//! UnitedDeployment controller
//!
//! Spreads one workload across several pools, each backed by its own
//! StatefulSet, and rolls template changes out pool by pool.

pub mod controller;
pub mod crd;
pub mod server;
