//! UnitedDeployment custom resource and its defaulting

pub mod defaults;
pub mod united_deployment;

pub use united_deployment::*;
