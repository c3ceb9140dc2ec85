pub mod reconcile;
pub mod status;
pub mod validation;

pub use reconcile::*;
pub use status::*;
pub use validation::*;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "uniteddeployment_test.rs"]
mod tests;
