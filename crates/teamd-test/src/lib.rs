//! Integration test infrastructure for teamd
//!
//! Provides:
//! - Configuration document builders
//! - Recording event subscribers and private-data finalizers
//! - Kernel request journal verification helpers

pub mod fixtures;
pub mod recorder;
mod verification;

pub use fixtures::*;
pub use recorder::*;
pub use verification::*;

pub use teamd::kernel::mock::MockTeam;
