//! topoplan-core — shared types for topology expansion.
//!
//! This crate holds the domain types exchanged between the planning
//! collaborators and the expansion engine: the logical plan (node templates,
//! relationships, scaling groups), the deployment plan (node instances and
//! group layouts), the error taxonomy, and the per-invocation id allocator.

pub mod error;
pub mod ids;
pub mod types;

pub use error::{PlanError, PlanResult};
pub use ids::IdAllocator;
pub use types::*;
