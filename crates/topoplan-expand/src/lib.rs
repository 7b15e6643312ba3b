//! topoplan-expand — the topology expansion engine.
//!
//! Turns a `LogicalPlan` into a `DeploymentPlan`: walks each containment
//! tree, multiplies every template by its resolved instance count, assigns
//! ids and host bindings, propagates group memberships, and fans out
//! connectivity relationships. `expand_with_reuse` additionally preserves
//! identity from a previous plan, which is what makes deployment
//! modification diffs stable.
//!
//! # Components
//!
//! - **`expander`** — instance multiplication (arena, worklist tree walk)
//! - **`fanout`** — `all_to_all` / `all_to_one` relationship expansion

pub mod expander;
mod fanout;

pub use expander::{ReuseTable, expand, expand_with_reuse};
