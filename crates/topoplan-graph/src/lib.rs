//! topoplan-graph — structural analysis of the logical plan.
//!
//! This crate turns a `LogicalPlan` into the intermediate structures the
//! expansion engine multiplies: the typed template graph, the validated
//! containment forest, and the resolved scaling hierarchy.
//!
//! # Components
//!
//! - **`graph`** — `TemplateGraph` (boundary parsing, edge metadata)
//! - **`containment`** — weak components, per-component tree validation
//! - **`scaling`** — group DAG validation, effective instance counts

pub mod containment;
pub mod graph;
pub mod scaling;

pub use containment::{ContainmentForest, ContainmentTree, decompose};
pub use graph::{ConnectionType, RelationshipKind, TemplateEdge, TemplateGraph};
pub use scaling::{ResolvedScaling, resolve};
