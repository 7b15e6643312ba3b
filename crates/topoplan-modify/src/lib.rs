//! topoplan-modify — deployment modification diffs.
//!
//! Computes the minimal added/removed/extended/reduced instance sets between
//! a previous deployment plan and a changed logical topology, with stable
//! identity for everything untouched by the change.

pub mod modifier;

pub use modifier::{ModificationRequest, ModifyOutcome, modify};
