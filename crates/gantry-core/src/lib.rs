//! Gantry Core
//!
//! Core domain types for the Gantry workflow engine.
//! This crate has minimal dependencies and defines the shared vocabulary
//! used across all other crates: workflow definitions, repository events,
//! run state, and the condition expression evaluator.

pub mod event;
pub mod expr;
pub mod ids;
pub mod run;
pub mod workflow;

pub use ids::*;
