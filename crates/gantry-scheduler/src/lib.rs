//! Workflow scheduling and trigger evaluation for Gantry.
//!
//! Given a workflow definition and a repository event, this crate decides
//! whether a run starts at all (trigger matching), expands matrixed jobs
//! into concrete instances, builds the instance dependency graph, and
//! produces the ordered, gated execution plan batch by batch.

pub mod graph;
pub mod matrix;
pub mod scheduler;
pub mod triggers;

pub use graph::{GraphBuilder, GraphError, InstanceGraph, JobInstance};
pub use matrix::{MatrixExpander, MatrixSpecError};
pub use scheduler::{Batch, Scheduler, SchedulerError};
pub use triggers::TriggerMatcher;
