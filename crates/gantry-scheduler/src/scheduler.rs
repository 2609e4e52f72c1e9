//! Tick-based batch scheduling over the instance graph.
//!
//! The scheduler does not execute anything. Each call to [`Scheduler::next_batch`]
//! yields the set of instances that are ready to run right now; an external
//! executor runs them and reports each completion back through
//! [`Scheduler::report`], exactly once per instance. The scheduler is the
//! single writer of the run's execution context and is not synchronized;
//! callers driving it from multiple threads must serialize externally.

use crate::graph::{GraphBuilder, GraphError, InstanceGraph, JobInstance};
use chrono::{DateTime, Utc};
use gantry_core::event::Event;
use gantry_core::expr;
use gantry_core::ids::{InstanceId, RunId};
use gantry_core::run::{
    ContextSnapshot, EvaluationFailure, ExecutionContext, JobOutcome, JobStatus, NeedSnapshot,
    RunReport, RunStatus,
};
use gantry_core::workflow::WorkflowDefinition;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Pending instances remain but nothing can ever unblock them. With a
    /// validated acyclic graph this is unreachable; it is checked anyway so
    /// a graph-construction bug aborts loudly instead of spinning.
    #[error("scheduling deadlock; unresolved instances: {}", format_ids(.unresolved))]
    Deadlock { unresolved: Vec<InstanceId> },

    #[error("unknown instance '{0}'")]
    UnknownInstance(InstanceId),

    #[error("instance '{instance}' is not running (status: {status:?})")]
    NotRunning {
        instance: InstanceId,
        status: JobStatus,
    },

    #[error("reported outcome for '{instance}' has non-terminal status {status:?}")]
    InvalidOutcome {
        instance: InstanceId,
        status: JobStatus,
    },
}

fn format_ids(ids: &[InstanceId]) -> String {
    ids.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// The set of instances ready to run at one scheduling tick.
pub type Batch = Vec<JobInstance>;

/// Drives one workflow run to completion, one batch at a time.
pub struct Scheduler {
    graph: InstanceGraph,
    order: Vec<InstanceId>,
    ctx: ExecutionContext,
    env: HashMap<String, String>,
    inputs: HashMap<String, String>,
    run_id: RunId,
    status: RunStatus,
    queued_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    eval_failures: Vec<EvaluationFailure>,
}

impl Scheduler {
    pub fn new(graph: InstanceGraph, env: HashMap<String, String>) -> Self {
        let order: Vec<InstanceId> = graph.instances().map(|i| i.instance_id.clone()).collect();
        let mut ctx = ExecutionContext::new();
        for id in &order {
            ctx.insert(id.clone(), JobOutcome::new(JobStatus::Pending));
        }
        Self {
            graph,
            order,
            ctx,
            env,
            inputs: HashMap::new(),
            run_id: RunId::new(),
            status: RunStatus::Pending,
            queued_at: Utc::now(),
            completed_at: None,
            eval_failures: Vec::new(),
        }
    }

    /// Build the instance graph for a workflow and set up a run for it,
    /// carrying the event's dispatch inputs into expression context.
    pub fn for_workflow(workflow: &WorkflowDefinition, event: &Event) -> Result<Self, GraphError> {
        let graph = GraphBuilder::new().build(&workflow.jobs)?;
        let mut scheduler = Self::new(graph, workflow.env.clone());
        scheduler.inputs = event.inputs.clone();
        Ok(scheduler)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn run_status(&self) -> RunStatus {
        self.status
    }

    pub fn instance_status(&self, id: &InstanceId) -> Option<JobStatus> {
        self.ctx.status(id)
    }

    /// Produce the next batch of runnable instances.
    ///
    /// Returns `Ok(Some(batch))` with at least one instance, or `Ok(None)`
    /// when there is nothing to hand out right now: either the run is over
    /// (check [`run_status`](Self::run_status)) or reports for running
    /// instances are still outstanding. Instances whose dependencies are
    /// done but whose gating condition is false (or failed to evaluate)
    /// are skipped within the tick, and skips cascade until the tick
    /// settles.
    pub fn next_batch(&mut self) -> Result<Option<Batch>, SchedulerError> {
        if self.status == RunStatus::Cancelled {
            return Ok(None);
        }
        if self.status == RunStatus::Pending {
            self.status = RunStatus::Running;
        }

        loop {
            let mut batch: Batch = Vec::new();
            let mut skipped = 0usize;

            let ids = self.order.clone();
            for id in ids {
                if self.ctx.status(&id) != Some(JobStatus::Pending) {
                    continue;
                }
                let deps_done = self.graph.predecessors(&id).iter().all(|dep| {
                    self.ctx
                        .status(&dep.instance_id)
                        .is_some_and(|s| s.is_terminal())
                });
                if !deps_done {
                    continue;
                }

                let Some(instance) = self.graph.instance(&id).cloned() else {
                    continue;
                };
                if self.gate(&instance) {
                    self.ctx.set_status(&id, JobStatus::Running);
                    batch.push(instance);
                } else {
                    self.ctx.set_status(&id, JobStatus::Skipped);
                    skipped += 1;
                }
            }

            if !batch.is_empty() {
                debug!(run_id = %self.run_id, size = batch.len(), "produced batch");
                return Ok(Some(batch));
            }
            if skipped > 0 {
                // Newly skipped instances are terminal and may unblock
                // their dependents; settle within this tick.
                continue;
            }

            let pending: Vec<InstanceId> = self
                .order
                .iter()
                .filter(|id| self.ctx.status(id) == Some(JobStatus::Pending))
                .cloned()
                .collect();
            if pending.is_empty() {
                if !self.any_running() {
                    self.finish(RunStatus::Completed);
                }
                return Ok(None);
            }
            if self.any_running() {
                // Outstanding reports will unblock the pending set.
                return Ok(None);
            }
            return Err(SchedulerError::Deadlock {
                unresolved: pending,
            });
        }
    }

    /// Record the terminal outcome of a running instance. Each instance
    /// must be reported exactly once; anything else is a caller bug.
    pub fn report(&mut self, id: &InstanceId, outcome: JobOutcome) -> Result<(), SchedulerError> {
        let current = self
            .ctx
            .status(id)
            .ok_or_else(|| SchedulerError::UnknownInstance(id.clone()))?;
        if current != JobStatus::Running {
            return Err(SchedulerError::NotRunning {
                instance: id.clone(),
                status: current,
            });
        }
        if !matches!(
            outcome.status,
            JobStatus::Success | JobStatus::Failure | JobStatus::Cancelled
        ) {
            return Err(SchedulerError::InvalidOutcome {
                instance: id.clone(),
                status: outcome.status,
            });
        }
        debug!(run_id = %self.run_id, instance = %id, status = ?outcome.status, "outcome reported");
        self.ctx.insert(id.clone(), outcome);
        Ok(())
    }

    /// External cancellation: every pending and running instance becomes
    /// cancelled and no further batches are produced. Already-recorded
    /// terminal statuses are kept.
    pub fn cancel(&mut self) {
        for id in &self.order {
            if let Some(status) = self.ctx.status(id)
                && !status.is_terminal()
            {
                self.ctx.set_status(id, JobStatus::Cancelled);
            }
        }
        self.finish(RunStatus::Cancelled);
    }

    /// Consume the scheduler and produce the final run report, including
    /// every recovered condition evaluation failure.
    pub fn into_report(mut self) -> RunReport {
        let all_terminal = self
            .order
            .iter()
            .all(|id| self.ctx.status(id).is_some_and(|s| s.is_terminal()));
        if self.status == RunStatus::Running && all_terminal {
            self.finish(RunStatus::Completed);
        }
        let duration_ms = self
            .completed_at
            .map(|done| (done - self.queued_at).num_milliseconds().max(0) as u64);
        RunReport {
            run_id: self.run_id,
            status: self.status,
            outcomes: self.ctx.into_outcomes(),
            evaluation_failures: self.eval_failures,
            queued_at: self.queued_at,
            completed_at: self.completed_at,
            duration_ms,
        }
    }

    fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    fn any_running(&self) -> bool {
        self.order
            .iter()
            .any(|id| self.ctx.status(id) == Some(JobStatus::Running))
    }

    /// Decide whether a dependency-complete instance runs or skips.
    fn gate(&mut self, instance: &JobInstance) -> bool {
        let snapshot = self.snapshot_for(instance);
        match &instance.condition {
            Some(expression) => match expr::evaluate(expression, &snapshot, &self.env) {
                Ok(value) => value.truthy(),
                Err(err) => {
                    // A broken expression gates conservatively to skip, but
                    // is reported distinctly from a false condition so the
                    // authoring bug stays visible.
                    warn!(
                        run_id = %self.run_id,
                        instance = %instance.instance_id,
                        expression = %expression,
                        error = %err,
                        "condition failed to evaluate; skipping instance"
                    );
                    self.eval_failures.push(EvaluationFailure {
                        instance_id: instance.instance_id.clone(),
                        expression: expression.clone(),
                        message: err.to_string(),
                    });
                    false
                }
            },
            // Implicit default: run only if every direct dependency
            // instance succeeded.
            None => snapshot
                .dependency_statuses()
                .all(|s| s == JobStatus::Success),
        }
    }

    /// Copy the instance's surroundings into an immutable snapshot for
    /// condition evaluation. Evaluation never sees the live context.
    fn snapshot_for(&self, instance: &JobInstance) -> ContextSnapshot {
        let mut legs: BTreeMap<String, Vec<(InstanceId, JobOutcome)>> = BTreeMap::new();
        for dep in self.graph.predecessors(&instance.instance_id) {
            let outcome = self
                .ctx
                .get(&dep.instance_id)
                .cloned()
                .unwrap_or_else(|| JobOutcome::new(JobStatus::Pending));
            legs.entry(dep.spec_id.to_string())
                .or_default()
                .push((dep.instance_id.clone(), outcome));
        }

        let mut needs = BTreeMap::new();
        for (spec_id, mut instances) in legs {
            instances.sort_by(|(a, _), (b, _)| a.cmp(b));
            let statuses: Vec<JobStatus> = instances.iter().map(|(_, o)| o.status).collect();
            let mut outputs = HashMap::new();
            for (_, outcome) in instances {
                outputs.extend(outcome.outputs);
            }
            needs.insert(spec_id, NeedSnapshot::aggregate(statuses, outputs));
        }

        ContextSnapshot {
            needs,
            matrix: instance.matrix_values.clone(),
            inputs: self.inputs.clone(),
        }
    }
}
