//! Run and execution state types.

use crate::ids::{InstanceId, RunId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failure | JobStatus::Skipped | JobStatus::Cancelled
        )
    }
}

/// Recorded outcome of one job instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

impl JobOutcome {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            outputs: HashMap::new(),
        }
    }

    pub fn success() -> Self {
        Self::new(JobStatus::Success)
    }

    pub fn failure() -> Self {
        Self::new(JobStatus::Failure)
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }
}

/// Per-run mutable state: instance id to recorded outcome.
///
/// Owned exclusively by the scheduler, which is the single writer. Other
/// components never see this directly; condition evaluation receives an
/// immutable [`ContextSnapshot`] copied out per evaluation.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    outcomes: HashMap<InstanceId, JobOutcome>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: InstanceId, outcome: JobOutcome) {
        self.outcomes.insert(id, outcome);
    }

    pub fn get(&self, id: &InstanceId) -> Option<&JobOutcome> {
        self.outcomes.get(id)
    }

    pub fn status(&self, id: &InstanceId) -> Option<JobStatus> {
        self.outcomes.get(id).map(|o| o.status)
    }

    pub fn set_status(&mut self, id: &InstanceId, status: JobStatus) {
        if let Some(outcome) = self.outcomes.get_mut(id) {
            outcome.status = status;
        }
    }

    pub fn into_outcomes(self) -> HashMap<InstanceId, JobOutcome> {
        self.outcomes
    }
}

/// Immutable view of a single instance's surroundings at evaluation time:
/// the outcomes of its direct dependencies grouped by needed job, its own
/// matrix assignment, and the triggering event's inputs.
#[derive(Debug, Clone, Default)]
pub struct ContextSnapshot {
    /// Keyed by the needed job's id (not instance id). A matrixed dependency
    /// contributes one entry aggregating all of its instances.
    pub needs: BTreeMap<String, NeedSnapshot>,
    pub matrix: BTreeMap<String, serde_json::Value>,
    pub inputs: HashMap<String, String>,
}

impl ContextSnapshot {
    /// Statuses of every direct dependency instance, across all needed jobs.
    /// This is what the status functions (`success()`, `failure()`, ...)
    /// aggregate over.
    pub fn dependency_statuses(&self) -> impl Iterator<Item = JobStatus> + '_ {
        self.needs.values().flat_map(|n| n.statuses.iter().copied())
    }
}

/// Aggregated view of one needed job across its matrix instances.
#[derive(Debug, Clone)]
pub struct NeedSnapshot {
    /// Aggregate result: failure if any leg failed, else cancelled if any
    /// leg was cancelled, else skipped if any leg was skipped, else success.
    pub result: JobStatus,
    /// Merged outputs across legs; later instances win on key collision.
    pub outputs: HashMap<String, String>,
    /// Per-instance statuses, in instance order.
    pub statuses: Vec<JobStatus>,
}

impl NeedSnapshot {
    pub fn aggregate(statuses: Vec<JobStatus>, outputs: HashMap<String, String>) -> Self {
        let result = if statuses.iter().any(|s| *s == JobStatus::Failure) {
            JobStatus::Failure
        } else if statuses.iter().any(|s| *s == JobStatus::Cancelled) {
            JobStatus::Cancelled
        } else if statuses.iter().any(|s| *s == JobStatus::Skipped) {
            JobStatus::Skipped
        } else {
            JobStatus::Success
        };
        Self {
            result,
            outputs,
            statuses,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// A recovered condition evaluation failure, kept distinct from a condition
/// that legitimately evaluated false. Gated as a skip, but always surfaced
/// in the final report so authoring mistakes are visible.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub instance_id: InstanceId,
    pub expression: String,
    pub message: String,
}

/// Final report for a run: terminal statuses for every instance plus any
/// evaluation diagnostics collected while gating.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub outcomes: HashMap<InstanceId, JobOutcome>,
    pub evaluation_failures: Vec<EvaluationFailure>,
    pub queued_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

impl RunReport {
    pub fn count_with(&self, status: JobStatus) -> usize {
        self.outcomes.values().filter(|o| o.status == status).count()
    }
}
