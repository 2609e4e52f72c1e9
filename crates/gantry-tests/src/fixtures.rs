//! Test fixtures for creating sample workflows and driving runs.

use gantry_core::ids::{InstanceId, JobId};
use gantry_core::run::{JobOutcome, JobStatus};
use gantry_core::workflow::{
    EventKind, JobSpec, MatrixAxis, MatrixSpec, TriggerFilter, WorkflowDefinition,
};
use gantry_scheduler::{JobInstance, Scheduler};
use std::collections::HashMap;

/// Factory for creating test workflows.
pub struct WorkflowFixture;

impl WorkflowFixture {
    pub fn job(id: &str, needs: &[&str]) -> JobSpec {
        let mut spec = JobSpec::new(id);
        spec.needs = needs.iter().map(|n| JobId::new(*n)).collect();
        spec
    }

    pub fn conditional_job(id: &str, needs: &[&str], condition: &str) -> JobSpec {
        let mut spec = Self::job(id, needs);
        spec.condition = Some(condition.to_string());
        spec
    }

    pub fn matrixed_job(
        id: &str,
        needs: &[&str],
        axis: &str,
        values: &[serde_json::Value],
    ) -> JobSpec {
        let mut spec = Self::job(id, needs);
        spec.matrix = Some(MatrixSpec {
            axes: vec![MatrixAxis::new(axis, values.to_vec())],
            include: vec![],
            exclude: vec![],
        });
        spec
    }

    pub fn workflow(name: &str, jobs: Vec<JobSpec>) -> WorkflowDefinition {
        WorkflowDefinition {
            name: name.to_string(),
            description: None,
            triggers: vec![],
            env: HashMap::new(),
            jobs,
        }
    }

    /// build -> test -> deploy.
    pub fn chain() -> WorkflowDefinition {
        Self::workflow(
            "chain",
            vec![
                Self::job("build", &[]),
                Self::job("test", &["build"]),
                Self::job("deploy", &["test"]),
            ],
        )
    }

    /// build fans out to unit and integration, which join into deploy.
    pub fn diamond() -> WorkflowDefinition {
        Self::workflow(
            "diamond",
            vec![
                Self::job("build", &[]),
                Self::job("unit", &["build"]),
                Self::job("integration", &["build"]),
                Self::job("deploy", &["unit", "integration"]),
            ],
        )
    }

    /// A push-triggered workflow filtered to main and src changes.
    pub fn push_ci() -> WorkflowDefinition {
        let mut workflow = Self::chain();
        workflow.triggers = vec![TriggerFilter {
            kind: EventKind::Push,
            branch_patterns: vec!["main".to_string()],
            path_patterns: vec!["src/**".to_string()],
            cron_expressions: vec![],
        }];
        workflow
    }
}

/// Drive a run to completion, reporting `decide(instance)` for every
/// instance handed out. Returns the instance ids of each produced batch,
/// in tick order.
pub fn drive<F>(scheduler: &mut Scheduler, mut decide: F) -> Vec<Vec<InstanceId>>
where
    F: FnMut(&JobInstance) -> JobOutcome,
{
    let mut batches = Vec::new();
    loop {
        match scheduler.next_batch().expect("scheduling failed") {
            Some(batch) => {
                batches.push(batch.iter().map(|i| i.instance_id.clone()).collect());
                for instance in &batch {
                    scheduler
                        .report(&instance.instance_id, decide(instance))
                        .expect("report failed");
                }
            }
            None => break,
        }
    }
    batches
}

/// Convenience: drive a run where every instance succeeds.
pub fn drive_all_success(scheduler: &mut Scheduler) -> Vec<Vec<InstanceId>> {
    drive(scheduler, |_| JobOutcome::new(JobStatus::Success))
}
