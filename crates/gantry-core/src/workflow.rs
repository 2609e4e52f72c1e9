//! Workflow definition types.
//!
//! These types represent the user-authored workflow configuration: the set
//! of jobs with their dependencies, conditions and matrix configuration,
//! plus the trigger filters deciding when the workflow runs at all.

use crate::ids::JobId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerFilter>,
    /// Workflow-level environment, visible to condition expressions as `env.*`.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub jobs: Vec<JobSpec>,
}

/// Filter deciding whether an incoming event starts a run of this workflow.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct TriggerFilter {
    pub kind: EventKind,
    #[serde(default)]
    pub branch_patterns: Vec<String>,
    #[serde(default)]
    pub path_patterns: Vec<String>,
    /// Opaque cron tokens for `schedule` triggers. The engine does not parse
    /// cron; the event source reports which token fired.
    #[serde(default)]
    pub cron_expressions: Vec<String>,
}

impl TriggerFilter {
    pub fn for_kind(kind: EventKind) -> Self {
        Self {
            kind,
            branch_patterns: vec![],
            path_patterns: vec![],
            cron_expressions: vec![],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
    WorkflowDispatch,
    Release,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Unique within the workflow.
    pub id: JobId,
    #[serde(default)]
    pub needs: Vec<JobId>,
    /// Gating condition expression. When absent the implicit default applies:
    /// run only if every direct dependency succeeded.
    #[serde(default, rename = "if")]
    pub condition: Option<String>,
    #[serde(default)]
    pub matrix: Option<MatrixSpec>,
    #[serde(default = "default_runs_on")]
    pub runs_on: String,
}

fn default_runs_on() -> String {
    "linux".to_string()
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            needs: vec![],
            condition: None,
            matrix: None,
            runs_on: default_runs_on(),
        }
    }
}

/// Matrix configuration for a job.
///
/// Axes are kept in declaration order so that expansion, and therefore
/// instance ids, are deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct MatrixSpec {
    #[serde(default)]
    pub axes: Vec<MatrixAxis>,
    #[serde(default)]
    pub include: Vec<std::collections::BTreeMap<String, serde_json::Value>>,
    #[serde(default)]
    pub exclude: Vec<std::collections::BTreeMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MatrixAxis {
    pub name: String,
    pub values: Vec<serde_json::Value>,
}

impl MatrixAxis {
    pub fn new(name: impl Into<String>, values: Vec<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}
