//! Repository events that may trigger workflow runs.

use crate::workflow::EventKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// An incoming repository event, constructed once per run attempt by the
/// event source and consumed by the trigger matcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    /// The git ref the event concerns, e.g. `main` or `feature/login`.
    pub git_ref: String,
    /// Paths touched by the event, for path-filtered triggers.
    #[serde(default)]
    pub changed_paths: BTreeSet<String>,
    /// User-supplied inputs for `workflow_dispatch` events, visible to
    /// condition expressions as `event.inputs.*`.
    #[serde(default)]
    pub inputs: HashMap<String, String>,
    /// For `schedule` events: the cron token that fired, as reported by the
    /// event source. Compared verbatim against `cron_expressions`.
    #[serde(default)]
    pub schedule: Option<String>,
}

impl Event {
    pub fn push(git_ref: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Push,
            git_ref: git_ref.into(),
            changed_paths: BTreeSet::new(),
            inputs: HashMap::new(),
            schedule: None,
        }
    }

    pub fn with_changed_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.changed_paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn schedule(cron: impl Into<String>) -> Self {
        Self {
            kind: EventKind::Schedule,
            git_ref: String::new(),
            changed_paths: BTreeSet::new(),
            inputs: HashMap::new(),
            schedule: Some(cron.into()),
        }
    }

    pub fn dispatch(git_ref: impl Into<String>, inputs: HashMap<String, String>) -> Self {
        Self {
            kind: EventKind::WorkflowDispatch,
            git_ref: git_ref.into(),
            changed_paths: BTreeSet::new(),
            inputs,
            schedule: None,
        }
    }
}
