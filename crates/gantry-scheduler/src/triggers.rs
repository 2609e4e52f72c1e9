//! Trigger matching: does an incoming event start a workflow run?
//!
//! Filter semantics: the event kind must equal the filter kind exactly.
//! Branch patterns are OR'd over the event ref; path patterns are OR'd
//! over every changed path; when both categories are present BOTH must
//! pass independently. Schedule events ignore branch and path filters
//! entirely and match on the fired cron token.
//!
//! Glob grammar: `*` matches any run of characters within a single
//! `/`-separated segment, `**` matches zero or more whole segments, every
//! other character (including `?`) is literal, and patterns are anchored
//! at both ends. So `feature/*` matches `feature/login` but not
//! `feature/login/v2`, while `feature/**` matches both.

use gantry_core::event::Event;
use gantry_core::workflow::{EventKind, TriggerFilter, WorkflowDefinition};
use tracing::debug;

/// Matcher for deciding whether an event triggers a workflow.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Check whether any of the workflow's trigger filters accepts the
    /// event. A workflow without declared triggers runs on any push.
    pub fn workflow_matches(&self, workflow: &WorkflowDefinition, event: &Event) -> bool {
        if workflow.triggers.is_empty() {
            return event.kind == EventKind::Push;
        }
        let matched = workflow
            .triggers
            .iter()
            .any(|filter| self.matches(event, filter));
        debug!(
            workflow = %workflow.name,
            kind = ?event.kind,
            git_ref = %event.git_ref,
            matched,
            "trigger evaluation"
        );
        matched
    }

    /// Check a single filter against an event.
    pub fn matches(&self, event: &Event, filter: &TriggerFilter) -> bool {
        if event.kind != filter.kind {
            return false;
        }

        if filter.kind == EventKind::Schedule {
            // Cron tokens are opaque; the event source tells us which fired.
            return match &event.schedule {
                Some(token) => filter.cron_expressions.iter().any(|c| c == token),
                None => false,
            };
        }

        self.branch_matches(&filter.branch_patterns, &event.git_ref)
            && self.paths_match(&filter.path_patterns, event)
    }

    fn branch_matches(&self, patterns: &[String], git_ref: &str) -> bool {
        if patterns.is_empty() {
            return true;
        }
        patterns.iter().any(|p| glob_match(p, git_ref))
    }

    fn paths_match(&self, patterns: &[String], event: &Event) -> bool {
        if patterns.is_empty() {
            return true;
        }
        // Any changed file against any pattern.
        event
            .changed_paths
            .iter()
            .any(|path| patterns.iter().any(|p| glob_match(p, path)))
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Anchored glob match over `/`-separated segments.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pat: Vec<&str> = pattern.split('/').collect();
    let txt: Vec<&str> = text.split('/').collect();
    match_segments(&pat, &txt)
}

fn match_segments(pat: &[&str], txt: &[&str]) -> bool {
    match pat.first() {
        None => txt.is_empty(),
        Some(&"**") => {
            // `**` consumes zero or more whole segments.
            (0..=txt.len()).any(|skip| match_segments(&pat[1..], &txt[skip..]))
        }
        Some(seg) => match txt.first() {
            Some(t) => match_one(seg, t) && match_segments(&pat[1..], &txt[1..]),
            None => false,
        },
    }
}

/// Match within one segment; only `*` is special.
fn match_one(pat: &str, txt: &str) -> bool {
    let p: Vec<char> = pat.chars().collect();
    let t: Vec<char> = txt.chars().collect();
    match_chars(&p, &t)
}

fn match_chars(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('*') => (0..=t.len()).any(|skip| match_chars(&p[1..], &t[skip..])),
        Some(c) => t.first() == Some(c) && match_chars(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::workflow::JobSpec;
    use std::collections::HashMap;

    fn filter(kind: EventKind, branches: &[&str], paths: &[&str]) -> TriggerFilter {
        TriggerFilter {
            kind,
            branch_patterns: branches.iter().map(|s| s.to_string()).collect(),
            path_patterns: paths.iter().map(|s| s.to_string()).collect(),
            cron_expressions: vec![],
        }
    }

    #[test]
    fn test_glob_exact() {
        assert!(glob_match("main", "main"));
        assert!(!glob_match("main", "maintenance"));
        assert!(!glob_match("main", "dev"));
    }

    #[test]
    fn test_glob_star_stays_in_segment() {
        assert!(glob_match("feature/*", "feature/login"));
        assert!(!glob_match("feature/*", "feature/login/v2"));
        assert!(!glob_match("feature/*", "feature"));
        assert!(glob_match("release-*", "release-1.2"));
    }

    #[test]
    fn test_glob_double_star_spans_segments() {
        assert!(glob_match("feature/**", "feature/login"));
        assert!(glob_match("feature/**", "feature/login/v2"));
        // `**` matches zero segments, so the bare prefix matches too.
        assert!(glob_match("feature/**", "feature"));
        assert!(glob_match("**", "anything/at/all"));
        assert!(glob_match("src/**/*.js", "src/a/b/x.js"));
        assert!(!glob_match("src/**/*.js", "docs/x.js"));
    }

    #[test]
    fn test_glob_question_mark_is_literal() {
        assert!(glob_match("what?", "what?"));
        assert!(!glob_match("what?", "whats"));
    }

    #[test]
    fn test_kind_must_match_exactly() {
        let matcher = TriggerMatcher::new();
        let f = filter(EventKind::PullRequest, &[], &[]);
        assert!(!matcher.matches(&Event::push("main"), &f));
    }

    #[test]
    fn test_empty_filters_match_any_branch() {
        let matcher = TriggerMatcher::new();
        let f = filter(EventKind::Push, &[], &[]);
        assert!(matcher.matches(&Event::push("anything"), &f));
    }

    #[test]
    fn test_branch_and_path_both_required() {
        let matcher = TriggerMatcher::new();
        let f = filter(EventKind::Push, &["main"], &["src/**"]);

        let both = Event::push("main").with_changed_paths(["src/x.js"]);
        let wrong_path = Event::push("main").with_changed_paths(["docs/x.md"]);
        let wrong_branch = Event::push("dev").with_changed_paths(["src/x.js"]);

        assert!(matcher.matches(&both, &f));
        assert!(!matcher.matches(&wrong_path, &f));
        assert!(!matcher.matches(&wrong_branch, &f));
    }

    #[test]
    fn test_any_path_any_pattern() {
        let matcher = TriggerMatcher::new();
        let f = filter(EventKind::Push, &[], &["src/**", "Cargo.toml"]);
        let event = Event::push("main").with_changed_paths(["README.md", "Cargo.toml"]);
        assert!(matcher.matches(&event, &f));
    }

    #[test]
    fn test_schedule_matches_on_cron_token_only() {
        let matcher = TriggerMatcher::new();
        let mut f = filter(EventKind::Schedule, &["main"], &["src/**"]);
        f.cron_expressions = vec!["0 4 * * *".to_string()];

        // Branch/path filters are ignored for schedule events.
        assert!(matcher.matches(&Event::schedule("0 4 * * *"), &f));
        assert!(!matcher.matches(&Event::schedule("0 9 * * 1"), &f));
    }

    #[test]
    fn test_workflow_without_triggers_defaults_to_push() {
        let matcher = TriggerMatcher::new();
        let workflow = WorkflowDefinition {
            name: "ci".to_string(),
            description: None,
            triggers: vec![],
            env: HashMap::new(),
            jobs: vec![JobSpec::new("build")],
        };
        assert!(matcher.workflow_matches(&workflow, &Event::push("main")));
        assert!(!matcher.workflow_matches(&workflow, &Event::schedule("0 0 * * *")));
    }

    #[test]
    fn test_workflow_triggers_or_across_filters() {
        let matcher = TriggerMatcher::new();
        let workflow = WorkflowDefinition {
            name: "ci".to_string(),
            description: None,
            triggers: vec![
                filter(EventKind::Push, &["main"], &[]),
                filter(EventKind::PullRequest, &[], &[]),
            ],
            env: HashMap::new(),
            jobs: vec![JobSpec::new("build")],
        };
        assert!(matcher.workflow_matches(&workflow, &Event::push("main")));
        assert!(!matcher.workflow_matches(&workflow, &Event::push("dev")));
    }
}
