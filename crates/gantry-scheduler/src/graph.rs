//! Instance dependency graph construction.
//!
//! Jobs are expanded into matrix instances first, then wired up: a job
//! that needs a matrixed job depends on ALL of its instances, and every
//! instance of a matrixed dependent carries the full dependency set of its
//! job. The graph is validated acyclic before any scheduling begins.

use crate::matrix::{Combination, MatrixExpander, MatrixSpecError};
use gantry_core::ids::{InstanceId, JobId};
use gantry_core::workflow::JobSpec;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("cycle detected in job dependencies: {}", format_cycle(.path))]
    Cycle { path: Vec<InstanceId> },

    #[error("job '{job}' needs unknown job '{needs}'")]
    UnknownReference { job: JobId, needs: JobId },

    #[error("duplicate job id '{0}'")]
    DuplicateJob(JobId),

    #[error("matrix expansion produced duplicate instance id '{0}'")]
    DuplicateInstance(InstanceId),

    #[error("workflow has no jobs")]
    EmptyWorkflow,

    #[error(transparent)]
    Matrix(#[from] MatrixSpecError),
}

fn format_cycle(path: &[InstanceId]) -> String {
    path.iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// One concrete, schedulable job: a job spec plus one matrix assignment.
/// Immutable once the graph is built; serializable for handoff to an
/// external executor.
#[derive(Debug, Clone, Serialize)]
pub struct JobInstance {
    pub spec_id: JobId,
    pub instance_id: InstanceId,
    pub matrix_values: BTreeMap<String, Value>,
    pub condition: Option<String>,
    pub runs_on: String,
}

impl JobInstance {
    fn new(spec: &JobSpec, combination: Combination) -> Self {
        let instance_id = if combination.is_empty() {
            InstanceId::new(spec.id.as_str())
        } else {
            InstanceId::new(format!("{} ({})", spec.id, combination.label()))
        };
        Self {
            spec_id: spec.id.clone(),
            instance_id,
            matrix_values: combination.into_map(),
            condition: spec.condition.clone(),
            runs_on: spec.runs_on.clone(),
        }
    }
}

/// Directed acyclic graph over job instances.
#[derive(Debug)]
pub struct InstanceGraph {
    graph: DiGraph<JobInstance, ()>,
    by_instance: HashMap<InstanceId, NodeIndex>,
}

impl InstanceGraph {
    /// All instances in declaration order (specs as declared, matrix legs
    /// in expansion order). This order is deterministic and is the order
    /// the scheduler scans in.
    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.graph.node_indices().filter_map(|idx| self.graph.node_weight(idx))
    }

    pub fn instance(&self, id: &InstanceId) -> Option<&JobInstance> {
        self.by_instance
            .get(id)
            .and_then(|&idx| self.graph.node_weight(idx))
    }

    /// Direct dependencies of an instance.
    pub fn predecessors(&self, id: &InstanceId) -> Vec<&JobInstance> {
        self.by_instance
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances unblocked by an instance completing.
    pub fn successors(&self, id: &InstanceId) -> Vec<&JobInstance> {
        self.by_instance
            .get(id)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Outgoing)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances with no dependencies.
    pub fn roots(&self) -> Vec<&JobInstance> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    /// Instances in a topological order (dependencies before dependents).
    /// Always succeeds: acyclicity was validated at build time.
    pub fn topological_order(&self) -> Vec<&JobInstance> {
        let mut order = Vec::with_capacity(self.graph.node_count());
        let mut colors = vec![Color::White; self.graph.node_count()];
        for idx in self.graph.node_indices() {
            if colors[idx.index()] == Color::White {
                // Cycle impossible here, so the path stack is discarded.
                let _ = dfs_visit(&self.graph, idx, &mut colors, &mut Vec::new(), &mut order);
            }
        }
        order.reverse();
        order
            .into_iter()
            .filter_map(|idx| self.graph.node_weight(idx))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// DFS coloring. Returns the full cycle path (first node repeated at the
/// end) if a back edge is found; otherwise appends finished nodes to
/// `finish_order` (reverse topological order).
fn dfs_visit(
    graph: &DiGraph<JobInstance, ()>,
    idx: NodeIndex,
    colors: &mut [Color],
    stack: &mut Vec<NodeIndex>,
    finish_order: &mut Vec<NodeIndex>,
) -> Option<Vec<NodeIndex>> {
    colors[idx.index()] = Color::Gray;
    stack.push(idx);

    // Outgoing neighbors come back in reverse insertion order; sort for a
    // stable reported path.
    let mut successors: Vec<NodeIndex> =
        graph.neighbors_directed(idx, Direction::Outgoing).collect();
    successors.sort();

    for succ in successors {
        match colors[succ.index()] {
            Color::Gray => {
                let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                let mut path: Vec<NodeIndex> = stack[start..].to_vec();
                path.push(succ);
                return Some(path);
            }
            Color::White => {
                if let Some(path) = dfs_visit(graph, succ, colors, stack, finish_order) {
                    return Some(path);
                }
            }
            Color::Black => {}
        }
    }

    stack.pop();
    colors[idx.index()] = Color::Black;
    finish_order.push(idx);
    None
}

/// Builder for constructing instance graphs from job specs.
pub struct GraphBuilder;

impl GraphBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Expand matrices and build the instance DAG.
    ///
    /// Fails fast on configuration errors: unknown `needs` references,
    /// duplicate job ids, malformed matrices, and dependency cycles (the
    /// error carries the full cycle path for diagnosability).
    pub fn build(&self, specs: &[JobSpec]) -> Result<InstanceGraph, GraphError> {
        if specs.is_empty() {
            return Err(GraphError::EmptyWorkflow);
        }

        let expander = MatrixExpander::new();
        let mut graph = DiGraph::new();
        let mut by_instance = HashMap::new();
        let mut spec_nodes: HashMap<JobId, Vec<NodeIndex>> = HashMap::new();

        for spec in specs {
            if spec_nodes.contains_key(&spec.id) {
                return Err(GraphError::DuplicateJob(spec.id.clone()));
            }
            let combinations = match &spec.matrix {
                Some(matrix) => expander.expand(matrix)?,
                None => vec![Combination::default()],
            };
            let mut nodes = Vec::with_capacity(combinations.len());
            for combination in combinations {
                let instance = JobInstance::new(spec, combination);
                let id = instance.instance_id.clone();
                if by_instance.contains_key(&id) {
                    return Err(GraphError::DuplicateInstance(id));
                }
                let idx = graph.add_node(instance);
                by_instance.insert(id, idx);
                nodes.push(idx);
            }
            spec_nodes.insert(spec.id.clone(), nodes);
        }

        for spec in specs {
            let dependents = spec_nodes[&spec.id].clone();
            for need in &spec.needs {
                let providers = spec_nodes
                    .get(need)
                    .ok_or_else(|| GraphError::UnknownReference {
                        job: spec.id.clone(),
                        needs: need.clone(),
                    })?;
                // Every leg of the dependent waits for every leg of the
                // needed job.
                for &provider in providers {
                    for &dependent in &dependents {
                        graph.add_edge(provider, dependent, ());
                    }
                }
            }
        }

        // Cycle check over the full instance graph.
        let mut colors = vec![Color::White; graph.node_count()];
        let mut finish_order = Vec::new();
        for idx in graph.node_indices() {
            if colors[idx.index()] == Color::White {
                if let Some(path) =
                    dfs_visit(&graph, idx, &mut colors, &mut Vec::new(), &mut finish_order)
                {
                    let path = path
                        .into_iter()
                        .filter_map(|n| graph.node_weight(n))
                        .map(|i| i.instance_id.clone())
                        .collect();
                    return Err(GraphError::Cycle { path });
                }
            }
        }

        Ok(InstanceGraph { graph, by_instance })
    }
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::workflow::{JobSpec, MatrixAxis, MatrixSpec};
    use serde_json::json;

    fn job(id: &str, needs: &[&str]) -> JobSpec {
        let mut spec = JobSpec::new(id);
        spec.needs = needs.iter().map(|n| JobId::new(*n)).collect();
        spec
    }

    fn matrixed_job(id: &str, needs: &[&str], axis: &str, values: Vec<Value>) -> JobSpec {
        let mut spec = job(id, needs);
        spec.matrix = Some(MatrixSpec {
            axes: vec![MatrixAxis::new(axis, values)],
            include: vec![],
            exclude: vec![],
        });
        spec
    }

    #[test]
    fn test_linear_graph() {
        let specs = vec![job("build", &[]), job("test", &["build"]), job("deploy", &["test"])];
        let graph = GraphBuilder::new().build(&specs).unwrap();

        assert_eq!(graph.len(), 3);
        let roots = graph.roots();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].instance_id.as_str(), "build");

        let order = graph.topological_order();
        assert_eq!(order[0].instance_id.as_str(), "build");
        assert_eq!(order[2].instance_id.as_str(), "deploy");

        let downstream = graph.successors(&InstanceId::new("build"));
        assert_eq!(downstream.len(), 1);
        assert_eq!(downstream[0].instance_id.as_str(), "test");
    }

    #[test]
    fn test_matrixed_dependency_fans_in() {
        let specs = vec![
            matrixed_job("build", &[], "os", vec![json!("linux"), json!("macos"), json!("win")]),
            job("publish", &["build"]),
        ];
        let graph = GraphBuilder::new().build(&specs).unwrap();

        assert_eq!(graph.len(), 4);
        let deps = graph.predecessors(&InstanceId::new("publish"));
        assert_eq!(deps.len(), 3);
        assert!(deps.iter().all(|d| d.spec_id.as_str() == "build"));
    }

    #[test]
    fn test_matrixed_dependent_full_fan() {
        // Each leg of the dependent waits on every leg of the dependency.
        let specs = vec![
            matrixed_job("build", &[], "os", vec![json!("linux"), json!("macos")]),
            matrixed_job("test", &["build"], "suite", vec![json!("unit"), json!("e2e")]),
        ];
        let graph = GraphBuilder::new().build(&specs).unwrap();

        let deps = graph.predecessors(&InstanceId::new("test (suite=unit)"));
        assert_eq!(deps.len(), 2);
    }

    #[test]
    fn test_unknown_reference_fails_fast() {
        let specs = vec![job("test", &["build"])];
        let err = GraphBuilder::new().build(&specs).unwrap_err();
        assert!(matches!(
            err,
            GraphError::UnknownReference { job, needs }
                if job.as_str() == "test" && needs.as_str() == "build"
        ));
    }

    #[test]
    fn test_cycle_reports_full_path() {
        let specs = vec![job("x", &["y"]), job("y", &["x"])];
        let err = GraphBuilder::new().build(&specs).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                let names: Vec<&str> = path.iter().map(|i| i.as_str()).collect();
                assert_eq!(names, vec!["x", "y", "x"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_self_cycle() {
        let specs = vec![job("solo", &["solo"])];
        let err = GraphBuilder::new().build(&specs).unwrap_err();
        match err {
            GraphError::Cycle { path } => {
                let names: Vec<&str> = path.iter().map(|i| i.as_str()).collect();
                assert_eq!(names, vec!["solo", "solo"]);
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let specs = vec![job("build", &[]), job("build", &[])];
        let err = GraphBuilder::new().build(&specs).unwrap_err();
        assert!(matches!(err, GraphError::DuplicateJob(id) if id.as_str() == "build"));
    }

    #[test]
    fn test_colliding_instance_ids_rejected() {
        // The string "1" and the number 1 are distinct combinations but
        // render the same instance id.
        let specs = vec![matrixed_job("build", &[], "v", vec![json!("1"), json!(1)])];
        let err = GraphBuilder::new().build(&specs).unwrap_err();
        assert!(matches!(
            err,
            GraphError::DuplicateInstance(id) if id.as_str() == "build (v=1)"
        ));
    }

    #[test]
    fn test_empty_workflow_rejected() {
        let err = GraphBuilder::new().build(&[]).unwrap_err();
        assert!(matches!(err, GraphError::EmptyWorkflow));
    }

    #[test]
    fn test_unmatrixed_instance_id_is_job_id() {
        let specs = vec![job("build", &[])];
        let graph = GraphBuilder::new().build(&specs).unwrap();
        assert!(graph.instance(&InstanceId::new("build")).is_some());
    }

    #[test]
    fn test_matrix_instance_ids_deterministic() {
        let specs = vec![matrixed_job("test", &[], "os", vec![json!("linux"), json!("macos")])];
        let graph = GraphBuilder::new().build(&specs).unwrap();
        let ids: Vec<&str> = graph.instances().map(|i| i.instance_id.as_str()).collect();
        assert_eq!(ids, vec!["test (os=linux)", "test (os=macos)"]);
    }
}
