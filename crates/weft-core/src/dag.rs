//! Step dependency graph.
//!
//! Builds a petgraph DAG from a workflow definition and exposes the queries
//! the scheduler needs: topological order, per-step dependency and dependent
//! lists, transitive dependents (for cascade skipping), and the ready-set
//! over live step states. Readiness is derived on demand, never stored.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use weft_types::run::StepState;
use weft_types::run::StepStatus;
use weft_types::workflow::WorkflowDefinition;

use crate::definition::ValidationError;

/// Immutable dependency graph for one workflow definition.
#[derive(Debug, Clone)]
pub struct StepGraph {
    /// Step IDs in topological order.
    order: Vec<String>,
    deps: HashMap<String, Vec<String>>,
    dependents: HashMap<String, Vec<String>>,
}

impl StepGraph {
    /// Build the graph, rejecting cycles and unknown dependencies. The
    /// resume path builds straight from a caller-supplied definition, so
    /// the graph cannot rely on definition validation having run first.
    pub fn build(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut graph: DiGraph<&str, ()> = DiGraph::new();
        let mut indices: HashMap<&str, NodeIndex> = HashMap::new();

        for step in &definition.steps {
            let idx = graph.add_node(step.id.as_str());
            indices.insert(step.id.as_str(), idx);
        }
        for step in &definition.steps {
            let to = indices[step.id.as_str()];
            for dep in &step.depends_on {
                let Some(&from) = indices.get(dep.as_str()) else {
                    return Err(ValidationError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    });
                };
                graph.add_edge(from, to, ());
            }
        }

        let sorted = toposort(&graph, None)
            .map_err(|cycle| ValidationError::Cycle(graph[cycle.node_id()].to_string()))?;
        let order: Vec<String> = sorted.iter().map(|idx| graph[*idx].to_string()).collect();

        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &definition.steps {
            deps.insert(step.id.clone(), step.depends_on.clone());
            dependents.entry(step.id.clone()).or_default();
            for dep in &step.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.id.clone());
            }
        }

        Ok(Self {
            order,
            deps,
            dependents,
        })
    }

    /// Step IDs in topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn dependencies(&self, step_id: &str) -> &[String] {
        self.deps.get(step_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents(&self, step_id: &str) -> &[String] {
        self.dependents
            .get(step_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// All steps downstream of `step_id`, directly or transitively.
    pub fn transitive_dependents(&self, step_id: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependents(step_id).iter().map(String::as_str).collect();
        while let Some(id) = queue.pop_front() {
            if seen.insert(id.to_string()) {
                queue.extend(self.dependents(id).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Pending steps whose dependencies are all satisfied (succeeded or
    /// skipped). Steps waiting out a retry backoff are not pending and are
    /// rescheduled by the run loop's timers instead.
    pub fn ready_steps(&self, states: &BTreeMap<String, StepState>) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| {
                states
                    .get(*id)
                    .is_some_and(|s| s.status == StepStatus::Pending)
            })
            .filter(|id| {
                self.dependencies(id).iter().all(|dep| {
                    states
                        .get(dep)
                        .is_some_and(|s| s.status.satisfies_dependents())
                })
            })
            .cloned()
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
