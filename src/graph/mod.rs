//! Workflow graph / branching model
//!
//! A [`Graph`] is the declarative DAG a [`WorkflowActor`](crate::workflow::WorkflowActor)
//! walks one node at a time: step nodes do work, branch nodes pick an
//! outgoing edge by evaluating a predicate against the current state, and
//! join nodes are structural markers where parallel arms recombine.

mod builder;
mod validate;

pub use builder::GraphBuilder;
pub use validate::{
    probe_branch_tag, validate, validate_strict, validate_strict_with_threshold, validate_with_threshold, Issue,
    Severity,
};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

/// Errors raised by graph construction or traversal.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NodeNotFound(String),
    #[error("edge targets unknown node: {0} -> {1}")]
    OrphanEdge(String, String),
    #[error("no matching branch for node {node} (tag {tag:?}, no default edge)")]
    NoMatchingBranch { node: String, tag: String },
    #[error("graph failed strict validation: {0}")]
    Invalid(String),
}

/// Predicate evaluated on a branch node. Returns an arbitrary tag, or the
/// reserved string `"default"` to fall back to the catch-all edge.
pub type BranchPredicate = Arc<dyn Fn(&Value) -> String + Send + Sync>;

/// The reserved tag name matched when no other branch arm applies.
pub const DEFAULT_TAG: &str = "default";

/// Kind-specific payload of a node.
#[derive(Clone)]
pub enum NodeKind {
    /// Carries a reference to a step module, resolved by name against the
    /// owning [`WorkflowDefinition`](crate::workflow::WorkflowDefinition).
    Step { step_name: String },
    /// Evaluates `predicate` against workflow state to obtain a tag.
    Branch { predicate: BranchPredicate },
    /// Structural marker where branches recombine.
    Join,
}

impl fmt::Debug for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Step { step_name } => f.debug_struct("Step").field("step_name", step_name).finish(),
            Self::Branch { .. } => write!(f, "Branch {{ predicate: <fn> }}"),
            Self::Join => write!(f, "Join"),
        }
    }
}

/// A single node in the graph.
#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
}

/// Outgoing edges from a node. Step and join nodes carry plain target ids;
/// branch nodes carry `(tag, target)` pairs.
#[derive(Clone, Debug)]
pub enum Edges {
    Plain(Vec<String>),
    Tagged(Vec<(String, String)>),
}

impl Edges {
    fn targets(&self) -> Vec<&str> {
        match self {
            Self::Plain(ts) => ts.iter().map(String::as_str).collect(),
            Self::Tagged(ts) => ts.iter().map(|(_, t)| t.as_str()).collect(),
        }
    }
}

/// Result of resolving the next node(s) from the current position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextNodes {
    /// One or more outgoing targets to visit.
    Targets(Vec<String>),
    /// The walk has reached a terminal node.
    End,
}

/// Declarative DAG of steps, branches, and joins.
#[derive(Clone)]
pub struct Graph {
    nodes: HashMap<String, Node>,
    outgoing: HashMap<String, Edges>,
    /// Insertion order, used by [`linearize`](Graph::linearize) and by the
    /// validator to report nodes deterministically.
    order: Vec<String>,
    start_node: String,
    end_nodes: Vec<String>,
}

impl fmt::Debug for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.order)
            .field("start_node", &self.start_node)
            .field("end_nodes", &self.end_nodes)
            .finish()
    }
}

impl Graph {
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Linear adapter: turn an ordered list of step names into a
    /// chain `step_0 -> step_1 -> ... -> step_{n-1}`, `end_nodes = [step_{n-1}]`.
    ///
    /// Node ids are zero-padded so lexicographic and insertion order agree
    /// past ten steps ( "Open question" — the naive `step_0, step_1, ...`
    /// naming sorts wrong once there are 10+ steps; zero-padding the width
    /// to the step count fixes that without changing the id scheme).
    pub fn from_linear_steps(step_names: impl IntoIterator<Item = impl Into<String>>) -> Graph {
        let names: Vec<String> = step_names.into_iter().map(Into::into).collect();
        let width = names.len().to_string().len().max(1);
        let mut builder = Graph::builder();
        let ids: Vec<String> = (0..names.len())
            .map(|i| format!("step_{:0width$}", i, width = width))
            .collect();
        for (id, name) in ids.iter().zip(names.iter()) {
            builder = builder.step(id, name);
        }
        for pair in ids.windows(2) {
            builder = builder.edge(&pair[0], &pair[1]);
        }
        if let Some(last) = ids.last() {
            builder = builder.start(ids.first().unwrap()).end(last);
        }
        builder.build().expect("linear adapter always builds a valid graph")
    }

    /// Inverse of [`from_linear_steps`](Graph::from_linear_steps) for graphs
    /// that are actually linear chains: follows the single outgoing edge
    /// from `start_node` until an end node, collecting step names.
    ///
    /// Traverses edges rather than sorting node ids, which is what makes it
    /// correct regardless of id width.
    pub fn linearize(&self) -> Option<Vec<String>> {
        let mut out = Vec::new();
        let mut current = self.start_node.clone();
        loop {
            let node = self.nodes.get(&current)?;
            match &node.kind {
                NodeKind::Step { step_name } => out.push(step_name.clone()),
                _ => return None,
            }
            if self.end_nodes.contains(&current) {
                return Some(out);
            }
            let next = match self.outgoing.get(&current) {
                Some(Edges::Plain(targets)) if targets.len() == 1 => targets[0].clone(),
                _ => return None,
            };
            current = next;
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn start_node(&self) -> &str {
        &self.start_node
    }

    pub fn end_nodes(&self) -> &[String] {
        &self.end_nodes
    }

    pub fn is_end(&self, id: &str) -> bool {
        self.end_nodes.iter().any(|e| e == id) || !self.outgoing.contains_key(id)
    }

    fn outgoing_targets(&self, id: &str) -> Vec<&str> {
        self.outgoing.get(id).map(|e| e.targets()).unwrap_or_default()
    }

    /// Raw outgoing edge set for `id`, for validators that need to
    /// distinguish tagged arms from plain edges.
    pub(crate) fn outgoing_edges(&self, id: &str) -> Option<&Edges> {
        self.outgoing.get(id)
    }

    /// All targets reachable from `id` in a single hop, ignoring branch tags.
    /// Used by the validator, which must reason about structure without
    /// evaluating branch predicates against real state.
    fn all_targets_of(&self, id: &str) -> Vec<String> {
        self.outgoing_targets(id).into_iter().map(String::from).collect()
    }

    /// Next-node resolution.
    pub fn next(&self, current_id: &str, state: &Value) -> Result<NextNodes, GraphError> {
        let node = self
            .nodes
            .get(current_id)
            .ok_or_else(|| GraphError::NodeNotFound(current_id.to_string()))?;

        match &node.kind {
            NodeKind::Step { .. } | NodeKind::Join => {
                if self.is_end(current_id) {
                    return Ok(NextNodes::End);
                }
                let targets = self.outgoing_targets(current_id).into_iter().map(String::from).collect();
                Ok(NextNodes::Targets(targets))
            }
            NodeKind::Branch { predicate } => {
                let tag = predicate(state);
                let edges = match self.outgoing.get(current_id) {
                    Some(Edges::Tagged(edges)) => edges,
                    _ => return Err(GraphError::NodeNotFound(current_id.to_string())),
                };
                if let Some((_, target)) = edges.iter().find(|(t, _)| *t == tag) {
                    return Ok(NextNodes::Targets(vec![target.clone()]));
                }
                if let Some((_, target)) = edges.iter().find(|(t, _)| t == DEFAULT_TAG) {
                    return Ok(NextNodes::Targets(vec![target.clone()]));
                }
                Err(GraphError::NoMatchingBranch {
                    node: current_id.to_string(),
                    tag,
                })
            }
        }
    }
}
