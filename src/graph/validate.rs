//! Static graph validator

use std::collections::{HashSet, VecDeque};

use serde_json::Value;

use super::{DEFAULT_TAG, Edges, Graph, GraphError, NodeKind};

/// Severity of a validation finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// A single validation finding, tagged with a stable code so callers can
/// filter programmatically instead of matching on message text ( lists
/// the exact code set this module implements).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Issue {
    pub code: &'static str,
    pub severity: Severity,
    pub node: Option<String>,
    pub message: String,
}

impl Issue {
    fn new(code: &'static str, severity: Severity, node: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code,
            severity,
            node: node.map(String::from),
            message: message.into(),
        }
    }
}

/// Arm count above which a branch with a `default` edge is flagged
/// `complex_branch` rather than passed silently.
const DEFAULT_COMPLEX_BRANCH_THRESHOLD: usize = 5;

/// Run every check in and return all findings, regardless of severity.
/// Presence of any `Error`-severity finding makes the graph invalid.
pub fn validate(graph: &Graph) -> Vec<Issue> {
    validate_with_threshold(graph, DEFAULT_COMPLEX_BRANCH_THRESHOLD)
}

/// Like [`validate`], but with a configurable `complex_branch` arm-count
/// threshold.
pub fn validate_with_threshold(graph: &Graph, complex_branch_threshold: usize) -> Vec<Issue> {
    let mut issues = Vec::new();

    if graph.nodes().next().is_none() {
        issues.push(Issue::new("empty_graph", Severity::Info, None, "graph has no nodes"));
        return issues;
    }

    if graph.start_node().is_empty() {
        issues.push(Issue::new("no_start_node", Severity::Error, None, "graph has no start node set"));
    } else if graph.node(graph.start_node()).is_none() {
        issues.push(Issue::new(
            "start_node_not_found",
            Severity::Error,
            Some(graph.start_node()),
            format!("start node '{}' does not exist among the graph's nodes", graph.start_node()),
        ));
    }

    let has_implicit_terminal = graph.nodes().any(|n| graph.is_end(&n.id));
    if graph.end_nodes().is_empty() && !has_implicit_terminal {
        issues.push(Issue::new(
            "no_end_nodes",
            Severity::Warning,
            None,
            "graph declares no end nodes and no node is structurally terminal",
        ));
    }

    for (from, to) in orphan_edges(graph) {
        issues.push(Issue::new(
            "orphan_edges",
            Severity::Warning,
            Some(&from),
            format!("edge from '{from}' targets unknown node '{to}'"),
        ));
    }

    if graph.node(graph.start_node()).is_some() {
        let reachable = reachable_from(graph, graph.start_node());
        for node in graph.nodes() {
            if !reachable.contains(&node.id) {
                issues.push(Issue::new(
                    "unreachable_nodes",
                    Severity::Warning,
                    Some(&node.id),
                    format!("node '{}' is not reachable from the start node", node.id),
                ));
            }
        }
    }

    for node in graph.nodes() {
        let NodeKind::Branch { .. } = node.kind else { continue };
        let Some(Edges::Tagged(arms)) = graph.outgoing_edges(&node.id) else {
            continue;
        };
        let has_default = arms.iter().any(|(tag, _)| tag == DEFAULT_TAG);
        let arm_count = arms.iter().filter(|(tag, _)| tag != DEFAULT_TAG).count();

        if !has_default {
            if arm_count >= complex_branch_threshold {
                issues.push(Issue::new(
                    "branch_missing_default",
                    Severity::Error,
                    Some(&node.id),
                    format!(
                        "branch '{}' has {} arms (>= {}) with no default edge",
                        node.id, arm_count, complex_branch_threshold
                    ),
                ));
            } else {
                issues.push(Issue::new(
                    "branch_without_default",
                    Severity::Warning,
                    Some(&node.id),
                    format!("branch '{}' has no default edge; an unmatched tag will error at runtime", node.id),
                ));
            }
        } else if arm_count > complex_branch_threshold {
            issues.push(Issue::new(
                "complex_branch",
                Severity::Warning,
                Some(&node.id),
                format!(
                    "branch '{}' has {} arms, more than the configured threshold of {}",
                    node.id, arm_count, complex_branch_threshold
                ),
            ));
        }
    }

    issues
}

/// Run [`validate`] and fail if any `Error`-severity issue is present.
pub fn validate_strict(graph: &Graph) -> Result<(), GraphError> {
    validate_strict_with_threshold(graph, DEFAULT_COMPLEX_BRANCH_THRESHOLD)
}

pub fn validate_strict_with_threshold(graph: &Graph, complex_branch_threshold: usize) -> Result<(), GraphError> {
    let issues = validate_with_threshold(graph, complex_branch_threshold);
    let errors: Vec<&Issue> = issues.iter().filter(|i| i.severity == Severity::Error).collect();
    if errors.is_empty() {
        return Ok(());
    }
    let summary = errors
        .iter()
        .map(|i| format!("[{}] {}", i.code, i.message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(GraphError::Invalid(summary))
}

fn orphan_edges(graph: &Graph) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for node in graph.nodes() {
        let Some(edges) = graph.outgoing_edges(&node.id) else { continue };
        let targets: Vec<&str> = match edges {
            Edges::Plain(ts) => ts.iter().map(String::as_str).collect(),
            Edges::Tagged(ts) => ts.iter().map(|(_, t)| t.as_str()).collect(),
        };
        for target in targets {
            if graph.node(target).is_none() {
                out.push((node.id.clone(), target.to_string()));
            }
        }
    }
    out
}

fn reachable_from(graph: &Graph, start: &str) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(start.to_string());
    seen.insert(start.to_string());
    while let Some(id) = queue.pop_front() {
        for next in outgoing_ids(graph, &id) {
            if seen.insert(next.clone()) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn outgoing_ids(graph: &Graph, id: &str) -> Vec<String> {
    if graph.node(id).is_none() {
        return Vec::new();
    }
    // Branch and plain nodes alike: reachability is a structural property,
    // independent of which tag a predicate would actually pick at runtime.
    graph.all_targets_of(id)
}

/// Probe a branch node's predicate against `state` without following the
/// resolved edge — used by callers that want to sanity-check a predicate
/// outside of a real traversal.
pub fn probe_branch_tag(graph: &Graph, node_id: &str, state: &Value) -> Option<String> {
    match &graph.node(node_id)?.kind {
        NodeKind::Branch { predicate } => Some(predicate(state)),
        _ => None,
    }
}
