//! Builder for [`Graph`](super::Graph)

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use super::{Edges, Graph, GraphError, Node, NodeKind};

/// Incrementally assembles a [`Graph`], checking edge/start/end consistency
/// at `build()` time rather than on every mutation.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    plain_edges: HashMap<String, Vec<String>>,
    tagged_edges: HashMap<String, Vec<(String, String)>>,
    start_node: Option<String>,
    end_nodes: Vec<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert_node(&mut self, id: &str, kind: NodeKind) {
        if !self.nodes.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.nodes.insert(
            id.to_string(),
            Node {
                id: id.to_string(),
                kind,
            },
        );
    }

    pub fn step(mut self, id: &str, step_name: &str) -> Self {
        self.insert_node(
            id,
            NodeKind::Step {
                step_name: step_name.to_string(),
            },
        );
        self
    }

    pub fn branch(mut self, id: &str, predicate: impl Fn(&Value) -> String + Send + Sync + 'static) -> Self {
        self.insert_node(
            id,
            NodeKind::Branch {
                predicate: Arc::new(predicate),
            },
        );
        self
    }

    pub fn join(mut self, id: &str) -> Self {
        self.insert_node(id, NodeKind::Join);
        self
    }

    /// Plain edge, valid from step/join nodes.
    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.plain_edges.entry(from.to_string()).or_default().push(to.to_string());
        self
    }

    /// Tagged edge, valid only from branch nodes.
    pub fn tagged_edge(mut self, from: &str, tag: &str, to: &str) -> Self {
        self.tagged_edges
            .entry(from.to_string())
            .or_default()
            .push((tag.to_string(), to.to_string()));
        self
    }

    pub fn start(mut self, id: &str) -> Self {
        self.start_node = Some(id.to_string());
        self
    }

    pub fn end(mut self, id: &str) -> Self {
        self.end_nodes.push(id.to_string());
        self
    }

    pub fn build(self) -> Result<Graph, GraphError> {
        let start_node = self
            .start_node
            .ok_or_else(|| GraphError::Invalid("no start node set".into()))?;
        if !self.nodes.contains_key(&start_node) {
            return Err(GraphError::NodeNotFound(start_node));
        }
        for end in &self.end_nodes {
            if !self.nodes.contains_key(end) {
                return Err(GraphError::NodeNotFound(end.clone()));
            }
        }

        let mut outgoing = HashMap::new();
        for (from, targets) in self.plain_edges {
            for to in &targets {
                if !self.nodes.contains_key(to) {
                    return Err(GraphError::OrphanEdge(from.clone(), to.clone()));
                }
            }
            outgoing.insert(from, Edges::Plain(targets));
        }
        for (from, targets) in self.tagged_edges {
            for (_, to) in &targets {
                if !self.nodes.contains_key(to) {
                    return Err(GraphError::OrphanEdge(from.clone(), to.clone()));
                }
            }
            outgoing.insert(from, Edges::Tagged(targets));
        }

        Ok(Graph {
            nodes: self.nodes,
            outgoing,
            order: self.order,
            start_node,
            end_nodes: self.end_nodes,
        })
    }
}
