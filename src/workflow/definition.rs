//! Workflow definitions: the static description an actor executes

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::graph::Graph;
use crate::reliability::StepRetryPolicy;

use super::step::{Step, StepError};

/// Error type for workflow failures recorded on a [`WorkflowRecord`](super::WorkflowRecord).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkflowError {
    pub message: String,
    pub code: Option<String>,
    pub retryable: bool,
}

impl WorkflowError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: false,
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            retryable: true,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Lift a failed step's terminal error into a workflow-level error,
    /// preserving the step's tag as the error code.
    pub fn from_step_error(err: &StepError) -> Self {
        Self {
            message: err.message.clone(),
            code: Some(err.tag.clone()),
            retryable: false,
        }
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for WorkflowError {}

/// The static description of a workflow type: its graph, its steps, and the
/// state-transition hooks invoked around each step.
///
/// Implementations are looked up by [`key`](WorkflowDefinition::key) through
/// a [`DefinitionRegistry`](crate::engine::DefinitionRegistry); a single
/// definition instance is shared across every running instance of that
/// workflow type, so it must not carry per-run mutable state.
pub trait WorkflowDefinition: Send + Sync {
    /// Stable identifier workflow instances reference via `definition_key`.
    fn key(&self) -> &str;

    /// The graph this definition's actor walks.
    fn graph(&self) -> &Graph;

    /// Resolve a graph step node's `step_name` to its implementation.
    fn step(&self, name: &str) -> Option<Arc<dyn Step>>;

    /// Build the initial `state_payload` from the caller-supplied start
    /// parameters.
    fn initial_state(&self, params: Value) -> Value {
        params
    }

    /// Called after a step completes successfully, to fold its output back
    /// into workflow state before the next graph node is resolved. Default:
    /// the step's returned state is used verbatim.
    fn handle_step_success(&self, _step_name: &str, new_state: Value) -> Value {
        new_state
    }

    /// Called when a step's retry budget is exhausted and the workflow is
    /// about to transition to `failed`. Default: leave
    /// state untouched; the caller records the error on the workflow record.
    fn handle_step_failure(&self, _step_name: &str, _reason: &StepError, state: Value) -> Value {
        state
    }

    /// The retry policy applied to `step_name`. Default: `aggressive`.
    fn retry_policy(&self, _step_name: &str) -> StepRetryPolicy {
        StepRetryPolicy::named("aggressive").expect("\"aggressive\" is a built-in named policy")
    }

    /// Whether this definition's steps compensate in LIFO order on failure
    ///. Default: `false` — a plain non-compensating workflow.
    fn is_saga(&self) -> bool {
        false
    }
}

/// Convenience definition for the common case of a simple ordered chain of
/// steps with no branching.
pub struct LinearWorkflowDefinition {
    key: String,
    graph: Graph,
    steps: HashMap<String, Arc<dyn Step>>,
}

impl LinearWorkflowDefinition {
    pub fn new(key: impl Into<String>, steps: Vec<Arc<dyn Step>>) -> Self {
        let names: Vec<String> = steps.iter().map(|s| s.name().to_string()).collect();
        let graph = Graph::from_linear_steps(names.clone());
        let steps = names.into_iter().zip(steps).collect();
        Self {
            key: key.into(),
            graph,
            steps,
        }
    }
}

impl WorkflowDefinition for LinearWorkflowDefinition {
    fn key(&self) -> &str {
        &self.key
    }

    fn graph(&self) -> &Graph {
        &self.graph
    }

    fn step(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }
}
