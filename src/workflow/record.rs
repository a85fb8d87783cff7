//! Workflow record: the durable snapshot of a single in-flight workflow

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::definition::WorkflowError;

/// Lifecycle status of a workflow instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Created, not yet taken its first step
    Pending,
    /// Actively executing steps
    Running,
    /// Reached an end node with no error
    Completed,
    /// Terminated by an unrecoverable step failure or branch error
    Failed,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Durable record of a single workflow instance
///
/// Owned exclusively by the actor's in-memory mutation while the workflow
/// is alive; the durable store is written only through the actor or a
/// recovery path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    /// Opaque caller-supplied identifier ( "All identifiers are opaque
    /// strings") — e.g. `"wf-s1"`, or `"{original_id}_retry_{n}"` as minted
    /// by the DLQ's workflow-restart retry action.
    pub id: String,
    pub definition_key: String,
    pub status: WorkflowStatus,
    /// Free-form mapping from string keys to JSON-serializable values
    pub state_payload: Value,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<WorkflowError>,
    pub inserted_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    pub fn new(id: impl Into<String>, definition_key: impl Into<String>, total_steps: usize) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            definition_key: definition_key.into(),
            status: WorkflowStatus::Pending,
            state_payload: Value::Object(Default::default()),
            current_step_index: 0,
            total_steps,
            started_at: now,
            completed_at: None,
            error: None,
            inserted_at: now,
            updated_at: now,
        }
    }

    /// Invariant from: `status = completed ⇒ current_step_index = total_steps ∧ completed_at ≠ null`
    pub fn mark_completed(&mut self) {
        self.status = WorkflowStatus::Completed;
        self.current_step_index = self.total_steps;
        self.completed_at = Some(Utc::now());
        self.updated_at = self.completed_at.unwrap();
    }

    /// Invariant from: `status = failed ⇒ error ≠ null ∧ completed_at ≠ null`
    pub fn mark_failed(&mut self, error: WorkflowError) {
        self.status = WorkflowStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
        self.updated_at = self.completed_at.unwrap();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, WorkflowStatus::Completed | WorkflowStatus::Failed)
    }

    pub fn check_invariants(&self) -> Result<(), String> {
        if self.current_step_index > self.total_steps {
            return Err(format!(
                "current_step_index {} exceeds total_steps {}",
                self.current_step_index, self.total_steps
            ));
        }
        if self.status == WorkflowStatus::Completed
            && (self.current_step_index != self.total_steps || self.completed_at.is_none())
        {
            return Err("completed workflow must have current_step_index = total_steps and completed_at set".into());
        }
        if self.status == WorkflowStatus::Failed && (self.error.is_none() || self.completed_at.is_none())
        {
            return Err("failed workflow must have error and completed_at set".into());
        }
        Ok(())
    }
}
