//! Append-only workflow event log

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of event types. Represented as a tagged variant rather than a
/// string switch, per the "dynamic dispatch on events" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepSkipped,
    WorkflowCompleted,
    WorkflowFailed,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::WorkflowStarted => "workflow_started",
            Self::StepStarted => "step_started",
            Self::StepCompleted => "step_completed",
            Self::StepFailed => "step_failed",
            Self::StepSkipped => "step_skipped",
            Self::WorkflowCompleted => "workflow_completed",
            Self::WorkflowFailed => "workflow_failed",
        };
        write!(f, "{s}")
    }
}

/// A single append-only entry in a workflow's execution trace.
///
/// Events for a given workflow, ordered by `timestamp`, are the
/// authoritative execution trace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: Uuid,
    /// Opaque caller-supplied identifier ( "All identifiers are opaque
    /// strings"): minted by the engine itself only for `event_id`.
    pub workflow_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventRecord {
    pub fn new(workflow_id: impl Into<String>, event_type: EventType, data: Value) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            workflow_id: workflow_id.into(),
            event_type,
            data,
            timestamp: Utc::now(),
        }
    }
}

/// Filter for `get_events`
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub event_type: Option<EventType>,
}
