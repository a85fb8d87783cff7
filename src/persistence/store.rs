//! Durable Store interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::workflow::event::{EventFilter, EventRecord};
use crate::workflow::record::{WorkflowRecord, WorkflowStatus};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error("restore failed, snapshot written to emergency file {0}")]
    RestoreFailed(String),
}

/// Filter for `list_workflows`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatus>,
    pub definition_key: Option<String>,
}

/// A snapshot of `{status}` only, for hot-path checks that don't need the
/// full workflow record.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowStatusSnapshot {
    pub status: WorkflowStatus,
    pub current_step_index: usize,
}

/// Backup payload shape: `{timestamp, node_id,
/// tables: {name -> records}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub workflows: Vec<WorkflowRecord>,
    pub events: Vec<EventRecord>,
}

/// Transactional storage of workflows and their append-only event log
///. Reads on hot paths may be dirty (latest-committed-visible, no
/// isolation) — each such method documents it.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Transactional upsert of a workflow record.
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError>;

    /// Consistent read of the full workflow record.
    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError>;

    /// Dirty fast-path read of just the status fields.
    async fn get_workflow_status(&self, id: &str) -> Result<WorkflowStatusSnapshot, StoreError>;

    /// Dirty read, used by dashboards/listings.
    async fn list_workflows(&self, filter: &WorkflowFilter, limit: usize) -> Vec<WorkflowRecord>;

    /// Deletes the workflow and cascades its events.
    async fn delete_workflow(&self, id: &str) -> Result<(), StoreError>;

    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError>;

    async fn get_events(&self, workflow_id: &str, filter: &EventFilter, limit: usize) -> Vec<EventRecord>;

    async fn count_by_status(&self) -> std::collections::HashMap<WorkflowStatus, usize>;

    /// Snapshot every table to the backup format.
    async fn backup(&self, node_id: &str) -> Backup;

    /// Destroy all stored data and recreate empty tables/files.
    async fn destroy_and_recreate(&self) -> Result<(), StoreError>;

    /// Restore from a backup. On failure, implementations must serialize
    /// the snapshot they were attempting to write to an emergency file
    /// named by Unix timestamp and return [`StoreError::RestoreFailed`]
    /// naming that file.
    async fn restore(&self, backup: Backup) -> Result<(), StoreError>;
}
