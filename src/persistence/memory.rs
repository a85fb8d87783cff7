//! In-memory [`DurableStore`]: the default backend for tests and for
//! single-node deployments that don't need cross-restart durability.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::workflow::event::{EventFilter, EventRecord};
use crate::workflow::record::{WorkflowRecord, WorkflowStatus};

use super::store::{Backup, DurableStore, StoreError, WorkflowFilter, WorkflowStatusSnapshot};

#[derive(Default)]
struct State {
    workflows: HashMap<String, WorkflowRecord>,
    events: HashMap<String, Vec<EventRecord>>,
}

/// `RwLock<HashMap>`-backed store: every write takes the exclusive lock, so
/// "transactional" here means "happens inside a single lock acquisition"
/// rather than true multi-statement atomicity (, only meaningful once a
/// real backend like [`super::postgres::PostgresDurableStore`] is in play).
pub struct InMemoryDurableStore {
    state: RwLock<State>,
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
        }
    }

    /// Test/diagnostic helper: number of workflow records currently stored.
    pub fn workflow_count(&self) -> usize {
        self.state.read().workflows.len()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        self.state.write().workflows.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
        self.state
            .read()
            .workflows
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn get_workflow_status(&self, id: &str) -> Result<WorkflowStatusSnapshot, StoreError> {
        self.state
            .read()
            .workflows
            .get(id)
            .map(|r| WorkflowStatusSnapshot {
                status: r.status,
                current_step_index: r.current_step_index,
            })
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))
    }

    async fn list_workflows(&self, filter: &WorkflowFilter, limit: usize) -> Vec<WorkflowRecord> {
        self.state
            .read()
            .workflows
            .values()
            .filter(|r| filter.status.map(|s| s == r.status).unwrap_or(true))
            .filter(|r| filter.definition_key.as_deref().map(|k| k == r.definition_key).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn delete_workflow(&self, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state
            .workflows
            .remove(id)
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;
        state.events.remove(id);
        Ok(())
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        self.state
            .write()
            .events
            .entry(event.workflow_id.clone())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn get_events(&self, workflow_id: &str, filter: &EventFilter, limit: usize) -> Vec<EventRecord> {
        self.state
            .read()
            .events
            .get(workflow_id)
            .into_iter()
            .flatten()
            .filter(|e| filter.event_type.map(|t| t == e.event_type).unwrap_or(true))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn count_by_status(&self) -> HashMap<WorkflowStatus, usize> {
        let mut counts = HashMap::new();
        for record in self.state.read().workflows.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        counts
    }

    async fn backup(&self, node_id: &str) -> Backup {
        let state = self.state.read();
        Backup {
            timestamp: chrono::Utc::now(),
            node_id: node_id.to_string(),
            workflows: state.workflows.values().cloned().collect(),
            events: state.events.values().flatten().cloned().collect(),
        }
    }

    async fn destroy_and_recreate(&self) -> Result<(), StoreError> {
        *self.state.write() = State::default();
        Ok(())
    }

    async fn restore(&self, backup: Backup) -> Result<(), StoreError> {
        let mut state = self.state.write();
        state.workflows = backup.workflows.into_iter().map(|w| (w.id.clone(), w)).collect();
        state.events = HashMap::new();
        for event in backup.events {
            state.events.entry(event.workflow_id.clone()).or_default().push(event);
        }
        Ok(())
    }
}

/// Convenience constructor mirroring [`crate::idempotency::shared_memory_store`].
pub fn shared_memory_store() -> Arc<dyn DurableStore> {
    Arc::new(InMemoryDurableStore::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::event::EventType;
    use serde_json::json;

    #[tokio::test]
    async fn save_and_get_round_trips() {
        let store = InMemoryDurableStore::new();
        let record = WorkflowRecord::new("wf-1", "order_fulfillment", 3);
        store.save_workflow(&record).await.unwrap();
        let fetched = store.get_workflow("wf-1").await.unwrap();
        assert_eq!(fetched.id, "wf-1");
    }

    #[tokio::test]
    async fn get_workflow_status_is_a_cheap_projection() {
        let store = InMemoryDurableStore::new();
        let mut record = WorkflowRecord::new("wf-1", "k", 3);
        record.current_step_index = 2;
        store.save_workflow(&record).await.unwrap();
        let snapshot = store.get_workflow_status("wf-1").await.unwrap();
        assert_eq!(snapshot.current_step_index, 2);
    }

    #[tokio::test]
    async fn delete_cascades_events() {
        let store = InMemoryDurableStore::new();
        let record = WorkflowRecord::new("wf-1", "k", 1);
        store.save_workflow(&record).await.unwrap();
        store
            .append_event(&EventRecord::new("wf-1", EventType::WorkflowStarted, json!({})))
            .await
            .unwrap();
        store.delete_workflow("wf-1").await.unwrap();
        assert!(store.get_workflow("wf-1").await.is_err());
        assert!(store.get_events("wf-1", &EventFilter::default(), 10).await.is_empty());
    }

    #[tokio::test]
    async fn backup_and_restore_round_trips() {
        let store = InMemoryDurableStore::new();
        let record = WorkflowRecord::new("wf-1", "k", 1);
        store.save_workflow(&record).await.unwrap();
        store
            .append_event(&EventRecord::new("wf-1", EventType::WorkflowStarted, json!({})))
            .await
            .unwrap();
        let backup = store.backup("node-a").await;

        store.destroy_and_recreate().await.unwrap();
        assert_eq!(store.workflow_count(), 0);

        store.restore(backup).await.unwrap();
        assert_eq!(store.workflow_count(), 1);
        assert_eq!(store.get_events("wf-1", &EventFilter::default(), 10).await.len(), 1);
    }

    #[tokio::test]
    async fn list_workflows_filters_by_status_and_definition_key() {
        let store = InMemoryDurableStore::new();
        let mut completed = WorkflowRecord::new("wf-1", "order_fulfillment", 1);
        completed.mark_completed();
        store.save_workflow(&completed).await.unwrap();
        store.save_workflow(&WorkflowRecord::new("wf-2", "order_fulfillment", 1)).await.unwrap();

        let filter = WorkflowFilter {
            status: Some(WorkflowStatus::Completed),
            definition_key: None,
        };
        let results = store.list_workflows(&filter, 10).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "wf-1");
    }
}
