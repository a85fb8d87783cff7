//! Idempotency Store
//!
//! Per-step exactly-once accounting keyed by `{workflow_id}:{step_name}:{attempt}`,
//! surviving actor crashes: `begin` is the only write that can race, and it
//! must be atomic.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum IdempotencyError {
    #[error("idempotency record not found for key {0}")]
    NotFound(String),
}

/// Lifecycle status of a single idempotency record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

/// A single exactly-once accounting record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub status: IdempotencyStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<Value>,
}

impl IdempotencyRecord {
    fn pending(key: String) -> Self {
        Self {
            key,
            status: IdempotencyStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            result: None,
            error: None,
        }
    }
}

/// Outcome of [`IdempotencyStore::begin`].
#[derive(Clone)]
pub enum BeginOutcome {
    /// Key was fresh; a pending record was inserted.
    Ok,
    /// Key was already pending — a crash-recovery re-execution under the
    /// same key, per step 3.
    AlreadyPending,
    /// Key already completed; caller should adopt `result` as-is without
    /// re-running the step.
    AlreadyCompleted { result: Value },
}

impl std::fmt::Debug for BeginOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "Ok"),
            Self::AlreadyPending => write!(f, "AlreadyPending"),
            Self::AlreadyCompleted { .. } => write!(f, "AlreadyCompleted"),
        }
    }
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically insert a `pending` record for `key` unless one exists.
    async fn begin(&self, key: &str) -> BeginOutcome;

    /// Transition `key` from `pending` to `completed`.
    async fn complete(&self, key: &str, result: Value) -> Result<(), IdempotencyError>;

    /// Transition `key` from `pending` to `failed`.
    async fn fail(&self, key: &str, error: Value) -> Result<(), IdempotencyError>;

    async fn status(&self, key: &str) -> Option<IdempotencyStatus>;

    /// All records currently `pending` (forensic / recovery use).
    async fn list_pending(&self) -> Vec<IdempotencyRecord>;

    /// Delete `completed` and `failed` records older than `cutoff`.
    /// `pending` records are always preserved.
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize;
}

/// In-process store backed by a concurrent hash map. `begin` relies on
/// `DashMap::entry` for atomic check-then-insert under a single shard lock.
#[derive(Default)]
pub struct InMemoryIdempotencyStore {
    records: DashMap<String, IdempotencyRecord>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn begin(&self, key: &str) -> BeginOutcome {
        use dashmap::mapref::entry::Entry;
        match self.records.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(IdempotencyRecord::pending(key.to_string()));
                BeginOutcome::Ok
            }
            Entry::Occupied(mut slot) => match slot.get().status {
                IdempotencyStatus::Pending => BeginOutcome::AlreadyPending,
                IdempotencyStatus::Completed => BeginOutcome::AlreadyCompleted {
                    result: slot.get().result.clone().unwrap_or(Value::Null),
                },
                IdempotencyStatus::Failed => {
                    // a failed record is not a valid starting point for
                    // `complete`/`fail` (pending -> completed|failed only):
                    // overwrite it with a fresh pending record rather than
                    // leaving the stale `failed` status in place.
                    slot.insert(IdempotencyRecord::pending(key.to_string()));
                    BeginOutcome::Ok
                }
            },
        }
    }

    async fn complete(&self, key: &str, result: Value) -> Result<(), IdempotencyError> {
        let mut rec = self
            .records
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::NotFound(key.to_string()))?;
        rec.status = IdempotencyStatus::Completed;
        rec.completed_at = Some(Utc::now());
        rec.result = Some(result);
        Ok(())
    }

    async fn fail(&self, key: &str, error: Value) -> Result<(), IdempotencyError> {
        let mut rec = self
            .records
            .get_mut(key)
            .ok_or_else(|| IdempotencyError::NotFound(key.to_string()))?;
        rec.status = IdempotencyStatus::Failed;
        rec.completed_at = Some(Utc::now());
        rec.error = Some(error);
        Ok(())
    }

    async fn status(&self, key: &str) -> Option<IdempotencyStatus> {
        self.records.get(key).map(|r| r.status)
    }

    async fn list_pending(&self) -> Vec<IdempotencyRecord> {
        self.records
            .iter()
            .filter(|r| r.status == IdempotencyStatus::Pending)
            .map(|r| r.clone())
            .collect()
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|r| r.status != IdempotencyStatus::Pending && r.started_at < cutoff)
            .map(|r| r.key.clone())
            .collect();
        let removed = stale.len();
        for key in stale {
            self.records.remove(&key);
        }
        removed
    }
}

/// Convenience constructor for actors: an `Arc`-wrapped shared store.
pub fn shared_memory_store() -> Arc<dyn IdempotencyStore> {
    Arc::new(InMemoryIdempotencyStore::new())
}
