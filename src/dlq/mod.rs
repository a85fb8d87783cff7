//! Dead Letter Queue: durable triage of unrecoverable failures.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::alerts::{Alert, AlertDispatcher, Severity};

#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dlq entry not found: {0}")]
    NotFound(Uuid),
    #[error("entry {0} has reached its retry cap")]
    RetryCapExceeded(Uuid),
}

/// Keys stripped from DLQ context regardless of case.
const SENSITIVE_KEYS: &[&str] = &["password", "card_number", "cvv", "pin", "secret"];
const TRUNCATE_AT: usize = 1_000;
const MAX_AUTO_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqEntryType {
    WorkflowFailed,
    CompensationFailed,
    CriticalFailure,
}

impl DlqEntryType {
    fn severity(self) -> Severity {
        match self {
            Self::CriticalFailure => Severity::Critical,
            Self::CompensationFailed => Severity::High,
            Self::WorkflowFailed => Severity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Retrying,
    Resolved,
    Abandoned,
}

/// How an entry was ultimately closed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    AutoResolved,
    ManualResolution,
    Abandoned,
    CompensatedExternally,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub entry_id: Uuid,
    #[serde(rename = "type")]
    pub entry_type: DlqEntryType,
    pub status: DlqStatus,
    pub workflow_id: String,
    pub definition_key: String,
    pub failed_step: Option<String>,
    pub error: Value,
    pub context: Value,
    pub original_params: Value,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub resolution: Option<Resolution>,
}

/// Strip sensitive keys and truncate long strings from a context blob
/// before it is persisted to the DLQ.
pub fn sanitize_context(context: &Value) -> Value {
    match context {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                if SENSITIVE_KEYS.iter().any(|s| s.eq_ignore_ascii_case(k)) {
                    continue;
                }
                out.insert(k.clone(), sanitize_context(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize_context).collect()),
        Value::String(s) if s.len() > TRUNCATE_AT => {
            Value::String(format!("{}...<truncated {} chars>", &s[..TRUNCATE_AT], s.len() - TRUNCATE_AT))
        }
        other => other.clone(),
    }
}

/// `delay = min(5 * 3^retry_count, 720)` minutes from now.
fn next_retry_delay(retry_count: u32) -> ChronoDuration {
    let minutes = 5u64.saturating_mul(3u64.saturating_pow(retry_count)).min(720);
    ChronoDuration::minutes(minutes as i64)
}

/// What a retry handler should do for one entry, returned from
/// [`DeadLetterQueue::due_for_retry`] so the caller (which owns the
/// workflow supervisor / saga orchestrator) can carry out the actual
/// retry action without the DLQ depending on those components directly.
#[derive(Debug, Clone)]
pub enum RetryAction {
    /// `compensation_failed`: re-invoke the failed step's `compensate`.
    RerunCompensation { workflow_id: String, failed_step: String },
    /// `workflow_failed`: start a fresh workflow under a derived id.
    RestartWorkflow {
        new_workflow_id: String,
        definition_key: String,
        params: Value,
    },
}

pub struct DeadLetterQueue {
    entries: RwLock<HashMap<Uuid, DlqEntry>>,
    alerts: Arc<AlertDispatcher>,
}

impl DeadLetterQueue {
    pub fn new(alerts: Arc<AlertDispatcher>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            alerts,
        }
    }

    /// Enqueue a new entry, sanitizing its context and scheduling its first
    /// retry.
    pub fn enqueue(
        &self,
        entry_type: DlqEntryType,
        workflow_id: impl Into<String>,
        definition_key: impl Into<String>,
        failed_step: Option<String>,
        error: Value,
        context: Value,
        original_params: Value,
    ) -> Uuid {
        let entry_id = Uuid::now_v7();
        let now = Utc::now();
        let entry = DlqEntry {
            entry_id,
            entry_type,
            status: DlqStatus::Pending,
            workflow_id: workflow_id.into(),
            definition_key: definition_key.into(),
            failed_step,
            error,
            context: sanitize_context(&context),
            original_params,
            metadata: Value::Object(Default::default()),
            created_at: now,
            updated_at: now,
            retry_count: 0,
            next_retry_at: if entry_type == DlqEntryType::CriticalFailure {
                None
            } else {
                Some(now + next_retry_delay(0))
            },
            resolution: None,
        };
        self.entries.write().insert(entry_id, entry.clone());

        self.alerts.send_alert(Alert {
            severity: entry_type.severity(),
            alert_type: format!("{:?}", entry_type),
            title: format!("workflow {} routed to DLQ", entry.workflow_id),
            message: format!("entry {entry_id} created as {:?}", entry_type),
            metadata: serde_json::json!({ "entry_id": entry_id, "workflow_id": entry.workflow_id }),
            bypass_rate_limit: false,
        });

        entry_id
    }

    pub fn get(&self, id: Uuid) -> Option<DlqEntry> {
        self.entries.read().get(&id).cloned()
    }

    pub fn list_pending(&self) -> Vec<DlqEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == DlqStatus::Pending || e.status == DlqStatus::Retrying)
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> HashMap<String, usize> {
        let entries = self.entries.read();
        let mut stats = HashMap::new();
        for entry in entries.values() {
            *stats.entry(format!("{:?}", entry.status)).or_insert(0) += 1;
        }
        stats
    }

    /// Entries whose `next_retry_at` has elapsed, as of `now`, paired with
    /// the concrete action the caller should take.
    /// `critical_failure` entries are never returned — they are never
    /// auto-retried.
    pub fn due_for_retry(&self, now: DateTime<Utc>) -> Vec<(Uuid, RetryAction)> {
        let entries = self.entries.read();
        entries
            .values()
            .filter(|e| e.status == DlqStatus::Pending)
            .filter(|e| e.entry_type != DlqEntryType::CriticalFailure)
            .filter(|e| e.retry_count < MAX_AUTO_RETRIES)
            .filter_map(|e| {
                let due = e.next_retry_at.map(|t| t <= now).unwrap_or(false);
                if !due {
                    return None;
                }
                let action = match e.entry_type {
                    DlqEntryType::CompensationFailed => RetryAction::RerunCompensation {
                        workflow_id: e.workflow_id.clone(),
                        failed_step: e.failed_step.clone().unwrap_or_default(),
                    },
                    DlqEntryType::WorkflowFailed => RetryAction::RestartWorkflow {
                        new_workflow_id: format!("{}_retry_{}", e.workflow_id, e.retry_count + 1),
                        definition_key: e.definition_key.clone(),
                        params: if e.original_params.is_null() {
                            Value::String(e.context.to_string())
                        } else {
                            e.original_params.clone()
                        },
                    },
                    DlqEntryType::CriticalFailure => unreachable!("filtered above"),
                };
                Some((e.entry_id, action))
            })
            .collect()
    }

    /// Mark an entry as having just been retried: bump `retry_count`,
    /// compute the next retry time, and flip to `retrying` momentarily then
    /// back to `pending` unless the caller resolves it.
    pub fn mark_retried(&self, id: Uuid) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.retry_count += 1;
        entry.next_retry_at = Some(Utc::now() + next_retry_delay(entry.retry_count));
        entry.updated_at = Utc::now();
        if entry.retry_count >= MAX_AUTO_RETRIES {
            entry.status = DlqStatus::Abandoned;
            entry.resolution = Some(Resolution::Abandoned);
        }
        Ok(())
    }

    pub fn resolve(&self, id: Uuid, resolution: Resolution) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.status = match resolution {
            Resolution::Abandoned => DlqStatus::Abandoned,
            _ => DlqStatus::Resolved,
        };
        entry.resolution = Some(resolution);
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Force a retry regardless of the automatic cap.
    pub fn force_retry(&self, id: Uuid) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.status = DlqStatus::Pending;
        entry.next_retry_at = Some(Utc::now());
        Ok(())
    }

    /// Flip an entry to `retrying` while its `restart_workflow` action is
    /// in flight, stashing the spawned workflow's id in `metadata` so a
    /// later scheduler tick can look up whether it finished.
    pub fn mark_retrying(&self, id: Uuid, retry_workflow_id: impl Into<String>) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.status = DlqStatus::Retrying;
        entry.metadata = serde_json::json!({ "retry_workflow_id": retry_workflow_id.into() });
        entry.updated_at = Utc::now();
        Ok(())
    }

    /// Entries currently waiting on an in-flight restarted workflow.
    pub fn list_retrying(&self) -> Vec<DlqEntry> {
        self.entries
            .read()
            .values()
            .filter(|e| e.status == DlqStatus::Retrying)
            .cloned()
            .collect()
    }

    /// The in-flight retry did not resolve the failure; put the entry back
    /// in `pending` so it is picked up again once `next_retry_at` elapses
    /// (already advanced by the [`mark_retried`](Self::mark_retried) call
    /// that preceded the retry attempt).
    pub fn revert_to_pending(&self, id: Uuid) -> Result<(), DlqError> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(&id).ok_or(DlqError::NotFound(id))?;
        entry.status = DlqStatus::Pending;
        entry.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertDispatcher;
    use serde_json::json;

    fn dispatcher() -> Arc<AlertDispatcher> {
        Arc::new(AlertDispatcher::new(Default::default()))
    }

    #[test]
    fn sanitize_strips_sensitive_keys_and_truncates_long_strings() {
        let context = json!({
            "password": "hunter2",
            "order_id": "abc",
            "notes": "x".repeat(1200),
        });
        let sanitized = sanitize_context(&context);
        assert!(sanitized.get("password").is_none());
        assert_eq!(sanitized["order_id"], "abc");
        assert!(sanitized["notes"].as_str().unwrap().contains("truncated"));
    }

    #[test]
    fn enqueue_schedules_retry_five_minutes_out() {
        let dlq = DeadLetterQueue::new(dispatcher());
        let id = dlq.enqueue(
            DlqEntryType::WorkflowFailed,
            Uuid::now_v7().to_string(),
            "order_fulfillment",
            None,
            json!({"tag": "timeout"}),
            json!({}),
            json!({"order_id": "abc"}),
        );
        let entry = dlq.get(id).unwrap();
        let delta = entry.next_retry_at.unwrap() - entry.created_at;
        assert_eq!(delta, ChronoDuration::minutes(5));
    }

    #[test]
    fn critical_failures_are_never_scheduled_for_retry() {
        let dlq = DeadLetterQueue::new(dispatcher());
        let id = dlq.enqueue(
            DlqEntryType::CriticalFailure,
            Uuid::now_v7().to_string(),
            "k",
            None,
            json!({}),
            json!({}),
            json!({}),
        );
        let entry = dlq.get(id).unwrap();
        assert!(entry.next_retry_at.is_none());
        assert!(dlq.due_for_retry(Utc::now() + ChronoDuration::days(1)).is_empty());
    }

    #[test]
    fn due_for_retry_fires_after_scheduled_time_elapses() {
        let dlq = DeadLetterQueue::new(dispatcher());
        let workflow_id = Uuid::now_v7().to_string();
        let id = dlq.enqueue(
            DlqEntryType::WorkflowFailed,
            workflow_id,
            "order_fulfillment",
            None,
            json!({"tag": "timeout"}),
            json!({}),
            json!({"order_id": "abc"}),
        );
        assert!(dlq.due_for_retry(Utc::now()).is_empty());
        let later = Utc::now() + ChronoDuration::minutes(6);
        let due = dlq.due_for_retry(later);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, id);
        dlq.resolve(id, Resolution::AutoResolved).unwrap();
        assert_eq!(dlq.get(id).unwrap().status, DlqStatus::Resolved);
    }

    #[test]
    fn mark_retrying_and_revert_round_trip() {
        let dlq = DeadLetterQueue::new(dispatcher());
        let id = dlq.enqueue(
            DlqEntryType::WorkflowFailed,
            Uuid::now_v7().to_string(),
            "order_fulfillment",
            None,
            json!({"tag": "timeout"}),
            json!({}),
            json!({}),
        );
        dlq.mark_retrying(id, "wf-1_retry_1").unwrap();
        let retrying = dlq.list_retrying();
        assert_eq!(retrying.len(), 1);
        assert_eq!(retrying[0].metadata["retry_workflow_id"], "wf-1_retry_1");

        dlq.revert_to_pending(id).unwrap();
        assert_eq!(dlq.get(id).unwrap().status, DlqStatus::Pending);
        assert!(dlq.list_retrying().is_empty());
    }

    #[test]
    fn retry_count_growth_follows_capped_exponential_schedule() {
        assert_eq!(next_retry_delay(0), ChronoDuration::minutes(5));
        assert_eq!(next_retry_delay(1), ChronoDuration::minutes(15));
        assert_eq!(next_retry_delay(2), ChronoDuration::minutes(45));
        assert_eq!(next_retry_delay(10), ChronoDuration::minutes(720));
    }
}
