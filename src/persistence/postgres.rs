//! PostgreSQL [`DurableStore`]: the durable backend for multi-node
//! deployments, backed by a `sqlx::PgPool`.
//!
//! Every workflow record and its append-only event log live in two tables.
//! Statements are built with runtime `sqlx::query` rather than the
//! compile-time `query!` macros, since there is no `DATABASE_URL` available
//! at build time in every environment this crate ships into.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{error, instrument, warn};

use crate::workflow::definition::WorkflowError;
use crate::workflow::event::{EventFilter, EventRecord, EventType};
use crate::workflow::record::{WorkflowRecord, WorkflowStatus};

use super::store::{Backup, DurableStore, StoreError, WorkflowFilter, WorkflowStatusSnapshot};

/// PostgreSQL implementation of [`DurableStore`].
///
/// Uses a connection pool for efficient database access, sized for a
/// single process driving many concurrent workflow actors.
///
/// # Example
///
/// ```ignore
/// use durable_flow::persistence::PostgresDurableStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresDurableStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the two tables this store needs if they don't already exist.
    /// Idempotent; safe to call on every process start.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_workflows (
                id TEXT PRIMARY KEY,
                definition_key TEXT NOT NULL,
                status TEXT NOT NULL,
                state_payload JSONB NOT NULL,
                current_step_index BIGINT NOT NULL,
                total_steps BIGINT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                error JSONB,
                inserted_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS durable_workflows_status_idx ON durable_workflows (status)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS durable_workflow_events (
                event_id UUID PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                data JSONB NOT NULL,
                timestamp TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS durable_workflow_events_workflow_idx ON durable_workflow_events (workflow_id, timestamp)")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    #[instrument(skip(self, record))]
    async fn save_workflow(&self, record: &WorkflowRecord) -> Result<(), StoreError> {
        let status = record.status.to_string();
        let error_json = record
            .error
            .as_ref()
            .map(serde_json::to_value)
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO durable_workflows (
                id, definition_key, status, state_payload, current_step_index, total_steps,
                started_at, completed_at, error, inserted_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO UPDATE SET
                definition_key = EXCLUDED.definition_key,
                status = EXCLUDED.status,
                state_payload = EXCLUDED.state_payload,
                current_step_index = EXCLUDED.current_step_index,
                total_steps = EXCLUDED.total_steps,
                completed_at = EXCLUDED.completed_at,
                error = EXCLUDED.error,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&record.id)
        .bind(&record.definition_key)
        .bind(&status)
        .bind(&record.state_payload)
        .bind(record.current_step_index as i64)
        .bind(record.total_steps as i64)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&error_json)
        .bind(record.inserted_at)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("failed to save workflow: {}", e);
            StoreError::Backend(e.to_string())
        })?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow(&self, id: &str) -> Result<WorkflowRecord, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, definition_key, status, state_payload, current_step_index, total_steps,
                   started_at, completed_at, error, inserted_at, updated_at
            FROM durable_workflows WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
        .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;

        row_to_record(&row)
    }

    #[instrument(skip(self))]
    async fn get_workflow_status(&self, id: &str) -> Result<WorkflowStatusSnapshot, StoreError> {
        let row = sqlx::query("SELECT status, current_step_index FROM durable_workflows WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?
            .ok_or_else(|| StoreError::WorkflowNotFound(id.to_string()))?;

        let status_str: String = row.get("status");
        Ok(WorkflowStatusSnapshot {
            status: parse_status(&status_str)?,
            current_step_index: row.get::<i64, _>("current_step_index") as usize,
        })
    }

    #[instrument(skip(self, filter))]
    async fn list_workflows(&self, filter: &WorkflowFilter, limit: usize) -> Vec<WorkflowRecord> {
        let status_filter = filter.status.map(|s| s.to_string());

        let rows = sqlx::query(
            r#"
            SELECT id, definition_key, status, state_payload, current_step_index, total_steps,
                   started_at, completed_at, error, inserted_at, updated_at
            FROM durable_workflows
            WHERE ($1::text IS NULL OR status = $1)
              AND ($2::text IS NULL OR definition_key = $2)
            ORDER BY inserted_at DESC
            LIMIT $3
            "#,
        )
        .bind(&status_filter)
        .bind(&filter.definition_key)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows.iter().filter_map(|r| row_to_record(r).ok()).collect(),
            Err(e) => {
                error!("failed to list workflows: {}", e);
                Vec::new()
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_workflow(&self, id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.to_string()))?;

        let result = sqlx::query("DELETE FROM durable_workflows WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(id.to_string()));
        }

        sqlx::query("DELETE FROM durable_workflow_events WHERE workflow_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        tx.commit().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, event))]
    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_workflow_events (event_id, workflow_id, event_type, data, timestamp)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.workflow_id)
        .bind(event.event_type.to_string())
        .bind(&event.data)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to append event: {}", e);
            StoreError::Backend(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self, filter))]
    async fn get_events(&self, workflow_id: &str, filter: &EventFilter, limit: usize) -> Vec<EventRecord> {
        let type_filter = filter.event_type.map(|t| t.to_string());

        let rows = sqlx::query(
            r#"
            SELECT event_id, workflow_id, event_type, data, timestamp
            FROM durable_workflow_events
            WHERE workflow_id = $1
              AND ($2::text IS NULL OR event_type = $2)
            ORDER BY timestamp
            LIMIT $3
            "#,
        )
        .bind(workflow_id)
        .bind(&type_filter)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows.iter().filter_map(|r| row_to_event(r).ok()).collect(),
            Err(e) => {
                error!("failed to load events for '{}': {}", workflow_id, e);
                Vec::new()
            }
        }
    }

    #[instrument(skip(self))]
    async fn count_by_status(&self) -> HashMap<WorkflowStatus, usize> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM durable_workflows GROUP BY status")
            .fetch_all(&self.pool)
            .await;

        let mut counts = HashMap::new();
        let Ok(rows) = rows else {
            return counts;
        };
        for row in rows {
            let status_str: String = row.get("status");
            if let Ok(status) = parse_status(&status_str) {
                counts.insert(status, row.get::<i64, _>("n") as usize);
            }
        }
        counts
    }

    #[instrument(skip(self))]
    async fn backup(&self, node_id: &str) -> Backup {
        let filter = WorkflowFilter::default();
        let workflows = self.list_workflows(&filter, usize::MAX).await;

        let mut events = Vec::new();
        for record in &workflows {
            events.extend(self.get_events(&record.id, &EventFilter::default(), usize::MAX).await);
        }

        Backup {
            timestamp: Utc::now(),
            node_id: node_id.to_string(),
            workflows,
            events,
        }
    }

    #[instrument(skip(self))]
    async fn destroy_and_recreate(&self) -> Result<(), StoreError> {
        sqlx::query("TRUNCATE durable_workflow_events, durable_workflows")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self, backup))]
    async fn restore(&self, backup: Backup) -> Result<(), StoreError> {
        if let Err(err) = self.restore_inner(&backup).await {
            warn!("restore failed, writing emergency snapshot: {}", err);
            let path = write_emergency_snapshot(&backup)?;
            return Err(StoreError::RestoreFailed(path));
        }
        Ok(())
    }
}

impl PostgresDurableStore {
    async fn restore_inner(&self, backup: &Backup) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(|e| StoreError::Backend(e.to_string()))?;

        sqlx::query("TRUNCATE durable_workflow_events, durable_workflows")
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        for record in &backup.workflows {
            let status = record.status.to_string();
            let error_json = record
                .error
                .as_ref()
                .map(serde_json::to_value)
                .transpose()
                .map_err(|e| StoreError::Backend(e.to_string()))?;

            sqlx::query(
                r#"
                INSERT INTO durable_workflows (
                    id, definition_key, status, state_payload, current_step_index, total_steps,
                    started_at, completed_at, error, inserted_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                "#,
            )
            .bind(&record.id)
            .bind(&record.definition_key)
            .bind(&status)
            .bind(&record.state_payload)
            .bind(record.current_step_index as i64)
            .bind(record.total_steps as i64)
            .bind(record.started_at)
            .bind(record.completed_at)
            .bind(&error_json)
            .bind(record.inserted_at)
            .bind(record.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        for event in &backup.events {
            sqlx::query(
                r#"
                INSERT INTO durable_workflow_events (event_id, workflow_id, event_type, data, timestamp)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.event_id)
            .bind(&event.workflow_id)
            .bind(event.event_type.to_string())
            .bind(&event.data)
            .bind(event.timestamp)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;
        }

        tx.commit().await.map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(())
    }
}

/// Serialize a failed restore's backup payload to disk, named by Unix
/// timestamp, so the operator has a chance at manual recovery.
fn write_emergency_snapshot(backup: &Backup) -> Result<String, StoreError> {
    let path = format!("/tmp/durable_flow_restore_failure_{}.json", Utc::now().timestamp());
    let body = serde_json::to_vec_pretty(backup).map_err(|e| StoreError::Backend(e.to_string()))?;
    std::fs::write(&path, body).map_err(|e| StoreError::Backend(format!("emergency snapshot write failed: {e}")))?;
    Ok(path)
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<WorkflowRecord, StoreError> {
    let status_str: String = row.get("status");
    let error_json: Option<serde_json::Value> = row.get("error");

    Ok(WorkflowRecord {
        id: row.get("id"),
        definition_key: row.get("definition_key"),
        status: parse_status(&status_str)?,
        state_payload: row.get("state_payload"),
        current_step_index: row.get::<i64, _>("current_step_index") as usize,
        total_steps: row.get::<i64, _>("total_steps") as usize,
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        error: error_json
            .map(|v| serde_json::from_value::<WorkflowError>(v))
            .transpose()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        inserted_at: row.get("inserted_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_event(row: &sqlx::postgres::PgRow) -> Result<EventRecord, StoreError> {
    let type_str: String = row.get("event_type");
    Ok(EventRecord {
        event_id: row.get("event_id"),
        workflow_id: row.get("workflow_id"),
        event_type: parse_event_type(&type_str)?,
        data: row.get("data"),
        timestamp: row.get("timestamp"),
    })
}

fn parse_status(s: &str) -> Result<WorkflowStatus, StoreError> {
    match s {
        "pending" => Ok(WorkflowStatus::Pending),
        "running" => Ok(WorkflowStatus::Running),
        "completed" => Ok(WorkflowStatus::Completed),
        "failed" => Ok(WorkflowStatus::Failed),
        other => Err(StoreError::Backend(format!("unknown workflow status: {other}"))),
    }
}

fn parse_event_type(s: &str) -> Result<EventType, StoreError> {
    match s {
        "workflow_started" => Ok(EventType::WorkflowStarted),
        "step_started" => Ok(EventType::StepStarted),
        "step_completed" => Ok(EventType::StepCompleted),
        "step_failed" => Ok(EventType::StepFailed),
        "step_skipped" => Ok(EventType::StepSkipped),
        "workflow_completed" => Ok(EventType::WorkflowCompleted),
        "workflow_failed" => Ok(EventType::WorkflowFailed),
        other => Err(StoreError::Backend(format!("unknown event type: {other}"))),
    }
}

#[cfg(test)]
mod tests {
    // Integration tests require a live PostgreSQL instance; run with
    // `cargo test -- --ignored` against a DATABASE_URL-configured database.
}
