//! Workflow Supervisor & Registry: a dynamic supervisor that spawns
//! and restarts workflow actors, backed by a unique-key registry mapping
//! workflow id to the live actor handle.
//!
//! Grounded in the teacher's `InProcessRunner` (`active_workflows:
//! RwLock<HashMap<Uuid, JoinHandle<()>>>`, which cleans up its own map entry
//! once a spawned task finishes), generalized with a restart branch: an
//! actor's task only ever exits cleanly via `stop()`/cancellation, so any
//! other exit is abnormal and the workflow is resumed from its last
//! persisted record.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dlq::{RetryAction, Resolution};
use crate::engine::context::EngineContext;
use crate::engine::registry::RegistryError;
use crate::workflow::actor::{self, ActorHandle};
use crate::workflow::record::{WorkflowRecord, WorkflowStatus};
use crate::workflow::step::CompensationOptions;

/// How often the reconciliation loop scans for actors that exited
/// abnormally and need restarting.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// How often the DLQ scheduler drains due entries ("every 5 minutes").
const DLQ_SCHEDULER_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyStarted,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    UnknownDefinition(#[from] RegistryError),
    #[error("workflow not registered: {0}")]
    NotFound(String),
}

/// Dynamic supervisor over workflow actors.
pub struct WorkflowSupervisor {
    ctx: Arc<EngineContext>,
    actors: Arc<DashMap<String, ActorHandle>>,
    reconciler: StdMutex<Option<JoinHandle<()>>>,
    dlq_scheduler: StdMutex<Option<JoinHandle<()>>>,
}

impl WorkflowSupervisor {
    /// Build a supervisor and start its background reconciliation and DLQ
    /// scheduler loops.
    pub fn new(ctx: Arc<EngineContext>) -> Arc<Self> {
        let supervisor = Arc::new(Self {
            ctx,
            actors: Arc::new(DashMap::new()),
            reconciler: StdMutex::new(None),
            dlq_scheduler: StdMutex::new(None),
        });
        let task = tokio::spawn(reconcile_loop(supervisor.clone()));
        *supervisor.reconciler.lock().unwrap() = Some(task);
        let dlq_task = tokio::spawn(dlq_scheduler_loop(supervisor.clone()));
        *supervisor.dlq_scheduler.lock().unwrap() = Some(dlq_task);
        supervisor
    }

    /// Start a new workflow, or report that one with this id is already
    /// running (: "a duplicate id returns `already_started` with the
    /// existing handle" — lookups for that existing handle go through
    /// [`get_state`](Self::get_state)/[`nudge`](Self::nudge) by id rather
    /// than by handle value, since [`ActorHandle`] does not implement
    /// `Clone`).
    pub async fn start_workflow(
        &self,
        definition_key: &str,
        workflow_id: &str,
        params: Value,
    ) -> Result<StartOutcome, SupervisorError> {
        if self.actors.contains_key(workflow_id) {
            return Ok(StartOutcome::AlreadyStarted);
        }
        let definition = self.ctx.registry.get(definition_key)?;
        let handle = actor::spawn_new(workflow_id.to_string(), definition, params, self.ctx.clone());
        self.actors.insert(workflow_id.to_string(), handle);
        Ok(StartOutcome::Started)
    }

    /// Spawn an actor that resumes a workflow already persisted in the
    /// store, e.g. after a process restart.
    pub async fn resume_workflow(&self, record: WorkflowRecord) -> Result<StartOutcome, SupervisorError> {
        if self.actors.contains_key(&record.id) {
            return Ok(StartOutcome::AlreadyStarted);
        }
        let definition = self.ctx.registry.get(&record.definition_key)?;
        let workflow_id = record.id.clone();
        let handle = actor::spawn_resume(definition, record, self.ctx.clone());
        self.actors.insert(workflow_id, handle);
        Ok(StartOutcome::Started)
    }

    /// Terminate a running workflow gracefully; its registration is freed
    /// once the reconciliation loop observes the task has exited.
    pub async fn stop_workflow(&self, workflow_id: &str) -> Result<(), SupervisorError> {
        let handle = self
            .actors
            .get(workflow_id)
            .ok_or_else(|| SupervisorError::NotFound(workflow_id.to_string()))?;
        handle.stop().await;
        Ok(())
    }

    pub async fn get_state(&self, workflow_id: &str) -> Option<WorkflowRecord> {
        let handle = self.actors.get(workflow_id)?;
        handle.get_state().await
    }

    pub async fn nudge(&self, workflow_id: &str) -> Result<(), SupervisorError> {
        let handle = self
            .actors
            .get(workflow_id)
            .ok_or_else(|| SupervisorError::NotFound(workflow_id.to_string()))?;
        handle.nudge().await;
        Ok(())
    }

    pub fn is_running(&self, workflow_id: &str) -> bool {
        self.actors.contains_key(workflow_id)
    }

    pub fn active_count(&self) -> usize {
        self.actors.len()
    }

    /// Stop the background reconciliation and DLQ scheduler loops. Running
    /// actors are left as they are; callers that want a clean shutdown
    /// should `stop_workflow` each of them first.
    pub fn shutdown(&self) {
        if let Some(task) = self.reconciler.lock().unwrap().take() {
            task.abort();
        }
        if let Some(task) = self.dlq_scheduler.lock().unwrap().take() {
            task.abort();
        }
    }

    /// One DLQ scheduler tick: resolve in-flight restarted workflows, then
    /// drain entries whose retry time has elapsed and drive their retry
    /// action through the supervisor/saga orchestrator (S6).
    async fn run_dlq_cycle(&self) {
        self.poll_retrying_entries().await;

        for (id, action) in self.ctx.dlq.due_for_retry(Utc::now()) {
            if let Err(err) = self.ctx.dlq.mark_retried(id) {
                warn!(%id, error = %err, "failed to advance dlq retry bookkeeping");
                continue;
            }
            let Some(entry) = self.ctx.dlq.get(id) else { continue };
            if entry.status == crate::dlq::DlqStatus::Abandoned {
                warn!(%id, "dlq entry exhausted its retry cap, abandoning");
                continue;
            }

            match action {
                RetryAction::RerunCompensation { workflow_id, failed_step } => {
                    let outcome = self.rerun_compensation(&entry.definition_key, &entry.context, &failed_step, entry.retry_count).await;
                    match outcome {
                        Ok(()) => {
                            info!(%id, %workflow_id, %failed_step, "dlq compensation retry succeeded");
                            let _ = self.ctx.dlq.resolve(id, Resolution::AutoResolved);
                        }
                        Err(err) => {
                            warn!(%id, %workflow_id, %failed_step, error = %err, "dlq compensation retry failed, will retry later");
                        }
                    }
                }
                RetryAction::RestartWorkflow { new_workflow_id, definition_key, params } => {
                    match self.start_workflow(&definition_key, &new_workflow_id, params).await {
                        Ok(_) => {
                            info!(%id, %new_workflow_id, "dlq restarted workflow, awaiting outcome");
                            if let Err(err) = self.ctx.dlq.mark_retrying(id, new_workflow_id) {
                                warn!(%id, error = %err, "failed to mark dlq entry retrying");
                            }
                        }
                        Err(err) => {
                            warn!(%id, %new_workflow_id, error = %err, "failed to restart workflow from dlq");
                        }
                    }
                }
            }
        }
    }

    /// Check every `retrying` entry's spawned replacement workflow: resolve
    /// `auto_resolved` if it completed, or revert to `pending` (to be
    /// re-driven by the already-scheduled next `due_for_retry` pass) if it
    /// failed or vanished.
    async fn poll_retrying_entries(&self) {
        for entry in self.ctx.dlq.list_retrying() {
            let Some(retry_workflow_id) = entry.metadata.get("retry_workflow_id").and_then(|v| v.as_str()) else {
                continue;
            };
            let record = match self.ctx.store.get_workflow(retry_workflow_id).await {
                Ok(record) => record,
                Err(_) => continue,
            };
            if !record.is_terminal() {
                continue;
            }
            match record.status {
                WorkflowStatus::Completed => {
                    info!(id = %entry.entry_id, %retry_workflow_id, "dlq restart workflow completed");
                    let _ = self.ctx.dlq.resolve(entry.entry_id, Resolution::AutoResolved);
                }
                _ => {
                    warn!(id = %entry.entry_id, %retry_workflow_id, "dlq restart workflow failed, reverting to pending");
                    let _ = self.ctx.dlq.revert_to_pending(entry.entry_id);
                }
            }
        }
    }

    /// Re-invoke a failed saga step's `compensate` directly (no full actor
    /// needed — compensation is a single idempotent call, not a multi-step
    /// run).
    async fn rerun_compensation(
        &self,
        definition_key: &str,
        context: &Value,
        failed_step: &str,
        attempt: u32,
    ) -> Result<(), crate::workflow::step::StepError> {
        let definition = self.ctx.registry.get(definition_key).map_err(|err| {
            crate::workflow::step::StepError::new("unknown_definition", err.to_string())
        })?;
        let step = definition.step(failed_step).ok_or_else(|| {
            crate::workflow::step::StepError::new("unknown_step", format!("no such step: {failed_step}"))
        })?;
        step.compensate(context, &CompensationOptions { attempt }).await
    }

    /// Scan for actors whose task has exited and either drop their
    /// registration (clean exit) or respawn them from their last persisted
    /// record (abnormal exit) ( "restart-on-abnormal-exit, not on clean
    /// completion").
    async fn reconcile(&self) {
        let finished: Vec<String> = self
            .actors
            .iter()
            .filter(|entry| entry.value().is_finished())
            .map(|entry| entry.key().clone())
            .collect();

        for workflow_id in finished {
            let Some((_, handle)) = self.actors.remove(&workflow_id) else {
                continue;
            };
            match handle.take_exit_result().await {
                Ok(()) => {
                    info!(%workflow_id, "actor exited cleanly, registration freed");
                }
                Err(join_err) => {
                    warn!(%workflow_id, error = %join_err, "actor exited abnormally, attempting restart");
                    if let Err(err) = self.restart(&workflow_id).await {
                        warn!(%workflow_id, error = %err, "failed to restart actor");
                    }
                }
            }
        }
    }

    async fn restart(&self, workflow_id: &str) -> Result<(), SupervisorError> {
        let record = self
            .ctx
            .store
            .get_workflow(workflow_id)
            .await
            .map_err(|_| SupervisorError::NotFound(workflow_id.to_string()))?;
        if record.is_terminal() {
            return Ok(());
        }
        self.resume_workflow(record).await?;
        Ok(())
    }
}

async fn reconcile_loop(supervisor: Arc<WorkflowSupervisor>) {
    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    loop {
        ticker.tick().await;
        supervisor.reconcile().await;
    }
}

async fn dlq_scheduler_loop(supervisor: Arc<WorkflowSupervisor>) {
    let mut ticker = tokio::time::interval(DLQ_SCHEDULER_INTERVAL);
    loop {
        ticker.tick().await;
        supervisor.run_dlq_cycle().await;
    }
}
