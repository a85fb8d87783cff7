//! The Workflow Actor: one supervised stateful unit per in-flight
//! workflow, driving its graph one step at a time.
//!
//! Runs as its own tokio task, talking to the rest of the engine only
//! through [`EngineContext`]'s shared handles and to the outside world only
//! through [`ActorMessage`] ( "tasks communicate by asynchronous messages
//! and never share mutable memory").

use std::sync::Arc;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::dlq::DlqEntryType;
use crate::engine::context::EngineContext;
use crate::graph::{Graph, GraphError, NextNodes, NodeKind};
use crate::idempotency::BeginOutcome;
use crate::reliability::retry::StepOutcome;
use crate::workflow::definition::{WorkflowDefinition, WorkflowError};
use crate::workflow::event::{EventFilter, EventRecord, EventType};
use crate::workflow::record::{WorkflowRecord, WorkflowStatus};
use crate::workflow::step::{idempotency_key, CompensationOptions, StepError};

/// Default timeout for a single compensation call.
const DEFAULT_COMPENSATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Message sent to a running actor.
pub enum ActorMessage {
    /// Drive the per-step loop forward one iteration. The actor
    /// self-enqueues this after init and after every completed step;
    /// external callers may also send it (e.g. an explicit "nudge").
    ExecuteNext,
    /// Snapshot the current workflow record.
    GetState(oneshot::Sender<WorkflowRecord>),
    /// Terminate the actor after its current write completes.
    Stop,
}

/// A handle to a spawned actor task, held by the supervisor/registry.
/// The registry holds handles, never actor state directly ( "cyclic
/// ownership").
pub struct ActorHandle {
    pub workflow_id: String,
    tx: mpsc::Sender<ActorMessage>,
    cancel: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl ActorHandle {
    pub async fn get_state(&self) -> Option<WorkflowRecord> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(ActorMessage::GetState(tx)).await.ok()?;
        rx.await.ok()
    }

    /// Terminate the actor cleanly: persisted state reflects the last
    /// committed step.
    pub async fn stop(&self) {
        let _ = self.tx.send(ActorMessage::Stop).await;
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn nudge(&self) {
        let _ = self.tx.send(ActorMessage::ExecuteNext).await;
    }

    /// Consume the handle and await its task's exit. Only meaningful once
    /// [`is_finished`](Self::is_finished) is true — used by the supervisor's
    /// restart policy to tell a clean exit (`Stop`/cancellation) apart from
    /// a panic.
    pub async fn take_exit_result(self) -> Result<(), tokio::task::JoinError> {
        self.join.await
    }
}

/// Spawn a brand-new workflow actor.
pub fn spawn_new(
    workflow_id: String,
    definition: Arc<dyn WorkflowDefinition>,
    params: Value,
    ctx: Arc<EngineContext>,
) -> ActorHandle {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let tx_self = tx.clone();
    let cancel_task = cancel.clone();
    let handle_id = workflow_id.clone();
    let join = tokio::spawn(async move {
        let actor = WorkflowActor::init_new(workflow_id, definition, params, ctx).await;
        actor.run(rx, tx_self, cancel_task).await;
    });
    ActorHandle {
        workflow_id: handle_id,
        tx,
        cancel,
        join,
    }
}

/// Spawn an actor that resumes a previously persisted workflow ( "Crash
/// recovery"): idempotency-tracked steps either return cached results or
/// are safely re-executed under the same key.
pub fn spawn_resume(definition: Arc<dyn WorkflowDefinition>, record: WorkflowRecord, ctx: Arc<EngineContext>) -> ActorHandle {
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let tx_self = tx.clone();
    let cancel_task = cancel.clone();
    let workflow_id = record.id.clone();
    let join = tokio::spawn(async move {
        let actor = WorkflowActor::resume(ctx, definition, record).await;
        actor.run(rx, tx_self, cancel_task).await;
    });
    ActorHandle {
        workflow_id,
        tx,
        cancel,
        join,
    }
}

/// One actor per in-flight workflow.
struct WorkflowActor {
    workflow_id: String,
    definition: Arc<dyn WorkflowDefinition>,
    ctx: Arc<EngineContext>,
    record: WorkflowRecord,
    /// Names of steps that have completed successfully this run, in
    /// execution order — the LIFO compensation list for saga definitions
    ///, reconstructed from `step_completed` events on resume.
    executed_steps: Vec<String>,
}

impl WorkflowActor {
    async fn init_new(
        workflow_id: String,
        definition: Arc<dyn WorkflowDefinition>,
        params: Value,
        ctx: Arc<EngineContext>,
    ) -> Self {
        let total_steps = definition
            .graph()
            .nodes()
            .filter(|n| matches!(n.kind, NodeKind::Step { .. }))
            .count();
        let initial_state = definition.initial_state(params);
        let mut record = WorkflowRecord::new(workflow_id.clone(), definition.key(), total_steps);
        record.state_payload = wrap_state(None, initial_state);

        let actor = Self {
            workflow_id,
            definition,
            ctx,
            record,
            executed_steps: Vec::new(),
        };
        actor
            .append_event(EventType::WorkflowStarted, json!({ "definition_key": actor.definition.key() }))
            .await;
        let _ = actor.ctx.store.save_workflow(&actor.record).await;
        actor.publish_summary();
        actor
    }

    /// Rebuild actor state from a persisted record plus its event trace
    ///.
    async fn resume(ctx: Arc<EngineContext>, definition: Arc<dyn WorkflowDefinition>, record: WorkflowRecord) -> Self {
        let filter = EventFilter {
            event_type: Some(EventType::StepCompleted),
        };
        let events = ctx.store.get_events(&record.id, &filter, 100_000).await;
        let mut executed_steps: Vec<String> = events
            .iter()
            .filter_map(|e| e.data.get("step").and_then(|v| v.as_str()).map(String::from))
            .collect();
        executed_steps.dedup();

        Self {
            workflow_id: record.id.clone(),
            definition,
            ctx,
            record,
            executed_steps,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ActorMessage>, self_tx: mpsc::Sender<ActorMessage>, cancel: CancellationToken) {
        let _ = self_tx.send(ActorMessage::ExecuteNext).await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                msg = rx.recv() => {
                    match msg {
                        None | Some(ActorMessage::Stop) => return,
                        Some(ActorMessage::GetState(reply)) => {
                            let _ = reply.send(self.record.clone());
                        }
                        Some(ActorMessage::ExecuteNext) => {
                            if self.record.is_terminal() {
                                continue;
                            }
                            self.step_once(&self_tx, &cancel).await;
                        }
                    }
                }
            }
        }
    }

    /// One iteration of the per-step loop.
    #[instrument(skip_all, fields(workflow_id = %self.workflow_id))]
    async fn step_once(&mut self, self_tx: &mpsc::Sender<ActorMessage>, cancel: &CancellationToken) {
        if self.record.status == WorkflowStatus::Pending {
            self.record.status = WorkflowStatus::Running;
        }

        let graph = self.definition.graph();
        let (current_node, data) = unwrap_state(&self.record.state_payload);

        let candidate = match &current_node {
            None => graph.start_node().to_string(),
            Some(id) => match graph.next(id, &data) {
                Ok(NextNodes::End) => {
                    self.finish_completed().await;
                    return;
                }
                Ok(NextNodes::Targets(targets)) => match targets.into_iter().next() {
                    Some(t) => t,
                    None => {
                        self.finish_completed().await;
                        return;
                    }
                },
                Err(err) => {
                    self.finish_failed_graph_error(err).await;
                    return;
                }
            },
        };

        let resolved = match advance_to_step(graph, candidate, &data) {
            Ok(Some(step_id)) => step_id,
            Ok(None) => {
                self.finish_completed().await;
                return;
            }
            Err(err) => {
                self.finish_failed_graph_error(err).await;
                return;
            }
        };

        let step_name = match &graph.node(&resolved).expect("advance_to_step returns a live node id").kind {
            NodeKind::Step { step_name } => step_name.clone(),
            _ => unreachable!("advance_to_step only returns step nodes"),
        };

        let Some(step) = self.definition.step(&step_name) else {
            self.finish_failed(
                WorkflowError::new(format!("no step registered for '{step_name}'")).with_code("missing_step"),
            )
            .await;
            return;
        };

        // step 3: the actor's own idempotency check is about
        // *prior-run* state only — attempt 1 of this step. The retry engine
        // performs its own per-attempt `begin` once it actually runs it.
        let key1 = idempotency_key(&self.workflow_id, &step_name, 1);
        match self.ctx.idempotency.begin(&key1).await {
            BeginOutcome::AlreadyCompleted { result } => {
                self.append_event(EventType::StepSkipped, json!({ "step": step_name })).await;
                self.record.state_payload = wrap_state(Some(resolved), result);
                self.record.current_step_index += 1;
                let _ = self.ctx.store.save_workflow(&self.record).await;
                self.publish_summary();
                self.requeue(self_tx).await;
                return;
            }
            BeginOutcome::AlreadyPending | BeginOutcome::Ok => {
                self.append_event(EventType::StepStarted, json!({ "step": step_name })).await;
            }
        }

        let policy = self.definition.retry_policy(&step_name);
        let started = Instant::now();
        let mut attempt_failures: Vec<(u32, StepError)> = Vec::new();
        let outcome = self
            .ctx
            .retry_engine
            .execute_step(step.as_ref(), data.clone(), &self.workflow_id, &policy, cancel, |attempt, err| {
                attempt_failures.push((attempt, err.clone()));
            })
            .await;

        // one `step_failed` event per failed attempt (transient retries and
        // the terminal attempt alike), per §7's "step_failed per attempt".
        for (attempt, err) in &attempt_failures {
            self.append_event(
                EventType::StepFailed,
                json!({ "step": step_name, "attempt": attempt, "error": err }),
            )
            .await;
        }

        match outcome {
            StepOutcome::Success(new_state) => {
                let folded = self.definition.handle_step_success(&step_name, new_state);
                self.executed_steps.push(step_name.clone());
                self.append_event(
                    EventType::StepCompleted,
                    json!({ "step": step_name, "duration_ms": started.elapsed().as_millis() }),
                )
                .await;
                self.record.state_payload = wrap_state(Some(resolved), folded);
                self.record.current_step_index += 1;
                let _ = self.ctx.store.save_workflow(&self.record).await;
                self.publish_summary();
                self.requeue(self_tx).await;
            }
            StepOutcome::CircuitOpen => {
                let err = StepError::new("circuit_open", format!("circuit open for step '{step_name}'"));
                self.fail_step(step_name, err, data).await;
            }
            StepOutcome::Failed(err) => {
                self.fail_step(step_name, err, data).await;
            }
        }
    }

    /// step 6-7: compensate prior steps (if this is a saga), then finalize
    /// the workflow as failed. The `step_failed` event for this step's
    /// terminal attempt was already appended by the per-attempt loop in
    /// [`Self::step_once`]; this only handles workflow-level finalization.
    async fn fail_step(&mut self, step_name: String, err: StepError, state: Value) {
        if self.definition.is_saga() {
            self.compensate_reverse(&state).await;
        }

        let folded = self.definition.handle_step_failure(&step_name, &err, state.clone());
        let wf_err = WorkflowError::from_step_error(&err);
        self.record.state_payload = wrap_state(self.current_node(), folded);
        self.record.mark_failed(wf_err.clone());
        let _ = self.ctx.store.save_workflow(&self.record).await;
        self.publish_summary();
        self.append_event(EventType::WorkflowFailed, json!({ "error": &wf_err })).await;

        self.ctx.dlq.enqueue(
            DlqEntryType::WorkflowFailed,
            self.workflow_id.clone(),
            self.definition.key().to_string(),
            Some(step_name),
            serde_json::to_value(&err).unwrap_or(Value::Null),
            state,
            Value::Null,
        );
    }

    /// Compensate every previously-executed step in reverse order (
    /// "Run"). Compensation failures are logged and routed to the DLQ
    /// rather than aborting the remaining compensations, unless a step is
    /// marked critical — doesn't expose per-step saga metadata on the
    /// plain [`Step`](crate::workflow::step::Step) trait, so the actor
    /// treats every compensation failure as non-critical and keeps going;
    /// callers who need critical-abort semantics compose with
    /// [`crate::saga::run_saga`] directly instead of the actor.
    async fn compensate_reverse(&mut self, state: &Value) {
        let opts = CompensationOptions::default();
        for name in self.executed_steps.clone().into_iter().rev() {
            let Some(step) = self.definition.step(&name) else { continue };
            let outcome = tokio::time::timeout(DEFAULT_COMPENSATION_TIMEOUT, step.compensate(state, &opts)).await;
            let comp_err = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(err)) => Some(err),
                Err(_) => Some(StepError::new("compensation_timeout", format!("compensating '{name}' timed out"))),
            };
            self.on_step_compensated(&name, comp_err, state).await;
        }
    }

    /// The post-compensation callback for the actor's own inline LIFO
    /// compensation (: "a callback is invoked after each compensation"):
    /// routes a failure to the DLQ, or just logs success.
    async fn on_step_compensated(&mut self, step_name: &str, comp_err: Option<StepError>, state: &Value) {
        match comp_err {
            Some(comp_err) => {
                warn!(step = %step_name, error = %comp_err, "compensation failed");
                self.ctx.dlq.enqueue(
                    DlqEntryType::CompensationFailed,
                    self.workflow_id.clone(),
                    self.definition.key().to_string(),
                    Some(step_name.to_string()),
                    serde_json::to_value(&comp_err).unwrap_or(Value::Null),
                    state.clone(),
                    Value::Null,
                );
            }
            None => {
                info!(step = %step_name, "compensation succeeded");
            }
        }
    }

    async fn finish_completed(&mut self) {
        self.record.mark_completed();
        let _ = self.ctx.store.save_workflow(&self.record).await;
        self.publish_summary();
        self.append_event(EventType::WorkflowCompleted, json!({})).await;
    }

    async fn finish_failed(&mut self, err: WorkflowError) {
        self.record.mark_failed(err.clone());
        let _ = self.ctx.store.save_workflow(&self.record).await;
        self.publish_summary();
        self.append_event(EventType::WorkflowFailed, json!({ "error": &err })).await;
    }

    /// A graph resolution failure, most notably `no_matching_branch`,
    /// aborts the workflow and routes it to the DLQ.
    async fn finish_failed_graph_error(&mut self, err: GraphError) {
        let code = match &err {
            GraphError::NoMatchingBranch { .. } => "no_matching_branch",
            _ => "graph_error",
        };
        let wf_err = WorkflowError::new(err.to_string()).with_code(code);
        self.record.mark_failed(wf_err.clone());
        let _ = self.ctx.store.save_workflow(&self.record).await;
        self.publish_summary();
        self.append_event(EventType::WorkflowFailed, json!({ "error": &wf_err })).await;
        self.ctx.dlq.enqueue(
            DlqEntryType::WorkflowFailed,
            self.workflow_id.clone(),
            self.definition.key().to_string(),
            None,
            serde_json::to_value(&wf_err).unwrap_or(Value::Null),
            Value::Null,
            Value::Null,
        );
    }

    async fn requeue(&self, self_tx: &mpsc::Sender<ActorMessage>) {
        if !self.record.is_terminal() {
            let _ = self_tx.send(ActorMessage::ExecuteNext).await;
        }
    }

    async fn append_event(&self, event_type: EventType, data: Value) {
        let event = EventRecord::new(&self.workflow_id, event_type, data);
        let _ = self.ctx.store.append_event(&event).await;
    }

    fn publish_summary(&self) {
        let summary = workflow_summary(&self.record);
        self.ctx.bus.publish("workflows", summary.clone());
        self.ctx.bus.publish(&format!("workflow:{}", self.workflow_id), summary);
    }

    fn current_node(&self) -> Option<String> {
        unwrap_state(&self.record.state_payload).0
    }
}

/// Follow a chain of join/branch nodes ( "join → advance transparently;
/// branch → re-enter resolution") until landing on a step node or the end.
fn advance_to_step(graph: &Graph, mut id: String, state: &Value) -> Result<Option<String>, GraphError> {
    loop {
        let node = graph.node(&id).ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
        match &node.kind {
            NodeKind::Step { .. } => return Ok(Some(id)),
            NodeKind::Join | NodeKind::Branch { .. } => match graph.next(&id, state)? {
                NextNodes::End => return Ok(None),
                NextNodes::Targets(targets) => {
                    id = targets.into_iter().next().ok_or_else(|| GraphError::NodeNotFound(id.clone()))?;
                }
            },
        }
    }
}

/// `state_payload` wraps the user-visible free-form map together with the
/// actor's current graph position, so a crashed actor can resume from the
/// persisted record alone. The `_node`/`data` split
/// is an engine-internal bookkeeping detail: every hook in (`execute`,
/// `initial_state`, `handle_step_success`, branch predicates, …) only ever
/// sees the inner `data` value.
fn wrap_state(node: Option<String>, data: Value) -> Value {
    json!({ "_node": node, "data": data })
}

fn unwrap_state(payload: &Value) -> (Option<String>, Value) {
    let node = payload.get("_node").and_then(|v| v.as_str()).map(String::from);
    let data = payload.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default()));
    (node, data)
}

/// The `workflows` / `workflow:{id}` broadcast shape ( "Event-bus wire
/// shape").
fn workflow_summary(record: &WorkflowRecord) -> Value {
    let (_, data) = unwrap_state(&record.state_payload);
    json!({
        "workflow_id": record.id,
        "definition_key": record.definition_key,
        "status": record.status,
        "current_step_index": record.current_step_index,
        "total_steps": record.total_steps,
        "state_payload": data,
        "started_at": record.started_at,
        "completed_at": record.completed_at,
        "error": record.error,
    })
}
