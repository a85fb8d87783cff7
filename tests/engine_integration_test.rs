//! End-to-end tests driving the engine through its public API against
//! [`InMemoryDurableStore`], covering cross-module scenarios that no single
//! unit test exercises on its own: crash recovery across actor respawn,
//! saga compensation wired through a real [`EngineContext`] (DLQ included),
//! and a full backup/destroy/restore round trip.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use durable_flow::engine::{DefinitionRegistry, EngineContext, WorkflowSupervisor};
use durable_flow::graph::Graph;
use durable_flow::persistence::{DurableStore, InMemoryDurableStore, WorkflowFilter};
use durable_flow::workflow::actor;
use durable_flow::workflow::{
    CompensationOptions, LinearWorkflowDefinition, Step, StepError, StepState, WorkflowDefinition, WorkflowRecord,
    WorkflowStatus,
};

async fn wait_until<F>(timeout: Duration, mut poll: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if poll() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition was not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until_async<F, Fut>(timeout: Duration, mut poll: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if poll().await {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition was not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct CountingStep {
    name: &'static str,
    calls: Arc<AtomicU32>,
}

impl CountingStep {
    fn new(name: &'static str, calls: Arc<AtomicU32>) -> Self {
        Self { name, calls }
    }
}

#[async_trait]
impl Step for CountingStep {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(state)
    }
}

/// Resuming a workflow from its persisted record must not re-execute steps
/// that already completed before the actor was stopped.
///
/// Rather than racing a live actor's cancellation against an in-flight step
/// (cancellation only interrupts backoff sleeps, not a step's own `execute`,
/// per), this test crafts the "crashed mid-workflow" record directly:
/// it runs `step_a` to completion under its own single-step definition to
/// capture the exact `state_payload` shape the actor would have persisted,
/// then hands that record to `spawn_resume` under the real three-step
/// definition and confirms only `step_b`/`step_c` run.
#[tokio::test]
async fn resumed_workflow_does_not_rerun_completed_steps() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    let c_calls = Arc::new(AtomicU32::new(0));

    let checkpoint_def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflowDefinition::new(
        "step_a_checkpoint",
        vec![Arc::new(CountingStep::new("step_a", a_calls.clone()))],
    ));
    let full_def: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflowDefinition::new(
        "three_steps",
        vec![
            Arc::new(CountingStep::new("step_a", Arc::new(AtomicU32::new(0)))),
            Arc::new(CountingStep::new("step_b", b_calls.clone())),
            Arc::new(CountingStep::new("step_c", c_calls.clone())),
        ],
    ));

    let mut registry = DefinitionRegistry::new();
    registry.register(checkpoint_def.clone()).unwrap();
    registry.register(full_def.clone()).unwrap();
    let ctx = Arc::new(EngineContext::new(store.clone(), Arc::new(registry)));

    let checkpoint_handle = actor::spawn_new("wf-checkpoint".to_string(), checkpoint_def, json!({}), ctx.clone());
    wait_until_async(Duration::from_secs(2), || async {
        matches!(store.get_workflow("wf-checkpoint").await.map(|r| r.status), Ok(WorkflowStatus::Completed))
    })
    .await;
    checkpoint_handle.stop().await;
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);

    let checkpoint = store.get_workflow("wf-checkpoint").await.unwrap();
    let mut crashed = durable_flow::workflow::WorkflowRecord::new("wf-crash", "three_steps", 3);
    crashed.status = WorkflowStatus::Running;
    crashed.current_step_index = 1;
    crashed.state_payload = checkpoint.state_payload;
    store.save_workflow(&crashed).await.unwrap();

    let resumed = actor::spawn_resume(full_def, crashed, ctx.clone());
    wait_until_async(Duration::from_secs(2), || async {
        matches!(store.get_workflow("wf-crash").await.map(|r| r.status), Ok(WorkflowStatus::Completed))
    })
    .await;
    resumed.stop().await;

    let final_record = store.get_workflow("wf-crash").await.unwrap();
    assert_eq!(final_record.status, WorkflowStatus::Completed);
    assert_eq!(final_record.current_step_index, 3);
    assert_eq!(a_calls.load(Ordering::SeqCst), 1, "step_a must not re-run after resume");
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);
    assert_eq!(c_calls.load(Ordering::SeqCst), 1);
}

struct ReservationStep {
    compensated: Arc<AtomicU32>,
}

#[async_trait]
impl Step for ReservationStep {
    fn name(&self) -> &str {
        "reserve_inventory"
    }
    async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
        Ok(state)
    }
    async fn compensate(&self, _state: &StepState, _opts: &durable_flow::workflow::step::CompensationOptions) -> Result<(), StepError> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ChargeStep {
    compensated: Arc<AtomicU32>,
}

#[async_trait]
impl Step for ChargeStep {
    fn name(&self) -> &str {
        "charge_payment"
    }
    async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
        Ok(state)
    }
    async fn compensate(&self, _state: &StepState, _opts: &durable_flow::workflow::step::CompensationOptions) -> Result<(), StepError> {
        self.compensated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RejectedShipStep;

#[async_trait]
impl Step for RejectedShipStep {
    fn name(&self) -> &str {
        "ship_order"
    }
    async fn execute(&self, _state: StepState) -> Result<StepState, StepError> {
        Err(StepError::new("carrier_rejected", "carrier refused the package"))
    }
}

struct SagaDefinition {
    key: String,
    graph: Graph,
    steps: HashMap<String, Arc<dyn Step>>,
}

impl SagaDefinition {
    fn new(key: &str, steps: Vec<Arc<dyn Step>>) -> Self {
        let names: Vec<String> = steps.iter().map(|s| s.name().to_string()).collect();
        let graph = Graph::from_linear_steps(names.clone());
        let steps = names.into_iter().zip(steps).collect();
        Self {
            key: key.to_string(),
            graph,
            steps,
        }
    }
}

impl WorkflowDefinition for SagaDefinition {
    fn key(&self) -> &str {
        &self.key
    }
    fn graph(&self) -> &Graph {
        &self.graph
    }
    fn step(&self, name: &str) -> Option<Arc<dyn Step>> {
        self.steps.get(name).cloned()
    }
    fn is_saga(&self) -> bool {
        true
    }
}

/// A saga's third step fails permanently; the previous two must be
/// compensated in reverse order and the failure routed to the dead letter
/// queue.
#[tokio::test]
async fn saga_failure_compensates_in_reverse_and_reaches_dlq() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
    let compensated = Arc::new(AtomicU32::new(0));

    let steps: Vec<Arc<dyn Step>> = vec![
        Arc::new(ReservationStep { compensated: compensated.clone() }),
        Arc::new(ChargeStep { compensated: compensated.clone() }),
        Arc::new(RejectedShipStep),
    ];
    let definition: Arc<dyn WorkflowDefinition> = Arc::new(SagaDefinition::new("order_saga", steps));

    let mut registry = DefinitionRegistry::new();
    registry.register(definition.clone()).unwrap();
    let ctx = Arc::new(EngineContext::new(store.clone(), Arc::new(registry)));

    let handle = actor::spawn_new("wf-saga".to_string(), definition, json!({}), ctx.clone());
    wait_until(Duration::from_secs(2), || compensated.load(Ordering::SeqCst) >= 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let record = store.get_workflow("wf-saga").await.unwrap();
    assert_eq!(record.status, WorkflowStatus::Failed);
    assert_eq!(record.error.unwrap().code.as_deref(), Some("carrier_rejected"));
    assert_eq!(compensated.load(Ordering::SeqCst), 2, "both prior steps must compensate");

    let pending = ctx.dlq.list_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].workflow_id, "wf-saga");
    assert_eq!(pending[0].failed_step.as_deref(), Some("ship_order"));

    handle.stop().await;
}

struct OkStep(&'static str);

#[async_trait]
impl Step for OkStep {
    fn name(&self) -> &str {
        self.0
    }
    async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
        Ok(state)
    }
}

/// A full backup → destroy → restore round trip must reproduce every
/// workflow record and event exactly.
#[tokio::test]
async fn backup_destroy_and_restore_round_trips_workflows_and_events() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
    let definition: Arc<dyn WorkflowDefinition> = Arc::new(LinearWorkflowDefinition::new(
        "single_step",
        vec![Arc::new(OkStep("only"))],
    ));
    let mut registry = DefinitionRegistry::new();
    registry.register(definition.clone()).unwrap();
    let ctx = Arc::new(EngineContext::new(store.clone(), Arc::new(registry)));

    for id in ["wf-1", "wf-2", "wf-3"] {
        let handle = actor::spawn_new(id.to_string(), definition.clone(), json!({}), ctx.clone());
        wait_until_async(Duration::from_secs(2), || async {
            matches!(store.get_workflow(id).await.map(|r| r.status), Ok(WorkflowStatus::Completed))
        })
        .await;
        handle.stop().await;
    }

    let backup = store.backup("node-a").await;
    assert_eq!(backup.workflows.len(), 3);
    assert!(!backup.events.is_empty());

    store.destroy_and_recreate().await.unwrap();
    assert!(store.get_workflow("wf-1").await.is_err());
    let empty_filter = WorkflowFilter::default();
    assert!(store.list_workflows(&empty_filter, 100).await.is_empty());

    store.restore(backup.clone()).await.unwrap();
    for id in ["wf-1", "wf-2", "wf-3"] {
        let record = store.get_workflow(id).await.unwrap();
        assert_eq!(record.status, WorkflowStatus::Completed);
    }
    let restored = store.list_workflows(&empty_filter, 100).await;
    assert_eq!(restored.len(), 3);
}

/// A supervisor can register several workflow types and drive concurrently
/// running instances of each to completion independently.
#[tokio::test]
async fn supervisor_runs_multiple_concurrent_workflows_to_completion() {
    let store: Arc<dyn DurableStore> = Arc::new(InMemoryDurableStore::new());
    let mut registry = DefinitionRegistry::new();
    registry
        .register(Arc::new(LinearWorkflowDefinition::new(
            "kind_a",
            vec![Arc::new(OkStep("a1")), Arc::new(OkStep("a2"))],
        )))
        .unwrap();
    registry
        .register(Arc::new(LinearWorkflowDefinition::new("kind_b", vec![Arc::new(OkStep("b1"))])))
        .unwrap();

    let ctx = Arc::new(EngineContext::new(store.clone(), Arc::new(registry)));
    let supervisor = WorkflowSupervisor::new(ctx);

    for i in 0..5 {
        supervisor
            .start_workflow("kind_a", &format!("a-{i}"), json!({}))
            .await
            .unwrap();
        supervisor
            .start_workflow("kind_b", &format!("b-{i}"), json!({}))
            .await
            .unwrap();
    }

    wait_until_async(Duration::from_secs(2), || async {
        for i in 0..5 {
            let a_done = store
                .get_workflow(&format!("a-{i}"))
                .await
                .map(|r| r.is_terminal())
                .unwrap_or(false);
            let b_done = store
                .get_workflow(&format!("b-{i}"))
                .await
                .map(|r| r.is_terminal())
                .unwrap_or(false);
            if !a_done || !b_done {
                return false;
            }
        }
        true
    })
    .await;

    for i in 0..5 {
        let a = store.get_workflow(&format!("a-{i}")).await.unwrap();
        let b = store.get_workflow(&format!("b-{i}")).await.unwrap();
        assert_eq!(a.status, WorkflowStatus::Completed);
        assert_eq!(b.status, WorkflowStatus::Completed);
    }

    supervisor.shutdown();
}
