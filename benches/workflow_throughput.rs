//! Workflow throughput benchmark
//!
//! Exercises the engine the way a production caller would: start many
//! concurrent workflows through [`WorkflowSupervisor::start_workflow`] and
//! wait for each to reach a terminal status, rather than reaching into the
//! actor internals. Each workflow walks a purely sequential graph of steps
//! that stand in for external side effects.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tokio::runtime::Runtime;

use durable_flow::bench::{
    ActivityDuration, BenchmarkMetrics, BenchmarkReport, BenchmarkRunner, BenchmarkScenario, ReportConfig,
    ScenarioConfig,
};
use durable_flow::engine::{DefinitionRegistry, EngineContext, WorkflowSupervisor};
use durable_flow::persistence::InMemoryDurableStore;
use durable_flow::workflow::{LinearWorkflowDefinition, Step, StepError, StepState};

/// Stands in for an external side effect: sleeps for a duration drawn from
/// [`ActivityDuration`]'s weighted distribution so the benchmark's latency
/// profile resembles a real deployment instead of a busy loop.
struct SimulatedStep {
    name: String,
}

#[async_trait]
impl Step for SimulatedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
        tokio::time::sleep(ActivityDuration::Fast.random_duration()).await;
        Ok(state)
    }
}

fn build_supervisor(steps_per_workflow: usize) -> Arc<WorkflowSupervisor> {
    let steps: Vec<Arc<dyn Step>> = (0..steps_per_workflow)
        .map(|i| Arc::new(SimulatedStep { name: format!("step-{i}") }) as Arc<dyn Step>)
        .collect();

    let mut registry = DefinitionRegistry::new();
    registry
        .register(Arc::new(LinearWorkflowDefinition::new("bench_workflow", steps)))
        .expect("single registration at startup");

    let ctx = Arc::new(EngineContext::new(
        Arc::new(InMemoryDurableStore::new()),
        Arc::new(registry),
    ));
    WorkflowSupervisor::new(ctx)
}

/// Drives one workflow end to end per `execute_task` call: start it, then
/// poll `get_state` until it reaches `completed`/`failed`.
struct WorkflowScenario {
    supervisor: Arc<WorkflowSupervisor>,
    run_id: u64,
}

impl WorkflowScenario {
    fn new(supervisor: Arc<WorkflowSupervisor>, run_id: u64) -> Self {
        Self { supervisor, run_id }
    }
}

impl BenchmarkScenario for WorkflowScenario {
    async fn setup(&self) {}

    async fn execute_task(&self, task_id: u64) -> (Duration, Duration) {
        let workflow_id = format!("bench-wf-{}-{task_id}", self.run_id);

        let request_start = Instant::now();
        self.supervisor
            .start_workflow("bench_workflow", &workflow_id, json!({}))
            .await
            .expect("bench_workflow is registered");
        let schedule_to_start = request_start.elapsed();

        let exec_start = Instant::now();
        loop {
            if let Some(record) = self.supervisor.get_state(&workflow_id).await {
                if record.is_terminal() {
                    break;
                }
            }
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        (schedule_to_start, exec_start.elapsed())
    }

    async fn cleanup(&self) {}
}

/// Run a workflow throughput test.
async fn run_scenario(
    name: &str,
    run_id: u64,
    workflow_count: usize,
    steps_per_workflow: usize,
    workers: usize,
) -> Arc<BenchmarkMetrics> {
    println!("\n🚀 Running: {name}");
    println!("   Workflows: {workflow_count}, Steps/workflow: {steps_per_workflow}, Workers: {workers}");

    let supervisor = build_supervisor(steps_per_workflow);
    let scenario = Arc::new(WorkflowScenario::new(supervisor.clone(), run_id));

    let config = ScenarioConfig {
        name: name.to_string(),
        workers,
        total_tasks: workflow_count as u64,
        warmup: Duration::ZERO,
        max_duration: Duration::from_secs(120),
        sample_interval: Duration::from_millis(100),
        target_rate: None,
    };

    let runner = BenchmarkRunner::new(config);
    let metrics = runner.metrics();

    let pb = ProgressBar::new(workflow_count as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
            .unwrap()
            .progress_chars("=>-"),
    );
    let progress_metrics = metrics.clone();
    let progress_bar = pb.clone();
    let progress_task = tokio::spawn(async move {
        loop {
            progress_bar.set_position(progress_metrics.tasks_completed.total());
            if progress_bar.position() >= progress_bar.length().unwrap_or(u64::MAX) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    runner.run(scenario).await;
    progress_task.abort();
    pb.finish_and_clear();
    supervisor.shutdown();
    let e2e = metrics.end_to_end.summary();
    println!(
        "✅ {} workflows completed, throughput {:.1}/s, e2e P50={:.2}ms P99={:.2}ms",
        workflow_count,
        metrics.tasks_completed.throughput(),
        e2e.p50.as_secs_f64() * 1000.0,
        e2e.p99.as_secs_f64() * 1000.0
    );
    metrics
}

fn main() {
    let rt = Runtime::new().unwrap();

    println!("═══════════════════════════════════════════════════════════");
    println!("         Workflow Throughput Benchmark");
    println!("═══════════════════════════════════════════════════════════");
    println!("\nDrives WorkflowSupervisor::start_workflow end to end for many");
    println!("concurrent linear workflows, one actor task per workflow.");

    let small = rt.block_on(run_scenario("small_10wf_10steps", 1, 10, 10, 10));
    let medium = rt.block_on(run_scenario("medium_100wf_20steps", 2, 100, 20, 50));
    let target = rt.block_on(run_scenario("target_500wf_50steps", 3, 500, 50, 100));

    println!("\n═══════════════════════════════════════════════════════════");
    println!("                    Summary");
    println!("═══════════════════════════════════════════════════════════");
    println!(
        "\n{:<30} {:>12} {:>12} {:>12}",
        "Scenario", "WF/sec", "P50 e2e", "P99 e2e"
    );
    println!("{:-<30} {:->12} {:->12} {:->12}", "", "", "", "");

    for (label, m) in [
        ("small_10wf_10steps", &small),
        ("medium_100wf_20steps", &medium),
        ("target_500wf_50steps", &target),
    ] {
        let e2e = m.end_to_end.summary();
        println!(
            "{:<30} {:>10.1}/s {:>10.2}ms {:>10.2}ms",
            label,
            m.tasks_completed.throughput(),
            e2e.p50.as_secs_f64() * 1000.0,
            e2e.p99.as_secs_f64() * 1000.0
        );
    }

    println!("\n📊 Generating HTML report...");
    let report_config = ReportConfig {
        output_dir: "target/benchmark-reports".to_string(),
        title: "Workflow Throughput Benchmark".to_string(),
        include_raw_data: false,
    };
    let report = BenchmarkReport::new(report_config);
    match report.generate(&target) {
        Ok(path) => println!("   ✅ target_500wf_50steps: {path}"),
        Err(e) => println!("   ❌ target_500wf_50steps: {e}"),
    }

    println!("\n═══════════════════════════════════════════════════════════");
}
