//! Saga Orchestrator: LIFO compensation on step failure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::workflow::step::StepError;

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error("saga step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: StepError },
}

/// How compensations are run once a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompensationMode {
    Sequential,
    /// Bounded-concurrency parallel compensation.
    Parallel { max_concurrency: usize },
}

impl Default for CompensationMode {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Per-step saga metadata.
#[derive(Debug, Clone)]
pub struct SagaStepOptions {
    pub compensation_timeout: Duration,
    pub retry_compensation: bool,
    /// If set, a failed compensation aborts remaining compensations rather
    /// than being collected and continued past.
    pub critical: bool,
}

impl Default for SagaStepOptions {
    fn default() -> Self {
        Self {
            compensation_timeout: Duration::from_secs(30),
            retry_compensation: false,
            critical: false,
        }
    }
}

/// A single step participating in a saga.
#[async_trait]
pub trait SagaStep: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, context: Value) -> Result<Value, StepError>;

    /// Undo this step's effects. Default no-op for steps with nothing to undo.
    async fn compensate(&self, _context: &Value) -> Result<(), StepError> {
        Ok(())
    }
}

/// Outcome of a single compensation attempt, surfaced so callers (and the
/// DLQ) can tell `compensation_timeout` apart from a normal step error.
#[derive(Debug, Clone)]
pub enum CompensationOutcome {
    Ok,
    Failed(StepError),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct CompensationResult {
    pub step_name: String,
    pub outcome: CompensationOutcome,
}

/// Result of [`run_saga`].
#[derive(Debug)]
pub enum SagaResult {
    Ok {
        executed: Vec<String>,
        context: Value,
    },
    Err {
        failed_step: String,
        reason: StepError,
        executed: Vec<String>,
        compensations: Vec<CompensationResult>,
    },
}

/// No-op callback for callers that don't need per-compensation notification.
pub fn ignore_compensation(_result: &CompensationResult) {}

/// Execute `steps` in order against `context`, compensating previously
/// executed steps in reverse on the first failure.
///
/// `on_compensated` is invoked once per compensation attempt, success or
/// failure, after it completes ("a callback is invoked after each
/// compensation").
pub async fn run_saga(
    steps: &[(Arc<dyn SagaStep>, SagaStepOptions)],
    mut context: Value,
    mode: CompensationMode,
    on_compensated: &(dyn Fn(&CompensationResult) + Send + Sync),
) -> SagaResult {
    let mut executed: Vec<Arc<dyn SagaStep>> = Vec::new();
    let mut executed_names = Vec::new();

    for (step, _opts) in steps {
        match step.execute(context.clone()).await {
            Ok(new_context) => {
                context = merge(context, new_context);
                executed.push(step.clone());
                executed_names.push(step.name().to_string());
            }
            Err(reason) => {
                let compensations = compensate_reverse(&executed, &context, steps, mode, on_compensated).await;
                return SagaResult::Err {
                    failed_step: step.name().to_string(),
                    reason,
                    executed: executed_names,
                    compensations,
                };
            }
        }
    }

    SagaResult::Ok {
        executed: executed_names,
        context,
    }
}

/// Merge a step's map-shaped result into the running context ( "on
/// success merge map-shaped results into the context").
fn merge(mut context: Value, update: Value) -> Value {
    if let (Some(ctx_obj), Value::Object(update_obj)) = (context.as_object_mut(), update) {
        for (k, v) in update_obj {
            ctx_obj.insert(k, v);
        }
        context
    } else {
        update
    }
}

async fn compensate_reverse(
    executed: &[Arc<dyn SagaStep>],
    context: &Value,
    all_steps: &[(Arc<dyn SagaStep>, SagaStepOptions)],
    mode: CompensationMode,
    on_compensated: &(dyn Fn(&CompensationResult) + Send + Sync),
) -> Vec<CompensationResult> {
    let opts_for = |name: &str| -> SagaStepOptions {
        all_steps
            .iter()
            .find(|(s, _)| s.name() == name)
            .map(|(_, o)| o.clone())
            .unwrap_or_default()
    };

    let reversed: Vec<Arc<dyn SagaStep>> = executed.iter().rev().cloned().collect();

    match mode {
        CompensationMode::Sequential => {
            let mut results = Vec::new();
            for step in reversed {
                let opts = opts_for(step.name());
                let result = compensate_one(&step, context, &opts, on_compensated).await;
                let critical_abort = opts.critical && !matches!(result.outcome, CompensationOutcome::Ok);
                results.push(result);
                if critical_abort {
                    break;
                }
            }
            results
        }
        CompensationMode::Parallel { max_concurrency } => {
            use futures::stream::{self, StreamExt};
            stream::iter(reversed.into_iter().map(|step| {
                let opts = opts_for(step.name());
                let context = context.clone();
                async move { compensate_one(&step, &context, &opts, on_compensated).await }
            }))
            .buffered(max_concurrency.max(1))
            .collect()
            .await
        }
    }
}

async fn compensate_one(
    step: &Arc<dyn SagaStep>,
    context: &Value,
    opts: &SagaStepOptions,
    on_compensated: &(dyn Fn(&CompensationResult) + Send + Sync),
) -> CompensationResult {
    let outcome = match tokio::time::timeout(opts.compensation_timeout, step.compensate(context)).await {
        Ok(Ok(())) => CompensationOutcome::Ok,
        Ok(Err(err)) => CompensationOutcome::Failed(err),
        Err(_) => CompensationOutcome::TimedOut,
    };
    let result = CompensationResult {
        step_name: step.name().to_string(),
        outcome,
    };
    on_compensated(&result);
    result
}
