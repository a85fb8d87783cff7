//! Step interface

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error returned by a step's `execute`/`validate`/`compensate`.
///
/// `tag` is what the retry engine's error classifier extracts to
/// decide whether the failure is transient or permanent. Genuine panics
/// inside a step are caught at the actor boundary and converted into a
/// `StepError` with tag `exception` (design note "Exceptions vs. result
/// types") rather than unwinding into the actor task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    pub tag: String,
    pub message: String,
    pub details: Option<Value>,
}

impl StepError {
    pub fn new(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Wrap a caught panic payload as the "exception inside step" error kind.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic in step execution".to_string()
        };
        Self::new("exception", message)
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.tag, self.message)
    }
}

impl std::error::Error for StepError {}

/// State threaded through a workflow's steps. Backed by a JSON object so
/// user-defined workflows can carry arbitrary serializable data (
/// `state_payload`).
pub type StepState = Value;

/// Keys the retry engine injects into state before calling a step, per the
/// step contract in: "Must read `state.idempotency_key` and forward it
/// to any external side-effecting call so that downstream services can
/// deduplicate."
pub mod state_keys {
    pub const IDEMPOTENCY_KEY: &str = "idempotency_key";
    pub const RETRY_ATTEMPT: &str = "retry_attempt";
    pub const MAX_ATTEMPTS: &str = "max_attempts";
}

/// Options passed to `compensate`
#[derive(Debug, Clone, Default)]
pub struct CompensationOptions {
    pub attempt: u32,
}

/// A single unit of work inside a workflow.
///
/// Implemented by callers. `compensate` defaults to a no-op so that
/// steps outside a saga don't need to implement it.
#[async_trait]
pub trait Step: Send + Sync {
    /// Stable name used as the idempotency key component and graph step
    /// reference. Must be unique within a workflow definition.
    fn name(&self) -> &str;

    /// Execute the step against the current state, returning the new state.
    ///
    /// Implementations that call an external side-effecting service
    /// **must** read `state[state_keys::IDEMPOTENCY_KEY]` and forward it to
    /// that call so the downstream service can deduplicate retries and
    /// crash-recovery re-executions under the same key. If the downstream
    /// service does not honor the key, at-least-once (not exactly-once) is
    /// the most this engine can guarantee on recovery — see the crash
    /// recovery note on [`crate::workflow::actor`].
    async fn execute(&self, state: StepState) -> Result<StepState, StepError>;

    /// Optional fast-fail precheck run before `execute`.
    async fn validate(&self, _state: &StepState) -> Result<(), StepError> {
        Ok(())
    }

    /// Undo this step's observable effects. Required only for saga steps;
    /// the default is a no-op success.
    async fn compensate(
        &self,
        _state: &StepState,
        _opts: &CompensationOptions,
    ) -> Result<(), StepError> {
        Ok(())
    }
}

/// Build the deterministic idempotency key for a step attempt.
pub fn idempotency_key(workflow_id: &str, step_name: &str, attempt: u32) -> String {
    format!("{workflow_id}:{step_name}:{attempt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_format() {
        assert_eq!(
            idempotency_key("wf-1", "charge_card", 2),
            "wf-1:charge_card:2"
        );
    }

    #[test]
    fn step_error_display() {
        let err = StepError::new("timeout", "upstream did not respond");
        assert_eq!(err.to_string(), "timeout: upstream did not respond");
    }

    #[test]
    fn from_panic_extracts_str_payload() {
        let result = std::panic::catch_unwind(|| -> ! { panic!("kaboom") });
        let payload = result.unwrap_err();
        let err = StepError::from_panic(&*payload);
        assert_eq!(err.tag, "exception");
        assert_eq!(err.message, "kaboom");
    }
}
