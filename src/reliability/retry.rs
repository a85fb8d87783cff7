//! Retry policy implementation, plus the Retry Engine

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::idempotency::{BeginOutcome, IdempotencyStore};
use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
use crate::workflow::step::{idempotency_key, state_keys, Step, StepError};

/// Configuration for activity retries
///
/// Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use durable_flow::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(5)
///     .with_initial_interval(Duration::from_secs(1))
///     .with_max_interval(Duration::from_secs(60));
///
/// // First retry after ~1 second
/// // Second retry after ~2 seconds
/// // Third retry after ~4 seconds
/// // etc.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0) to add randomness
    ///
    /// A value of 0.1 means ±10% randomness.
    pub jitter: f64,

    /// Error types that should NOT be retried
    #[serde(default)]
    pub non_retryable_errors: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Create an exponential backoff retry policy with sensible defaults
    ///
    /// - 5 max attempts
    /// - 1 second initial interval
    /// - 60 second max interval
    /// - 2x backoff coefficient
    /// - 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            backoff_coefficient: 2.0,
            jitter: 0.1,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            non_retryable_errors: vec![],
        }
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Set the initial retry interval
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    /// Set the maximum retry interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set the backoff coefficient
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Add a non-retryable error type
    pub fn with_non_retryable_error(mut self, error_type: impl Into<String>) -> Self {
        self.non_retryable_errors.push(error_type.into());
        self
    }

    /// Calculate delay for a given attempt number (1-based)
    ///
    /// Returns the duration to wait before the retry.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1; // First retry is after attempt 1
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        // Apply jitter
        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Check if an error type should be retried
    pub fn should_retry(&self, error_type: Option<&str>) -> bool {
        if let Some(error_type) = error_type {
            !self.non_retryable_errors.contains(&error_type.to_string())
        } else {
            true
        }
    }

    /// Check if there are remaining attempts
    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Which error tags a [`StepRetryPolicy`] will retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retryable {
    All,
    Transient,
    Tags(HashSet<String>),
}

/// Tags that are never retried even if a policy's `Retryable::Tags` lists
/// them explicitly.
pub const PERMANENT_TAGS: &[&str] = &[
    "validation",
    "invalid_input",
    "unauthorized",
    "forbidden",
    "not_found",
    "business_rule",
    "missing_dni",
    "duplicate",
];

/// Tags covering network/service/db transients.
pub const TRANSIENT_TAGS: &[&str] = &[
    "timeout",
    "connection_error",
    "connection_reset",
    "service_unavailable",
    "rate_limited",
    "database_unavailable",
    "circuit_open",
    "exception",
];

fn is_permanent(tag: &str) -> bool {
    PERMANENT_TAGS.contains(&tag)
}

fn is_transient(tag: &str) -> bool {
    TRANSIENT_TAGS.contains(&tag)
}

/// A step-execution retry policy as described in, distinct from
/// [`RetryPolicy`] (which this engine's backoff math is built on).
#[derive(Debug, Clone)]
pub struct StepRetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub retryable: Retryable,
    pub circuit_breaker: Option<String>,
}

impl StepRetryPolicy {
    fn backoff(&self) -> RetryPolicy {
        let mut p = RetryPolicy::exponential()
            .with_max_attempts(self.max_attempts)
            .with_initial_interval(Duration::from_millis(self.base_delay_ms))
            .with_max_interval(Duration::from_millis(self.max_delay_ms));
        p.jitter = if self.jitter { 0.1 } else { 0.0 };
        p
    }

    /// Delay for attempt `n` (1-based): `min(base * 2^(n-1), max)`, jittered
    /// by up to ±10%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff().delay_for_attempt(attempt + 1)
    }

    /// Whether a failure tagged `tag` should be retried under this policy.
    /// Permanent tags are never retryable regardless of configuration.
    pub fn should_retry(&self, tag: &str) -> bool {
        if is_permanent(tag) {
            return false;
        }
        match &self.retryable {
            Retryable::All => true,
            Retryable::Transient => is_transient(tag),
            Retryable::Tags(tags) => tags.contains(tag),
        }
    }

    fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: None,
        }
    }

    fn conservative() -> Self {
        Self {
            max_attempts: 2,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: None,
        }
    }

    fn patient() -> Self {
        Self {
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: None,
        }
    }

    fn email() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 30_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: Some("email_service".to_string()),
        }
    }

    fn api() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 300,
            max_delay_ms: 15_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: Some("external_api".to_string()),
        }
    }

    fn database() -> Self {
        Self {
            max_attempts: 6,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: Some("database".to_string()),
        }
    }

    fn payment() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 20_000,
            jitter: true,
            retryable: Retryable::Transient,
            circuit_breaker: Some("payment_gateway".to_string()),
        }
    }

    fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
            jitter: false,
            retryable: Retryable::Transient,
            circuit_breaker: None,
        }
    }

    /// Resolve one of the named policies in, or `None` for an unknown name.
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "aggressive" => Some(Self::aggressive()),
            "conservative" => Some(Self::conservative()),
            "patient" => Some(Self::patient()),
            "email" => Some(Self::email()),
            "api" => Some(Self::api()),
            "database" => Some(Self::database()),
            "payment" => Some(Self::payment()),
            "none" => Some(Self::none()),
            _ => None,
        }
    }
}

/// Outcome of [`RetryEngine::execute_step`].
#[derive(Debug)]
pub enum StepOutcome {
    Success(Value),
    CircuitOpen,
    Failed(StepError),
}

/// Drives one step through idempotency accounting, circuit-breaker gating,
/// and backoff, per the 7-step algorithm in
pub struct RetryEngine {
    idempotency: Arc<dyn IdempotencyStore>,
    breakers: Arc<CircuitBreakerRegistry>,
}

impl RetryEngine {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>, breakers: Arc<CircuitBreakerRegistry>) -> Self {
        Self { idempotency, breakers }
    }

    /// Execute `step` against `state` under `policy`, retrying on transient
    /// failure until attempts are exhausted or `cancel` fires.
    ///
    /// `on_attempt_failed` is invoked once per failed attempt (transient or
    /// terminal, including a circuit-open rejection), after the
    /// idempotency `fail` transition for that attempt, so the caller can
    /// append a `step_failed` event per attempt per §7's transient-failure
    /// row ("step_failed per attempt") rather than only at the end.
    pub async fn execute_step(
        &self,
        step: &dyn Step,
        mut state: Value,
        workflow_id: &str,
        policy: &StepRetryPolicy,
        cancel: &CancellationToken,
        mut on_attempt_failed: impl FnMut(u32, &StepError),
    ) -> StepOutcome {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let key = idempotency_key(workflow_id, step.name(), attempt);

            match self.idempotency.begin(&key).await {
                BeginOutcome::AlreadyCompleted { result } => return StepOutcome::Success(result),
                BeginOutcome::AlreadyPending | BeginOutcome::Ok => {}
            }

            if let Some(name) = &policy.circuit_breaker {
                let breaker = self.breakers.get_or_create(name);
                {
                    if !breaker.allow() {
                        let _ = self
                            .idempotency
                            .fail(&key, serde_json::json!({"tag": "circuit_open"}))
                            .await;
                        let err = StepError::new("circuit_open", format!("circuit '{name}' is open"));
                        on_attempt_failed(attempt, &err);
                        return StepOutcome::CircuitOpen;
                    }
                }
            }

            if let Some(obj) = state.as_object_mut() {
                obj.insert(state_keys::IDEMPOTENCY_KEY.into(), Value::String(key.clone()));
                obj.insert(state_keys::RETRY_ATTEMPT.into(), Value::from(attempt));
                obj.insert(state_keys::MAX_ATTEMPTS.into(), Value::from(policy.max_attempts));
            }

            let result = futures::FutureExt::catch_unwind(std::panic::AssertUnwindSafe(step.execute(state.clone())))
                .await;

            let outcome = match result {
                Ok(Ok(new_state)) => Ok(new_state),
                Ok(Err(step_err)) => Err(step_err),
                Err(panic) => Err(StepError::from_panic(&*panic)),
            };

            match outcome {
                Ok(new_state) => {
                    let _ = self.idempotency.complete(&key, new_state.clone()).await;
                    if let Some(name) = &policy.circuit_breaker {
                        self.breakers.get_or_create(name).report_success();
                    }
                    return StepOutcome::Success(new_state);
                }
                Err(step_err) => {
                    let _ = self
                        .idempotency
                        .fail(&key, serde_json::to_value(&step_err).unwrap_or(Value::Null))
                        .await;
                    if let Some(name) = &policy.circuit_breaker {
                        self.breakers.get_or_create(name).report_failure();
                    }
                    on_attempt_failed(attempt, &step_err);

                    if attempt >= policy.max_attempts || !policy.should_retry(&step_err.tag) {
                        return StepOutcome::Failed(step_err);
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => return StepOutcome::Failed(step_err),
                    }
                    state = new_state_after_failure(state);
                }
            }
        }
    }
}

/// Strip the previous attempt's injected keys before retrying so the next
/// attempt's own `begin` writes a clean set.
fn new_state_after_failure(mut state: Value) -> Value {
    if let Some(obj) = state.as_object_mut() {
        obj.remove(state_keys::IDEMPOTENCY_KEY);
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_defaults() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.backoff_coefficient, 2.0);
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::no_retry();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn test_fixed_interval() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);

        // All delays should be roughly 5 seconds (no jitter)
        let delay1 = policy.delay_for_attempt(2);
        let delay2 = policy.delay_for_attempt(3);

        assert_eq!(delay1, Duration::from_secs(5));
        assert_eq!(delay2, Duration::from_secs(5));
    }

    #[test]
    fn test_delay_for_attempt() {
        let policy = RetryPolicy::exponential()
            .with_jitter(0.0); // Disable jitter for predictable tests

        // Attempt 1 (initial) has no delay
        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);

        // Attempt 2 (first retry) = 1 second
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));

        // Attempt 3 (second retry) = 2 seconds
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));

        // Attempt 4 (third retry) = 4 seconds
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn test_max_interval_cap() {
        let policy = RetryPolicy::exponential()
            .with_max_interval(Duration::from_secs(5))
            .with_jitter(0.0);

        // Should be capped at 5 seconds
        let delay = policy.delay_for_attempt(10);
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn test_non_retryable_errors() {
        let policy = RetryPolicy::exponential()
            .with_non_retryable_error("INVALID_INPUT")
            .with_non_retryable_error("NOT_FOUND");

        assert!(!policy.should_retry(Some("INVALID_INPUT")));
        assert!(!policy.should_retry(Some("NOT_FOUND")));
        assert!(policy.should_retry(Some("TIMEOUT")));
        assert!(policy.should_retry(None));
    }

    #[test]
    fn test_has_attempts_remaining() {
        let policy = RetryPolicy::exponential().with_max_attempts(3);

        assert!(policy.has_attempts_remaining(1));
        assert!(policy.has_attempts_remaining(2));
        assert!(!policy.has_attempts_remaining(3));
    }

    #[test]
    fn test_serialization() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(10)
            .with_non_retryable_error("TEST");

        let json = serde_json::to_string(&policy).unwrap();
        let parsed: RetryPolicy = serde_json::from_str(&json).unwrap();

        assert_eq!(policy, parsed);
    }

    #[test]
    fn named_aggressive_policy_matches_spec_table() {
        let policy = StepRetryPolicy::named("aggressive").unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert!(matches!(policy.retryable, Retryable::Transient));
    }

    #[test]
    fn permanent_tags_never_retry_even_if_listed() {
        let policy = StepRetryPolicy {
            max_attempts: 5,
            base_delay_ms: 10,
            max_delay_ms: 100,
            jitter: false,
            retryable: Retryable::Tags(["validation".to_string()].into_iter().collect()),
            circuit_breaker: None,
        };
        assert!(!policy.should_retry("validation"));
    }

    #[test]
    fn backoff_caps_at_max_delay_even_at_high_attempt() {
        let policy = StepRetryPolicy {
            max_attempts: 100,
            base_delay_ms: 100,
            max_delay_ms: 2_000,
            jitter: false,
            retryable: Retryable::All,
            circuit_breaker: None,
        };
        let delay = policy.delay_for_attempt(100);
        assert!(delay <= Duration::from_millis(2_200));
        assert!(delay >= Duration::from_millis(1_800));
    }

    #[tokio::test]
    async fn execute_step_succeeds_first_try_with_no_breaker() {
        use crate::idempotency::InMemoryIdempotencyStore;
        use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
        use crate::workflow::step::StepState;
        use async_trait::async_trait;

        struct AlwaysOk;
        #[async_trait]
        impl Step for AlwaysOk {
            fn name(&self) -> &str {
                "always_ok"
            }
            async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
                Ok(state)
            }
        }

        let engine = RetryEngine::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(CircuitBreakerRegistry::new()));
        let policy = StepRetryPolicy::named("none").unwrap();
        let cancel = CancellationToken::new();
        let outcome = engine
            .execute_step(&AlwaysOk, serde_json::json!({}), "wf-1", &policy, &cancel, |_, _| {})
            .await;
        assert!(matches!(outcome, StepOutcome::Success(_)));
    }

    #[tokio::test]
    async fn execute_step_short_circuits_on_permanent_error() {
        use crate::idempotency::InMemoryIdempotencyStore;
        use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
        use crate::workflow::step::StepState;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct AlwaysPermanent(AtomicU32);
        #[async_trait]
        impl Step for AlwaysPermanent {
            fn name(&self) -> &str {
                "always_permanent"
            }
            async fn execute(&self, _state: StepState) -> Result<StepState, StepError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(StepError::new("missing_dni", "dni not found"))
            }
        }

        let engine = RetryEngine::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(CircuitBreakerRegistry::new()));
        let policy = StepRetryPolicy::named("aggressive").unwrap();
        let cancel = CancellationToken::new();
        let step = AlwaysPermanent(AtomicU32::new(0));
        let outcome = engine
            .execute_step(&step, serde_json::json!({}), "wf-1", &policy, &cancel, |_, _| {})
            .await;
        assert!(matches!(outcome, StepOutcome::Failed(_)));
        assert_eq!(step.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn execute_step_reports_one_attempt_failure_per_retry() {
        use crate::idempotency::InMemoryIdempotencyStore;
        use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
        use crate::workflow::step::StepState;
        use async_trait::async_trait;
        use std::sync::atomic::{AtomicU32, Ordering};

        struct FlakyTwice(AtomicU32);
        #[async_trait]
        impl Step for FlakyTwice {
            fn name(&self) -> &str {
                "flaky"
            }
            async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
                if self.0.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(StepError::new("timeout", "upstream timed out"))
                } else {
                    Ok(state)
                }
            }
        }

        let engine = RetryEngine::new(Arc::new(InMemoryIdempotencyStore::new()), Arc::new(CircuitBreakerRegistry::new()));
        let policy = StepRetryPolicy::named("aggressive").unwrap();
        let cancel = CancellationToken::new();
        let step = FlakyTwice(AtomicU32::new(0));
        let attempts_failed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = attempts_failed.clone();
        let outcome = engine
            .execute_step(&step, serde_json::json!({}), "wf-1", &policy, &cancel, |attempt, err| {
                recorder.lock().unwrap().push((attempt, err.tag.clone()));
            })
            .await;
        assert!(matches!(outcome, StepOutcome::Success(_)));
        assert_eq!(*attempts_failed.lock().unwrap(), vec![(1, "timeout".to_string()), (2, "timeout".to_string())]);
    }
}
