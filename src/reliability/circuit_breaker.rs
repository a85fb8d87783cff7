//! Circuit Breaker Registry: per-name closed/open/half-open state machines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,

    /// Failure threshold exceeded - all calls rejected
    Open,

    /// Testing if service recovered - limited calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
///
/// Circuit breakers protect external services from cascading failures.
/// When failures exceed a threshold, the circuit "opens" and requests
/// fail fast without calling the service.
///
/// # State Machine
///
/// ```text
/// ┌─────────┐  failure threshold  ┌─────────┐  open_timeout elapsed  ┌──────────┐
/// │ Closed  │ ─────────────────► │  Open   │ ─────────────────────► │ HalfOpen │
/// └─────────┘                     └─────────┘                        └──────────┘
///      ▲                                                                   │
///      │                              success threshold                   │
///      └───────────────────────────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures required to open the circuit
    pub failure_threshold: u32,

    /// Number of consecutive successes in half-open required to close the circuit
    pub success_threshold: u32,

    /// Time spent in `open` before the next call is allowed through as a probe
    #[serde(with = "duration_millis")]
    pub open_timeout: Duration,

    /// Inactivity window after which closed-state counters are cleared
    /// without changing state
    #[serde(with = "duration_millis")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold to open the circuit
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the success threshold to close the circuit
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }

    /// Set the open-state timeout (time before trying again after opening)
    pub fn with_open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the inactivity window that resets closed-state counters
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Well-known defaults for the four names calls out explicitly.
    fn well_known(name: &str) -> Option<Self> {
        match name {
            "email_service" => Some(
                Self::default()
                    .with_failure_threshold(3)
                    .with_open_timeout(Duration::from_secs(60)),
            ),
            "payment_gateway" => Some(
                Self::default()
                    .with_failure_threshold(3)
                    .with_success_threshold(3)
                    .with_open_timeout(Duration::from_secs(30)),
            ),
            "external_api" => Some(Self::default().with_failure_threshold(5).with_open_timeout(Duration::from_secs(20))),
            "database" => Some(
                Self::default()
                    .with_failure_threshold(10)
                    .with_open_timeout(Duration::from_secs(10)),
            ),
            _ => None,
        }
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

/// Errors raised by the circuit breaker.
#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("circuit '{0}' is open")]
    Open(String),
    #[error("no breaker registered under '{0}'")]
    NotFound(String),
}

struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
    opened_at: Option<Instant>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure: None,
            last_success: None,
            opened_at: None,
        }
    }
}

/// A single named breaker, independently lockable so unrelated services
/// never contend on each other's state.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call should be let through right now.
    ///
    /// Calling this while `open` and past `open_timeout` performs the
    /// open → half_open transition inline, so the first post-timeout caller
    /// is the one that gets to probe ( "pre-empted by the first
    /// post-timeout call performing the check inline").
    pub fn allow(&self) -> bool {
        let mut s = self.state.lock();
        match s.state {
            CircuitState::Closed => {
                self.maybe_reset_on_inactivity(&mut s);
                true
            }
            CircuitState::Open => {
                let elapsed = s.opened_at.map(|t| t.elapsed()).unwrap_or(Duration::ZERO);
                if elapsed >= self.config.open_timeout {
                    s.state = CircuitState::HalfOpen;
                    s.successes = 0;
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => true,
        }
    }

    fn maybe_reset_on_inactivity(&self, s: &mut BreakerState) {
        let idle_since = s.last_failure.or(s.last_success);
        if let Some(last) = idle_since {
            if last.elapsed() >= self.config.reset_timeout {
                s.failures = 0;
                s.successes = 0;
            }
        }
    }

    pub fn report_success(&self) {
        let mut s = self.state.lock();
        s.last_success = Some(Instant::now());
        match s.state {
            CircuitState::Closed => {
                s.failures = 0;
            }
            CircuitState::HalfOpen => {
                s.successes += 1;
                if s.successes >= self.config.success_threshold {
                    s.state = CircuitState::Closed;
                    s.failures = 0;
                    s.successes = 0;
                    s.opened_at = None;
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn report_failure(&self) {
        let mut s = self.state.lock();
        s.last_failure = Some(Instant::now());
        match s.state {
            CircuitState::Closed => {
                s.failures += 1;
                if s.failures >= self.config.failure_threshold {
                    s.state = CircuitState::Open;
                    s.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                s.state = CircuitState::Open;
                s.opened_at = Some(Instant::now());
                s.successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Execute `f` inside the breaker: denies the call without invoking `f`
    /// when the circuit doesn't allow it, else records the outcome.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<Result<T, E>, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.allow() {
            return Err(CircuitBreakerError::Open(self.name.clone()));
        }
        match f().await {
            Ok(value) => {
                self.report_success();
                Ok(Ok(value))
            }
            Err(err) => {
                self.report_failure();
                Ok(Err(err))
            }
        }
    }

    pub fn status(&self) -> CircuitState {
        self.state.lock().state
    }

    pub fn force_state(&self, state: CircuitState) {
        let mut s = self.state.lock();
        s.state = state;
        if state == CircuitState::Open {
            s.opened_at = Some(Instant::now());
        } else {
            s.opened_at = None;
        }
        s.failures = 0;
        s.successes = 0;
    }

    pub fn reset(&self) {
        let mut s = self.state.lock();
        *s = BreakerState::new();
    }
}

/// Per-name registry of breakers, lazily created with well-known defaults
/// for the four names singles out.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self {
            breakers: DashMap::new(),
        }
    }

    /// Fetch an existing breaker, creating one with well-known (or default)
    /// config on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = CircuitBreakerConfig::well_known(name).unwrap_or_default();
                Arc::new(CircuitBreaker::new(name, config))
            })
            .clone()
    }

    /// Register `name` with explicit `config`, overwriting any existing breaker.
    pub fn configure(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, config));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    pub fn stop(&self, name: &str) {
        self.breakers.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.success_threshold, 2);
        assert_eq!(config.open_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_config_builder() {
        let config = CircuitBreakerConfig::new()
            .with_failure_threshold(10)
            .with_success_threshold(3)
            .with_open_timeout(Duration::from_secs(60));

        assert_eq!(config.failure_threshold, 10);
        assert_eq!(config.success_threshold, 3);
        assert_eq!(config.open_timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "closed");
        assert_eq!(CircuitState::Open.to_string(), "open");
        assert_eq!(CircuitState::HalfOpen.to_string(), "half_open");
    }

    #[test]
    fn test_serialization() {
        let config = CircuitBreakerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, parsed);
    }

    #[tokio::test]
    async fn opens_after_threshold_and_recovers_through_half_open() {
        let config = CircuitBreakerConfig::default()
            .with_failure_threshold(2)
            .with_success_threshold(1)
            .with_open_timeout(Duration::from_millis(50));
        let breaker = CircuitBreaker::new("svc", config);

        breaker.report_failure();
        assert_eq!(breaker.status(), CircuitState::Closed);
        breaker.report_failure();
        assert_eq!(breaker.status(), CircuitState::Open);
        assert!(!breaker.allow());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(breaker.allow());
        assert_eq!(breaker.status(), CircuitState::HalfOpen);

        breaker.report_success();
        assert_eq!(breaker.status(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new(
            "svc",
            CircuitBreakerConfig::default().with_failure_threshold(1),
        );
        breaker.report_failure();
        assert_eq!(breaker.status(), CircuitState::Open);
        breaker.force_state(CircuitState::HalfOpen);
        breaker.report_failure();
        assert_eq!(breaker.status(), CircuitState::Open);
    }

    #[test]
    fn registry_applies_well_known_defaults() {
        let registry = CircuitBreakerRegistry::new();
        let payment = registry.get_or_create("payment_gateway");
        assert_eq!(payment.config.failure_threshold, 3);
        let generic = registry.get_or_create("some_other_service");
        assert_eq!(generic.config.failure_threshold, CircuitBreakerConfig::default().failure_threshold);
    }

    #[tokio::test]
    async fn call_short_circuits_without_invoking_closure_when_open() {
        let breaker = CircuitBreaker::new("svc", CircuitBreakerConfig::default());
        breaker.force_state(CircuitState::Open);
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result: Result<Result<(), &str>, CircuitBreakerError> = breaker
            .call(|| async {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(CircuitBreakerError::Open(_))));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }
}
