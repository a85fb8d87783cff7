//! Reliability patterns for durable execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`CircuitBreakerConfig`] - Circuit breaker configuration

pub mod circuit_breaker;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerRegistry, CircuitState};
pub use retry::{RetryEngine, RetryPolicy, Retryable, StepOutcome, StepRetryPolicy, PERMANENT_TAGS, TRANSIENT_TAGS};
