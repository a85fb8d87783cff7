//! Engine configuration loaded from the environment.
//!
//! Mirrors the teacher's `control-plane/src/main.rs` idiom of reading
//! `std::env::var` directly at startup rather than through a
//! config-builder crate, fronted by `dotenvy::dotenv()` so a local `.env`
//! file is picked up in development.

use std::time::Duration;

/// Which [`crate::persistence::DurableStore`] backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

/// Top-level engine configuration, assembled once at process startup and
/// threaded into [`crate::engine::EngineContext`] construction.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// `DURABLE_STORE_BACKEND` = `memory` | `postgres`. Defaults to `memory`.
    pub store_backend: StoreBackend,
    /// `DATABASE_URL`, required when `store_backend == Postgres`.
    pub database_url: Option<String>,
    /// `DLQ_SCHEDULER_INTERVAL_SECS`, default 300 (the 5-minute tick in §4.I).
    pub dlq_scheduler_interval: Duration,
    /// `ALERT_RATE_LIMIT_MS`, default 60_000 — the duplicate-suppression
    /// window for `AlertDispatcher`.
    pub alert_rate_limit: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            dlq_scheduler_interval: Duration::from_secs(300),
            alert_rate_limit: Duration::from_millis(60_000),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, loading a `.env` file
    /// first if one is present (no-op if absent).
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();

        let store_backend = match std::env::var("DURABLE_STORE_BACKEND") {
            Ok(v) if v.eq_ignore_ascii_case("postgres") => StoreBackend::Postgres,
            _ => StoreBackend::Memory,
        };
        let database_url = std::env::var("DATABASE_URL").ok();
        let dlq_scheduler_interval = std::env::var("DLQ_SCHEDULER_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(300));
        let alert_rate_limit = std::env::var("ALERT_RATE_LIMIT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or_else(|| Duration::from_millis(60_000));

        Self {
            store_backend,
            database_url,
            dlq_scheduler_interval,
            alert_rate_limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_memory_backend() {
        let config = EngineConfig::default();
        assert_eq!(config.store_backend, StoreBackend::Memory);
        assert!(config.database_url.is_none());
        assert_eq!(config.dlq_scheduler_interval, Duration::from_secs(300));
    }
}
