//! # Durable Flow
//!
//! A fault-tolerant workflow execution engine that runs long-lived,
//! multi-step business processes as isolated stateful actors, with
//! automatic crash recovery, exactly-once step execution, saga-style
//! compensation, retry with exponential backoff, circuit breakers
//! protecting external services, and a dead-letter queue for terminally
//! failed work.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowSupervisor                       │
//! │   (spawns/restarts WorkflowActors, keyed by workflow id)     │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowActor                           │
//! │   (drives a Graph one step at a time, one per workflow)      │
//! └───────┬──────────┬──────────┬──────────┬──────────┬─────────┘
//!         │          │          │          │          │
//!         ▼          ▼          ▼          ▼          ▼
//!  Idempotency   RetryEngine  CircuitBreaker  Saga   DeadLetterQueue
//!     Store                     Registry   Orchestrator
//!         │          │          │          │          │
//!         └──────────┴──────────┴──────────┴──────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       DurableStore                            │
//! │     (workflows, events — in-memory or PostgreSQL-backed)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_flow::prelude::*;
//! use std::sync::Arc;
//!
//! struct ChargeCard;
//!
//! #[async_trait::async_trait]
//! impl Step for ChargeCard {
//!     fn name(&self) -> &str { "charge_card" }
//!     async fn execute(&self, state: StepState) -> Result<StepState, StepError> {
//!         // forward state["idempotency_key"] to the payment gateway
//!         Ok(state)
//!     }
//! }
//!
//! let definition = LinearWorkflowDefinition::new("order_fulfillment", vec![Arc::new(ChargeCard)]);
//! ```

pub mod alerts;
pub mod bench;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod event_bus;
pub mod graph;
pub mod idempotency;
pub mod persistence;
pub mod reliability;
pub mod saga;
pub mod telemetry;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::alerts::{Alert, AlertChannel, AlertDispatcher, AlertDispatcherConfig, Severity};
    pub use crate::config::{EngineConfig, StoreBackend};
    pub use crate::dlq::{DeadLetterQueue, DlqEntry, DlqEntryType, DlqStatus, Resolution};
    pub use crate::engine::{DefinitionRegistry, EngineContext, StartOutcome, WorkflowSupervisor};
    pub use crate::event_bus::EventBus;
    pub use crate::graph::{Graph, GraphBuilder, GraphError};
    pub use crate::idempotency::{BeginOutcome, IdempotencyError, IdempotencyStore};
    pub use crate::persistence::{DurableStore, InMemoryDurableStore, PostgresDurableStore, StoreError};
    pub use crate::reliability::{CircuitBreaker, CircuitBreakerConfig, RetryEngine, RetryPolicy, StepRetryPolicy};
    pub use crate::saga::{run_saga, CompensationMode, SagaError, SagaResult, SagaStep, SagaStepOptions};
    pub use crate::workflow::{
        idempotency_key, LinearWorkflowDefinition, Step, StepError, StepState, WorkflowDefinition,
        WorkflowError, WorkflowRecord, WorkflowStatus,
    };
}

// Re-export key types at crate root for direct `durable_flow::X` access.
pub use engine::{DefinitionRegistry, EngineContext, StartOutcome, SupervisorError, WorkflowSupervisor};
pub use persistence::{DurableStore, InMemoryDurableStore, PostgresDurableStore, StoreError};
pub use reliability::{CircuitBreaker, CircuitBreakerConfig, RetryEngine, RetryPolicy};
pub use workflow::{
    LinearWorkflowDefinition, Step, StepError, StepState, WorkflowDefinition, WorkflowError, WorkflowRecord,
    WorkflowStatus,
};
