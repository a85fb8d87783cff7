//! Process-wide singleton bundle injected into every actor ( "Global state":
//! "inject them by handle into the actor rather than reaching for global
//! variables, to keep testing tractable").

use std::sync::Arc;

use crate::alerts::{AlertDispatcher, AlertDispatcherConfig, EventBusChannel, LoggerChannel};
use crate::dlq::DeadLetterQueue;
use crate::event_bus::EventBus;
use crate::idempotency::{shared_memory_store, IdempotencyStore};
use crate::persistence::store::DurableStore;
use crate::reliability::circuit_breaker::CircuitBreakerRegistry;
use crate::reliability::retry::RetryEngine;

use super::registry::DefinitionRegistry;

/// The shared handles every [`WorkflowActor`](crate::workflow::actor::WorkflowActor)
/// and the [`WorkflowSupervisor`](super::supervisor::WorkflowSupervisor)
/// are constructed from. One instance per running engine.
pub struct EngineContext {
    pub store: Arc<dyn DurableStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub breakers: Arc<CircuitBreakerRegistry>,
    pub retry_engine: Arc<RetryEngine>,
    pub dlq: Arc<DeadLetterQueue>,
    pub alerts: Arc<AlertDispatcher>,
    pub bus: Arc<EventBus>,
    pub registry: Arc<DefinitionRegistry>,
}

impl EngineContext {
    /// Wire up a fresh context around `store` and `registry`, with the
    /// logger and event-bus alert channels registered by default.
    pub fn new(store: Arc<dyn DurableStore>, registry: Arc<DefinitionRegistry>) -> Self {
        let idempotency = shared_memory_store();
        let breakers = Arc::new(CircuitBreakerRegistry::new());
        let retry_engine = Arc::new(RetryEngine::new(idempotency.clone(), breakers.clone()));
        let bus = Arc::new(EventBus::new());
        let alerts = Arc::new(AlertDispatcher::new(AlertDispatcherConfig::default()));
        alerts.register_channel(Arc::new(LoggerChannel));
        alerts.register_channel(Arc::new(EventBusChannel::new(bus.clone())));
        let dlq = Arc::new(DeadLetterQueue::new(alerts.clone()));

        Self {
            store,
            idempotency,
            breakers,
            retry_engine,
            dlq,
            alerts,
            bus,
            registry,
        }
    }
}
