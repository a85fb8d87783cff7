//! Workflow abstractions and types
//!
//! This module contains the core workflow primitives:
//! - [`actor`] — the per-workflow supervised actor that drives a graph
//! - [`definition`] — the [`WorkflowDefinition`] trait callers implement
//! - [`step`] — the [`Step`] trait and idempotency-key derivation
//! - [`event`] — the append-only event log
//! - [`record`] — the durable workflow snapshot

pub mod actor;
pub mod definition;
pub mod event;
pub mod record;
pub mod step;

pub use actor::{ActorHandle, ActorMessage};
pub use definition::{LinearWorkflowDefinition, WorkflowDefinition, WorkflowError};
pub use event::{EventFilter, EventRecord, EventType};
pub use record::{WorkflowRecord, WorkflowStatus};
pub use step::{idempotency_key, state_keys, CompensationOptions, Step, StepError, StepState};
