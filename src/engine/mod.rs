//! Engine wiring: the shared [`EngineContext`]
//! every actor is built from, the [`DefinitionRegistry`] workflow definitions
//! are registered under, and the [`WorkflowSupervisor`] that spawns, tracks,
//! and restarts actors.

pub mod context;
pub mod registry;
pub mod supervisor;

pub use context::EngineContext;
pub use registry::{DefinitionRegistry, RegistryError};
pub use supervisor::{StartOutcome, SupervisorError, WorkflowSupervisor};
