//! Durable Store: transactional persistence of workflow records and
//! their append-only event log, pluggable between an in-memory backend
//! (tests, single-node-without-durability) and a PostgreSQL backend.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::{shared_memory_store, InMemoryDurableStore};
pub use postgres::PostgresDurableStore;
pub use store::{Backup, DurableStore, StoreError, WorkflowFilter, WorkflowStatusSnapshot};
