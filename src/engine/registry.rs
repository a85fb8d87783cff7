//! Definition registry: maps a `definition_key` to the [`WorkflowDefinition`]
//! instances referenced from workflow records.
//!
//! Unlike the teacher's `WorkflowRegistry` (which type-erases a generic
//! `Workflow` trait behind a factory closure because the teacher's trait
//! carries an associated `Input`/`Output` type), [`WorkflowDefinition`] is
//! already object-safe, so registration is a direct `Arc<dyn
//! WorkflowDefinition>` keyed by name — no factory indirection needed.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::workflow::definition::WorkflowDefinition;

/// Errors from registry lookups.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow definition: {0}")]
    UnknownDefinition(String),
    #[error("definition key already registered: {0}")]
    DuplicateDefinition(String),
}

/// Process-wide table of registered workflow definitions, looked up by
/// `definition_key`.
#[derive(Default)]
pub struct DefinitionRegistry {
    definitions: HashMap<String, Arc<dyn WorkflowDefinition>>,
}

impl DefinitionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition` under its own [`WorkflowDefinition::key`].
    pub fn register(&mut self, definition: Arc<dyn WorkflowDefinition>) -> Result<(), RegistryError> {
        let key = definition.key().to_string();
        if self.definitions.contains_key(&key) {
            return Err(RegistryError::DuplicateDefinition(key));
        }
        self.definitions.insert(key, definition);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Result<Arc<dyn WorkflowDefinition>, RegistryError> {
        self.definitions
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownDefinition(key.to_string()))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.definitions.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.definitions.keys().map(String::as_str)
    }
}

impl fmt::Debug for DefinitionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DefinitionRegistry")
            .field("keys", &self.definitions.keys().collect::<Vec<_>>())
            .finish()
    }
}
