//! Tool registry.
//!
//! Name-keyed lookup in O(1), schema listing in registration order (the
//! model sees tools in the order they were wired up, not alphabetized).
//! Read-only after construction; safe to share across sessions.

use std::sync::Mutex;

use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;

use companion_core::ToolSchema;

use crate::tool::{SharedTool, Tool};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("tool with name '{0}' already registered")]
    DuplicateTool(String),

    #[error("invalid tool: {0}")]
    InvalidTool(String),
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, SharedTool>,
    order: Mutex<Vec<String>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&self, tool: T) -> Result<(), RegistryError>
    where
        T: Tool + 'static,
    {
        self.register_shared(std::sync::Arc::new(tool))
    }

    pub fn register_shared(&self, tool: SharedTool) -> Result<(), RegistryError> {
        let name = tool.name().trim().to_string();
        if name.is_empty() {
            return Err(RegistryError::InvalidTool(
                "tool name cannot be empty".to_string(),
            ));
        }

        match self.tools.entry(name.clone()) {
            Entry::Occupied(_) => Err(RegistryError::DuplicateTool(name)),
            Entry::Vacant(entry) => {
                entry.insert(tool);
                self.order.lock().unwrap().push(name);
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Schemas in registration order: the projection the LLM sees.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let order = self.order.lock().unwrap();
        order
            .iter()
            .filter_map(|name| self.tools.get(name).map(|t| t.to_schema()))
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.order.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
