//! Handler registry: event type -> the single handler that consumes it.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use crate::handler::EventHandler;

/// Registration failure. Surfaced at startup, never at dispatch time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("a handler for event type '{0}' is already registered")]
    DuplicateEventType(String),

    #[error("handler declares an empty event type")]
    EmptyEventType,
}

/// Lookup table populated once at process startup by the consumer modules.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from all handlers, failing on the first duplicate.
    pub fn from_handlers(
        handlers: impl IntoIterator<Item = Arc<dyn EventHandler>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for handler in handlers {
            registry.register(handler)?;
        }
        Ok(registry)
    }

    /// Register a handler under the type it declares.
    pub fn register(&mut self, handler: Arc<dyn EventHandler>) -> Result<(), RegistryError> {
        let event_type = handler.event_type().trim().to_string();
        if event_type.is_empty() {
            return Err(RegistryError::EmptyEventType);
        }
        if self.by_type.contains_key(&event_type) {
            return Err(RegistryError::DuplicateEventType(event_type));
        }

        debug!(event_type = %event_type, "registered outbox handler");
        self.by_type.insert(event_type, handler);
        Ok(())
    }

    /// Chaining form of `register` for startup wiring.
    pub fn with(mut self, handler: impl EventHandler + 'static) -> Result<Self, RegistryError> {
        self.register(Arc::new(handler))?;
        Ok(self)
    }

    pub fn lookup(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        self.by_type.get(event_type).cloned()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.by_type.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.event_types())
            .finish()
    }
}
