//! Routing key to handler table.
//!
//! Built once at startup and checked against the broker topology, so a
//! queue nobody handles is a startup error rather than a silent backlog.

use std::collections::HashMap;
use std::sync::Arc;

use pantry_broker::Topology;
use pantry_core::RoutingKey;
use thiserror::Error;

use super::handlers::{CommandHandler, CreateHandler, DeleteHandler, UpdateHandler};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no handler registered for routing key {0}")]
    Unregistered(RoutingKey),

    #[error("handler for {registered} was registered under {requested}")]
    Mismatched {
        requested: RoutingKey,
        registered: RoutingKey,
    },
}

/// Handlers by routing key.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<RoutingKey, Arc<dyn CommandHandler>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The create, update and delete handlers.
    pub fn entity_default() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CreateHandler));
        registry.register(Arc::new(UpdateHandler));
        registry.register(Arc::new(DeleteHandler));
        registry
    }

    /// Register a handler under its own routing key, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(handler.routing_key(), handler);
    }

    pub fn handler(&self, routing_key: RoutingKey) -> Result<&Arc<dyn CommandHandler>, RegistryError> {
        self.handlers
            .get(&routing_key)
            .ok_or(RegistryError::Unregistered(routing_key))
    }

    pub fn is_registered(&self, routing_key: RoutingKey) -> bool {
        self.handlers.contains_key(&routing_key)
    }

    /// Check that every bound queue has a handler for its routing key.
    pub fn verify(&self, topology: &Topology) -> Result<(), RegistryError> {
        for binding in &topology.bindings {
            let handler = self.handler(binding.routing_key)?;
            if handler.routing_key() != binding.routing_key {
                return Err(RegistryError::Mismatched {
                    requested: binding.routing_key,
                    registered: handler.routing_key(),
                });
            }
        }
        Ok(())
    }
}
