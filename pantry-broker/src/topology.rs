//! Exchange and queue bindings.

use pantry_core::{BrokerError, RoutingKey};

/// The direct exchange all entity commands are published to.
pub const ENTITY_EXCHANGE: &str = "entity.exchange";

/// A durable queue bound to the exchange under one routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub routing_key: RoutingKey,
    pub queue: String,
    pub durable: bool,
}

/// A direct exchange with its bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// One durable queue per command kind on [`ENTITY_EXCHANGE`]:
    /// `entity.create.queue`, `entity.update.queue`, `entity.delete.queue`.
    pub fn entity_default() -> Self {
        Self {
            exchange: ENTITY_EXCHANGE.to_string(),
            bindings: RoutingKey::ALL
                .into_iter()
                .map(|routing_key| Binding {
                    routing_key,
                    queue: format!("{}.queue", routing_key.as_str()),
                    durable: true,
                })
                .collect(),
        }
    }

    /// Position of the binding for `routing_key`.
    pub fn index_of(&self, routing_key: RoutingKey) -> Result<usize, BrokerError> {
        self.bindings
            .iter()
            .position(|binding| binding.routing_key == routing_key)
            .ok_or_else(|| BrokerError::Unroutable {
                routing_key: routing_key.to_string(),
            })
    }

    /// Queue name bound to `routing_key`.
    pub fn queue_for(&self, routing_key: RoutingKey) -> Result<&str, BrokerError> {
        let index = self.index_of(routing_key)?;
        Ok(self.bindings[index].queue.as_str())
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::entity_default()
    }
}
