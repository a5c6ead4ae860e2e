//! PANTRY Broker
//!
//! Durable, per-routing-key command channel between the publisher and the
//! processor. One direct exchange routes `entity.create`, `entity.update` and
//! `entity.delete` to three independent queues, so a backlog of one kind
//! never blocks the others.
//!
//! # Delivery semantics
//!
//! - At-least-once: a delivery stays outstanding until acked. Outstanding
//!   deliveries are requeued on `nack(requeue = true)` and, for the durable
//!   broker, after a restart.
//! - FIFO per queue for a single producer. Requeued and delayed messages may
//!   overtake or fall behind newer ones; consumers must not rely on
//!   cross-delivery ordering.
//! - No ordering across queues.

use std::time::Duration;

use async_trait::async_trait;
use pantry_core::{BrokerError, RoutingKey};
use serde::Serialize;

pub mod codec;
pub mod dead_letter;
pub mod lmdb;
pub mod memory;
pub mod topology;

pub use codec::{decode_command, encode_command};
pub use dead_letter::{
    DeadLetterReason, DeadLetterRecord, DeadLetterStore, InMemoryDeadLetterStore,
};
pub use lmdb::{LmdbBroker, LmdbBrokerError, LmdbDeadLetterStore};
pub use memory::InMemoryBroker;
pub use topology::{Binding, Topology, ENTITY_EXCHANGE};

/// Identifies one outstanding delivery.
pub type DeliveryTag = u64;

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub routing_key: RoutingKey,
    pub body: Vec<u8>,
    /// Set when the message was handed out before and not acked.
    pub redelivered: bool,
}

/// Message counts of one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    /// Visible and waiting for a consumer.
    pub ready: u64,
    /// Published with a delay that has not elapsed yet.
    pub delayed: u64,
    /// Handed out and awaiting ack.
    pub unacked: u64,
}

/// The command broker.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Exchange and bindings this broker routes with.
    fn topology(&self) -> &Topology;

    /// Durably enqueue `body` on the queue bound to `routing_key`.
    ///
    /// Returns only after the message is stored; any failure means the
    /// message was not accepted.
    async fn publish(&self, routing_key: RoutingKey, body: Vec<u8>) -> Result<(), BrokerError>;

    /// Like [`Broker::publish`], but the message only becomes visible to
    /// consumers after `delay`.
    async fn publish_delayed(
        &self,
        routing_key: RoutingKey,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError>;

    /// Wait for the next delivery on the queue bound to `routing_key`.
    ///
    /// Cancel-safe: dropping the future never loses a message.
    async fn consume(&self, routing_key: RoutingKey) -> Result<Delivery, BrokerError>;

    /// Acknowledge a delivery, removing the message for good.
    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject a delivery. With `requeue` the message is made visible again and
    /// flagged as redelivered; without it the message is dropped.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Current message counts of the queue bound to `routing_key`.
    async fn depth(&self, routing_key: RoutingKey) -> Result<QueueDepth, BrokerError>;
}
