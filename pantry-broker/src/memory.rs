//! In-process broker.
//!
//! Holds messages in memory only, so "durable" means "durable for the life
//! of the process". [`InMemoryBroker::recover_unacked`] reproduces what a
//! restart of a durable broker does to outstanding deliveries.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pantry_core::{BrokerError, RoutingKey};
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::topology::Topology;
use crate::{Broker, Delivery, DeliveryTag, QueueDepth};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Message>,
    delayed: Vec<(Instant, Message)>,
    unacked: HashMap<DeliveryTag, Message>,
}

impl QueueState {
    /// Move delayed messages whose time has come to the back of `ready`, in
    /// due order.
    fn promote_due(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        self.delayed.sort_by_key(|(due, _)| *due);
        let split = self.delayed.partition_point(|(due, _)| *due <= now);
        for (_, message) in self.delayed.drain(..split) {
            self.ready.push_back(message);
        }
    }

    fn next_due(&self) -> Option<Instant> {
        self.delayed.iter().map(|(due, _)| *due).min()
    }
}

#[derive(Debug, Default)]
struct Queue {
    state: Mutex<QueueState>,
    notify: Notify,
}

/// In-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    topology: Arc<Topology>,
    queues: Arc<Vec<Queue>>,
    next_tag: Arc<AtomicU64>,
    available: Arc<AtomicBool>,
    poll_interval: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(Topology::entity_default())
    }
}

impl InMemoryBroker {
    pub fn new(topology: Topology) -> Self {
        let queues = topology.bindings.iter().map(|_| Queue::default()).collect();
        Self {
            topology: Arc::new(topology),
            queues: Arc::new(queues),
            next_tag: Arc::new(AtomicU64::new(1)),
            available: Arc::new(AtomicBool::new(true)),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// How long an idle consumer sleeps before re-checking for delayed messages.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Simulate a broker outage. While unavailable, publish and consume fail
    /// with `BrokerError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Requeue every outstanding delivery, flagged as redelivered, ahead of
    /// the messages still waiting.
    pub fn recover_unacked(&self) {
        for queue in self.queues.iter() {
            if let Ok(mut state) = queue.state.lock() {
                let mut outstanding: Vec<_> = state.unacked.drain().collect();
                outstanding.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
                for (_, mut message) in outstanding {
                    message.redelivered = true;
                    state.ready.push_front(message);
                }
            }
            queue.notify.notify_waiters();
        }
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable {
                reason: "broker connection lost".to_string(),
            })
        }
    }

    fn queue(&self, routing_key: RoutingKey) -> Result<&Queue, BrokerError> {
        let index = self.topology.index_of(routing_key)?;
        self.queues.get(index).ok_or_else(|| BrokerError::Unroutable {
            routing_key: routing_key.to_string(),
        })
    }

    fn lock(queue: &Queue) -> Result<std::sync::MutexGuard<'_, QueueState>, BrokerError> {
        queue.state.lock().map_err(|_| BrokerError::Unavailable {
            reason: "queue lock poisoned".to_string(),
        })
    }

    fn enqueue(
        &self,
        routing_key: RoutingKey,
        body: Vec<u8>,
        visible_at: Option<Instant>,
    ) -> Result<(), BrokerError> {
        self.ensure_available()?;
        let queue = self.queue(routing_key)?;
        {
            let mut state = Self::lock(queue)?;
            let message = Message {
                body,
                redelivered: false,
            };
            match visible_at {
                Some(due) => state.delayed.push((due, message)),
                None => state.ready.push_back(message),
            }
        }
        queue.notify.notify_one();
        Ok(())
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    async fn publish(&self, routing_key: RoutingKey, body: Vec<u8>) -> Result<(), BrokerError> {
        self.enqueue(routing_key, body, None)
    }

    async fn publish_delayed(
        &self,
        routing_key: RoutingKey,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        self.enqueue(routing_key, body, Some(Instant::now() + delay))
    }

    async fn consume(&self, routing_key: RoutingKey) -> Result<Delivery, BrokerError> {
        let queue = self.queue(routing_key)?;
        loop {
            self.ensure_available()?;
            let wait = {
                let now = Instant::now();
                let mut state = Self::lock(queue)?;
                state.promote_due(now);
                if let Some(message) = state.ready.pop_front() {
                    let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
                    state.unacked.insert(tag, message.clone());
                    return Ok(Delivery {
                        tag,
                        routing_key,
                        body: message.body,
                        redelivered: message.redelivered,
                    });
                }
                state
                    .next_due()
                    .map(|due| due.saturating_duration_since(now))
                    .unwrap_or(self.poll_interval)
                    .min(self.poll_interval)
            };

            tokio::select! {
                _ = queue.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let queue = self.queue(delivery.routing_key)?;
        let mut state = Self::lock(queue)?;
        state
            .unacked
            .remove(&delivery.tag)
            .map(|_| ())
            .ok_or(BrokerError::UnknownDelivery { tag: delivery.tag })
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let queue = self.queue(delivery.routing_key)?;
        {
            let mut state = Self::lock(queue)?;
            let mut message = state
                .unacked
                .remove(&delivery.tag)
                .ok_or(BrokerError::UnknownDelivery { tag: delivery.tag })?;
            if !requeue {
                return Ok(());
            }
            message.redelivered = true;
            state.ready.push_front(message);
        }
        queue.notify.notify_one();
        Ok(())
    }

    async fn depth(&self, routing_key: RoutingKey) -> Result<QueueDepth, BrokerError> {
        let queue = self.queue(routing_key)?;
        let state = Self::lock(queue)?;
        Ok(QueueDepth {
            ready: state.ready.len() as u64,
            delayed: state.delayed.len() as u64,
            unacked: state.unacked.len() as u64,
        })
    }
}
