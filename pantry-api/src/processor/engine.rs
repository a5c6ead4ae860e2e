//! Command processor.
//!
//! Consumes deliveries, drives each command through
//! `Received -> Validating -> Applied | Retrying -> DeadLettered`, and settles
//! the delivery with the broker.
//!
//! - Commands for the same entity id are applied one at a time.
//! - A command whose sequence is not above the id's ledger entry is a stale
//!   or duplicate delivery: it is acknowledged without touching the store.
//! - Retryable failures are re-published with `attempt + 1` after a backoff;
//!   once the retry budget is spent the command is dead-lettered.
//! - Nothing is acknowledged before its outcome is durable. If re-publishing
//!   or dead-lettering fails, the delivery is requeued instead.

use std::sync::Arc;

use pantry_broker::{
    decode_command, encode_command, Broker, DeadLetterReason, DeadLetterRecord, DeadLetterStore,
    Delivery, Topology,
};
use pantry_core::{ApplyConflictError, Command, CommandState, PantryError, RetryConfig, RoutingKey};
use pantry_storage::{ApplyLedger, EntityStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::handlers::{ApplyError, ApplyOutcome};
use super::metrics::ProcessorMetrics;
use super::observer::ApplyObserver;
use super::registry::{HandlerRegistry, RegistryError};
use super::sequencer::KeySequencer;

/// Everything the processor needs.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub broker: Arc<dyn Broker>,
    pub store: Arc<dyn EntityStore>,
    pub ledger: Arc<dyn ApplyLedger>,
    pub dead_letters: Arc<dyn DeadLetterStore>,
    pub registry: HandlerRegistry,
    pub observers: Vec<Arc<dyn ApplyObserver>>,
    pub retry: RetryConfig,
}

/// Tracks one command through the apply-side state machine.
struct Lifecycle<'a> {
    command: &'a Command,
    state: CommandState,
}

impl<'a> Lifecycle<'a> {
    fn new(command: &'a Command) -> Self {
        Self {
            command,
            state: CommandState::Received,
        }
    }

    fn advance(&mut self, next: CommandState) -> CommandState {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(
            command_id = %self.command.command_id,
            entity_id = %self.command.entity_id,
            routing_key = %self.command.routing_key(),
            attempt = self.command.attempt,
            from = %self.state,
            to = %next,
            "Command state transition"
        );
        self.state = next;
        next
    }
}

/// What to do with a command after a failed apply.
enum Failure {
    Retryable { reason: DeadLetterReason, error: String },
    Terminal { reason: DeadLetterReason, error: String },
}

impl From<ApplyError> for Failure {
    fn from(err: ApplyError) -> Self {
        let error = err.to_string();
        match err {
            ApplyError::Precondition(_) => Failure::Retryable {
                reason: DeadLetterReason::ApplyConflict,
                error,
            },
            ApplyError::Store(_) => Failure::Retryable {
                reason: DeadLetterReason::Store,
                error,
            },
            ApplyError::Malformed(_) => Failure::Terminal {
                reason: DeadLetterReason::Serialization,
                error,
            },
        }
    }
}

/// The command processor.
pub struct CommandProcessor {
    broker: Arc<dyn Broker>,
    store: Arc<dyn EntityStore>,
    ledger: Arc<dyn ApplyLedger>,
    dead_letters: Arc<dyn DeadLetterStore>,
    registry: HandlerRegistry,
    observers: Vec<Arc<dyn ApplyObserver>>,
    retry: RetryConfig,
    sequencer: KeySequencer,
    metrics: Arc<ProcessorMetrics>,
}

impl CommandProcessor {
    /// Build a processor. Fails if a bound queue has no handler.
    pub fn new(deps: ProcessorDeps) -> Result<Self, RegistryError> {
        deps.registry.verify(deps.broker.topology())?;
        Ok(Self {
            broker: deps.broker,
            store: deps.store,
            ledger: deps.ledger,
            dead_letters: deps.dead_letters,
            registry: deps.registry,
            observers: deps.observers,
            retry: deps.retry,
            sequencer: KeySequencer::new(),
            metrics: Arc::new(ProcessorMetrics::new()),
        })
    }

    pub fn metrics(&self) -> Arc<ProcessorMetrics> {
        self.metrics.clone()
    }

    pub fn topology(&self) -> &Topology {
        self.broker.topology()
    }

    /// Wait for the next delivery on `routing_key` and process it.
    pub async fn process_next(&self, routing_key: RoutingKey) -> Result<CommandState, PantryError> {
        let delivery = self.broker.consume(routing_key).await?;
        Ok(self.process(&delivery).await)
    }

    /// Process one delivery and settle it with the broker.
    ///
    /// Returns the state the command ended in for this delivery:
    /// `Applied`, `Retrying` (re-published or requeued) or `DeadLettered`.
    pub async fn process(&self, delivery: &Delivery) -> CommandState {
        self.metrics.record_received();

        let command = match decode_command(delivery.routing_key, &delivery.body) {
            Ok(command) => command,
            Err(e) => return self.dead_letter_unreadable(delivery, e).await,
        };

        let mut lifecycle = Lifecycle::new(&command);
        let handler = match self.registry.handler(command.routing_key()) {
            Ok(handler) => handler.clone(),
            Err(e) => {
                // Unreachable after `verify`, but never drop the message.
                tracing::error!(routing_key = %command.routing_key(), error = %e, "No handler");
                self.settle_nack(delivery).await;
                return CommandState::Received;
            }
        };

        let _guard = self.sequencer.lock(command.entity_id).await;
        lifecycle.advance(CommandState::Validating);

        match self.ledger.last_applied(command.entity_id).await {
            Ok(Some(last)) if command.sequence <= last => {
                if delivery.redelivered || command.attempt > 1 {
                    tracing::debug!(
                        command_id = %command.command_id,
                        entity_id = %command.entity_id,
                        sequence = command.sequence,
                        last_applied = last,
                        "Skipping stale or duplicate command"
                    );
                } else {
                    // First delivery of a command already overtaken.
                    tracing::warn!(
                        command_id = %command.command_id,
                        entity_id = %command.entity_id,
                        sequence = command.sequence,
                        last_applied = last,
                        "Skipping command older than the last applied one"
                    );
                }
                self.metrics.record_stale();
                self.settle_ack(delivery).await;
                return lifecycle.advance(CommandState::Applied);
            }
            Ok(_) => {}
            Err(e) => {
                let failure = Failure::Retryable {
                    reason: DeadLetterReason::Store,
                    error: e.to_string(),
                };
                return self.fail(delivery, &command, &mut lifecycle, failure).await;
            }
        }

        let outcome = match handler.apply(&command, self.store.as_ref()).await {
            Ok(outcome) => outcome,
            Err(e) => return self.fail(delivery, &command, &mut lifecycle, e.into()).await,
        };

        let current = match &outcome {
            ApplyOutcome::Unchanged => {
                self.metrics.record_duplicate();
                tracing::debug!(
                    command_id = %command.command_id,
                    entity_id = %command.entity_id,
                    "Command already in effect"
                );
                self.settle_ack(delivery).await;
                return lifecycle.advance(CommandState::Applied);
            }
            ApplyOutcome::Stored(entity) => Some(entity),
            ApplyOutcome::Removed { .. } => None,
        };

        for observer in &self.observers {
            observer.entity_applied(&command, current).await;
        }

        if let Err(e) = self.ledger.record_applied(command.entity_id, command.sequence).await {
            let failure = Failure::Retryable {
                reason: DeadLetterReason::Store,
                error: e.to_string(),
            };
            return self.fail(delivery, &command, &mut lifecycle, failure).await;
        }

        match outcome {
            ApplyOutcome::Removed { existed: false } => self.metrics.record_duplicate(),
            _ => self.metrics.record_applied(),
        }
        tracing::info!(
            command_id = %command.command_id,
            entity_id = %command.entity_id,
            routing_key = %command.routing_key(),
            attempt = command.attempt,
            "Command applied"
        );
        self.settle_ack(delivery).await;
        lifecycle.advance(CommandState::Applied)
    }

    async fn fail(
        &self,
        delivery: &Delivery,
        command: &Command,
        lifecycle: &mut Lifecycle<'_>,
        failure: Failure,
    ) -> CommandState {
        let (reason, error) = match failure {
            Failure::Retryable { error, .. } if self.retry.allows_retry(command.attempt) => {
                lifecycle.advance(CommandState::Retrying);
                self.schedule_retry(delivery, command, &error).await;
                return CommandState::Retrying;
            }
            Failure::Retryable { reason, error } => {
                let error = match reason {
                    DeadLetterReason::ApplyConflict => ApplyConflictError {
                        kind: command.kind,
                        entity_id: command.entity_id,
                        attempts: command.attempt,
                        reason: error,
                    }
                    .to_string(),
                    _ => error,
                };
                lifecycle.advance(CommandState::Retrying);
                (reason, error)
            }
            Failure::Terminal { reason, error } => (reason, error),
        };

        let record = DeadLetterRecord::exhausted(command.clone(), delivery.body.clone(), reason, error);
        match self.record_dead_letter(delivery, record).await {
            true => lifecycle.advance(CommandState::DeadLettered),
            false => CommandState::Retrying,
        }
    }

    async fn schedule_retry(&self, delivery: &Delivery, command: &Command, error: &str) {
        let next = command.next_attempt();
        let delay = self.retry.backoff_for(command.attempt);
        let published = match encode_command(&next) {
            Ok(body) => self
                .broker
                .publish_delayed(next.routing_key(), body, delay)
                .await
                .map_err(PantryError::from),
            Err(e) => Err(e),
        };

        match published {
            Ok(()) => {
                self.metrics.record_retry();
                tracing::warn!(
                    command_id = %command.command_id,
                    entity_id = %command.entity_id,
                    routing_key = %command.routing_key(),
                    attempt = command.attempt,
                    next_attempt = next.attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Apply failed, retry scheduled"
                );
                self.settle_ack(delivery).await;
            }
            Err(e) => {
                tracing::warn!(
                    command_id = %command.command_id,
                    error = %e,
                    "Could not schedule retry, requeueing delivery"
                );
                self.settle_nack(delivery).await;
            }
        }
    }

    async fn dead_letter_unreadable(&self, delivery: &Delivery, err: PantryError) -> CommandState {
        let record = DeadLetterRecord::unreadable(delivery.routing_key, delivery.body.clone(), err.to_string());
        match self.record_dead_letter(delivery, record).await {
            true => CommandState::DeadLettered,
            false => CommandState::Received,
        }
    }

    /// Store the record, then ack. Returns false if the record could not be
    /// stored and the delivery was requeued.
    async fn record_dead_letter(&self, delivery: &Delivery, record: DeadLetterRecord) -> bool {
        let (id, reason, attempts, error) = (record.id, record.reason, record.attempts, record.error.clone());
        if let Err(e) = self.dead_letters.record(record).await {
            tracing::error!(
                record_id = %id,
                error = %e,
                "Failed to store dead-letter record, requeueing delivery"
            );
            self.settle_nack(delivery).await;
            return false;
        }
        self.metrics.record_dead_letter();
        tracing::error!(
            record_id = %id,
            routing_key = %delivery.routing_key,
            reason = ?reason,
            attempts,
            error = %error,
            "Command dead-lettered"
        );
        self.settle_ack(delivery).await;
        true
    }

    async fn settle_ack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.ack(delivery).await {
            // The message comes back; the ledger makes the second pass a no-op.
            tracing::warn!(tag = delivery.tag, error = %e, "Failed to ack delivery");
        }
    }

    async fn settle_nack(&self, delivery: &Delivery) {
        if let Err(e) = self.broker.nack(delivery, true).await {
            tracing::warn!(tag = delivery.tag, error = %e, "Failed to requeue delivery");
        }
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    /// Consume `routing_key` until `shutdown` flips to true.
    ///
    /// A delivery that is being processed when shutdown arrives is finished
    /// first. Waiting for a delivery is cancelled immediately.
    pub async fn run_worker(
        self: Arc<Self>,
        routing_key: RoutingKey,
        worker: usize,
        mut shutdown: watch::Receiver<bool>,
    ) {
        tracing::info!(routing_key = %routing_key, worker, "Processor worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                delivery = self.broker.consume(routing_key) => match delivery {
                    Ok(delivery) => {
                        self.process(&delivery).await;
                    }
                    Err(e) => {
                        tracing::warn!(routing_key = %routing_key, worker, error = %e, "Consume failed");
                        let pause = self.retry.initial_backoff;
                        tokio::select! {
                            _ = tokio::time::sleep(pause) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                },
            }
        }

        tracing::info!(routing_key = %routing_key, worker, "Processor worker stopped");
    }

    /// Start `per_queue` workers for every bound routing key.
    pub fn spawn_workers(self: &Arc<Self>, per_queue: usize, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let keys: Vec<RoutingKey> = self
            .topology()
            .bindings
            .iter()
            .map(|binding| binding.routing_key)
            .collect();

        keys.into_iter()
            .flat_map(|routing_key| (0..per_queue.max(1)).map(move |worker| (routing_key, worker)))
            .map(|(routing_key, worker)| {
                tokio::spawn(self.clone().run_worker(routing_key, worker, shutdown.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_broker::{InMemoryBroker, InMemoryDeadLetterStore};
    use pantry_core::{new_entity_id, EntityFields};
    use pantry_storage::{InMemoryApplyLedger, InMemoryEntityStore};
    use std::time::Duration;

    struct Fixture {
        processor: CommandProcessor,
        broker: InMemoryBroker,
        store: InMemoryEntityStore,
        dead_letters: InMemoryDeadLetterStore,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let broker = InMemoryBroker::new(Topology::entity_default()).with_poll_interval(Duration::from_millis(5));
        let store = InMemoryEntityStore::new();
        let dead_letters = InMemoryDeadLetterStore::new();
        let processor = CommandProcessor::new(ProcessorDeps {
            broker: Arc::new(broker.clone()),
            store: Arc::new(store.clone()),
            ledger: Arc::new(InMemoryApplyLedger::new()),
            dead_letters: Arc::new(dead_letters.clone()),
            registry: HandlerRegistry::entity_default(),
            observers: Vec::new(),
            retry: RetryConfig {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                backoff_multiplier: 2.0,
            },
        })
        .unwrap();
        Fixture {
            processor,
            broker,
            store,
            dead_letters,
        }
    }

    async fn publish(broker: &InMemoryBroker, command: &Command) {
        broker
            .publish(command.routing_key(), encode_command(command).unwrap())
            .await
            .unwrap();
    }

    async fn next(fixture: &Fixture, key: RoutingKey) -> CommandState {
        tokio::time::timeout(Duration::from_secs(2), fixture.processor.process_next(key))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_unregistered_key_is_startup_error() {
        let broker = InMemoryBroker::new(Topology::entity_default());
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(super::super::handlers::CreateHandler));
        let result = CommandProcessor::new(ProcessorDeps {
            broker: Arc::new(broker),
            store: Arc::new(InMemoryEntityStore::new()),
            ledger: Arc::new(InMemoryApplyLedger::new()),
            dead_letters: Arc::new(InMemoryDeadLetterStore::new()),
            registry,
            observers: Vec::new(),
            retry: RetryConfig::default(),
        });
        assert!(matches!(result, Err(RegistryError::Unregistered(_))));
    }

    #[tokio::test]
    async fn test_create_then_duplicate() {
        let f = fixture(3);
        let command = Command::create(new_entity_id(), EntityFields::new("Soup", "water", 10), 1);
        publish(&f.broker, &command).await;
        publish(&f.broker, &command).await;

        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::Applied);
        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::Applied);
        assert_eq!(f.store.len(), 1);

        let metrics = f.processor.metrics().snapshot();
        assert_eq!(metrics.applied, 1);
        assert_eq!(metrics.stale_skipped, 1);
    }

    #[tokio::test]
    async fn test_malformed_body_dead_letters_immediately() {
        let f = fixture(3);
        f.broker
            .publish(RoutingKey::EntityCreate, b"{\"oops\":true}".to_vec())
            .await
            .unwrap();

        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::DeadLettered);
        let records = f.dead_letters.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, DeadLetterReason::Serialization);
        assert!(records[0].command.is_none());
        assert_eq!(f.broker.depth(RoutingKey::EntityCreate).await.unwrap().unacked, 0);
    }

    #[tokio::test]
    async fn test_update_without_entity_retries_then_dead_letters() {
        let f = fixture(3);
        let command = Command::update(new_entity_id(), EntityFields::new("Stew", "beef", 90), 1);
        publish(&f.broker, &command).await;

        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Retrying);
        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Retrying);
        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::DeadLettered);

        let records = f.dead_letters.list().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, DeadLetterReason::ApplyConflict);
        assert_eq!(records[0].attempts, 3);
        assert_eq!(records[0].command_id(), Some(command.command_id));

        let metrics = f.processor.metrics().snapshot();
        assert_eq!(metrics.retried, 2);
        assert_eq!(metrics.dead_lettered, 1);
    }

    #[tokio::test]
    async fn test_update_applies_once_create_lands() {
        let f = fixture(5);
        let id = new_entity_id();
        let create = Command::create(id, EntityFields::new("Soup", "water", 10), 1);
        let update = Command::update(id, EntityFields::new("Stew", "beef", 90), 2);
        publish(&f.broker, &update).await;

        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Retrying);
        publish(&f.broker, &create).await;
        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::Applied);
        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Applied);

        assert_eq!(f.store.get(id).await.unwrap().unwrap().name, "Stew");
        assert!(f.dead_letters.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_older_update_never_overwrites_newer() {
        let f = fixture(3);
        let id = new_entity_id();
        publish(&f.broker, &Command::create(id, EntityFields::new("Soup", "water", 10), 1)).await;
        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::Applied);

        let v1 = Command::update(id, EntityFields::new("v1", "water", 10), 2);
        let v2 = Command::update(id, EntityFields::new("v2", "water", 10), 3);
        // v2 is delivered first, then v1 shows up as a late redelivery.
        publish(&f.broker, &v2).await;
        publish(&f.broker, &v1).await;
        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Applied);
        assert_eq!(next(&f, RoutingKey::EntityUpdate).await, CommandState::Applied);

        assert_eq!(f.store.get(id).await.unwrap().unwrap().name, "v2");
        assert_eq!(f.processor.metrics().snapshot().stale_skipped, 1);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone() {
        let f = fixture(3);
        let id = new_entity_id();
        let create = Command::create(id, EntityFields::new("Soup", "water", 10), 1);
        publish(&f.broker, &Command::delete(id, 2)).await;
        assert_eq!(next(&f, RoutingKey::EntityDelete).await, CommandState::Applied);

        // The create was submitted before the delete and arrives late.
        publish(&f.broker, &create).await;
        assert_eq!(next(&f, RoutingKey::EntityCreate).await, CommandState::Applied);
        assert!(f.store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_store_failure_dead_letters_with_store_reason() {
        let f = fixture(2);
        f.store.set_fail_writes(true);
        publish(&f.broker, &Command::delete(new_entity_id(), 1)).await;

        assert_eq!(next(&f, RoutingKey::EntityDelete).await, CommandState::Retrying);
        assert_eq!(next(&f, RoutingKey::EntityDelete).await, CommandState::DeadLettered);
        let records = f.dead_letters.list().await.unwrap();
        assert_eq!(records[0].reason, DeadLetterReason::Store);
    }

    #[tokio::test]
    async fn test_retry_publish_failure_requeues() {
        let f = fixture(3);
        let command = Command::update(new_entity_id(), EntityFields::new("a", "b", 1), 1);
        publish(&f.broker, &command).await;
        let delivery = f.broker.consume(RoutingKey::EntityUpdate).await.unwrap();

        f.broker.set_available(false);
        assert_eq!(f.processor.process(&delivery).await, CommandState::Retrying);
        f.broker.set_available(true);

        // Same message comes back, flagged as redelivered.
        let again = f.broker.consume(RoutingKey::EntityUpdate).await.unwrap();
        assert!(again.redelivered);
        assert_eq!(again.body, delivery.body);
    }

    #[tokio::test]
    async fn test_workers_stop_on_shutdown() {
        let f = fixture(3);
        let processor = Arc::new(f.processor);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handles = processor.spawn_workers(2, shutdown_rx);
        assert_eq!(handles.len(), 6);

        let id = new_entity_id();
        publish(&f.broker, &Command::create(id, EntityFields::new("Soup", "water", 10), 1)).await;
        for _ in 0..200 {
            if f.store.get(id).await.unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(f.store.get(id).await.unwrap().is_some());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(2), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
