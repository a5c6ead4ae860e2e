//! Durable broker on LMDB.
//!
//! Every queue lives in the `messages` database under the key
//! `[queue index: 1 byte][sequence: 8 bytes BE]`, so a prefix scan walks a
//! queue in publish order. Values are laid out as
//! `[visible_at: 8 bytes LE unix millis][flags: 1 byte][body]`.
//!
//! A message stays in the database until it is acked. Which messages are
//! currently handed out is tracked in memory only, so everything still in
//! the database after a restart is delivered again. Messages that had been
//! handed out before the restart come back flagged as redelivered.
//!
//! Dead-letter records share the environment in the `dead_letters`
//! database, keyed by record id.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use pantry_core::{BrokerError, PantryError, PantryResult, RoutingKey, StorageError};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::dead_letter::{merge_history, DeadLetterRecord, DeadLetterStore};
use crate::topology::Topology;
use crate::{Broker, Delivery, DeliveryTag, QueueDepth};

const FLAG_DELIVERED: u8 = 0b01;
const FLAG_REDELIVERED: u8 = 0b10;
const HEADER_LEN: usize = 9;

/// Error type for opening the durable broker.
#[derive(Debug, thiserror::Error)]
pub enum LmdbBrokerError {
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    #[error("Failed to open database: {0}")]
    DbOpen(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Too many bindings for one environment: {0}")]
    TooManyBindings(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LmdbBrokerError> for BrokerError {
    fn from(e: LmdbBrokerError) -> Self {
        BrokerError::Unavailable {
            reason: e.to_string(),
        }
    }
}

fn unavailable(e: heed::Error) -> BrokerError {
    BrokerError::Unavailable {
        reason: e.to_string(),
    }
}

fn message_key(queue: u8, sequence: u64) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = queue;
    key[1..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn key_sequence(key: &[u8]) -> Option<u64> {
    let raw: [u8; 8] = key.get(1..9)?.try_into().ok()?;
    Some(u64::from_be_bytes(raw))
}

struct StoredMessage<'a> {
    visible_at: i64,
    flags: u8,
    body: &'a [u8],
}

impl<'a> StoredMessage<'a> {
    fn parse(bytes: &'a [u8]) -> Option<Self> {
        let visible_at: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
        Some(Self {
            visible_at: i64::from_le_bytes(visible_at),
            flags: *bytes.get(8)?,
            body: bytes.get(HEADER_LEN..)?,
        })
    }

    fn encode(visible_at: i64, flags: u8, body: &[u8]) -> Vec<u8> {
        let mut value = Vec::with_capacity(HEADER_LEN + body.len());
        value.extend_from_slice(&visible_at.to_le_bytes());
        value.push(flags);
        value.extend_from_slice(body);
        value
    }
}

#[derive(Debug, Default)]
struct InFlight {
    /// tag -> (queue index, sequence)
    by_tag: HashMap<DeliveryTag, (u8, u64)>,
    /// sequences handed out, per queue index
    sequences: HashMap<u8, HashSet<u64>>,
}

struct Inner {
    env: Env,
    messages: Database<Bytes, Bytes>,
    dead_letters: Database<Bytes, Bytes>,
    topology: Topology,
    next_sequence: Mutex<u64>,
    in_flight: Mutex<InFlight>,
    notifiers: Vec<Notify>,
    poll_interval: Duration,
}

/// Durable LMDB-backed broker.
#[derive(Clone)]
pub struct LmdbBroker {
    inner: Arc<Inner>,
}

impl LmdbBroker {
    /// Open the broker under `path`, recovering any messages left behind by
    /// a previous process.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        topology: Topology,
        poll_interval: Duration,
    ) -> Result<Self, LmdbBrokerError> {
        if topology.bindings.len() > u8::MAX as usize {
            return Err(LmdbBrokerError::TooManyBindings(topology.bindings.len()));
        }
        std::fs::create_dir_all(&path)?;

        // SAFETY: the broker directory is owned by this broker alone.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(2)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbBrokerError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbBrokerError::Transaction(e.to_string()))?;
        let messages: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("messages"))
            .map_err(|e| LmdbBrokerError::DbOpen(e.to_string()))?;
        let dead_letters: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, Some("dead_letters"))
            .map_err(|e| LmdbBrokerError::DbOpen(e.to_string()))?;

        // Recover: find the highest sequence and flag delivered messages as
        // redelivered.
        let mut max_sequence = 0u64;
        let mut recovered = Vec::new();
        {
            let iter = messages
                .iter(&wtxn)
                .map_err(|e| LmdbBrokerError::Transaction(e.to_string()))?;
            for item in iter {
                let (key, value) = item.map_err(|e| LmdbBrokerError::Transaction(e.to_string()))?;
                if let Some(sequence) = key_sequence(key) {
                    max_sequence = max_sequence.max(sequence);
                }
                if let Some(stored) = StoredMessage::parse(value) {
                    if stored.flags & FLAG_DELIVERED != 0 {
                        recovered.push((
                            key.to_vec(),
                            StoredMessage::encode(stored.visible_at, FLAG_REDELIVERED, stored.body),
                        ));
                    }
                }
            }
        }
        let recovered_count = recovered.len();
        for (key, value) in recovered {
            messages
                .put(&mut wtxn, &key, &value)
                .map_err(|e| LmdbBrokerError::Transaction(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| LmdbBrokerError::Transaction(e.to_string()))?;

        if recovered_count > 0 {
            tracing::info!(recovered = recovered_count, "Requeued unacknowledged deliveries");
        }

        let notifiers = topology.bindings.iter().map(|_| Notify::new()).collect();
        Ok(Self {
            inner: Arc::new(Inner {
                env,
                messages,
                dead_letters,
                topology,
                next_sequence: Mutex::new(max_sequence + 1),
                in_flight: Mutex::new(InFlight::default()),
                notifiers,
                poll_interval,
            }),
        })
    }

    /// Dead-letter store sharing this broker's environment.
    pub fn dead_letter_store(&self) -> LmdbDeadLetterStore {
        LmdbDeadLetterStore {
            env: self.inner.env.clone(),
            db: self.inner.dead_letters,
        }
    }

    fn queue_index(&self, routing_key: RoutingKey) -> Result<u8, BrokerError> {
        let index = self.inner.topology.index_of(routing_key)?;
        u8::try_from(index).map_err(|_| BrokerError::Unroutable {
            routing_key: routing_key.to_string(),
        })
    }

    fn in_flight(&self) -> Result<std::sync::MutexGuard<'_, InFlight>, BrokerError> {
        self.inner.in_flight.lock().map_err(|_| BrokerError::Unavailable {
            reason: "in-flight lock poisoned".to_string(),
        })
    }

    fn store(&self, routing_key: RoutingKey, body: &[u8], visible_at: i64) -> Result<(), BrokerError> {
        let queue = self.queue_index(routing_key)?;
        // Holding the sequence lock across the commit keeps keys in publish order.
        let mut next = self.inner.next_sequence.lock().map_err(|_| BrokerError::Unavailable {
            reason: "sequence lock poisoned".to_string(),
        })?;
        let mut wtxn = self.inner.env.write_txn().map_err(unavailable)?;
        self.inner
            .messages
            .put(
                &mut wtxn,
                &message_key(queue, *next),
                &StoredMessage::encode(visible_at, 0, body),
            )
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)?;
        *next += 1;
        drop(next);

        if let Some(notify) = self.inner.notifiers.get(queue as usize) {
            notify.notify_one();
        }
        Ok(())
    }

    /// Try to hand out the first visible message. Returns the delay until
    /// the next delayed message otherwise.
    fn try_take(&self, routing_key: RoutingKey, queue: u8) -> Result<Result<Delivery, Option<Duration>>, BrokerError> {
        let now = Utc::now().timestamp_millis();
        let mut guard = self.in_flight()?;
        let in_flight: &mut InFlight = &mut guard;
        let taken = in_flight.sequences.entry(queue).or_default();

        let mut wtxn = self.inner.env.write_txn().map_err(unavailable)?;
        let mut found = None;
        let mut next_visible: Option<i64> = None;
        {
            let iter = self
                .inner
                .messages
                .prefix_iter(&wtxn, &[queue])
                .map_err(unavailable)?;
            for item in iter {
                let (key, value) = item.map_err(unavailable)?;
                let Some(sequence) = key_sequence(key) else { continue };
                if taken.contains(&sequence) {
                    continue;
                }
                let Some(stored) = StoredMessage::parse(value) else { continue };
                if stored.visible_at > now {
                    next_visible = Some(next_visible.map_or(stored.visible_at, |v| v.min(stored.visible_at)));
                    continue;
                }
                found = Some((sequence, stored.visible_at, stored.flags, stored.body.to_vec()));
                break;
            }
        }

        let Some((sequence, visible_at, flags, body)) = found else {
            let wait = next_visible.map(|at| Duration::from_millis((at - now).max(0) as u64));
            return Ok(Err(wait));
        };

        self.inner
            .messages
            .put(
                &mut wtxn,
                &message_key(queue, sequence),
                &StoredMessage::encode(visible_at, flags | FLAG_DELIVERED, &body),
            )
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)?;

        taken.insert(sequence);
        in_flight.by_tag.insert(sequence, (queue, sequence));

        Ok(Ok(Delivery {
            tag: sequence,
            routing_key,
            body,
            redelivered: flags & FLAG_REDELIVERED != 0,
        }))
    }

    fn settle(&self, delivery: &Delivery) -> Result<(u8, u64), BrokerError> {
        let mut in_flight = self.in_flight()?;
        let (queue, sequence) = in_flight
            .by_tag
            .remove(&delivery.tag)
            .ok_or(BrokerError::UnknownDelivery { tag: delivery.tag })?;
        if let Some(taken) = in_flight.sequences.get_mut(&queue) {
            taken.remove(&sequence);
        }
        Ok((queue, sequence))
    }
}

#[async_trait]
impl Broker for LmdbBroker {
    fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    async fn publish(&self, routing_key: RoutingKey, body: Vec<u8>) -> Result<(), BrokerError> {
        self.store(routing_key, &body, Utc::now().timestamp_millis())
    }

    async fn publish_delayed(
        &self,
        routing_key: RoutingKey,
        body: Vec<u8>,
        delay: Duration,
    ) -> Result<(), BrokerError> {
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        self.store(routing_key, &body, visible_at)
    }

    async fn consume(&self, routing_key: RoutingKey) -> Result<Delivery, BrokerError> {
        let queue = self.queue_index(routing_key)?;
        loop {
            let wait = match self.try_take(routing_key, queue)? {
                Ok(delivery) => return Ok(delivery),
                Err(wait) => wait
                    .unwrap_or(self.inner.poll_interval)
                    .min(self.inner.poll_interval),
            };
            match self.inner.notifiers.get(queue as usize) {
                Some(notify) => {
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        let (queue, sequence) = self.settle(delivery)?;
        let mut wtxn = self.inner.env.write_txn().map_err(unavailable)?;
        self.inner
            .messages
            .delete(&mut wtxn, &message_key(queue, sequence))
            .map_err(unavailable)?;
        wtxn.commit().map_err(unavailable)
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        let (queue, sequence) = self.settle(delivery)?;
        let key = message_key(queue, sequence);
        let mut wtxn = self.inner.env.write_txn().map_err(unavailable)?;
        if requeue {
            let rewritten = self
                .inner
                .messages
                .get(&wtxn, &key)
                .map_err(unavailable)?
                .and_then(StoredMessage::parse)
                .map(|stored| StoredMessage::encode(stored.visible_at, FLAG_REDELIVERED, stored.body));
            if let Some(value) = rewritten {
                self.inner.messages.put(&mut wtxn, &key, &value).map_err(unavailable)?;
            }
        } else {
            self.inner.messages.delete(&mut wtxn, &key).map_err(unavailable)?;
        }
        wtxn.commit().map_err(unavailable)?;

        if let Some(notify) = self.inner.notifiers.get(queue as usize) {
            notify.notify_one();
        }
        Ok(())
    }

    async fn depth(&self, routing_key: RoutingKey) -> Result<QueueDepth, BrokerError> {
        let queue = self.queue_index(routing_key)?;
        let now = Utc::now().timestamp_millis();
        let unacked = self
            .in_flight()?
            .sequences
            .get(&queue)
            .map(|taken| taken.len() as u64)
            .unwrap_or(0);

        let rtxn = self.inner.env.read_txn().map_err(unavailable)?;
        let mut depth = QueueDepth {
            unacked,
            ..QueueDepth::default()
        };
        let mut total = 0u64;
        for item in self.inner.messages.prefix_iter(&rtxn, &[queue]).map_err(unavailable)? {
            let (_, value) = item.map_err(unavailable)?;
            total += 1;
            if StoredMessage::parse(value).is_some_and(|stored| stored.visible_at > now) {
                depth.delayed += 1;
            }
        }
        depth.ready = total.saturating_sub(depth.delayed).saturating_sub(unacked);
        Ok(depth)
    }
}

/// Dead-letter store in the broker's LMDB environment.
#[derive(Clone)]
pub struct LmdbDeadLetterStore {
    env: Env,
    db: Database<Bytes, Bytes>,
}

fn store_err(e: impl std::fmt::Display) -> PantryError {
    PantryError::Store(StorageError::TransactionFailed {
        reason: e.to_string(),
    })
}

#[async_trait]
impl DeadLetterStore for LmdbDeadLetterStore {
    async fn record(&self, record: DeadLetterRecord) -> PantryResult<()> {
        let mut wtxn = self.env.write_txn().map_err(store_err)?;
        let previous = self
            .db
            .get(&wtxn, record.id.as_bytes())
            .map_err(store_err)?
            .and_then(|bytes| serde_json::from_slice::<DeadLetterRecord>(bytes).ok());
        let merged = merge_history(record, previous.as_ref());
        let json = serde_json::to_vec(&merged)?;
        self.db
            .put(&mut wtxn, merged.id.as_bytes(), &json)
            .map_err(store_err)?;
        wtxn.commit().map_err(store_err)
    }

    async fn list(&self) -> PantryResult<Vec<DeadLetterRecord>> {
        let rtxn = self.env.read_txn().map_err(store_err)?;
        let mut records = Vec::new();
        for item in self.db.iter(&rtxn).map_err(store_err)? {
            let (_, bytes) = item.map_err(store_err)?;
            records.push(serde_json::from_slice::<DeadLetterRecord>(bytes)?);
        }
        records.sort_by_key(|record| record.dead_lettered_at);
        Ok(records)
    }

    async fn get(&self, id: Uuid) -> PantryResult<Option<DeadLetterRecord>> {
        let rtxn = self.env.read_txn().map_err(store_err)?;
        match self.db.get(&rtxn, id.as_bytes()).map_err(store_err)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(bytes)?)),
            None => Ok(None),
        }
    }

    async fn mark_replayed(&self, id: Uuid) -> PantryResult<DeadLetterRecord> {
        let mut wtxn = self.env.write_txn().map_err(store_err)?;
        let mut record: DeadLetterRecord = match self.db.get(&wtxn, id.as_bytes()).map_err(store_err)? {
            Some(bytes) => serde_json::from_slice(bytes)?,
            None => return Err(PantryError::NotFound { id }),
        };
        record.replay_count += 1;
        record.last_replayed_at = Some(Utc::now());
        let json = serde_json::to_vec(&record)?;
        self.db.put(&mut wtxn, id.as_bytes(), &json).map_err(store_err)?;
        wtxn.commit().map_err(store_err)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::DeadLetterReason;
    use pantry_core::{Command, EntityFields};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> LmdbBroker {
        LmdbBroker::open(dir.path(), 10, Topology::entity_default(), Duration::from_millis(10))
            .expect("broker should open")
    }

    #[tokio::test]
    async fn test_publish_consume_ack() {
        let dir = TempDir::new().expect("tempdir should be created");
        let broker = open(&dir);
        broker
            .publish(RoutingKey::EntityCreate, b"one".to_vec())
            .await
            .expect("publish should succeed");
        broker
            .publish(RoutingKey::EntityCreate, b"two".to_vec())
            .await
            .expect("publish should succeed");

        let first = broker.consume(RoutingKey::EntityCreate).await.expect("consume should succeed");
        let second = broker.consume(RoutingKey::EntityCreate).await.expect("consume should succeed");
        assert_eq!(first.body, b"one".to_vec());
        assert_eq!(second.body, b"two".to_vec());

        let depth = broker.depth(RoutingKey::EntityCreate).await.expect("depth should succeed");
        assert_eq!(depth.unacked, 2);
        assert_eq!(depth.ready, 0);

        broker.ack(&first).await.expect("ack should succeed");
        broker.ack(&second).await.expect("ack should succeed");
        assert_eq!(
            broker.depth(RoutingKey::EntityCreate).await.expect("depth should succeed"),
            QueueDepth::default()
        );
    }

    #[tokio::test]
    async fn test_unacked_survive_restart_as_redelivered() {
        let dir = TempDir::new().expect("tempdir should be created");
        {
            let broker = open(&dir);
            broker
                .publish(RoutingKey::EntityUpdate, b"handed-out".to_vec())
                .await
                .expect("publish should succeed");
            broker
                .publish(RoutingKey::EntityUpdate, b"waiting".to_vec())
                .await
                .expect("publish should succeed");
            let _delivery = broker.consume(RoutingKey::EntityUpdate).await.expect("consume should succeed");
            // Dropped without ack.
        }

        let broker = open(&dir);
        let first = broker.consume(RoutingKey::EntityUpdate).await.expect("consume should succeed");
        assert_eq!(first.body, b"handed-out".to_vec());
        assert!(first.redelivered);
        let second = broker.consume(RoutingKey::EntityUpdate).await.expect("consume should succeed");
        assert_eq!(second.body, b"waiting".to_vec());
        assert!(!second.redelivered);

        broker
            .publish(RoutingKey::EntityUpdate, b"new".to_vec())
            .await
            .expect("publish should succeed");
        let third = broker.consume(RoutingKey::EntityUpdate).await.expect("consume should succeed");
        assert_eq!(third.body, b"new".to_vec());
    }

    #[tokio::test]
    async fn test_nack_requeue_and_drop() {
        let dir = TempDir::new().expect("tempdir should be created");
        let broker = open(&dir);
        broker
            .publish(RoutingKey::EntityDelete, b"x".to_vec())
            .await
            .expect("publish should succeed");

        let delivery = broker.consume(RoutingKey::EntityDelete).await.expect("consume should succeed");
        broker.nack(&delivery, true).await.expect("nack should succeed");
        let again = broker.consume(RoutingKey::EntityDelete).await.expect("consume should succeed");
        assert!(again.redelivered);

        broker.nack(&again, false).await.expect("nack should succeed");
        assert_eq!(
            broker.depth(RoutingKey::EntityDelete).await.expect("depth should succeed"),
            QueueDepth::default()
        );
    }

    #[tokio::test]
    async fn test_delayed_message_waits() {
        let dir = TempDir::new().expect("tempdir should be created");
        let broker = open(&dir);
        broker
            .publish_delayed(RoutingKey::EntityUpdate, b"later".to_vec(), Duration::from_millis(60))
            .await
            .expect("publish should succeed");
        assert_eq!(
            broker.depth(RoutingKey::EntityUpdate).await.expect("depth should succeed").delayed,
            1
        );

        let started = std::time::Instant::now();
        let delivery = broker.consume(RoutingKey::EntityUpdate).await.expect("consume should succeed");
        assert!(started.elapsed() >= Duration::from_millis(40));
        assert_eq!(delivery.body, b"later".to_vec());
    }

    #[tokio::test]
    async fn test_dead_letters_persist() {
        let dir = TempDir::new().expect("tempdir should be created");
        let command = Command::update(Uuid::now_v7(), EntityFields::new("a", "b", 1), 9);
        {
            let broker = open(&dir);
            let store = broker.dead_letter_store();
            store
                .record(DeadLetterRecord::exhausted(
                    command.clone(),
                    b"{}".to_vec(),
                    DeadLetterReason::ApplyConflict,
                    "entity absent",
                ))
                .await
                .expect("record should succeed");
            store.mark_replayed(command.command_id).await.expect("replay mark should succeed");
        }

        let broker = open(&dir);
        let store = broker.dead_letter_store();
        let records = store.list().await.expect("list should succeed");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command.as_ref(), Some(&command));
        assert_eq!(records[0].replay_count, 1);
        assert!(store.get(Uuid::now_v7()).await.expect("get should succeed").is_none());
    }
}
