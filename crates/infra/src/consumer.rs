//! Consumer-group event consumer with bounded retry and dead-lettering.
//!
//! ## Delivery lifecycle
//!
//! Each entry read from the group reaches exactly one terminal disposition
//! before it is acknowledged:
//!
//! - **Handled**: the handler returned `Ok` → ack
//! - **Retried**: the handler failed and the incremented retry count is below
//!   `max_retries` → a copy goes to `<queue>:retry`, then ack
//! - **Dead-lettered**: the retry budget is exhausted → a copy plus
//!   `failed_at`/`queue_name`/`error` goes to `<queue>:dlq`, then ack
//!
//! Acking on failure keeps the group's pending list bounded; the retry lives on
//! as a new entry in a separate stream. Nothing consumes `<queue>:retry`
//! automatically: start a [`EventConsumer::retry_processor`] for queues that
//! need retries reprocessed.
//!
//! Entries that cannot be decoded are logged and take the same failure path;
//! a body that is not an envelope object is wrapped as `{"raw": ..., "retry": n}`
//! so it keeps its retry count. A handler that panics is treated as a failed
//! handler.
//!
//! An entry whose retry/dead-letter write or ack failed stays in the group's
//! pending list. Every poll first claims pending entries idle for longer than
//! `claim_idle` (from any consumer of the group, including crashed ones) and
//! settles them before reading new entries.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use tradeflow_events::{EventEnvelope, QueueName};

use crate::config::{
    DEFAULT_BATCH_SIZE, DEFAULT_BLOCK_TIMEOUT, DEFAULT_CLAIM_IDLE, DEFAULT_GROUP,
    DEFAULT_MAX_LEN, DEFAULT_MAX_RETRIES, default_consumer_name,
};
use crate::error::QueueError;
use crate::stream::{self, EntryId, StreamEntry, StreamError, StreamStore, fields};

/// Pause after a failed read before polling again.
const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// Pause after an empty non-blocking poll.
pub(crate) const IDLE_PAUSE: Duration = Duration::from_millis(100);

/// Business logic invoked for each delivered event.
///
/// Delivery is at-least-once, so handlers should be idempotent.
pub trait EventHandler: Send + Sync {
    fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventEnvelope) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        self(envelope)
    }
}

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer group shared by every instance processing the queue.
    pub group: String,
    /// Name of this instance within the group.
    pub consumer: String,
    /// Entries requested per read
    pub batch_size: usize,
    /// How long a read waits for new entries; also bounds shutdown latency.
    pub block_timeout: Duration,
    /// Failed deliveries before dead-lettering.
    pub max_retries: u32,
    /// Entries of one batch dispatched in parallel (1 = sequential).
    pub concurrency: usize,
    /// Length bound applied to retry/dead-letter appends.
    pub max_len: Option<usize>,
    /// Pending entries idle this long are claimed and reprocessed.
    pub claim_idle: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP.to_string(),
            consumer: default_consumer_name(),
            batch_size: DEFAULT_BATCH_SIZE,
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            concurrency: 1,
            max_len: Some(DEFAULT_MAX_LEN),
            claim_idle: DEFAULT_CLAIM_IDLE,
        }
    }
}

impl ConsumerConfig {
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }
}

/// Terminal outcome of one delivered entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Retried,
    DeadLettered,
    /// No terminal write succeeded; the entry stays in the pending list.
    Unresolved,
}

/// Summary of a single poll iteration.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    pub delivered: usize,
    pub acked: usize,
    pub retried: usize,
    pub dead_lettered: usize,
    pub unresolved: usize,
}

impl PollOutcome {
    fn record(&mut self, disposition: Disposition) {
        self.delivered += 1;
        match disposition {
            Disposition::Acked => self.acked += 1,
            Disposition::Retried => self.retried += 1,
            Disposition::DeadLettered => self.dead_lettered += 1,
            Disposition::Unresolved => self.unresolved += 1,
        }
    }
}

/// Decoded form of a delivered entry.
enum Delivery {
    Event(EventEnvelope),
    /// JSON object that is not a valid envelope; still carries a retry count.
    MalformedObject {
        object: Map<String, JsonValue>,
        reason: String,
    },
    /// Missing field, invalid JSON or non-object JSON.
    Undecodable { raw: String, reason: String },
}

impl Delivery {
    fn decode(entry: &StreamEntry) -> Self {
        let Some(raw) = entry.field(fields::EVENT) else {
            return Delivery::Undecodable {
                raw: serde_json::to_string(&entry.fields).unwrap_or_default(),
                reason: format!("entry has no '{}' field", fields::EVENT),
            };
        };

        let value: JsonValue = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Delivery::Undecodable {
                    raw: raw.to_string(),
                    reason: format!("invalid JSON: {e}"),
                };
            }
        };

        match serde_json::from_value::<EventEnvelope>(value.clone()) {
            Ok(envelope) => Delivery::Event(envelope),
            Err(e) => match value {
                JsonValue::Object(object) => Delivery::MalformedObject {
                    object,
                    reason: format!("invalid envelope: {e}"),
                },
                _ => Delivery::Undecodable {
                    raw: raw.to_string(),
                    reason: format!("invalid envelope: {e}"),
                },
            },
        }
    }
}

/// Copy of a failed delivery ready to be appended elsewhere.
struct Republish {
    body: String,
    retry: u32,
}

/// Consumer bound to one queue and one consumer group.
#[derive(Debug, Clone)]
pub struct EventConsumer<S> {
    store: S,
    /// Logical queue; names the retry and dead-letter streams.
    queue: QueueName,
    /// Stream actually read from.
    source: QueueName,
    config: ConsumerConfig,
}

impl<S: StreamStore> EventConsumer<S> {
    /// Consumer for a primary queue.
    pub fn new(store: S, queue: &str, config: ConsumerConfig) -> Result<Self, QueueError> {
        let queue = QueueName::new(queue)?;
        Ok(Self {
            store,
            source: queue.clone(),
            queue,
            config,
        })
    }

    /// Consumer that reprocesses `<queue>:retry`.
    ///
    /// Failures are routed to the same `<queue>:retry` / `<queue>:dlq` streams
    /// as the primary consumer, so the retry budget is shared.
    pub fn retry_processor(store: S, queue: &str, config: ConsumerConfig) -> Result<Self, QueueError> {
        let queue = QueueName::new(queue)?;
        Ok(Self {
            store,
            source: queue.retry(),
            queue,
            config,
        })
    }

    pub fn queue(&self) -> &QueueName {
        &self.queue
    }

    pub fn source(&self) -> &QueueName {
        &self.source
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Create the consumer group at the start of the stream (idempotent).
    pub fn ensure_group(&self) -> Result<(), QueueError> {
        stream::ensure_group(&self.store, self.source.as_str(), &self.config.group)
            .map_err(|e| QueueError::store(self.source.as_str(), e))
    }

    /// Settle one batch: pending entries idle past `claim_idle` if there are
    /// any, otherwise newly read entries.
    pub fn poll_once<H>(&self, handler: &H) -> Result<PollOutcome, QueueError>
    where
        H: EventHandler + ?Sized,
    {
        let claimed = self
            .store
            .claim_idle(
                self.source.as_str(),
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle,
                self.config.batch_size,
            )
            .map_err(|e| QueueError::store(self.source.as_str(), e))?;

        let entries = if !claimed.is_empty() {
            info!(
                queue = %self.source,
                claimed = claimed.len(),
                "reclaimed idle pending entries"
            );
            claimed
        } else {
            self.store
                .read_group(
                    self.source.as_str(),
                    &self.config.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block_timeout,
                )
                .map_err(|e| QueueError::store(self.source.as_str(), e))?
        };

        let mut outcome = PollOutcome::default();
        for disposition in self.dispatch_batch(&entries, handler) {
            outcome.record(disposition);
        }
        Ok(outcome)
    }

    fn dispatch_batch<H>(&self, entries: &[StreamEntry], handler: &H) -> Vec<Disposition>
    where
        H: EventHandler + ?Sized,
    {
        let workers = self.config.concurrency.min(entries.len());
        if workers <= 1 {
            return entries.iter().map(|e| self.dispatch(e, handler)).collect();
        }

        let chunk = entries.len().div_ceil(workers);
        thread::scope(|scope| {
            let tasks: Vec<_> = entries
                .chunks(chunk)
                .map(|part| {
                    scope.spawn(move || {
                        part.iter()
                            .map(|e| self.dispatch(e, handler))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            tasks
                .into_iter()
                .zip(entries.chunks(chunk))
                .flat_map(|(task, part)| self.chunk_dispositions(task.join(), part))
                .collect()
        })
    }

    /// Dispositions of one dispatch thread. A thread that died mid-batch
    /// leaves its entries pending, to be claimed again later.
    fn chunk_dispositions(
        &self,
        joined: thread::Result<Vec<Disposition>>,
        part: &[StreamEntry],
    ) -> Vec<Disposition> {
        match joined {
            Ok(dispositions) => dispositions,
            Err(payload) => {
                error!(
                    queue = %self.source,
                    entries = part.len(),
                    panic = %panic_message(&payload),
                    "dispatch thread panicked; entries left pending"
                );
                vec![Disposition::Unresolved; part.len()]
            }
        }
    }

    fn dispatch<H>(&self, entry: &StreamEntry, handler: &H) -> Disposition
    where
        H: EventHandler + ?Sized,
    {
        let delivery = Delivery::decode(entry);

        let failure = match &delivery {
            Delivery::Event(envelope) => {
                match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
                    Ok(Ok(())) => None,
                    Ok(Err(e)) => Some(format!("{e:#}")),
                    Err(payload) => Some(format!("handler panicked: {}", panic_message(&payload))),
                }
            }
            Delivery::MalformedObject { reason, .. } | Delivery::Undecodable { reason, .. } => {
                warn!(
                    queue = %self.source,
                    entry_id = %entry.id,
                    reason = %reason,
                    "failed to decode event"
                );
                Some(reason.clone())
            }
        };

        match failure {
            None => {
                if self.ack(entry.id) {
                    Disposition::Acked
                } else {
                    Disposition::Unresolved
                }
            }
            Some(reason) => self.settle_failure(entry, delivery, &reason),
        }
    }

    fn settle_failure(&self, entry: &StreamEntry, delivery: Delivery, reason: &str) -> Disposition {
        let republish = match Self::republish(delivery) {
            Ok(r) => r,
            Err(e) => {
                error!(queue = %self.queue, entry_id = %entry.id, error = %e, "failed to re-encode event");
                return Disposition::Unresolved;
            }
        };

        let (target, disposition) = if republish.retry < self.config.max_retries {
            (self.queue.retry(), Disposition::Retried)
        } else {
            (self.queue.dlq(), Disposition::DeadLettered)
        };

        let failed_at = Utc::now().timestamp().to_string();
        let mut values: Vec<(&str, &str)> = vec![(fields::EVENT, republish.body.as_str())];
        if disposition == Disposition::DeadLettered {
            values.push((fields::FAILED_AT, failed_at.as_str()));
            values.push((fields::QUEUE_NAME, self.queue.as_str()));
            values.push((fields::ERROR, reason));
        }

        if let Err(e) = self.store.append(target.as_str(), &values, self.config.max_len) {
            error!(
                queue = %self.queue,
                target = %target,
                entry_id = %entry.id,
                error = %e,
                "failed to route failed event; leaving it pending"
            );
            return Disposition::Unresolved;
        }

        match disposition {
            Disposition::Retried => warn!(
                queue = %self.queue,
                entry_id = %entry.id,
                retry = republish.retry,
                error = %reason,
                "event handling failed; scheduled for retry"
            ),
            _ => error!(
                queue = %self.queue,
                entry_id = %entry.id,
                retry = republish.retry,
                error = %reason,
                "event handling failed; moved to dead-letter queue"
            ),
        }

        if self.ack(entry.id) {
            disposition
        } else {
            Disposition::Unresolved
        }
    }

    fn republish(delivery: Delivery) -> Result<Republish, serde_json::Error> {
        Ok(match delivery {
            Delivery::Event(envelope) => {
                let retry = envelope.retry_count() + 1;
                Republish {
                    body: serde_json::to_string(&envelope.with_retry(retry))?,
                    retry,
                }
            }
            Delivery::MalformedObject { object, .. } => Self::bump_retry(object)?,
            Delivery::Undecodable { raw, .. } => {
                let mut object = Map::new();
                object.insert("raw".to_string(), JsonValue::String(raw));
                Self::bump_retry(object)?
            }
        })
    }

    fn bump_retry(mut object: Map<String, JsonValue>) -> Result<Republish, serde_json::Error> {
        let previous = object
            .get("retry")
            .and_then(JsonValue::as_u64)
            .and_then(|r| u32::try_from(r).ok())
            .unwrap_or(0);
        let retry = previous.saturating_add(1);
        object.insert("retry".to_string(), JsonValue::from(retry));
        Ok(Republish {
            body: serde_json::to_string(&object)?,
            retry,
        })
    }

    fn ack(&self, id: EntryId) -> bool {
        match self.store.ack(self.source.as_str(), &self.config.group, &[id]) {
            Ok(_) => true,
            Err(e) => {
                error!(queue = %self.source, entry_id = %id, error = %e, "failed to acknowledge entry");
                false
            }
        }
    }

    /// Poll until a shutdown signal arrives (or the sender is dropped).
    ///
    /// The signal is observed between reads, so exit takes at most one
    /// `block_timeout` plus the time to finish the current batch. Store errors
    /// are logged and the loop keeps going.
    pub fn run<H>(&self, handler: &H, shutdown: &mpsc::Receiver<()>)
    where
        H: EventHandler + ?Sized,
    {
        info!(
            queue = %self.queue,
            source = %self.source,
            group = %self.config.group,
            consumer = %self.config.consumer,
            "event consumer started"
        );

        let mut group_ready = false;
        loop {
            match shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break,
                Err(TryRecvError::Empty) => {}
            }

            if !group_ready {
                match self.ensure_group() {
                    Ok(()) => group_ready = true,
                    Err(e) => {
                        error!(queue = %self.source, error = %e, "failed to create consumer group");
                        if stop_requested(shutdown, ERROR_BACKOFF) {
                            break;
                        }
                        continue;
                    }
                }
            }

            match self.poll_once(handler) {
                Ok(outcome) if outcome.delivered > 0 => debug!(
                    queue = %self.source,
                    delivered = outcome.delivered,
                    acked = outcome.acked,
                    retried = outcome.retried,
                    dead_lettered = outcome.dead_lettered,
                    "batch processed"
                ),
                Ok(_) => {
                    // A non-blocking read returns at once; don't spin on an empty stream.
                    if self.config.block_timeout.is_zero() && stop_requested(shutdown, IDLE_PAUSE) {
                        break;
                    }
                }
                Err(e) => {
                    error!(queue = %self.source, error = %e, "failed to read from stream");
                    // Stream or group may have been deleted underneath us.
                    if matches!(e.stream_error(), Some(StreamError::NoSuchGroup { .. })) {
                        group_ready = false;
                    }
                    if stop_requested(shutdown, ERROR_BACKOFF) {
                        break;
                    }
                }
            }
        }

        info!(queue = %self.queue, source = %self.source, "event consumer stopped");
    }
}

impl<S: StreamStore + 'static> EventConsumer<S> {
    /// Run the consume loop on a dedicated thread.
    pub fn spawn<H>(self, handler: H) -> Result<ConsumerHandle, QueueError>
    where
        H: EventHandler + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = format!("consumer:{}", self.source);

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(&handler, &shutdown_rx))?;

        Ok(ConsumerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

/// Handle to stop and join a spawned consumer.
///
/// Dropping the handle also stops the consumer (at its next poll boundary).
#[derive(Debug)]
pub struct ConsumerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl ConsumerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Signal the loop to stop without waiting for it.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    /// Signal the loop to stop and wait for its thread to exit.
    pub fn shutdown(mut self) {
        self.stop();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                error!(consumer = %self.name, "consumer thread panicked");
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }
}

/// Wait up to `wait` for a shutdown signal.
fn stop_requested(shutdown: &mpsc::Receiver<()>, wait: Duration) -> bool {
    match shutdown.recv_timeout(wait) {
        Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        Err(RecvTimeoutError::Timeout) => false,
    }
}

fn panic_message(payload: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
