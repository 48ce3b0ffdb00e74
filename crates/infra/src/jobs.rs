//! Generic job API for ad hoc payloads.
//!
//! A lighter alternative to [`crate::consumer::EventConsumer`] for work that
//! doesn't warrant a typed envelope. Callers choosing between the two should
//! know that this path is **fire-and-forget**:
//!
//! - handler errors (and panics) are logged, never retried
//! - every delivered entry is acknowledged, whatever the outcome
//! - nothing is ever written to a retry or dead-letter stream
//!
//! Entries carry two fields: `job_data` (a JSON object) and `created_at`
//! (unix seconds).

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value as JsonValue};
use tracing::{debug, error, info, warn};

use tradeflow_events::QueueName;

use crate::config::{DEFAULT_BLOCK_TIMEOUT, DEFAULT_MAX_LEN};
use crate::consumer::IDLE_PAUSE;
use crate::error::QueueError;
use crate::stream::{self, EntryId, StreamEntry, StreamError, StreamStore, fields};

/// Arbitrary key/value payload of a job.
pub type JobData = Map<String, JsonValue>;

const ERROR_BACKOFF: Duration = Duration::from_millis(500);

/// A job as delivered to a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub entry_id: EntryId,
    pub data: JobData,
    /// Publish time in unix seconds, when present and well-formed.
    pub created_at: Option<i64>,
}

impl Job {
    fn decode(entry: &StreamEntry) -> Result<Self, String> {
        let raw = entry
            .field(fields::JOB_DATA)
            .ok_or_else(|| format!("entry has no '{}' field", fields::JOB_DATA))?;
        let data: JobData =
            serde_json::from_str(raw).map_err(|e| format!("invalid job data: {e}"))?;

        Ok(Self {
            entry_id: entry.id,
            data,
            created_at: entry.field(fields::CREATED_AT).and_then(|v| v.parse().ok()),
        })
    }
}

/// Business logic invoked for each job.
pub trait JobHandler: Send + Sync {
    fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

impl<F> JobHandler for F
where
    F: Fn(&Job) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, job: &Job) -> anyhow::Result<()> {
        self(job)
    }
}

#[derive(Debug, Clone)]
pub struct JobQueue<S> {
    store: S,
    max_len: Option<usize>,
    block_timeout: Duration,
}

impl<S: StreamStore> JobQueue<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            max_len: Some(DEFAULT_MAX_LEN),
            block_timeout: DEFAULT_BLOCK_TIMEOUT,
        }
    }

    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    /// How long each read waits; bounds cancellation latency.
    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout = timeout;
        self
    }

    /// Append a job stamped with the current time.
    pub fn publish_job(&self, queue: &str, data: &JobData) -> Result<EntryId, QueueError> {
        let queue = QueueName::new(queue)?;
        let payload =
            serde_json::to_string(data).map_err(|e| QueueError::serialization(queue.as_str(), e))?;
        let created_at = Utc::now().timestamp().to_string();

        let id = self
            .store
            .append(
                queue.as_str(),
                &[
                    (fields::JOB_DATA, payload.as_str()),
                    (fields::CREATED_AT, created_at.as_str()),
                ],
                self.max_len,
            )
            .map_err(|e| QueueError::store(queue.as_str(), e))?;

        debug!(queue = %queue, entry_id = %id, "job published");
        Ok(id)
    }

    /// Consume jobs forever.
    ///
    /// Only returns (with an error) when the consumer group cannot be created
    /// at startup. A group that disappears later is recreated in the loop.
    pub fn consume_jobs<H>(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        handler: &H,
    ) -> Result<(), QueueError>
    where
        H: JobHandler + ?Sized,
    {
        self.consume(queue, group, consumer, handler, None)
    }

    /// Consume jobs until `shutdown` receives a signal or its sender is dropped.
    ///
    /// Cancellation is checked before each read and results in `Ok(())`; a read
    /// already blocking finishes first, so exit takes up to one block timeout.
    pub fn consume_jobs_until<H>(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        handler: &H,
        shutdown: &mpsc::Receiver<()>,
    ) -> Result<(), QueueError>
    where
        H: JobHandler + ?Sized,
    {
        self.consume(queue, group, consumer, handler, Some(shutdown))
    }

    fn consume<H>(
        &self,
        queue: &str,
        group: &str,
        consumer: &str,
        handler: &H,
        shutdown: Option<&mpsc::Receiver<()>>,
    ) -> Result<(), QueueError>
    where
        H: JobHandler + ?Sized,
    {
        let queue = QueueName::new(queue)?;
        stream::ensure_group(&self.store, queue.as_str(), group)
            .map_err(|e| QueueError::store(queue.as_str(), e))?;

        info!(queue = %queue, group, consumer, "job consumer started");

        let mut group_ready = true;
        loop {
            if let Some(rx) = shutdown {
                match rx.try_recv() {
                    Ok(()) | Err(TryRecvError::Disconnected) => {
                        info!(queue = %queue, consumer, "job consumer cancelled");
                        return Ok(());
                    }
                    Err(TryRecvError::Empty) => {}
                }
            }

            if !group_ready {
                match stream::ensure_group(&self.store, queue.as_str(), group) {
                    Ok(()) => {
                        info!(queue = %queue, group, "job consumer group recreated");
                        group_ready = true;
                    }
                    Err(e) => {
                        error!(queue = %queue, error = %e, "failed to create consumer group");
                        if Self::pause(shutdown, ERROR_BACKOFF) {
                            info!(queue = %queue, consumer, "job consumer cancelled");
                            return Ok(());
                        }
                        continue;
                    }
                }
            }

            let entries =
                match self
                    .store
                    .read_group(queue.as_str(), group, consumer, 1, self.block_timeout)
                {
                    Ok(entries) => entries,
                    Err(e) => {
                        error!(queue = %queue, error = %e, "failed to read jobs");
                        if matches!(e, StreamError::NoSuchGroup { .. }) {
                            group_ready = false;
                        }
                        if Self::pause(shutdown, ERROR_BACKOFF) {
                            info!(queue = %queue, consumer, "job consumer cancelled");
                            return Ok(());
                        }
                        continue;
                    }
                };

            // A non-blocking read returns at once; don't spin on an empty stream.
            if entries.is_empty() && self.block_timeout.is_zero() && Self::pause(shutdown, IDLE_PAUSE) {
                info!(queue = %queue, consumer, "job consumer cancelled");
                return Ok(());
            }

            for entry in &entries {
                self.process(&queue, group, entry, handler);
            }
        }
    }

    fn process<H>(&self, queue: &QueueName, group: &str, entry: &StreamEntry, handler: &H)
    where
        H: JobHandler + ?Sized,
    {
        match Job::decode(entry) {
            Ok(job) => match panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&job))) {
                Ok(Ok(())) => debug!(queue = %queue, entry_id = %entry.id, "job processed"),
                Ok(Err(e)) => {
                    error!(queue = %queue, entry_id = %entry.id, error = %format!("{e:#}"), "job handler failed")
                }
                Err(_) => error!(queue = %queue, entry_id = %entry.id, "job handler panicked"),
            },
            Err(reason) => warn!(queue = %queue, entry_id = %entry.id, reason = %reason, "skipping undecodable job"),
        }

        if let Err(e) = self.store.ack(queue.as_str(), group, &[entry.id]) {
            error!(queue = %queue, entry_id = %entry.id, error = %e, "failed to acknowledge job");
        }
    }

    /// Sleep for `wait`. Returns true when cancelled meanwhile.
    fn pause(shutdown: Option<&mpsc::Receiver<()>>, wait: Duration) -> bool {
        match shutdown {
            Some(rx) => !matches!(rx.recv_timeout(wait), Err(RecvTimeoutError::Timeout)),
            None => {
                thread::sleep(wait);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use serde_json::json;

    use crate::stream::InMemoryStreamStore;

    const QUEUE: &str = "queue:emails";

    fn job_queue() -> (Arc<InMemoryStreamStore>, JobQueue<Arc<InMemoryStreamStore>>) {
        let store = Arc::new(InMemoryStreamStore::new());
        let jobs = JobQueue::new(store.clone()).with_block_timeout(Duration::from_millis(20));
        (store, jobs)
    }

    fn data(value: JsonValue) -> JobData {
        match value {
            JsonValue::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    #[test]
    fn publish_stamps_created_at() {
        let (store, jobs) = job_queue();
        let before = Utc::now().timestamp();
        jobs.publish_job(QUEUE, &data(json!({"to": "ada@example.com"})))
            .unwrap();

        let entry = &store.range(QUEUE, 1).unwrap()[0];
        let created_at: i64 = entry.field(fields::CREATED_AT).unwrap().parse().unwrap();
        assert!(created_at >= before);

        let decoded = Job::decode(entry).unwrap();
        assert_eq!(decoded.data["to"], "ada@example.com");
        assert_eq!(decoded.created_at, Some(created_at));
    }

    #[test]
    fn publish_rejects_empty_queue() {
        let (_, jobs) = job_queue();
        assert!(matches!(
            jobs.publish_job("", &JobData::new()),
            Err(QueueError::InvalidQueue(_))
        ));
    }

    #[test]
    fn failures_are_acked_without_retry() {
        let (store, jobs) = job_queue();
        jobs.publish_job(QUEUE, &data(json!({"n": 1}))).unwrap();
        jobs.publish_job(QUEUE, &data(json!({"n": 2}))).unwrap();

        let (tx, rx) = mpsc::channel();
        let seen = Mutex::new(Vec::new());
        let handler = |job: &Job| -> anyhow::Result<()> {
            let mut seen = seen.lock().unwrap();
            seen.push(job.data["n"].as_i64().unwrap());
            if seen.len() == 2 {
                let _ = tx.send(());
            }
            anyhow::bail!("smtp down")
        };

        jobs.consume_jobs_until(QUEUE, "mailers", "m1", &handler, &rx)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(store.pending(QUEUE, "mailers").unwrap(), 0);
        assert_eq!(store.length("queue:emails:retry").unwrap(), 0);
        assert_eq!(store.length("queue:emails:dlq").unwrap(), 0);
    }

    #[test]
    fn undecodable_jobs_are_skipped_and_acked() {
        let (store, jobs) = job_queue();
        store.append(QUEUE, &[(fields::JOB_DATA, "[1, 2]")], None).unwrap();
        jobs.publish_job(QUEUE, &data(json!({"n": 7}))).unwrap();

        let (tx, rx) = mpsc::channel();
        let calls = AtomicUsize::new(0);
        let handler = |job: &Job| -> anyhow::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(job.data["n"], 7);
            let _ = tx.send(());
            Ok(())
        };

        jobs.consume_jobs_until(QUEUE, "g", "c", &handler, &rx)
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.pending(QUEUE, "g").unwrap(), 0);
    }

    #[test]
    fn dropped_sender_cancels_before_first_read() {
        let (store, jobs) = job_queue();
        jobs.publish_job(QUEUE, &data(json!({"n": 1}))).unwrap();

        let (tx, rx) = mpsc::channel::<()>();
        drop(tx);
        let calls = AtomicUsize::new(0);
        jobs.consume_jobs_until(QUEUE, "g", "c", &|_: &Job| -> anyhow::Result<()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }, &rx)
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.info(QUEUE).unwrap().groups, 1);
    }

    #[test]
    fn cancellation_returns_within_block_timeout() {
        let (_, jobs) = job_queue();
        let (tx, rx) = mpsc::channel();

        let started = Instant::now();
        let handle = std::thread::spawn(move || {
            jobs.consume_jobs_until(QUEUE, "g", "c", &|_: &Job| -> anyhow::Result<()> { Ok(()) }, &rx)
        });
        std::thread::sleep(Duration::from_millis(50));
        tx.send(()).unwrap();

        handle.join().unwrap().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn destroyed_group_is_recreated() {
        let (store, jobs) = job_queue();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let done_tx = Mutex::new(done_tx);

        let handle = std::thread::spawn(move || {
            jobs.consume_jobs_until(
                QUEUE,
                "g",
                "c",
                &|job: &Job| -> anyhow::Result<()> {
                    let _ = done_tx.lock().unwrap().send(job.data["n"].clone());
                    Ok(())
                },
                &rx,
            )
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while store.info(QUEUE).map(|i| i.groups).unwrap_or(0) == 0 {
            assert!(Instant::now() < deadline, "group never created");
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(store.destroy_group(QUEUE, "g"));

        JobQueue::new(store.clone())
            .publish_job(QUEUE, &data(json!({"n": 9})))
            .unwrap();

        assert_eq!(done_rx.recv_timeout(Duration::from_secs(3)).unwrap(), 9);
        tx.send(()).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(store.pending(QUEUE, "g").unwrap(), 0);
    }

    #[test]
    fn idle_consumer_with_zero_block_timeout_does_not_spin() {
        let store = Arc::new(InMemoryStreamStore::new());
        let jobs = JobQueue::new(store.clone()).with_block_timeout(Duration::ZERO);
        let (tx, rx) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            jobs.consume_jobs_until(QUEUE, "g", "c", &|_: &Job| -> anyhow::Result<()> { Ok(()) }, &rx)
        });
        std::thread::sleep(Duration::from_millis(300));
        tx.send(()).unwrap();
        handle.join().unwrap().unwrap();

        let reads = store.read_calls();
        assert!(reads >= 1, "consumer never read");
        assert!(reads < 20, "{reads} reads in 300ms");
    }

    #[test]
    fn group_setup_failure_is_returned() {
        let (store, jobs) = job_queue();
        store.set_unreachable(QUEUE, true);
        let err = jobs
            .consume_jobs(QUEUE, "g", "c", &|_: &Job| -> anyhow::Result<()> { Ok(()) })
            .unwrap_err();
        assert!(matches!(err, QueueError::Store { .. }));
    }
}
