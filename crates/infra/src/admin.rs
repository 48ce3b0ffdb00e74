//! Operator-facing queue inspection and maintenance.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{info, instrument, warn};

use tradeflow_events::{EventEnvelope, QueueName, queues};

use crate::error::QueueError;
use crate::stream::{EntryId, StreamEntry, StreamStore, fields};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub length: u64,
    pub groups: u64,
    pub last_generated_id: String,
}

/// Per-queue health as reported by [`QueueAdmin::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum QueueHealth {
    Healthy { stats: QueueStats },
    Error { error: String },
}

impl QueueHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, QueueHealth::Healthy { .. })
    }
}

/// A dead-lettered delivery as written by the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeadLetter {
    pub entry_id: String,
    /// The envelope JSON, or the raw payload when it never decoded.
    pub event: String,
    pub failed_at: Option<i64>,
    pub queue_name: Option<String>,
    pub error: Option<String>,
}

impl DeadLetter {
    fn from_entry(entry: &StreamEntry) -> Self {
        Self {
            entry_id: entry.id.to_string(),
            event: entry.field(fields::EVENT).unwrap_or_default().to_string(),
            failed_at: entry.field(fields::FAILED_AT).and_then(|v| v.parse().ok()),
            queue_name: entry.field(fields::QUEUE_NAME).map(str::to_string),
            error: entry.field(fields::ERROR).map(str::to_string),
        }
    }

    /// Decode the stored envelope, if it is one.
    pub fn envelope(&self) -> Option<EventEnvelope> {
        serde_json::from_str(&self.event).ok()
    }
}

#[derive(Debug, Clone)]
pub struct QueueAdmin<S> {
    store: S,
    monitored: Vec<String>,
}

impl<S: StreamStore> QueueAdmin<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            monitored: queues::MONITORED.iter().map(|q| q.to_string()).collect(),
        }
    }

    pub fn with_monitored_queues<I, Q>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = Q>,
        Q: Into<String>,
    {
        self.monitored = queues.into_iter().map(Into::into).collect();
        self
    }

    pub fn monitored_queues(&self) -> &[String] {
        &self.monitored
    }

    pub fn queue_stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        let queue = QueueName::new(queue)?;
        let info = self
            .store
            .info(queue.as_str())
            .map_err(|e| QueueError::store(queue.as_str(), e))?;

        Ok(QueueStats {
            length: info.length,
            groups: info.groups,
            last_generated_id: info.last_generated_id.to_string(),
        })
    }

    /// Stats for every monitored queue. A failing queue is reported in place
    /// and never hides the others.
    pub fn health_check(&self) -> BTreeMap<String, QueueHealth> {
        self.monitored
            .iter()
            .map(|queue| {
                let health = match self.queue_stats(queue) {
                    Ok(stats) => QueueHealth::Healthy { stats },
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "queue unhealthy");
                        QueueHealth::Error {
                            error: e.to_string(),
                        }
                    }
                };
                (queue.clone(), health)
            })
            .collect()
    }

    /// Drop entries older than `max_age`; returns how many were removed.
    ///
    /// Entry ids carry their append time, so age is judged by id alone.
    #[instrument(skip(self), err)]
    pub fn purge_queue(&self, queue: &str, max_age: Duration) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let max_age_ms = u64::try_from(max_age.as_millis()).unwrap_or(u64::MAX);
        let cutoff = EntryId::from_millis(now_ms.saturating_sub(max_age_ms));

        let removed = self
            .store
            .trim_before(queue.as_str(), cutoff)
            .map_err(|e| QueueError::store(queue.as_str(), e))?;

        info!(queue = %queue, cutoff = %cutoff, removed, "queue purged");
        Ok(removed)
    }

    /// Raw entry count, including entries already acknowledged.
    pub fn queue_length(&self, queue: &str) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        self.store
            .length(queue.as_str())
            .map_err(|e| QueueError::store(queue.as_str(), e))
    }

    /// Deliveries handed to `group` and not yet acknowledged.
    pub fn pending_count(&self, queue: &str, group: &str) -> Result<u64, QueueError> {
        let queue = QueueName::new(queue)?;
        self.store
            .pending(queue.as_str(), group)
            .map_err(|e| QueueError::store(queue.as_str(), e))
    }

    /// Oldest `count` entries of the dead-letter stream of `queue`.
    pub fn dead_letters(&self, queue: &str, count: usize) -> Result<Vec<DeadLetter>, QueueError> {
        let dlq = QueueName::new(queue)?.dlq();
        let entries = self
            .store
            .range(dlq.as_str(), count)
            .map_err(|e| QueueError::store(dlq.as_str(), e))?;

        Ok(entries.iter().map(DeadLetter::from_entry).collect())
    }
}
