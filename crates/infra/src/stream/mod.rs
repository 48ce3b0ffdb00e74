//! Append-only stream store boundary.
//!
//! This module defines the infrastructure-facing abstraction over a log store
//! with consumer-group semantics (Redis Streams in production). Publishers,
//! consumers and admin helpers only ever talk to a [`StreamStore`], so tests
//! inject [`InMemoryStreamStore`] instead of a live server.
//!
//! ## Semantics every implementation provides
//!
//! - **Append-only**: entries are immutable once appended; ids increase
//!   strictly within a stream
//! - **Approximate trimming**: `append` with a `max_len` may drop the oldest
//!   entries once the bound is exceeded
//! - **Consumer groups**: `read_group` hands each new entry to exactly one
//!   consumer of the group and records it as pending until `ack`
//! - **Ack does not delete**: acknowledged entries stay until trimmed
//! - **Recovery**: entries left pending (crashed consumer, failed ack) are
//!   handed out again through `claim_idle`, never through `read_group`

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use in_memory::InMemoryStreamStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamStore;

/// Field names used on the wire.
pub mod fields {
    /// JSON-encoded event envelope.
    pub const EVENT: &str = "event";
    /// JSON-encoded payload map of a generic job.
    pub const JOB_DATA: &str = "job_data";
    /// Unix seconds at which a generic job was published.
    pub const CREATED_AT: &str = "created_at";
    /// Unix seconds at which an event was dead-lettered.
    pub const FAILED_AT: &str = "failed_at";
    /// Primary queue a dead-lettered event came from.
    pub const QUEUE_NAME: &str = "queue_name";
    /// Last handler failure of a dead-lettered event.
    pub const ERROR: &str = "error";
}

/// Stream entry id (`<unix millis>-<sequence>`), totally ordered.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    millis: u64,
    seq: u64,
}

impl EntryId {
    pub const MIN: EntryId = EntryId { millis: 0, seq: 0 };

    pub const fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id that can be generated at `millis`.
    pub const fn from_millis(millis: u64) -> Self {
        Self { millis, seq: 0 }
    }

    pub fn millis(&self) -> u64 {
        self.millis
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

impl core::fmt::Display for EntryId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StreamError::Protocol(format!("invalid entry id: {s:?}"));
        let (millis, seq) = match s.split_once('-') {
            Some((millis, seq)) => (millis, seq),
            None => (s, "0"),
        };
        Ok(Self {
            millis: millis.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

/// An entry read back from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub fields: HashMap<String, String>,
}

impl StreamEntry {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Stream-level metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub length: u64,
    pub groups: u64,
    pub last_generated_id: EntryId,
}

/// Stream store operation error.
///
/// `GroupExists` is reported as its own variant so callers can treat group
/// creation as idempotent without inspecting error messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("command error: {0}")]
    Command(String),

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("no such stream: {0}")]
    NoSuchStream(String),

    #[error("no consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("consumer group '{group}' already exists on stream '{stream}'")]
    GroupExists { stream: String, group: String },
}

/// Append-only log store with consumer groups.
///
/// Implementations must be safe to share across threads; the handle is the
/// only shared resource of the queue subsystem.
pub trait StreamStore: Send + Sync {
    /// Append one entry atomically. With `max_len`, the stream is trimmed to
    /// roughly that many entries (oldest first).
    fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, StreamError>;

    /// Create a consumer group positioned at the start of the stream, creating
    /// the stream when missing. Fails with [`StreamError::GroupExists`] when the
    /// group is already there.
    fn create_group(&self, stream: &str, group: &str) -> Result<(), StreamError>;

    /// Read up to `count` entries never delivered to `group`, waiting up to
    /// `block` for at least one. A zero `block` does not wait.
    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Transfer to `consumer` up to `count` pending entries of `group` that
    /// have gone unacknowledged for at least `min_idle`, whichever consumer
    /// held them. Claimed entries restart their idle clock. Pending entries
    /// whose data was trimmed away are dropped from the pending list.
    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError>;

    /// Remove entries from the group's pending list. Returns how many were pending.
    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StreamError>;

    /// Number of entries currently retained (0 for a missing stream).
    fn length(&self, stream: &str) -> Result<u64, StreamError>;

    /// Stream metadata; [`StreamError::NoSuchStream`] when missing.
    fn info(&self, stream: &str) -> Result<StreamInfo, StreamError>;

    /// Number of delivered but unacknowledged entries of a group.
    fn pending(&self, stream: &str, group: &str) -> Result<u64, StreamError>;

    /// Oldest `count` retained entries.
    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StreamError>;

    /// Drop entries whose id is lower than `min_id`. Returns how many were removed.
    fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, StreamError>;
}

impl<S> StreamStore for Arc<S>
where
    S: StreamStore + ?Sized,
{
    fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, StreamError> {
        (**self).append(stream, fields, max_len)
    }

    fn create_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        (**self).create_group(stream, group)
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).read_group(stream, group, consumer, count, block)
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).claim_idle(stream, group, consumer, min_idle, count)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StreamError> {
        (**self).ack(stream, group, ids)
    }

    fn length(&self, stream: &str) -> Result<u64, StreamError> {
        (**self).length(stream)
    }

    fn info(&self, stream: &str) -> Result<StreamInfo, StreamError> {
        (**self).info(stream)
    }

    fn pending(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        (**self).pending(stream, group)
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StreamError> {
        (**self).range(stream, count)
    }

    fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, StreamError> {
        (**self).trim_before(stream, min_id)
    }
}

/// Create a consumer group, treating an existing group as success.
pub fn ensure_group<S>(store: &S, stream: &str, group: &str) -> Result<(), StreamError>
where
    S: StreamStore + ?Sized,
{
    match store.create_group(stream, group) {
        Ok(()) | Err(StreamError::GroupExists { .. }) => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_id_parses_both_forms() {
        assert_eq!("1700-3".parse::<EntryId>().unwrap(), EntryId::new(1700, 3));
        assert_eq!("1700".parse::<EntryId>().unwrap(), EntryId::from_millis(1700));
        assert!("x-1".parse::<EntryId>().is_err());
        assert!("".parse::<EntryId>().is_err());
    }

    #[test]
    fn entry_id_orders_by_millis_then_seq() {
        assert!(EntryId::new(1, 9) < EntryId::new(2, 0));
        assert!(EntryId::new(2, 0) < EntryId::new(2, 1));
        assert_eq!(EntryId::new(5, 1).to_string(), "5-1");
    }
}
