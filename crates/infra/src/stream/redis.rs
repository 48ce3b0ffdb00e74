//! Redis Streams-backed store (XADD/XREADGROUP/XACK).
//!
//! ## Command mapping
//!
//! - `append` → `XADD <stream> MAXLEN ~ <n> * field value ...`
//! - `create_group` → `XGROUP CREATE <stream> <group> 0 MKSTREAM`
//!   (`BUSYGROUP` replies become [`StreamError::GroupExists`])
//! - `read_group` → `XREADGROUP GROUP <group> <consumer> COUNT <n> BLOCK <ms> STREAMS <stream> >`
//! - `claim_idle` → `XPENDING <stream> <group> IDLE <ms> - + <n>`, then
//!   `XCLAIM <stream> <group> <consumer> <ms> <id> ...`
//! - `trim_before` → `XTRIM <stream> MINID ~ <id>`

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use redis::streams::{
    StreamClaimReply, StreamId, StreamInfoStreamReply, StreamMaxlen, StreamPendingCountReply,
    StreamPendingReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{Commands, RedisError};
use tracing::instrument;

use super::{EntryId, StreamEntry, StreamError, StreamInfo, StreamStore};

#[derive(Debug, Clone)]
pub struct RedisStreamStore {
    client: Arc<redis::Client>,
}

impl RedisStreamStore {
    /// Create a store for a Redis connection URL (e.g. "redis://localhost:6379").
    ///
    /// No connection is made until the first command.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, StreamError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| StreamError::Connection(e.to_string()))?;

        Ok(Self {
            client: Arc::new(client),
        })
    }

    fn connection(&self) -> Result<redis::Connection, StreamError> {
        self.client
            .get_connection()
            .map_err(|e| StreamError::Connection(e.to_string()))
    }
}

fn command_error(command: &str, e: RedisError) -> StreamError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        StreamError::Connection(format!("{command} failed: {e}"))
    } else {
        StreamError::Command(format!("{command} failed: {e}"))
    }
}

fn parse_id(raw: &str) -> Result<EntryId, StreamError> {
    raw.parse()
}

fn convert_entry(entry: StreamId) -> Result<StreamEntry, StreamError> {
    let id = parse_id(&entry.id)?;

    let mut fields = HashMap::with_capacity(entry.map.len());
    for (key, value) in entry.map {
        let value: String = redis::from_redis_value(&value).map_err(|e| {
            StreamError::Protocol(format!("field {key} of entry {id} is not a string: {e}"))
        })?;
        fields.insert(key, value);
    }

    Ok(StreamEntry { id, fields })
}

impl StreamStore for RedisStreamStore {
    #[instrument(skip(self, values), err)]
    fn append(
        &self,
        stream: &str,
        values: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, StreamError> {
        let mut conn = self.connection()?;

        let id: String = match max_len {
            Some(n) => conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", values),
            None => conn.xadd(stream, "*", values),
        }
        .map_err(|e| command_error("XADD", e))?;

        parse_id(&id)
    }

    #[instrument(skip(self), err)]
    fn create_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut conn = self.connection()?;

        // "0" positions the group at the beginning of the stream.
        conn.xgroup_create_mkstream::<_, _, _, ()>(stream, group, "0")
            .map_err(|e| match e.code() {
                Some("BUSYGROUP") => StreamError::GroupExists {
                    stream: stream.to_string(),
                    group: group.to_string(),
                },
                _ => command_error("XGROUP CREATE", e),
            })
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.connection()?;

        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count.max(1));
        // BLOCK 0 means "forever" to Redis; a zero duration means "don't wait" here.
        if !block.is_zero() {
            options = options.block(block.as_millis().max(1) as usize);
        }

        // A blocking read that times out replies with nil.
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[stream], &[">"], &options)
            .map_err(|e| match e.code() {
                Some("NOGROUP") => StreamError::NoSuchGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                },
                _ => command_error("XREADGROUP", e),
            })?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        reply
            .keys
            .into_iter()
            .filter(|key| key.key == stream)
            .flat_map(|key| key.ids)
            .map(convert_entry)
            .collect()
    }

    #[instrument(skip(self, min_idle), fields(min_idle_ms = min_idle.as_millis() as u64), err)]
    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.connection()?;
        let min_idle_ms = min_idle.as_millis() as u64;
        let no_group = |e: RedisError, command: &str| match e.code() {
            Some("NOGROUP") => StreamError::NoSuchGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            },
            _ => command_error(command, e),
        };

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(count.max(1))
            .query(&mut conn)
            .map_err(|e| no_group(e, "XPENDING"))?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();
        // XCLAIM re-checks the idle time, so a concurrent claim wins only once.
        let claimed: StreamClaimReply = conn
            .xclaim(stream, group, consumer, min_idle_ms, &ids[..])
            .map_err(|e| no_group(e, "XCLAIM"))?;

        claimed.ids.into_iter().map(convert_entry).collect()
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StreamError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut conn = self.connection()?;
        let ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();

        conn.xack(stream, group, &ids[..])
            .map_err(|e| command_error("XACK", e))
    }

    fn length(&self, stream: &str) -> Result<u64, StreamError> {
        let mut conn = self.connection()?;
        conn.xlen(stream).map_err(|e| command_error("XLEN", e))
    }

    fn info(&self, stream: &str) -> Result<StreamInfo, StreamError> {
        let mut conn = self.connection()?;

        let exists: bool = conn
            .exists(stream)
            .map_err(|e| command_error("EXISTS", e))?;
        if !exists {
            return Err(StreamError::NoSuchStream(stream.to_string()));
        }

        let reply: StreamInfoStreamReply = conn
            .xinfo_stream(stream)
            .map_err(|e| command_error("XINFO STREAM", e))?;

        Ok(StreamInfo {
            length: reply.length as u64,
            groups: reply.groups as u64,
            last_generated_id: parse_id(&reply.last_generated_id)?,
        })
    }

    fn pending(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let mut conn = self.connection()?;

        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .map_err(|e| match e.code() {
                Some("NOGROUP") => StreamError::NoSuchGroup {
                    stream: stream.to_string(),
                    group: group.to_string(),
                },
                _ => command_error("XPENDING", e),
            })?;

        Ok(reply.count() as u64)
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let mut conn = self.connection()?;

        let reply: StreamRangeReply = conn
            .xrange_count(stream, "-", "+", count)
            .map_err(|e| command_error("XRANGE", e))?;

        reply.ids.into_iter().map(convert_entry).collect()
    }

    #[instrument(skip(self, min_id), fields(min_id = %min_id), err)]
    fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, StreamError> {
        let mut conn = self.connection()?;

        // The typed XTRIM helper only supports MAXLEN.
        redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg("~")
            .arg(min_id.to_string())
            .query(&mut conn)
            .map_err(|e| command_error("XTRIM", e))
    }
}
