use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::Utc;

use super::{EntryId, StreamEntry, StreamError, StreamInfo, StreamStore};

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
}

#[derive(Debug, Default)]
struct Group {
    last_delivered: EntryId,
    /// Delivered, unacknowledged entries and the consumer holding them.
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn next_id(&self) -> EntryId {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        if now > self.last_id.millis() {
            EntryId::from_millis(now)
        } else {
            EntryId::new(self.last_id.millis(), self.last_id.seq() + 1)
        }
    }

    fn entry(&self, id: EntryId) -> Option<StreamEntry> {
        self.entries.get(&id).map(|fields| StreamEntry {
            id,
            fields: fields.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct State {
    streams: HashMap<String, Stream>,
    unreachable: HashSet<String>,
}

impl State {
    fn check_reachable(&self, stream: &str) -> Result<(), StreamError> {
        if self.unreachable.contains(stream) {
            return Err(StreamError::Connection(format!("stream {stream} is unreachable")));
        }
        Ok(())
    }
}

/// In-memory stream store.
///
/// Intended for tests/dev. Mirrors the consumer-group behaviour of Redis
/// Streams closely enough to exercise the publish/consume pipeline, and can
/// simulate an unreachable backend per stream via [`Self::set_unreachable`].
/// `max_len` trimming is exact rather than approximate.
#[derive(Debug, Default)]
pub struct InMemoryStreamStore {
    state: Mutex<State>,
    appended: Condvar,
    reads: AtomicU64,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation on `stream` fail with a connection error.
    pub fn set_unreachable(&self, stream: &str, unreachable: bool) {
        if let Ok(mut state) = self.state.lock() {
            if unreachable {
                state.unreachable.insert(stream.to_string());
            } else {
                state.unreachable.remove(stream);
            }
        }
    }

    /// Append with an explicit id, like `XADD <stream> <id>`. The id must be
    /// greater than the stream's last generated id.
    pub fn insert_at(
        &self,
        stream: &str,
        id: EntryId,
        fields: &[(&str, &str)],
    ) -> Result<EntryId, StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let s = state.streams.entry(stream.to_string()).or_default();
        if id <= s.last_id {
            return Err(StreamError::Command(format!(
                "id {id} is not greater than last id {}",
                s.last_id
            )));
        }
        s.entries.insert(
            id,
            fields
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        );
        s.last_id = id;

        drop(state);
        self.appended.notify_all();
        Ok(id)
    }

    /// Drop a consumer group and its pending list, like `XGROUP DESTROY`.
    /// Returns whether the group existed.
    pub fn destroy_group(&self, stream: &str, group: &str) -> bool {
        self.state
            .lock()
            .ok()
            .and_then(|mut state| {
                state
                    .streams
                    .get_mut(stream)
                    .and_then(|s| s.groups.remove(group))
            })
            .is_some()
    }

    /// Consumer currently holding a pending entry, like the `XPENDING` detail form.
    pub fn pending_owner(&self, stream: &str, group: &str, id: EntryId) -> Option<String> {
        let state = self.state.lock().ok()?;
        state
            .streams
            .get(stream)?
            .groups
            .get(group)?
            .pending
            .get(&id)
            .map(|p| p.consumer.clone())
    }

    /// Number of `read_group` calls served so far.
    pub fn read_calls(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StreamError> {
        self.state
            .lock()
            .map_err(|_| StreamError::Command("lock poisoned".to_string()))
    }

    fn no_group(stream: &str, group: &str) -> StreamError {
        StreamError::NoSuchGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        }
    }

    /// Deliver up to `count` new entries to `consumer`, or none.
    fn deliver(
        state: &mut State,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        let mut delivered = Vec::new();
        for (id, fields) in s.entries.range(g.last_delivered..) {
            if delivered.len() >= count {
                break;
            }
            if *id <= g.last_delivered {
                continue;
            }
            delivered.push(StreamEntry {
                id: *id,
                fields: fields.clone(),
            });
        }

        for entry in &delivered {
            g.last_delivered = entry.id;
            g.pending.insert(
                entry.id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                },
            );
        }

        Ok(delivered)
    }
}

impl StreamStore for InMemoryStreamStore {
    fn append(
        &self,
        stream: &str,
        fields: &[(&str, &str)],
        max_len: Option<usize>,
    ) -> Result<EntryId, StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let s = state.streams.entry(stream.to_string()).or_default();
        let id = s.next_id();
        let values = fields
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        s.entries.insert(id, values);
        s.last_id = id;

        if let Some(max_len) = max_len {
            while s.entries.len() > max_len {
                s.entries.pop_first();
            }
        }

        drop(state);
        self.appended.notify_all();
        Ok(id)
    }

    fn create_group(&self, stream: &str, group: &str) -> Result<(), StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let s = state.streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Err(StreamError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }
        s.groups.insert(group.to_string(), Group::default());
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + block;
        let mut state = self.lock()?;

        loop {
            state.check_reachable(stream)?;
            let delivered = Self::deliver(&mut state, stream, group, consumer, count.max(1))?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let (guard, _) = self
                .appended
                .wait_timeout(state, deadline - now)
                .map_err(|_| StreamError::Command("lock poisoned".to_string()))?;
            state = guard;
        }
    }

    fn claim_idle(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>, StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let s = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Self::no_group(stream, group))?;
        let g = s
            .groups
            .get_mut(group)
            .ok_or_else(|| Self::no_group(stream, group))?;

        let now = Instant::now();
        let idle: Vec<EntryId> = g
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.delivered_at) >= min_idle)
            .map(|(id, _)| *id)
            .collect();

        let mut claimed = Vec::new();
        for id in idle {
            if claimed.len() >= count.max(1) {
                break;
            }
            let Some(fields) = s.entries.get(&id) else {
                g.pending.remove(&id);
                continue;
            };
            g.pending.insert(
                id,
                PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                },
            );
            claimed.push(StreamEntry {
                id,
                fields: fields.clone(),
            });
        }

        Ok(claimed)
    }

    fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let Some(g) = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };

        let removed = ids.iter().filter(|id| g.pending.remove(id).is_some()).count();
        Ok(removed as u64)
    }

    fn length(&self, stream: &str) -> Result<u64, StreamError> {
        let state = self.lock()?;
        state.check_reachable(stream)?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    fn info(&self, stream: &str) -> Result<StreamInfo, StreamError> {
        let state = self.lock()?;
        state.check_reachable(stream)?;

        let s = state
            .streams
            .get(stream)
            .ok_or_else(|| StreamError::NoSuchStream(stream.to_string()))?;

        Ok(StreamInfo {
            length: s.entries.len() as u64,
            groups: s.groups.len() as u64,
            last_generated_id: s.last_id,
        })
    }

    fn pending(&self, stream: &str, group: &str) -> Result<u64, StreamError> {
        let state = self.lock()?;
        state.check_reachable(stream)?;

        state
            .streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| Self::no_group(stream, group))
    }

    fn range(&self, stream: &str, count: usize) -> Result<Vec<StreamEntry>, StreamError> {
        let state = self.lock()?;
        state.check_reachable(stream)?;

        let Some(s) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        Ok(s.entries
            .keys()
            .take(count)
            .filter_map(|id| s.entry(*id))
            .collect())
    }

    fn trim_before(&self, stream: &str, min_id: EntryId) -> Result<u64, StreamError> {
        let mut state = self.lock()?;
        state.check_reachable(stream)?;

        let Some(s) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let kept = s.entries.split_off(&min_id);
        let removed = s.entries.len() as u64;
        s.entries = kept;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ensure_group;

    const STREAM: &str = "queue:test";

    #[test]
    fn ids_increase_strictly() {
        let store = InMemoryStreamStore::new();
        let a = store.append(STREAM, &[("k", "1")], None).unwrap();
        let b = store.append(STREAM, &[("k", "2")], None).unwrap();
        let c = store.append(STREAM, &[("k", "3")], None).unwrap();
        assert!(a < b && b < c);
        assert_eq!(store.info(STREAM).unwrap().last_generated_id, c);
    }

    #[test]
    fn group_creation_reports_existing_group() {
        let store = InMemoryStreamStore::new();
        store.create_group(STREAM, "g").unwrap();
        assert!(matches!(
            store.create_group(STREAM, "g"),
            Err(StreamError::GroupExists { .. })
        ));
        ensure_group(&store, STREAM, "g").unwrap();
    }

    #[test]
    fn group_starts_at_beginning_of_history() {
        let store = InMemoryStreamStore::new();
        store.append(STREAM, &[("k", "old")], None).unwrap();
        store.create_group(STREAM, "g").unwrap();

        let entries = store
            .read_group(STREAM, "g", "c1", 10, Duration::ZERO)
            .unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field("k"), Some("old"));
    }

    #[test]
    fn entries_are_delivered_once_per_group() {
        let store = InMemoryStreamStore::new();
        store.create_group(STREAM, "g").unwrap();
        store.create_group(STREAM, "other").unwrap();
        for i in 0..3 {
            store.append(STREAM, &[("i", i.to_string().as_str())], None).unwrap();
        }

        let first = store.read_group(STREAM, "g", "c1", 2, Duration::ZERO).unwrap();
        let second = store.read_group(STREAM, "g", "c2", 10, Duration::ZERO).unwrap();
        let third = store.read_group(STREAM, "g", "c1", 10, Duration::ZERO).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert!(third.is_empty());

        // Groups have independent cursors.
        let other = store.read_group(STREAM, "other", "c1", 10, Duration::ZERO).unwrap();
        assert_eq!(other.len(), 3);
    }

    #[test]
    fn claim_idle_hands_stranded_entries_to_another_consumer() {
        let store = InMemoryStreamStore::new();
        store.append(STREAM, &[("n", "1")], None).unwrap();
        store.append(STREAM, &[("n", "2")], None).unwrap();
        store.create_group(STREAM, "g").unwrap();
        let read = store.read_group(STREAM, "g", "crashed", 10, Duration::ZERO).unwrap();
        assert_eq!(read.len(), 2);

        // Not idle long enough yet.
        assert!(store
            .claim_idle(STREAM, "g", "rescuer", Duration::from_secs(60), 10)
            .unwrap()
            .is_empty());

        let claimed = store
            .claim_idle(STREAM, "g", "rescuer", Duration::ZERO, 1)
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, read[0].id);
        assert_eq!(claimed[0].field("n"), Some("1"));
        assert_eq!(
            store.pending_owner(STREAM, "g", read[0].id).as_deref(),
            Some("rescuer")
        );
        assert_eq!(
            store.pending_owner(STREAM, "g", read[1].id).as_deref(),
            Some("crashed")
        );

        // New reads never redeliver pending entries.
        assert!(store.read_group(STREAM, "g", "rescuer", 10, Duration::ZERO).unwrap().is_empty());
        assert_eq!(store.pending(STREAM, "g").unwrap(), 2);
    }

    #[test]
    fn claim_idle_drops_trimmed_entries() {
        let store = InMemoryStreamStore::new();
        store.append(STREAM, &[("n", "1")], None).unwrap();
        store.create_group(STREAM, "g").unwrap();
        store.read_group(STREAM, "g", "c", 10, Duration::ZERO).unwrap();
        store.append(STREAM, &[("n", "2")], Some(1)).unwrap();

        let claimed = store.claim_idle(STREAM, "g", "c", Duration::ZERO, 10).unwrap();
        assert!(claimed.is_empty());
        assert_eq!(store.pending(STREAM, "g").unwrap(), 0);
    }

    #[test]
    fn destroyed_group_stops_reads() {
        let store = InMemoryStreamStore::new();
        store.create_group(STREAM, "g").unwrap();
        assert!(store.destroy_group(STREAM, "g"));
        assert!(!store.destroy_group(STREAM, "g"));
        assert!(matches!(
            store.read_group(STREAM, "g", "c", 1, Duration::ZERO),
            Err(StreamError::NoSuchGroup { .. })
        ));
        assert_eq!(store.read_calls(), 1);
    }

    #[test]
    fn ack_clears_pending_but_keeps_entries() {
        let store = InMemoryStreamStore::new();
        store.create_group(STREAM, "g").unwrap();
        let id = store.append(STREAM, &[("k", "v")], None).unwrap();
        store.read_group(STREAM, "g", "c1", 1, Duration::ZERO).unwrap();
        assert_eq!(store.pending(STREAM, "g").unwrap(), 1);

        assert_eq!(store.ack(STREAM, "g", &[id]).unwrap(), 1);
        assert_eq!(store.ack(STREAM, "g", &[id]).unwrap(), 0);
        assert_eq!(store.pending(STREAM, "g").unwrap(), 0);
        assert_eq!(store.length(STREAM).unwrap(), 1);
    }

    #[test]
    fn read_without_group_fails() {
        let store = InMemoryStreamStore::new();
        store.append(STREAM, &[("k", "v")], None).unwrap();
        assert!(matches!(
            store.read_group(STREAM, "missing", "c1", 1, Duration::ZERO),
            Err(StreamError::NoSuchGroup { .. })
        ));
    }

    #[test]
    fn blocking_read_times_out_empty() {
        let store = InMemoryStreamStore::new();
        store.create_group(STREAM, "g").unwrap();
        let started = Instant::now();
        let entries = store
            .read_group(STREAM, "g", "c1", 1, Duration::from_millis(50))
            .unwrap();
        assert!(entries.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn blocking_read_wakes_on_append() {
        let store = std::sync::Arc::new(InMemoryStreamStore::new());
        store.create_group(STREAM, "g").unwrap();

        let reader = {
            let store = store.clone();
            std::thread::spawn(move || {
                store.read_group(STREAM, "g", "c1", 1, Duration::from_secs(5))
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        store.append(STREAM, &[("k", "v")], None).unwrap();

        let entries = reader.join().unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn max_len_drops_oldest() {
        let store = InMemoryStreamStore::new();
        for i in 0..5 {
            store.append(STREAM, &[("i", i.to_string().as_str())], Some(3)).unwrap();
        }
        let entries = store.range(STREAM, 10).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].field("i"), Some("2"));
    }

    #[test]
    fn trim_before_removes_older_entries() {
        let store = InMemoryStreamStore::new();
        let a = store.append(STREAM, &[("k", "a")], None).unwrap();
        let b = store.append(STREAM, &[("k", "b")], None).unwrap();
        assert!(a < b);

        assert_eq!(store.trim_before(STREAM, b).unwrap(), 1);
        let left = store.range(STREAM, 10).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, b);
    }

    #[test]
    fn info_on_missing_stream_fails() {
        let store = InMemoryStreamStore::new();
        assert!(matches!(store.info("nope"), Err(StreamError::NoSuchStream(_))));
        assert_eq!(store.length("nope").unwrap(), 0);
    }

    #[test]
    fn unreachable_stream_fails_every_operation() {
        let store = InMemoryStreamStore::new();
        store.set_unreachable(STREAM, true);
        assert!(matches!(
            store.append(STREAM, &[("k", "v")], None),
            Err(StreamError::Connection(_))
        ));
        assert!(matches!(store.info(STREAM), Err(StreamError::Connection(_))));

        store.set_unreachable(STREAM, false);
        store.append(STREAM, &[("k", "v")], None).unwrap();
    }
}
