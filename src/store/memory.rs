//! In-memory store implementation for Streamsmith.
//!
//! `MemoryBroker` plays the role of a server: it owns streams, consumer groups,
//! sets, lists and counter maps, and hands out `MemoryStore` connections. Every
//! connection has its own client id and announced name, so orphan detection
//! works exactly as against a real server. Dropping or disconnecting a
//! connection removes it from the client list.
//!
//! Idle times are measured with `tokio::time::Instant`, so tests running on a
//! paused clock can advance them deterministically.

use super::{
    ConsumerInfo, CounterIncr, GroupRead, ListAppend, PendingEntry, ReadCursor, SharedStore,
    StoreConnector, StreamEntry, StreamStore,
};
use crate::error::{SmithError, SmithResult};
use crate::keys::QueueKeys;
use crate::task::RawTask;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;
use tokio::time::Instant;

/// Stream entry id, ordered like `<ms>-<seq>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
struct EntryId {
    ms: u64,
    seq: u64,
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = SmithError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SmithError::store(format!("Invalid stream ID specified: {s}"));
        let (ms, seq) = s.split_once('-').unwrap_or((s, "0"));
        Ok(Self {
            ms: ms.parse().map_err(|_| invalid())?,
            seq: seq.parse().map_err(|_| invalid())?,
        })
    }
}

#[derive(Debug)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug)]
struct GroupState {
    last_delivered: EntryId,
    pel: BTreeMap<EntryId, PendingState>,
    consumers: HashMap<String, Instant>,
}

impl GroupState {
    fn new() -> Self {
        Self {
            last_delivered: EntryId::default(),
            pel: BTreeMap::new(),
            consumers: HashMap::new(),
        }
    }

    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }

    fn pending_of(&self, consumer: &str) -> usize {
        self.pel.values().filter(|p| p.consumer == consumer).count()
    }
}

#[derive(Debug, Default)]
struct StreamState {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&self) -> EntryId {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        if ms > self.last_id.ms {
            EntryId { ms, seq: 0 }
        } else {
            EntryId {
                ms: self.last_id.ms,
                seq: self.last_id.seq + 1,
            }
        }
    }

    fn add(&mut self, fields: HashMap<String, String>) -> EntryId {
        let id = self.next_id();
        self.entries.insert(id, fields);
        self.last_id = id;
        id
    }

    fn group_mut(&mut self, group: &str) -> SmithResult<&mut GroupState> {
        self.groups.get_mut(group).ok_or_else(|| no_group(group))
    }

    /// XACK: true when `id` was pending in the group.
    fn ack(&mut self, group: &str, id: EntryId) -> bool {
        self.groups
            .get_mut(group)
            .and_then(|group| group.pel.remove(&id))
            .is_some()
    }

    /// XDEL
    fn delete(&mut self, id: EntryId) -> u64 {
        u64::from(self.entries.remove(&id).is_some())
    }
}

#[derive(Debug, Default)]
struct BrokerState {
    streams: HashMap<String, StreamState>,
    sets: HashMap<String, BTreeSet<String>>,
    lists: HashMap<String, VecDeque<String>>,
    hashes: HashMap<String, HashMap<String, i64>>,
    clients: BTreeMap<u64, String>,
    next_client_id: u64,
}

impl BrokerState {
    fn stream_mut(&mut self, stream: &str) -> SmithResult<&mut StreamState> {
        self.streams
            .get_mut(stream)
            .ok_or_else(|| SmithError::store(format!("ERR no such key: {stream}")))
    }

    fn insert_task(&mut self, keys: &QueueKeys, task: &RawTask) -> Option<String> {
        self.sets
            .entry(keys.queue_names())
            .or_default()
            .insert(keys.qname.clone());

        if !task.dedup_key.is_empty() {
            let dedup = self.sets.entry(keys.dedup_set.clone()).or_default();
            if !dedup.insert(task.dedup_key.clone()) {
                return None;
            }
        }

        let fields = task
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let id = self
            .streams
            .entry(keys.stream.clone())
            .or_default()
            .add(fields);
        Some(id.to_string())
    }
}

fn no_group(group: &str) -> SmithError {
    SmithError::store(format!("NOGROUP No such consumer group '{group}'"))
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// An in-process broker handing out [`MemoryStore`] connections.
///
/// Cloning the broker shares the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Create an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection.
    pub fn open(&self) -> MemoryStore {
        let id = {
            let mut state = self.shared.lock();
            state.next_client_id += 1;
            let id = state.next_client_id;
            state.clients.insert(id, String::new());
            id
        };

        MemoryStore {
            id,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.shared.lock().clients.len()
    }
}

#[async_trait]
impl StoreConnector for MemoryBroker {
    async fn connect(&self) -> SmithResult<SharedStore> {
        Ok(Arc::new(self.open()))
    }
}

/// One connection to a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryStore {
    id: u64,
    shared: Arc<Shared>,
    closed: AtomicBool,
}

impl MemoryStore {
    fn state(&self) -> SmithResult<MutexGuard<'_, BrokerState>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SmithError::Disconnected);
        }
        Ok(self.shared.lock())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shared.lock().clients.remove(&self.id);
            self.shared.notify.notify_waiters();
        }
    }

    fn read_pending(
        state: &mut BrokerState,
        read: &GroupRead<'_>,
        now: Instant,
    ) -> SmithResult<Vec<StreamEntry>> {
        let stream = state
            .streams
            .get_mut(read.stream)
            .ok_or_else(|| no_group(read.group))?;
        let group = stream
            .groups
            .get_mut(read.group)
            .ok_or_else(|| no_group(read.group))?;
        group.touch(read.consumer, now);

        let mut entries = Vec::new();
        for (id, pending) in group.pel.iter_mut() {
            if entries.len() >= read.count {
                break;
            }
            if pending.consumer != read.consumer {
                continue;
            }
            pending.delivered_at = now;
            pending.delivery_count += 1;
            entries.push(StreamEntry {
                id: id.to_string(),
                fields: stream.entries.get(id).cloned().unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    fn read_new(
        state: &mut BrokerState,
        read: &GroupRead<'_>,
        now: Instant,
    ) -> SmithResult<Vec<StreamEntry>> {
        let stream = state
            .streams
            .get_mut(read.stream)
            .ok_or_else(|| no_group(read.group))?;
        let group = stream
            .groups
            .get_mut(read.group)
            .ok_or_else(|| no_group(read.group))?;
        group.touch(read.consumer, now);

        let after = EntryId {
            ms: group.last_delivered.ms,
            seq: group.last_delivered.seq.saturating_add(1),
        };
        let mut entries = Vec::new();
        for (id, fields) in stream.entries.range(after..).take(read.count) {
            group.pel.insert(
                *id,
                PendingState {
                    consumer: read.consumer.to_string(),
                    delivered_at: now,
                    delivery_count: 1,
                },
            );
            group.last_delivered = *id;
            entries.push(StreamEntry {
                id: id.to_string(),
                fields: fields.clone(),
            });
        }
        Ok(entries)
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.close();
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn load_scripts(&self) -> SmithResult<()> {
        self.state().map(drop)
    }

    async fn client_id(&self) -> SmithResult<u64> {
        self.state().map(|_| self.id)
    }

    async fn set_client_name(&self, name: &str) -> SmithResult<()> {
        self.state()?.clients.insert(self.id, name.to_string());
        Ok(())
    }

    async fn client_names(&self) -> SmithResult<Vec<String>> {
        Ok(self
            .state()?
            .clients
            .values()
            .filter(|name| !name.is_empty())
            .cloned()
            .collect())
    }

    async fn create_group(&self, stream: &str, group: &str) -> SmithResult<()> {
        let mut state = self.state()?;
        let stream = state.streams.entry(stream.to_string()).or_default();
        if stream.groups.contains_key(group) {
            return Err(SmithError::BusyGroup);
        }
        stream.groups.insert(group.to_string(), GroupState::new());
        Ok(())
    }

    async fn read_group(&self, read: GroupRead<'_>) -> SmithResult<Vec<StreamEntry>> {
        if read.cursor == ReadCursor::Pending {
            let mut state = self.state()?;
            return Self::read_pending(&mut state, &read, Instant::now());
        }

        // `Some(None)` blocks until woken: the timeout lies past the clock's range.
        let deadline = read
            .block
            .filter(|block| !block.is_zero())
            .map(|block| Instant::now().checked_add(block));

        loop {
            let notified = {
                let mut state = self.state()?;
                let entries = Self::read_new(&mut state, &read, Instant::now())?;
                match deadline {
                    Some(until)
                        if entries.is_empty()
                            && until.is_none_or(|until| Instant::now() < until) => {}
                    _ => return Ok(entries),
                }
                // Registered before the lock is released so no insert is missed.
                self.shared.notify.notified()
            };

            match deadline {
                Some(Some(until)) => {
                    let _ = tokio::time::timeout_at(until, notified).await;
                }
                _ => notified.await,
            }
        }
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> SmithResult<Vec<PendingEntry>> {
        let mut state = self.state()?;
        let now = Instant::now();
        let group = state.stream_mut(stream)?.group_mut(group)?;

        Ok(group
            .pel
            .iter()
            .filter(|(_, p)| p.consumer == consumer)
            .take(count)
            .map(|(id, p)| PendingEntry {
                id: id.to_string(),
                consumer: p.consumer.clone(),
                idle: now.saturating_duration_since(p.delivered_at),
                delivery_count: p.delivery_count,
            })
            .collect())
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> SmithResult<Vec<String>> {
        let mut state = self.state()?;
        let now = Instant::now();
        let stream = state.stream_mut(stream)?;
        let entries = &stream.entries;
        let group = stream.groups.get_mut(group).ok_or_else(|| no_group(group))?;

        let mut claimed = Vec::new();
        for raw in ids {
            let id: EntryId = raw.parse()?;
            if !entries.contains_key(&id) {
                group.pel.remove(&id);
                continue;
            }
            if let Some(pending) = group.pel.get_mut(&id) {
                if now.saturating_duration_since(pending.delivered_at) < min_idle {
                    continue;
                }
                pending.consumer = consumer.to_string();
                pending.delivered_at = now;
                claimed.push(id.to_string());
            }
        }
        group.touch(consumer, now);
        Ok(claimed)
    }

    async fn consumers(&self, stream: &str, group: &str) -> SmithResult<Vec<ConsumerInfo>> {
        let mut state = self.state()?;
        let now = Instant::now();
        let group = state.stream_mut(stream)?.group_mut(group)?;

        let mut consumers: Vec<ConsumerInfo> = group
            .consumers
            .iter()
            .map(|(name, seen_at)| ConsumerInfo {
                name: name.clone(),
                pending: group.pending_of(name) as u64,
                idle: now.saturating_duration_since(*seen_at),
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn enqueue(&self, keys: &QueueKeys, task: &RawTask) -> SmithResult<Option<String>> {
        let id = self.state()?.insert_task(keys, task);
        if id.is_some() {
            self.shared.notify.notify_waiters();
        }
        Ok(id)
    }

    async fn enqueue_batch(
        &self,
        keys: &QueueKeys,
        tasks: &[RawTask],
    ) -> SmithResult<Vec<Option<String>>> {
        let ids: Vec<_> = {
            let mut state = self.state()?;
            tasks.iter().map(|t| state.insert_task(keys, t)).collect()
        };
        if ids.iter().any(Option::is_some) {
            self.shared.notify.notify_waiters();
        }
        Ok(ids)
    }

    async fn requeue(
        &self,
        keys: &QueueKeys,
        task_id: &str,
        task: &RawTask,
    ) -> SmithResult<Option<String>> {
        let old: EntryId = task_id.parse()?;
        let new_id = {
            let mut state = self.state()?;
            let acked = state
                .streams
                .get_mut(&keys.stream)
                .is_some_and(|stream| stream.ack(&keys.group, old));
            if !acked {
                return Ok(None);
            }

            state
                .sets
                .entry(keys.queue_names())
                .or_default()
                .insert(keys.qname.clone());
            if !task.dedup_key.is_empty() {
                state
                    .sets
                    .entry(keys.dedup_set.clone())
                    .or_default()
                    .insert(task.dedup_key.clone());
            }

            let fields = task
                .to_fields()
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect();
            let stream = state.streams.entry(keys.stream.clone()).or_default();
            let new_id = stream.add(fields);
            stream.delete(old);
            new_id
        };
        self.shared.notify.notify_waiters();
        Ok(Some(new_id.to_string()))
    }

    async fn dequeue(&self, keys: &QueueKeys, task_id: &str, dedup_key: &str) -> SmithResult<u64> {
        let id: EntryId = task_id.parse()?;
        let mut state = self.state()?;
        let Some(stream) = state.streams.get_mut(&keys.stream) else {
            return Ok(0);
        };
        let acked = stream.ack(&keys.group, id);
        let deleted = stream.delete(id);

        if acked && !dedup_key.is_empty() {
            if let Some(set) = state.sets.get_mut(&keys.dedup_set) {
                set.remove(dedup_key);
            }
        }
        Ok(deleted)
    }

    async fn delete_idle_consumer(&self, keys: &QueueKeys, consumer: &str) -> SmithResult<bool> {
        let mut state = self.state()?;
        let group = state.stream_mut(&keys.stream)?.group_mut(&keys.group)?;
        if !group.consumers.contains_key(consumer) || group.pending_of(consumer) > 0 {
            return Ok(false);
        }
        group.consumers.remove(consumer);
        Ok(true)
    }

    async fn record(&self, lists: &[ListAppend], counters: &[CounterIncr]) -> SmithResult<()> {
        let mut state = self.state()?;
        for append in lists {
            let list = state.lists.entry(append.key.clone()).or_default();
            list.push_back(append.value.clone());
            while list.len() > append.cap {
                list.pop_front();
            }
        }
        for incr in counters {
            *state
                .hashes
                .entry(incr.key.clone())
                .or_default()
                .entry(incr.field.to_string())
                .or_default() += incr.by;
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> SmithResult<Vec<String>> {
        let state = self.state()?;
        let Some(list) = state.lists.get(key) else {
            return Ok(Vec::new());
        };

        let len = list.len() as isize;
        let start = if start < 0 { (len + start).max(0) } else { start };
        let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if start > stop || start >= len {
            return Ok(Vec::new());
        }

        Ok(list
            .iter()
            .skip(start as usize)
            .take((stop - start + 1) as usize)
            .cloned()
            .collect())
    }

    async fn counters(&self, key: &str) -> SmithResult<HashMap<String, i64>> {
        Ok(self.state()?.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn set_members(&self, key: &str) -> SmithResult<Vec<String>> {
        Ok(self
            .state()?
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn stream_len(&self, stream: &str) -> SmithResult<u64> {
        Ok(self
            .state()?
            .streams
            .get(stream)
            .map_or(0, |s| s.entries.len() as u64))
    }

    async fn disconnect(&self) -> SmithResult<()> {
        self.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeySpace;

    fn raw(data: &str, dedup_key: &str) -> RawTask {
        RawTask {
            data: data.to_string(),
            dedup_key: dedup_key.to_string(),
            retry_count: 0,
        }
    }

    fn read<'a>(keys: &'a QueueKeys, consumer: &'a str, cursor: ReadCursor) -> GroupRead<'a> {
        GroupRead {
            stream: &keys.stream,
            group: &keys.group,
            consumer,
            count: 10,
            cursor,
            block: None,
        }
    }

    #[tokio::test]
    async fn test_dedup_enqueue() {
        let broker = MemoryBroker::new();
        let store = broker.open();
        let keys = KeySpace::new("t").queue("q");

        assert!(store.enqueue(&keys, &raw("1", "k")).await.unwrap().is_some());
        assert!(store.enqueue(&keys, &raw("2", "k")).await.unwrap().is_none());
        assert!(store.enqueue(&keys, &raw("3", "")).await.unwrap().is_some());
        assert!(store.enqueue(&keys, &raw("4", "")).await.unwrap().is_some());

        assert_eq!(store.stream_len(&keys.stream).await.unwrap(), 3);
        assert_eq!(store.set_members(&keys.dedup_set).await.unwrap(), vec!["k"]);
        assert_eq!(store.set_members(&keys.queue_names()).await.unwrap(), vec!["q"]);
    }

    #[tokio::test]
    async fn test_group_read_and_dequeue() {
        let broker = MemoryBroker::new();
        let store = broker.open();
        let keys = KeySpace::new("t").queue("q");

        store.create_group(&keys.stream, &keys.group).await.unwrap();
        assert!(matches!(
            store.create_group(&keys.stream, &keys.group).await,
            Err(SmithError::BusyGroup)
        ));

        let id = store.enqueue(&keys, &raw("1", "k")).await.unwrap().unwrap();
        let entries = store.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id);
        assert_eq!(entries[0].fields["data"], "1");

        // delivered once, now only visible as pending
        assert!(store.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap().is_empty());
        let pending = store.read_group(read(&keys, "c1", ReadCursor::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(store.read_group(read(&keys, "c2", ReadCursor::Pending)).await.unwrap().is_empty());

        assert_eq!(store.dequeue(&keys, &id, "k").await.unwrap(), 1);
        assert!(store.set_members(&keys.dedup_set).await.unwrap().is_empty());
        assert_eq!(store.stream_len(&keys.stream).await.unwrap(), 0);
        assert!(store.read_group(read(&keys, "c1", ReadCursor::Pending)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requeue_replaces_entry() {
        let broker = MemoryBroker::new();
        let store = broker.open();
        let keys = KeySpace::new("t").queue("q");
        store.create_group(&keys.stream, &keys.group).await.unwrap();

        let id = store.enqueue(&keys, &raw("1", "k")).await.unwrap().unwrap();
        store.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap();

        let mut retry = raw("1", "k");
        retry.retry_count = 1;
        let new_id = store.requeue(&keys, &id, &retry).await.unwrap().unwrap();
        assert_ne!(new_id, id);
        assert_eq!(store.stream_len(&keys.stream).await.unwrap(), 1);
        assert_eq!(store.set_members(&keys.dedup_set).await.unwrap(), vec!["k"]);

        let entries = store.read_group(read(&keys, "c2", ReadCursor::New)).await.unwrap();
        assert_eq!(entries[0].id, new_id);
        assert_eq!(entries[0].fields["retryCount"], "1");
    }

    #[tokio::test]
    async fn test_settled_entry_cannot_be_requeued_or_release_key() {
        let broker = MemoryBroker::new();
        let slow = broker.open();
        let peer = broker.open();
        let keys = KeySpace::new("t").queue("q");
        slow.create_group(&keys.stream, &keys.group).await.unwrap();

        let first = slow.enqueue(&keys, &raw("1", "k")).await.unwrap().unwrap();
        slow.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap();

        // the peer takes the entry over and finishes it
        let ids = vec![first.clone()];
        let claimed = peer
            .claim(&keys.stream, &keys.group, "c2", Duration::ZERO, &ids)
            .await
            .unwrap();
        assert_eq!(claimed, ids);
        assert_eq!(peer.dequeue(&keys, &first, "k").await.unwrap(), 1);

        let second = peer.enqueue(&keys, &raw("2", "k")).await.unwrap();
        assert!(second.is_some());

        let mut retry = raw("1", "k");
        retry.retry_count = 1;
        assert_eq!(slow.requeue(&keys, &first, &retry).await.unwrap(), None);
        assert_eq!(slow.dequeue(&keys, &first, "k").await.unwrap(), 0);

        assert_eq!(slow.stream_len(&keys.stream).await.unwrap(), 1);
        assert_eq!(slow.set_members(&keys.dedup_set).await.unwrap(), vec!["k"]);
        let entries = slow.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(Some(entries[0].id.clone()), second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_respects_min_idle() {
        let broker = MemoryBroker::new();
        let store = broker.open();
        let keys = KeySpace::new("t").queue("q");
        store.create_group(&keys.stream, &keys.group).await.unwrap();

        let id = store.enqueue(&keys, &raw("1", "")).await.unwrap().unwrap();
        store.read_group(read(&keys, "c1", ReadCursor::New)).await.unwrap();
        let ids = vec![id.clone()];
        let min_idle = Duration::from_millis(100);

        assert!(store.claim(&keys.stream, &keys.group, "c2", min_idle, &ids).await.unwrap().is_empty());

        tokio::time::advance(Duration::from_millis(150)).await;
        let claimed = store.claim(&keys.stream, &keys.group, "c2", min_idle, &ids).await.unwrap();
        assert_eq!(claimed, ids);

        let pending = store.pending(&keys.stream, &keys.group, "c2", 10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].delivery_count, 1);
        assert!(store.pending(&keys.stream, &keys.group, "c1", 10).await.unwrap().is_empty());

        assert!(store.delete_idle_consumer(&keys, "c1").await.unwrap());
        assert!(!store.delete_idle_consumer(&keys, "c2").await.unwrap());
        let names: Vec<_> = store
            .consumers(&keys.stream, &keys.group)
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["c2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_wakes_on_insert() {
        let broker = MemoryBroker::new();
        let reader = broker.open();
        let writer = broker.open();
        let keys = KeySpace::new("t").queue("q");
        reader.create_group(&keys.stream, &keys.group).await.unwrap();

        let read_keys = keys.clone();
        let handle = tokio::spawn(async move {
            let mut request = read(&read_keys, "c1", ReadCursor::New);
            request.block = Some(Duration::from_secs(60));
            reader.read_group(request).await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.enqueue(&keys, &raw("1", "")).await.unwrap();

        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_block_waits_for_insert() {
        let broker = MemoryBroker::new();
        let reader = broker.open();
        let writer = broker.open();
        let keys = KeySpace::new("t").queue("q");
        reader.create_group(&keys.stream, &keys.group).await.unwrap();

        let read_keys = keys.clone();
        let handle = tokio::spawn(async move {
            let mut request = read(&read_keys, "c1", ReadCursor::New);
            request.block = Some(Duration::MAX);
            reader.read_group(request).await
        });

        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!handle.is_finished());
        writer.enqueue(&keys, &raw("1", "")).await.unwrap();

        let entries = handle.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_read_times_out() {
        let broker = MemoryBroker::new();
        let store = broker.open();
        let keys = KeySpace::new("t").queue("q");
        store.create_group(&keys.stream, &keys.group).await.unwrap();

        let mut request = read(&keys, "c1", ReadCursor::New);
        request.block = Some(Duration::from_millis(50));
        assert!(store.read_group(request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capped_lists_and_counters() {
        let broker = MemoryBroker::new();
        let store = broker.open();

        for i in 0..5 {
            let append = ListAppend {
                key: "l".into(),
                value: i.to_string(),
                cap: 3,
            };
            let incr = CounterIncr {
                key: "h".into(),
                field: "processed",
                by: 1,
            };
            store.record(&[append], &[incr]).await.unwrap();
        }

        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["2", "3", "4"]);
        assert_eq!(store.list_range("l", -1, -1).await.unwrap(), vec!["4"]);
        assert!(store.list_range("l", 5, 10).await.unwrap().is_empty());
        assert_eq!(store.counters("h").await.unwrap()["processed"], 5);
    }

    #[tokio::test]
    async fn test_client_registry() {
        let broker = MemoryBroker::new();
        let a = broker.open();
        let b = broker.open();
        assert_ne!(a.client_id().await.unwrap(), b.client_id().await.unwrap());

        a.set_client_name("alpha").await.unwrap();
        b.set_client_name("beta").await.unwrap();
        assert_eq!(a.client_names().await.unwrap(), vec!["alpha", "beta"]);

        b.disconnect().await.unwrap();
        b.disconnect().await.unwrap();
        assert!(matches!(b.client_id().await, Err(SmithError::Disconnected)));
        assert_eq!(a.client_names().await.unwrap(), vec!["alpha"]);

        drop(a);
        assert_eq!(broker.connection_count(), 0);
    }
}
