//! In-process broker with Redis consumer-group semantics.
//!
//! Models what the engine relies on: per-group last-delivered cursor, a
//! pending entries list (PEL) per group with owning consumer and delivery
//! time, `>` vs `0` reads, auto-claim by idle time, acknowledgement, and
//! SET NX style markers with expiry. Blocking reads return immediately.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tokio::time::Instant;

use super::{
    BrokerError, ConsumerInfo, ConsumerPending, GroupInfo, PendingSummary, ReadCursor,
    StreamBroker, StreamInfo, StreamMessage,
};

type EntryId = (u64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn parse_id(raw: &str) -> Option<EntryId> {
    match raw.split_once('-') {
        Some((ms, seq)) => Some((ms.parse().ok()?, seq.parse().ok()?)),
        None => Some((raw.parse().ok()?, 0)),
    }
}

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Debug, Default)]
struct MemGroup {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingEntry>,
    consumers: HashMap<String, Instant>,
}

impl MemGroup {
    fn touch(&mut self, consumer: &str) {
        self.consumers.insert(consumer.to_string(), Instant::now());
    }
}

#[derive(Debug, Default)]
struct MemStream {
    entries: BTreeMap<EntryId, HashMap<String, String>>,
    last_id: EntryId,
    groups: HashMap<String, MemGroup>,
}

impl MemStream {
    fn trim_to(&mut self, max_len: usize) -> u64 {
        let mut removed = 0;
        while self.entries.len() > max_len {
            self.entries.pop_first();
            removed += 1;
        }
        removed
    }

    fn message(&self, stream: &str, id: EntryId) -> StreamMessage {
        StreamMessage {
            stream: stream.to_string(),
            id: format_id(id),
            fields: self.entries.get(&id).cloned().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    streams: HashMap<String, MemStream>,
    markers: HashMap<String, (String, Instant)>,
    closed: bool,
}

/// In-memory [`StreamBroker`].
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    failing_pings: AtomicU32,
    rejected_groups: Mutex<HashSet<String>>,
    group_delay: Mutex<Option<Duration>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` pings fail with a connection error.
    pub fn fail_next_pings(&self, n: u32) {
        self.failing_pings.store(n, Ordering::SeqCst);
    }

    /// Make XGROUP CREATE on `stream` fail until [`Self::allow_groups_on`].
    pub fn reject_groups_on(&self, stream: &str) {
        self.rejected_groups.lock().insert(stream.to_string());
    }

    pub fn allow_groups_on(&self, stream: &str) {
        self.rejected_groups.lock().remove(stream);
    }

    /// Sleep this long inside every group creation.
    pub fn delay_group_creation(&self, delay: Option<Duration>) {
        *self.group_delay.lock() = delay;
    }

    /// Drop `group` from `stream`, as XGROUP DESTROY would.
    pub fn destroy_group(&self, stream: &str, group: &str) -> bool {
        self.state
            .lock()
            .streams
            .get_mut(stream)
            .is_some_and(|s| s.groups.remove(group).is_some())
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn open(&self) -> Result<MutexGuard<'_, MemoryState>, BrokerError> {
        let state = self.state.lock();
        if state.closed {
            return Err(BrokerError::Closed);
        }
        Ok(state)
    }
}

fn stream_mut<'a>(
    state: &'a mut MemoryState,
    stream: &str,
) -> Result<&'a mut MemStream, BrokerError> {
    state
        .streams
        .get_mut(stream)
        .ok_or_else(|| BrokerError::NoSuchKey(stream.to_string()))
}

fn group_mut<'a>(
    state: &'a mut MemoryState,
    stream: &str,
    group: &str,
) -> Result<&'a mut MemGroup, BrokerError> {
    state
        .streams
        .get_mut(stream)
        .and_then(|s| s.groups.get_mut(group))
        .ok_or_else(|| BrokerError::NoGroup(format!("{} on {}", group, stream)))
}

#[async_trait]
impl StreamBroker for MemoryBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let _state = self.open()?;
        let failing = self.failing_pings.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_pings.store(failing - 1, Ordering::SeqCst);
            return Err(BrokerError::Connection("connection refused".to_string()));
        }
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let delay = *self.group_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.rejected_groups.lock().contains(stream) {
            return Err(BrokerError::Command(format!("ERR group creation refused on {}", stream)));
        }

        let mut state = self.open()?;
        let entry = state.streams.entry(stream.to_string()).or_default();
        if entry.groups.contains_key(group) {
            return Err(BrokerError::GroupExists(group.to_string()));
        }
        let last_delivered = match start_id {
            "$" => entry.last_id,
            raw => parse_id(raw).ok_or_else(|| BrokerError::Command(format!("invalid id {}", raw)))?,
        };
        entry.groups.insert(
            group.to_string(),
            MemGroup {
                last_delivered,
                ..Default::default()
            },
        );
        Ok(())
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, BrokerError> {
        let mut state = self.open()?;
        let entry = stream_mut(&mut state, stream)?;
        let mut groups: Vec<GroupInfo> = entry
            .groups
            .iter()
            .map(|(name, g)| GroupInfo {
                name: name.clone(),
                consumers: g.consumers.len() as u64,
                pending: g.pending.len() as u64,
                last_delivered_id: format_id(g.last_delivered),
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, BrokerError> {
        let mut state = self.open()?;
        stream_mut(&mut state, stream)?;
        let g = group_mut(&mut state, stream, group)?;
        let now = Instant::now();
        let mut consumers: Vec<ConsumerInfo> = g
            .consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: g.pending.values().filter(|p| &p.consumer == name).count() as u64,
                idle_ms: now.saturating_duration_since(*seen).as_millis() as u64,
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        let mut state = self.open()?;
        stream_mut(&mut state, stream)?;
        let g = group_mut(&mut state, stream, group)?;
        if g.pending.is_empty() {
            return Ok(PendingSummary::default());
        }
        let mut per_consumer: BTreeMap<String, u64> = BTreeMap::new();
        for entry in g.pending.values() {
            *per_consumer.entry(entry.consumer.clone()).or_default() += 1;
        }
        Ok(PendingSummary {
            count: g.pending.len() as u64,
            smallest_id: g.pending.keys().next().copied().map(format_id),
            largest_id: g.pending.keys().next_back().copied().map(format_id),
            consumers: per_consumer
                .into_iter()
                .map(|(name, count)| ConsumerPending { name, count })
                .collect(),
        })
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let mut state = self.open()?;
        let entry = stream_mut(&mut state, stream)?;
        Ok(StreamInfo {
            length: entry.entries.len() as u64,
            groups: entry.groups.len() as u64,
            first_id: entry.entries.keys().next().copied().map(format_id),
            last_id: entry.entries.keys().next_back().copied().map(format_id),
            last_generated_id: Some(format_id(entry.last_id)),
        })
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, BrokerError> {
        let mut state = self.open()?;
        let g = group_mut(&mut state, stream, group)?;
        g.consumers.remove(consumer);
        let before = g.pending.len();
        g.pending.retain(|_, p| p.consumer != consumer);
        Ok((before - g.pending.len()) as u64)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        cursor: ReadCursor,
        count: usize,
        _block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut state = self.open()?;
        for stream in streams {
            group_mut(&mut state, stream, group)?;
        }

        let now = Instant::now();
        let mut messages = Vec::new();
        for stream in streams {
            let entry = stream_mut(&mut state, stream)?;
            let MemStream {
                entries, groups, ..
            } = entry;
            let Some(g) = groups.get_mut(group) else { continue };
            g.touch(consumer);

            match cursor {
                ReadCursor::New => {
                    let ids: Vec<EntryId> = entries
                        .range((
                            std::ops::Bound::Excluded(g.last_delivered),
                            std::ops::Bound::Unbounded,
                        ))
                        .take(count)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        g.last_delivered = id;
                        g.pending.insert(
                            id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                deliveries: 1,
                            },
                        );
                        messages.push(StreamMessage {
                            stream: stream.clone(),
                            id: format_id(id),
                            fields: entries.get(&id).cloned().unwrap_or_default(),
                        });
                    }
                }
                ReadCursor::Pending => {
                    for (id, pending) in g
                        .pending
                        .iter_mut()
                        .filter(|(_, p)| p.consumer == consumer)
                        .take(count)
                    {
                        pending.deliveries += 1;
                        pending.delivered_at = now;
                        messages.push(StreamMessage {
                            stream: stream.clone(),
                            id: format_id(*id),
                            fields: entries.get(id).cloned().unwrap_or_default(),
                        });
                    }
                }
            }
        }
        Ok(messages)
    }

    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut state = self.open()?;
        group_mut(&mut state, stream, group)?;
        let entry = stream_mut(&mut state, stream)?;
        let now = Instant::now();

        let idle: Vec<EntryId> = entry
            .groups
            .get(group)
            .map(|g| {
                g.pending
                    .iter()
                    .filter(|(_, p)| now.saturating_duration_since(p.delivered_at) >= min_idle)
                    .take(count)
                    .map(|(id, _)| *id)
                    .collect()
            })
            .unwrap_or_default();

        let mut claimed = Vec::new();
        for id in idle {
            let exists = entry.entries.contains_key(&id);
            let Some(g) = entry.groups.get_mut(group) else { break };
            if !exists {
                // Redis >= 7 drops deleted entries from the PEL during XAUTOCLAIM.
                g.pending.remove(&id);
                continue;
            }
            if let Some(p) = g.pending.get_mut(&id) {
                p.consumer = consumer.to_string();
                p.delivered_at = now;
                p.deliveries += 1;
            }
            g.touch(consumer);
            claimed.push(entry.message(stream, id));
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        let mut state = self.open()?;
        let g = group_mut(&mut state, stream, group)?;
        let acked = ids
            .iter()
            .filter_map(|raw| parse_id(raw))
            .filter(|id| g.pending.remove(id).is_some())
            .count();
        Ok(acked as u64)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, BrokerError> {
        let mut state = self.open()?;
        let entry = state.streams.entry(stream.to_string()).or_default();
        let id = (entry.last_id.0 + 1, 0);
        entry.last_id = id;
        entry.entries.insert(id, fields.iter().cloned().collect());
        if let Some(max_len) = max_len {
            entry.trim_to(max_len);
        }
        Ok(format_id(id))
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, BrokerError> {
        let mut state = self.open()?;
        Ok(state
            .streams
            .get_mut(stream)
            .map(|s| s.trim_to(max_len))
            .unwrap_or(0))
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        let state = self.open()?;
        Ok(state
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let state = self.open()?;
        let Some(entry) = state.streams.get(stream) else {
            return Ok(Vec::new());
        };
        let start = if start == "-" { (0, 0) } else { parse_id(start).unwrap_or((0, 0)) };
        let end = if end == "+" {
            (u64::MAX, u64::MAX)
        } else {
            parse_id(end).unwrap_or((u64::MAX, u64::MAX))
        };
        if start > end {
            return Ok(Vec::new());
        }
        Ok(entry
            .entries
            .range(start..=end)
            .take(count)
            .map(|(id, _)| entry.message(stream, *id))
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, BrokerError> {
        let mut state = self.open()?;
        let Some(entry) = state.streams.get_mut(stream) else {
            return Ok(0);
        };
        let removed = ids
            .iter()
            .filter_map(|raw| parse_id(raw))
            .filter(|id| entry.entries.remove(id).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut state = self.open()?;
        let now = Instant::now();
        if let Some((_, expires)) = state.markers.get(key) {
            if *expires > now {
                return Ok(false);
            }
        }
        state
            .markers
            .insert(key.to_string(), (value.to_string(), now + ttl));
        Ok(true)
    }

    async fn has_marker(&self, key: &str) -> Result<bool, BrokerError> {
        let state = self.open()?;
        Ok(state
            .markers
            .get(key)
            .is_some_and(|(_, expires)| *expires > Instant::now()))
    }

    async fn close(&self) {
        self.state.lock().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(value: &str) -> Vec<(String, String)> {
        vec![("k".to_string(), value.to_string())]
    }

    #[tokio::test]
    async fn test_group_semantics() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g", "0").await.unwrap();
        assert_eq!(
            broker.create_group("s", "g", "0").await,
            Err(BrokerError::GroupExists("g".to_string()))
        );

        broker.append("s", &fields("a"), None).await.unwrap();
        broker.append("s", &fields("b"), None).await.unwrap();

        let streams = vec!["s".to_string()];
        let first = broker
            .read_group("g", "c1", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);

        let again = broker
            .read_group("g", "c1", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert!(again.is_empty());

        let pending = broker
            .read_group("g", "c1", &streams, ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 2);

        broker.ack("s", "g", &[first[0].id.clone()]).await.unwrap();
        let summary = broker.pending("s", "g").await.unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.consumers[0].name, "c1");
    }

    #[tokio::test]
    async fn test_missing_group_and_stream() {
        let broker = MemoryBroker::new();
        assert!(broker.groups("nope").await.unwrap_err().is_missing());
        broker.create_group("s", "g", "$").await.unwrap();
        assert!(broker.consumers("s", "other").await.unwrap_err().is_missing());
    }

    #[tokio::test]
    async fn test_rejected_group_creation() {
        let broker = MemoryBroker::new();
        broker.reject_groups_on("s");
        let err = broker.create_group("s", "g", "$").await.unwrap_err();
        assert!(matches!(err, BrokerError::Command(_)));
        assert!(broker.groups("s").await.is_err());

        broker.allow_groups_on("s");
        broker.create_group("s", "g", "$").await.unwrap();
        assert_eq!(broker.groups("s").await.unwrap().len(), 1);

        assert!(broker.destroy_group("s", "g"));
        assert!(!broker.destroy_group("s", "g"));
        let err = broker
            .read_group("g", "c", &["s".to_string()], ReadCursor::New, 10, None)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::NoGroup(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_claim_idle_entries() {
        let broker = MemoryBroker::new();
        broker.create_group("s", "g", "0").await.unwrap();
        broker.append("s", &fields("a"), None).await.unwrap();
        let streams = vec!["s".to_string()];
        broker
            .read_group("g", "dead", &streams, ReadCursor::New, 10, None)
            .await
            .unwrap();

        let early = broker
            .auto_claim("s", "g", "alive", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert!(early.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let claimed = broker
            .auto_claim("s", "g", "alive", Duration::from_secs(30), 10)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].fields["k"], "a");
    }

    #[tokio::test]
    async fn test_markers_and_close() {
        let broker = MemoryBroker::new();
        assert!(broker.set_marker("m", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!broker.set_marker("m", "1", Duration::from_secs(60)).await.unwrap());
        assert!(broker.has_marker("m").await.unwrap());

        broker.close().await;
        assert_eq!(broker.ping().await, Err(BrokerError::Closed));
    }
}
