//! Stream broker abstraction.
//!
//! Everything the coordinator, publisher, ledger and engine need from Redis
//! Streams goes through [`StreamBroker`]. [`RedisBroker`] is the production
//! implementation on a `deadpool-redis` pool; [`MemoryBroker`] models the
//! same consumer-group semantics in process for tests and local runs.

pub mod memory;
pub mod redis;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

/// Errors reported by a broker.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BrokerError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    /// The stream does not exist yet
    #[error("no such stream: {0}")]
    NoSuchKey(String),

    /// The consumer group does not exist
    #[error("no such consumer group: {0}")]
    NoGroup(String),

    /// XGROUP CREATE on an existing group (BUSYGROUP)
    #[error("consumer group already exists: {0}")]
    GroupExists(String),

    #[error("broker connection closed")]
    Closed,
}

impl BrokerError {
    /// Stream or group not created yet.
    pub fn is_missing(&self) -> bool {
        matches!(self, BrokerError::NoSuchKey(_) | BrokerError::NoGroup(_))
    }
}

/// A message read from a stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// Stream the message was read from
    pub stream: String,

    /// Broker-assigned ID (e.g. "1734000000000-0")
    pub id: String,

    /// String-valued fields; empty when the entry was deleted while pending
    pub fields: HashMap<String, String>,
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Never-delivered messages (`>`)
    New,
    /// Messages already delivered to this consumer but not acknowledged (`0`)
    Pending,
}

impl ReadCursor {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// One consumer group on a stream (XINFO GROUPS).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupInfo {
    pub name: String,
    pub consumers: u64,
    pub pending: u64,
    pub last_delivered_id: String,
}

/// One consumer inside a group (XINFO CONSUMERS).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle_ms: u64,
}

/// Pending entries per consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerPending {
    pub name: String,
    pub count: u64,
}

/// Summary form of XPENDING.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSummary {
    pub count: u64,
    pub smallest_id: Option<String>,
    pub largest_id: Option<String>,
    pub consumers: Vec<ConsumerPending>,
}

/// Summary form of XINFO STREAM.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub length: u64,
    pub groups: u64,
    pub first_id: Option<String>,
    pub last_id: Option<String>,
    pub last_generated_id: Option<String>,
}

/// Redis Streams operations used by the integration layer.
///
/// Implementations must be `Send + Sync`; the engine shares one broker
/// between its loop and its maintenance timers.
#[async_trait]
pub trait StreamBroker: Send + Sync {
    /// Round-trip check (PING).
    async fn ping(&self) -> Result<(), BrokerError>;

    /// XGROUP CREATE ... MKSTREAM. Fails with [`BrokerError::GroupExists`]
    /// when the group is already there.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str)
        -> Result<(), BrokerError>;

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, BrokerError>;

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, BrokerError>;

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError>;

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError>;

    /// XGROUP DELCONSUMER. Returns the number of pending entries dropped.
    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, BrokerError>;

    /// XREADGROUP over several streams sharing one group.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    /// XAUTOCLAIM entries idle for at least `min_idle` onto `consumer`.
    async fn auto_claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError>;

    /// XADD with an optional approximate MAXLEN cap. Returns the new ID.
    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, BrokerError>;

    /// XTRIM MAXLEN ~ `max_len`. Returns the number of entries removed.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, BrokerError>;

    async fn len(&self, stream: &str) -> Result<u64, BrokerError>;

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError>;

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, BrokerError>;

    /// SET NX with expiry. Returns true if the marker was newly written.
    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError>;

    async fn has_marker(&self, key: &str) -> Result<bool, BrokerError>;

    /// Release connections. Later calls fail with [`BrokerError::Closed`].
    async fn close(&self);
}
