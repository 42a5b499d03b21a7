//! Redis Streams broker on a `deadpool-redis` connection pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::streams::{
    StreamInfoConsumersReply, StreamInfoGroupsReply, StreamPendingReply, StreamReadOptions,
    StreamReadReply,
};
use deadpool_redis::redis::{self, cmd, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{debug, error};

use super::{
    BrokerError, ConsumerInfo, ConsumerPending, GroupInfo, PendingSummary, ReadCursor,
    StreamBroker, StreamInfo, StreamMessage,
};

/// Production broker backed by Redis.
#[derive(Clone)]
pub struct RedisBroker {
    pool: Pool,
}

impl RedisBroker {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Build a pool from a `redis://` URL. No connection is opened yet.
    pub fn from_url(url: &str) -> Result<Self, BrokerError> {
        let pool = Config::from_url(url)
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> Result<Connection, BrokerError> {
        if self.pool.is_closed() {
            return Err(BrokerError::Closed);
        }
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection");
            BrokerError::Connection(e.to_string())
        })
    }
}

/// Classify a Redis error by its reply prefix.
fn map_err(e: RedisError, key: &str) -> BrokerError {
    let message = e.to_string();
    if message.contains("BUSYGROUP") {
        BrokerError::GroupExists(key.to_string())
    } else if message.contains("NOGROUP") {
        BrokerError::NoGroup(key.to_string())
    } else if message.to_lowercase().contains("no such key") {
        BrokerError::NoSuchKey(key.to_string())
    } else if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout() {
        BrokerError::Connection(message)
    } else {
        BrokerError::Command(message)
    }
}

fn value_string(value: &RedisValue) -> Option<String> {
    redis::from_redis_value::<String>(value).ok()
}

fn value_u64(value: &RedisValue) -> u64 {
    redis::from_redis_value::<u64>(value).unwrap_or(0)
}

fn string_fields(map: &HashMap<String, RedisValue>) -> HashMap<String, String> {
    map.iter()
        .filter_map(|(k, v)| value_string(v).map(|v| (k.clone(), v)))
        .collect()
}

/// Parse `[id, [k, v, ...]]`; the field list is nil for deleted entries.
fn parse_entry(stream: &str, value: &RedisValue) -> Option<StreamMessage> {
    let RedisValue::Array(parts) = value else {
        return None;
    };
    let id = parts.first().and_then(value_string)?;
    let fields = match parts.get(1) {
        Some(RedisValue::Array(items)) => items
            .chunks_exact(2)
            .filter_map(|pair| Some((value_string(&pair[0])?, value_string(&pair[1])?)))
            .collect(),
        _ => HashMap::new(),
    };
    Some(StreamMessage {
        stream: stream.to_string(),
        id,
        fields,
    })
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: String = cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, "PING"))?;
        Ok(())
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let mut conn = self.conn().await?;
        let _: () = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, group))?;
        Ok(())
    }

    async fn groups(&self, stream: &str) -> Result<Vec<GroupInfo>, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: StreamInfoGroupsReply = conn
            .xinfo_groups(stream)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(reply
            .groups
            .into_iter()
            .map(|g| GroupInfo {
                name: g.name,
                consumers: g.consumers as u64,
                pending: g.pending as u64,
                last_delivered_id: g.last_delivered_id,
            })
            .collect())
    }

    async fn consumers(&self, stream: &str, group: &str) -> Result<Vec<ConsumerInfo>, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: StreamInfoConsumersReply = conn
            .xinfo_consumers(stream, group)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle_ms: c.idle as u64,
            })
            .collect())
    }

    async fn pending(&self, stream: &str, group: &str) -> Result<PendingSummary, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: StreamPendingReply = conn
            .xpending(stream, group)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(match reply {
            StreamPendingReply::Empty => PendingSummary::default(),
            StreamPendingReply::Data(data) => PendingSummary {
                count: data.count as u64,
                smallest_id: Some(data.start_id),
                largest_id: Some(data.end_id),
                consumers: data
                    .consumers
                    .into_iter()
                    .map(|c| ConsumerPending {
                        name: c.name,
                        count: c.pending as u64,
                    })
                    .collect(),
            },
        })
    }

    async fn stream_info(&self, stream: &str) -> Result<StreamInfo, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: HashMap<String, RedisValue> = cmd("XINFO")
            .arg("STREAM")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;

        let entry_id = |key: &str| {
            reply
                .get(key)
                .and_then(|v| parse_entry(stream, v))
                .map(|m| m.id)
        };

        Ok(StreamInfo {
            length: reply.get("length").map(value_u64).unwrap_or(0),
            groups: reply.get("groups").map(value_u64).unwrap_or(0),
            first_id: entry_id("first-entry"),
            last_id: entry_id("last-entry"),
            last_generated_id: reply.get("last-generated-id").and_then(value_string),
        })
    }

    async fn delete_consumer(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
    ) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let dropped: u64 = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(dropped)
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn().await?;

        let mut opts = StreamReadOptions::default().group(group, consumer).count(count);
        // BLOCK only applies to `>` reads.
        if let (ReadCursor::New, Some(block)) = (cursor, block) {
            opts = opts.block(block.as_millis() as usize);
        }
        let ids = vec![cursor.as_id(); streams.len()];

        let reply: Option<StreamReadReply> = conn
            .xread_options(streams, &ids, &opts)
            .await
            .map_err(|e| map_err(e, group))?;

        let mut messages = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            for entry in key.ids {
                messages.push(StreamMessage {
                    stream: key.key.clone(),
                    id: entry.id.clone(),
                    fields: string_fields(&entry.map),
                });
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
        let mut conn = self.conn().await?;
        // Reply: [next-id, [entries...], [deleted-ids...]] (deleted list on Redis >= 7)
        let reply: RedisValue = cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;

        let RedisValue::Array(parts) = reply else {
            return Ok(Vec::new());
        };
        let Some(RedisValue::Array(entries)) = parts.get(1) else {
            return Ok(Vec::new());
        };
        let claimed: Vec<StreamMessage> = entries
            .iter()
            .filter_map(|entry| parse_entry(stream, entry))
            .collect();
        if !claimed.is_empty() {
            debug!(stream = %stream, count = claimed.len(), "Auto-claimed idle pending messages");
        }
        Ok(claimed)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let acked: u64 = conn
            .xack(stream, group, ids)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(acked)
    }

    async fn append(
        &self,
        stream: &str,
        fields: &[(String, String)],
        max_len: Option<usize>,
    ) -> Result<String, BrokerError> {
        let mut conn = self.conn().await?;
        let mut command = cmd("XADD");
        command.arg(stream);
        if let Some(max_len) = max_len {
            command.arg("MAXLEN").arg("~").arg(max_len);
        }
        command.arg("*");
        for (key, value) in fields {
            command.arg(key).arg(value);
        }
        let id: String = command
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(id)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let removed: u64 = cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(removed)
    }

    async fn len(&self, stream: &str) -> Result<u64, BrokerError> {
        let mut conn = self.conn().await?;
        let len: u64 = cmd("XLEN")
            .arg(stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(len)
    }

    async fn range(
        &self,
        stream: &str,
        start: &str,
        end: &str,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let mut conn = self.conn().await?;
        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(stream)
            .arg(start)
            .arg(end)
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;

        Ok(entries
            .into_iter()
            .map(|(id, fields)| StreamMessage {
                stream: stream.to_string(),
                id,
                fields: fields.into_iter().collect(),
            })
            .collect())
    }

    async fn delete(&self, stream: &str, ids: &[String]) -> Result<u64, BrokerError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn().await?;
        let mut command = cmd("XDEL");
        command.arg(stream);
        for id in ids {
            command.arg(id);
        }
        let removed: u64 = command
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, stream))?;
        Ok(removed)
    }

    async fn set_marker(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let reply: Option<String> = cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, key))?;
        Ok(reply.is_some())
    }

    async fn has_marker(&self, key: &str) -> Result<bool, BrokerError> {
        let mut conn = self.conn().await?;
        let exists: u64 = cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_err(e, key))?;
        Ok(exists > 0)
    }

    async fn close(&self) {
        self.pool.close();
    }
}
