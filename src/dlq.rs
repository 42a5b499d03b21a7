//! Dead letter queues for events that can never be applied.
//!
//! Each event type has its own stream, `{eventType}:dlq`, named after the
//! dot form so legacy underscore aliases share a queue. An entry carries
//! the original wire fields with `eventType` overwritten to
//! `event.validation_failed`, plus the context needed to investigate it:
//!
//! ```text
//! originalEventId    0b6c1f7e-...
//! originalEventType  role.permissions_changed
//! originalStream     crm:sync:role:role_permissions_changed
//! originalMessageId  1734000000000-0
//! dlqTimestamp       2025-12-11T10:00:00.000Z
//! validationErrors   ["Missing required field: tenantId"]
//! failureReason      validation
//! ```
//!
//! Entries stay until removed after manual review.

use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::broker::{BrokerError, StreamBroker, StreamMessage};
use crate::event::{canonical_event_type, serialize_value};

/// `eventType` written on every DLQ entry.
pub const DLQ_EVENT_TYPE: &str = "event.validation_failed";

/// Maximum entries to keep per DLQ stream (older entries are trimmed)
pub const DLQ_MAX_LEN: usize = 10000;

/// Fields decoded back into JSON when reading entries.
const JSON_FIELDS: [&str; 3] = ["data", "metadata", "validationErrors"];

/// Why an event ended up in a DLQ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Rejected by the schema validator
    Validation,
    /// The envelope could not be turned into an event
    Unparseable,
    /// The publisher could not append to the target stream
    PublishFailed,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Validation => "validation",
            FailureReason::Unparseable => "unparseable",
            FailureReason::PublishFailed => "publish_failed",
        }
    }
}

/// An event on its way to a DLQ.
#[derive(Debug, Clone)]
pub struct DeadLetter<'a> {
    /// The event as it was received (normalized object form)
    pub event: &'a Value,
    pub errors: &'a [String],
    pub reason: FailureReason,
    pub original_stream: Option<&'a str>,
    pub original_message_id: Option<&'a str>,
}

/// A stored DLQ entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqEntry {
    pub id: String,
    pub fields: Value,
}

/// DLQ stream name for an event type.
pub fn dlq_stream_name(event_type: &str) -> String {
    if event_type.is_empty() {
        return "unknown:dlq".to_string();
    }
    format!("{}:dlq", canonical_event_type(event_type))
}

/// Per-event-type dead letter queues on top of a broker.
#[derive(Clone)]
pub struct DeadLetterQueue {
    broker: Arc<dyn StreamBroker>,
    max_len: usize,
}

impl DeadLetterQueue {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self::with_max_len(broker, DLQ_MAX_LEN)
    }

    pub fn with_max_len(broker: Arc<dyn StreamBroker>, max_len: usize) -> Self {
        Self { broker, max_len }
    }

    /// Append a dead letter. Returns the DLQ stream and entry ID.
    pub async fn publish(&self, letter: DeadLetter<'_>) -> Result<(String, String), DlqError> {
        let original_type = letter
            .event
            .get("eventType")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let original_id = letter
            .event
            .get("eventId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stream = dlq_stream_name(&original_type);

        let mut entry = letter.event.as_object().cloned().unwrap_or_else(Map::new);
        entry.insert("eventType".into(), Value::from(DLQ_EVENT_TYPE));
        entry.insert("originalEventId".into(), Value::from(original_id.clone()));
        entry.insert("originalEventType".into(), Value::from(original_type.clone()));
        entry.insert(
            "dlqTimestamp".into(),
            Value::from(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        entry.insert("validationErrors".into(), Value::from(letter.errors.to_vec()));
        entry.insert("failureReason".into(), Value::from(letter.reason.as_str()));
        if let Some(original_stream) = letter.original_stream {
            entry.insert("originalStream".into(), Value::from(original_stream));
        }
        if let Some(message_id) = letter.original_message_id {
            entry.insert("originalMessageId".into(), Value::from(message_id));
        }

        let fields = serialize_value(&Value::Object(entry));
        let id = self
            .broker
            .append(&stream, &fields, Some(self.max_len))
            .await
            .map_err(|e| {
                error!(stream = %stream, error = %e, "Failed to add event to DLQ");
                DlqError::from(e)
            })?;

        info!(
            dlq_stream = %stream,
            dlq_id = %id,
            original_event_id = %original_id,
            reason = letter.reason.as_str(),
            errors = letter.errors.len(),
            "Event moved to dead letter queue"
        );

        Ok((stream, id))
    }

    /// Number of entries in the DLQ for `event_type`.
    pub async fn count(&self, event_type: &str) -> Result<u64, DlqError> {
        Ok(self.broker.len(&dlq_stream_name(event_type)).await?)
    }

    /// List entries, oldest first.
    pub async fn list(
        &self,
        event_type: &str,
        count: usize,
        offset: usize,
    ) -> Result<Vec<DlqEntry>, DlqError> {
        let entries = self
            .broker
            .range(&dlq_stream_name(event_type), "-", "+", count + offset)
            .await?;

        let result: Vec<DlqEntry> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(decode_entry)
            .collect();

        debug!(event_type = %event_type, count = result.len(), "Retrieved DLQ entries");
        Ok(result)
    }

    pub async fn get(&self, event_type: &str, id: &str) -> Result<Option<DlqEntry>, DlqError> {
        let entries = self
            .broker
            .range(&dlq_stream_name(event_type), id, id, 1)
            .await?;
        Ok(entries.into_iter().next().map(decode_entry))
    }

    /// Remove an entry after manual review or replay.
    pub async fn remove(&self, event_type: &str, id: &str) -> Result<bool, DlqError> {
        let removed = self
            .broker
            .delete(&dlq_stream_name(event_type), &[id.to_string()])
            .await?;

        if removed > 0 {
            info!(event_type = %event_type, id = %id, "Removed event from DLQ");
            Ok(true)
        } else {
            debug!(event_type = %event_type, id = %id, "Event not found in DLQ");
            Ok(false)
        }
    }
}

fn decode_entry(message: StreamMessage) -> DlqEntry {
    let mut object = Map::new();
    for (key, value) in message.fields {
        let decoded = if JSON_FIELDS.contains(&key.as_str()) {
            serde_json::from_str(&value).unwrap_or(Value::String(value))
        } else {
            Value::String(value)
        };
        object.insert(key, decoded);
    }
    DlqEntry {
        id: message.id,
        fields: Value::Object(object),
    }
}

/// Errors that can occur when working with a dead letter queue.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("DLQ broker error: {0}")]
    Broker(#[from] BrokerError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    fn invalid_event() -> Value {
        json!({
            "eventId": "0b6c1f7e-3a4d-4c1e-9a7b-2f1e5d6c7b8a",
            "eventType": "role.permissions_changed",
            "entityId": "r1",
            "data": {"roleId": "r1"}
        })
    }

    #[test]
    fn test_dlq_stream_name() {
        assert_eq!(dlq_stream_name("user.created"), "user.created:dlq");
        assert_eq!(dlq_stream_name(""), "unknown:dlq");
        assert_eq!(dlq_stream_name("role_permissions_changed"), "role.permissions_changed:dlq");
    }

    #[tokio::test]
    async fn test_legacy_alias_shares_queue() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryBroker::new()));
        let mut event = invalid_event();
        event["eventType"] = json!("role_permissions_changed");

        let (stream, _) = dlq
            .publish(DeadLetter {
                event: &event,
                errors: &[],
                reason: FailureReason::Validation,
                original_stream: None,
                original_message_id: None,
            })
            .await
            .unwrap();
        assert_eq!(stream, "role.permissions_changed:dlq");
        assert_eq!(dlq.count("role_permissions_changed").await.unwrap(), 1);
        assert_eq!(dlq.count("role.permissions_changed").await.unwrap(), 1);

        let listed = dlq.list("role.permissions_changed", 10, 0).await.unwrap();
        assert_eq!(listed[0].fields["originalEventType"], "role_permissions_changed");
    }

    #[tokio::test]
    async fn test_publish_and_inspect() {
        let dlq = DeadLetterQueue::new(Arc::new(MemoryBroker::new()));
        let event = invalid_event();
        let errors = vec!["Missing required field: tenantId".to_string()];

        let (stream, id) = dlq
            .publish(DeadLetter {
                event: &event,
                errors: &errors,
                reason: FailureReason::Validation,
                original_stream: Some("crm:sync:role:role_permissions_changed"),
                original_message_id: Some("1-0"),
            })
            .await
            .unwrap();
        assert_eq!(stream, "role.permissions_changed:dlq");
        assert_eq!(dlq.count("role.permissions_changed").await.unwrap(), 1);

        let entry = dlq.get("role.permissions_changed", &id).await.unwrap().unwrap();
        let fields = &entry.fields;
        assert_eq!(fields["eventType"], DLQ_EVENT_TYPE);
        assert_eq!(fields["originalEventId"], event["eventId"]);
        assert_eq!(fields["originalEventType"], "role.permissions_changed");
        assert_eq!(fields["originalMessageId"], "1-0");
        assert_eq!(fields["validationErrors"], json!(errors));
        assert_eq!(fields["data"]["roleId"], "r1");

        let listed = dlq.list("role.permissions_changed", 10, 0).await.unwrap();
        assert_eq!(listed, vec![entry]);

        assert!(dlq.remove("role.permissions_changed", &id).await.unwrap());
        assert!(!dlq.remove("role.permissions_changed", &id).await.unwrap());
        assert_eq!(dlq.count("role.permissions_changed").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publish_fails_on_closed_broker() {
        let broker = Arc::new(MemoryBroker::new());
        let dlq = DeadLetterQueue::new(broker.clone());
        broker.close().await;

        let event = invalid_event();
        let result = dlq
            .publish(DeadLetter {
                event: &event,
                errors: &[],
                reason: FailureReason::Validation,
                original_stream: None,
                original_message_id: None,
            })
            .await;
        assert!(matches!(result, Err(DlqError::Broker(BrokerError::Closed))));
    }
}
