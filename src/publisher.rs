//! Event publisher.
//!
//! Builds standard events, validates them before they reach a stream, and
//! diverts anything that cannot be published to the event type's DLQ before
//! reporting the error to the caller.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::broker::StreamBroker;
use crate::dlq::{DeadLetter, DeadLetterQueue, FailureReason};
use crate::event::{create_standard_event, serialize_event};
use crate::validation::validate;

/// What the caller gets back for a published event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishReceipt {
    pub success: bool,
    pub event_id: String,
    pub message_id: String,
    pub stream_key: String,
    pub event_type: String,
    pub entity_id: String,
    pub tenant_id: String,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("event {event_id} failed validation: {}", .errors.join("; "))]
    Validation { event_id: String, errors: Vec<String> },

    #[error("failed to publish event {event_id} to {stream}: {reason}")]
    Broker {
        event_id: String,
        stream: String,
        reason: String,
    },
}

pub struct EventPublisher {
    broker: Arc<dyn StreamBroker>,
    breaker: Arc<CircuitBreaker>,
    dlq: DeadLetterQueue,
    source_app: String,
    max_len: Option<usize>,
}

impl EventPublisher {
    pub fn new(
        broker: Arc<dyn StreamBroker>,
        breaker: Arc<CircuitBreaker>,
        source_app: impl Into<String>,
    ) -> Self {
        Self {
            dlq: DeadLetterQueue::new(broker.clone()),
            broker,
            breaker,
            source_app: source_app.into(),
            max_len: None,
        }
    }

    /// Cap target streams at roughly `max_len` entries on every append.
    pub fn with_max_len(mut self, max_len: Option<usize>) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    pub async fn publish_event(
        &self,
        stream_key: &str,
        event_type: &str,
        entity_id: &str,
        tenant_id: &str,
        data: Value,
        metadata: Option<Map<String, Value>>,
    ) -> Result<PublishReceipt, PublishError> {
        let event = create_standard_event(
            event_type,
            entity_id,
            tenant_id,
            data,
            metadata,
            &self.source_app,
        );
        let value = event.to_value();

        let report = validate(&value);
        for warning in &report.warnings {
            warn!(event_id = %event.event_id, warning = %warning, "Event validation warning");
        }
        if !report.valid {
            warn!(
                event_id = %event.event_id,
                event_type = %event_type,
                errors = ?report.errors,
                "Refusing to publish invalid event"
            );
            self.divert(&value, &report.errors, FailureReason::Validation, stream_key)
                .await;
            return Err(PublishError::Validation {
                event_id: event.event_id,
                errors: report.errors,
            });
        }

        let fields = serialize_event(&event);
        let appended = self
            .breaker
            .execute(|| self.broker.append(stream_key, &fields, self.max_len))
            .await;

        match appended {
            Ok(message_id) => {
                info!(
                    stream = %stream_key,
                    message_id = %message_id,
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    tenant_id = %event.tenant_id,
                    outcome = "success",
                    "Event published"
                );
                Ok(PublishReceipt {
                    success: true,
                    event_id: event.event_id,
                    message_id,
                    stream_key: stream_key.to_string(),
                    event_type: event.event_type,
                    entity_id: event.entity_id,
                    tenant_id: event.tenant_id,
                })
            }
            Err(e) => {
                error!(stream = %stream_key, event_id = %event.event_id, error = %e, "Failed to publish event");
                let reason = e.to_string();
                self.divert(&value, &[reason.clone()], FailureReason::PublishFailed, stream_key)
                    .await;
                Err(PublishError::Broker {
                    event_id: event.event_id,
                    stream: stream_key.to_string(),
                    reason,
                })
            }
        }
    }

    async fn divert(&self, event: &Value, errors: &[String], reason: FailureReason, stream: &str) {
        let letter = DeadLetter {
            event,
            errors,
            reason,
            original_stream: Some(stream),
            original_message_id: None,
        };
        match self.dlq.publish(letter).await {
            Ok((dlq_stream, id)) => debug!(dlq_stream = %dlq_stream, dlq_id = %id, "Diverted event"),
            Err(e) => error!(error = %e, "Event lost: DLQ write failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use crate::broker::MemoryBroker;
    use serde_json::json;

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";
    const STREAM: &str = "crm:sync:role:role_permissions_changed";

    fn publisher(broker: Arc<MemoryBroker>) -> EventPublisher {
        let breaker = Arc::new(CircuitBreaker::new("broker", CircuitBreakerConfig::default()));
        EventPublisher::new(broker, breaker, "crm")
    }

    #[tokio::test]
    async fn test_publish_valid_event() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone());

        let receipt = publisher
            .publish_event(
                STREAM,
                "role.permissions_changed",
                "r1",
                TENANT,
                json!({"roleId": "r1", "roleName": "Sales", "flatPermissions": ["crm.leads.read"]}),
                None,
            )
            .await
            .unwrap();

        assert!(receipt.success);
        assert_eq!(receipt.stream_key, STREAM);
        assert_eq!(receipt.tenant_id, TENANT);

        let entries = broker.range(STREAM, "-", "+", 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, receipt.message_id);
        assert_eq!(entries[0].fields["eventId"], receipt.event_id);
        assert_eq!(entries[0].fields["entityType"], "role");
        assert!(entries[0].fields["data"].contains("flatPermissions"));
    }

    #[tokio::test]
    async fn test_invalid_event_goes_to_dlq() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker.clone());

        let result = publisher
            .publish_event(
                STREAM,
                "role.permissions_changed",
                "r1",
                TENANT,
                json!({"roleId": "r1", "roleName": "Sales"}),
                None,
            )
            .await;

        assert!(matches!(result, Err(PublishError::Validation { .. })));
        assert_eq!(broker.len(STREAM).await.unwrap(), 0);
        assert_eq!(
            publisher.dlq().count("role.permissions_changed").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_type_rejected() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = publisher(broker);

        let err = publisher
            .publish_event("x", "totally.unknown", "e1", TENANT, json!({}), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid eventType: totally.unknown"));
    }
}
