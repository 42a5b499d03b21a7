//! Processed-event ledger.
//!
//! A marker per `(tenant, eventId)` written after an event has been applied
//! and acknowledged. The engine consults it only on recovery passes, where a
//! message may have been applied right before a crash prevented its ack.
//!
//! The check and the apply are not atomic: two consumers recovering the same
//! event at once can both miss the marker. Handlers stay idempotent on
//! `eventId` for that window (see [`crate::store`]).

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::broker::{BrokerError, StreamBroker};

pub const DEFAULT_LEDGER_PREFIX: &str = "crm:sync:processed";

/// Markers outlive any reasonable pending-recovery window.
pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct ProcessedLedger {
    broker: Arc<dyn StreamBroker>,
    prefix: String,
    ttl: Duration,
}

impl ProcessedLedger {
    pub fn new(broker: Arc<dyn StreamBroker>) -> Self {
        Self::with_settings(broker, DEFAULT_LEDGER_PREFIX, DEFAULT_LEDGER_TTL)
    }

    pub fn with_settings(broker: Arc<dyn StreamBroker>, prefix: &str, ttl: Duration) -> Self {
        Self {
            broker,
            prefix: prefix.to_string(),
            ttl,
        }
    }

    pub fn key(&self, tenant_id: &str, event_id: &str) -> String {
        format!("{}:{}:{}", self.prefix, tenant_id, event_id)
    }

    pub async fn is_processed(&self, tenant_id: &str, event_id: &str) -> Result<bool, BrokerError> {
        self.broker.has_marker(&self.key(tenant_id, event_id)).await
    }

    /// Record `event_id` as applied. Returns false if it was already marked.
    pub async fn mark_processed(
        &self,
        tenant_id: &str,
        event_id: &str,
        message_id: &str,
    ) -> Result<bool, BrokerError> {
        let key = self.key(tenant_id, event_id);
        let fresh = self.broker.set_marker(&key, message_id, self.ttl).await?;
        if !fresh {
            debug!(key = %key, "Event already marked processed");
        }
        Ok(fresh)
    }
}
