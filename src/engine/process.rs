//! Per-message processing.
//!
//! For each message, in order: shutdown check, envelope parse, validation
//! (invalid → DLQ + ack), tenant filter on shared streams, ledger check on
//! recovery passes, dispatch through the store breaker, outcome handling.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{GroupPlan, StreamConsumer};
use crate::breaker::BreakerError;
use crate::broker::StreamMessage;
use crate::dlq::{DeadLetter, FailureReason};
use crate::event::{parse_fields, EnvelopeError, Event};
use crate::handlers::{HandlerError, HandlerOutcome};
use crate::validation::validate;

/// Which read produced a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadSource {
    /// Never-delivered messages
    New,
    /// Own pending or claimed messages; may already have been applied
    Recovery,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub acked: usize,
    pub left_pending: usize,
    /// Shutdown stopped the batch before every message was looked at
    pub aborted: bool,
}

/// What happened to one message.
#[derive(Debug, Clone, PartialEq)]
enum Disposition {
    Ack,
    /// Leave pending for a later cycle
    Pending(String),
}

impl StreamConsumer {
    /// Process one batch from `plan`'s group.
    pub async fn process_messages(
        &self,
        plan: &GroupPlan,
        messages: Vec<StreamMessage>,
        source: ReadSource,
    ) -> BatchSummary {
        let mut summary = BatchSummary::default();
        if messages.is_empty() {
            return summary;
        }
        let _in_flight = self.in_flight.lock().await;

        for message in messages {
            if self.shutdown.is_triggered() {
                info!(group = %plan.group, "Shutdown requested, abandoning rest of batch");
                summary.aborted = true;
                break;
            }

            match self.process_message(plan, &message, source).await {
                Disposition::Ack => {
                    if self.ack(plan, &message).await {
                        summary.acked += 1;
                    } else {
                        summary.left_pending += 1;
                    }
                }
                Disposition::Pending(reason) => {
                    self.metrics.record_left_pending();
                    debug!(stream = %message.stream, id = %message.id, reason = %reason, "Left pending");
                    summary.left_pending += 1;
                }
            }
        }

        summary
    }

    async fn process_message(
        &self,
        plan: &GroupPlan,
        message: &StreamMessage,
        source: ReadSource,
    ) -> Disposition {
        let started = Instant::now();

        let value = match parse_fields(&message.fields) {
            Ok(value) => value,
            Err(EnvelopeError::Empty) => {
                warn!(stream = %message.stream, id = %message.id, "Pending entry no longer exists, acknowledging");
                self.metrics.record_failed();
                return Disposition::Ack;
            }
            Err(e) => {
                warn!(stream = %message.stream, id = %message.id, error = %e, "Unrecognized message envelope");
                let raw = raw_fields(&message.fields);
                return self
                    .dead_letter(message, &raw, vec![e.to_string()], FailureReason::Unparseable)
                    .await;
            }
        };

        if self.config.validate {
            let report = validate(&value);
            for warning in &report.warnings {
                debug!(id = %message.id, warning = %warning, "Validation warning");
            }
            if !report.valid {
                warn!(
                    stream = %message.stream,
                    id = %message.id,
                    errors = ?report.errors,
                    "Event failed validation"
                );
                return self
                    .dead_letter(message, &value, report.errors, FailureReason::Validation)
                    .await;
            }
            self.metrics.record_validated();
        }

        let event = match Event::from_value(value.clone()) {
            Ok(event) => event,
            Err(e) => {
                return self
                    .dead_letter(message, &value, vec![e.to_string()], FailureReason::Unparseable)
                    .await;
            }
        };

        if event.tenant_id != self.config.tenant_id
            && self.coordinator.streams().is_shared(&message.stream)
        {
            debug!(
                id = %message.id,
                event_tenant = %event.tenant_id,
                "Event belongs to another tenant, skipping"
            );
            self.metrics.record_tenant_skipped();
            return Disposition::Ack;
        }

        if source == ReadSource::Recovery {
            let checked = self
                .broker_breaker
                .execute(|| self.ledger.is_processed(&event.tenant_id, &event.event_id))
                .await;
            match checked {
                Ok(true) => {
                    info!(
                        id = %message.id,
                        event_id = %event.event_id,
                        "Event already applied before recovery, skipping"
                    );
                    self.metrics.record_duplicate();
                    return Disposition::Ack;
                }
                Ok(false) => {}
                Err(e) if e.is_open() => {
                    self.metrics.record_breaker_rejection();
                    return Disposition::Pending("broker breaker open".to_string());
                }
                Err(e) => warn!(event_id = %event.event_id, error = %e, "Ledger check failed, reapplying"),
            }
        }

        self.dispatch(plan, message, &event, started).await
    }

    async fn dispatch(
        &self,
        plan: &GroupPlan,
        message: &StreamMessage,
        event: &Event,
        started: Instant,
    ) -> Disposition {
        let event_type = event.canonical_type();
        let Some(handler) = self.dispatch.resolve(&event.event_type) else {
            debug!(event_type = %event_type, "No handler registered, acknowledging");
            return self.finish(plan, message, event, &event_type, started, true).await;
        };

        let result = self.store_breaker.execute(|| handler.handle(event)).await;

        match result {
            Ok(HandlerOutcome::Success) => {
                info!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    handler = %handler.name(),
                    correlation_id = %event.correlation_id(),
                    outcome = "success",
                    "Event processed"
                );
                self.finish(plan, message, event, &event_type, started, true).await
            }
            Ok(HandlerOutcome::Skipped { reason }) => {
                debug!(event_id = %event.event_id, reason = %reason, "Event skipped");
                self.finish(plan, message, event, &event_type, started, true).await
            }
            Ok(HandlerOutcome::Acknowledged { reason }) => {
                warn!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    reason = %reason,
                    "Event acknowledged without being applied"
                );
                self.finish(plan, message, event, &event_type, started, false).await
            }
            Ok(HandlerOutcome::Retry { reason }) => Disposition::Pending(reason),
            Err(BreakerError::Open { retry_in, .. }) => {
                self.metrics.record_breaker_rejection();
                warn!(
                    event_id = %event.event_id,
                    retry_in_ms = retry_in.as_millis() as u64,
                    "Store breaker open, leaving message pending"
                );
                Disposition::Pending("store breaker open".to_string())
            }
            Err(e) => {
                let reason = match &e {
                    BreakerError::Inner(HandlerError::Payload(p)) => format!("payload: {}", p),
                    other => other.to_string(),
                };
                error!(
                    event_id = %event.event_id,
                    event_type = %event_type,
                    handler = %handler.name(),
                    error = %reason,
                    "Handler failed, leaving message pending"
                );
                Disposition::Pending(reason)
            }
        }
    }

    /// Record a terminal handler outcome before the ack goes out.
    ///
    /// With the broker breaker open the message stays pending; the recovery
    /// pass reapplies it and the store reports the duplicate.
    async fn finish(
        &self,
        plan: &GroupPlan,
        message: &StreamMessage,
        event: &Event,
        event_type: &str,
        started: Instant,
        success: bool,
    ) -> Disposition {
        let marked = self
            .broker_breaker
            .execute(|| {
                self.ledger
                    .mark_processed(&event.tenant_id, &event.event_id, &message.id)
            })
            .await;
        match marked {
            Ok(_) => {}
            Err(e) if e.is_open() => {
                self.metrics.record_breaker_rejection();
                return Disposition::Pending("broker breaker open".to_string());
            }
            Err(e) => {
                warn!(group = %plan.group, event_id = %event.event_id, error = %e, "Failed to record processed event");
            }
        }
        self.metrics.record_handled(event_type, started.elapsed(), success);
        Disposition::Ack
    }

    /// Route to the DLQ, then ack. Failure metrics are recorded once the dead
    /// letter is written; a failed DLQ write leaves the message pending.
    async fn dead_letter(
        &self,
        message: &StreamMessage,
        event: &Value,
        errors: Vec<String>,
        reason: FailureReason,
    ) -> Disposition {
        let letter = DeadLetter {
            event,
            errors: &errors,
            reason,
            original_stream: Some(&message.stream),
            original_message_id: Some(&message.id),
        };
        match self.broker_breaker.execute(|| self.dlq.publish(letter)).await {
            Ok(_) => {
                match reason {
                    FailureReason::Validation => self.metrics.record_validation_failure(),
                    _ => self.metrics.record_failed(),
                }
                self.metrics.record_dlq();
                Disposition::Ack
            }
            Err(e) if e.is_open() => {
                self.metrics.record_breaker_rejection();
                debug!(id = %message.id, "Broker breaker open, DLQ write deferred");
                Disposition::Pending("broker breaker open".to_string())
            }
            Err(e) => {
                error!(id = %message.id, error = %e, "DLQ write failed, leaving message pending");
                Disposition::Pending(format!("dlq write failed: {}", e))
            }
        }
    }

    async fn ack(&self, plan: &GroupPlan, message: &StreamMessage) -> bool {
        let ids = [message.id.clone()];
        let result = self
            .broker_breaker
            .execute(|| self.broker.ack(&message.stream, &plan.group, &ids))
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                error!(stream = %message.stream, id = %message.id, error = %e, "Failed to ACK message");
                false
            }
        }
    }
}

fn raw_fields(fields: &HashMap<String, String>) -> Value {
    let object: Map<String, Value> = fields
        .iter()
        .map(|(k, v)| (k.clone(), Value::String(v.clone())))
        .collect();
    Value::Object(object)
}
