//! Log handler - structured logging of events nothing else handles.

use async_trait::async_trait;
use tracing::info;

use super::{EventHandler, HandlerError, HandlerOutcome};
use crate::event::Event;

/// Logs the event and applies nothing.
#[derive(Debug, Clone)]
pub struct LogHandler {
    prefix: String,
}

impl LogHandler {
    pub fn new() -> Self {
        Self::with_prefix("event")
    }

    /// The prefix tells apart several log handlers (e.g. "audit", "unhandled").
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for LogHandler {
    fn name(&self) -> &str {
        "log"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        info!(
            prefix = %self.prefix,
            event_id = %event.event_id,
            event_type = %event.event_type,
            tenant_id = %event.tenant_id,
            entity_id = %event.entity_id,
            correlation_id = %event.correlation_id(),
            "[{}] {}",
            self.prefix,
            event.event_type
        );

        Ok(HandlerOutcome::skipped(format!(
            "no handler for {}, logged by '{}'",
            event.event_type, self.prefix
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::create_standard_event;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_handler_skips() {
        let handler = LogHandler::with_prefix("audit");
        let event = create_standard_event("contact.created", "c1", "t1", json!({}), None, "crm");

        let outcome = handler.handle(&event).await.unwrap();
        assert_eq!(handler.name(), "log");
        match outcome {
            HandlerOutcome::Skipped { reason } => {
                assert!(reason.contains("contact.created"));
                assert!(reason.contains("audit"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
