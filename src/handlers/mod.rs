//! Event handlers and the dispatch table.
//!
//! A handler receives one parsed [`Event`] and reports what should happen to
//! the stream message through a [`HandlerOutcome`]:
//!
//! | Outcome        | Message      | Metrics  |
//! |----------------|--------------|----------|
//! | `Success`      | acknowledged | success  |
//! | `Skipped`      | acknowledged | success  |
//! | `Acknowledged` | acknowledged | failure  |
//! | `Retry`        | left pending | -        |
//!
//! Returning an `Err` is treated like `Retry`.
//!
//! ## Writing a handler
//!
//! ```rust,ignore
//! use crm_sync::handlers::{EventHandler, HandlerError, HandlerOutcome};
//! use crm_sync::event::Event;
//! use async_trait::async_trait;
//!
//! struct AuditHandler;
//!
//! #[async_trait]
//! impl EventHandler for AuditHandler {
//!     fn name(&self) -> &str {
//!         "audit"
//!     }
//!
//!     async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
//!         Ok(HandlerOutcome::Success)
//!     }
//! }
//! ```

pub mod credit;
pub mod entity;
pub mod log;
pub mod role;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::event::{canonical_event_type, legacy_event_type, Event, PayloadError};
use crate::store::{StateStore, StoreError};
use crate::validation::EVENT_TYPES;

pub use self::credit::CreditHandler;
pub use self::entity::EntitySyncHandler;
pub use self::log::LogHandler;
pub use self::role::RolePermissionsHandler;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("invalid payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("handler failed: {0}")]
    Failed(String),
}

/// What the engine should do with the message after a handler ran.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandlerOutcome {
    Success,
    /// Nothing to do (already applied, irrelevant); counts as success
    Skipped { reason: String },
    /// Known failure that retrying cannot fix; counts as failure
    Acknowledged { reason: String },
    /// Leave the message pending for a later cycle
    Retry { reason: String },
}

impl HandlerOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        HandlerOutcome::Skipped {
            reason: reason.into(),
        }
    }

    pub fn acknowledged(reason: impl Into<String>) -> Self {
        HandlerOutcome::Acknowledged {
            reason: reason.into(),
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        HandlerOutcome::Retry {
            reason: reason.into(),
        }
    }

    /// Whether the message gets acknowledged.
    pub fn acks(&self) -> bool {
        !matches!(self, HandlerOutcome::Retry { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerOutcome::Success => "success",
            HandlerOutcome::Skipped { .. } => "skipped",
            HandlerOutcome::Acknowledged { .. } => "acknowledged",
            HandlerOutcome::Retry { .. } => "retry",
        }
    }
}

/// A per-event-type handler. Must be idempotent on `eventId`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError>;
}

/// Immutable event type → handler map.
///
/// Every type is registered under both its dot key and its legacy
/// underscore key. Keys ending in `.*` match a whole entity prefix.
#[derive(Clone, Default)]
pub struct DispatchTable {
    exact: HashMap<String, Arc<dyn EventHandler>>,
    prefixes: Vec<(String, Arc<dyn EventHandler>)>,
    fallback: Option<Arc<dyn EventHandler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Handlers for every whitelisted type, writing to `store`.
    pub fn standard(store: Arc<dyn StateStore>) -> Self {
        let entity: Arc<dyn EventHandler> = Arc::new(EntitySyncHandler::new(store.clone()));
        let role: Arc<dyn EventHandler> = Arc::new(RolePermissionsHandler::new(store.clone()));
        let credit: Arc<dyn EventHandler> = Arc::new(CreditHandler::new(store));

        let mut builder = Self::builder().fallback(Arc::new(LogHandler::with_prefix("unhandled")));
        for event_type in EVENT_TYPES {
            let handler = match *event_type {
                "role.permissions_changed" => role.clone(),
                t if t.starts_with("credit.") => credit.clone(),
                _ => entity.clone(),
            };
            builder = builder.on(event_type, handler);
        }
        builder.build()
    }

    /// Handler for `event_type` (either naming convention).
    pub fn resolve(&self, event_type: &str) -> Option<Arc<dyn EventHandler>> {
        if let Some(handler) = self.exact.get(event_type) {
            return Some(handler.clone());
        }

        let canonical = canonical_event_type(event_type);
        if let Some(handler) = self.exact.get(&canonical) {
            return Some(handler.clone());
        }

        self.prefixes
            .iter()
            .find(|(prefix, _)| canonical.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
            .or_else(|| self.fallback.clone())
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.exact.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn handler_count(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    table: DispatchTable,
}

impl DispatchTableBuilder {
    /// Bind `pattern` to `handler`. Exact types are bound under both naming
    /// conventions.
    pub fn on(mut self, pattern: &str, handler: Arc<dyn EventHandler>) -> Self {
        debug!(pattern = %pattern, handler = %handler.name(), "Registering handler");

        if let Some(prefix) = pattern.strip_suffix('*') {
            self.table.prefixes.push((prefix.to_string(), handler));
            return self;
        }

        let canonical = canonical_event_type(pattern);
        let legacy = legacy_event_type(&canonical);
        self.table.exact.insert(legacy, handler.clone());
        self.table.exact.insert(canonical, handler);
        self
    }

    /// Handler for types nothing else matches.
    pub fn fallback(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.table.fallback = Some(handler);
        self
    }

    pub fn build(self) -> DispatchTable {
        self.table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    struct Named(&'static str);

    #[async_trait]
    impl EventHandler for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn handle(&self, _event: &Event) -> Result<HandlerOutcome, HandlerError> {
            Ok(HandlerOutcome::Success)
        }
    }

    #[test]
    fn test_dot_and_legacy_keys_share_handler() {
        let table = DispatchTable::builder()
            .on("role.permissions_changed", Arc::new(Named("role")))
            .build();

        let dot = table.resolve("role.permissions_changed").unwrap();
        let legacy = table.resolve("role_permissions_changed").unwrap();
        assert!(Arc::ptr_eq(&dot, &legacy));
        assert_eq!(
            table.event_types(),
            vec!["role.permissions_changed", "role_permissions_changed"]
        );
    }

    #[test]
    fn test_prefix_and_fallback() {
        let table = DispatchTable::builder()
            .on("user.created", Arc::new(Named("exact")))
            .on("user.*", Arc::new(Named("users")))
            .fallback(Arc::new(Named("fallback")))
            .build();

        assert_eq!(table.resolve("user.created").unwrap().name(), "exact");
        assert_eq!(table.resolve("user_updated").unwrap().name(), "users");
        assert_eq!(table.resolve("other.thing").unwrap().name(), "fallback");
        assert!(DispatchTable::default().resolve("user.created").is_none());
    }

    #[test]
    fn test_standard_table_covers_whitelist() {
        let table = DispatchTable::standard(Arc::new(MemoryStateStore::new()));
        for event_type in EVENT_TYPES {
            let handler = table.resolve(event_type).unwrap();
            assert_ne!(handler.name(), "log", "{} has no handler", event_type);
            assert!(table.resolve(&legacy_event_type(event_type)).is_some());
        }
        assert_eq!(table.resolve("role.permissions_changed").unwrap().name(), "role-permissions");
        assert_eq!(table.resolve("credit_deducted").unwrap().name(), "credit");
    }

    #[test]
    fn test_outcome_acks() {
        assert!(HandlerOutcome::Success.acks());
        assert!(HandlerOutcome::skipped("x").acks());
        assert!(HandlerOutcome::acknowledged("x").acks());
        assert!(!HandlerOutcome::retry("x").acks());
    }
}
