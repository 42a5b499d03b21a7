//! # crm-sync
//!
//! Durable, tenant-scoped consumer for CRM domain events carried on Redis
//! Streams.
//!
//! ## Architecture
//!
//! ```text
//! Gateway -> EventPublisher -> Redis Streams -> StreamConsumer -> DispatchTable -> StateStore
//!                  │                                  │
//!                  └──────────── DLQ ◀────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`event`]: Standard event envelope and typed payloads
//! - [`validation`]: Envelope schema validation
//! - [`breaker`]: Circuit breaker around broker and store calls
//! - [`broker`]: Stream broker abstraction (Redis and in-memory)
//! - [`streams`]: Configured streams and their types
//! - [`coordinator`]: Consumer group lifecycle and introspection
//! - [`dlq`] / [`publisher`]: Dead letter queue and validated publishing
//! - [`ledger`]: Processed-event markers for crash recovery
//! - [`store`]: Projection state store
//! - [`handlers`]: Per-event-type handlers and the dispatch table
//! - [`engine`]: The stream consumer

pub mod breaker;
pub mod broker;
pub mod config;
pub mod coordinator;
pub mod dlq;
pub mod engine;
pub mod event;
pub mod handlers;
pub mod ledger;
pub mod metrics;
pub mod publisher;
pub mod shutdown;
pub mod store;
pub mod streams;
pub mod validation;

// Re-export commonly used types at crate root
pub use breaker::{CircuitBreaker, CircuitBreakerConfig};
pub use broker::{StreamBroker, StreamMessage};
pub use config::CrmSyncConfig;
pub use engine::{EngineComponents, EngineConfig, StreamConsumer};
pub use event::Event;
pub use handlers::{DispatchTable, EventHandler, HandlerOutcome};
pub use publisher::EventPublisher;
pub use streams::StreamTable;
