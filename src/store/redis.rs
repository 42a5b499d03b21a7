//! Redis-backed [`StateStore`].
//!
//! Layout per tenant:
//!
//! ```text
//! {prefix}:{tenant}:{entityType}:{entityId}   JSON document
//! {prefix}:{tenant}:applied:{eventId}         applied marker, expires after the TTL
//! ```
//!
//! The document write and the applied marker go out in one MULTI/EXEC, so
//! a crash never records an event as applied without its effect (or the
//! reverse). The read-compute-write itself is not guarded; two consumers
//! applying different events to the same entity at once can lose an update.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use deadpool_redis::Pool;
use serde_json::Value;
use tracing::debug;

use super::{apply_mutation, Applied, ApplyStatus, EntityChange, StateStore, StoreError};

pub const DEFAULT_STORE_PREFIX: &str = "crm:state";

/// How long an applied marker outlives its event. Redeliveries older than
/// this are reapplied.
pub const DEFAULT_APPLIED_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Clone)]
pub struct RedisStateStore {
    pool: Pool,
    prefix: String,
    applied_ttl: Duration,
}

impl RedisStateStore {
    pub fn new(pool: Pool) -> Self {
        Self::with_settings(pool, DEFAULT_STORE_PREFIX, DEFAULT_APPLIED_TTL)
    }

    pub fn with_prefix(pool: Pool, prefix: &str) -> Self {
        Self::with_settings(pool, prefix, DEFAULT_APPLIED_TTL)
    }

    pub fn with_settings(pool: Pool, prefix: &str, applied_ttl: Duration) -> Self {
        Self {
            pool,
            prefix: prefix.to_string(),
            applied_ttl,
        }
    }

    fn entity_key(&self, tenant_id: &str, entity_type: &str, entity_id: &str) -> String {
        format!("{}:{}:{}:{}", self.prefix, tenant_id, entity_type, entity_id)
    }

    fn applied_key(&self, tenant_id: &str, event_id: &str) -> String {
        format!("{}:{}:applied:{}", self.prefix, tenant_id, event_id)
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }
}

fn backend(e: redis::RedisError) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn apply(&self, change: &EntityChange) -> Result<ApplyStatus, StoreError> {
        let mut conn = self.conn().await?;
        let applied_key = self.applied_key(&change.tenant_id, &change.event_id);
        let entity_key =
            self.entity_key(&change.tenant_id, &change.entity_type, &change.entity_id);

        let seen: bool = conn.exists(&applied_key).await.map_err(backend)?;
        if seen {
            debug!(event_id = %change.event_id, "Event already applied");
            return Ok(ApplyStatus::Duplicate);
        }

        let raw: Option<String> = conn.get(&entity_key).await.map_err(backend)?;
        let current = raw
            .map(|raw| serde_json::from_str::<Value>(&raw))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        match apply_mutation(current, change) {
            Applied::Write(document) => {
                pipe.set(&entity_key, document.to_string()).ignore();
            }
            Applied::Remove => {
                pipe.del(&entity_key).ignore();
            }
            Applied::Rejected(status) => return Ok(status),
        }
        pipe.cmd("SET")
            .arg(&applied_key)
            .arg(1)
            .arg("PX")
            .arg(self.applied_ttl.as_millis() as u64)
            .ignore();

        let _: () = pipe.query_async(&mut conn).await.map_err(backend)?;
        Ok(ApplyStatus::Applied)
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn
            .get(self.entity_key(tenant_id, entity_type, entity_id))
            .await
            .map_err(backend)?;
        raw.map(|raw| serde_json::from_str(&raw))
            .transpose()
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }
}
