//! In-process [`StateStore`] for tests and local runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

use super::redis::DEFAULT_APPLIED_TTL;
use super::{apply_mutation, Applied, ApplyStatus, EntityChange, StateStore, StoreError};

type EntityKey = (String, String, String);

#[derive(Debug, Default)]
struct Inner {
    entities: HashMap<EntityKey, Value>,
    /// (tenant, eventId) -> marker expiry
    applied: HashMap<(String, String), Instant>,
}

#[derive(Debug)]
pub struct MemoryStateStore {
    inner: Mutex<Inner>,
    applied_ttl: Duration,
    applies: AtomicU64,
    failing: AtomicU32,
    delay: Mutex<Option<Duration>>,
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::with_ttl(DEFAULT_APPLIED_TTL)
    }
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied markers expire `ttl` after they are written.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            applied_ttl: ttl,
            applies: AtomicU64::new(0),
            failing: AtomicU32::new(0),
            delay: Mutex::new(None),
        }
    }

    /// Make the next `n` applies fail with a backend error.
    pub fn fail_next(&self, n: u32) {
        self.failing.store(n, Ordering::SeqCst);
    }

    /// Sleep this long inside every apply.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    /// Number of changes actually written.
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Applied markers currently tracked, expired ones included until the
    /// next apply prunes them.
    pub fn applied_len(&self) -> usize {
        self.inner.lock().applied.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn apply(&self, change: &EntityChange) -> Result<ApplyStatus, StoreError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failing = self.failing.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing.store(failing - 1, Ordering::SeqCst);
            return Err(StoreError::Backend("store unavailable".to_string()));
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.applied.retain(|_, expires| *expires > now);
        let marker = (change.tenant_id.clone(), change.event_id.clone());
        if inner.applied.contains_key(&marker) {
            return Ok(ApplyStatus::Duplicate);
        }

        let key = (
            change.tenant_id.clone(),
            change.entity_type.clone(),
            change.entity_id.clone(),
        );
        match apply_mutation(inner.entities.get(&key).cloned(), change) {
            Applied::Write(document) => {
                inner.entities.insert(key, document);
            }
            Applied::Remove => {
                inner.entities.remove(&key);
            }
            Applied::Rejected(status) => return Ok(status),
        }
        inner.applied.insert(marker, now + self.applied_ttl);
        self.applies.fetch_add(1, Ordering::SeqCst);
        Ok(ApplyStatus::Applied)
    }

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError> {
        let key = (
            tenant_id.to_string(),
            entity_type.to_string(),
            entity_id.to_string(),
        );
        Ok(self.inner.lock().entities.get(&key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Mutation;
    use serde_json::json;

    #[tokio::test]
    async fn test_duplicate_event_not_reapplied() {
        let store = MemoryStateStore::new();
        let change = EntityChange {
            tenant_id: "t".into(),
            entity_type: "credit".into(),
            entity_id: "acct".into(),
            event_id: "e1".into(),
            mutation: Mutation::AdjustBalance { delta: 10.0 },
        };

        assert_eq!(store.apply(&change).await.unwrap(), ApplyStatus::Applied);
        assert_eq!(store.apply(&change).await.unwrap(), ApplyStatus::Duplicate);
        assert_eq!(store.apply_count(), 1);

        let doc = store.get("t", "credit", "acct").await.unwrap().unwrap();
        assert_eq!(doc["balance"], json!(10.0));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStateStore::new();
        store.fail_next(1);
        let change = EntityChange {
            tenant_id: "t".into(),
            entity_type: "user".into(),
            entity_id: "u".into(),
            event_id: "e".into(),
            mutation: Mutation::Upsert(json!({})),
        };
        assert!(store.apply(&change).await.is_err());
        assert_eq!(store.apply(&change).await.unwrap(), ApplyStatus::Applied);
    }

    #[tokio::test(start_paused = true)]
    async fn test_applied_markers_expire() {
        let store = MemoryStateStore::with_ttl(Duration::from_secs(60));
        let change = |event_id: &str| EntityChange {
            tenant_id: "t".into(),
            entity_type: "credit".into(),
            entity_id: "acct".into(),
            event_id: event_id.into(),
            mutation: Mutation::AdjustBalance { delta: 1.0 },
        };

        assert_eq!(store.apply(&change("e1")).await.unwrap(), ApplyStatus::Applied);
        assert_eq!(store.apply(&change("e2")).await.unwrap(), ApplyStatus::Applied);
        assert_eq!(store.applied_len(), 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(store.apply(&change("e1")).await.unwrap(), ApplyStatus::Duplicate);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(store.apply(&change("e1")).await.unwrap(), ApplyStatus::Applied);
        // e2 expired and was pruned; only the fresh e1 marker remains.
        assert_eq!(store.applied_len(), 1);
        assert_eq!(store.apply_count(), 3);
    }
}
