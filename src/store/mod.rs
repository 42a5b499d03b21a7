//! Downstream state store.
//!
//! Handlers translate events into [`EntityChange`]s and hand them to a
//! [`StateStore`]. Every change carries the originating `eventId`; a store
//! must report [`ApplyStatus::Duplicate`] instead of applying the same event
//! twice, which makes handlers idempotent under redelivery.

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

pub use self::memory::MemoryStateStore;
pub use self::redis::RedisStateStore;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("state store backend error: {0}")]
    Backend(String),

    #[error("state store serialization error: {0}")]
    Serialization(String),
}

/// What to do with an entity document.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Replace the document
    Upsert(Value),
    /// Shallow-merge fields into the document, creating it if needed
    Merge(Value),
    /// Remove the document
    Delete,
    /// Add `member` to the string set stored under `field`
    AddMember { field: String, member: String },
    /// Remove `member` from the string set stored under `field`
    RemoveMember { field: String, member: String },
    /// Add `delta` to the numeric `balance` field; never below zero
    AdjustBalance { delta: f64 },
}

/// One change to one entity, attributed to the event that caused it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityChange {
    pub tenant_id: String,
    pub entity_type: String,
    pub entity_id: String,
    pub event_id: String,
    pub mutation: Mutation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    /// This event was applied before
    Duplicate,
    /// Delete, membership or balance change on a missing entity
    NotFound,
    InsufficientBalance,
}

/// Persistence boundary for applied events.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn apply(&self, change: &EntityChange) -> Result<ApplyStatus, StoreError>;

    async fn get(
        &self,
        tenant_id: &str,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<Value>, StoreError>;
}

/// Result of applying a mutation to the current document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Applied {
    Write(Value),
    Remove,
    Rejected(ApplyStatus),
}

/// Compute the next document for `change`. Shared by every store so they
/// agree on semantics.
pub(crate) fn apply_mutation(current: Option<Value>, change: &EntityChange) -> Applied {
    let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);

    let mut document = match (&change.mutation, current) {
        (Mutation::Delete, None) => return Applied::Rejected(ApplyStatus::NotFound),
        (Mutation::Delete, Some(_)) => return Applied::Remove,
        (Mutation::Upsert(data), _) => as_object(data.clone()),
        (Mutation::Merge(data), current) => {
            let mut document = current.map(as_object).unwrap_or_default();
            if let Value::Object(fields) = data {
                for (key, value) in fields {
                    document.insert(key.clone(), value.clone());
                }
            }
            document
        }
        (Mutation::AddMember { .. } | Mutation::RemoveMember { .. }, None) => {
            return Applied::Rejected(ApplyStatus::NotFound)
        }
        (Mutation::AddMember { field, member }, Some(current)) => {
            let mut document = as_object(current);
            let mut members = members(&document, field);
            if !members.contains(member) {
                members.push(member.clone());
                members.sort();
            }
            document.insert(field.clone(), Value::from(members));
            document
        }
        (Mutation::RemoveMember { field, member }, Some(current)) => {
            let mut document = as_object(current);
            let mut members = members(&document, field);
            members.retain(|m| m != member);
            document.insert(field.clone(), Value::from(members));
            document
        }
        (Mutation::AdjustBalance { delta }, current) => {
            let mut document = current.map(as_object).unwrap_or_default();
            let balance = document.get("balance").and_then(Value::as_f64).unwrap_or(0.0);
            let next = balance + delta;
            if next < 0.0 {
                return Applied::Rejected(ApplyStatus::InsufficientBalance);
            }
            document.insert("balance".into(), Value::from(next));
            document
        }
    };

    document.insert("id".into(), Value::from(change.entity_id.clone()));
    document.insert("tenantId".into(), Value::from(change.tenant_id.clone()));
    document.insert("lastEventId".into(), Value::from(change.event_id.clone()));
    document.insert("updatedAt".into(), Value::from(now));
    Applied::Write(Value::Object(document))
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

fn members(document: &Map<String, Value>, field: &str) -> Vec<String> {
    document
        .get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn change(mutation: Mutation) -> EntityChange {
        EntityChange {
            tenant_id: "t".into(),
            entity_type: "user".into(),
            entity_id: "u1".into(),
            event_id: "e1".into(),
            mutation,
        }
    }

    #[test]
    fn test_merge_creates_and_updates() {
        let Applied::Write(doc) =
            apply_mutation(None, &change(Mutation::Merge(json!({"name": "Ada"}))))
        else {
            panic!("expected write");
        };
        assert_eq!(doc["name"], "Ada");
        assert_eq!(doc["lastEventId"], "e1");

        let Applied::Write(doc) = apply_mutation(
            Some(doc),
            &change(Mutation::Merge(json!({"email": "ada@example.com"}))),
        ) else {
            panic!("expected write");
        };
        assert_eq!(doc["name"], "Ada");
        assert_eq!(doc["email"], "ada@example.com");
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        assert_eq!(
            apply_mutation(None, &change(Mutation::Delete)),
            Applied::Rejected(ApplyStatus::NotFound)
        );
        assert_eq!(
            apply_mutation(Some(json!({})), &change(Mutation::Delete)),
            Applied::Remove
        );
    }

    #[test]
    fn test_membership() {
        let add = change(Mutation::AddMember {
            field: "roles".into(),
            member: "r1".into(),
        });
        let Applied::Write(doc) = apply_mutation(Some(json!({"roles": ["r0"]})), &add) else {
            panic!("expected write");
        };
        assert_eq!(doc["roles"], json!(["r0", "r1"]));

        let Applied::Write(doc) = apply_mutation(Some(doc), &add) else {
            panic!("expected write");
        };
        assert_eq!(doc["roles"], json!(["r0", "r1"]));
    }

    #[test]
    fn test_balance_never_negative() {
        let deduct = change(Mutation::AdjustBalance { delta: -5.0 });
        assert_eq!(
            apply_mutation(Some(json!({"balance": 3.0})), &deduct),
            Applied::Rejected(ApplyStatus::InsufficientBalance)
        );
        let Applied::Write(doc) = apply_mutation(Some(json!({"balance": 8.0})), &deduct) else {
            panic!("expected write");
        };
        assert_eq!(doc["balance"], 3.0);
    }
}
