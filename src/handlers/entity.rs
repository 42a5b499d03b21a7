//! Entity sync for user, role and organization lifecycle events.
//!
//! | Event                          | Change                                     |
//! |--------------------------------|--------------------------------------------|
//! | `*.created`                    | upsert `data` as the entity document       |
//! | `*.updated`                    | merge `data` into the document             |
//! | `user.activated`/`deactivated` | merge `status`                             |
//! | `*.deleted`                    | delete (missing entity: skipped)           |
//! | `role.assigned`/`unassigned`   | `roles` set on `user:{userId}`             |
//! | `organization.user_*`          | `members` set on `organization:{orgId}`    |

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use super::{EventHandler, HandlerError, HandlerOutcome};
use crate::event::{required_str, Event};
use crate::store::{ApplyStatus, EntityChange, Mutation, StateStore};

pub struct EntitySyncHandler {
    store: Arc<dyn StateStore>,
}

impl EntitySyncHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    fn change(&self, event: &Event, entity_type: &str, entity_id: String, mutation: Mutation) -> EntityChange {
        EntityChange {
            tenant_id: event.tenant_id.clone(),
            entity_type: entity_type.to_string(),
            entity_id,
            event_id: event.event_id.clone(),
            mutation,
        }
    }

    fn plan(&self, event: &Event) -> Result<Option<EntityChange>, HandlerError> {
        let canonical = event.canonical_type();
        let Some((entity, action)) = canonical.split_once('.') else {
            return Ok(None);
        };
        let data = &event.data;
        let own = |mutation| Some(self.change(event, entity, event.entity_id.clone(), mutation));

        let change = match (entity, action) {
            ("role", "assigned") | ("role", "unassigned") => {
                let user_id = required_str(data, "userId")?;
                let role_id = required_str(data, "roleId")?;
                Some(self.change(event, "user", user_id, membership(action == "assigned", "roles", role_id)))
            }
            ("organization", "user_assigned") | ("organization", "user_removed") => {
                let organization_id = required_str(data, "organizationId")?;
                let user_id = required_str(data, "userId")?;
                Some(self.change(
                    event,
                    "organization",
                    organization_id,
                    membership(action == "user_assigned", "members", user_id),
                ))
            }
            (_, "created") => own(Mutation::Upsert(data.clone())),
            (_, "updated") => own(Mutation::Merge(data.clone())),
            (_, "activated") => own(Mutation::Merge(json!({"status": "active"}))),
            (_, "deactivated") => own(Mutation::Merge(json!({"status": "inactive"}))),
            (_, "deleted") => own(Mutation::Delete),
            _ => None,
        };
        Ok(change)
    }
}

fn membership(add: bool, field: &str, member: String) -> Mutation {
    if add {
        Mutation::AddMember {
            field: field.to_string(),
            member,
        }
    } else {
        Mutation::RemoveMember {
            field: field.to_string(),
            member,
        }
    }
}

#[async_trait]
impl EventHandler for EntitySyncHandler {
    fn name(&self) -> &str {
        "entity-sync"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        let Some(change) = self.plan(event)? else {
            return Ok(HandlerOutcome::skipped(format!(
                "{} carries no entity change",
                event.event_type
            )));
        };

        let status = self.store.apply(&change).await?;
        debug!(
            event_id = %event.event_id,
            entity_type = %change.entity_type,
            entity_id = %change.entity_id,
            status = ?status,
            "Applied entity change"
        );

        Ok(match (status, &change.mutation) {
            (ApplyStatus::Applied, _) => HandlerOutcome::Success,
            (ApplyStatus::Duplicate, _) => HandlerOutcome::skipped("event already applied"),
            (ApplyStatus::NotFound, Mutation::Delete | Mutation::RemoveMember { .. }) => {
                HandlerOutcome::skipped(format!(
                    "{} {} already absent",
                    change.entity_type, change.entity_id
                ))
            }
            (ApplyStatus::NotFound, _) => HandlerOutcome::acknowledged(format!(
                "{} {} not found",
                change.entity_type, change.entity_id
            )),
            (ApplyStatus::InsufficientBalance, _) => {
                HandlerOutcome::acknowledged("unexpected balance change on entity")
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::create_standard_event;
    use crate::store::MemoryStateStore;

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";

    fn setup() -> (Arc<MemoryStateStore>, EntitySyncHandler) {
        let store = Arc::new(MemoryStateStore::new());
        (store.clone(), EntitySyncHandler::new(store))
    }

    #[tokio::test]
    async fn test_user_lifecycle() {
        let (store, handler) = setup();
        let created = create_standard_event(
            "user.created",
            "u1",
            TENANT,
            json!({"userId": "u1", "email": "ada@example.com"}),
            None,
            "crm",
        );
        assert_eq!(handler.handle(&created).await.unwrap(), HandlerOutcome::Success);

        let deactivated = create_standard_event("user_deactivated", "u1", TENANT, json!({"userId": "u1"}), None, "crm");
        assert_eq!(handler.handle(&deactivated).await.unwrap(), HandlerOutcome::Success);

        let doc = store.get(TENANT, "user", "u1").await.unwrap().unwrap();
        assert_eq!(doc["email"], "ada@example.com");
        assert_eq!(doc["status"], "inactive");

        // Replaying the same event is a no-op.
        assert!(matches!(
            handler.handle(&created).await.unwrap(),
            HandlerOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_delete_missing_is_skipped() {
        let (_, handler) = setup();
        let deleted = create_standard_event("role.deleted", "r9", TENANT, json!({"roleId": "r9"}), None, "crm");
        assert!(matches!(
            handler.handle(&deleted).await.unwrap(),
            HandlerOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_role_assignment() {
        let (store, handler) = setup();
        let user = create_standard_event("user.created", "u1", TENANT, json!({"userId": "u1", "email": "a@b.c"}), None, "crm");
        handler.handle(&user).await.unwrap();

        let assigned = create_standard_event(
            "role.assigned",
            "r1",
            TENANT,
            json!({"roleId": "r1", "userId": "u1"}),
            None,
            "crm",
        );
        assert_eq!(handler.handle(&assigned).await.unwrap(), HandlerOutcome::Success);
        let doc = store.get(TENANT, "user", "u1").await.unwrap().unwrap();
        assert_eq!(doc["roles"], json!(["r1"]));

        let orphan = create_standard_event(
            "role.assigned",
            "r1",
            TENANT,
            json!({"roleId": "r1", "userId": "ghost"}),
            None,
            "crm",
        );
        assert!(matches!(
            handler.handle(&orphan).await.unwrap(),
            HandlerOutcome::Acknowledged { .. }
        ));
    }
}
