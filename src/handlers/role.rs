//! `role.permissions_changed` handler.
//!
//! Both permission shapes are normalized by [`RolePermissionsChanged`], so the
//! stored role always carries one sorted `module.submodule.action` list.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use super::{EventHandler, HandlerError, HandlerOutcome};
use crate::event::{Event, RolePermissionsChanged};
use crate::store::{ApplyStatus, EntityChange, Mutation, StateStore};

pub struct RolePermissionsHandler {
    store: Arc<dyn StateStore>,
}

impl RolePermissionsHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for RolePermissionsHandler {
    fn name(&self) -> &str {
        "role-permissions"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        let change = match RolePermissionsChanged::from_data(&event.data) {
            Ok(change) => change,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Unusable permissions payload");
                return Ok(HandlerOutcome::acknowledged(e.to_string()));
            }
        };

        let status = self
            .store
            .apply(&EntityChange {
                tenant_id: event.tenant_id.clone(),
                entity_type: "role".to_string(),
                entity_id: change.role_id.clone(),
                event_id: event.event_id.clone(),
                mutation: Mutation::Merge(json!({
                    "roleName": change.role_name,
                    "permissions": change.permissions,
                })),
            })
            .await?;

        match status {
            ApplyStatus::Applied => {
                info!(
                    tenant_id = %event.tenant_id,
                    role_id = %change.role_id,
                    permissions = change.permissions.len(),
                    outcome = "success",
                    "Role permissions updated"
                );
                Ok(HandlerOutcome::Success)
            }
            ApplyStatus::Duplicate => Ok(HandlerOutcome::skipped("event already applied")),
            other => Ok(HandlerOutcome::acknowledged(format!(
                "role {} not updated: {:?}",
                change.role_id, other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::create_standard_event;
    use crate::store::MemoryStateStore;

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";

    #[tokio::test]
    async fn test_flat_and_nested_permissions_merge() {
        let store = Arc::new(MemoryStateStore::new());
        let handler = RolePermissionsHandler::new(store.clone());
        let event = create_standard_event(
            "role.permissions_changed",
            "r1",
            TENANT,
            json!({
                "roleId": "r1",
                "roleName": "Sales",
                "permissions": {"crm": {"leads": {"read": true, "delete": false}}},
                "flatPermissions": ["crm.leads.create", "crm.leads.read"]
            }),
            None,
            "crm",
        );

        assert_eq!(handler.handle(&event).await.unwrap(), HandlerOutcome::Success);
        let role = store.get(TENANT, "role", "r1").await.unwrap().unwrap();
        assert_eq!(role["roleName"], "Sales");
        assert_eq!(role["permissions"], json!(["crm.leads.create", "crm.leads.read"]));
    }

    #[tokio::test]
    async fn test_bad_payload_is_acknowledged() {
        let handler = RolePermissionsHandler::new(Arc::new(MemoryStateStore::new()));
        let event = create_standard_event(
            "role.permissions_changed",
            "r1",
            TENANT,
            json!({"roleId": "r1", "roleName": "Sales"}),
            None,
            "crm",
        );
        assert!(matches!(
            handler.handle(&event).await.unwrap(),
            HandlerOutcome::Acknowledged { .. }
        ));
    }

    #[tokio::test]
    async fn test_store_error_propagates() {
        let store = Arc::new(MemoryStateStore::new());
        store.fail_next(1);
        let handler = RolePermissionsHandler::new(store);
        let event = create_standard_event(
            "role.permissions_changed",
            "r1",
            TENANT,
            json!({"roleId": "r1", "roleName": "Sales", "flatPermissions": ["crm.leads.read"]}),
            None,
            "crm",
        );
        assert!(matches!(handler.handle(&event).await, Err(HandlerError::Store(_))));
    }
}
