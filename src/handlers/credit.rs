//! Credit balance handler for `credit.allocated`, `credit.deducted` and
//! `credit.refunded`. The balance lives on the `credit:{entityId}` entity.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::{EventHandler, HandlerError, HandlerOutcome};
use crate::event::{CreditChange, Event};
use crate::store::{ApplyStatus, EntityChange, Mutation, StateStore};

pub struct CreditHandler {
    store: Arc<dyn StateStore>,
}

impl CreditHandler {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for CreditHandler {
    fn name(&self) -> &str {
        "credit"
    }

    async fn handle(&self, event: &Event) -> Result<HandlerOutcome, HandlerError> {
        let credit = match CreditChange::from_data(&event.data) {
            Ok(credit) => credit,
            Err(e) => return Ok(HandlerOutcome::acknowledged(e.to_string())),
        };

        let delta = match event.canonical_type().as_str() {
            "credit.allocated" | "credit.refunded" => credit.amount,
            "credit.deducted" => -credit.amount,
            other => return Ok(HandlerOutcome::skipped(format!("{} is not a balance change", other))),
        };

        let status = self
            .store
            .apply(&EntityChange {
                tenant_id: event.tenant_id.clone(),
                entity_type: "credit".to_string(),
                entity_id: event.entity_id.clone(),
                event_id: event.event_id.clone(),
                mutation: Mutation::AdjustBalance { delta },
            })
            .await?;

        Ok(match status {
            ApplyStatus::Applied => {
                info!(
                    tenant_id = %event.tenant_id,
                    account = %event.entity_id,
                    delta = delta,
                    outcome = "success",
                    "Credit balance adjusted"
                );
                HandlerOutcome::Success
            }
            ApplyStatus::Duplicate => HandlerOutcome::skipped("event already applied"),
            ApplyStatus::InsufficientBalance => {
                warn!(
                    tenant_id = %event.tenant_id,
                    account = %event.entity_id,
                    amount = credit.amount,
                    "Insufficient credit balance"
                );
                HandlerOutcome::acknowledged(format!(
                    "insufficient balance for deduction of {}",
                    credit.amount
                ))
            }
            ApplyStatus::NotFound => {
                HandlerOutcome::acknowledged(format!("credit account {} not found", event.entity_id))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::create_standard_event;
    use crate::store::MemoryStateStore;
    use serde_json::json;

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";

    fn credit(event_type: &str, amount: serde_json::Value) -> Event {
        create_standard_event(event_type, "acct-1", TENANT, json!({"amount": amount}), None, "billing")
    }

    #[tokio::test]
    async fn test_balance_flow() {
        let store = Arc::new(MemoryStateStore::new());
        let handler = CreditHandler::new(store.clone());

        assert_eq!(handler.handle(&credit("credit.allocated", json!(100))).await.unwrap(), HandlerOutcome::Success);
        assert_eq!(handler.handle(&credit("credit.deducted", json!("30.5"))).await.unwrap(), HandlerOutcome::Success);
        assert_eq!(handler.handle(&credit("credit_refunded", json!(0.5))).await.unwrap(), HandlerOutcome::Success);

        let account = store.get(TENANT, "credit", "acct-1").await.unwrap().unwrap();
        assert_eq!(account["balance"], json!(70.0));
    }

    #[tokio::test]
    async fn test_overdraft_is_acknowledged() {
        let store = Arc::new(MemoryStateStore::new());
        let handler = CreditHandler::new(store.clone());

        let outcome = handler.handle(&credit("credit.deducted", json!(5))).await.unwrap();
        assert!(matches!(outcome, HandlerOutcome::Acknowledged { .. }));
        assert!(store.is_empty());
    }
}
