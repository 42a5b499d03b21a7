//! Event schema validation.
//!
//! [`validate`] is a pure function over the normalized event object produced
//! by [`crate::event::parse_fields`]. It never mutates its input and performs
//! no I/O. Errors make an event invalid; warnings are informational.
//!
//! # Checks
//!
//! ```text
//! required     eventId, eventType, tenantId, entityId, timestamp, data
//! format       eventId/tenantId UUID v4, timestamp ISO 8601
//! whitelist    eventType (legacy underscore aliases accepted with a warning)
//! sourceApp    one of SOURCE_APPS when present
//! payload      data is an object, plus per-type rules
//! ```

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::event::{
    canonical_event_type, entity_type_for, is_legacy_event_type, required_str, CreditChange,
    RolePermissionsChanged,
};

/// Fields every event must carry.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "eventId",
    "eventType",
    "tenantId",
    "entityId",
    "timestamp",
    "data",
];

/// Closed whitelist of accepted event types (dot notation).
pub const EVENT_TYPES: &[&str] = &[
    "user.created",
    "user.updated",
    "user.deleted",
    "user.activated",
    "user.deactivated",
    "role.created",
    "role.updated",
    "role.deleted",
    "role.permissions_changed",
    "role.assigned",
    "role.unassigned",
    "organization.created",
    "organization.updated",
    "organization.deleted",
    "organization.user_assigned",
    "organization.user_removed",
    "credit.allocated",
    "credit.deducted",
    "credit.refunded",
];

/// Applications allowed to publish events.
pub const SOURCE_APPS: &[&str] = &["crm", "auth-service", "billing", "admin-portal", "integration-hub"];

static UUID_V4: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$")
        .expect("uuid pattern is valid")
});

static ISO_8601: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?(Z|[+-]\d{2}:?\d{2})?$")
        .expect("timestamp pattern is valid")
});

/// Outcome of validating one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

/// Returns true if `event_type` (or its dot-notation form) is whitelisted.
pub fn is_known_event_type(event_type: &str) -> bool {
    EVENT_TYPES.contains(&canonical_event_type(event_type).as_str())
}

pub fn is_uuid_v4(value: &str) -> bool {
    UUID_V4.is_match(value)
}

pub fn is_iso8601(value: &str) -> bool {
    ISO_8601.is_match(value)
}

/// Validate a normalized event object.
pub fn validate(event: &Value) -> ValidationReport {
    let mut report = ValidationReport::default();

    let Some(object) = event.as_object() else {
        report.error("Event must be a JSON object");
        return report;
    };

    for field in REQUIRED_FIELDS {
        let present = match object.get(field) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        };
        if !present {
            report.error(format!("Missing required field: {}", field));
        }
    }

    if let Some(id) = str_field(event, "eventId") {
        if !is_uuid_v4(id) {
            report.error(format!("Invalid eventId format (expected UUID v4): {}", id));
        }
    }

    if let Some(tenant) = str_field(event, "tenantId") {
        if !is_uuid_v4(tenant) {
            report.error(format!("Invalid tenantId format (expected UUID v4): {}", tenant));
        }
    }

    if let Some(ts) = str_field(event, "timestamp") {
        if !is_iso8601(ts) {
            report.error(format!("Invalid timestamp format (expected ISO 8601): {}", ts));
        }
    }

    if let Some(app) = object.get("sourceApp") {
        match app.as_str() {
            Some(app) if SOURCE_APPS.contains(&app) => {}
            _ => report.error(format!(
                "Invalid sourceApp: {} (expected one of {})",
                display(app),
                SOURCE_APPS.join(", ")
            )),
        }
    }

    let event_type = str_field(event, "eventType");
    let mut known_type = None;
    if let Some(event_type) = event_type {
        let canonical = canonical_event_type(event_type);
        if EVENT_TYPES.contains(&canonical.as_str()) {
            if is_legacy_event_type(event_type) {
                report.warn(format!(
                    "Legacy eventType naming '{}', use '{}'",
                    event_type, canonical
                ));
            }
            if let Some(entity_type) = str_field(event, "entityType") {
                let expected = entity_type_for(&canonical);
                if entity_type != expected {
                    report.warn(format!(
                        "entityType '{}' does not match eventType prefix '{}'",
                        entity_type, expected
                    ));
                }
            }
            known_type = Some(canonical);
        } else {
            report.error(format!("Invalid eventType: {}", event_type));
        }
    }

    match object.get("data") {
        None | Some(Value::Null) => {}
        Some(Value::Object(_)) => {
            if let Some(event_type) = known_type.as_deref() {
                validate_payload(event_type, &object["data"], &mut report);
            }
        }
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed @ Value::Object(_)) => {
                if let Some(event_type) = known_type.as_deref() {
                    validate_payload(event_type, &parsed, &mut report);
                }
            }
            Ok(_) => report.error("data must be a JSON object"),
            Err(e) => report.error(format!("data is not valid JSON: {}", e)),
        },
        Some(_) => report.error("data must be an object"),
    }

    if !object.contains_key("metadata") {
        report.warn("Missing metadata");
    }
    if !object.contains_key("version") {
        report.warn("Missing version");
    }

    report.valid = report.errors.is_empty();
    report
}

/// Per-event-type structural rules. Types without rules only need an object.
fn validate_payload(event_type: &str, data: &Value, report: &mut ValidationReport) {
    let result = match event_type {
        "role.permissions_changed" => RolePermissionsChanged::from_data(data)
            .map(|_| ())
            .map_err(|e| e.to_string()),
        "role.created" | "role.updated" => require(data, &["roleId", "roleName"]),
        "role.deleted" => require(data, &["roleId"]),
        "role.assigned" | "role.unassigned" => require(data, &["roleId", "userId"]),
        "user.created" => require(data, &["userId", "email"]).and_then(|_| {
            match data.get("email").and_then(Value::as_str) {
                Some(email) if email.contains('@') => Ok(()),
                _ => Err("data.email must be a valid email address".to_string()),
            }
        }),
        "user.updated" | "user.deleted" | "user.activated" | "user.deactivated" => {
            require(data, &["userId"])
        }
        "organization.created" | "organization.updated" => {
            require(data, &["organizationId", "name"])
        }
        "organization.deleted" => require(data, &["organizationId"]),
        "organization.user_assigned" | "organization.user_removed" => {
            require(data, &["organizationId", "userId"])
        }
        "credit.allocated" | "credit.deducted" | "credit.refunded" => {
            CreditChange::from_data(data)
                .map(|_| ())
                .map_err(|e| e.to_string())
        }
        _ => Ok(()),
    };

    if let Err(message) = result {
        report.error(format!("{}: {}", event_type, message));
    }
}

fn require(data: &Value, fields: &[&'static str]) -> Result<(), String> {
    for field in fields {
        required_str(data, field).map_err(|e| e.to_string())?;
    }
    Ok(())
}

fn str_field<'a>(event: &'a Value, field: &str) -> Option<&'a str> {
    event.get(field).and_then(Value::as_str).filter(|s| !s.trim().is_empty())
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TENANT: &str = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c";
    const EVENT_ID: &str = "0b6c1f7e-3a4d-4c1e-9a7b-2f1e5d6c7b8a";

    fn base_event(event_type: &str, data: Value) -> Value {
        json!({
            "eventId": EVENT_ID,
            "eventType": event_type,
            "entityType": entity_type_for(&canonical_event_type(event_type)),
            "entityId": "entity-1",
            "tenantId": TENANT,
            "timestamp": "2025-12-11T10:00:00.000Z",
            "sourceApp": "crm",
            "version": "1.0",
            "data": data,
            "metadata": {"correlationId": "c-1"}
        })
    }

    #[test]
    fn test_valid_permissions_changed() {
        let report = validate(&base_event(
            "role.permissions_changed",
            json!({"roleId": "r1", "roleName": "Sales", "flatPermissions": ["crm.leads.read", "crm.leads.create"]}),
        ));
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let report = validate(&base_event("totally.unknown", json!({})));
        assert!(!report.valid);
        assert!(report.errors.contains(&"Invalid eventType: totally.unknown".to_string()));
    }

    #[test]
    fn test_missing_tenant_rejected() {
        let mut event = base_event("user.updated", json!({"userId": "u1"}));
        event.as_object_mut().unwrap().remove("tenantId");
        let report = validate(&event);
        assert!(!report.valid);
        assert!(report.errors.contains(&"Missing required field: tenantId".to_string()));
    }

    #[test]
    fn test_permissions_changed_without_permissions_rejected() {
        let report = validate(&base_event(
            "role.permissions_changed",
            json!({"roleId": "r1", "roleName": "Sales"}),
        ));
        assert!(!report.valid);
        assert!(report.errors[0].contains("flatPermissions"));
    }

    #[test]
    fn test_format_checks() {
        let mut event = base_event("user.updated", json!({"userId": "u1"}));
        event["eventId"] = json!("not-a-uuid");
        event["timestamp"] = json!("yesterday");
        event["sourceApp"] = json!("mystery-app");
        let report = validate(&event);
        assert_eq!(report.errors.len(), 3, "{:?}", report.errors);
    }

    #[test]
    fn test_uuid_v1_is_not_v4() {
        assert!(!is_uuid_v4("6ba7b810-9dad-11d1-80b4-00c04fd430c8"));
        assert!(is_uuid_v4(EVENT_ID));
    }

    #[test]
    fn test_legacy_type_accepted_with_warning() {
        let report = validate(&base_event("user_updated", json!({"userId": "u1"})));
        assert!(report.valid, "{:?}", report.errors);
        assert!(report.warnings.iter().any(|w| w.contains("use 'user.updated'")));
    }

    #[test]
    fn test_missing_metadata_and_version_warn() {
        let mut event = base_event("user.updated", json!({"userId": "u1"}));
        let object = event.as_object_mut().unwrap();
        object.remove("metadata");
        object.remove("version");
        let report = validate(&event);
        assert!(report.valid);
        assert_eq!(report.warnings, vec!["Missing metadata", "Missing version"]);
    }

    #[test]
    fn test_data_string_payloads() {
        let ok = validate(&base_event("user.updated", json!(r#"{"userId":"u1"}"#)));
        assert!(ok.valid, "{:?}", ok.errors);

        let broken = validate(&base_event("user.updated", json!("{oops")));
        assert!(!broken.valid);
        assert!(broken.errors[0].starts_with("data is not valid JSON"));

        let scalar = validate(&base_event("user.updated", json!(42)));
        assert!(!scalar.valid);
    }

    #[test]
    fn test_credit_amount_rules() {
        assert!(validate(&base_event("credit.allocated", json!({"amount": 0}))).valid);
        let negative = validate(&base_event("credit.allocated", json!({"amount": -5})));
        assert!(!negative.valid);
        assert!(negative.errors[0].contains("non-negative"));
    }

    #[test]
    fn test_user_created_requires_email() {
        let report = validate(&base_event("user.created", json!({"userId": "u1", "email": "nope"})));
        assert!(!report.valid);
    }

    #[test]
    fn test_validate_does_not_mutate() {
        let event = base_event("user.updated", json!(r#"{"userId":"u1"}"#));
        let before = event.clone();
        let _ = validate(&event);
        assert_eq!(event, before);
    }
}
