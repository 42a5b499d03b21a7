//! Stream key to stream type table.
//!
//! The table is built once at startup (from defaults or the `[[streams]]`
//! config section) and shared by reference; nothing mutates it afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::{canonical_event_type, entity_type_for, legacy_event_type};

/// Type assigned to stream keys that neither the table nor the patterns know.
pub const UNKNOWN_STREAM_TYPE: &str = "unknown-events";

/// Cross-cutting stream for credit ledger events.
pub const CREDIT_STREAM: &str = "credit-events";

/// Cross-cutting stream for organization membership events.
pub const ORGANIZATION_ASSIGNMENTS_STREAM: &str = "crm:organization-assignments";

/// One configured stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamDefinition {
    pub key: String,

    #[serde(alias = "stream_type")]
    pub stream_type: String,

    /// Carries events for every tenant; consumers filter on `tenantId`.
    #[serde(default = "default_shared")]
    pub shared: bool,
}

fn default_shared() -> bool {
    true
}

impl StreamDefinition {
    pub fn new(key: impl Into<String>, stream_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            stream_type: stream_type.into(),
            shared: true,
        }
    }
}

const USER_EVENTS: [&str; 5] = [
    "user_created",
    "user_updated",
    "user_deleted",
    "user_activated",
    "user_deactivated",
];

const ROLE_EVENTS: [&str; 6] = [
    "role_created",
    "role_updated",
    "role_deleted",
    "role_permissions_changed",
    "role_assigned",
    "role_unassigned",
];

const ORGANIZATION_EVENTS: [&str; 3] = [
    "organization_created",
    "organization_updated",
    "organization_deleted",
];

/// Immutable stream key → stream type mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTable {
    streams: BTreeMap<String, StreamDefinition>,
}

impl StreamTable {
    pub fn new(definitions: impl IntoIterator<Item = StreamDefinition>) -> Self {
        Self {
            streams: definitions
                .into_iter()
                .map(|d| (d.key.clone(), d))
                .collect(),
        }
    }

    /// Every stream the CRM publishes to.
    pub fn standard() -> Self {
        let domain = |domain: &'static str, names: &'static [&'static str], stream_type: &'static str| {
            names.iter().map(move |name| {
                StreamDefinition::new(format!("crm:sync:{}:{}", domain, name), stream_type)
            })
        };

        Self::new(
            domain("user", &USER_EVENTS, "user-events")
                .chain(domain("role", &ROLE_EVENTS, "role-events"))
                .chain(domain("organization", &ORGANIZATION_EVENTS, "organization-events"))
                .chain([
                    StreamDefinition::new(ORGANIZATION_ASSIGNMENTS_STREAM, "organization-assignment-events"),
                    StreamDefinition::new(CREDIT_STREAM, "credit-events"),
                ]),
        )
    }

    pub fn get(&self, key: &str) -> Option<&StreamDefinition> {
        self.streams.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.streams.keys().cloned().collect()
    }

    pub fn definitions(&self) -> impl Iterator<Item = &StreamDefinition> {
        self.streams.values()
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Whether events for several tenants share `key`. Unknown keys are
    /// treated as shared so the tenant filter still applies.
    pub fn is_shared(&self, key: &str) -> bool {
        self.streams.get(key).map_or(true, |d| d.shared)
    }

    /// Stream type for `key`, falling back to pattern matching.
    pub fn stream_type(&self, key: &str) -> String {
        match self.streams.get(key) {
            Some(definition) => definition.stream_type.clone(),
            None => infer_stream_type(key),
        }
    }

    /// Stream keys grouped by stream type, in key order.
    pub fn by_type(&self) -> BTreeMap<String, Vec<String>> {
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for definition in self.streams.values() {
            grouped
                .entry(definition.stream_type.clone())
                .or_default()
                .push(definition.key.clone());
        }
        grouped
    }
}

impl Default for StreamTable {
    fn default() -> Self {
        Self::standard()
    }
}

/// Pattern fallback for keys missing from the table.
pub fn infer_stream_type(key: &str) -> String {
    if let Some(rest) = key.strip_prefix("crm:sync:") {
        if let Some((domain, _)) = rest.split_once(':') {
            if !domain.is_empty() {
                return format!("{}-events", domain);
            }
        }
    }

    let lower = key.to_ascii_lowercase();
    if lower.contains("assignment") {
        "organization-assignment-events".to_string()
    } else if lower.contains("organization") {
        "organization-events".to_string()
    } else if lower.contains("role") {
        "role-events".to_string()
    } else if lower.contains("user") {
        "user-events".to_string()
    } else if lower.contains("credit") {
        "credit-events".to_string()
    } else {
        UNKNOWN_STREAM_TYPE.to_string()
    }
}

/// Stream a producer should append `event_type` to.
pub fn stream_for_event_type(event_type: &str) -> String {
    let canonical = canonical_event_type(event_type);
    match canonical.as_str() {
        "organization.user_assigned" | "organization.user_removed" => {
            ORGANIZATION_ASSIGNMENTS_STREAM.to_string()
        }
        t if t.starts_with("credit.") => CREDIT_STREAM.to_string(),
        t => format!("crm:sync:{}:{}", entity_type_for(t), legacy_event_type(t)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table() {
        let table = StreamTable::standard();
        assert_eq!(table.len(), 16);
        assert_eq!(table.stream_type("crm:sync:role:role_permissions_changed"), "role-events");
        assert_eq!(table.stream_type("credit-events"), "credit-events");
        assert_eq!(
            table.stream_type("crm:organization-assignments"),
            "organization-assignment-events"
        );
        assert!(table.is_shared("crm:sync:user:user_created"));
    }

    #[test]
    fn test_pattern_fallback() {
        assert_eq!(infer_stream_type("crm:sync:contact:contact_created"), "contact-events");
        assert_eq!(infer_stream_type("legacy-role-stream"), "role-events");
        assert_eq!(infer_stream_type("billing:credits"), "credit-events");
        assert_eq!(infer_stream_type("something-else"), UNKNOWN_STREAM_TYPE);
    }

    #[test]
    fn test_stream_for_event_type() {
        assert_eq!(
            stream_for_event_type("role.permissions_changed"),
            "crm:sync:role:role_permissions_changed"
        );
        assert_eq!(stream_for_event_type("user_created"), "crm:sync:user:user_created");
        assert_eq!(stream_for_event_type("credit.deducted"), CREDIT_STREAM);
        assert_eq!(
            stream_for_event_type("organization.user_assigned"),
            ORGANIZATION_ASSIGNMENTS_STREAM
        );
    }

    #[test]
    fn test_by_type_groups_keys() {
        let grouped = StreamTable::standard().by_type();
        assert_eq!(grouped["role-events"].len(), 6);
        assert_eq!(grouped["credit-events"], vec!["credit-events".to_string()]);
    }
}
