//! Core event types for crm-sync.
//!
//! The [`Event`] struct is the canonical, immutable unit of work. Producers
//! publish it onto a Redis stream as flat string fields; the consumer engine
//! turns whatever envelope shape arrived back into an [`Event`] through
//! [`Envelope`], so handlers never branch on wire-format variants.
//!
//! # Wire format
//!
//! ```text
//! eventId     0b6c1f7e-...            (UUID v4)
//! eventType   role.permissions_changed
//! entityType  role
//! entityId    r1
//! tenantId    4f1c...                 (UUID v4)
//! timestamp   2025-12-11T10:00:00Z
//! sourceApp   crm
//! version     1.0
//! data        {"roleId":"r1",...}     (JSON string)
//! metadata    {"correlationId":...}   (JSON string)
//! ```

use std::collections::{BTreeSet, HashMap};

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::sync::LazyLock;
use thiserror::Error;

/// Schema version stamped on events built by [`create_standard_event`].
pub const EVENT_SCHEMA_VERSION: &str = "1.0";

/// Wire field order used when serializing an event for transport.
pub const WIRE_FIELDS: [&str; 10] = [
    "eventId",
    "eventType",
    "entityType",
    "entityId",
    "tenantId",
    "timestamp",
    "sourceApp",
    "version",
    "data",
    "metadata",
];

/// Fields that may carry a whole JSON-encoded event in legacy envelopes.
const LEGACY_ENVELOPE_FIELDS: [&str; 3] = ["payload", "event", "data"];

static PERMISSION_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+\.[A-Za-z0-9_-]+\.[A-Za-z0-9_*-]+$")
        .expect("permission pattern is valid")
});

/// A domain event flowing through the integration layer.
///
/// # Example
///
/// ```json
/// {
///   "eventId": "0b6c1f7e-3a4d-4c1e-9a7b-2f1e5d6c7b8a",
///   "eventType": "role.permissions_changed",
///   "entityType": "role",
///   "entityId": "r1",
///   "tenantId": "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c",
///   "timestamp": "2025-12-11T10:00:00Z",
///   "sourceApp": "crm",
///   "version": "1.0",
///   "data": { "roleId": "r1", "roleName": "Sales", "flatPermissions": ["crm.leads.read"] },
///   "metadata": { "correlationId": "abc123", "retryCount": 0 }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Globally unique event identifier (UUID v4)
    pub event_id: String,

    /// Dot-notation event type (legacy underscore names are tolerated)
    pub event_type: String,

    /// Entity kind, derived from the event type prefix when absent
    #[serde(default)]
    pub entity_type: String,

    /// Identifier of the affected domain object
    pub entity_id: String,

    /// Tenant partition key (UUID)
    pub tenant_id: String,

    /// ISO 8601 creation time
    pub timestamp: String,

    /// Application that emitted the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_app: Option<String>,

    /// Schema version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Event-specific payload (always an object after parsing)
    pub data: Value,

    /// Free-form metadata
    #[serde(default)]
    pub metadata: EventMetadata,
}

/// Event metadata. Unknown keys are preserved in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, deserialize_with = "lenient_u32")]
    pub retry_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Accepts `3`, `"3"` or null for counters that cross the string-only transport.
fn lenient_u32<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_u64().map(|n| n.min(u32::MAX as u64) as u32).unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    })
}

impl Event {
    /// Build an [`Event`] from a normalized JSON object.
    ///
    /// Fills in `entityType` from the event type prefix when it is missing.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let mut event: Event = serde_json::from_value(value)?;
        if event.entity_type.is_empty() {
            event.entity_type = entity_type_for(&event.event_type).to_string();
        }
        Ok(event)
    }

    /// The dot-notation form of this event's type.
    pub fn canonical_type(&self) -> String {
        canonical_event_type(&self.event_type)
    }

    /// Returns true if the producer used the legacy underscore naming.
    pub fn is_legacy_type(&self) -> bool {
        is_legacy_event_type(&self.event_type)
    }

    /// Correlation ID used to tie log lines together.
    pub fn correlation_id(&self) -> &str {
        self.metadata
            .correlation_id
            .as_deref()
            .unwrap_or(&self.event_id)
    }

    /// Convert to a JSON object.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Returns true for `entity_action` style names without any dot.
pub fn is_legacy_event_type(event_type: &str) -> bool {
    !event_type.contains('.') && event_type.contains('_')
}

/// Convert a legacy `role_permissions_changed` name to `role.permissions_changed`.
///
/// Names already in dot notation are returned unchanged.
pub fn canonical_event_type(event_type: &str) -> String {
    if is_legacy_event_type(event_type) {
        event_type.replacen('_', ".", 1)
    } else {
        event_type.to_string()
    }
}

/// Convert a dot-notation name to its legacy underscore alias.
pub fn legacy_event_type(event_type: &str) -> String {
    event_type.replace('.', "_")
}

/// Entity type for an event type: the segment before the first dot.
pub fn entity_type_for(event_type: &str) -> &str {
    let split_at = if is_legacy_event_type(event_type) { '_' } else { '.' };
    event_type.split(split_at).next().unwrap_or(event_type)
}

/// Build a complete event ready for publishing.
///
/// Generates the event ID, timestamp and correlation ID, derives the entity
/// type, and stamps `publishedBy` with the source app unless the caller set it.
pub fn create_standard_event(
    event_type: &str,
    entity_id: &str,
    tenant_id: &str,
    data: Value,
    metadata: Option<Map<String, Value>>,
    source_app: &str,
) -> Event {
    let metadata = metadata.unwrap_or_default();
    let mut metadata: EventMetadata = serde_json::from_value(Value::Object(metadata.clone()))
        .unwrap_or(EventMetadata {
            extra: metadata,
            ..Default::default()
        });

    if metadata.correlation_id.is_none() {
        metadata.correlation_id = Some(uuid::Uuid::new_v4().to_string());
    }
    if metadata.published_by.is_none() {
        metadata.published_by = Some(source_app.to_string());
    }

    Event {
        event_id: uuid::Uuid::new_v4().to_string(),
        event_type: event_type.to_string(),
        entity_type: entity_type_for(event_type).to_string(),
        entity_id: entity_id.to_string(),
        tenant_id: tenant_id.to_string(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        source_app: Some(source_app.to_string()),
        version: Some(EVENT_SCHEMA_VERSION.to_string()),
        data,
        metadata,
    }
}

/// Flatten an event into string-valued stream fields.
pub fn serialize_event(event: &Event) -> Vec<(String, String)> {
    serialize_value(&event.to_value())
}

/// Flatten any JSON object into string-valued stream fields.
///
/// Known wire fields come first in their canonical order. Objects and arrays
/// are JSON-encoded, scalars are written as plain strings and nulls dropped.
pub fn serialize_value(value: &Value) -> Vec<(String, String)> {
    let Some(object) = value.as_object() else {
        return Vec::new();
    };

    let mut fields = Vec::with_capacity(object.len());
    for key in WIRE_FIELDS {
        if let Some(field) = object.get(key).and_then(field_to_string) {
            fields.push((key.to_string(), field));
        }
    }
    for (key, field) in object {
        if WIRE_FIELDS.contains(&key.as_str()) {
            continue;
        }
        if let Some(field) = field_to_string(field) {
            fields.push((key.clone(), field));
        }
    }
    fields
}

fn field_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Errors raised while turning a stream message into an event object.
#[derive(Debug, Error, PartialEq)]
pub enum EnvelopeError {
    #[error("stream entry has no fields (deleted or trimmed)")]
    Empty,

    #[error("unrecognized envelope: no eventType field and no JSON event payload")]
    Unrecognized,
}

/// The shapes an event can arrive in.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Standard flat wire fields (`eventId`, `eventType`, ...)
    Fields(Map<String, Value>),

    /// Legacy: the whole event JSON-encoded inside one field
    Embedded(Map<String, Value>),
}

impl Envelope {
    /// Classify raw stream fields.
    pub fn from_fields(fields: &HashMap<String, String>) -> Result<Self, EnvelopeError> {
        if fields.is_empty() {
            return Err(EnvelopeError::Empty);
        }

        if fields.contains_key("eventType") {
            let object = fields
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            return Ok(Envelope::Fields(object));
        }

        for key in LEGACY_ENVELOPE_FIELDS {
            let Some(raw) = fields.get(key) else { continue };
            if let Ok(Value::Object(object)) = serde_json::from_str::<Value>(raw) {
                return Ok(Envelope::Embedded(unwrap_data_wrapper(object)));
            }
        }

        Err(EnvelopeError::Unrecognized)
    }

    /// Produce the canonical event object.
    ///
    /// Stringified `data` and `metadata` are decoded here; a `data` string
    /// that is not valid JSON is left as a string for the validator to reject.
    pub fn into_value(self) -> Value {
        let mut object = match self {
            Envelope::Fields(object) | Envelope::Embedded(object) => object,
        };
        for key in ["data", "metadata"] {
            if let Some(Value::String(raw)) = object.get(key) {
                if let Ok(decoded) = serde_json::from_str::<Value>(raw) {
                    if decoded.is_object() || decoded.is_array() {
                        object.insert(key.to_string(), decoded);
                    }
                }
            }
        }
        Value::Object(object)
    }
}

/// `{"data": {<event>}}` → `{<event>}`
fn unwrap_data_wrapper(object: Map<String, Value>) -> Map<String, Value> {
    if object.contains_key("eventType") {
        return object;
    }
    match object.get("data") {
        Some(Value::Object(inner)) if inner.contains_key("eventType") => inner.clone(),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(inner)) if inner.contains_key("eventType") => inner,
            _ => object,
        },
        _ => object,
    }
}

/// Parse raw stream fields straight into a canonical event object.
pub fn parse_fields(fields: &HashMap<String, String>) -> Result<Value, EnvelopeError> {
    Envelope::from_fields(fields).map(Envelope::into_value)
}

/// Errors raised by the typed payload views.
#[derive(Debug, Error, PartialEq)]
pub enum PayloadError {
    #[error("data.{0} is required")]
    MissingField(&'static str),

    #[error("data.{field} {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// The two accepted permission shapes of `role.permissions_changed`.
#[derive(Debug, Clone, PartialEq)]
pub enum PermissionSet {
    /// `{"crm": {"leads": ["read", "create"]}}` or `{"crm": {"leads": {"read": true}}}`
    Nested(Map<String, Value>),

    /// `["crm.leads.read", "crm.leads.create"]`
    Flat(Vec<String>),
}

impl PermissionSet {
    /// Flatten into `module.submodule.action` strings.
    pub fn flatten(&self) -> Result<Vec<String>, PayloadError> {
        match self {
            PermissionSet::Flat(items) => {
                for item in items {
                    if !PERMISSION_PATTERN.is_match(item) {
                        return Err(PayloadError::InvalidField {
                            field: "flatPermissions",
                            reason: format!(
                                "entry '{}' must be formatted as module.submodule.action",
                                item
                            ),
                        });
                    }
                }
                Ok(items.clone())
            }
            PermissionSet::Nested(modules) => {
                let mut out = Vec::new();
                for (module, submodules) in modules {
                    let submodules = submodules.as_object().ok_or_else(|| invalid_nested(module))?;
                    for (submodule, actions) in submodules {
                        let path = format!("{}.{}", module, submodule);
                        match actions {
                            Value::Array(list) => {
                                for action in list {
                                    let action =
                                        action.as_str().ok_or_else(|| invalid_nested(&path))?;
                                    out.push(format!("{}.{}", path, action));
                                }
                            }
                            Value::Object(flags) => {
                                for (action, enabled) in flags {
                                    match enabled {
                                        Value::Bool(true) => out.push(format!("{}.{}", path, action)),
                                        Value::Bool(false) => {}
                                        _ => return Err(invalid_nested(&path)),
                                    }
                                }
                            }
                            _ => return Err(invalid_nested(&path)),
                        }
                    }
                }
                Ok(out)
            }
        }
    }
}

fn invalid_nested(path: &str) -> PayloadError {
    PayloadError::InvalidField {
        field: "permissions",
        reason: format!(
            "entry '{}' must map submodules to an action list or action flags",
            path
        ),
    }
}

/// Normalized payload of `role.permissions_changed`.
#[derive(Debug, Clone, PartialEq)]
pub struct RolePermissionsChanged {
    pub role_id: String,
    pub role_name: String,
    /// Sorted, de-duplicated `module.submodule.action` strings
    pub permissions: Vec<String>,
}

impl RolePermissionsChanged {
    /// Parse either permission shape; when both are present they are merged.
    pub fn from_data(data: &Value) -> Result<Self, PayloadError> {
        let role_id = required_str(data, "roleId")?;
        let role_name = required_str(data, "roleName")?;

        let mut sets = Vec::new();
        match data.get("permissions") {
            Some(Value::Object(map)) => sets.push(PermissionSet::Nested(map.clone())),
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(PayloadError::InvalidField {
                    field: "permissions",
                    reason: "must be an object".to_string(),
                })
            }
        }
        match data.get("flatPermissions") {
            Some(Value::Array(items)) => {
                let mut flat = Vec::with_capacity(items.len());
                for item in items {
                    let item = item.as_str().ok_or_else(|| PayloadError::InvalidField {
                        field: "flatPermissions",
                        reason: "must contain only strings".to_string(),
                    })?;
                    flat.push(item.to_string());
                }
                sets.push(PermissionSet::Flat(flat));
            }
            Some(Value::Null) | None => {}
            Some(_) => {
                return Err(PayloadError::InvalidField {
                    field: "flatPermissions",
                    reason: "must be an array".to_string(),
                })
            }
        }

        if sets.is_empty() {
            return Err(PayloadError::MissingField("permissions or data.flatPermissions"));
        }

        let mut permissions = BTreeSet::new();
        for set in &sets {
            permissions.extend(set.flatten()?);
        }

        Ok(Self {
            role_id,
            role_name,
            permissions: permissions.into_iter().collect(),
        })
    }
}

/// Normalized payload of the `credit.*` events.
#[derive(Debug, Clone, PartialEq)]
pub struct CreditChange {
    pub amount: f64,
    pub reason: Option<String>,
}

impl CreditChange {
    /// Parse a non-negative amount given as a number or a numeric string.
    pub fn from_data(data: &Value) -> Result<Self, PayloadError> {
        let amount = match data.get("amount") {
            None | Some(Value::Null) => return Err(PayloadError::MissingField("amount")),
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        let amount = amount
            .filter(|a| a.is_finite())
            .ok_or_else(|| PayloadError::InvalidField {
                field: "amount",
                reason: "must be numeric".to_string(),
            })?;
        if amount < 0.0 {
            return Err(PayloadError::InvalidField {
                field: "amount",
                reason: "must be non-negative".to_string(),
            });
        }

        Ok(Self {
            amount,
            reason: data.get("reason").and_then(Value::as_str).map(str::to_string),
        })
    }
}

/// Read a non-empty string field from a payload.
pub(crate) fn required_str(data: &Value, field: &'static str) -> Result<String, PayloadError> {
    match data.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(PayloadError::MissingField(field)),
    }
}
