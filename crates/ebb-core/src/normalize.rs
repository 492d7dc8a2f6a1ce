//! Payload normalizer
//!
//! Validates raw JSON payloads against the table registry and produces a
//! canonical, local-named form. Dotted keys and fields the schema does not know
//! are stripped; wrong kinds and missing required fields fail with an error
//! naming the field. All functions here are pure.

use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::registry::{Direction, FieldKind, TableMeta, TableRegistry};

/// A payload that does not satisfy its table's schema
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid `{table}` payload: {}", describe(.field.as_deref(), .reason))]
pub struct ValidationError {
    pub table: String,
    pub field: Option<String>,
    pub reason: String,
}

fn describe(field: Option<&str>, reason: &str) -> String {
    match field {
        Some(field) => format!("field `{field}` {reason}"),
        None => reason.to_string(),
    }
}

impl ValidationError {
    fn payload(table: &str, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            field: None,
            reason: reason.into(),
        }
    }

    fn field(table: &str, field: &str, reason: impl Into<String>) -> Self {
        Self {
            table: table.to_string(),
            field: Some(field.to_string()),
            reason: reason.into(),
        }
    }
}

/// Schema-checked payload keyed by local field names
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalPayload {
    table: String,
    primary_key: String,
    fields: Map<String, Value>,
}

impl CanonicalPayload {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub const fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    /// Drop every field for which `keep` returns false
    pub fn retain_fields(&mut self, mut keep: impl FnMut(&str) -> bool) {
        self.fields.retain(|name, _| keep(name));
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Registry-backed normalizer shared by capture, resolver, and the relay
#[derive(Debug, Clone)]
pub struct Normalizer {
    registry: Arc<TableRegistry>,
}

impl Normalizer {
    pub const fn new(registry: Arc<TableRegistry>) -> Self {
        Self { registry }
    }

    pub const fn registry(&self) -> &Arc<TableRegistry> {
        &self.registry
    }

    /// Validate a payload written with local field names
    pub fn normalize(&self, table: &str, raw: &Value) -> Result<CanonicalPayload, ValidationError> {
        let meta = self.meta(table)?;
        let object = as_object(table, raw)?;
        canonicalize(meta, object.iter().map(|(key, value)| (key.as_str(), value)), true)
    }

    /// Validate a payload received with wire field names
    pub fn from_wire(&self, table: &str, raw: &Value) -> Result<CanonicalPayload, ValidationError> {
        let meta = self.meta(table)?;
        let object = as_object(table, raw)?;
        let map = meta.field_map();
        canonicalize(
            meta,
            object
                .iter()
                .map(|(key, value)| (map.translate(key, Direction::Inbound), value)),
            false,
        )
    }

    /// Rename to wire names and drop derived fields
    pub fn to_wire(&self, payload: &CanonicalPayload) -> Result<Map<String, Value>, ValidationError> {
        let meta = self.meta(&payload.table)?;
        let map = meta.field_map();
        Ok(payload
            .fields
            .iter()
            .filter(|(name, _)| !meta.field(name).is_some_and(|spec| spec.derived))
            .map(|(name, value)| {
                (
                    map.translate(name, Direction::Outbound).to_string(),
                    value.clone(),
                )
            })
            .collect())
    }

    /// Validate a primary key supplied on its own (deletes, lookups)
    pub fn primary_key(&self, table: &str, raw: &str) -> Result<String, ValidationError> {
        let meta = self.meta(table)?;
        check_text_key(table, meta.primary_key(), raw)?;
        Ok(raw.to_string())
    }

    fn meta(&self, table: &str) -> Result<&TableMeta, ValidationError> {
        self.registry
            .get(table)
            .map_err(|_| ValidationError::payload(table, "table is not synchronized"))
    }
}

fn as_object<'a>(table: &str, raw: &'a Value) -> Result<&'a Map<String, Value>, ValidationError> {
    raw.as_object()
        .ok_or_else(|| ValidationError::payload(table, "payload must be a JSON object"))
}

fn canonicalize<'a>(
    meta: &TableMeta,
    entries: impl Iterator<Item = (&'a str, &'a Value)>,
    allow_derived: bool,
) -> Result<CanonicalPayload, ValidationError> {
    let table = meta.name();
    let mut fields = Map::new();

    for (name, value) in entries {
        if name.contains('.') {
            tracing::debug!(table, field = name, "Stripped dotted payload key");
            continue;
        }
        let Some(spec) = meta.field(name) else {
            tracing::debug!(table, field = name, "Stripped unknown payload key");
            continue;
        };
        if spec.derived && !allow_derived {
            continue;
        }
        if value.is_null() {
            if spec.required {
                return Err(ValidationError::field(table, name, "must not be null"));
            }
        } else if !kind_matches(spec.kind, value) {
            return Err(ValidationError::field(
                table,
                name,
                format!("must be {}", kind_label(spec.kind)),
            ));
        }
        fields.insert(name.to_string(), value.clone());
    }

    for (name, spec) in meta.fields() {
        if spec.required && !spec.derived && !fields.contains_key(name) {
            return Err(ValidationError::field(table, name, "is required"));
        }
    }

    let primary_key = match fields.get(meta.primary_key()) {
        Some(Value::String(key)) => {
            check_text_key(table, meta.primary_key(), key)?;
            key.clone()
        }
        Some(Value::Number(key)) if key.is_i64() || key.is_u64() => key.to_string(),
        _ => {
            return Err(ValidationError::field(
                table,
                meta.primary_key(),
                "must be a non-empty primary key",
            ))
        }
    };

    Ok(CanonicalPayload {
        table: table.to_string(),
        primary_key,
        fields,
    })
}

/// Text keys are stored verbatim: non-empty and unpadded
fn check_text_key(table: &str, field: &str, key: &str) -> Result<(), ValidationError> {
    if key.trim().is_empty() {
        return Err(ValidationError::field(table, field, "must not be empty"));
    }
    if key.trim() != key {
        return Err(ValidationError::field(
            table,
            field,
            "must not have surrounding whitespace",
        ));
    }
    Ok(())
}

fn kind_matches(kind: FieldKind, value: &Value) -> bool {
    match kind {
        FieldKind::Text => value.is_string(),
        FieldKind::Integer => value.is_i64() || value.is_u64(),
        FieldKind::Float => value.is_number(),
        FieldKind::Boolean => value.is_boolean(),
        FieldKind::Json => true,
    }
}

const fn kind_label(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "a string",
        FieldKind::Integer => "an integer",
        FieldKind::Float => "a number",
        FieldKind::Boolean => "a boolean",
        FieldKind::Json => "JSON",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(TableRegistry::builtin()))
    }

    #[test]
    fn strips_unknown_and_dotted_keys() {
        let payload = normalizer()
            .normalize(
                "threads",
                &json!({
                    "id": "t1",
                    "title": "Hello",
                    "created_at": 1,
                    "updated_at": 2,
                    "settings.theme": "dark",
                    "unexpected": true
                }),
            )
            .unwrap();

        assert_eq!(payload.primary_key(), "t1");
        assert_eq!(
            payload.into_value(),
            json!({ "id": "t1", "title": "Hello", "created_at": 1, "updated_at": 2 })
        );
    }

    #[test]
    fn rejects_wrong_kind_naming_the_field() {
        let error = normalizer()
            .normalize(
                "threads",
                &json!({ "id": "t1", "created_at": "yesterday", "updated_at": 2 }),
            )
            .unwrap_err();

        assert_eq!(error.field.as_deref(), Some("created_at"));
        assert!(error.to_string().contains("`created_at` must be an integer"));
    }

    #[test]
    fn rejects_missing_required_field() {
        let error = normalizer()
            .normalize("messages", &json!({ "id": "m1", "thread_id": "t1", "role": "user", "created_at": 1 }))
            .unwrap_err();
        assert_eq!(error.field.as_deref(), Some("content"));
    }

    #[test]
    fn rejects_non_object_and_unknown_table() {
        assert!(normalizer().normalize("threads", &json!([1, 2])).is_err());
        let error = normalizer().normalize("widgets", &json!({})).unwrap_err();
        assert!(error.to_string().contains("not synchronized"));
    }

    #[test]
    fn wire_round_trip_renames_and_drops_derived_fields() {
        let normalizer = normalizer();
        let local = normalizer
            .normalize(
                "files",
                &json!({
                    "id": "f1",
                    "name": "a.png",
                    "storage_reference": "bucket/a.png",
                    "reference_count": 3,
                    "created_at": 10
                }),
            )
            .unwrap();

        let wire = normalizer.to_wire(&local).unwrap();
        assert_eq!(
            Value::Object(wire.clone()),
            json!({ "id": "f1", "name": "a.png", "storageReference": "bucket/a.png", "createdAt": 10 })
        );

        let back = normalizer.from_wire("files", &Value::Object(wire)).unwrap();
        assert_eq!(back.fields().get("storage_reference"), Some(&json!("bucket/a.png")));
        assert!(back.fields().get("reference_count").is_none());
    }

    #[test]
    fn inbound_derived_fields_are_ignored() {
        let payload = normalizer()
            .from_wire(
                "threads",
                &json!({ "id": "t1", "createdAt": 1, "updatedAt": 1, "message_count": 99 }),
            )
            .unwrap();
        assert!(payload.fields().get("message_count").is_none());
    }

    #[test]
    fn integer_primary_keys_are_canonical_strings() {
        let registry = TableRegistry::from_json(
            r#"{ "tables": [ { "name": "counters", "primary_key": "n", "fields": { "n": { "kind": "integer", "required": true } } } ] }"#,
        )
        .unwrap();
        let payload = Normalizer::new(Arc::new(registry))
            .normalize("counters", &json!({ "n": 42 }))
            .unwrap();
        assert_eq!(payload.primary_key(), "42");
    }

    #[test]
    fn padded_primary_keys_are_rejected() {
        let normalizer = normalizer();
        let error = normalizer
            .normalize(
                "threads",
                &json!({ "id": " t1 ", "created_at": 1, "updated_at": 1 }),
            )
            .unwrap_err();
        assert_eq!(error.field.as_deref(), Some("id"));
        assert!(error.to_string().contains("surrounding whitespace"));

        let error = normalizer.primary_key("threads", "t1 ").unwrap_err();
        assert!(error.to_string().contains("surrounding whitespace"));
        assert!(normalizer.primary_key("threads", "  ").is_err());
        assert_eq!(normalizer.primary_key("threads", "t1").unwrap(), "t1");
    }

    #[test]
    fn optional_fields_accept_null() {
        let payload = normalizer()
            .normalize(
                "threads",
                &json!({ "id": "t1", "title": null, "created_at": 1, "updated_at": 1 }),
            )
            .unwrap();
        assert_eq!(payload.fields().get("title"), Some(&Value::Null));
    }
}
