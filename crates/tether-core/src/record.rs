//! # Record
//!
//! The untyped entity instance that flows through every tether layer.
//!
//! ## Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Record Identity                                 │
//! │                                                                         │
//! │  row_id       Store identity. None until the first commit.             │
//! │               Never changes once assigned; merges keep it.             │
//! │                                                                         │
//! │  primary key  Value of `fields[primary_key_field]`.                    │
//! │               Used for dedup. Absent or JSON null = no key,            │
//! │               and keyless records are never merged together.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Lifecycle
//! `new_object` → (caller memory only) → save / upsert → stored → destroy.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entity::PersistableEntity;
use crate::error::{CoreError, CoreResult};

/// Field name → value mapping. Insertion order is irrelevant.
pub type FieldMap = Map<String, Value>;

/// Generic decoded structure (object/array of primitives) produced from a
/// network response before entity mapping.
pub type ParseTree = Value;

/// One logical entity instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    entity: String,
    primary_key_field: String,
    fields: FieldMap,
    row_id: Option<i64>,
    #[serde(skip)]
    dirty: BTreeSet<String>,
}

impl Record {
    /// Creates an empty, never-committed record.
    pub fn new(entity: impl Into<String>, primary_key_field: impl Into<String>) -> Self {
        Record {
            entity: entity.into(),
            primary_key_field: primary_key_field.into(),
            fields: FieldMap::new(),
            row_id: None,
            dirty: BTreeSet::new(),
        }
    }

    /// Pre-populates a new record from a field mapping. Every field starts dirty.
    pub fn with_fields(mut self, fields: FieldMap) -> Self {
        for (key, value) in fields {
            self.set(key, value);
        }
        self
    }

    /// Rebuilds a committed record from storage. Nothing is dirty.
    pub fn from_stored(
        entity: impl Into<String>,
        primary_key_field: impl Into<String>,
        row_id: i64,
        fields: FieldMap,
    ) -> Self {
        Record {
            entity: entity.into(),
            primary_key_field: primary_key_field.into(),
            fields,
            row_id: Some(row_id),
            dirty: BTreeSet::new(),
        }
    }

    /// Collection this record belongs to.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Name of the field used for identity comparison.
    pub fn primary_key_field(&self) -> &str {
        &self.primary_key_field
    }

    /// Primary-key value, or `None` when absent or JSON null.
    pub fn primary_key(&self) -> Option<&Value> {
        self.fields
            .get(&self.primary_key_field)
            .filter(|value| !value.is_null())
    }

    /// Store identity, assigned on first commit.
    pub fn row_id(&self) -> Option<i64> {
        self.row_id
    }

    /// Whether this instance has never been committed.
    pub fn is_new(&self) -> bool {
        self.row_id.is_none()
    }

    /// Whether any field changed since the record was loaded or last committed.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Fields changed since the record was loaded or last committed.
    pub fn dirty_fields(&self) -> impl Iterator<Item = &str> {
        self.dirty.iter().map(String::as_str)
    }

    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field and marks it dirty.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        let field = field.into();
        self.dirty.insert(field.clone());
        self.fields.insert(field, value.into());
    }

    /// Removes a field and marks it dirty.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        let removed = self.fields.remove(field);
        if removed.is_some() {
            self.dirty.insert(field.to_string());
        }
        removed
    }

    /// Records the store identity after an insert.
    pub fn assign_row_id(&mut self, row_id: i64) {
        self.row_id = Some(row_id);
    }

    /// Clears dirty state after a successful write.
    pub fn mark_clean(&mut self) {
        self.dirty.clear();
    }

    /// Converts the field bag into a typed entity.
    pub fn to_entity<E: PersistableEntity>(&self) -> CoreResult<E> {
        E::from_record(self)
    }

    /// Consumes the record, returning its field bag.
    pub fn into_fields(self) -> FieldMap {
        self.fields
    }
}

/// Short human-readable name for a JSON value kind, for error messages.
pub fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Unwraps a parse-tree node into a field mapping.
pub fn expect_object(entity: &str, node: ParseTree) -> CoreResult<FieldMap> {
    match node {
        Value::Object(map) => Ok(map),
        other => Err(CoreError::mapping(
            entity,
            format!("expected object, got {}", value_kind(&other)),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_new_record_is_new_and_clean() {
        let record = Record::new("Article", "objID");
        assert!(record.is_new());
        assert!(!record.is_dirty());
        assert_eq!(record.primary_key(), None);
    }

    #[test]
    fn test_with_fields_marks_dirty() {
        let record = Record::new("Article", "objID").with_fields(fields(json!({
            "objID": 1,
            "title": "Hello"
        })));

        assert_eq!(record.primary_key(), Some(&json!(1)));
        let dirty: Vec<&str> = record.dirty_fields().collect();
        assert_eq!(dirty, vec!["objID", "title"]);
    }

    #[test]
    fn test_null_primary_key_is_absent() {
        let record =
            Record::new("Article", "objID").with_fields(fields(json!({ "objID": null })));
        assert_eq!(record.primary_key(), None);
    }

    #[test]
    fn test_from_stored_is_clean() {
        let mut record =
            Record::from_stored("Article", "objID", 42, fields(json!({ "objID": 1 })));
        assert!(!record.is_new());
        assert_eq!(record.row_id(), Some(42));
        assert!(!record.is_dirty());

        record.set("title", "Changed");
        assert!(record.is_dirty());

        record.mark_clean();
        assert!(!record.is_dirty());
    }

    #[test]
    fn test_remove_marks_dirty_only_when_present() {
        let mut record =
            Record::from_stored("Article", "objID", 1, fields(json!({ "title": "x" })));
        assert!(record.remove("missing").is_none());
        assert!(!record.is_dirty());

        assert_eq!(record.remove("title"), Some(json!("x")));
        assert!(record.is_dirty());
    }

    #[test]
    fn test_expect_object() {
        assert!(expect_object("Article", json!({ "a": 1 })).is_ok());

        let err = expect_object("Article", json!(42)).unwrap_err();
        assert!(err.to_string().contains("expected object, got number"));
    }
}
