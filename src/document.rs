// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Documents and checkpoints.
//!
//! A [`Document`] is the unit of replication: a primary key, a deletion
//! flag and an arbitrary JSON object body. Both stores and both handlers
//! speak this type; the [`DocumentSchema`] maps it to and from the flat
//! JSON shape applications use on the wire, where the primary key and the
//! deletion flag live inside the object under configurable field names.
//!
//! ```text
//! Document { id: "a", deleted: false, data: {"n": 1} }
//!        ⇅  schema { primary_key: "id", deleted_field: "_deleted" }
//! {"id": "a", "_deleted": false, "n": 1}
//! ```
//!
//! A [`Checkpoint`] is an opaque cursor produced by the remote side. The
//! protocol never interprets it; it only persists it and hands it back.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors decoding a wire document.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DocumentError {
    /// The wire value is not a JSON object.
    #[error("document must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The primary key field is missing or not a string.
    #[error("missing or non-string primary key field '{0}'")]
    MissingPrimaryKey(String),

    /// The primary key is an empty string.
    #[error("empty primary key")]
    EmptyPrimaryKey,

    /// The deletion flag is present but not a boolean.
    #[error("deleted field '{0}' must be a boolean")]
    InvalidDeletedField(String),
}

/// A replicated document.
///
/// Equality is structural over id, deletion flag and body. Conflict handlers
/// may define a looser notion via
/// [`ConflictHandler::is_equal`](crate::conflict::ConflictHandler::is_equal).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Primary key.
    pub id: String,
    /// Tombstone flag. Deletions replicate like any other write.
    #[serde(default)]
    pub deleted: bool,
    /// Application fields, excluding primary key and deletion flag.
    #[serde(default)]
    pub data: Map<String, Value>,
}

impl Document {
    /// Create a live document.
    ///
    /// A non-object `fields` value is stored under the `"value"` key.
    pub fn new(id: impl Into<String>, fields: Value) -> Self {
        let data = match fields {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            id: id.into(),
            deleted: false,
            data,
        }
    }

    /// Create a tombstone for `id`.
    pub fn tombstone(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            deleted: true,
            data: Map::new(),
        }
    }

    /// Mark this document deleted, keeping its last body.
    #[must_use]
    pub fn into_deleted(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Read a single application field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Set a single application field.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.data.insert(field.into(), value);
    }

    /// Encode to the flat wire shape.
    pub fn to_wire(&self, schema: &DocumentSchema) -> Value {
        let mut map = self.data.clone();
        map.insert(schema.primary_key.clone(), Value::String(self.id.clone()));
        map.insert(schema.deleted_field.clone(), Value::Bool(self.deleted));
        Value::Object(map)
    }

    /// Decode from the flat wire shape.
    ///
    /// A missing deletion flag means "not deleted".
    pub fn from_wire(value: Value, schema: &DocumentSchema) -> Result<Self, DocumentError> {
        let mut map = match value {
            Value::Object(map) => map,
            Value::Null => return Err(DocumentError::NotAnObject("null")),
            Value::Bool(_) => return Err(DocumentError::NotAnObject("bool")),
            Value::Number(_) => return Err(DocumentError::NotAnObject("number")),
            Value::String(_) => return Err(DocumentError::NotAnObject("string")),
            Value::Array(_) => return Err(DocumentError::NotAnObject("array")),
        };

        let id = match map.remove(&schema.primary_key) {
            Some(Value::String(id)) => id,
            _ => return Err(DocumentError::MissingPrimaryKey(schema.primary_key.clone())),
        };
        if id.is_empty() {
            return Err(DocumentError::EmptyPrimaryKey);
        }

        let deleted = match map.remove(&schema.deleted_field) {
            None | Some(Value::Null) => false,
            Some(Value::Bool(flag)) => flag,
            Some(_) => {
                return Err(DocumentError::InvalidDeletedField(
                    schema.deleted_field.clone(),
                ))
            }
        };

        Ok(Self {
            id,
            deleted,
            data: map,
        })
    }
}

/// Field names of the primary key and deletion flag on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSchema {
    /// Primary key field name.
    #[serde(default = "default_primary_key")]
    pub primary_key: String,

    /// Deletion flag field name.
    #[serde(default = "default_deleted_field")]
    pub deleted_field: String,
}

fn default_primary_key() -> String {
    "id".to_string()
}

fn default_deleted_field() -> String {
    "_deleted".to_string()
}

impl Default for DocumentSchema {
    fn default() -> Self {
        Self {
            primary_key: default_primary_key(),
            deleted_field: default_deleted_field(),
        }
    }
}

/// Opaque replication cursor.
///
/// Produced by the fork storage (push direction) or the pull handler
/// (pull direction) and persisted by the meta store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checkpoint(pub Value);

impl Checkpoint {
    /// Wrap a JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the raw JSON value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Combine a stored checkpoint with a newer one.
    ///
    /// Object checkpoints merge key-wise with `next` winning, so a source
    /// that reports partial cursors never loses fields. A null `next` keeps
    /// `previous`. Anything else replaces it.
    pub fn stack(previous: Option<&Checkpoint>, next: Option<Checkpoint>) -> Option<Checkpoint> {
        match (previous, next) {
            (prev, None) => prev.cloned(),
            (prev, Some(Checkpoint(Value::Null))) => prev.cloned(),
            (Some(Checkpoint(Value::Object(prev))), Some(Checkpoint(Value::Object(next)))) => {
                let mut merged = prev.clone();
                for (key, value) in next {
                    merged.insert(key, value);
                }
                Some(Checkpoint(Value::Object(merged)))
            }
            (_, Some(next)) => Some(next),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_wire_encoding_uses_schema_fields() {
        let schema = DocumentSchema {
            primary_key: "key".into(),
            deleted_field: "gone".into(),
        };
        let doc = Document::new("a", json!({"n": 1}));

        assert_eq!(doc.to_wire(&schema), json!({"key": "a", "gone": false, "n": 1}));
    }

    #[test]
    fn test_from_wire_defaults_deleted_to_false() {
        let doc = Document::from_wire(json!({"id": "x", "name": "Bob"}), &DocumentSchema::default())
            .unwrap();
        assert_eq!(doc.id, "x");
        assert!(!doc.deleted);
        assert_eq!(doc.get("name"), Some(&json!("Bob")));
        assert!(doc.get("id").is_none());
    }

    #[test]
    fn test_from_wire_tombstone() {
        let doc = Document::from_wire(json!({"id": "x", "_deleted": true}), &DocumentSchema::default())
            .unwrap();
        assert_eq!(doc, Document::tombstone("x"));
    }

    #[test]
    fn test_from_wire_rejects_bad_input() {
        let schema = DocumentSchema::default();
        assert_eq!(
            Document::from_wire(json!([1, 2]), &schema),
            Err(DocumentError::NotAnObject("array"))
        );
        assert_eq!(
            Document::from_wire(json!({"name": "no key"}), &schema),
            Err(DocumentError::MissingPrimaryKey("id".into()))
        );
        assert_eq!(
            Document::from_wire(json!({"id": 7}), &schema),
            Err(DocumentError::MissingPrimaryKey("id".into()))
        );
        assert_eq!(
            Document::from_wire(json!({"id": ""}), &schema),
            Err(DocumentError::EmptyPrimaryKey)
        );
        assert_eq!(
            Document::from_wire(json!({"id": "a", "_deleted": "yes"}), &schema),
            Err(DocumentError::InvalidDeletedField("_deleted".into()))
        );
    }

    #[test]
    fn test_new_wraps_scalars() {
        let doc = Document::new("a", json!(5));
        assert_eq!(doc.get("value"), Some(&json!(5)));
        assert!(Document::new("b", Value::Null).data.is_empty());
    }

    #[test]
    fn test_equality_covers_deleted_flag() {
        let live = Document::new("a", json!({"n": 1}));
        let deleted = live.clone().into_deleted();
        assert_ne!(live, deleted);
        assert_eq!(deleted.get("n"), Some(&json!(1)));
    }

    #[test]
    fn test_stack_merges_objects() {
        let prev = Checkpoint(json!({"a": 1, "b": 1}));
        let next = Checkpoint(json!({"b": 2}));
        assert_eq!(
            Checkpoint::stack(Some(&prev), Some(next)),
            Some(Checkpoint(json!({"a": 1, "b": 2})))
        );
    }

    #[test]
    fn test_stack_keeps_previous_on_null() {
        let prev = Checkpoint(json!({"sequence": 3}));
        assert_eq!(Checkpoint::stack(Some(&prev), None), Some(prev.clone()));
        assert_eq!(
            Checkpoint::stack(Some(&prev), Some(Checkpoint(Value::Null))),
            Some(prev)
        );
        assert_eq!(Checkpoint::stack(None, None), None);
    }

    #[test]
    fn test_stack_replaces_scalars() {
        let prev = Checkpoint(json!("abc"));
        assert_eq!(
            Checkpoint::stack(Some(&prev), Some(Checkpoint(json!("abd")))),
            Some(Checkpoint(json!("abd")))
        );
    }

    #[test]
    fn test_checkpoint_serde_is_transparent() {
        let cp = Checkpoint(json!({"sequence": 9}));
        assert_eq!(serde_json::to_string(&cp).unwrap(), r#"{"sequence":9}"#);
    }
}
