//! Declarative schema description.
//!
//! The engine uses the schema to validate documents, fill defaults and
//! compute index values. How the schema was authored (by hand, generated)
//! is not its concern.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("unknown collection {0:?}")]
    UnknownCollection(String),

    #[error("document in {collection} must be an object")]
    NotAnObject { collection: String },

    #[error("document in {collection} is missing primary key {field:?}")]
    MissingPrimaryKey { collection: String, field: String },

    #[error("field {field:?} is required")]
    MissingField { field: String },

    #[error("field {field:?} must be {expected}, found {found}")]
    TypeMismatch {
        field: String,
        expected: FieldKind,
        found: &'static str,
    },

    #[error("field {field:?} is not nullable")]
    NullNotAllowed { field: String },
}

impl SchemaError {
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::SchemaViolation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    String,
    Number,
    Boolean,
    Array,
    Object,
    Map,
    /// Reference to externally stored file content; stored as a string id
    /// or a descriptor object.
    File,
    Any,
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
            Self::Map => "map",
            Self::File => "file",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub kind: FieldKind,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Element schema for arrays, value schema for maps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Box<FieldSchema>>,
    /// Property schemas for objects.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldSchema>,
}

impl FieldSchema {
    #[must_use]
    pub const fn new(kind: FieldKind) -> Self {
        Self {
            kind,
            nullable: false,
            default: None,
            items: None,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub const fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    #[must_use]
    pub fn with_items(mut self, items: Self) -> Self {
        self.items = Some(Box::new(items));
        self
    }

    #[must_use]
    pub fn with_property(mut self, name: impl Into<String>, field: Self) -> Self {
        self.properties.insert(name.into(), field);
        self
    }

    /// A field is required when it has neither a default nor nullability.
    #[must_use]
    pub const fn is_required(&self) -> bool {
        !self.nullable && self.default.is_none()
    }

    fn check(&self, path: &str, value: &Value) -> Result<(), SchemaError> {
        if value.is_null() {
            return if self.nullable || self.kind == FieldKind::Any {
                Ok(())
            } else {
                Err(SchemaError::NullNotAllowed {
                    field: path.to_string(),
                })
            };
        }
        let ok = match self.kind {
            FieldKind::Any => true,
            FieldKind::String => value.is_string(),
            FieldKind::Number => value.is_number(),
            FieldKind::Boolean => value.is_boolean(),
            FieldKind::Array => value.is_array(),
            FieldKind::Object | FieldKind::Map => value.is_object(),
            FieldKind::File => value.is_string() || value.is_object(),
        };
        if !ok {
            return Err(SchemaError::TypeMismatch {
                field: path.to_string(),
                expected: self.kind,
                found: json_kind(value),
            });
        }

        match (self.kind, value) {
            (FieldKind::Array, Value::Array(items)) => {
                if let Some(item_schema) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        item_schema.check(&format!("{path}[{i}]"), item)?;
                    }
                }
            }
            (FieldKind::Map, Value::Object(entries)) => {
                if let Some(value_schema) = &self.items {
                    for (key, entry) in entries {
                        value_schema.check(&format!("{path}.{key}"), entry)?;
                    }
                }
            }
            (FieldKind::Object, Value::Object(map)) => {
                check_properties(path, &self.properties, map)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn fill_defaults(&self, value: &mut Value) {
        if let (FieldKind::Object, Value::Object(map)) = (self.kind, value) {
            fill_properties(&self.properties, map);
        }
    }
}

fn check_properties(
    prefix: &str,
    properties: &BTreeMap<String, FieldSchema>,
    map: &Map<String, Value>,
) -> Result<(), SchemaError> {
    for (name, field) in properties {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match map.get(name) {
            Some(value) => field.check(&path, value)?,
            None if field.is_required() => return Err(SchemaError::MissingField { field: path }),
            None => {}
        }
    }
    Ok(())
}

fn fill_properties(properties: &BTreeMap<String, FieldSchema>, map: &mut Map<String, Value>) {
    for (name, field) in properties {
        match map.get_mut(name) {
            Some(existing) => field.fill_defaults(existing),
            None => {
                if let Some(default) = &field.default {
                    map.insert(name.clone(), default.clone());
                } else if field.nullable {
                    map.insert(name.clone(), Value::Null);
                }
            }
        }
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Index value computed from a whole document.
pub type IndexFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// An index declaration.
#[derive(Clone)]
pub enum IndexSchema {
    /// Index a single field.
    Direct { field: String },
    /// Index a value computed from the document.
    Synthetic { compute: IndexFn },
    /// Index a tuple of fields, in order.
    Compound { fields: Vec<String> },
}

impl fmt::Debug for IndexSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { field } => f.debug_struct("Direct").field("field", field).finish(),
            Self::Synthetic { .. } => f.write_str("Synthetic"),
            Self::Compound { fields } => {
                f.debug_struct("Compound").field("fields", fields).finish()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct CollectionSchema {
    pub primary_key: String,
    pub fields: BTreeMap<String, FieldSchema>,
    pub indexes: BTreeMap<String, IndexSchema>,
}

impl CollectionSchema {
    /// A collection keyed by a string `primary_key` field.
    #[must_use]
    pub fn new(primary_key: impl Into<String>) -> Self {
        let primary_key = primary_key.into();
        let mut fields = BTreeMap::new();
        fields.insert(primary_key.clone(), FieldSchema::new(FieldKind::String));
        Self {
            primary_key,
            fields,
            indexes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field: FieldSchema) -> Self {
        self.fields.insert(name.into(), field);
        self
    }

    #[must_use]
    pub fn index(mut self, name: impl Into<String>, index: IndexSchema) -> Self {
        self.indexes.insert(name.into(), index);
        self
    }
}

/// A versioned set of collections.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub version: u32,
    pub collections: BTreeMap<String, CollectionSchema>,
}

impl Schema {
    #[must_use]
    pub fn new(version: u32) -> Self {
        Self {
            version,
            collections: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn collection(mut self, name: impl Into<String>, collection: CollectionSchema) -> Self {
        self.collections.insert(name.into(), collection);
        self
    }

    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownCollection`] if `name` is not declared.
    pub fn get(&self, name: &str) -> Result<&CollectionSchema, SchemaError> {
        self.collections
            .get(name)
            .ok_or_else(|| SchemaError::UnknownCollection(name.to_string()))
    }

    /// Validate a full (denormalized) document against its collection.
    ///
    /// Fields not declared in the schema are allowed.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchemaError`] found.
    pub fn validate_document(&self, collection: &str, doc: &Value) -> Result<(), SchemaError> {
        let schema = self.get(collection)?;
        let map = doc.as_object().ok_or_else(|| SchemaError::NotAnObject {
            collection: collection.to_string(),
        })?;
        if !map.get(&schema.primary_key).is_some_and(Value::is_string) {
            return Err(SchemaError::MissingPrimaryKey {
                collection: collection.to_string(),
                field: schema.primary_key.clone(),
            });
        }
        check_properties("", &schema.fields, map)
    }

    /// Validate one top-level field value.
    ///
    /// # Errors
    ///
    /// Returns a [`SchemaError`] if the value does not fit the field.
    pub fn validate_field(
        &self,
        collection: &str,
        name: &str,
        value: &Value,
    ) -> Result<(), SchemaError> {
        match self.get(collection)?.fields.get(name) {
            Some(field) => field.check(name, value),
            None => Ok(()),
        }
    }

    /// Fill declared defaults (and `null` for nullable fields) that are
    /// missing from `doc`, recursing into declared object properties.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownCollection`] if `collection` is not
    /// declared.
    pub fn apply_defaults(&self, collection: &str, doc: &mut Value) -> Result<(), SchemaError> {
        let schema = self.get(collection)?;
        if let Value::Object(map) = doc {
            fill_properties(&schema.fields, map);
        }
        Ok(())
    }

    /// Compute every index value of `doc`. Missing direct fields index as
    /// `null`; compound indexes produce an array.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::UnknownCollection`] if `collection` is not
    /// declared.
    pub fn index_values(
        &self,
        collection: &str,
        doc: &Value,
    ) -> Result<BTreeMap<String, Value>, SchemaError> {
        let schema = self.get(collection)?;
        let field = |name: &str| doc.get(name).cloned().unwrap_or(Value::Null);
        Ok(schema
            .indexes
            .iter()
            .map(|(name, index)| {
                let value = match index {
                    IndexSchema::Direct { field: f } => field(f),
                    IndexSchema::Synthetic { compute } => compute(doc),
                    IndexSchema::Compound { fields } => {
                        Value::Array(fields.iter().map(|f| field(f)).collect())
                    }
                };
                (name.clone(), value)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(2).collection(
            "todos",
            CollectionSchema::new("id")
                .field("title", FieldSchema::new(FieldKind::String))
                .field(
                    "done",
                    FieldSchema::new(FieldKind::Boolean).with_default(json!(false)),
                )
                .field("due", FieldSchema::new(FieldKind::Number).nullable())
                .field(
                    "tags",
                    FieldSchema::new(FieldKind::Array)
                        .with_items(FieldSchema::new(FieldKind::String))
                        .with_default(json!([])),
                )
                .field(
                    "meta",
                    FieldSchema::new(FieldKind::Object)
                        .with_property(
                            "priority",
                            FieldSchema::new(FieldKind::Number).with_default(json!(0)),
                        )
                        .with_default(json!({})),
                )
                .field("attachment", FieldSchema::new(FieldKind::File).nullable())
                .index("by_done", IndexSchema::Direct { field: "done".into() })
                .index(
                    "title_len",
                    IndexSchema::Synthetic {
                        compute: Arc::new(|doc| {
                            json!(doc["title"].as_str().map_or(0, str::len))
                        }),
                    },
                )
                .index(
                    "done_due",
                    IndexSchema::Compound {
                        fields: vec!["done".into(), "due".into()],
                    },
                ),
        )
    }

    #[test]
    fn defaults_then_validate() {
        let schema = schema();
        let mut doc = json!({"id": "1", "title": "milk"});
        schema.apply_defaults("todos", &mut doc).expect("defaults");
        assert_eq!(
            doc,
            json!({
                "id": "1",
                "title": "milk",
                "done": false,
                "due": null,
                "tags": [],
                "meta": {},
                "attachment": null
            })
        );
        schema.validate_document("todos", &doc).expect("valid");
    }

    #[test]
    fn nested_defaults_fill_existing_objects() {
        let schema = schema();
        let mut doc = json!({"id": "1", "title": "x", "meta": {}});
        schema.apply_defaults("todos", &mut doc).expect("defaults");
        assert_eq!(doc["meta"], json!({"priority": 0}));
    }

    #[test]
    fn validation_errors() {
        let schema = schema();
        assert_eq!(
            schema.validate_document("nope", &json!({})),
            Err(SchemaError::UnknownCollection("nope".into()))
        );
        assert!(matches!(
            schema.validate_document("todos", &json!({"title": "x"})),
            Err(SchemaError::MissingPrimaryKey { .. })
        ));
        assert!(matches!(
            schema.validate_document("todos", &json!({"id": "1"})),
            Err(SchemaError::MissingField { field }) if field == "title"
        ));
        assert!(matches!(
            schema.validate_document("todos", &json!({"id": "1", "title": 3})),
            Err(SchemaError::TypeMismatch { expected: FieldKind::String, found: "number", .. })
        ));
        assert!(matches!(
            schema.validate_document("todos", &json!({"id": "1", "title": null})),
            Err(SchemaError::NullNotAllowed { .. })
        ));
        assert!(matches!(
            schema.validate_document("todos", &json!({"id": "1", "title": "t", "tags": [1]})),
            Err(SchemaError::TypeMismatch { field, .. }) if field == "tags[0]"
        ));
        assert!(
            schema
                .validate_field("todos", "due", &json!(null))
                .is_ok()
        );
        assert!(
            schema
                .validate_field("todos", "done", &json!("yes"))
                .is_err()
        );
    }

    #[test]
    fn index_values_cover_all_kinds() {
        let schema = schema();
        let doc = json!({"id": "1", "title": "milk", "done": true});
        let values = schema.index_values("todos", &doc).expect("indexes");
        assert_eq!(values["by_done"], json!(true));
        assert_eq!(values["title_len"], json!(4));
        assert_eq!(values["done_due"], json!([true, null]));
    }

    #[test]
    fn field_schema_deserializes_from_json() {
        let field: FieldSchema = serde_json::from_value(json!({
            "kind": "map",
            "items": {"kind": "number"},
            "nullable": true
        }))
        .expect("deserialize");
        assert_eq!(field.kind, FieldKind::Map);
        assert!(field.nullable);
        assert!(field.items.is_some());
    }
}
