//! Flat row values shared by every storage tier.
//!
//! A [`Record`] is the durable-store row and the payload of a cached
//! projection. It is a `BTreeMap` so iteration order, and therefore
//! serialization and checksum input, is deterministic.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::EntityIdentity;

/// A single scalar field value.
///
/// Serialized untagged so a record is a plain JSON object. `Int` is tried
/// before `Float` on deserialization, so whole numbers stay integers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// Type-tagged rendering used as checksum input.
    ///
    /// Floats are rendered by bit pattern so `0.1` always hashes the same.
    /// Backslash and the unit separator are escaped in text so a value can
    /// never impersonate a field boundary.
    pub fn canonical(&self) -> String {
        match self {
            FieldValue::Null => "n:".to_string(),
            FieldValue::Bool(v) => format!("b:{}", u8::from(*v)),
            FieldValue::Int(v) => format!("i:{}", v),
            FieldValue::Float(v) => format!("f:{:016x}", v.to_bits()),
            FieldValue::Text(v) => {
                let escaped = v.replace('\\', "\\\\").replace('\u{1f}', "\\u1f");
                format!("s:{}", escaped)
            }
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => f.write_str("NULL"),
            FieldValue::Bool(v) => write!(f, "{}", v),
            FieldValue::Int(v) => write!(f, "{}", v),
            FieldValue::Float(v) => write!(f, "{}", v),
            FieldValue::Text(v) => write!(f, "'{}'", v),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(i64::from(v))
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

/// A flat, ordered row.
pub type Record = BTreeMap<String, FieldValue>;

/// Typed accessors for decoding entities out of a [`Record`].
pub trait RecordExt {
    fn require(&self, collection: &str, field: &str) -> Result<&FieldValue, CoreError>;
    fn require_int(&self, collection: &str, field: &str) -> Result<i64, CoreError>;
    fn require_text(&self, collection: &str, field: &str) -> Result<String, CoreError>;
    fn optional_text(&self, field: &str) -> Option<String>;
    fn optional_int(&self, field: &str) -> Option<i64>;
}

impl RecordExt for Record {
    fn require(&self, collection: &str, field: &str) -> Result<&FieldValue, CoreError> {
        self.get(field).ok_or_else(|| CoreError::MissingField {
            collection: collection.to_string(),
            field: field.to_string(),
        })
    }

    fn require_int(&self, collection: &str, field: &str) -> Result<i64, CoreError> {
        self.require(collection, field)?
            .as_int()
            .ok_or_else(|| CoreError::FieldType {
                collection: collection.to_string(),
                field: field.to_string(),
                expected: "int",
            })
    }

    fn require_text(&self, collection: &str, field: &str) -> Result<String, CoreError> {
        self.require(collection, field)?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| CoreError::FieldType {
                collection: collection.to_string(),
                field: field.to_string(),
                expected: "text",
            })
    }

    fn optional_text(&self, field: &str) -> Option<String> {
        self.get(field).and_then(|v| v.as_text()).map(str::to_string)
    }

    fn optional_int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(FieldValue::as_int)
    }
}

/// Returns true if `name` is usable as a record field / predicate column.
pub fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// An equality predicate over record fields with its bound params.
///
/// The field list is the predicate and the param list binds it, so a
/// filter is the structured form of `a = ?1 AND b = ?2`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    fields: Vec<String>,
    params: Vec<FieldValue>,
}

impl Filter {
    /// Builds a filter, checking field names and param arity.
    pub fn new(fields: &[&str], params: Vec<FieldValue>) -> Result<Self, CoreError> {
        if fields.len() != params.len() {
            return Err(CoreError::ParamCountMismatch {
                fields: fields.len(),
                params: params.len(),
            });
        }
        for field in fields {
            if !is_valid_field_name(field) {
                return Err(CoreError::InvalidFieldName {
                    name: field.to_string(),
                });
            }
        }
        Ok(Filter {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            params,
        })
    }

    /// The default predicate: `id = <primary key>`.
    pub fn primary_key(identity: &EntityIdentity) -> Self {
        Filter {
            fields: vec!["id".to_string()],
            params: vec![identity.primary_key().to_field_value()],
        }
    }

    /// Iterates `(field, param)` pairs in predicate order.
    pub fn clauses(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(String::as_str).zip(self.params.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Evaluates the predicate against a record. Missing fields never match.
    pub fn matches(&self, record: &Record) -> bool {
        self.clauses()
            .all(|(field, param)| record.get(field).is_some_and(|v| v == param))
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() {
            return f.write_str("<all>");
        }
        let rendered: Vec<String> = self
            .clauses()
            .map(|(field, param)| format!("{} = {}", field, param))
            .collect();
        f.write_str(&rendered.join(" AND "))
    }
}
