//! Core error types for keystone-core.
//!
//! Uses `thiserror` for structured, matchable error variants covering
//! identity validation, query construction and record decoding.

use thiserror::Error;

/// Core errors produced by the keystone-core crate.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoreError {
    /// An entity identity could not be normalized into a storage key.
    #[error("invalid identity: {reason}")]
    InvalidIdentity { reason: String },

    /// A field name is not usable as a record or predicate column.
    #[error("invalid field name: '{name}'")]
    InvalidFieldName { name: String },

    /// A filter was built with a different number of params than fields.
    #[error("filter has {fields} field(s) but {params} param(s)")]
    ParamCountMismatch { fields: usize, params: usize },

    /// A record is missing a field the entity requires.
    #[error("record for '{collection}' is missing field '{field}'")]
    MissingField { collection: String, field: String },

    /// A record field holds a value of the wrong kind.
    #[error("field '{field}' of '{collection}' has unexpected type: expected {expected}")]
    FieldType {
        collection: String,
        field: String,
        expected: &'static str,
    },
}
