//! Entity identity and the canonical storage key derived from it.
//!
//! A [`StorageKey`] is the single name an entity has across the runtime
//! tier, the shared cache and the lock namespace. It is always derived from
//! an [`EntityIdentity`] (or parsed back from one of its own renderings), so
//! every namespace agrees on the same `collection:pk` spelling.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::value::FieldValue;

/// Separator between collection and primary key inside a storage key.
pub const KEY_SEPARATOR: char = ':';

/// Primary key of an entity inside its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    Int(i64),
    Text(String),
}

impl PrimaryKey {
    /// The record value this key is stored as.
    pub fn to_field_value(&self) -> FieldValue {
        match self {
            PrimaryKey::Int(v) => FieldValue::Int(*v),
            PrimaryKey::Text(v) => FieldValue::Text(v.clone()),
        }
    }
}

impl fmt::Display for PrimaryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrimaryKey::Int(v) => write!(f, "{}", v),
            PrimaryKey::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for PrimaryKey {
    fn from(v: i64) -> Self {
        PrimaryKey::Int(v)
    }
}

impl From<i32> for PrimaryKey {
    fn from(v: i32) -> Self {
        PrimaryKey::Int(i64::from(v))
    }
}

impl From<&str> for PrimaryKey {
    fn from(v: &str) -> Self {
        PrimaryKey::Text(v.to_string())
    }
}

impl From<String> for PrimaryKey {
    fn from(v: String) -> Self {
        PrimaryKey::Text(v)
    }
}

/// Identity of a domain object: the collection it lives in plus its
/// primary key. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityIdentity {
    collection: String,
    primary_key: PrimaryKey,
}

impl EntityIdentity {
    /// Creates an identity, rejecting names that cannot be normalized.
    ///
    /// The collection must be non-empty and must not contain the key
    /// separator; a text primary key must be non-empty.
    pub fn new(
        collection: impl Into<String>,
        primary_key: impl Into<PrimaryKey>,
    ) -> Result<Self, CoreError> {
        let collection = collection.into();
        let primary_key = primary_key.into();

        if collection.trim().is_empty() {
            return Err(CoreError::InvalidIdentity {
                reason: "collection name is empty".to_string(),
            });
        }
        if collection.contains(KEY_SEPARATOR) {
            return Err(CoreError::InvalidIdentity {
                reason: format!("collection '{}' contains '{}'", collection, KEY_SEPARATOR),
            });
        }
        if let PrimaryKey::Text(text) = &primary_key {
            if text.is_empty() {
                return Err(CoreError::InvalidIdentity {
                    reason: format!("empty primary key in collection '{}'", collection),
                });
            }
        }

        Ok(EntityIdentity {
            collection,
            primary_key,
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn primary_key(&self) -> &PrimaryKey {
        &self.primary_key
    }

    /// Normalizes this identity into its canonical storage key.
    pub fn storage_key(&self) -> StorageKey {
        StorageKey(
            format!("{}{}{}", self.collection, KEY_SEPARATOR, self.primary_key).to_lowercase(),
        )
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.collection, KEY_SEPARATOR, self.primary_key)
    }
}

/// Canonical, lower-cased `collection:pk` key.
///
/// Two identities that normalize to the same key are the same logical
/// entity; `users:1` built from `Int(1)` and from `Text("1")` collide on
/// purpose.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StorageKey(String);

impl StorageKey {
    /// Parses a rendered key back, re-applying normalization.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let (collection, pk) =
            raw.split_once(KEY_SEPARATOR)
                .ok_or_else(|| CoreError::InvalidIdentity {
                    reason: format!("'{}' has no '{}' separator", raw, KEY_SEPARATOR),
                })?;
        Ok(EntityIdentity::new(collection, pk)?.storage_key())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The collection half of the key.
    pub fn collection(&self) -> &str {
        self.0
            .split_once(KEY_SEPARATOR)
            .map(|(c, _)| c)
            .unwrap_or(&self.0)
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StorageKey {
    type Error = CoreError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        StorageKey::parse(&raw)
    }
}

impl From<StorageKey> for String {
    fn from(key: StorageKey) -> Self {
        key.0
    }
}

impl From<&EntityIdentity> for StorageKey {
    fn from(identity: &EntityIdentity) -> Self {
        identity.storage_key()
    }
}
