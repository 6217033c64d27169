//! Keyed, iterated entity digests.
//!
//! The digest input is the entity's declared checksum fields, in declared
//! order, each rendered with [`FieldValue::canonical`] and joined by a unit
//! separator. Runtime fields are never part of the input, so a cached
//! projection and the authoritative row hash identically.
//!
//! # Construction
//!
//! Round 1 is `blake3::keyed_hash(key, input)`. Every further round hashes
//! the previous digest followed by the input again under the same key.
//!
//! Comparison against a stored digest is constant-time.

use std::fmt;

use subtle::ConstantTimeEq;

use keystone_core::{Entity, FieldValue, Record};

use crate::error::IntegrityFault;

/// Rounds used when the caller does not configure one.
pub const DEFAULT_ITERATIONS: u32 = 8;

/// blake3 `derive_key` context for turning a secret into a hashing key.
const KEY_CONTEXT: &str = "keystone 2024-05 entity checksum key";

const FIELD_DELIMITER: char = '\u{1f}';

/// A 32-byte entity digest, rendered as lowercase hex in records.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChecksumDigest([u8; 32]);

impl ChecksumDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        blake3::Hash::from_hex(hex)
            .ok()
            .map(|hash| ChecksumDigest(*hash.as_bytes()))
    }
}

impl fmt::Display for ChecksumDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ChecksumDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChecksumDigest({})", self.to_hex())
    }
}

/// Computes and verifies entity digests under one secret key.
#[derive(Clone)]
pub struct Checksummer {
    key: [u8; 32],
    iterations: u32,
}

impl fmt::Debug for Checksummer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Checksummer")
            .field("key", &"<redacted>")
            .field("iterations", &self.iterations)
            .finish()
    }
}

impl Checksummer {
    pub fn new(key: [u8; 32], iterations: u32) -> Result<Self, IntegrityFault> {
        if iterations == 0 {
            return Err(IntegrityFault::InvalidIterations(iterations));
        }
        Ok(Checksummer { key, iterations })
    }

    /// Derives the hashing key from an arbitrary-length secret.
    pub fn from_secret(secret: &[u8], iterations: u32) -> Result<Self, IntegrityFault> {
        Self::new(blake3::derive_key(KEY_CONTEXT, secret), iterations)
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    /// Digests `fields` of `record` in the given order. Absent fields hash
    /// as null.
    pub fn digest_record(&self, fields: &[&str], record: &Record) -> ChecksumDigest {
        let mut input = String::new();
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                input.push(FIELD_DELIMITER);
            }
            match record.get(*field) {
                Some(value) => input.push_str(&value.canonical()),
                None => input.push_str(&FieldValue::Null.canonical()),
            }
        }
        let input = input.as_bytes();

        let mut hash = blake3::keyed_hash(&self.key, input);
        for _ in 1..self.iterations {
            let mut hasher = blake3::Hasher::new_keyed(&self.key);
            hasher.update(hash.as_bytes());
            hasher.update(input);
            hash = hasher.finalize();
        }
        ChecksumDigest(*hash.as_bytes())
    }

    pub fn calculate<E: Entity>(&self, entity: &E) -> ChecksumDigest {
        self.digest_record(E::checksum_fields(), &entity.to_record())
    }

    /// Computes the digest and stores it on the entity.
    pub fn stamp<E: Entity>(&self, entity: &mut E) {
        let digest = self.calculate(entity);
        entity.set_checksum(digest.to_hex());
    }

    /// Whether the entity's stored digest matches its fields.
    ///
    /// Entities that are not checksum-aware always verify. A checksum-aware
    /// entity without a stored digest does not.
    pub fn verify<E: Entity>(&self, entity: &E) -> bool {
        if !E::is_checksum_aware() {
            return true;
        }
        match entity.stored_checksum() {
            Some(stored) => self.matches(entity, stored),
            None => false,
        }
    }

    /// Like [`Checksummer::verify`], but reports why verification failed.
    pub fn validate<E: Entity>(&self, entity: &E) -> Result<(), IntegrityFault> {
        if !E::is_checksum_aware() {
            return Ok(());
        }
        let key = format!("{}:{}", E::COLLECTION, entity.primary_key()).to_lowercase();
        match entity.stored_checksum() {
            None => Err(IntegrityFault::MissingChecksum { key }),
            Some(stored) if self.matches(entity, stored) => Ok(()),
            Some(_) => Err(IntegrityFault::ChecksumMismatch { key }),
        }
    }

    fn matches<E: Entity>(&self, entity: &E, stored: &str) -> bool {
        let expected = self.calculate(entity).to_hex();
        expected.as_bytes().ct_eq(stored.as_bytes()).into()
    }
}
