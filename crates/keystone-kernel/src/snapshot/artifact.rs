//! Snapshot artifact encoding.
//!
//! ```text
//! offset  size  field
//! 0       8     magic "KSTNSNAP"
//! 8       2     format version, u16 LE
//! 10      8     created_at unix millis, i64 LE (not covered by the digest)
//! 18      8     body length, u64 LE
//! 26      32    blake3 digest of the body
//! 58      n     body: postcard-encoded ArtifactBody
//! ```
//!
//! Everything except `created_at` is a pure function of the persistent
//! tree, so two snapshots of the same state differ only in those 8 bytes.

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

pub const MAGIC: &[u8; 8] = b"KSTNSNAP";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 58;

const VERSION_AT: usize = 8;
const CREATED_AT: usize = 10;
const BODY_LEN_AT: usize = 18;
const DIGEST_AT: usize = 26;

/// Persistent state of one node and its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrozenNode {
    pub name: String,
    pub type_tag: String,
    /// postcard encoding of the node's persistent state.
    pub state: Vec<u8>,
    /// Names of the fields detached before encoding. Values are never
    /// written.
    pub transient_fields: Vec<String>,
    pub children: Vec<FrozenNode>,
}

impl FrozenNode {
    /// Depth-first search by name.
    pub fn find(&self, name: &str) -> Option<&FrozenNode> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactBody {
    pub environment: String,
    pub root: FrozenNode,
}

/// A decoded artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub created_at: i64,
    pub body: ArtifactBody,
}

pub fn encode(body: &ArtifactBody, created_at: i64) -> Result<Vec<u8>, SnapshotError> {
    let encoded = postcard::to_allocvec(body)?;
    let digest = blake3::hash(&encoded);

    let mut out = Vec::with_capacity(HEADER_LEN + encoded.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&created_at.to_le_bytes());
    out.extend_from_slice(&(encoded.len() as u64).to_le_bytes());
    out.extend_from_slice(digest.as_bytes());
    out.extend_from_slice(&encoded);
    Ok(out)
}

pub fn decode(bytes: &[u8]) -> Result<Artifact, SnapshotError> {
    if bytes.len() < MAGIC.len() || &bytes[..MAGIC.len()] != MAGIC {
        return Err(SnapshotError::UnsupportedFormat {
            reason: "missing magic bytes".to_string(),
        });
    }
    if bytes.len() < HEADER_LEN {
        return Err(corrupt(format!(
            "truncated header: {} of {} bytes",
            bytes.len(),
            HEADER_LEN
        )));
    }

    let version = u16::from_le_bytes(read_array(bytes, VERSION_AT)?);
    if version != FORMAT_VERSION {
        return Err(SnapshotError::UnsupportedFormat {
            reason: format!("format version {} (supported: {})", version, FORMAT_VERSION),
        });
    }

    let created_at = i64::from_le_bytes(read_array(bytes, CREATED_AT)?);
    let body_len = u64::from_le_bytes(read_array(bytes, BODY_LEN_AT)?);
    let digest: [u8; 32] = read_array(bytes, DIGEST_AT)?;

    let body = &bytes[HEADER_LEN..];
    if body.len() as u64 != body_len {
        return Err(corrupt(format!(
            "body length {} does not match header {}",
            body.len(),
            body_len
        )));
    }
    if blake3::hash(body) != blake3::Hash::from(digest) {
        return Err(corrupt("body digest mismatch".to_string()));
    }

    let body: ArtifactBody =
        postcard::from_bytes(body).map_err(|e| corrupt(format!("undecodable body: {}", e)))?;
    Ok(Artifact { created_at, body })
}

/// The artifact bytes with the volatile `created_at` field zeroed.
pub fn stable_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut out = bytes.to_vec();
    if out.len() >= BODY_LEN_AT {
        out[CREATED_AT..BODY_LEN_AT].fill(0);
    }
    out
}

fn read_array<const N: usize>(bytes: &[u8], at: usize) -> Result<[u8; N], SnapshotError> {
    bytes
        .get(at..at + N)
        .and_then(|slice| slice.try_into().ok())
        .ok_or_else(|| corrupt(format!("header field at {} out of range", at)))
}

fn corrupt(reason: String) -> SnapshotError {
    SnapshotError::Corrupt { reason }
}
