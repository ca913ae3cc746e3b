//! Caller-supplied log entries and their sequenced form.

use sha2::{Digest, Sha256};
use std::sync::Arc;

/// A function computing the RFC 6962 leaf hash of an entry's data.
pub type LeafHashFn = Arc<dyn Fn(&[u8]) -> [u8; 32] + Send + Sync>;

/// A function marshalling an entry's data into its bundle representation,
/// given the index it was assigned.
pub type MarshalFn = Arc<dyn Fn(u64, &[u8]) -> Vec<u8> + Send + Sync>;

/// RFC 6962 leaf hash: SHA-256(0x00 || data).
pub fn default_leaf_hash(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(data);
    hasher.finalize().into()
}

/// RFC 6962 interior node hash: SHA-256(0x01 || left || right).
pub fn hash_children(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Default bundle marshalling: a 4-byte big-endian length prefix followed by
/// the raw entry bytes. Callers with a richer entry format (e.g. a
/// certificate-transparency style TLS structure) can override this with
/// [`Entry::with_marshal_fn`].
pub fn default_marshal(_index: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}

/// Split a concatenation of [`default_marshal`]-encoded records (an entry
/// bundle's raw bytes) back into the original per-entry data slices, in
/// order. Used by the antispam follower to recover entry data from
/// already-integrated bundles without needing a separate source of truth.
pub fn default_unmarshal_stream(bytes: &[u8]) -> Result<Vec<Vec<u8>>, String> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        if offset + 4 > bytes.len() {
            return Err("truncated length prefix".to_string());
        }
        let len = u32::from_be_bytes(bytes[offset..offset + 4].try_into().unwrap()) as usize;
        offset += 4;
        if offset + len > bytes.len() {
            return Err("truncated entry data".to_string());
        }
        out.push(bytes[offset..offset + len].to_vec());
        offset += len;
    }
    Ok(out)
}

/// An entry submitted by a caller for inclusion in the log.
///
/// Entries carry their own leaf-hashing and marshalling functions so that
/// callers can layer an application-specific entry format (e.g. a
/// certificate, a signed statement) on top of the generic tile-backed log
/// without this crate needing to know about it.
#[derive(Clone)]
pub struct Entry {
    data: Vec<u8>,
    identity_hash: Option<[u8; 32]>,
    leaf_hash_fn: LeafHashFn,
    marshal_fn: MarshalFn,
}

impl Entry {
    /// Create a new entry from raw bytes, using the default RFC 6962 leaf
    /// hash and length-prefixed marshalling.
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            identity_hash: None,
            leaf_hash_fn: Arc::new(default_leaf_hash),
            marshal_fn: Arc::new(default_marshal),
        }
    }

    /// Attach an identity hash used by the antispam follower to deduplicate
    /// logically-equivalent submissions. Entries without one are never
    /// deduplicated.
    pub fn with_identity_hash(mut self, identity_hash: [u8; 32]) -> Self {
        self.identity_hash = Some(identity_hash);
        self
    }

    /// Override the leaf-hash function.
    pub fn with_leaf_hash_fn(mut self, f: LeafHashFn) -> Self {
        self.leaf_hash_fn = f;
        self
    }

    /// Override the bundle marshalling function.
    pub fn with_marshal_fn(mut self, f: MarshalFn) -> Self {
        self.marshal_fn = f;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn identity_hash(&self) -> Option<[u8; 32]> {
        self.identity_hash
    }

    /// The RFC 6962 leaf hash of this entry's data.
    pub fn leaf_hash(&self) -> [u8; 32] {
        (self.leaf_hash_fn)(&self.data)
    }

    /// Marshal this entry for storage at the given assigned index.
    pub fn marshal(&self, index: u64) -> Vec<u8> {
        (self.marshal_fn)(index, &self.data)
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("data_len", &self.data.len())
            .field("identity_hash", &self.identity_hash.map(hex::encode))
            .finish()
    }
}

/// An entry after it has been assigned an index by the sequencer, ready for
/// integration into the Merkle tree and persistence in an entry bundle.
#[derive(Clone, Debug)]
pub struct SequencedEntry {
    /// The marshalled bundle representation, as written to the entry bundle.
    pub bundle_data: Vec<u8>,
    /// The RFC 6962 leaf hash, as consumed by the integrator.
    pub leaf_hash: [u8; 32],
}

impl SequencedEntry {
    pub fn from_entry(entry: &Entry, index: u64) -> Self {
        Self {
            bundle_data: entry.marshal(index),
            leaf_hash: entry.leaf_hash(),
        }
    }
}
