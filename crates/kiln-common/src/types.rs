//! Core type definitions for Kiln
//!
//! The identifier types here are deliberately small and by-value: object ids
//! are hashed to shard every cache in the store, and sequencer positions are
//! compared lexicographically to decide replay.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shard tag carried by an object id. `NO_SHARD` marks unsharded objects.
pub const NO_SHARD: i8 = -1;

/// Identifier for an object within a collection.
///
/// The triple {name, shard, generation} is unique within a collection. The
/// 32-bit hash is stable across restarts (FNV-1a of the name) and is the
/// value every sharded structure in the store keys on; it also drives
/// collection splits, which partition objects by hash bits.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId {
    name: String,
    shard: i8,
    generation: u64,
    hash: u32,
    pgmeta: bool,
}

impl ObjectId {
    /// Create a plain object id.
    #[must_use]
    pub fn new(name: impl Into<String>, shard: i8, generation: u64) -> Self {
        let name = name.into();
        let hash = fnv1a(name.as_bytes());
        Self { name, shard, generation, hash, pgmeta: false }
    }

    /// Create an id flagged for pgmeta key coalescing.
    #[must_use]
    pub fn pgmeta(name: impl Into<String>, shard: i8, generation: u64) -> Self {
        let mut oid = Self::new(name, shard, generation);
        oid.pgmeta = true;
        oid
    }

    /// Rebuild an id from its parsed parts (used by the directory index).
    #[must_use]
    pub fn from_parts(name: String, shard: i8, generation: u64, pgmeta: bool) -> Self {
        let hash = fnv1a(name.as_bytes());
        Self { name, shard, generation, hash, pgmeta }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn shard(&self) -> i8 {
        self.shard
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Stable 32-bit hash used to shard caches and split collections.
    #[must_use]
    pub fn hash(&self) -> u32 {
        self.hash
    }

    #[must_use]
    pub fn is_pgmeta(&self) -> bool {
        self.pgmeta
    }

    /// True when the low `bits` of the hash equal `rem` - the membership test
    /// used by collection splits.
    #[must_use]
    pub fn match_split(&self, bits: u32, rem: u32) -> bool {
        if bits >= 32 {
            return self.hash == rem;
        }
        self.hash & ((1u32 << bits) - 1) == rem
    }

    /// Stable byte encoding used as a key prefix in the object map.
    #[must_use]
    pub fn key_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.name.len() + 16);
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.push(self.shard as u8);
        out.extend_from_slice(&self.generation.to_le_bytes());
        out.push(u8::from(self.pgmeta));
        out
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{:x}", self.name, self.shard, self.generation)?;
        if self.pgmeta {
            write!(f, ":pgmeta")?;
        }
        Ok(())
    }
}

/// Identifier for a collection: an opaque name for a flat namespace of
/// objects, realized on disk as one directory under `current/`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionId(String);

impl CollectionId {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CollectionId({})", self.0)
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Position of one opcode inside the global submission order.
///
/// Ordered lexicographically by {op_seq, trans_num, op_num}; this is the value
/// replay guards persist and compare against during journal replay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct SeqPosition {
    pub op_seq: u64,
    pub trans_num: u32,
    pub op_num: u32,
}

impl SeqPosition {
    pub const ENCODED_LEN: usize = 16;

    #[must_use]
    pub fn new(op_seq: u64, trans_num: u32, op_num: u32) -> Self {
        Self { op_seq, trans_num, op_num }
    }

    /// Fixed 16-byte little-endian encoding.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[0..8].copy_from_slice(&self.op_seq.to_le_bytes());
        buf[8..12].copy_from_slice(&self.trans_num.to_le_bytes());
        buf[12..16].copy_from_slice(&self.op_num.to_le_bytes());
        buf
    }

    /// Decode from a buffer that begins with an encoded position.
    #[must_use]
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            op_seq: u64::from_le_bytes(data[0..8].try_into().unwrap()),
            trans_num: u32::from_le_bytes(data[8..12].try_into().unwrap()),
            op_num: u32::from_le_bytes(data[12..16].try_into().unwrap()),
        })
    }
}

impl fmt::Debug for SeqPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for SeqPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.op_seq, self.trans_num, self.op_num)
    }
}

/// FNV-1a, the stable hash behind `ObjectId::hash`.
fn fnv1a(data: &[u8]) -> u32 {
    let mut h: u32 = 0x811c_9dc5;
    for &b in data {
        h ^= u32::from(b);
        h = h.wrapping_mul(0x0100_0193);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hash_stable() {
        let a = ObjectId::new("obj.0001", 0, 0);
        let b = ObjectId::new("obj.0001", 3, 9);
        // hash depends only on the name
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a, b);
    }

    #[test]
    fn test_object_id_pgmeta_flag() {
        let o = ObjectId::pgmeta("meta", NO_SHARD, 0);
        assert!(o.is_pgmeta());
        assert!(!ObjectId::new("meta", NO_SHARD, 0).is_pgmeta());
    }

    #[test]
    fn test_match_split() {
        let o = ObjectId::new("x", 0, 0);
        let h = o.hash();
        assert!(o.match_split(4, h & 0xf));
        assert!(!o.match_split(4, (h & 0xf) ^ 1));
    }

    #[test]
    fn test_key_bytes_distinct() {
        let a = ObjectId::new("ab", 0, 0).key_bytes();
        let b = ObjectId::new("a", 0, 0).key_bytes();
        let c = ObjectId::pgmeta("ab", 0, 0).key_bytes();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_seq_position_order() {
        let a = SeqPosition::new(1, 0, 5);
        let b = SeqPosition::new(1, 1, 0);
        let c = SeqPosition::new(2, 0, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_seq_position_roundtrip() {
        let p = SeqPosition::new(0xdead_beef, 7, 42);
        let decoded = SeqPosition::from_bytes(&p.to_bytes()).unwrap();
        assert_eq!(p, decoded);
        assert!(SeqPosition::from_bytes(&[0u8; 3]).is_none());
    }
}
