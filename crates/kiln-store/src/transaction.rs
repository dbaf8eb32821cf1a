//! Transactions and their wire encoding
//!
//! A transaction is an ordered opcode stream against one or more
//! collection/object pairs, applied atomically with respect to ordering and
//! durability. The binary encoding here is what the journal persists; it is
//! explicit little-endian with length prefixes, in the same style as the
//! journal's own record framing.

use bytes::Bytes;
use kiln_common::{CollectionId, Error, ObjectId, Result};
use std::collections::{BTreeMap, BTreeSet};

const TXN_MAGIC: u32 = 0x4b4c_5458; // "KLTX"
const TXN_VERSION: u32 = 1;

/// Fadvise-style flag on writes: drop the range from cache after write-back.
pub const WRITE_FLAG_DONTNEED: u32 = 1;

/// One opcode of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOp {
    Nop,
    Touch { cid: CollectionId, oid: ObjectId },
    Write { cid: CollectionId, oid: ObjectId, offset: u64, data: Bytes, flags: u32 },
    Zero { cid: CollectionId, oid: ObjectId, offset: u64, len: u64 },
    /// Deprecated; decodes as a no-op.
    TrimCache,
    Truncate { cid: CollectionId, oid: ObjectId, size: u64 },
    Remove { cid: CollectionId, oid: ObjectId },
    SetAttr { cid: CollectionId, oid: ObjectId, name: String, value: Bytes },
    SetAttrs { cid: CollectionId, oid: ObjectId, attrs: BTreeMap<String, Bytes> },
    RmAttr { cid: CollectionId, oid: ObjectId, name: String },
    RmAttrs { cid: CollectionId, oid: ObjectId },
    Clone { cid: CollectionId, src: ObjectId, dst: ObjectId },
    CloneRange { cid: CollectionId, src: ObjectId, dst: ObjectId, offset: u64, len: u64 },
    CloneRange2 {
        cid: CollectionId,
        src: ObjectId,
        dst: ObjectId,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
    },
    MkColl { cid: CollectionId },
    RmColl { cid: CollectionId },
    /// Always immediately followed by a `CollRemove` of the same src/oid.
    CollAdd { cid: CollectionId, src_cid: CollectionId, oid: ObjectId },
    CollRemove { cid: CollectionId, oid: ObjectId },
    /// Deprecated; replays as add + remove.
    CollMove { cid: CollectionId, src_cid: CollectionId, oid: ObjectId },
    CollMoveRename {
        src_cid: CollectionId,
        src_oid: ObjectId,
        dst_cid: CollectionId,
        dst_oid: ObjectId,
    },
    CollSetAttr { cid: CollectionId, name: String, value: Bytes },
    CollRmAttr { cid: CollectionId, name: String },
    /// Deprecated and unsupported; applying it is an error.
    CollRename { cid: CollectionId },
    CollHint { cid: CollectionId, hint_type: u32, data: Bytes },
    StartSync,
    OmapClear { cid: CollectionId, oid: ObjectId },
    OmapSetKeys { cid: CollectionId, oid: ObjectId, kvs: BTreeMap<String, Bytes> },
    OmapRmKeys { cid: CollectionId, oid: ObjectId, keys: BTreeSet<String> },
    OmapRmKeyRange { cid: CollectionId, oid: ObjectId, first: String, last: String },
    OmapSetHeader { cid: CollectionId, oid: ObjectId, data: Bytes },
    /// Deprecated split that also creates the destination.
    SplitCollection { cid: CollectionId, bits: u32, rem: u32, dest: CollectionId },
    SplitCollection2 { cid: CollectionId, bits: u32, rem: u32, dest: CollectionId },
    SetAllocHint {
        cid: CollectionId,
        oid: ObjectId,
        expected_object_size: u64,
        expected_write_size: u64,
    },
    /// Replay-only: omap writes routed straight to the key/value store.
    PgMetaWrite { cid: CollectionId, oid: ObjectId, kvs: BTreeMap<String, Bytes> },
    /// Marker forcing journal-authoritative mode for the whole bundle.
    WriteAhead,
}

impl TxOp {
    const fn code(&self) -> u8 {
        match self {
            TxOp::Nop => 0,
            TxOp::Touch { .. } => 1,
            TxOp::Write { .. } => 2,
            TxOp::Zero { .. } => 3,
            TxOp::TrimCache => 4,
            TxOp::Truncate { .. } => 5,
            TxOp::Remove { .. } => 6,
            TxOp::SetAttr { .. } => 7,
            TxOp::SetAttrs { .. } => 8,
            TxOp::RmAttr { .. } => 9,
            TxOp::RmAttrs { .. } => 10,
            TxOp::Clone { .. } => 11,
            TxOp::CloneRange { .. } => 12,
            TxOp::CloneRange2 { .. } => 13,
            TxOp::MkColl { .. } => 14,
            TxOp::RmColl { .. } => 15,
            TxOp::CollAdd { .. } => 16,
            TxOp::CollRemove { .. } => 17,
            TxOp::CollMove { .. } => 18,
            TxOp::CollMoveRename { .. } => 19,
            TxOp::CollSetAttr { .. } => 20,
            TxOp::CollRmAttr { .. } => 21,
            TxOp::CollRename { .. } => 22,
            TxOp::CollHint { .. } => 23,
            TxOp::StartSync => 24,
            TxOp::OmapClear { .. } => 25,
            TxOp::OmapSetKeys { .. } => 26,
            TxOp::OmapRmKeys { .. } => 27,
            TxOp::OmapRmKeyRange { .. } => 28,
            TxOp::OmapSetHeader { .. } => 29,
            TxOp::SplitCollection { .. } => 30,
            TxOp::SplitCollection2 { .. } => 31,
            TxOp::SetAllocHint { .. } => 32,
            TxOp::PgMetaWrite { .. } => 33,
            TxOp::WriteAhead => 34,
        }
    }

    /// Short name for dumps and error reports.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            TxOp::Nop => "nop",
            TxOp::Touch { .. } => "touch",
            TxOp::Write { .. } => "write",
            TxOp::Zero { .. } => "zero",
            TxOp::TrimCache => "trimcache",
            TxOp::Truncate { .. } => "truncate",
            TxOp::Remove { .. } => "remove",
            TxOp::SetAttr { .. } => "setattr",
            TxOp::SetAttrs { .. } => "setattrs",
            TxOp::RmAttr { .. } => "rmattr",
            TxOp::RmAttrs { .. } => "rmattrs",
            TxOp::Clone { .. } => "clone",
            TxOp::CloneRange { .. } => "clone_range",
            TxOp::CloneRange2 { .. } => "clone_range2",
            TxOp::MkColl { .. } => "mkcoll",
            TxOp::RmColl { .. } => "rmcoll",
            TxOp::CollAdd { .. } => "coll_add",
            TxOp::CollRemove { .. } => "coll_remove",
            TxOp::CollMove { .. } => "coll_move",
            TxOp::CollMoveRename { .. } => "coll_move_rename",
            TxOp::CollSetAttr { .. } => "coll_setattr",
            TxOp::CollRmAttr { .. } => "coll_rmattr",
            TxOp::CollRename { .. } => "coll_rename",
            TxOp::CollHint { .. } => "coll_hint",
            TxOp::StartSync => "startsync",
            TxOp::OmapClear { .. } => "omap_clear",
            TxOp::OmapSetKeys { .. } => "omap_setkeys",
            TxOp::OmapRmKeys { .. } => "omap_rmkeys",
            TxOp::OmapRmKeyRange { .. } => "omap_rmkeyrange",
            TxOp::OmapSetHeader { .. } => "omap_setheader",
            TxOp::SplitCollection { .. } => "split_collection",
            TxOp::SplitCollection2 { .. } => "split_collection2",
            TxOp::SetAllocHint { .. } => "set_alloc_hint",
            TxOp::PgMetaWrite { .. } => "pgmeta_write",
            TxOp::WriteAhead => "write_ahead",
        }
    }

    /// Opcodes that mutate object byte ranges. A non-journal-authoritative op
    /// pauses after its first data opcode.
    #[must_use]
    pub fn is_data_op(&self) -> bool {
        matches!(self, TxOp::Write { .. } | TxOp::Zero { .. } | TxOp::Truncate { .. })
    }

    /// Payload bytes this opcode carries (for queue accounting).
    #[must_use]
    pub fn payload_bytes(&self) -> u64 {
        match self {
            TxOp::Write { data, .. } | TxOp::OmapSetHeader { data, .. } | TxOp::CollHint { data, .. } => {
                data.len() as u64
            }
            TxOp::SetAttr { value, .. } | TxOp::CollSetAttr { value, .. } => value.len() as u64,
            TxOp::SetAttrs { attrs, .. } => {
                attrs.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
            }
            TxOp::OmapSetKeys { kvs, .. } | TxOp::PgMetaWrite { kvs, .. } => {
                kvs.iter().map(|(k, v)| (k.len() + v.len()) as u64).sum()
            }
            _ => 0,
        }
    }
}

/// An ordered opcode bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transaction {
    ops: Vec<TxOp>,
}

impl Transaction {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ops(&self) -> &[TxOp] {
        &self.ops
    }

    #[must_use]
    pub fn num_ops(&self) -> u64 {
        self.ops.len() as u64
    }

    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.ops.iter().map(TxOp::payload_bytes).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn push(&mut self, op: TxOp) -> &mut Self {
        self.ops.push(op);
        self
    }

    pub fn nop(&mut self) -> &mut Self {
        self.push(TxOp::Nop)
    }

    pub fn touch(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(TxOp::Touch { cid: cid.clone(), oid: oid.clone() })
    }

    pub fn write(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        offset: u64,
        data: Bytes,
        flags: u32,
    ) -> &mut Self {
        self.push(TxOp::Write { cid: cid.clone(), oid: oid.clone(), offset, data, flags })
    }

    pub fn zero(&mut self, cid: &CollectionId, oid: &ObjectId, offset: u64, len: u64) -> &mut Self {
        self.push(TxOp::Zero { cid: cid.clone(), oid: oid.clone(), offset, len })
    }

    pub fn truncate(&mut self, cid: &CollectionId, oid: &ObjectId, size: u64) -> &mut Self {
        self.push(TxOp::Truncate { cid: cid.clone(), oid: oid.clone(), size })
    }

    pub fn remove(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(TxOp::Remove { cid: cid.clone(), oid: oid.clone() })
    }

    pub fn setattr(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        name: &str,
        value: Bytes,
    ) -> &mut Self {
        self.push(TxOp::SetAttr {
            cid: cid.clone(),
            oid: oid.clone(),
            name: name.to_string(),
            value,
        })
    }

    pub fn setattrs(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        attrs: BTreeMap<String, Bytes>,
    ) -> &mut Self {
        self.push(TxOp::SetAttrs { cid: cid.clone(), oid: oid.clone(), attrs })
    }

    pub fn rmattr(&mut self, cid: &CollectionId, oid: &ObjectId, name: &str) -> &mut Self {
        self.push(TxOp::RmAttr { cid: cid.clone(), oid: oid.clone(), name: name.to_string() })
    }

    pub fn rmattrs(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(TxOp::RmAttrs { cid: cid.clone(), oid: oid.clone() })
    }

    pub fn clone_object(
        &mut self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
    ) -> &mut Self {
        self.push(TxOp::Clone { cid: cid.clone(), src: src.clone(), dst: dst.clone() })
    }

    pub fn clone_range(
        &mut self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        offset: u64,
        len: u64,
    ) -> &mut Self {
        self.push(TxOp::CloneRange {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
            offset,
            len,
        })
    }

    pub fn clone_range2(
        &mut self,
        cid: &CollectionId,
        src: &ObjectId,
        dst: &ObjectId,
        src_offset: u64,
        len: u64,
        dst_offset: u64,
    ) -> &mut Self {
        self.push(TxOp::CloneRange2 {
            cid: cid.clone(),
            src: src.clone(),
            dst: dst.clone(),
            src_offset,
            len,
            dst_offset,
        })
    }

    pub fn create_collection(&mut self, cid: &CollectionId) -> &mut Self {
        self.push(TxOp::MkColl { cid: cid.clone() })
    }

    pub fn remove_collection(&mut self, cid: &CollectionId) -> &mut Self {
        self.push(TxOp::RmColl { cid: cid.clone() })
    }

    /// Move an object between collections: a `CollAdd` immediately followed
    /// by its paired `CollRemove`.
    pub fn collection_add(
        &mut self,
        cid: &CollectionId,
        src_cid: &CollectionId,
        oid: &ObjectId,
    ) -> &mut Self {
        self.push(TxOp::CollAdd {
            cid: cid.clone(),
            src_cid: src_cid.clone(),
            oid: oid.clone(),
        });
        self.push(TxOp::CollRemove { cid: src_cid.clone(), oid: oid.clone() })
    }

    pub fn collection_move_rename(
        &mut self,
        src_cid: &CollectionId,
        src_oid: &ObjectId,
        dst_cid: &CollectionId,
        dst_oid: &ObjectId,
    ) -> &mut Self {
        self.push(TxOp::CollMoveRename {
            src_cid: src_cid.clone(),
            src_oid: src_oid.clone(),
            dst_cid: dst_cid.clone(),
            dst_oid: dst_oid.clone(),
        })
    }

    pub fn collection_setattr(
        &mut self,
        cid: &CollectionId,
        name: &str,
        value: Bytes,
    ) -> &mut Self {
        self.push(TxOp::CollSetAttr { cid: cid.clone(), name: name.to_string(), value })
    }

    pub fn collection_rmattr(&mut self, cid: &CollectionId, name: &str) -> &mut Self {
        self.push(TxOp::CollRmAttr { cid: cid.clone(), name: name.to_string() })
    }

    pub fn collection_hint(
        &mut self,
        cid: &CollectionId,
        hint_type: u32,
        data: Bytes,
    ) -> &mut Self {
        self.push(TxOp::CollHint { cid: cid.clone(), hint_type, data })
    }

    pub fn split_collection(
        &mut self,
        cid: &CollectionId,
        bits: u32,
        rem: u32,
        dest: &CollectionId,
    ) -> &mut Self {
        self.push(TxOp::SplitCollection2 { cid: cid.clone(), bits, rem, dest: dest.clone() })
    }

    pub fn set_alloc_hint(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        expected_object_size: u64,
        expected_write_size: u64,
    ) -> &mut Self {
        self.push(TxOp::SetAllocHint {
            cid: cid.clone(),
            oid: oid.clone(),
            expected_object_size,
            expected_write_size,
        })
    }

    pub fn omap_clear(&mut self, cid: &CollectionId, oid: &ObjectId) -> &mut Self {
        self.push(TxOp::OmapClear { cid: cid.clone(), oid: oid.clone() })
    }

    pub fn omap_setkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        kvs: BTreeMap<String, Bytes>,
    ) -> &mut Self {
        self.push(TxOp::OmapSetKeys { cid: cid.clone(), oid: oid.clone(), kvs })
    }

    pub fn omap_rmkeys(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        keys: BTreeSet<String>,
    ) -> &mut Self {
        self.push(TxOp::OmapRmKeys { cid: cid.clone(), oid: oid.clone(), keys })
    }

    pub fn omap_rmkeyrange(
        &mut self,
        cid: &CollectionId,
        oid: &ObjectId,
        first: &str,
        last: &str,
    ) -> &mut Self {
        self.push(TxOp::OmapRmKeyRange {
            cid: cid.clone(),
            oid: oid.clone(),
            first: first.to_string(),
            last: last.to_string(),
        })
    }

    pub fn omap_setheader(&mut self, cid: &CollectionId, oid: &ObjectId, data: Bytes) -> &mut Self {
        self.push(TxOp::OmapSetHeader { cid: cid.clone(), oid: oid.clone(), data })
    }

    pub fn start_sync(&mut self) -> &mut Self {
        self.push(TxOp::StartSync)
    }

    pub fn write_ahead_marker(&mut self) -> &mut Self {
        self.push(TxOp::WriteAhead)
    }

    /// Encode to the journal wire form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_u32(&mut buf, TXN_MAGIC);
        put_u32(&mut buf, TXN_VERSION);
        put_u32(&mut buf, self.ops.len() as u32);
        for op in &self.ops {
            encode_op(&mut buf, op);
        }
        buf
    }

    /// Decode from the journal wire form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cur = Cursor { data, pos: 0 };
        if cur.u32()? != TXN_MAGIC {
            return Err(Error::Corrupt("bad transaction magic".into()));
        }
        let version = cur.u32()?;
        if version != TXN_VERSION {
            return Err(Error::Incompatible(format!("transaction version {version}")));
        }
        let count = cur.u32()? as usize;
        let mut ops = Vec::with_capacity(count);
        for _ in 0..count {
            ops.push(decode_op(&mut cur)?);
        }
        Ok(Self { ops })
    }

    /// JSON rendering for the dump file and fatal-error reports. Data
    /// payloads are elided to their lengths.
    #[must_use]
    pub fn dump_json(&self) -> serde_json::Value {
        let ops: Vec<serde_json::Value> = self
            .ops
            .iter()
            .map(|op| {
                let mut entry = serde_json::Map::new();
                entry.insert("op".into(), op.name().into());
                match op {
                    TxOp::Write { cid, oid, offset, data, .. } => {
                        entry.insert("cid".into(), cid.to_string().into());
                        entry.insert("oid".into(), oid.to_string().into());
                        entry.insert("offset".into(), (*offset).into());
                        entry.insert("len".into(), data.len().into());
                    }
                    TxOp::Touch { cid, oid }
                    | TxOp::Remove { cid, oid }
                    | TxOp::RmAttrs { cid, oid }
                    | TxOp::OmapClear { cid, oid } => {
                        entry.insert("cid".into(), cid.to_string().into());
                        entry.insert("oid".into(), oid.to_string().into());
                    }
                    TxOp::CollMoveRename { src_cid, src_oid, dst_cid, dst_oid } => {
                        entry.insert("src".into(), format!("{src_cid}/{src_oid}").into());
                        entry.insert("dst".into(), format!("{dst_cid}/{dst_oid}").into());
                    }
                    _ => {}
                }
                serde_json::Value::Object(entry)
            })
            .collect();
        serde_json::json!({ "ops": ops })
    }
}

/// Decide journal mode for an op bundle: false only when the opcode stream is
/// exactly the data-first pattern `WRITE SETATTRS [OMAP_RMKEYS] OMAP_SETKEYS`
/// (truncated prefixes allowed) with no `WRITE_AHEAD` marker anywhere.
#[must_use]
pub fn classify_wal(txns: &[Transaction]) -> bool {
    let mut stage = 0usize;
    for (i, op) in txns.iter().flat_map(|t| t.ops()).enumerate() {
        if matches!(op, TxOp::WriteAhead) {
            return true;
        }
        if i == 2 && matches!(op, TxOp::OmapRmKeys { .. }) {
            continue;
        }
        let expected = match stage {
            0 => matches!(op, TxOp::Write { .. }),
            1 => matches!(op, TxOp::SetAttrs { .. }),
            2 => matches!(op, TxOp::OmapSetKeys { .. }),
            _ => false,
        };
        if !expected {
            return true;
        }
        stage += 1;
    }
    false
}

/// Journal payload for an op's transaction list.
#[must_use]
pub fn encode_txn_list(txns: &[Transaction]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, txns.len() as u32);
    for t in txns {
        let body = t.to_bytes();
        put_u32(&mut buf, body.len() as u32);
        buf.extend_from_slice(&body);
    }
    buf
}

pub fn decode_txn_list(data: &[u8]) -> Result<Vec<Transaction>> {
    let mut cur = Cursor { data, pos: 0 };
    let count = cur.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let len = cur.u32()? as usize;
        let body = cur.take(len)?;
        out.push(Transaction::from_bytes(body)?);
    }
    Ok(out)
}

/// Journal payload for a batch of applied-op acknowledgements.
#[must_use]
pub fn encode_ack_batch(seqs: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    put_u32(&mut buf, seqs.len() as u32);
    for s in seqs {
        put_u64(&mut buf, *s);
    }
    buf
}

pub fn decode_ack_batch(data: &[u8]) -> Result<Vec<u64>> {
    let mut cur = Cursor { data, pos: 0 };
    let count = cur.u32()? as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        out.push(cur.u64()?);
    }
    Ok(out)
}

// ---- codec internals ----

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Corrupt("transaction truncated".into()));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Corrupt("non-utf8 string".into()))
    }

    fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        Ok(Bytes::copy_from_slice(self.take(len)?))
    }

    fn cid(&mut self) -> Result<CollectionId> {
        Ok(CollectionId::new(self.string()?))
    }

    fn oid(&mut self) -> Result<ObjectId> {
        let name = self.string()?;
        let shard = self.u8()? as i8;
        let generation = self.u64()?;
        let pgmeta = self.u8()? != 0;
        Ok(ObjectId::from_parts(name, shard, generation, pgmeta))
    }

    fn map(&mut self) -> Result<BTreeMap<String, Bytes>> {
        let count = self.u32()? as usize;
        let mut out = BTreeMap::new();
        for _ in 0..count {
            let k = self.string()?;
            let v = self.bytes()?;
            out.insert(k, v);
        }
        Ok(out)
    }

    fn keyset(&mut self) -> Result<BTreeSet<String>> {
        let count = self.u32()? as usize;
        let mut out = BTreeSet::new();
        for _ in 0..count {
            out.insert(self.string()?);
        }
        Ok(out)
    }
}

fn put_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn put_string(buf: &mut Vec<u8>, s: &str) {
    put_u32(buf, s.len() as u32);
    buf.extend_from_slice(s.as_bytes());
}

fn put_bytes(buf: &mut Vec<u8>, b: &[u8]) {
    put_u32(buf, b.len() as u32);
    buf.extend_from_slice(b);
}

fn put_cid(buf: &mut Vec<u8>, cid: &CollectionId) {
    put_string(buf, cid.as_str());
}

fn put_oid(buf: &mut Vec<u8>, oid: &ObjectId) {
    put_string(buf, oid.name());
    put_u8(buf, oid.shard() as u8);
    put_u64(buf, oid.generation());
    put_u8(buf, u8::from(oid.is_pgmeta()));
}

fn put_map(buf: &mut Vec<u8>, map: &BTreeMap<String, Bytes>) {
    put_u32(buf, map.len() as u32);
    for (k, v) in map {
        put_string(buf, k);
        put_bytes(buf, v);
    }
}

fn put_keyset(buf: &mut Vec<u8>, set: &BTreeSet<String>) {
    put_u32(buf, set.len() as u32);
    for k in set {
        put_string(buf, k);
    }
}

fn encode_op(buf: &mut Vec<u8>, op: &TxOp) {
    put_u8(buf, op.code());
    match op {
        TxOp::Nop | TxOp::TrimCache | TxOp::StartSync | TxOp::WriteAhead => {}
        TxOp::Touch { cid, oid }
        | TxOp::Remove { cid, oid }
        | TxOp::RmAttrs { cid, oid }
        | TxOp::OmapClear { cid, oid }
        | TxOp::CollRemove { cid, oid } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
        }
        TxOp::Write { cid, oid, offset, data, flags } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_u64(buf, *offset);
            put_u32(buf, *flags);
            put_bytes(buf, data);
        }
        TxOp::Zero { cid, oid, offset, len } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_u64(buf, *offset);
            put_u64(buf, *len);
        }
        TxOp::Truncate { cid, oid, size } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_u64(buf, *size);
        }
        TxOp::SetAttr { cid, oid, name, value } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_string(buf, name);
            put_bytes(buf, value);
        }
        TxOp::SetAttrs { cid, oid, attrs } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_map(buf, attrs);
        }
        TxOp::RmAttr { cid, oid, name } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_string(buf, name);
        }
        TxOp::Clone { cid, src, dst } => {
            put_cid(buf, cid);
            put_oid(buf, src);
            put_oid(buf, dst);
        }
        TxOp::CloneRange { cid, src, dst, offset, len } => {
            put_cid(buf, cid);
            put_oid(buf, src);
            put_oid(buf, dst);
            put_u64(buf, *offset);
            put_u64(buf, *len);
        }
        TxOp::CloneRange2 { cid, src, dst, src_offset, len, dst_offset } => {
            put_cid(buf, cid);
            put_oid(buf, src);
            put_oid(buf, dst);
            put_u64(buf, *src_offset);
            put_u64(buf, *len);
            put_u64(buf, *dst_offset);
        }
        TxOp::MkColl { cid } | TxOp::RmColl { cid } | TxOp::CollRename { cid } => {
            put_cid(buf, cid);
        }
        TxOp::CollAdd { cid, src_cid, oid } | TxOp::CollMove { cid, src_cid, oid } => {
            put_cid(buf, cid);
            put_cid(buf, src_cid);
            put_oid(buf, oid);
        }
        TxOp::CollMoveRename { src_cid, src_oid, dst_cid, dst_oid } => {
            put_cid(buf, src_cid);
            put_oid(buf, src_oid);
            put_cid(buf, dst_cid);
            put_oid(buf, dst_oid);
        }
        TxOp::CollSetAttr { cid, name, value } => {
            put_cid(buf, cid);
            put_string(buf, name);
            put_bytes(buf, value);
        }
        TxOp::CollRmAttr { cid, name } => {
            put_cid(buf, cid);
            put_string(buf, name);
        }
        TxOp::CollHint { cid, hint_type, data } => {
            put_cid(buf, cid);
            put_u32(buf, *hint_type);
            put_bytes(buf, data);
        }
        TxOp::OmapSetKeys { cid, oid, kvs } | TxOp::PgMetaWrite { cid, oid, kvs } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_map(buf, kvs);
        }
        TxOp::OmapRmKeys { cid, oid, keys } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_keyset(buf, keys);
        }
        TxOp::OmapRmKeyRange { cid, oid, first, last } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_string(buf, first);
            put_string(buf, last);
        }
        TxOp::OmapSetHeader { cid, oid, data } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_bytes(buf, data);
        }
        TxOp::SplitCollection { cid, bits, rem, dest }
        | TxOp::SplitCollection2 { cid, bits, rem, dest } => {
            put_cid(buf, cid);
            put_u32(buf, *bits);
            put_u32(buf, *rem);
            put_cid(buf, dest);
        }
        TxOp::SetAllocHint { cid, oid, expected_object_size, expected_write_size } => {
            put_cid(buf, cid);
            put_oid(buf, oid);
            put_u64(buf, *expected_object_size);
            put_u64(buf, *expected_write_size);
        }
    }
}

fn decode_op(cur: &mut Cursor<'_>) -> Result<TxOp> {
    let code = cur.u8()?;
    let op = match code {
        0 => TxOp::Nop,
        1 => TxOp::Touch { cid: cur.cid()?, oid: cur.oid()? },
        2 => {
            let cid = cur.cid()?;
            let oid = cur.oid()?;
            let offset = cur.u64()?;
            let flags = cur.u32()?;
            let data = cur.bytes()?;
            TxOp::Write { cid, oid, offset, data, flags }
        }
        3 => TxOp::Zero { cid: cur.cid()?, oid: cur.oid()?, offset: cur.u64()?, len: cur.u64()? },
        4 => TxOp::TrimCache,
        5 => TxOp::Truncate { cid: cur.cid()?, oid: cur.oid()?, size: cur.u64()? },
        6 => TxOp::Remove { cid: cur.cid()?, oid: cur.oid()? },
        7 => TxOp::SetAttr {
            cid: cur.cid()?,
            oid: cur.oid()?,
            name: cur.string()?,
            value: cur.bytes()?,
        },
        8 => TxOp::SetAttrs { cid: cur.cid()?, oid: cur.oid()?, attrs: cur.map()? },
        9 => TxOp::RmAttr { cid: cur.cid()?, oid: cur.oid()?, name: cur.string()? },
        10 => TxOp::RmAttrs { cid: cur.cid()?, oid: cur.oid()? },
        11 => TxOp::Clone { cid: cur.cid()?, src: cur.oid()?, dst: cur.oid()? },
        12 => TxOp::CloneRange {
            cid: cur.cid()?,
            src: cur.oid()?,
            dst: cur.oid()?,
            offset: cur.u64()?,
            len: cur.u64()?,
        },
        13 => TxOp::CloneRange2 {
            cid: cur.cid()?,
            src: cur.oid()?,
            dst: cur.oid()?,
            src_offset: cur.u64()?,
            len: cur.u64()?,
            dst_offset: cur.u64()?,
        },
        14 => TxOp::MkColl { cid: cur.cid()? },
        15 => TxOp::RmColl { cid: cur.cid()? },
        16 => TxOp::CollAdd { cid: cur.cid()?, src_cid: cur.cid()?, oid: cur.oid()? },
        17 => TxOp::CollRemove { cid: cur.cid()?, oid: cur.oid()? },
        18 => TxOp::CollMove { cid: cur.cid()?, src_cid: cur.cid()?, oid: cur.oid()? },
        19 => TxOp::CollMoveRename {
            src_cid: cur.cid()?,
            src_oid: cur.oid()?,
            dst_cid: cur.cid()?,
            dst_oid: cur.oid()?,
        },
        20 => TxOp::CollSetAttr { cid: cur.cid()?, name: cur.string()?, value: cur.bytes()? },
        21 => TxOp::CollRmAttr { cid: cur.cid()?, name: cur.string()? },
        22 => TxOp::CollRename { cid: cur.cid()? },
        23 => TxOp::CollHint { cid: cur.cid()?, hint_type: cur.u32()?, data: cur.bytes()? },
        24 => TxOp::StartSync,
        25 => TxOp::OmapClear { cid: cur.cid()?, oid: cur.oid()? },
        26 => TxOp::OmapSetKeys { cid: cur.cid()?, oid: cur.oid()?, kvs: cur.map()? },
        27 => TxOp::OmapRmKeys { cid: cur.cid()?, oid: cur.oid()?, keys: cur.keyset()? },
        28 => TxOp::OmapRmKeyRange {
            cid: cur.cid()?,
            oid: cur.oid()?,
            first: cur.string()?,
            last: cur.string()?,
        },
        29 => TxOp::OmapSetHeader { cid: cur.cid()?, oid: cur.oid()?, data: cur.bytes()? },
        30 => TxOp::SplitCollection {
            cid: cur.cid()?,
            bits: cur.u32()?,
            rem: cur.u32()?,
            dest: cur.cid()?,
        },
        31 => TxOp::SplitCollection2 {
            cid: cur.cid()?,
            bits: cur.u32()?,
            rem: cur.u32()?,
            dest: cur.cid()?,
        },
        32 => TxOp::SetAllocHint {
            cid: cur.cid()?,
            oid: cur.oid()?,
            expected_object_size: cur.u64()?,
            expected_write_size: cur.u64()?,
        },
        33 => TxOp::PgMetaWrite { cid: cur.cid()?, oid: cur.oid()?, kvs: cur.map()? },
        34 => TxOp::WriteAhead,
        other => return Err(Error::Corrupt(format!("unknown opcode {other}"))),
    };
    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(name: &str) -> ObjectId {
        ObjectId::new(name, 0, 0)
    }

    fn sample_transaction() -> Transaction {
        let cid = CollectionId::new("c1");
        let mut t = Transaction::new();
        t.touch(&cid, &oid("a"))
            .write(&cid, &oid("a"), 128, Bytes::from_static(b"payload"), 0)
            .zero(&cid, &oid("a"), 4096, 512)
            .setattr(&cid, &oid("a"), "k", Bytes::from_static(b"v"))
            .setattrs(
                &cid,
                &oid("a"),
                [("x".to_string(), Bytes::from_static(b"1"))].into(),
            )
            .clone_range2(&cid, &oid("a"), &oid("b"), 0, 100, 50)
            .collection_add(&CollectionId::new("c2"), &cid, &oid("a"))
            .collection_move_rename(&cid, &oid("a"), &CollectionId::new("c2"), &oid("a2"))
            .omap_setkeys(&cid, &oid("a"), [("ok".to_string(), Bytes::from_static(b"ov"))].into())
            .omap_rmkeyrange(&cid, &oid("a"), "a", "z")
            .split_collection(&cid, 2, 1, &CollectionId::new("c3"))
            .set_alloc_hint(&cid, &oid("a"), 1 << 20, 4096);
        t
    }

    #[test]
    fn test_codec_roundtrip() {
        let t = sample_transaction();
        let decoded = Transaction::from_bytes(&t.to_bytes()).unwrap();
        assert_eq!(decoded, t);
    }

    #[test]
    fn test_txn_list_roundtrip() {
        let a = sample_transaction();
        let mut b = Transaction::new();
        b.nop();
        let decoded = decode_txn_list(&encode_txn_list(&[a.clone(), b.clone()])).unwrap();
        assert_eq!(decoded, vec![a, b]);
    }

    #[test]
    fn test_ack_batch_roundtrip() {
        let seqs = vec![3u64, 5, 8];
        assert_eq!(decode_ack_batch(&encode_ack_batch(&seqs)).unwrap(), seqs);
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let bytes = sample_transaction().to_bytes();
        assert!(Transaction::from_bytes(&bytes[..bytes.len() - 3]).is_err());
        assert!(Transaction::from_bytes(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_counters() {
        let cid = CollectionId::new("c");
        let mut t = Transaction::new();
        t.write(&cid, &oid("a"), 0, Bytes::from_static(b"12345678"), 0);
        t.touch(&cid, &oid("b"));
        assert_eq!(t.num_ops(), 2);
        assert_eq!(t.num_bytes(), 8);
    }

    #[test]
    fn test_classify_wal_whitelisted_pattern() {
        let cid = CollectionId::new("c");
        let o = oid("a");
        let mut t = Transaction::new();
        t.write(&cid, &o, 0, Bytes::from_static(b"d"), 0)
            .setattrs(&cid, &o, [("k".to_string(), Bytes::from_static(b"v"))].into())
            .omap_setkeys(&cid, &o, [("m".to_string(), Bytes::from_static(b"n"))].into());
        assert!(!classify_wal(std::slice::from_ref(&t)));

        // the optional rmkeys slot between setattrs and omap_setkeys
        let mut t2 = Transaction::new();
        t2.write(&cid, &o, 0, Bytes::from_static(b"d"), 0)
            .setattrs(&cid, &o, BTreeMap::new())
            .omap_rmkeys(&cid, &o, ["gone".to_string()].into())
            .omap_setkeys(&cid, &o, BTreeMap::new());
        assert!(!classify_wal(std::slice::from_ref(&t2)));

        // prefix of the pattern still qualifies
        let mut t3 = Transaction::new();
        t3.write(&cid, &o, 0, Bytes::from_static(b"d"), 0);
        assert!(!classify_wal(std::slice::from_ref(&t3)));
    }

    #[test]
    fn test_classify_wal_everything_else() {
        let cid = CollectionId::new("c");
        let o = oid("a");

        let mut touch_first = Transaction::new();
        touch_first.touch(&cid, &o);
        assert!(classify_wal(std::slice::from_ref(&touch_first)));

        let mut marker = Transaction::new();
        marker
            .write_ahead_marker()
            .write(&cid, &o, 0, Bytes::from_static(b"d"), 0);
        assert!(classify_wal(std::slice::from_ref(&marker)));

        let mut too_long = Transaction::new();
        too_long
            .write(&cid, &o, 0, Bytes::from_static(b"d"), 0)
            .setattrs(&cid, &o, BTreeMap::new())
            .omap_setkeys(&cid, &o, BTreeMap::new())
            .touch(&cid, &o);
        assert!(classify_wal(std::slice::from_ref(&too_long)));
    }

    #[test]
    fn test_dump_json_shape() {
        let t = sample_transaction();
        let v = t.dump_json();
        let ops = v["ops"].as_array().unwrap();
        assert_eq!(ops.len() as u64, t.num_ops());
        assert_eq!(ops[1]["op"], "write");
        assert_eq!(ops[1]["len"], 7);
    }
}
