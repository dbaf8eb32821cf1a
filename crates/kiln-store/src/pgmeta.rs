//! Pgmeta key coalescer
//!
//! Objects flagged pgmeta take a constant stream of tiny omap updates. To
//! keep that traffic off the key/value store, updates accumulate in
//! per-object pending maps, sharded by object hash, and reach the store in
//! batches: when a shard outgrows its byte budget, when the commit engine
//! flushes shards, or when an operation needs the store view of one object
//! to be current.

use crate::omap::OmapStore;
use bytes::Bytes;
use kiln_common::config::PgMetaConfig;
use kiln_common::{ObjectId, Result, SeqPosition};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
struct PendingObject {
    sets: BTreeMap<String, Bytes>,
    removes: BTreeSet<String>,
    spos: Option<SeqPosition>,
    bytes: usize,
}

impl PendingObject {
    fn is_empty(&self) -> bool {
        self.sets.is_empty() && self.removes.is_empty()
    }
}

#[derive(Default)]
struct Shard {
    objects: HashMap<ObjectId, PendingObject>,
    bytes: usize,
}

/// Coalescing cache of small omap updates for pgmeta objects.
pub struct PgMetaCache {
    shards: Vec<Mutex<Shard>>,
    shard_bytes: usize,
    omap: Arc<OmapStore>,
}

impl PgMetaCache {
    #[must_use]
    pub fn new(config: &PgMetaConfig, omap: Arc<OmapStore>) -> Self {
        Self {
            shards: (0..config.shards.max(1)).map(|_| Mutex::new(Shard::default())).collect(),
            shard_bytes: config.shard_bytes,
            omap,
        }
    }

    #[must_use]
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, oid: &ObjectId) -> usize {
        oid.hash() as usize % self.shards.len()
    }

    /// Stage key updates. When the shard outgrows its byte budget the whole
    /// shard is flushed to the store; returns true when that happened so the
    /// caller can charge its counter.
    pub fn set_keys(
        &self,
        oid: &ObjectId,
        kvs: &BTreeMap<String, Bytes>,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        let idx = self.shard_index(oid);
        let mut shard = self.shards[idx].lock();
        let pending = shard.objects.entry(oid.clone()).or_default();
        let mut added = 0usize;
        for (k, v) in kvs {
            pending.removes.remove(k);
            if let Some(old) = pending.sets.insert(k.clone(), v.clone()) {
                added += v.len().saturating_sub(old.len());
            } else {
                added += k.len() + v.len();
            }
        }
        pending.bytes += added;
        if let Some(spos) = spos {
            pending.spos = Some(*spos);
        }
        shard.bytes += added;

        if shard.bytes > self.shard_bytes {
            debug!("pgmeta shard {idx} over budget ({} bytes), flushing", shard.bytes);
            self.flush_locked(&mut shard)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Stage key removals, suppressing any pending sets of the same keys.
    pub fn erase_keys(&self, oid: &ObjectId, keys: &BTreeSet<String>, spos: Option<&SeqPosition>) {
        let idx = self.shard_index(oid);
        let mut shard = self.shards[idx].lock();
        let pending = shard.objects.entry(oid.clone()).or_default();
        let mut dropped = 0usize;
        for k in keys {
            if let Some(v) = pending.sets.remove(k) {
                dropped += k.len() + v.len();
            }
            pending.removes.insert(k.clone());
        }
        pending.bytes = pending.bytes.saturating_sub(dropped);
        if let Some(spos) = spos {
            pending.spos = Some(*spos);
        }
        shard.bytes = shard.bytes.saturating_sub(dropped);
    }

    /// Header plus every key of a pgmeta object, pending state merged over
    /// the store.
    pub fn get_all(&self, oid: &ObjectId) -> Result<(Option<Bytes>, BTreeMap<String, Bytes>)> {
        let (header, mut map) = self.omap.get_all(oid)?;
        let shard = self.shards[self.shard_index(oid)].lock();
        if let Some(pending) = shard.objects.get(oid) {
            for k in &pending.removes {
                map.remove(k);
            }
            for (k, v) in &pending.sets {
                map.insert(k.clone(), v.clone());
            }
        }
        Ok((header, map))
    }

    /// Values for specific keys, pending state merged over the store.
    pub fn get_by_keys(
        &self,
        oid: &ObjectId,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Bytes>> {
        let mut out = self.omap.get_values(oid, keys)?;
        let shard = self.shards[self.shard_index(oid)].lock();
        if let Some(pending) = shard.objects.get(oid) {
            for k in keys {
                if pending.removes.contains(k) {
                    out.remove(k);
                }
                if let Some(v) = pending.sets.get(k) {
                    out.insert(k.clone(), v.clone());
                }
            }
        }
        Ok(out)
    }

    /// Flush one object's pending state to the store. After this returns,
    /// store reads for the object reflect every prior staged operation.
    pub fn submit_object(&self, oid: &ObjectId) -> Result<()> {
        let idx = self.shard_index(oid);
        let mut shard = self.shards[idx].lock();
        let Some(pending) = shard.objects.remove(oid) else {
            return Ok(());
        };
        shard.bytes = shard.bytes.saturating_sub(pending.bytes);
        drop(shard);
        self.write_out(oid, &pending)
    }

    /// Flush every object in one shard (used by the commit engine).
    pub fn submit_shard(&self, index: usize) -> Result<()> {
        let mut shard = self.shards[index % self.shards.len()].lock();
        self.flush_locked(&mut shard)
    }

    /// Discard all pending state for an object (it is being removed).
    pub fn discard_object(&self, oid: &ObjectId) {
        let idx = self.shard_index(oid);
        let mut shard = self.shards[idx].lock();
        if let Some(pending) = shard.objects.remove(oid) {
            shard.bytes = shard.bytes.saturating_sub(pending.bytes);
        }
    }

    /// Total staged bytes (all shards).
    #[must_use]
    pub fn staged_bytes(&self) -> usize {
        self.shards.iter().map(|s| s.lock().bytes).sum()
    }

    fn flush_locked(&self, shard: &mut Shard) -> Result<()> {
        let objects: Vec<(ObjectId, PendingObject)> = shard.objects.drain().collect();
        shard.bytes = 0;
        for (oid, pending) in &objects {
            self.write_out(oid, pending)?;
        }
        Ok(())
    }

    fn write_out(&self, oid: &ObjectId, pending: &PendingObject) -> Result<()> {
        if pending.is_empty() {
            return Ok(());
        }
        let spos = pending.spos.as_ref();
        if !pending.removes.is_empty() {
            self.omap.rm_keys(oid, &pending.removes, spos)?;
        }
        if !pending.sets.is_empty() {
            self.omap.set_keys(oid, &pending.sets, spos)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn cache(dir: &std::path::Path, shard_bytes: usize) -> (PgMetaCache, Arc<OmapStore>) {
        let omap = Arc::new(OmapStore::open(dir).unwrap());
        let config = PgMetaConfig { shards: 2, shard_bytes };
        (PgMetaCache::new(&config, Arc::clone(&omap)), omap)
    }

    fn kvs(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Bytes::copy_from_slice(v)))
            .collect()
    }

    #[test]
    fn test_pending_reads_merge_over_store() {
        let dir = tempdir().unwrap();
        let (cache, omap) = cache(dir.path(), 1 << 20);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        omap.set_keys(&oid, &kvs(&[("stored", b"s"), ("doomed", b"d")]), None).unwrap();
        cache.set_keys(&oid, &kvs(&[("staged", b"p")]), None).unwrap();
        cache.erase_keys(&oid, &["doomed".to_string()].into(), None);

        let (_, all) = cache.get_all(&oid).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.contains_key("stored"));
        assert!(all.contains_key("staged"));
        assert!(!all.contains_key("doomed"));

        // the store itself has not seen any of it yet
        assert_eq!(omap.get_keys(&oid).unwrap().len(), 2);
    }

    #[test]
    fn test_erase_suppresses_pending_set() {
        let dir = tempdir().unwrap();
        let (cache, omap) = cache(dir.path(), 1 << 20);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        cache.set_keys(&oid, &kvs(&[("k", b"v")]), None).unwrap();
        cache.erase_keys(&oid, &["k".to_string()].into(), None);
        cache.submit_object(&oid).unwrap();

        assert!(omap.get_keys(&oid).unwrap().is_empty());
    }

    #[test]
    fn test_submit_makes_store_current() {
        let dir = tempdir().unwrap();
        let (cache, omap) = cache(dir.path(), 1 << 20);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        cache.set_keys(&oid, &kvs(&[("a", b"1"), ("b", b"2")]), None).unwrap();
        cache.submit_object(&oid).unwrap();
        assert_eq!(omap.get_keys(&oid).unwrap(), vec!["a", "b"]);
        assert_eq!(cache.staged_bytes(), 0);
    }

    #[test]
    fn test_overflow_flushes_shard() {
        let dir = tempdir().unwrap();
        let (cache, omap) = cache(dir.path(), 64);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        let mut overflowed = false;
        for i in 0..32 {
            let kv = kvs(&[(format!("key{i:04}").as_str(), b"0123456789".as_slice())]);
            overflowed |= cache.set_keys(&oid, &kv, None).unwrap();
        }
        assert!(overflowed);
        // at least one batch reached the store before any submit call
        assert!(!omap.get_keys(&oid).unwrap().is_empty());

        cache.submit_object(&oid).unwrap();
        assert_eq!(omap.get_keys(&oid).unwrap().len(), 32);
    }

    #[test]
    fn test_batch_count_bounded_by_budget() {
        let dir = tempdir().unwrap();
        let shard_bytes = 256;
        let (cache, _omap) = cache(dir.path(), shard_bytes);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        let n: usize = 100;
        let entry_bytes = 16;
        let mut flushes = 0;
        for i in 0..n {
            let kv = kvs(&[(format!("k{i:06}").as_str(), b"01234567".as_slice())]);
            if cache.set_keys(&oid, &kv, None).unwrap() {
                flushes += 1;
            }
        }
        let max_flushes = (n * entry_bytes).div_ceil(shard_bytes);
        assert!(flushes <= max_flushes, "{flushes} > {max_flushes}");
    }

    #[test]
    fn test_discard_object_drops_pending() {
        let dir = tempdir().unwrap();
        let (cache, omap) = cache(dir.path(), 1 << 20);
        let oid = ObjectId::pgmeta("pg1", 0, 0);

        cache.set_keys(&oid, &kvs(&[("k", b"v")]), None).unwrap();
        cache.discard_object(&oid);
        cache.submit_object(&oid).unwrap();
        assert!(omap.get_keys(&oid).unwrap().is_empty());
        assert_eq!(cache.staged_bytes(), 0);
    }
}
