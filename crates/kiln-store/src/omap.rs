//! Object map - the embedded ordered key/value store
//!
//! Holds per-object omap rows, the optional omap header, spilled attributes
//! and a per-object replay position, all in one redb table keyed by the
//! object's stable byte encoding plus a tag byte. redb commits are durable,
//! so `sync` has nothing to flush; it only records positions.
//!
//! During journal replay the store enables gating: a mutation carrying a
//! sequencer position at or below the object's recorded position is a replay
//! of work the map already holds and is dropped.

use bytes::Bytes;
use kiln_common::{Error, ObjectId, Result, SeqPosition};
use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const OBJECTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("objects");

const TAG_HEADER: u8 = 0;
const TAG_OMAP: u8 = 1;
const TAG_XATTR: u8 = 2;
const TAG_SPOS: u8 = 3;

fn kv_err(e: impl std::fmt::Display) -> Error {
    Error::Kv(e.to_string())
}

/// redb-backed object map.
pub struct OmapStore {
    db: Database,
    gating: AtomicBool,
}

impl OmapStore {
    /// Open or create the map under the given directory.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| Error::from_io(e, "mkdir omap"))?;
        let db = Database::create(dir.join("omap.redb")).map_err(kv_err)?;
        // make sure the table exists so readers never race its creation
        let wtx = db.begin_write().map_err(kv_err)?;
        wtx.open_table(OBJECTS).map_err(kv_err)?;
        wtx.commit().map_err(kv_err)?;
        Ok(Self { db, gating: AtomicBool::new(false) })
    }

    /// Enable or disable replay gating.
    pub fn set_replay_gating(&self, on: bool) {
        self.gating.store(on, Ordering::SeqCst);
    }

    /// Record a position for an object without mutating its rows.
    pub fn sync(&self, oid: Option<&ObjectId>, spos: Option<&SeqPosition>) -> Result<()> {
        if let (Some(oid), Some(spos)) = (oid, spos) {
            self.write(oid, Some(spos), |_, _| Ok(()))?;
        }
        Ok(())
    }

    /// Set omap keys. Returns false when replay gating dropped the write.
    pub fn set_keys(
        &self,
        oid: &ObjectId,
        kvs: &BTreeMap<String, Bytes>,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            for (k, v) in kvs {
                table
                    .insert(row_key(key, TAG_OMAP, k.as_bytes()).as_slice(), v.as_ref())
                    .map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Remove omap keys.
    pub fn rm_keys(
        &self,
        oid: &ObjectId,
        keys: &BTreeSet<String>,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            for k in keys {
                table
                    .remove(row_key(key, TAG_OMAP, k.as_bytes()).as_slice())
                    .map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Remove every omap key in `[first, last)`.
    pub fn rm_key_range(
        &self,
        oid: &ObjectId,
        first: &str,
        last: &str,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            let lo = row_key(key, TAG_OMAP, first.as_bytes());
            let hi = row_key(key, TAG_OMAP, last.as_bytes());
            let stale = collect_keys(table, &lo, Some(&hi))?;
            for k in stale {
                table.remove(k.as_slice()).map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Drop the omap header and all omap keys, leaving xattrs alone.
    pub fn clear_keys_header(&self, oid: &ObjectId, spos: Option<&SeqPosition>) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            table.remove(row_key(key, TAG_HEADER, &[]).as_slice()).map_err(kv_err)?;
            let prefix = row_key(key, TAG_OMAP, &[]);
            for k in collect_prefix_keys(table, &prefix)? {
                table.remove(k.as_slice()).map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Set the omap header blob.
    pub fn set_header(&self, oid: &ObjectId, header: &Bytes, spos: Option<&SeqPosition>)
        -> Result<bool> {
        self.write(oid, spos, |table, key| {
            table
                .insert(row_key(key, TAG_HEADER, &[]).as_slice(), header.as_ref())
                .map_err(kv_err)?;
            Ok(())
        })
    }

    /// Store spilled attributes.
    pub fn set_xattrs(
        &self,
        oid: &ObjectId,
        attrs: &BTreeMap<String, Bytes>,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            for (k, v) in attrs {
                table
                    .insert(row_key(key, TAG_XATTR, k.as_bytes()).as_slice(), v.as_ref())
                    .map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Remove spilled attributes.
    pub fn remove_xattrs(
        &self,
        oid: &ObjectId,
        names: &BTreeSet<String>,
        spos: Option<&SeqPosition>,
    ) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            for k in names {
                table
                    .remove(row_key(key, TAG_XATTR, k.as_bytes()).as_slice())
                    .map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Remove every row the object owns (omap, header, xattrs, position).
    pub fn clear(&self, oid: &ObjectId, spos: Option<&SeqPosition>) -> Result<bool> {
        self.write(oid, spos, |table, key| {
            for k in collect_prefix_keys(table, key)? {
                table.remove(k.as_slice()).map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// Replace `dst`'s rows with a copy of `src`'s (clone keys, header and
    /// spilled attrs; positions are not copied).
    pub fn clone_object(&self, src: &ObjectId, dst: &ObjectId, spos: Option<&SeqPosition>)
        -> Result<bool> {
        let src_key = src.key_bytes();
        let dst_key = dst.key_bytes();
        self.write(dst, spos, |table, key| {
            for k in collect_prefix_keys(table, key)? {
                table.remove(k.as_slice()).map_err(kv_err)?;
            }
            let rows = collect_prefix_rows(table, &src_key)?;
            for (k, v) in rows {
                let suffix = &k[src_key.len()..];
                if suffix.first() == Some(&TAG_SPOS) {
                    continue;
                }
                let mut nk = dst_key.clone();
                nk.extend_from_slice(suffix);
                table.insert(nk.as_slice(), v.as_slice()).map_err(kv_err)?;
            }
            Ok(())
        })
    }

    /// All omap key names, sorted.
    pub fn get_keys(&self, oid: &ObjectId) -> Result<Vec<String>> {
        let prefix = row_key(&oid.key_bytes(), TAG_OMAP, &[]);
        Ok(self
            .read_prefix(&prefix)?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k[prefix.len()..]).into_owned())
            .collect())
    }

    /// Values for the requested omap keys; absent keys are omitted.
    pub fn get_values(&self, oid: &ObjectId, keys: &BTreeSet<String>)
        -> Result<BTreeMap<String, Bytes>> {
        let key = oid.key_bytes();
        let mut out = BTreeMap::new();
        let rtx = self.db.begin_read().map_err(kv_err)?;
        let table = rtx.open_table(OBJECTS).map_err(kv_err)?;
        for k in keys {
            if let Some(v) = table
                .get(row_key(&key, TAG_OMAP, k.as_bytes()).as_slice())
                .map_err(kv_err)?
            {
                out.insert(k.clone(), Bytes::copy_from_slice(v.value()));
            }
        }
        Ok(out)
    }

    /// Which of the requested keys exist.
    pub fn check_keys(&self, oid: &ObjectId, keys: &BTreeSet<String>)
        -> Result<BTreeSet<String>> {
        Ok(self.get_values(oid, keys)?.into_keys().collect())
    }

    /// Header plus all omap key/values.
    pub fn get_all(&self, oid: &ObjectId)
        -> Result<(Option<Bytes>, BTreeMap<String, Bytes>)> {
        let key = oid.key_bytes();
        let header = self.get_header(oid)?;
        let prefix = row_key(&key, TAG_OMAP, &[]);
        let map = self
            .read_prefix(&prefix)?
            .into_iter()
            .map(|(k, v)| {
                (String::from_utf8_lossy(&k[prefix.len()..]).into_owned(), Bytes::from(v))
            })
            .collect();
        Ok((header, map))
    }

    pub fn get_header(&self, oid: &ObjectId) -> Result<Option<Bytes>> {
        let rtx = self.db.begin_read().map_err(kv_err)?;
        let table = rtx.open_table(OBJECTS).map_err(kv_err)?;
        let row = table
            .get(row_key(&oid.key_bytes(), TAG_HEADER, &[]).as_slice())
            .map_err(kv_err)?;
        Ok(row.map(|v| Bytes::copy_from_slice(v.value())))
    }

    /// Spilled attribute values for the requested names.
    pub fn get_xattrs(&self, oid: &ObjectId, names: &BTreeSet<String>)
        -> Result<BTreeMap<String, Bytes>> {
        let key = oid.key_bytes();
        let mut out = BTreeMap::new();
        let rtx = self.db.begin_read().map_err(kv_err)?;
        let table = rtx.open_table(OBJECTS).map_err(kv_err)?;
        for n in names {
            if let Some(v) = table
                .get(row_key(&key, TAG_XATTR, n.as_bytes()).as_slice())
                .map_err(kv_err)?
            {
                out.insert(n.clone(), Bytes::copy_from_slice(v.value()));
            }
        }
        Ok(out)
    }

    /// Names of every spilled attribute.
    pub fn get_all_xattr_names(&self, oid: &ObjectId) -> Result<BTreeSet<String>> {
        let prefix = row_key(&oid.key_bytes(), TAG_XATTR, &[]);
        Ok(self
            .read_prefix(&prefix)?
            .into_iter()
            .map(|(k, _)| String::from_utf8_lossy(&k[prefix.len()..]).into_owned())
            .collect())
    }

    /// One write transaction around `body`, with replay gating and position
    /// recording. Returns false when gating dropped the write.
    fn write<F>(&self, oid: &ObjectId, spos: Option<&SeqPosition>, body: F) -> Result<bool>
    where
        F: FnOnce(&mut redb::Table<'_, &'static [u8], &'static [u8]>, &[u8]) -> Result<()>,
    {
        let key = oid.key_bytes();
        let wtx = self.db.begin_write().map_err(kv_err)?;
        let applied = {
            let mut table = wtx.open_table(OBJECTS).map_err(kv_err)?;
            let gate = self.gating.load(Ordering::SeqCst);
            let skip = if let (true, Some(spos)) = (gate, spos) {
                let row = table
                    .get(row_key(&key, TAG_SPOS, &[]).as_slice())
                    .map_err(kv_err)?;
                let stored = row.as_ref().and_then(|v| SeqPosition::from_bytes(v.value()));
                drop(row);
                match stored {
                    Some(stored) if stored >= *spos => {
                        debug!("omap replay skip {oid} at {spos} (stored {stored})");
                        true
                    }
                    _ => false,
                }
            } else {
                false
            };
            if !skip {
                body(&mut table, &key)?;
                if let Some(spos) = spos {
                    table
                        .insert(row_key(&key, TAG_SPOS, &[]).as_slice(), &spos.to_bytes()[..])
                        .map_err(kv_err)?;
                }
            }
            !skip
        };
        wtx.commit().map_err(kv_err)?;
        Ok(applied)
    }

    fn read_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let rtx = self.db.begin_read().map_err(kv_err)?;
        let table = rtx.open_table(OBJECTS).map_err(kv_err)?;
        collect_prefix_rows(&table, prefix)
    }
}

fn row_key(oid_key: &[u8], tag: u8, suffix: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oid_key.len() + 1 + suffix.len());
    out.extend_from_slice(oid_key);
    out.push(tag);
    out.extend_from_slice(suffix);
    out
}

/// Smallest byte string greater than every string with this prefix.
fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut out = prefix.to_vec();
    while let Some(last) = out.last_mut() {
        if *last < 0xff {
            *last += 1;
            return Some(out);
        }
        out.pop();
    }
    None
}

fn collect_prefix_rows<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let hi = prefix_successor(prefix);
    let range = match &hi {
        Some(hi) => table.range::<&[u8]>((Bound::Included(prefix), Bound::Excluded(hi.as_slice()))),
        None => table.range::<&[u8]>((Bound::Included(prefix), Bound::Unbounded)),
    }
    .map_err(kv_err)?;
    let mut out = Vec::new();
    for row in range {
        let (k, v) = row.map_err(kv_err)?;
        out.push((k.value().to_vec(), v.value().to_vec()));
    }
    Ok(out)
}

fn collect_prefix_keys<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    prefix: &[u8],
) -> Result<Vec<Vec<u8>>> {
    Ok(collect_prefix_rows(table, prefix)?.into_iter().map(|(k, _)| k).collect())
}

fn collect_keys<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    lo: &[u8],
    hi: Option<&[u8]>,
) -> Result<Vec<Vec<u8>>> {
    let range = match hi {
        Some(hi) => table.range::<&[u8]>((Bound::Included(lo), Bound::Excluded(hi))),
        None => table.range::<&[u8]>((Bound::Included(lo), Bound::Unbounded)),
    }
    .map_err(kv_err)?;
    let mut out = Vec::new();
    for row in range {
        let (k, _) = row.map_err(kv_err)?;
        out.push(k.value().to_vec());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn kvs(pairs: &[(&str, &[u8])]) -> BTreeMap<String, Bytes> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Bytes::copy_from_slice(v)))
            .collect()
    }

    fn keys(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_set_get_rm_keys() {
        let dir = tempdir().unwrap();
        let omap = OmapStore::open(dir.path()).unwrap();
        let oid = ObjectId::new("o1", 0, 0);

        omap.set_keys(&oid, &kvs(&[("a", b"1"), ("b", b"2"), ("c", b"3")]), None)
            .unwrap();
        assert_eq!(omap.get_keys(&oid).unwrap(), vec!["a", "b", "c"]);

        omap.rm_keys(&oid, &keys(&["b"]), None).unwrap();
        let (_, all) = omap.get_all(&oid).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["c"], Bytes::from_static(b"3"));
    }

    #[test]
    fn test_rm_key_range_half_open() {
        let dir = tempdir().unwrap();
        let omap = OmapStore::open(dir.path()).unwrap();
        let oid = ObjectId::new("o1", 0, 0);
        omap.set_keys(&oid, &kvs(&[("a", b"1"), ("b", b"2"), ("c", b"3"), ("d", b"4")]), None)
            .unwrap();

        omap.rm_key_range(&oid, "b", "d", None).unwrap();
        assert_eq!(omap.get_keys(&oid).unwrap(), vec!["a", "d"]);
    }

    #[test]
    fn test_header_and_clear() {
        let dir = tempdir().unwrap();
        let omap = OmapStore::open(dir.path()).unwrap();
        let oid = ObjectId::new("o1", 0, 0);

        omap.set_header(&oid, &Bytes::from_static(b"hdr"), None).unwrap();
        omap.set_keys(&oid, &kvs(&[("k", b"v")]), None).unwrap();
        omap.set_xattrs(&oid, &kvs(&[("x", b"spilled")]), None).unwrap();

        omap.clear_keys_header(&oid, None).unwrap();
        assert!(omap.get_header(&oid).unwrap().is_none());
        assert!(omap.get_keys(&oid).unwrap().is_empty());
        // xattrs survive clear_keys_header
        assert_eq!(omap.get_all_xattr_names(&oid).unwrap(), keys(&["x"]));

        omap.clear(&oid, None).unwrap();
        assert!(omap.get_all_xattr_names(&oid).unwrap().is_empty());
    }

    #[test]
    fn test_clone_object_replaces_dst() {
        let dir = tempdir().unwrap();
        let omap = OmapStore::open(dir.path()).unwrap();
        let src = ObjectId::new("src", 0, 0);
        let dst = ObjectId::new("dst", 0, 0);

        omap.set_keys(&src, &kvs(&[("k", b"v")]), None).unwrap();
        omap.set_header(&src, &Bytes::from_static(b"h"), None).unwrap();
        omap.set_keys(&dst, &kvs(&[("stale", b"x")]), None).unwrap();

        omap.clone_object(&src, &dst, None).unwrap();
        let (hdr, all) = omap.get_all(&dst).unwrap();
        assert_eq!(hdr.unwrap(), Bytes::from_static(b"h"));
        assert_eq!(all.len(), 1);
        assert!(all.contains_key("k"));
    }

    #[test]
    fn test_replay_gating() {
        let dir = tempdir().unwrap();
        let omap = OmapStore::open(dir.path()).unwrap();
        let oid = ObjectId::new("o1", 0, 0);
        let early = SeqPosition::new(5, 0, 0);
        let late = SeqPosition::new(6, 0, 0);

        omap.set_keys(&oid, &kvs(&[("k", b"first")]), Some(&late)).unwrap();

        omap.set_replay_gating(true);
        // replaying an older position must not clobber the newer write
        let applied = omap
            .set_keys(&oid, &kvs(&[("k", b"stale")]), Some(&early))
            .unwrap();
        assert!(!applied);
        assert_eq!(
            omap.get_values(&oid, &keys(&["k"])).unwrap()["k"],
            Bytes::from_static(b"first")
        );

        // a genuinely newer position applies
        let applied = omap
            .set_keys(&oid, &kvs(&[("k", b"newer")]), Some(&SeqPosition::new(7, 0, 0)))
            .unwrap();
        assert!(applied);
    }

    #[test]
    fn test_durability_across_reopen() {
        let dir = tempdir().unwrap();
        let oid = ObjectId::new("o1", 0, 0);
        {
            let omap = OmapStore::open(dir.path()).unwrap();
            omap.set_keys(&oid, &kvs(&[("k", b"v")]), None).unwrap();
        }
        let omap = OmapStore::open(dir.path()).unwrap();
        assert_eq!(omap.get_keys(&oid).unwrap(), vec!["k"]);
    }

    #[test]
    fn test_prefix_successor() {
        assert_eq!(prefix_successor(b"ab").unwrap(), b"ac".to_vec());
        assert_eq!(prefix_successor(&[0x01, 0xff]).unwrap(), vec![0x02]);
        assert!(prefix_successor(&[0xff, 0xff]).is_none());
    }
}
