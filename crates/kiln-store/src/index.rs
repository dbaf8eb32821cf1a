//! Hashed directory index
//!
//! Maps collection ids to directories under `current/` and object ids to
//! file names inside them. Names are escaped so any byte string round-trips
//! through the filesystem; object file names carry the full id triple plus
//! the stable hash, so a directory listing alone recovers every id.
//!
//! Each collection carries a reader/writer lock: mutating ops take the write
//! side, reads the read side. Replay-guard xattrs on object files are only
//! written under the collection write lock.

use kiln_common::{CollectionId, Error, ObjectId, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Names at the top of `current/` that can never be collections.
const RESERVED: &[&str] = &["omap", "nosnap", "commit_op_seq"];

/// Directory index over `current/`.
pub struct IndexManager {
    current_dir: PathBuf,
    locks: Mutex<HashMap<CollectionId, Arc<RwLock<()>>>>,
}

impl IndexManager {
    #[must_use]
    pub fn new(current_dir: impl Into<PathBuf>) -> Self {
        Self { current_dir: current_dir.into(), locks: Mutex::new(HashMap::new()) }
    }

    /// The reader/writer lock guarding a collection's tree.
    pub fn lock(&self, cid: &CollectionId) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks.entry(cid.clone()).or_default().clone()
    }

    /// Directory holding a collection.
    #[must_use]
    pub fn collection_dir(&self, cid: &CollectionId) -> PathBuf {
        self.current_dir.join(escape(cid.as_str()))
    }

    /// Full path of an object file (whether or not it exists).
    #[must_use]
    pub fn object_path(&self, cid: &CollectionId, oid: &ObjectId) -> PathBuf {
        self.collection_dir(cid).join(object_file_name(oid))
    }

    pub fn create_collection(&self, cid: &CollectionId) -> Result<()> {
        if RESERVED.contains(&cid.as_str()) || cid.as_str().starts_with('.') {
            return Err(Error::Config(format!("reserved collection name {cid}")));
        }
        std::fs::create_dir(self.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("mkdir {cid}")))
    }

    pub fn destroy_collection(&self, cid: &CollectionId) -> Result<()> {
        std::fs::remove_dir(self.collection_dir(cid))
            .map_err(|e| Error::from_io(e, format!("rmdir {cid}")))
    }

    #[must_use]
    pub fn collection_exists(&self, cid: &CollectionId) -> bool {
        self.collection_dir(cid).is_dir()
    }

    pub fn collection_empty(&self, cid: &CollectionId) -> Result<bool> {
        Ok(self.list_objects(cid)?.is_empty())
    }

    pub fn list_collections(&self) -> Result<Vec<CollectionId>> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.current_dir)
            .map_err(|e| Error::from_io(e, "read current/"))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(e, "read current/"))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if RESERVED.contains(&name.as_str()) || name.starts_with('.') {
                continue;
            }
            if entry.file_type().map_err(|e| Error::from_io(e, "stat"))?.is_dir() {
                out.push(CollectionId::new(unescape(&name)));
            }
        }
        out.sort();
        Ok(out)
    }

    /// Resolve an object to its path, failing with `NotFound` if absent.
    pub fn lookup(&self, cid: &CollectionId, oid: &ObjectId) -> Result<PathBuf> {
        let path = self.object_path(cid, oid);
        if path.is_file() {
            Ok(path)
        } else {
            Err(Error::NotFound(format!("{cid}/{oid}")))
        }
    }

    /// All objects in a collection, hash-sorted.
    pub fn list_objects(&self, cid: &CollectionId) -> Result<Vec<ObjectId>> {
        let dir = self.collection_dir(cid);
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::from_io(e, format!("read {cid}")))?;
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Error::from_io(e, format!("read {cid}")))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(oid) = parse_object_file_name(&name) {
                out.push(oid);
            }
        }
        out.sort_by_key(|o| (o.hash(), o.name().to_string(), o.generation()));
        Ok(out)
    }

    /// Hard-link an object into a (possibly different) collection and name.
    pub fn link(
        &self,
        src_cid: &CollectionId,
        dst_cid: &CollectionId,
        src_oid: &ObjectId,
        dst_oid: &ObjectId,
    ) -> Result<()> {
        let from = self.object_path(src_cid, src_oid);
        let to = self.object_path(dst_cid, dst_oid);
        std::fs::hard_link(&from, &to)
            .map_err(|e| Error::from_io(e, format!("link {src_cid}/{src_oid} -> {dst_cid}/{dst_oid}")))
    }

    /// Remove an object's directory entry.
    pub fn unlink(&self, cid: &CollectionId, oid: &ObjectId) -> Result<()> {
        std::fs::remove_file(self.object_path(cid, oid))
            .map_err(|e| Error::from_io(e, format!("unlink {cid}/{oid}")))
    }

    /// Hard link count of an object file.
    pub fn nlink(&self, cid: &CollectionId, oid: &ObjectId) -> Result<u64> {
        use std::os::unix::fs::MetadataExt;
        let md = std::fs::metadata(self.object_path(cid, oid))
            .map_err(|e| Error::from_io(e, format!("stat {cid}/{oid}")))?;
        Ok(md.nlink())
    }

    /// Move every object whose hash matches `(bits, rem)` from `cid` into
    /// `dest`. Both collections must exist; both write locks must be held by
    /// the caller.
    pub fn split(&self, cid: &CollectionId, bits: u32, rem: u32, dest: &CollectionId)
        -> Result<usize> {
        let mut moved = 0;
        for oid in self.list_objects(cid)? {
            if !oid.match_split(bits, rem) {
                continue;
            }
            let from = self.object_path(cid, &oid);
            let to = self.object_path(dest, &oid);
            std::fs::rename(&from, &to)
                .map_err(|e| Error::from_io(e, format!("split move {cid}/{oid}")))?;
            moved += 1;
        }
        Ok(moved)
    }

    #[must_use]
    pub fn current_dir(&self) -> &Path {
        &self.current_dir
    }
}

/// File name encoding an object id: `name#shard#generation#hash#kind`.
#[must_use]
pub fn object_file_name(oid: &ObjectId) -> String {
    format!(
        "{}#{}#{:016x}#{:08x}#{}",
        escape(oid.name()),
        oid.shard(),
        oid.generation(),
        oid.hash(),
        if oid.is_pgmeta() { 'm' } else { 'o' },
    )
}

/// Parse an object file name back into its id. Returns `None` for foreign
/// files.
#[must_use]
pub fn parse_object_file_name(name: &str) -> Option<ObjectId> {
    let mut parts = name.rsplitn(5, '#');
    let kind = parts.next()?;
    let _hash = u32::from_str_radix(parts.next()?, 16).ok()?;
    let generation = u64::from_str_radix(parts.next()?, 16).ok()?;
    let shard: i8 = parts.next()?.parse().ok()?;
    let escaped = parts.next()?;
    let pgmeta = match kind {
        "m" => true,
        "o" => false,
        _ => return None,
    };
    Some(ObjectId::from_parts(unescape(escaped), shard, generation, pgmeta))
}

/// Escape a byte string into filesystem-safe characters. `#` must be escaped
/// because it delimits object file name fields.
fn escape(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for &b in name.as_bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02x}")),
        }
    }
    out
}

fn unescape(name: &str) -> String {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let Some(hex) = name.get(i + 1..i + 3) {
                if let Ok(b) = u8::from_str_radix(hex, 16) {
                    out.push(b);
                    i += 3;
                    continue;
                }
            }
            out.push(b'%');
            i += 1;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_object_file_name_roundtrip() {
        for oid in [
            ObjectId::new("plain", 0, 0),
            ObjectId::new("we#ird/name %x", -1, 0xdead),
            ObjectId::pgmeta("meta", 3, 7),
        ] {
            let parsed = parse_object_file_name(&object_file_name(&oid)).unwrap();
            assert_eq!(parsed, oid);
        }
        assert!(parse_object_file_name("not-an-object").is_none());
    }

    #[test]
    fn test_collection_lifecycle() {
        let dir = tempdir().unwrap();
        let index = IndexManager::new(dir.path());
        let cid = CollectionId::new("coll_a");

        assert!(!index.collection_exists(&cid));
        index.create_collection(&cid).unwrap();
        assert!(index.collection_exists(&cid));
        assert_eq!(index.list_collections().unwrap(), vec![cid.clone()]);
        assert!(index.collection_empty(&cid).unwrap());
        index.destroy_collection(&cid).unwrap();
        assert!(!index.collection_exists(&cid));
    }

    #[test]
    fn test_reserved_collection_names() {
        let dir = tempdir().unwrap();
        let index = IndexManager::new(dir.path());
        assert!(index.create_collection(&CollectionId::new("omap")).is_err());
        assert!(index.create_collection(&CollectionId::new(".hidden")).is_err());
    }

    #[test]
    fn test_link_unlink_and_listing() {
        let dir = tempdir().unwrap();
        let index = IndexManager::new(dir.path());
        let c1 = CollectionId::new("c1");
        let c2 = CollectionId::new("c2");
        index.create_collection(&c1).unwrap();
        index.create_collection(&c2).unwrap();

        let oid = ObjectId::new("obj", 0, 0);
        std::fs::write(index.object_path(&c1, &oid), b"data").unwrap();

        index.link(&c1, &c2, &oid, &oid).unwrap();
        assert_eq!(index.nlink(&c1, &oid).unwrap(), 2);
        assert_eq!(index.list_objects(&c2).unwrap(), vec![oid.clone()]);

        index.unlink(&c1, &oid).unwrap();
        assert!(index.lookup(&c1, &oid).unwrap_err().is_not_found());
        assert_eq!(index.nlink(&c2, &oid).unwrap(), 1);
    }

    #[test]
    fn test_split_moves_matching_objects() {
        let dir = tempdir().unwrap();
        let index = IndexManager::new(dir.path());
        let src = CollectionId::new("src");
        let dst = CollectionId::new("dst");
        index.create_collection(&src).unwrap();
        index.create_collection(&dst).unwrap();

        let oids: Vec<ObjectId> = (0..16).map(|i| ObjectId::new(format!("o{i}"), 0, 0)).collect();
        for oid in &oids {
            std::fs::write(index.object_path(&src, oid), b"x").unwrap();
        }

        let moved = index.split(&src, 1, 1, &dst).unwrap();
        let stayed = index.list_objects(&src).unwrap();
        let went = index.list_objects(&dst).unwrap();
        assert_eq!(moved, went.len());
        assert_eq!(stayed.len() + went.len(), oids.len());
        assert!(stayed.iter().all(|o| !o.match_split(1, 1)));
        assert!(went.iter().all(|o| o.match_split(1, 1)));
    }
}
