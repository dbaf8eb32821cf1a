//! Filesystem backend abstraction
//!
//! The store consumes a small capability set from the filesystem under
//! `current/`: range cloning, sparse copies, hole punching, whole-fs sync,
//! and (when available) atomic checkpoints of the data root. `FsBackend`
//! names those capabilities; `GenericBackend` implements them for any POSIX
//! filesystem, with graceful fallbacks where a capability is missing.
//!
//! Checkpoints are deliberately unimplemented here: a snapshot-capable
//! backend reports `can_checkpoint() == true` and the commit engine and
//! replay guards change shape around it, but no such backend ships in-tree.

use crc32c::crc32c;
use kiln_common::{Error, ObjectId, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::{debug, error};

/// Filesystem magic for XFS.
pub const XFS_SUPER_MAGIC: i64 = 0x5846_5342;
/// Filesystem magic for btrfs.
pub const BTRFS_SUPER_MAGIC: i64 = 0x9123_683E;

const COPY_BUF_LEN: usize = 128 << 10;

/// Capability set the store consumes from the backing filesystem.
pub trait FsBackend: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// statfs magic of the filesystem under the data root.
    fn fs_type(&self) -> i64;

    /// Whether the backend can take atomic checkpoints of `current/`
    /// (including xattrs). When true, per-object replay guards are elided.
    fn can_checkpoint(&self) -> bool;

    /// Create a named checkpoint; returns an opaque token for `sync_checkpoint`.
    fn create_checkpoint(&self, name: &str) -> Result<u64>;

    /// Wait until the given checkpoint is stable on media.
    fn sync_checkpoint(&self, token: u64) -> Result<()>;

    /// Replace `current/` with the named checkpoint.
    fn rollback_to(&self, name: &str) -> Result<()>;

    fn destroy_checkpoint(&self, name: &str) -> Result<()>;

    fn list_checkpoints(&self) -> Result<Vec<String>>;

    /// Flush every dirty page of the filesystem holding the data root.
    fn syncfs(&self) -> Result<()>;

    /// Clone `len` bytes from `src` into `dst` without copying through
    /// userspace, when the filesystem can.
    fn clone_range(&self, src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64)
        -> Result<()>;

    /// Deallocate a byte range, leaving a hole.
    fn punch_hole(&self, file: &File, offset: u64, len: u64) -> Result<()>;

    /// Advise the filesystem about the expected write size of a file.
    fn set_alloc_hint(&self, file: &File, hint: u64) -> Result<()>;

    /// Whether `SEEK_DATA`/`SEEK_HOLE` work here (probed at mount).
    fn has_seek_data(&self) -> bool;
}

/// Backend for plain POSIX filesystems: no checkpoints, best-effort cloning.
pub struct GenericBackend {
    current: File,
    fs_type: i64,
    has_clone_range: bool,
    has_seek_data: bool,
}

impl GenericBackend {
    /// Probe the filesystem under `current_dir` and build a backend for it.
    pub fn detect(current_dir: &Path) -> Result<Self> {
        let current = File::open(current_dir)
            .map_err(|e| Error::from_io(e, format!("open {}", current_dir.display())))?;
        let fs_type = fstatfs_type(&current)?;

        let probe_path = current_dir.join(".kiln_probe");
        let probe = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&probe_path)
            .map_err(|e| Error::from_io(e, "open capability probe"))?;
        probe
            .write_all_at(b"kiln-probe", 0)
            .map_err(|e| Error::from_io(e, "write capability probe"))?;

        let sink_path = current_dir.join(".kiln_probe2");
        let sink = std::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&sink_path)
            .map_err(|e| Error::from_io(e, "open capability probe"))?;

        let has_clone_range = copy_file_range(&probe, &sink, 0, 4, 0).is_ok();
        let has_seek_data = seek_data(&probe, 0).is_ok();

        drop(probe);
        drop(sink);
        let _ = std::fs::remove_file(&probe_path);
        let _ = std::fs::remove_file(&sink_path);

        debug!(
            "detected filesystem backend: fs_type={fs_type:#x} clone_range={has_clone_range} seek_data={has_seek_data}"
        );

        Ok(Self { current, fs_type, has_clone_range, has_seek_data })
    }
}

impl FsBackend for GenericBackend {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn fs_type(&self) -> i64 {
        self.fs_type
    }

    fn can_checkpoint(&self) -> bool {
        false
    }

    fn create_checkpoint(&self, name: &str) -> Result<u64> {
        Err(Error::Unsupported(format!("checkpoint {name}")))
    }

    fn sync_checkpoint(&self, _token: u64) -> Result<()> {
        Err(Error::Unsupported("sync_checkpoint".into()))
    }

    fn rollback_to(&self, name: &str) -> Result<()> {
        Err(Error::Unsupported(format!("rollback to {name}")))
    }

    fn destroy_checkpoint(&self, name: &str) -> Result<()> {
        Err(Error::Unsupported(format!("destroy checkpoint {name}")))
    }

    fn list_checkpoints(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    #[cfg(target_os = "linux")]
    fn syncfs(&self) -> Result<()> {
        let r = unsafe { libc::syncfs(self.current.as_raw_fd()) };
        if r == 0 {
            Ok(())
        } else {
            Err(Error::from_io(std::io::Error::last_os_error(), "syncfs"))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn syncfs(&self) -> Result<()> {
        unsafe { libc::sync() };
        Ok(())
    }

    fn clone_range(&self, src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64)
        -> Result<()> {
        if !self.has_clone_range {
            return Err(Error::Unsupported("copy_file_range".into()));
        }
        copy_file_range(src, dst, src_off, len, dst_off)
    }

    #[cfg(target_os = "linux")]
    fn punch_hole(&self, file: &File, offset: u64, len: u64) -> Result<()> {
        let r = unsafe {
            libc::fallocate(
                file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset as libc::off_t,
                len as libc::off_t,
            )
        };
        if r == 0 {
            Ok(())
        } else {
            Err(Error::from_io(std::io::Error::last_os_error(), "fallocate punch"))
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn punch_hole(&self, _file: &File, _offset: u64, _len: u64) -> Result<()> {
        Err(Error::Unsupported("punch_hole".into()))
    }

    fn set_alloc_hint(&self, _file: &File, _hint: u64) -> Result<()> {
        // advisory; generic filesystems have no interface for it
        Err(Error::Unsupported("set_alloc_hint".into()))
    }

    fn has_seek_data(&self) -> bool {
        self.has_seek_data
    }
}

/// Best-effort range copy: backend clone, then sparse copy, then plain copy.
pub fn copy_range_best(
    backend: &dyn FsBackend,
    src: &File,
    dst: &File,
    src_off: u64,
    len: u64,
    dst_off: u64,
) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    match backend.clone_range(src, dst, src_off, len, dst_off) {
        Ok(()) => return Ok(()),
        Err(e) => debug!("clone_range fell back to copy: {e}"),
    }
    if backend.has_seek_data() {
        match sparse_copy_range(src, dst, src_off, len, dst_off) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("sparse copy fell back to plain copy: {e}"),
        }
    }
    plain_copy_range(src, dst, src_off, len, dst_off)
}

/// Copy only the allocated extents of `[src_off, src_off+len)`, then extend
/// the destination so its size covers the copied range.
pub fn sparse_copy_range(
    src: &File,
    dst: &File,
    src_off: u64,
    len: u64,
    dst_off: u64,
) -> Result<()> {
    let end = src_off + len;
    let mut pos = src_off;
    while pos < end {
        let data_start = match seek_data(src, pos) {
            Ok(p) => p.min(end),
            // no data past pos
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e),
        };
        if data_start >= end {
            break;
        }
        let hole = seek_hole(src, data_start)?.min(end);
        plain_copy_range(src, dst, data_start, hole - data_start, dst_off + (data_start - src_off))?;
        pos = hole;
    }
    let want = dst_off + len;
    let have = dst
        .metadata()
        .map_err(|e| Error::from_io(e, "fstat"))?
        .len();
    if have < want {
        dst.set_len(want).map_err(|e| Error::from_io(e, "ftruncate"))?;
    }
    Ok(())
}

/// Byte-for-byte copy through a userspace buffer.
pub fn plain_copy_range(
    src: &File,
    dst: &File,
    src_off: u64,
    len: u64,
    dst_off: u64,
) -> Result<()> {
    let mut buf = vec![0u8; COPY_BUF_LEN];
    let mut copied: u64 = 0;
    while copied < len {
        let want = ((len - copied) as usize).min(COPY_BUF_LEN);
        let got = match src.read_at(&mut buf[..want], src_off + copied) {
            Ok(0) => {
                // short source: reading past EOF yields an implicit hole
                dst.set_len((dst_off + len).max(
                    dst.metadata().map_err(|e| Error::from_io(e, "fstat"))?.len(),
                ))
                .map_err(|e| Error::from_io(e, "ftruncate"))?;
                return Ok(());
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::from_io(e, "read")),
        };
        dst.write_all_at(&buf[..got], dst_off + copied)
            .map_err(|e| Error::from_io(e, "write"))?;
        copied += got as u64;
    }
    Ok(())
}

fn fstatfs_type(file: &File) -> Result<i64> {
    #[cfg(target_os = "linux")]
    {
        let mut st: libc::statfs = unsafe { std::mem::zeroed() };
        let r = unsafe { libc::fstatfs(file.as_raw_fd(), &mut st) };
        if r != 0 {
            return Err(Error::from_io(std::io::Error::last_os_error(), "fstatfs"));
        }
        Ok(st.f_type as i64)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = file;
        Ok(0)
    }
}

#[cfg(target_os = "linux")]
fn copy_file_range(src: &File, dst: &File, src_off: u64, len: u64, dst_off: u64) -> Result<()> {
    let mut remaining = len;
    let mut s_off = src_off as libc::off64_t;
    let mut d_off = dst_off as libc::off64_t;
    while remaining > 0 {
        let r = unsafe {
            libc::copy_file_range(
                src.as_raw_fd(),
                &mut s_off,
                dst.as_raw_fd(),
                &mut d_off,
                remaining as usize,
                0,
            )
        };
        if r < 0 {
            let e = std::io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(Error::from_io(e, "copy_file_range"));
        }
        if r == 0 {
            // source shorter than requested; the caller's fallback handles it
            return Err(Error::Range("copy_file_range short copy".into()));
        }
        remaining -= r as u64;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn copy_file_range(_s: &File, _d: &File, _so: u64, _l: u64, _do: u64) -> Result<()> {
    Err(Error::Unsupported("copy_file_range".into()))
}

fn seek_data(file: &File, offset: u64) -> Result<u64> {
    seek_whence(file, offset, libc::SEEK_DATA)
}

fn seek_hole(file: &File, offset: u64) -> Result<u64> {
    seek_whence(file, offset, libc::SEEK_HOLE)
}

fn seek_whence(file: &File, offset: u64, whence: i32) -> Result<u64> {
    let r = unsafe { libc::lseek(file.as_raw_fd(), offset as libc::off_t, whence) };
    if r < 0 {
        let e = std::io::Error::last_os_error();
        // ENXIO: no data (or hole) at or past offset
        if e.raw_os_error() == Some(libc::ENXIO) {
            return Err(Error::NoData("seek".into()));
        }
        return Err(Error::from_io(e, "lseek"));
    }
    Ok(r as u64)
}

/// Shadow CRC map for written ranges, kept when `sloppy_crc` is on. Ranges
/// that are later overwritten, zeroed or truncated are invalidated rather
/// than recomputed; reads verify only exact-range hits.
#[derive(Default)]
pub struct CrcTracker {
    ranges: Mutex<HashMap<ObjectId, BTreeMap<u64, (u32, u32)>>>,
}

impl CrcTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_write(&self, oid: &ObjectId, offset: u64, data: &[u8]) {
        let mut map = self.ranges.lock();
        let entry = map.entry(oid.clone()).or_default();
        Self::invalidate_overlap(entry, offset, data.len() as u64);
        entry.insert(offset, (data.len() as u32, crc32c(data)));
    }

    pub fn update_zero(&self, oid: &ObjectId, offset: u64, len: u64) {
        let mut map = self.ranges.lock();
        if let Some(entry) = map.get_mut(oid) {
            Self::invalidate_overlap(entry, offset, len);
        }
    }

    pub fn update_truncate(&self, oid: &ObjectId, size: u64) {
        let mut map = self.ranges.lock();
        if let Some(entry) = map.get_mut(oid) {
            entry.retain(|&off, &mut (len, _)| off + u64::from(len) <= size);
        }
    }

    pub fn clone_object(&self, src: &ObjectId, dst: &ObjectId) {
        let mut map = self.ranges.lock();
        if let Some(entry) = map.get(src).cloned() {
            map.insert(dst.clone(), entry);
        } else {
            map.remove(dst);
        }
    }

    pub fn drop_object(&self, oid: &ObjectId) {
        self.ranges.lock().remove(oid);
    }

    /// Verify a read against the tracked CRC when the range matches exactly.
    /// A mismatch is loud but not fatal.
    pub fn verify_read(&self, oid: &ObjectId, offset: u64, data: &[u8]) {
        let map = self.ranges.lock();
        let Some(entry) = map.get(oid) else { return };
        if let Some(&(len, crc)) = entry.get(&offset) {
            if u64::from(len) == data.len() as u64 && crc != crc32c(data) {
                error!("crc mismatch on {oid} at {offset}~{len}");
            }
        }
    }

    fn invalidate_overlap(entry: &mut BTreeMap<u64, (u32, u32)>, offset: u64, len: u64) {
        let end = offset + len;
        let stale: Vec<u64> = entry
            .iter()
            .filter(|(&off, &(l, _))| off < end && off + u64::from(l) > offset)
            .map(|(&off, _)| off)
            .collect();
        for off in stale {
            entry.remove(&off);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::tempdir;

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn test_detect_generic() {
        let dir = tempdir().unwrap();
        let b = GenericBackend::detect(dir.path()).unwrap();
        assert!(!b.can_checkpoint());
        assert!(b.list_checkpoints().unwrap().is_empty());
        assert!(matches!(b.rollback_to("snap"), Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_plain_copy_range() {
        let dir = tempdir().unwrap();
        let src = open_rw(&dir.path().join("src"));
        let dst = open_rw(&dir.path().join("dst"));
        src.write_all_at(b"0123456789", 0).unwrap();

        plain_copy_range(&src, &dst, 2, 5, 10).unwrap();

        let mut buf = [0u8; 5];
        dst.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"23456");
    }

    #[test]
    fn test_copy_range_best_whole_file() {
        let dir = tempdir().unwrap();
        let backend = GenericBackend::detect(dir.path()).unwrap();
        let src = open_rw(&dir.path().join("src"));
        let dst = open_rw(&dir.path().join("dst"));
        let payload = vec![0xabu8; 70_000];
        src.write_all_at(&payload, 0).unwrap();

        copy_range_best(&backend, &src, &dst, 0, payload.len() as u64, 0).unwrap();

        let mut buf = vec![0u8; payload.len()];
        dst.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_sparse_copy_preserves_length() {
        let dir = tempdir().unwrap();
        if !GenericBackend::detect(dir.path()).unwrap().has_seek_data() {
            return;
        }
        let src = open_rw(&dir.path().join("src"));
        let dst = open_rw(&dir.path().join("dst"));
        // data at the front, then a large implicit hole
        src.write_all_at(b"head", 0).unwrap();
        src.set_len(1 << 20).unwrap();

        sparse_copy_range(&src, &dst, 0, 1 << 20, 0).unwrap();

        assert_eq!(dst.metadata().unwrap().len(), 1 << 20);
        let mut buf = [0u8; 4];
        dst.read_exact_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"head");
    }

    #[test]
    fn test_crc_tracker() {
        let t = CrcTracker::new();
        let oid = ObjectId::new("o", 0, 0);
        t.update_write(&oid, 0, b"hello");
        // exact-range verify is quiet on match; overlap invalidates
        t.verify_read(&oid, 0, b"hello");
        t.update_write(&oid, 2, b"xx");
        t.update_truncate(&oid, 1);
        t.drop_object(&oid);
    }
}
