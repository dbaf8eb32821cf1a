//! Low-level filesystem helpers
//!
//! Thin wrappers over the POSIX surface std does not expose: extended
//! attributes, file locks and range syncs. All wrappers retry `EINTR` and
//! map errno into the semantic error variants at this boundary.
//!
//! Extended attribute values larger than one xattr block are "chained":
//! the value is split across `name`, `name@1`, `name@2`, ... chunks and
//! reassembled on read. Listing collapses chunk names back to their base.

use kiln_common::{Error, Result};
use std::ffi::CString;
use std::fs::File;
use std::os::fd::AsRawFd;

/// Largest single xattr chunk written before chaining continues in the next
/// numbered name.
pub const XATTR_BLOCK_LEN: usize = 2048;

/// Prefix for every object attribute stored inline, kept clear of the fixed
/// control names (`user.cephos.seq` and friends).
pub const ATTR_PREFIX: &str = "user.cephos.attr.";

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

fn cname(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::Config(format!("bad xattr name {name:?}")))
}

/// Set one raw xattr on an open file.
pub fn fsetxattr(file: &File, name: &str, value: &[u8]) -> Result<()> {
    let cn = cname(name)?;
    loop {
        let r = unsafe {
            libc::fsetxattr(
                file.as_raw_fd(),
                cn.as_ptr(),
                value.as_ptr().cast(),
                value.len(),
                0,
            )
        };
        if r == 0 {
            return Ok(());
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(e, format!("fsetxattr {name}")));
    }
}

/// Get one raw xattr from an open file.
pub fn fgetxattr(file: &File, name: &str) -> Result<Vec<u8>> {
    let cn = cname(name)?;
    loop {
        let len = unsafe {
            libc::fgetxattr(file.as_raw_fd(), cn.as_ptr(), std::ptr::null_mut(), 0)
        };
        if len < 0 {
            let e = errno();
            if e == libc::EINTR {
                continue;
            }
            return Err(Error::from_errno(e, format!("fgetxattr {name}")));
        }
        let mut buf = vec![0u8; len as usize];
        let got = unsafe {
            libc::fgetxattr(
                file.as_raw_fd(),
                cn.as_ptr(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if got < 0 {
            let e = errno();
            if e == libc::EINTR || e == libc::ERANGE {
                // grew between the size query and the read
                continue;
            }
            return Err(Error::from_errno(e, format!("fgetxattr {name}")));
        }
        buf.truncate(got as usize);
        return Ok(buf);
    }
}

/// Remove one raw xattr.
pub fn fremovexattr(file: &File, name: &str) -> Result<()> {
    let cn = cname(name)?;
    loop {
        let r = unsafe { libc::fremovexattr(file.as_raw_fd(), cn.as_ptr()) };
        if r == 0 {
            return Ok(());
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(e, format!("fremovexattr {name}")));
    }
}

/// List raw xattr names on an open file.
pub fn flistxattr(file: &File) -> Result<Vec<String>> {
    loop {
        let len = unsafe { libc::flistxattr(file.as_raw_fd(), std::ptr::null_mut(), 0) };
        if len < 0 {
            let e = errno();
            if e == libc::EINTR {
                continue;
            }
            return Err(Error::from_errno(e, "flistxattr"));
        }
        if len == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; len as usize];
        let got = unsafe {
            libc::flistxattr(file.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len())
        };
        if got < 0 {
            let e = errno();
            if e == libc::EINTR || e == libc::ERANGE {
                continue;
            }
            return Err(Error::from_errno(e, "flistxattr"));
        }
        buf.truncate(got as usize);
        let names = buf
            .split(|&b| b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        return Ok(names);
    }
}

/// Chunk name for chunk `i` of a chained value.
fn chunk_name(base: &str, i: usize) -> String {
    if i == 0 {
        base.to_string()
    } else {
        format!("{base}@{i}")
    }
}

/// Set a possibly-chained xattr, removing stale tail chunks from a previous
/// longer value.
pub fn chain_setxattr(file: &File, base: &str, value: &[u8]) -> Result<()> {
    let chunks = value.len().div_ceil(XATTR_BLOCK_LEN).max(1);
    for i in 0..chunks {
        let lo = i * XATTR_BLOCK_LEN;
        let hi = (lo + XATTR_BLOCK_LEN).min(value.len());
        fsetxattr(file, &chunk_name(base, i), &value[lo..hi])?;
    }
    // drop chunks left over from a longer previous value
    let mut i = chunks;
    loop {
        match fremovexattr(file, &chunk_name(base, i)) {
            Ok(()) => i += 1,
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Read a possibly-chained xattr back into one buffer.
pub fn chain_getxattr(file: &File, base: &str) -> Result<Vec<u8>> {
    let mut out = fgetxattr(file, base)?;
    if out.len() < XATTR_BLOCK_LEN {
        return Ok(out);
    }
    let mut i = 1;
    loop {
        match fgetxattr(file, &chunk_name(base, i)) {
            Ok(chunk) => {
                let short = chunk.len() < XATTR_BLOCK_LEN;
                out.extend_from_slice(&chunk);
                if short {
                    break;
                }
                i += 1;
            }
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(out)
}

/// Remove a possibly-chained xattr, all chunks.
pub fn chain_removexattr(file: &File, base: &str) -> Result<()> {
    fremovexattr(file, base)?;
    let mut i = 1;
    loop {
        match fremovexattr(file, &chunk_name(base, i)) {
            Ok(()) => i += 1,
            Err(e) if e.is_no_data() => break,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// List chained attribute base names under `ATTR_PREFIX`, decoded back to the
/// user-visible names.
pub fn list_attr_names(file: &File) -> Result<Vec<String>> {
    let mut out = Vec::new();
    for raw in flistxattr(file)? {
        let Some(rest) = raw.strip_prefix(ATTR_PREFIX) else {
            continue;
        };
        // skip continuation chunks
        if rest.rsplit_once('@').is_some_and(|(_, i)| i.parse::<usize>().is_ok()) {
            continue;
        }
        out.push(unescape_attr_name(rest));
    }
    out.sort();
    Ok(out)
}

/// Full on-disk xattr name for a user attribute.
pub fn attr_xattr_name(name: &str) -> String {
    format!("{ATTR_PREFIX}{}", escape_attr_name(name))
}

/// Escape `@` and `%` so user names can never collide with chunk suffixes.
fn escape_attr_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '@' => out.push_str("%40"),
            '%' => out.push_str("%25"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape_attr_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            match hex.as_str() {
                "40" => out.push('@'),
                "25" => out.push('%'),
                other => {
                    out.push('%');
                    out.push_str(other);
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Take an exclusive, non-blocking lock on an open file.
pub fn flock_exclusive(file: &File) -> Result<()> {
    loop {
        let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if r == 0 {
            return Ok(());
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(e, "flock"));
    }
}

/// Kick off writeback for a byte range without waiting for it.
#[cfg(target_os = "linux")]
pub fn sync_file_range(file: &File, offset: u64, len: u64) -> Result<()> {
    loop {
        let r = unsafe {
            libc::sync_file_range(
                file.as_raw_fd(),
                offset as libc::off64_t,
                len as libc::off64_t,
                libc::SYNC_FILE_RANGE_WRITE,
            )
        };
        if r == 0 {
            return Ok(());
        }
        let e = errno();
        if e == libc::EINTR {
            continue;
        }
        return Err(Error::from_errno(e, "sync_file_range"));
    }
}

#[cfg(not(target_os = "linux"))]
pub fn sync_file_range(file: &File, _offset: u64, _len: u64) -> Result<()> {
    file.sync_data().map_err(|e| Error::from_io(e, "fdatasync"))
}

/// Hint that a byte range will not be needed again soon.
#[cfg(target_os = "linux")]
pub fn fadvise_dontneed(file: &File, offset: u64, len: u64) -> Result<()> {
    let r = unsafe {
        libc::posix_fadvise(
            file.as_raw_fd(),
            offset as libc::off64_t,
            len as libc::off64_t,
            libc::POSIX_FADV_DONTNEED,
        )
    };
    if r == 0 {
        Ok(())
    } else {
        Err(Error::from_errno(r, "posix_fadvise"))
    }
}

#[cfg(not(target_os = "linux"))]
pub fn fadvise_dontneed(_file: &File, _offset: u64, _len: u64) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    // tmpfs on older kernels rejects user.* xattrs, so scratch space lives
    // under the crate directory instead of /tmp.
    fn xattr_dir() -> TempDir {
        tempfile::Builder::new()
            .prefix("kiln-xattr-test")
            .tempdir_in(env!("CARGO_MANIFEST_DIR"))
            .unwrap()
    }

    fn open_probe(dir: &TempDir) -> File {
        OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .read(true)
            .open(dir.path().join("probe"))
            .unwrap()
    }

    #[test]
    fn test_chain_roundtrip_small() {
        let dir = xattr_dir();
        let f = open_probe(&dir);
        chain_setxattr(&f, "user.cephos.attr.k", b"value").unwrap();
        assert_eq!(chain_getxattr(&f, "user.cephos.attr.k").unwrap(), b"value");
    }

    #[test]
    fn test_chain_roundtrip_large_then_shrink() {
        let dir = xattr_dir();
        let f = open_probe(&dir);
        // two chunks; stays under ext4's single-block xattr capacity
        let big: Vec<u8> = (0..(XATTR_BLOCK_LEN + 100)).map(|i| i as u8).collect();
        chain_setxattr(&f, "user.cephos.attr.big", &big).unwrap();
        assert_eq!(chain_getxattr(&f, "user.cephos.attr.big").unwrap(), big);

        // shrinking must drop the stale tail chunks
        chain_setxattr(&f, "user.cephos.attr.big", b"tiny").unwrap();
        assert_eq!(chain_getxattr(&f, "user.cephos.attr.big").unwrap(), b"tiny");
    }

    #[test]
    fn test_chain_remove() {
        let dir = xattr_dir();
        let f = open_probe(&dir);
        chain_setxattr(&f, "user.cephos.attr.gone", b"x").unwrap();
        chain_removexattr(&f, "user.cephos.attr.gone").unwrap();
        assert!(chain_getxattr(&f, "user.cephos.attr.gone")
            .unwrap_err()
            .is_no_data());
    }

    #[test]
    fn test_list_attr_names_collapses_chunks() {
        let dir = xattr_dir();
        let f = open_probe(&dir);
        let big = vec![7u8; XATTR_BLOCK_LEN + 10];
        chain_setxattr(&f, &attr_xattr_name("big"), &big).unwrap();
        chain_setxattr(&f, &attr_xattr_name("small"), b"v").unwrap();
        fsetxattr(&f, "user.cephos.seq", b"guard").unwrap();

        let names = list_attr_names(&f).unwrap();
        assert_eq!(names, vec!["big".to_string(), "small".to_string()]);
    }

    #[test]
    fn test_attr_name_escaping() {
        let n = attr_xattr_name("we@ird%name");
        assert!(!n[ATTR_PREFIX.len()..].contains('@'));
        assert_eq!(unescape_attr_name(&n[ATTR_PREFIX.len()..]), "we@ird%name");
    }

    #[test]
    fn test_flock_excludes() {
        let dir = xattr_dir();
        let f1 = open_probe(&dir);
        let f2 = OpenOptions::new()
            .read(true)
            .open(dir.path().join("probe"))
            .unwrap();
        flock_exclusive(&f1).unwrap();
        assert!(matches!(flock_exclusive(&f2), Err(Error::Busy(_))));
    }
}
