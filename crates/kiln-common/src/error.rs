//! Error types for Kiln
//!
//! This module defines the common error type used throughout the store.
//! Errors coming out of the syscall layer are mapped to semantic variants at
//! the boundary so that replay-tolerance decisions never have to parse
//! message strings.

use thiserror::Error;

/// Common result type for Kiln operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Kiln
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    Exists(String),

    #[error("no such attribute: {0}")]
    NoData(String),

    #[error("value out of range: {0}")]
    Range(String),

    #[error("no space left on device")]
    NoSpace,

    #[error("operation not supported: {0}")]
    Unsupported(String),

    #[error("store is busy: {0}")]
    Busy(String),

    #[error("data corruption detected: {0}")]
    Corrupt(String),

    #[error("incompatible store: {0}")]
    Incompatible(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("key/value store error: {0}")]
    Kv(String),
}

impl Error {
    /// Map a raw OS errno into the matching semantic variant.
    pub fn from_errno(errno: i32, what: impl Into<String>) -> Self {
        let what = what.into();
        match errno {
            libc_errno::ENOENT => Self::NotFound(what),
            libc_errno::EEXIST => Self::Exists(what),
            libc_errno::ENODATA => Self::NoData(what),
            libc_errno::ERANGE => Self::Range(what),
            libc_errno::ENOSPC => Self::NoSpace,
            libc_errno::EOPNOTSUPP => Self::Unsupported(what),
            libc_errno::EWOULDBLOCK => Self::Busy(what),
            _ => Self::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }

    /// Map an `std::io::Error` into the matching semantic variant.
    pub fn from_io(err: std::io::Error, what: impl Into<String>) -> Self {
        match err.raw_os_error() {
            Some(errno) => Self::from_errno(errno, what),
            None => Self::Io(err),
        }
    }

    /// Check if this is a not-found error (absent object, collection or key).
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }

    /// Check if this is an already-exists error.
    #[must_use]
    pub fn is_exists(&self) -> bool {
        matches!(self, Self::Exists(_))
            || matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::AlreadyExists)
    }

    /// Check if this is a missing-attribute error.
    #[must_use]
    pub fn is_no_data(&self) -> bool {
        matches!(self, Self::NoData(_))
    }

    /// Check if this error carries `EIO` from the kernel.
    #[must_use]
    pub fn is_eio(&self) -> bool {
        matches!(self, Self::Io(e) if e.raw_os_error() == Some(libc_errno::EIO))
    }

    /// The raw errno behind this error, when one exists.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self {
            Self::Io(e) => e.raw_os_error(),
            Self::NotFound(_) => Some(libc_errno::ENOENT),
            Self::Exists(_) => Some(libc_errno::EEXIST),
            Self::NoData(_) => Some(libc_errno::ENODATA),
            Self::Range(_) => Some(libc_errno::ERANGE),
            Self::NoSpace => Some(libc_errno::ENOSPC),
            Self::Unsupported(_) => Some(libc_errno::EOPNOTSUPP),
            Self::Busy(_) => Some(libc_errno::EWOULDBLOCK),
            _ => None,
        }
    }
}

/// The handful of errno values the error mapping cares about, kept here so
/// this crate does not need a libc dependency.
mod libc_errno {
    pub const EIO: i32 = 5;
    pub const EEXIST: i32 = 17;
    pub const ENOENT: i32 = 2;
    pub const ENOSPC: i32 = 28;
    pub const ERANGE: i32 = 34;
    pub const EWOULDBLOCK: i32 = 11;
    pub const ENODATA: i32 = 61;
    pub const EOPNOTSUPP: i32 = 95;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert!(Error::from_errno(2, "x").is_not_found());
        assert!(Error::from_errno(17, "x").is_exists());
        assert!(Error::from_errno(61, "x").is_no_data());
        assert!(matches!(Error::from_errno(28, "x"), Error::NoSpace));
        assert!(matches!(Error::from_errno(95, "x"), Error::Unsupported(_)));
    }

    #[test]
    fn test_errno_roundtrip() {
        assert_eq!(Error::from_errno(2, "x").errno(), Some(2));
        assert_eq!(Error::from_errno(28, "x").errno(), Some(28));
        assert_eq!(Error::from_errno(5, "x").errno(), Some(5));
        assert!(Error::from_errno(5, "x").is_eio());
    }

    #[test]
    fn test_io_kind_predicates() {
        let e = Error::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(e.is_not_found());
    }
}
