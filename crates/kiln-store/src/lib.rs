//! Kiln Storage Engine - journaled object store on a POSIX filesystem
//!
//! This crate implements the Kiln store core:
//! - Write-ahead journaling with atomic transaction bundles
//! - Per-sequencer FIFO apply and completion ordering
//! - Crash recovery via journal replay with replay guards
//! - Periodic commit cycles persisting the durable `op_seq`
//! - Open-file handle caching, write-back throttling and pgmeta key
//!   coalescing around the apply path
//! - An embedded object map (redb) for omap data and spilled attributes

pub mod apply;
pub mod backend;
pub mod exec;
pub mod fdcache;
pub mod fs_util;
pub mod guard;
pub mod index;
pub mod journal;
pub mod omap;
pub mod pgmeta;
pub mod sequencer;
pub mod store;
pub mod sync;
pub mod transaction;
pub mod wbthrottle;

// Re-exports
pub use backend::{FsBackend, GenericBackend};
pub use exec::{Completion, Finisher};
pub use fdcache::{FdCache, FdRef};
pub use guard::{GuardCheck, GLOBAL_REPLAY_GUARD_XATTR, REPLAY_GUARD_XATTR, SPILL_OUT_XATTR};
pub use journal::{FileJournal, JournalEntry};
pub use omap::OmapStore;
pub use pgmeta::PgMetaCache;
pub use sequencer::{OpCallbacks, OpState};
pub use store::{KilnStore, SequencerHandle, Superblock, STORE_VERSION};
pub use transaction::{classify_wal, Transaction, TxOp};
pub use wbthrottle::WbThrottle;
