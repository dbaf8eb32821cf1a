//! Configuration types for Kiln
//!
//! One `StoreConfig` tree covers every tunable the store recognizes. The
//! runtime-tunable subset travels in `ConfigUpdate`, applied through
//! `KilnStore::reconfigure`.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration for a Kiln store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Base directory holding fsid, superblock and `current/`
    pub base_dir: PathBuf,
    /// Journal file path (defaults to `<base_dir>/journal`)
    pub journal_path: Option<PathBuf>,
    /// Sync/commit engine tuning
    pub sync: SyncConfig,
    /// Submission queue limits
    pub queue: QueueConfig,
    /// Apply pool and finisher sizing
    pub threads: ThreadConfig,
    /// Journal sizing and throttling
    pub journal: JournalConfig,
    /// Open-file handle cache
    pub fd_cache: FdCacheConfig,
    /// Write-back throttle
    pub wb_throttle: WbThrottleConfig,
    /// Pgmeta key coalescer
    pub pgmeta: PgMetaConfig,
    /// Inline-xattr placement limits
    pub xattr: XattrConfig,
    /// Debug and fault-injection knobs
    pub debug: DebugConfig,
    /// Backend of the embedded key/value store holding the object map
    pub omap_backend: String,
    /// Upgrade on-disk stores older than the target version up to this version
    pub update_to: u32,
    /// Roll back to this named cluster snapshot at mount, if set
    pub rollback_to_cluster_snap: Option<String>,
    /// Allow rolling back over a `nosnap` marker
    pub use_stale_snap: bool,
}

impl StoreConfig {
    /// Configuration rooted at `base_dir` with defaults everywhere else.
    #[must_use]
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            journal_path: None,
            sync: SyncConfig::default(),
            queue: QueueConfig::default(),
            threads: ThreadConfig::default(),
            journal: JournalConfig::default(),
            fd_cache: FdCacheConfig::default(),
            wb_throttle: WbThrottleConfig::default(),
            pgmeta: PgMetaConfig::default(),
            xattr: XattrConfig::default(),
            debug: DebugConfig::default(),
            omap_backend: "redb".to_string(),
            update_to: 0,
            rollback_to_cluster_snap: None,
            use_stale_snap: false,
        }
    }

    /// Resolved journal path.
    #[must_use]
    pub fn journal_file(&self) -> PathBuf {
        self.journal_path
            .clone()
            .unwrap_or_else(|| self.base_dir.join("journal"))
    }
}

/// Sync/commit engine tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Lower bound between commit cycles
    pub min_interval: Duration,
    /// Upper bound between commit cycles
    pub max_interval: Duration,
    /// Abort the process if a commit stalls longer than this
    pub commit_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(10),
            max_interval: Duration::from_secs(5),
            commit_timeout: Duration::from_secs(600),
        }
    }
}

/// Submission queue limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum ops queued before submitters block (0 = unlimited)
    pub max_ops: u64,
    /// Maximum bytes queued before submitters block (0 = unlimited)
    pub max_bytes: u64,
    /// Extra ops allowed while a checkpointing backend is committing
    pub committing_max_ops: u64,
    /// Extra bytes allowed while a checkpointing backend is committing
    pub committing_max_bytes: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_ops: 50,
            max_bytes: 100 << 20,
            committing_max_ops: 500,
            committing_max_bytes: 100 << 20,
        }
    }
}

/// Apply pool and finisher sizing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThreadConfig {
    /// Apply pool worker count
    pub apply_threads: usize,
    /// Ondisk completion finisher count
    pub ondisk_finishers: usize,
    /// Apply completion finisher count
    pub apply_finishers: usize,
}

impl Default for ThreadConfig {
    fn default() -> Self {
        Self {
            apply_threads: 2,
            ondisk_finishers: 1,
            apply_finishers: 1,
        }
    }
}

/// Journal sizing and throttling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalConfig {
    /// Journal file size created by mkfs
    pub size: u64,
    /// Maximum bytes in flight before submitters block
    pub max_inflight_bytes: u64,
    /// Fraction of the journal that may fill before the sync engine is asked
    /// to commit immediately (percent)
    pub commit_pressure_pct: u8,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            size: 64 << 20,
            max_inflight_bytes: 32 << 20,
            commit_pressure_pct: 50,
        }
    }
}

/// Open-file handle cache
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FdCacheConfig {
    /// Total cached handles across all shards
    pub size: usize,
    /// Shard count for the LRU variant
    pub shards: usize,
    /// Use the random-eviction single-shard variant instead of sharded LRU
    pub random: bool,
}

impl Default for FdCacheConfig {
    fn default() -> Self {
        Self { size: 128, shards: 16, random: false }
    }
}

/// Write-back throttle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WbThrottleConfig {
    /// Independent partitions; ops hash to `sequencer_id % partitions`
    pub partitions: usize,
    /// Enable queuing writes for background write-back
    pub enable: bool,
    /// Start flushing above these
    pub bytes_low: u64,
    /// Block applies above these
    pub bytes_high: u64,
    pub ios_low: u64,
    pub ios_high: u64,
    pub objects_low: u64,
    pub objects_high: u64,
}

impl Default for WbThrottleConfig {
    fn default() -> Self {
        Self {
            partitions: 2,
            enable: true,
            bytes_low: 1 << 20,
            bytes_high: 4 << 20,
            ios_low: 500,
            ios_high: 5000,
            objects_low: 500,
            objects_high: 5000,
        }
    }
}

/// Pgmeta key coalescer
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PgMetaConfig {
    /// Shard count; objects hash to `hash(oid) % shards`
    pub shards: usize,
    /// Pending byte budget per shard before the shard is flushed
    pub shard_bytes: usize,
}

impl Default for PgMetaConfig {
    fn default() -> Self {
        Self { shards: 4, shard_bytes: 64 << 10 }
    }
}

/// Inline-xattr placement limits, per filesystem type with global overrides
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct XattrConfig {
    /// Global override for the largest value stored inline (0 = per-fs)
    pub max_inline_size: usize,
    /// Global override for the most attrs stored inline (0 = per-fs)
    pub max_inline_count: usize,
    pub max_inline_size_xfs: usize,
    pub max_inline_count_xfs: usize,
    pub max_inline_size_btrfs: usize,
    pub max_inline_count_btrfs: usize,
    pub max_inline_size_other: usize,
    pub max_inline_count_other: usize,
}

impl Default for XattrConfig {
    fn default() -> Self {
        Self {
            max_inline_size: 0,
            max_inline_count: 0,
            max_inline_size_xfs: 65536,
            max_inline_count_xfs: 10,
            max_inline_size_btrfs: 2048,
            max_inline_count_btrfs: 10,
            max_inline_size_other: 512,
            max_inline_count_other: 2,
        }
    }
}

/// Debug and fault-injection knobs
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    /// Crash the process on EIO instead of tolerating it
    pub fail_eio: bool,
    /// Track CRCs of written ranges and verify them on read
    pub sloppy_crc: bool,
    /// Abort the process when this many injection points have been crossed
    pub kill_at: u32,
    /// Stream submitted transactions to this file as JSON lines
    pub dump_file: Option<PathBuf>,
}

/// The runtime-tunable subset of `StoreConfig`. Unset fields keep their
/// current value.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigUpdate {
    pub min_sync_interval: Option<Duration>,
    pub max_sync_interval: Option<Duration>,
    pub commit_timeout: Option<Duration>,
    pub queue_max_ops: Option<u64>,
    pub queue_max_bytes: Option<u64>,
    pub queue_committing_max_ops: Option<u64>,
    pub queue_committing_max_bytes: Option<u64>,
    pub fail_eio: Option<bool>,
    pub sloppy_crc: Option<bool>,
    pub kill_at: Option<u32>,
    pub dump_file: Option<Option<PathBuf>>,
    pub fd_cache_size: Option<usize>,
    pub max_inline_xattr_size: Option<usize>,
    pub max_inline_xattr_count: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StoreConfig::new("/var/lib/kiln");
        assert_eq!(config.journal_file(), PathBuf::from("/var/lib/kiln/journal"));
        assert_eq!(config.fd_cache.shards, 16);
        assert!(config.sync.min_interval < config.sync.max_interval);
    }

    #[test]
    fn test_journal_path_override() {
        let mut config = StoreConfig::new("/data");
        config.journal_path = Some(PathBuf::from("/journal/j0"));
        assert_eq!(config.journal_file(), PathBuf::from("/journal/j0"));
    }
}
