//! Open-file handle cache
//!
//! Keeps hot object files open so the apply path skips the open/close pair
//! on every write. Two interchangeable layouts: a sharded LRU keyed by
//! `hash(oid) % shards`, and a random-eviction single shard. Handles carry
//! counters for outstanding async I/O and truncates; a handle's file is only
//! closed once both counters drain.

use kiln_common::ObjectId;
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::fs::File;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared reference to a cached open file.
pub type FdRef = Arc<FdHandle>;

/// An open object file plus its outstanding-work counters.
pub struct FdHandle {
    file: File,
    aio: AtomicU32,
    truncates: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl FdHandle {
    #[must_use]
    pub fn new(file: File) -> Self {
        Self {
            file,
            aio: AtomicU32::new(0),
            truncates: AtomicU32::new(0),
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    #[must_use]
    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn inc_aio(&self) {
        self.aio.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_aio(&self) {
        let _guard = self.lock.lock();
        let prev = self.aio.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        self.cond.notify_all();
    }

    pub fn inc_truncate(&self) {
        self.truncates.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_truncate(&self) {
        let _guard = self.lock.lock();
        let prev = self.truncates.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0);
        self.cond.notify_all();
    }

    #[must_use]
    pub fn has_aio(&self) -> bool {
        self.aio.load(Ordering::SeqCst) > 0
    }

    #[must_use]
    pub fn has_truncate(&self) -> bool {
        self.truncates.load(Ordering::SeqCst) > 0
    }

    /// Block until outstanding async I/O drains.
    pub fn wait_idle(&self) {
        let mut guard = self.lock.lock();
        while self.aio.load(Ordering::SeqCst) > 0 || self.truncates.load(Ordering::SeqCst) > 0 {
            self.cond.wait(&mut guard);
        }
    }
}

impl Drop for FdHandle {
    fn drop(&mut self) {
        // the fd closes only after every queued write-back let go
        self.wait_idle();
    }
}

struct Entry {
    handle: FdRef,
    last_access: u64,
}

#[derive(Default)]
struct Shard {
    map: HashMap<ObjectId, Entry>,
}

impl Shard {
    fn evict_to(&mut self, max: usize) {
        while self.map.len() > max {
            let victim = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    self.map.remove(&k);
                }
                None => break,
            }
        }
    }
}

/// Bounded cache of open object files.
pub struct FdCache {
    shards: Vec<Mutex<Shard>>,
    per_shard: RwLock<usize>,
    clock: AtomicU64,
    random: bool,
    tick: AtomicU64,
}

impl FdCache {
    /// `random` selects the single-shard random-eviction layout; otherwise a
    /// sharded LRU with `max(1, size / shards)` handles per shard.
    #[must_use]
    pub fn new(size: usize, shards: usize, random: bool) -> Self {
        let shard_count = if random { 1 } else { shards.max(1) };
        let per_shard = Self::shard_budget(size, shard_count);
        Self {
            shards: (0..shard_count).map(|_| Mutex::new(Shard::default())).collect(),
            per_shard: RwLock::new(per_shard),
            clock: AtomicU64::new(0),
            random,
            tick: AtomicU64::new(0),
        }
    }

    fn shard_budget(size: usize, shards: usize) -> usize {
        (size / shards).max(1)
    }

    fn shard_for(&self, oid: &ObjectId) -> &Mutex<Shard> {
        let idx = if self.random {
            0
        } else {
            oid.hash() as usize % self.shards.len()
        };
        &self.shards[idx]
    }

    /// Return the cached handle for an object, if any.
    pub fn lookup(&self, oid: &ObjectId) -> Option<FdRef> {
        let mut shard = self.shard_for(oid).lock();
        let entry = shard.map.get_mut(oid)?;
        entry.last_access = self.clock.fetch_add(1, Ordering::Relaxed);
        Some(entry.handle.clone())
    }

    /// Install a handle for an object. If a concurrent insertion won,
    /// `existed` is set and the already-cached handle is returned; the
    /// caller's file is dropped (closed) here.
    pub fn add(&self, oid: &ObjectId, file: File, existed: &mut bool) -> FdRef {
        let max = *self.per_shard.read();
        let mut shard = self.shard_for(oid).lock();
        if let Some(entry) = shard.map.get_mut(oid) {
            *existed = true;
            entry.last_access = self.clock.fetch_add(1, Ordering::Relaxed);
            return entry.handle.clone();
        }
        *existed = false;
        let handle: FdRef = Arc::new(FdHandle::new(file));
        let last_access = if self.random {
            // random layout: eviction order ignores recency
            self.tick.fetch_add(1, Ordering::Relaxed) ^ 0x9e37_79b9
        } else {
            self.clock.fetch_add(1, Ordering::Relaxed)
        };
        shard.map.insert(oid.clone(), Entry { handle: handle.clone(), last_access });
        shard.evict_to(max);
        handle
    }

    /// Drop the cached handle for an object; later lookups miss.
    pub fn clear(&self, oid: &ObjectId) {
        let mut shard = self.shard_for(oid).lock();
        shard.map.remove(oid);
    }

    /// Rebalance shard budgets after a size change.
    pub fn set_size(&self, size: usize) {
        let budget = Self::shard_budget(size, self.shards.len());
        *self.per_shard.write() = budget;
        for shard in &self.shards {
            shard.lock().evict_to(budget);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().map.len()).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_file(dir: &std::path::Path, name: &str) -> File {
        std::fs::File::create(dir.join(name)).unwrap()
    }

    #[test]
    fn test_lookup_miss_then_add() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(16, 4, false);
        let oid = ObjectId::new("a", 0, 0);

        assert!(cache.lookup(&oid).is_none());
        let mut existed = true;
        cache.add(&oid, open_file(dir.path(), "a"), &mut existed);
        assert!(!existed);
        assert!(cache.lookup(&oid).is_some());
    }

    #[test]
    fn test_add_returns_winner_on_race() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(16, 4, false);
        let oid = ObjectId::new("a", 0, 0);

        let mut existed = false;
        let first = cache.add(&oid, open_file(dir.path(), "a"), &mut existed);
        let second = cache.add(&oid, open_file(dir.path(), "a2"), &mut existed);
        assert!(existed);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_clear_removes_mapping() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(16, 4, false);
        let oid = ObjectId::new("a", 0, 0);
        let mut existed = false;
        cache.add(&oid, open_file(dir.path(), "a"), &mut existed);
        cache.clear(&oid);
        assert!(cache.lookup(&oid).is_none());
    }

    #[test]
    fn test_lru_eviction_prefers_cold_entries() {
        let dir = tempdir().unwrap();
        // one shard, two slots
        let cache = FdCache::new(2, 1, false);
        let hot = ObjectId::new("hot", 0, 0);
        let cold = ObjectId::new("cold", 0, 0);
        let newer = ObjectId::new("newer", 0, 0);
        let mut existed = false;

        cache.add(&hot, open_file(dir.path(), "hot"), &mut existed);
        cache.add(&cold, open_file(dir.path(), "cold"), &mut existed);
        cache.lookup(&hot);
        cache.add(&newer, open_file(dir.path(), "newer"), &mut existed);

        assert!(cache.lookup(&hot).is_some());
        assert!(cache.lookup(&cold).is_none());
    }

    #[test]
    fn test_set_size_rebalances() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(8, 1, false);
        let mut existed = false;
        for i in 0..8 {
            cache.add(
                &ObjectId::new(format!("o{i}"), 0, 0),
                open_file(dir.path(), &format!("o{i}")),
                &mut existed,
            );
        }
        assert_eq!(cache.len(), 8);
        cache.set_size(2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_random_layout_single_shard() {
        let dir = tempdir().unwrap();
        let cache = FdCache::new(4, 8, true);
        let mut existed = false;
        for i in 0..10 {
            cache.add(
                &ObjectId::new(format!("o{i}"), 0, 0),
                open_file(dir.path(), &format!("o{i}")),
                &mut existed,
            );
        }
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_handle_counters() {
        let dir = tempdir().unwrap();
        let handle = FdHandle::new(open_file(dir.path(), "h"));
        handle.inc_aio();
        assert!(handle.has_aio());
        handle.dec_aio();
        assert!(!handle.has_aio());
        handle.inc_truncate();
        assert!(handle.has_truncate());
        handle.dec_truncate();
        handle.wait_idle();
    }
}
