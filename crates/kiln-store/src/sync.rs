//! Sync/commit engine
//!
//! A dedicated thread drives periodic commit cycles: fence applies, pick the
//! committing sequence, make everything up to it durable (checkpoint or
//! pgmeta-flush + syncfs), persist `commit_op_seq`, and let the journal trim.
//! A watchdog aborts the process if a cycle stalls past the configured
//! timeout.

use crate::apply::ApplyMode;
use crate::exec::Completion;
use crate::store::StoreInner;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

/// Tracks apply progress so a commit covers only fully-applied ops.
///
/// Two separate notions:
/// - a *pass* is a worker inside `do_transactions` right now; the fence
///   waits these out (they are short),
/// - an *open* op has been submitted but not finished its final apply pass;
///   these can park for a long time waiting on the journal, so the fence
///   never waits on them. The committing seq is `min(open) - 1`: the largest
///   contiguous prefix with no open op.
pub(crate) struct ApplyManager {
    state: Mutex<AmState>,
    /// signals would-be passes blocked by the fence
    unblocked_cond: Condvar,
    /// signals the fence that passes drained
    idle_cond: Condvar,
}

struct AmState {
    passes: usize,
    blocked: bool,
    committing: bool,
    open: BTreeSet<u64>,
    max_allocated: u64,
    committing_seq: u64,
    committed_seq: u64,
}

impl ApplyManager {
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(AmState {
                passes: 0,
                blocked: false,
                committing: false,
                open: BTreeSet::new(),
                max_allocated: 0,
                committing_seq: 0,
                committed_seq: 0,
            }),
            unblocked_cond: Condvar::new(),
            idle_cond: Condvar::new(),
        }
    }

    /// Seed progress from the persisted `op_seq` at mount.
    pub(crate) fn init_committed(&self, seq: u64) {
        let mut s = self.state.lock();
        s.committed_seq = seq;
        s.committing_seq = seq;
        s.max_allocated = s.max_allocated.max(seq);
    }

    /// Every allocated sequence number flows through here, ops and ack
    /// records alike.
    pub(crate) fn note_allocated(&self, seq: u64) {
        let mut s = self.state.lock();
        s.max_allocated = s.max_allocated.max(seq);
    }

    /// An op was submitted; it stays open until fully applied.
    pub(crate) fn register(&self, seq: u64) {
        self.state.lock().open.insert(seq);
    }

    /// An apply pass is about to run; waits out a commit fence.
    pub(crate) fn begin_pass(&self) {
        let mut s = self.state.lock();
        while s.blocked {
            self.unblocked_cond.wait(&mut s);
        }
        s.passes += 1;
    }

    pub(crate) fn end_pass(&self) {
        let mut s = self.state.lock();
        s.passes -= 1;
        if s.passes == 0 {
            self.idle_cond.notify_all();
        }
    }

    /// The op finished its last apply pass.
    pub(crate) fn op_done(&self, seq: u64) {
        self.state.lock().open.remove(&seq);
    }

    /// Fence applies and pick the committing seq. Returns `None` when
    /// nothing new is committable (the fence is already released).
    pub(crate) fn commit_start(&self) -> Option<u64> {
        let mut s = self.state.lock();
        s.blocked = true;
        while s.passes > 0 {
            self.idle_cond.wait(&mut s);
        }
        let cp = match s.open.first() {
            Some(lowest) => lowest - 1,
            None => s.max_allocated,
        };
        if cp <= s.committed_seq {
            s.blocked = false;
            self.unblocked_cond.notify_all();
            return None;
        }
        s.committing = true;
        s.committing_seq = cp;
        Some(cp)
    }

    /// Durability work is underway; applies may resume.
    pub(crate) fn commit_started(&self) {
        let mut s = self.state.lock();
        s.blocked = false;
        self.unblocked_cond.notify_all();
    }

    pub(crate) fn commit_finish(&self) {
        let mut s = self.state.lock();
        s.committed_seq = s.committing_seq;
        s.committing = false;
    }

    #[must_use]
    pub(crate) fn is_committing(&self) -> bool {
        self.state.lock().committing
    }

    #[must_use]
    pub(crate) fn committed_seq(&self) -> u64 {
        self.state.lock().committed_seq
    }
}

/// Aborts the process if a commit cycle stalls. Dropping the guard disarms.
pub(crate) struct CommitWatchdog {
    armed: Arc<(Mutex<bool>, Condvar)>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl CommitWatchdog {
    pub(crate) fn arm(timeout: Duration) -> Self {
        let armed = Arc::new((Mutex::new(true), Condvar::new()));
        let pair = Arc::clone(&armed);
        let thread = std::thread::Builder::new()
            .name("kiln-commit-watchdog".into())
            .spawn(move || {
                let (lock, cond) = &*pair;
                let mut g = lock.lock();
                let deadline = Instant::now() + timeout;
                while *g {
                    let now = Instant::now();
                    if now >= deadline {
                        error!("commit cycle stalled for {timeout:?}; aborting");
                        std::process::abort();
                    }
                    let _ = cond.wait_for(&mut g, deadline - now);
                }
            })
            .expect("spawn commit watchdog");
        Self { armed, thread: Some(thread) }
    }
}

impl Drop for CommitWatchdog {
    fn drop(&mut self) {
        {
            let (lock, cond) = &*self.armed;
            *lock.lock() = false;
            cond.notify_all();
        }
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

impl StoreInner {
    /// Main loop of the sync thread.
    pub(crate) fn sync_entry(self: &Arc<Self>) {
        debug!("sync thread started");
        loop {
            let (min_interval, max_interval) = {
                let t = self.tunables.lock();
                (t.min_sync_interval, t.max_sync_interval)
            };

            {
                let mut state = self.sync_state.lock();
                if state.stop {
                    break;
                }
                let start = Instant::now();
                if !state.force_sync {
                    let _ = self.sync_cond.wait_for(&mut state, max_interval);
                }
                if state.force_sync {
                    state.force_sync = false;
                } else if !state.stop {
                    // hold out for the minimum interval before committing
                    let woke = start.elapsed();
                    if woke < min_interval {
                        let _ = self.sync_cond.wait_for(&mut state, min_interval - woke);
                        state.force_sync = false;
                    }
                }
                if state.stop && state.waiters.is_empty() {
                    break;
                }
            }

            loop {
                let waiters: Vec<Completion> = {
                    let mut state = self.sync_state.lock();
                    state.waiters.drain(..).collect()
                };

                let advanced = self.commit_cycle();

                for w in waiters {
                    w(0);
                }

                let again = {
                    let state = self.sync_state.lock();
                    !state.waiters.is_empty()
                        || (!state.stop && advanced && self.journal.should_commit_now())
                };
                if !again {
                    break;
                }
                debug!("sync thread committing again without sleeping");
            }
        }
        debug!("sync thread stopped");
    }

    /// One commit cycle: fence, pick the seq, persist, unfence. Returns
    /// whether the durable seq advanced.
    pub(crate) fn commit_cycle(&self) -> bool {
        self.apply_pool.pause();
        let Some(cp) = self.apply_mgr.commit_start() else {
            self.apply_pool.unpause();
            return false;
        };
        let started = Instant::now();
        let timeout = self.tunables.lock().commit_timeout;
        let _watchdog = CommitWatchdog::arm(timeout);
        debug!("commit cycle starting at seq {cp}");

        if self.backend.can_checkpoint() {
            if let Err(e) = self.write_op_seq(cp, true) {
                error!("persisting op_seq {cp} failed: {e}");
                std::process::abort();
            }
            let name = format!("snap_{cp}");
            let token = match self.backend.create_checkpoint(&name) {
                Ok(t) => t,
                Err(e) => {
                    error!("checkpoint {name} failed: {e}");
                    std::process::abort();
                }
            };
            self.snaps.lock().push(cp);
            self.apply_mgr.commit_started();
            self.apply_pool.unpause();
            if let Err(e) = self.backend.sync_checkpoint(token) {
                error!("waiting for checkpoint {name} failed: {e}");
                std::process::abort();
            }
        } else {
            self.apply_mgr.commit_started();
            self.apply_pool.unpause();

            for shard in 0..self.pgmeta.num_shards() {
                if let Err(e) = self.pgmeta.submit_shard(shard) {
                    error!("flushing pgmeta shard {shard} failed: {e}");
                    std::process::abort();
                }
            }
            if let Err(e) = self.omap.sync(None, None) {
                error!("object map sync failed: {e}");
                std::process::abort();
            }
            if let Err(e) = self.backend.syncfs() {
                error!("syncfs failed: {e}");
                std::process::abort();
            }
            if let Err(e) = self.write_op_seq(cp, true) {
                error!("persisting op_seq {cp} failed: {e}");
                std::process::abort();
            }
        }

        self.apply_mgr.commit_finish();
        self.wbthrottle.clear();
        if let Err(e) = self.journal.committed_thru(cp) {
            error!("journal trim to {cp} failed: {e}");
        }

        // keep the two newest checkpoints
        if self.backend.can_checkpoint() {
            let mut snaps = self.snaps.lock();
            while snaps.len() > 2 {
                let old = snaps.remove(0);
                let name = format!("snap_{old}");
                if let Err(e) = self.backend.destroy_checkpoint(&name) {
                    error!("destroying old checkpoint {name} failed: {e}");
                }
            }
        }

        info!(
            "committed to op_seq {cp} in {:?}",
            started.elapsed()
        );
        true
    }

    /// Replay journaled ops newer than the committed seq through the
    /// decoder. Ack records decide how much of each op replays.
    pub(crate) fn journal_replay(&self, committed: u64) -> kiln_common::Result<u64> {
        let entries = self.journal.replay(committed)?;
        let done: std::collections::HashSet<u64> = entries
            .iter()
            .filter(|e| e.kind == crate::journal::KIND_ACK_BATCH)
            .filter_map(|e| crate::transaction::decode_ack_batch(&e.payload).ok())
            .flatten()
            .collect();

        let mut last_seq = committed;
        let mut replayed = 0u64;
        for entry in &entries {
            last_seq = last_seq.max(entry.seq);
            if entry.kind != crate::journal::KIND_TXNS {
                continue;
            }
            let txns = crate::transaction::decode_txn_list(&entry.payload)?;
            let wal = crate::transaction::classify_wal(&txns);
            let mode = if wal {
                if done.contains(&entry.seq) {
                    // fully applied before the ack record became durable
                    debug!("replay skip seq {} (acked)", entry.seq);
                    continue;
                }
                ApplyMode::Full
            } else {
                // data pass applied iff an ack record exists; without one the
                // write degrades to a touch and only the tail replays
                ApplyMode::MetadataTail { touch_data: !done.contains(&entry.seq) }
            };
            debug!("replaying seq {} ({:?})", entry.seq, mode);
            self.do_transactions(&txns, entry.seq, 0, mode);
            replayed += 1;
        }
        info!("journal replay: {replayed} ops replayed, next seq after {last_seq}");
        Ok(last_seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_manager_contiguous_prefix() {
        let am = ApplyManager::new();
        am.init_committed(1);
        for seq in [2, 3, 4] {
            am.note_allocated(seq);
            am.register(seq);
        }
        am.op_done(2);
        // 3 still open: only seq 2 is committable
        let cp = am.commit_start().unwrap();
        assert_eq!(cp, 2);
        am.commit_started();
        am.commit_finish();
        assert_eq!(am.committed_seq(), 2);

        am.op_done(3);
        am.op_done(4);
        let cp = am.commit_start().unwrap();
        assert_eq!(cp, 4);
        am.commit_started();
        am.commit_finish();
        assert_eq!(am.committed_seq(), 4);

        // nothing new
        assert!(am.commit_start().is_none());
    }

    #[test]
    fn test_apply_manager_fence_waits_for_passes() {
        let am = Arc::new(ApplyManager::new());
        am.init_committed(0);
        am.note_allocated(1);
        am.register(1);
        am.begin_pass();

        let am2 = Arc::clone(&am);
        let fence = std::thread::spawn(move || am2.commit_start());
        std::thread::sleep(Duration::from_millis(50));
        assert!(!fence.is_finished());

        am.end_pass();
        am.op_done(1);
        // the fence proceeds once the pass drains; seq 1 may or may not be
        // covered depending on when op_done lands relative to the fence
        let _ = fence.join().unwrap();
        am.commit_started();
    }

    #[test]
    fn test_watchdog_disarms_on_drop() {
        let w = CommitWatchdog::arm(Duration::from_secs(60));
        drop(w);
        // reaching here without an abort is the assertion
    }
}
