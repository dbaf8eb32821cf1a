//! Ops and sequencers
//!
//! A sequencer is the caller's ordering token: every op submitted on it
//! applies and completes in submission order. An op is one batched
//! transaction bundle moving through the pipeline
//! `INIT -> WRITE/JOURNAL -> COMMIT -> ACK -> DONE`; the sequencer's FIFO
//! owns the op for its whole life, callbacks and the journal hold only
//! non-owning references.

use crate::exec::Completion;
use crate::transaction::Transaction;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Pipeline state of an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpState {
    /// Submitted; first apply pass not finished.
    Init,
    /// Apply pass done, journal ack outstanding.
    Write,
    /// Journal ack arrived before the apply pass finished.
    Journal,
    /// Applied and journaled; queued for the ack record.
    Commit,
    /// Ack record durable; final pass pending.
    Ack,
    Done,
}

/// Completion callbacks attached to a submitted op.
#[derive(Default)]
pub struct OpCallbacks {
    /// Fires when the op is durable in the journal.
    pub ondisk: Option<Completion>,
    /// Fires after apply, via the apply finisher.
    pub onreadable: Option<Completion>,
    /// Fires after apply, under the sequencer apply lock; must not block.
    pub onreadable_sync: Option<Completion>,
}

/// One batched transaction bundle in flight.
pub struct Op {
    seq: AtomicU64,
    pub start: Instant,
    pub txns: Vec<Transaction>,
    pub wal: bool,
    pub num_ops: u64,
    pub num_bytes: u64,
    state: Mutex<OpState>,
    callbacks: Mutex<OpCallbacks>,
    osr: Weak<OpSequencer>,
}

impl Op {
    #[must_use]
    pub fn new(txns: Vec<Transaction>, wal: bool, callbacks: OpCallbacks, osr: &Arc<OpSequencer>)
        -> Arc<Self> {
        let num_ops = txns.iter().map(Transaction::num_ops).sum();
        let num_bytes = txns.iter().map(Transaction::num_bytes).sum();
        Arc::new(Self {
            seq: AtomicU64::new(0),
            start: Instant::now(),
            txns,
            wal,
            num_ops,
            num_bytes,
            state: Mutex::new(OpState::Init),
            callbacks: Mutex::new(callbacks),
            osr: Arc::downgrade(osr),
        })
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn set_seq(&self, seq: u64) {
        self.seq.store(seq, Ordering::SeqCst);
    }

    #[must_use]
    pub fn state(&self) -> OpState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: OpState) {
        *self.state.lock() = state;
    }

    /// The owning sequencer, while it is still alive.
    #[must_use]
    pub fn sequencer(&self) -> Option<Arc<OpSequencer>> {
        self.osr.upgrade()
    }

    pub fn take_ondisk(&self) -> Option<Completion> {
        self.callbacks.lock().ondisk.take()
    }

    pub fn take_onreadable(&self) -> Option<Completion> {
        self.callbacks.lock().onreadable.take()
    }

    pub fn take_onreadable_sync(&self) -> Option<Completion> {
        self.callbacks.lock().onreadable_sync.take()
    }
}

#[derive(Default)]
struct SeqQueues {
    /// Ops ready for (or between) apply passes.
    q: VecDeque<Arc<Op>>,
    /// Every in-flight op, submission order, for flush tracking.
    inq: VecDeque<u64>,
    /// Seqs with an outstanding journal ack.
    journal_q: VecDeque<u64>,
}

/// One caller-visible ordering domain.
pub struct OpSequencer {
    pub id: u64,
    pub name: String,
    queues: Mutex<SeqQueues>,
    /// Held across an apply pass; strict FIFO within the sequencer.
    pub apply_lock: Mutex<()>,
}

impl OpSequencer {
    #[must_use]
    pub fn new(id: u64, name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id,
            name: name.into(),
            queues: Mutex::new(SeqQueues::default()),
            apply_lock: Mutex::new(()),
        })
    }

    pub fn queue(&self, op: Arc<Op>) {
        self.queues.lock().q.push_back(op);
    }

    /// Front of the apply FIFO; panics if empty (a scheduling bug).
    #[must_use]
    pub fn peek_queue(&self) -> Arc<Op> {
        self.queues.lock().q.front().cloned().expect("sequencer queue empty")
    }

    pub fn dequeue(&self) -> Arc<Op> {
        self.queues.lock().q.pop_front().expect("sequencer queue empty")
    }

    pub fn queue_inq(&self, seq: u64) {
        self.queues.lock().inq.push_back(seq);
    }

    pub fn dequeue_inq(&self) -> Option<u64> {
        self.queues.lock().inq.pop_front()
    }

    pub fn queue_journal(&self, seq: u64) {
        self.queues.lock().journal_q.push_back(seq);
    }

    pub fn dequeue_journal(&self) -> Option<u64> {
        self.queues.lock().journal_q.pop_front()
    }

    /// In-flight op count (submitted, not yet done).
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.queues.lock().inq.len()
    }
}

impl std::fmt::Debug for OpSequencer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "osr({}/{})", self.id, self.name)
    }
}

/// Owner of every sequencer, keyed by name. Sequencers outlive all their
/// ops by construction.
pub struct SequencerRegistry {
    next_id: AtomicU64,
    map: Mutex<HashMap<String, Arc<OpSequencer>>>,
}

impl SequencerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(0), map: Mutex::new(HashMap::new()) }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<OpSequencer> {
        let mut map = self.map.lock();
        if let Some(osr) = map.get(name) {
            return Arc::clone(osr);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let osr = OpSequencer::new(id, name);
        map.insert(name.to_string(), Arc::clone(&osr));
        osr
    }

    /// Every live sequencer.
    pub fn all(&self) -> Vec<Arc<OpSequencer>> {
        self.map.lock().values().cloned().collect()
    }
}

impl Default for SequencerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Submission-queue throttle: bounds queued ops and bytes across the store.
pub struct OpThrottle {
    state: Mutex<(u64, u64)>,
    cond: Condvar,
}

impl OpThrottle {
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new((0, 0)), cond: Condvar::new() }
    }

    /// Block until the op fits under the limits, then reserve its slot.
    /// A zero limit means unlimited; a single op larger than the byte limit
    /// is let through once the queue is otherwise empty.
    pub fn reserve(&self, max_ops: u64, max_bytes: u64, op_bytes: u64) {
        let mut state = self.state.lock();
        loop {
            let (len, bytes) = *state;
            let ops_block = max_ops != 0 && len + 1 > max_ops;
            let bytes_block = max_bytes != 0 && bytes != 0 && bytes + op_bytes > max_bytes;
            if !ops_block && !bytes_block {
                break;
            }
            self.cond.wait(&mut state);
        }
        state.0 += 1;
        state.1 += op_bytes;
    }

    pub fn release(&self, op_bytes: u64) {
        let mut state = self.state.lock();
        state.0 -= 1;
        state.1 -= op_bytes;
        self.cond.notify_all();
    }

    #[must_use]
    pub fn queued(&self) -> (u64, u64) {
        *self.state.lock()
    }
}

impl Default for OpThrottle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_registry_reuses_by_name() {
        let reg = SequencerRegistry::new();
        let a = reg.get_or_create("osd.1");
        let b = reg.get_or_create("osd.1");
        let c = reg.get_or_create("osd.2");
        assert!(Arc::ptr_eq(&a, &b));
        assert_ne!(a.id, c.id);
        assert_eq!(reg.all().len(), 2);
    }

    #[test]
    fn test_sequencer_fifo() {
        let osr = OpSequencer::new(0, "t");
        let op1 = Op::new(vec![], true, OpCallbacks::default(), &osr);
        let op2 = Op::new(vec![], true, OpCallbacks::default(), &osr);
        op1.set_seq(1);
        op2.set_seq(2);
        osr.queue(Arc::clone(&op1));
        osr.queue(Arc::clone(&op2));

        assert_eq!(osr.peek_queue().seq(), 1);
        assert_eq!(osr.dequeue().seq(), 1);
        assert_eq!(osr.dequeue().seq(), 2);
    }

    #[test]
    fn test_op_state_and_callbacks() {
        let osr = OpSequencer::new(0, "t");
        let callbacks = OpCallbacks {
            ondisk: Some(Box::new(|_| {})),
            onreadable: None,
            onreadable_sync: None,
        };
        let op = Op::new(vec![], false, callbacks, &osr);
        assert_eq!(op.state(), OpState::Init);
        op.set_state(OpState::Write);
        assert_eq!(op.state(), OpState::Write);
        assert!(op.take_ondisk().is_some());
        assert!(op.take_ondisk().is_none());
        assert!(op.sequencer().is_some());
        drop(osr);
        assert!(op.sequencer().is_none());
    }

    #[test]
    fn test_throttle_blocks_on_ops_limit() {
        let throttle = Arc::new(OpThrottle::new());
        throttle.reserve(1, 0, 10);

        let t2 = Arc::clone(&throttle);
        let waiter = std::thread::spawn(move || {
            t2.reserve(1, 0, 5);
            t2.release(5);
        });
        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        throttle.release(10);
        waiter.join().unwrap();
        assert_eq!(throttle.queued(), (0, 0));
    }

    #[test]
    fn test_throttle_lets_single_large_op_through() {
        let throttle = OpThrottle::new();
        // queue empty: a 1 MiB op passes a 4 KiB limit
        throttle.reserve(0, 4096, 1 << 20);
        assert_eq!(throttle.queued(), (1, 1 << 20));
        throttle.release(1 << 20);
    }
}
