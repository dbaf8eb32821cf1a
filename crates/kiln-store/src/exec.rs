//! Worker primitives: finishers and the apply pool
//!
//! A `Finisher` is a single thread draining completion callbacks in FIFO
//! order; everything queued on one finisher fires in queue order, which is
//! what gives completions their per-sequencer ordering. The `ApplyPool` is a
//! fixed set of workers consuming ready items; the sync engine pauses it
//! around the commit fence.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::debug;

/// A completion callback carrying a result code.
pub type Completion = Box<dyn FnOnce(i32) + Send + 'static>;

#[derive(Default)]
struct FinisherState {
    queue: VecDeque<(Completion, i32)>,
    running: bool,
    stop: bool,
}

struct FinisherInner {
    state: Mutex<FinisherState>,
    cond: Condvar,
    empty_cond: Condvar,
}

/// Single-threaded ordered completion runner.
pub struct Finisher {
    inner: Arc<FinisherInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
    name: String,
}

impl Finisher {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FinisherInner {
                state: Mutex::new(FinisherState::default()),
                cond: Condvar::new(),
                empty_cond: Condvar::new(),
            }),
            thread: Mutex::new(None),
            name: name.into(),
        }
    }

    pub fn start(&self) {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();
        *thread = Some(
            std::thread::Builder::new()
                .name(name)
                .spawn(move || {
                    let mut state = inner.state.lock();
                    loop {
                        while state.queue.is_empty() && !state.stop {
                            inner.cond.wait(&mut state);
                        }
                        if state.queue.is_empty() && state.stop {
                            break;
                        }
                        let (callback, result) = state.queue.pop_front().unwrap();
                        state.running = true;
                        drop(state);
                        callback(result);
                        state = inner.state.lock();
                        state.running = false;
                        if state.queue.is_empty() {
                            inner.empty_cond.notify_all();
                        }
                    }
                })
                .expect("spawn finisher"),
        );
    }

    /// Queue a completion with result 0.
    pub fn queue(&self, callback: Completion) {
        self.queue_with(callback, 0);
    }

    pub fn queue_with(&self, callback: Completion, result: i32) {
        let mut state = self.inner.state.lock();
        state.queue.push_back((callback, result));
        self.inner.cond.notify_one();
    }

    /// Block until everything queued so far has run.
    pub fn wait_for_empty(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.running {
            self.inner.empty_cond.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
            self.inner.cond.notify_all();
        }
        if let Some(t) = self.thread.lock().take() {
            let _ = t.join();
        }
        self.inner.state.lock().stop = false;
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PoolState<T> {
    queue: VecDeque<T>,
    active: usize,
    paused: bool,
    stop: bool,
}

struct PoolInner<T> {
    state: Mutex<PoolState<T>>,
    /// wakes workers
    cond: Condvar,
    /// wakes pause/drain waiters
    idle_cond: Condvar,
}

/// Fixed-size worker pool over ready items.
pub struct ApplyPool<T: Send + 'static> {
    inner: Arc<PoolInner<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> ApplyPool<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    active: 0,
                    paused: false,
                    stop: false,
                }),
                cond: Condvar::new(),
                idle_cond: Condvar::new(),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Start `n` workers running `handler` per item.
    pub fn start<F>(&self, n: usize, name: &str, handler: F)
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }
        let handler = Arc::new(handler);
        for i in 0..n.max(1) {
            let inner = Arc::clone(&self.inner);
            let handler = Arc::clone(&handler);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("{name}-{i}"))
                    .spawn(move || {
                        let mut state = inner.state.lock();
                        loop {
                            while (state.queue.is_empty() || state.paused) && !state.stop {
                                inner.cond.wait(&mut state);
                            }
                            if state.stop && (state.queue.is_empty() || state.paused) {
                                break;
                            }
                            let item = state.queue.pop_front().unwrap();
                            state.active += 1;
                            drop(state);
                            handler(item);
                            state = inner.state.lock();
                            state.active -= 1;
                            inner.idle_cond.notify_all();
                        }
                    })
                    .expect("spawn apply worker"),
            );
        }
        debug!("started {} {name} workers", n.max(1));
    }

    pub fn queue(&self, item: T) {
        let mut state = self.inner.state.lock();
        state.queue.push_back(item);
        self.inner.cond.notify_one();
    }

    /// Stop dispatching and wait for in-flight items to finish.
    pub fn pause(&self) {
        let mut state = self.inner.state.lock();
        state.paused = true;
        while state.active > 0 {
            self.inner.idle_cond.wait(&mut state);
        }
    }

    pub fn unpause(&self) {
        let mut state = self.inner.state.lock();
        state.paused = false;
        self.inner.cond.notify_all();
    }

    /// Wait until the queue is empty and no worker is mid-item.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock();
        while !state.queue.is_empty() || state.active > 0 {
            self.inner.idle_cond.wait(&mut state);
        }
    }

    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stop = true;
            self.inner.cond.notify_all();
        }
        for t in self.threads.lock().drain(..) {
            let _ = t.join();
        }
        let mut state = self.inner.state.lock();
        state.stop = false;
        state.paused = false;
    }
}

impl<T: Send + 'static> Default for ApplyPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_finisher_runs_in_order() {
        let f = Finisher::new("test-finisher");
        f.start();
        let (tx, rx) = mpsc::channel();
        for i in 0..10 {
            let tx = tx.clone();
            f.queue(Box::new(move |_| tx.send(i).unwrap()));
        }
        f.wait_for_empty();
        let got: Vec<i32> = rx.try_iter().collect();
        assert_eq!(got, (0..10).collect::<Vec<_>>());
        f.stop();
    }

    #[test]
    fn test_finisher_result_codes() {
        let f = Finisher::new("test-finisher");
        f.start();
        let (tx, rx) = mpsc::channel();
        f.queue_with(Box::new(move |r| tx.send(r).unwrap()), -5);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), -5);
        f.stop();
    }

    #[test]
    fn test_pool_processes_everything() {
        let pool: ApplyPool<usize> = ApplyPool::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        pool.start(3, "test-pool", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        for i in 0..50 {
            pool.queue(i);
        }
        pool.drain();
        assert_eq!(count.load(Ordering::SeqCst), 50);
        pool.stop();
    }

    #[test]
    fn test_pool_pause_blocks_dispatch() {
        let pool: ApplyPool<usize> = ApplyPool::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        pool.start(2, "test-pool", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        pool.pause();
        pool.queue(1);
        pool.queue(2);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        pool.unpause();
        pool.drain();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        pool.stop();
    }
}
