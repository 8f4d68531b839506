// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Named bounded worker pools.
//!
//! A taskq owns a fixed set of worker threads and a bounded submission
//! queue. Dispatch blocks the submitter when the queue is full; queue
//! growth is never unbounded. `wait` drains every task dispatched before
//! the call.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use threadpool::ThreadPool;

/// Tasks a single worker may have pending before dispatch blocks.
const TASKQ_DEPTH_PER_THREAD: usize = 32;

struct TaskqState {
    /// Dispatched but not yet finished.
    outstanding: Mutex<usize>,
    drained: Condvar,
    space: Condvar,
}

/// A named worker pool with a bounded queue.
pub struct Taskq {
    name: String,
    pool: ThreadPool,
    state: Arc<TaskqState>,
    max_outstanding: usize,
    dispatched: AtomicUsize,
}

impl Taskq {
    pub fn new(name: &str, nthreads: usize) -> Self {
        let nthreads = nthreads.max(1);
        Taskq {
            name: name.to_string(),
            pool: ThreadPool::with_name(name.to_string(), nthreads),
            state: Arc::new(TaskqState {
                outstanding: Mutex::new(0),
                drained: Condvar::new(),
                space: Condvar::new(),
            }),
            max_outstanding: nthreads * TASKQ_DEPTH_PER_THREAD,
            dispatched: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nthreads(&self) -> usize {
        self.pool.max_count()
    }

    /// Total tasks ever dispatched; exposed for stats.
    pub fn dispatched(&self) -> usize {
        self.dispatched.load(Ordering::Relaxed)
    }

    /// Run `task` on a worker thread. Blocks while the queue is at
    /// capacity.
    pub fn dispatch<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut outstanding = self.state.outstanding.lock().unwrap();
            while *outstanding >= self.max_outstanding {
                outstanding = self.state.space.wait(outstanding).unwrap();
            }
            *outstanding += 1;
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);

        let state = Arc::clone(&self.state);
        self.pool.execute(move || {
            task();
            let mut outstanding = state.outstanding.lock().unwrap();
            *outstanding -= 1;
            state.space.notify_one();
            if *outstanding == 0 {
                state.drained.notify_all();
            }
        });
    }

    /// Dispatch without blocking; returns false when the queue is full.
    pub fn try_dispatch<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut outstanding = self.state.outstanding.lock().unwrap();
            if *outstanding >= self.max_outstanding {
                return false;
            }
            *outstanding += 1;
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&self.state);
        self.pool.execute(move || {
            task();
            let mut outstanding = state.outstanding.lock().unwrap();
            *outstanding -= 1;
            state.space.notify_one();
            if *outstanding == 0 {
                state.drained.notify_all();
            }
        });
        true
    }

    /// Block until every task dispatched before this call has finished.
    pub fn wait(&self) {
        let mut outstanding = self.state.outstanding.lock().unwrap();
        while *outstanding != 0 {
            outstanding = self.state.drained.wait(outstanding).unwrap();
        }
    }
}

impl Drop for Taskq {
    fn drop(&mut self) {
        self.wait();
        self.pool.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn runs_all_tasks() {
        let tq = Taskq::new("tq_test", 4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..1000 {
            let c = Arc::clone(&counter);
            tq.dispatch(move || {
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        tq.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 1000);
    }

    #[test]
    fn dispatch_applies_backpressure() {
        let tq = Taskq::new("tq_slow", 1);
        let counter = Arc::new(AtomicUsize::new(0));
        // Far more tasks than the queue bound; dispatch must block rather
        // than grow the queue, and every task must still run.
        for _ in 0..(TASKQ_DEPTH_PER_THREAD * 4) {
            let c = Arc::clone(&counter);
            tq.dispatch(move || {
                std::thread::sleep(Duration::from_micros(50));
                c.fetch_add(1, Ordering::Relaxed);
            });
        }
        tq.wait();
        assert_eq!(counter.load(Ordering::Relaxed), TASKQ_DEPTH_PER_THREAD * 4);
    }

    #[test]
    fn try_dispatch_refuses_when_full() {
        let tq = Taskq::new("tq_full", 1);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        // Saturate the queue with tasks parked on the gate.
        for _ in 0..TASKQ_DEPTH_PER_THREAD {
            let g = Arc::clone(&gate);
            tq.dispatch(move || {
                let (lock, cv) = &*g;
                let mut open = lock.lock().unwrap();
                while !*open {
                    open = cv.wait(open).unwrap();
                }
            });
        }
        assert!(!tq.try_dispatch(|| {}));
        let (lock, cv) = &*gate;
        *lock.lock().unwrap() = true;
        cv.notify_all();
        tq.wait();
        assert!(tq.try_dispatch(|| {}));
        tq.wait();
    }
}
