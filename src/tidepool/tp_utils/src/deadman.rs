// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Hung-operation watchdog.
//!
//! Callers register an operation with a deadline class; a background
//! thread periodically scans the outstanding set and fires the expiry
//! callback once per overdue operation. What the callback does (log an
//! event, panic, suspend a pool) is the owner's policy, not ours.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

/// Which limit applies to a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    /// A single device-level I/O (`ziotime_ms`).
    Io,
    /// A whole transaction-group sync (`synctime_ms`).
    Sync,
}

#[derive(Debug, Clone)]
pub struct DeadmanConfig {
    pub synctime_ms: u64,
    pub ziotime_ms: u64,
    /// Scan cadence.
    pub check_interval_ms: u64,
}

impl Default for DeadmanConfig {
    fn default() -> Self {
        DeadmanConfig {
            synctime_ms: 600_000,
            ziotime_ms: 300_000,
            check_interval_ms: 1_000,
        }
    }
}

struct TrackedOp {
    class: OpClass,
    desc: String,
    start: Instant,
    reported: bool,
}

struct DeadmanInner {
    config: DeadmanConfig,
    ops: Mutex<HashMap<u64, TrackedOp>>,
    shutdown: AtomicBool,
    kick: Condvar,
    kick_lock: Mutex<()>,
    next_id: AtomicU64,
    callback: Box<dyn Fn(OpClass, &str, Duration) + Send + Sync>,
}

/// RAII registration of an operation with the watchdog.
pub struct DeadmanHandle {
    inner: Arc<DeadmanInner>,
    id: u64,
}

impl Drop for DeadmanHandle {
    fn drop(&mut self) {
        self.inner.ops.lock().unwrap().remove(&self.id);
    }
}

pub struct Deadman {
    inner: Arc<DeadmanInner>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Deadman {
    pub fn new<F>(config: DeadmanConfig, callback: F) -> Self
    where
        F: Fn(OpClass, &str, Duration) + Send + Sync + 'static,
    {
        let inner = Arc::new(DeadmanInner {
            config,
            ops: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            kick: Condvar::new(),
            kick_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
            callback: Box::new(callback),
        });
        let scan_inner = Arc::clone(&inner);
        let thread = thread::Builder::new()
            .name("deadman".to_string())
            .spawn(move || Self::scan_loop(scan_inner))
            .expect("spawn deadman thread");
        Deadman {
            inner,
            thread: Some(thread),
        }
    }

    fn scan_loop(inner: Arc<DeadmanInner>) {
        let interval = Duration::from_millis(inner.config.check_interval_ms.max(10));
        loop {
            {
                let guard = inner.kick_lock.lock().unwrap();
                let _ = inner.kick.wait_timeout(guard, interval).unwrap();
            }
            if inner.shutdown.load(Ordering::Acquire) {
                return;
            }
            let now = Instant::now();
            let mut fired = Vec::new();
            {
                let mut ops = inner.ops.lock().unwrap();
                for op in ops.values_mut() {
                    if op.reported {
                        continue;
                    }
                    let limit = match op.class {
                        OpClass::Io => inner.config.ziotime_ms,
                        OpClass::Sync => inner.config.synctime_ms,
                    };
                    let elapsed = now.duration_since(op.start);
                    if elapsed >= Duration::from_millis(limit) {
                        op.reported = true;
                        fired.push((op.class, op.desc.clone(), elapsed));
                    }
                }
            }
            for (class, desc, elapsed) in fired {
                warn!(
                    "deadman: {:?} operation '{}' outstanding for {}ms",
                    class,
                    desc,
                    elapsed.as_millis()
                );
                (inner.callback)(class, &desc, elapsed);
            }
        }
    }

    /// Track an operation until the returned handle drops.
    pub fn track(&self, class: OpClass, desc: String) -> DeadmanHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.ops.lock().unwrap().insert(
            id,
            TrackedOp {
                class,
                desc,
                start: Instant::now(),
                reported: false,
            },
        );
        DeadmanHandle {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inner.ops.lock().unwrap().len()
    }
}

impl Drop for Deadman {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.kick.notify_all();
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn fires_once_per_overdue_op() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let dm = Deadman::new(
            DeadmanConfig {
                synctime_ms: 10_000,
                ziotime_ms: 20,
                check_interval_ms: 10,
            },
            move |_, _, _| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        let handle = dm.track(OpClass::Io, "read vdev0".to_string());
        thread::sleep(Duration::from_millis(150));
        assert_eq!(fired.load(Ordering::SeqCst), 1, "reported exactly once");
        drop(handle);
        assert_eq!(dm.outstanding(), 0);
    }

    #[test]
    fn completed_op_never_fires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&fired);
        let dm = Deadman::new(
            DeadmanConfig {
                synctime_ms: 10_000,
                ziotime_ms: 50,
                check_interval_ms: 10,
            },
            move |_, _, _| {
                f.fetch_add(1, Ordering::SeqCst);
            },
        );
        let handle = dm.track(OpClass::Io, "fast io".to_string());
        drop(handle);
        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
