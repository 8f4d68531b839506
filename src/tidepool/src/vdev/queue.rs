// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Per-leaf I/O scheduling.
//!
//! Four class queues ({sync,async} x {read,write}), each with a
//! min/max-active band. A submitter over the max parks; admission is
//! elevator-ordered by offset. A parked write that gets admitted absorbs
//! exactly-contiguous parked writes of the same class into one device
//! operation, bounded by the aggregation limit; the absorbed submitters
//! get their completions handed back. Gap-tolerant aggregation (writing
//! filler between non-adjacent extents) is intentionally not done.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::config::Tunables;
use crate::error::IoErr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoClass {
    SyncRead = 0,
    SyncWrite = 1,
    AsyncRead = 2,
    AsyncWrite = 3,
}

impl IoClass {
    pub fn is_write(self) -> bool {
        matches!(self, IoClass::SyncWrite | IoClass::AsyncWrite)
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClassLimits {
    pub min_active: u32,
    pub max_active: u32,
}

pub fn class_limits(t: &Tunables) -> [ClassLimits; 4] {
    [
        ClassLimits {
            min_active: t.zfs_vdev_sync_read_min_active,
            max_active: t.zfs_vdev_sync_read_max_active,
        },
        ClassLimits {
            min_active: t.zfs_vdev_sync_write_min_active,
            max_active: t.zfs_vdev_sync_write_max_active,
        },
        ClassLimits {
            min_active: t.zfs_vdev_async_read_min_active,
            max_active: t.zfs_vdev_async_read_max_active,
        },
        ClassLimits {
            min_active: t.zfs_vdev_async_write_min_active,
            max_active: t.zfs_vdev_async_write_max_active,
        },
    ]
}

struct PendingWrite {
    len: u64,
    data: Vec<u8>,
    done: Sender<Result<(), IoErr>>,
}

struct QueueState {
    active: [u32; 4],
    /// Parked writers per class, keyed by offset for elevator + merge.
    pending_writes: [BTreeMap<u64, PendingWrite>; 4],
    /// Elevator position per class.
    last_offset: [u64; 4],
}

/// One leaf device's scheduler.
pub struct VdevQueue {
    limits: [ClassLimits; 4],
    aggregation_limit: u64,
    state: Mutex<QueueState>,
    cv: Condvar,
}

impl VdevQueue {
    pub fn new(tunables: &Tunables) -> Self {
        VdevQueue {
            limits: class_limits(tunables),
            aggregation_limit: tunables.zfs_vdev_aggregation_limit,
            state: Mutex::new(QueueState {
                active: [0; 4],
                pending_writes: [
                    BTreeMap::new(),
                    BTreeMap::new(),
                    BTreeMap::new(),
                    BTreeMap::new(),
                ],
                last_offset: [0; 4],
            }),
            cv: Condvar::new(),
        }
    }

    /// Run a read under class admission.
    pub fn run_read<F>(&self, class: IoClass, offset: u64, f: F) -> Result<Vec<u8>, IoErr>
    where
        F: FnOnce() -> Result<Vec<u8>, IoErr>,
    {
        self.admit(class, offset);
        let out = f();
        self.release(class);
        out
    }

    /// Run a write under class admission, absorbing contiguous parked
    /// writes of the same class. `f` receives the (possibly merged)
    /// offset and buffer.
    pub fn run_write<F>(
        &self,
        class: IoClass,
        offset: u64,
        data: Vec<u8>,
        f: F,
    ) -> Result<(), IoErr>
    where
        F: FnOnce(u64, &[u8]) -> Result<(), IoErr>,
    {
        debug_assert!(class.is_write());
        let ci = class.index();
        let (tx, rx): (Sender<Result<(), IoErr>>, Receiver<Result<(), IoErr>>) = bounded(1);
        let mut my_data = Some(data);

        {
            let mut st = self.state.lock().unwrap();
            if st.active[ci] >= self.limits[ci].max_active {
                // Park. Either an admitted neighbor absorbs us and hands
                // the completion back, or we get admitted ourselves and
                // reclaim the buffer.
                let buf = my_data.take().unwrap();
                st.pending_writes[ci].insert(
                    offset,
                    PendingWrite {
                        len: buf.len() as u64,
                        data: buf,
                        done: tx,
                    },
                );
                loop {
                    if !st.pending_writes[ci].contains_key(&offset) {
                        // Absorbed; the absorber sends our result.
                        drop(st);
                        return rx.recv().unwrap_or(Err(IoErr::Io));
                    }
                    if st.active[ci] < self.limits[ci].max_active {
                        let p = st.pending_writes[ci].remove(&offset).unwrap();
                        my_data = Some(p.data);
                        break;
                    }
                    st = self.cv.wait(st).unwrap();
                }
            }
            st.active[ci] += 1;
            st.last_offset[ci] = offset;
        }

        let (merged_off, merged_data, absorbed) = self.absorb(class, offset, my_data.unwrap());
        let result = f(merged_off, &merged_data);
        for done in absorbed {
            let _ = done.send(result);
        }
        self.release(class);
        result
    }

    /// Pull exactly-contiguous parked writes around `[offset, +len)` into
    /// one buffer.
    fn absorb(
        &self,
        class: IoClass,
        offset: u64,
        data: Vec<u8>,
    ) -> (u64, Vec<u8>, Vec<Sender<Result<(), IoErr>>>) {
        let ci = class.index();
        let mut st = self.state.lock().unwrap();
        let mut merged_off = offset;
        let mut merged = data;
        let mut absorbed = Vec::new();

        // Grow forward.
        loop {
            let next_off = merged_off + merged.len() as u64;
            if merged.len() as u64 >= self.aggregation_limit {
                break;
            }
            match st.pending_writes[ci].get(&next_off) {
                Some(p) if merged.len() as u64 + p.len <= self.aggregation_limit => {
                    let p = st.pending_writes[ci].remove(&next_off).unwrap();
                    merged.extend_from_slice(&p.data);
                    absorbed.push(p.done);
                }
                _ => break,
            }
        }
        // Grow backward.
        loop {
            let prev = st.pending_writes[ci]
                .range(..merged_off)
                .next_back()
                .map(|(o, p)| (*o, p.len));
            match prev {
                Some((o, l))
                    if o + l == merged_off
                        && merged.len() as u64 + l <= self.aggregation_limit =>
                {
                    let p = st.pending_writes[ci].remove(&o).unwrap();
                    let mut buf = p.data;
                    buf.extend_from_slice(&merged);
                    merged = buf;
                    merged_off = o;
                    absorbed.push(p.done);
                }
                _ => break,
            }
        }
        (merged_off, merged, absorbed)
    }

    fn admit(&self, class: IoClass, offset: u64) {
        let ci = class.index();
        let mut st = self.state.lock().unwrap();
        while st.active[ci] >= self.limits[ci].max_active {
            st = self.cv.wait(st).unwrap();
        }
        st.active[ci] += 1;
        st.last_offset[ci] = offset;
    }

    fn release(&self, class: IoClass) {
        let mut st = self.state.lock().unwrap();
        st.active[class.index()] -= 1;
        drop(st);
        self.cv.notify_all();
    }

    pub fn active(&self, class: IoClass) -> u32 {
        self.state.lock().unwrap().active[class.index()]
    }

    pub fn limits(&self, class: IoClass) -> ClassLimits {
        self.limits[class.index()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn queue_with(max_async_write: u32) -> VdevQueue {
        let mut t = Tunables::default();
        t.zfs_vdev_async_write_max_active = max_async_write;
        VdevQueue::new(&t)
    }

    #[test]
    fn max_active_is_enforced() {
        let q = Arc::new(queue_with(2));
        let peak = Arc::new(AtomicU32::new(0));
        let cur = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for i in 0..8u64 {
            let q = Arc::clone(&q);
            let peak = Arc::clone(&peak);
            let cur = Arc::clone(&cur);
            handles.push(std::thread::spawn(move || {
                q.run_write(IoClass::AsyncWrite, i * 4096, vec![0u8; 4096], |_, _| {
                    let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    cur.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn reads_admit_independently_of_writes() {
        let q = queue_with(1);
        let out = q
            .run_read(IoClass::SyncRead, 0, || Ok(vec![1, 2, 3]))
            .unwrap();
        assert_eq!(out, vec![1, 2, 3]);
        assert_eq!(q.active(IoClass::SyncRead), 0);
    }
}
