// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Error-report events.
//!
//! Every terminal I/O error, state change and self-heal posts a
//! structured event onto a bounded ring. Operators and tests drain the
//! ring; when nobody drains it, old events fall off the front rather
//! than growing without bound.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::SystemTime;

use serde::Serialize;

const EVENT_RING_CAPACITY: usize = 1024;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChecksumError,
    IoError,
    DelayObserved,
    LabelError,
    StateChange,
    SelfHealed,
    PoolSuspended,
    PoolResumed,
    DeadmanFired,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub kind: EventKind,
    /// Vdev guid, when device-scoped.
    pub vdev_guid: Option<u64>,
    /// `(objset, object, level, blkid)` bookmark, when block-scoped.
    pub bookmark: Option<(u64, u64, u8, u64)>,
    pub detail: String,
    #[serde(skip)]
    pub at: SystemTime,
}

#[derive(Default)]
pub struct EventRing {
    ring: Mutex<VecDeque<Event>>,
}

impl EventRing {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn post(&self, kind: EventKind, vdev_guid: Option<u64>, detail: String) {
        self.post_full(Event {
            kind,
            vdev_guid,
            bookmark: None,
            detail,
            at: SystemTime::now(),
        });
    }

    pub fn post_full(&self, event: Event) {
        let mut ring = self.ring.lock().unwrap();
        if ring.len() == EVENT_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    /// Drain everything queued so far.
    pub fn drain(&self) -> Vec<Event> {
        self.ring.lock().unwrap().drain(..).collect()
    }

    /// Count without consuming; tests assert on this.
    pub fn count(&self, kind: EventKind) -> usize {
        self.ring
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_bounds_growth() {
        let ring = EventRing::new();
        for i in 0..(EVENT_RING_CAPACITY + 10) {
            ring.post(EventKind::IoError, Some(i as u64), "x".into());
        }
        assert_eq!(ring.len(), EVENT_RING_CAPACITY);
        let drained = ring.drain();
        // The oldest ten fell off the front.
        assert_eq!(drained[0].vdev_guid, Some(10));
        assert!(ring.is_empty());
    }

    #[test]
    fn count_by_kind() {
        let ring = EventRing::new();
        ring.post(EventKind::ChecksumError, None, "a".into());
        ring.post(EventKind::SelfHealed, None, "b".into());
        ring.post(EventKind::ChecksumError, None, "c".into());
        assert_eq!(ring.count(EventKind::ChecksumError), 2);
        assert_eq!(ring.count(EventKind::SelfHealed), 1);
    }
}
