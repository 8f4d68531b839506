// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Hold counting.
//!
//! A `Refcount` is a plain atomic in release builds. Debug builds keep a
//! per-tag ledger so a leaked hold names its owner instead of showing up
//! as an anonymous nonzero count at eviction time.

use std::sync::atomic::{AtomicU64, Ordering};

#[cfg(debug_assertions)]
use std::collections::HashMap;
#[cfg(debug_assertions)]
use std::sync::Mutex;

#[derive(Default)]
pub struct Refcount {
    count: AtomicU64,
    #[cfg(debug_assertions)]
    tags: Mutex<HashMap<&'static str, u64>>,
}

impl Refcount {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_zero(&self) -> bool {
        self.count() == 0
    }

    /// Take a hold; returns the new count.
    pub fn add(&self, tag: &'static str) -> u64 {
        #[cfg(debug_assertions)]
        {
            *self.tags.lock().unwrap().entry(tag).or_insert(0) += 1;
        }
        #[cfg(not(debug_assertions))]
        let _ = tag;
        self.count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Release a hold; returns the new count.
    pub fn remove(&self, tag: &'static str) -> u64 {
        #[cfg(debug_assertions)]
        {
            let mut tags = self.tags.lock().unwrap();
            let n = tags
                .get_mut(tag)
                .unwrap_or_else(|| panic!("refcount: release of untaken hold '{}'", tag));
            *n -= 1;
            if *n == 0 {
                tags.remove(tag);
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = tag;
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "refcount underflow");
        prev - 1
    }

    /// Transfer one hold from `from` to `to` without changing the count.
    pub fn transfer(&self, from: &'static str, to: &'static str) {
        #[cfg(debug_assertions)]
        {
            let mut tags = self.tags.lock().unwrap();
            let n = tags
                .get_mut(from)
                .unwrap_or_else(|| panic!("refcount: transfer of untaken hold '{}'", from));
            *n -= 1;
            if *n == 0 {
                tags.remove(from);
            }
            *tags.entry(to).or_insert(0) += 1;
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (from, to);
        }
    }
}

impl std::fmt::Debug for Refcount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Refcount({})", self.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove() {
        let rc = Refcount::new();
        assert!(rc.is_zero());
        assert_eq!(rc.add("a"), 1);
        assert_eq!(rc.add("b"), 2);
        assert_eq!(rc.remove("a"), 1);
        assert_eq!(rc.remove("b"), 0);
        assert!(rc.is_zero());
    }

    #[test]
    fn transfer_keeps_count() {
        let rc = Refcount::new();
        rc.add("open");
        rc.transfer("open", "sync");
        assert_eq!(rc.count(), 1);
        rc.remove("sync");
    }

    #[test]
    #[should_panic]
    fn underflow_panics() {
        let rc = Refcount::new();
        rc.add("x");
        rc.remove("x");
        rc.remove("x");
    }
}
