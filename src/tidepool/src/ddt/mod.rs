// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The deduplication table.
//!
//! A dedup write keys on `(checksum, lsize, psize, compress, crypt)`. A
//! hit bumps the reference count and adopts the existing copies without
//! touching a device; a miss inserts a fresh entry. Entries move through
//! three homes: the live tree (this txg's mutations), a two-bank
//! append-only log (the journal of recent txgs), and the per-class
//! stores (the durable map). The flushing bank drains into the stores a
//! paced number of entries per txg, with the pace steered by how fast
//! entries arrive versus how fast they drain, and a force-txg valve that
//! empties everything.
//!
//! Store payloads are framed with one version byte: bit 7 is the host
//! byte order at write time, bits 0..6 the compression function used for
//! the phys (zero-length encoding, or off when it did not shrink).

pub mod store;

use std::collections::HashMap;
use std::sync::Mutex;

use log::debug;
use serde::Serialize;
use tp_checksum::Cksum;
use tp_utils::metric::{IncMetric, Metric, StoreMetric};
use tp_utils::Btree;

use crate::blkptr::{BlockPtr, Dva};

pub use self::store::{DdtStoreSet, DDT_LOG_OBJECTS};

/// 45 bytes of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DdtKey {
    pub cksum: Cksum,
    pub lsize: u32,
    pub psize: u32,
    pub compress: u8,
    pub crypt: bool,
}

impl DdtKey {
    pub fn from_bp(bp: &BlockPtr) -> DdtKey {
        DdtKey {
            cksum: bp.cksum,
            lsize: bp.lsize,
            psize: bp.psize,
            compress: bp.compress as u8,
            crypt: bp.crypt.is_some(),
        }
    }
}

/// The flat phys: copies, reference count, birth, and when the entry
/// entered its current class (drives prune age decisions).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DdtPhys {
    pub dvas: [Dva; 3],
    pub refcount: u64,
    pub birth: u64,
    pub class_start: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DdtClass {
    Duplicate,
    Unique,
}

impl DdtPhys {
    pub fn class(&self) -> DdtClass {
        if self.refcount > 1 {
            DdtClass::Duplicate
        } else {
            DdtClass::Unique
        }
    }
}

#[derive(Default, Serialize)]
pub struct DdtStats {
    pub lookups: IncMetric,
    pub hits: IncMetric,
    pub inserts: IncMetric,
    pub removes: IncMetric,
    pub log_flushed: IncMetric,
    pub pruned: IncMetric,
    pub entries: StoreMetric,
}

struct Pacing {
    /// Exponential averages, entries/txg.
    ingest_rate: f64,
    flush_rate: f64,
    ingested_this_txg: u64,
    /// Hard valve: at this txg everything drains.
    flush_force_txg: u64,
}

const FLUSH_MIN_PER_TXG: u64 = 64;
const FLUSH_MAX_PER_TXG: u64 = 4096;
/// Aim to clear the backlog within this many txgs.
const FLUSH_TXG_HORIZON: u64 = 32;

/// A stable walk position: `(class, last key seen)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DdtCursor {
    pub class_idx: u8,
    pub key: Option<DdtKey>,
}

pub struct Ddt {
    /// This txg's mutations, hottest lookups first.
    tree: Mutex<Btree<DdtKey, DdtPhys>>,
    log_active: Mutex<Btree<DdtKey, DdtPhys>>,
    log_flushing: Mutex<Btree<DdtKey, DdtPhys>>,
    /// Durable per-class maps, cached in memory, persisted by `store`.
    classes: Mutex<HashMap<DdtClass, Btree<DdtKey, DdtPhys>>>,
    pacing: Mutex<Pacing>,
    pub stats: DdtStats,
}

impl Default for Ddt {
    fn default() -> Self {
        Self::new()
    }
}

impl Ddt {
    pub fn new() -> Ddt {
        let mut classes = HashMap::new();
        classes.insert(DdtClass::Duplicate, Btree::new());
        classes.insert(DdtClass::Unique, Btree::new());
        Ddt {
            tree: Mutex::new(Btree::new()),
            log_active: Mutex::new(Btree::new()),
            log_flushing: Mutex::new(Btree::new()),
            classes: Mutex::new(classes),
            pacing: Mutex::new(Pacing {
                ingest_rate: 0.0,
                flush_rate: 0.0,
                ingested_this_txg: 0,
                flush_force_txg: 0,
            }),
            stats: DdtStats::default(),
        }
    }

    fn find(&self, key: &DdtKey) -> Option<DdtPhys> {
        if let Some(p) = self.tree.lock().unwrap().get(key) {
            return Some(*p);
        }
        if let Some(p) = self.log_active.lock().unwrap().get(key) {
            return Some(*p);
        }
        if let Some(p) = self.log_flushing.lock().unwrap().get(key) {
            return Some(*p);
        }
        let classes = self.classes.lock().unwrap();
        for class in &[DdtClass::Duplicate, DdtClass::Unique] {
            if let Some(p) = classes[class].get(key) {
                return Some(*p);
            }
        }
        None
    }

    /// Remove a key from wherever it currently lives.
    fn expunge(&self, key: &DdtKey) {
        self.tree.lock().unwrap().remove(key);
        self.log_active.lock().unwrap().remove(key);
        self.log_flushing.lock().unwrap().remove(key);
        let mut classes = self.classes.lock().unwrap();
        for tree in classes.values_mut() {
            tree.remove(key);
        }
    }

    /// Existence probe without touching refcounts.
    pub fn contains(&self, key: &DdtKey) -> bool {
        self.find(key).is_some()
    }

    /// Write-path lookup: a hit bumps the refcount and hands back the
    /// existing copies.
    pub fn lookup_ref(&self, key: &DdtKey, _txg: u64) -> Option<(Vec<Dva>, u64)> {
        self.stats.lookups.inc();
        let mut phys = self.find(key)?;
        phys.refcount += 1;
        // The mutation lives in the live tree until sync.
        self.expunge(key);
        self.tree.lock().unwrap().insert(*key, phys);
        self.stats.hits.inc();
        let dvas = phys.dvas.iter().filter(|d| d.is_valid()).cloned().collect();
        Some((dvas, phys.birth))
    }

    /// A write missed; record the fresh entry.
    pub fn insert_miss(&self, key: DdtKey, dvas: [Dva; 3], birth: u64, txg: u64) {
        let phys = DdtPhys {
            dvas,
            refcount: 1,
            birth,
            class_start: txg,
        };
        self.tree.lock().unwrap().insert(key, phys);
        self.stats.inserts.inc();
        self.pacing.lock().unwrap().ingested_this_txg += 1;
    }

    /// Free-path refcount drop. Returns true while references remain
    /// (the caller must not free the copies).
    pub fn decref(&self, key: &DdtKey, _txg: u64) -> bool {
        let mut phys = match self.find(key) {
            Some(p) => p,
            None => return false,
        };
        phys.refcount = phys.refcount.saturating_sub(1);
        if phys.refcount == 0 {
            self.expunge(key);
            self.stats.removes.inc();
            return false;
        }
        self.expunge(key);
        self.tree.lock().unwrap().insert(*key, phys);
        true
    }

    pub fn set_flush_force_txg(&self, txg: u64) {
        self.pacing.lock().unwrap().flush_force_txg = txg;
    }

    /// How many flushing-bank entries this txg should drain.
    fn flush_quota(&self, txg: u64, backlog: u64) -> u64 {
        let mut pacing = self.pacing.lock().unwrap();
        // Exponential decay of the ingest/flush rates.
        pacing.ingest_rate = pacing.ingest_rate * 0.875 + pacing.ingested_this_txg as f64 * 0.125;
        pacing.ingested_this_txg = 0;
        if pacing.flush_force_txg != 0 && txg >= pacing.flush_force_txg {
            return u64::MAX;
        }
        let by_horizon = backlog / FLUSH_TXG_HORIZON + 1;
        let by_rate = pacing.ingest_rate.ceil() as u64;
        let quota = by_horizon.max(by_rate).max(FLUSH_MIN_PER_TXG).min(FLUSH_MAX_PER_TXG);
        pacing.flush_rate = pacing.flush_rate * 0.875 + quota as f64 * 0.125;
        quota
    }

    /// Txg sync: journal the live tree into the active bank, drain a
    /// paced slice of the flushing bank into the class maps, and swap
    /// banks when the flushing one runs dry. Returns true when anything
    /// changed that the store must persist.
    pub fn sync(&self, txg: u64) -> bool {
        let mut changed = false;

        // Live tree -> active bank.
        {
            let mut tree = self.tree.lock().unwrap();
            let mut active = self.log_active.lock().unwrap();
            while let Some((k, v)) = tree.pop_first() {
                active.insert(k, v);
                changed = true;
            }
        }

        let backlog = {
            let active = self.log_active.lock().unwrap();
            let flushing = self.log_flushing.lock().unwrap();
            (active.len() + flushing.len()) as u64
        };
        let quota = self.flush_quota(txg, backlog);

        // Drain the flushing bank.
        {
            let mut flushing = self.log_flushing.lock().unwrap();
            let mut classes = self.classes.lock().unwrap();
            let mut drained = 0u64;
            while drained < quota {
                let (k, v) = match flushing.pop_first() {
                    Some(kv) => kv,
                    None => break,
                };
                classes.get_mut(&v.class()).unwrap().insert(k, v);
                drained += 1;
                changed = true;
            }
            self.stats.log_flushed.add(drained);

            if flushing.is_empty() {
                // Swap banks: the active bank becomes the next flush
                // candidate.
                let mut active = self.log_active.lock().unwrap();
                std::mem::swap(&mut *active, &mut *flushing);
            }
        }

        self.stats.entries.store(self.total_entries() as u64);
        changed
    }

    pub fn total_entries(&self) -> usize {
        let classes = self.classes.lock().unwrap();
        self.tree.lock().unwrap().len()
            + self.log_active.lock().unwrap().len()
            + self.log_flushing.lock().unwrap().len()
            + classes.values().map(|t| t.len()).sum::<usize>()
    }

    /// Stable walk over the durable class maps: Duplicate first, then
    /// Unique, keys ascending. The cursor survives restarts because it
    /// is nothing but the last key seen.
    pub fn walk(&self, cursor: DdtCursor) -> Option<(DdtCursor, DdtKey, DdtPhys)> {
        let order = [DdtClass::Duplicate, DdtClass::Unique];
        let classes = self.classes.lock().unwrap();
        let mut idx = cursor.class_idx as usize;
        let mut after = cursor.key;
        while idx < order.len() {
            let tree = &classes[&order[idx]];
            let found = match after {
                None => tree.first().map(|(k, v)| (*k, *v)),
                Some(k) => tree.next_after(&k).map(|(k2, v)| (*k2, *v)),
            };
            if let Some((k, v)) = found {
                return Some((
                    DdtCursor {
                        class_idx: idx as u8,
                        key: Some(k),
                    },
                    k,
                    v,
                ));
            }
            idx += 1;
            after = None;
        }
        None
    }

    /// Drop unique (refcount == 1) entries whose class residency is at
    /// least `min_age_txgs` old, up to `max_entries`. Returns the keys
    /// removed so the caller can free their copies.
    pub fn prune_unique(
        &self,
        current_txg: u64,
        min_age_txgs: u64,
        max_entries: usize,
    ) -> Vec<(DdtKey, DdtPhys)> {
        let mut pruned = Vec::new();
        let mut classes = self.classes.lock().unwrap();
        let unique = classes.get_mut(&DdtClass::Unique).unwrap();
        let mut cursor: Option<DdtKey> = None;
        while pruned.len() < max_entries {
            let next = match cursor {
                None => unique.first().map(|(k, v)| (*k, *v)),
                Some(k) => unique.next_after(&k).map(|(k2, v)| (*k2, *v)),
            };
            let (k, v) = match next {
                Some(kv) => kv,
                None => break,
            };
            cursor = Some(k);
            if v.refcount == 1 && current_txg.saturating_sub(v.class_start) >= min_age_txgs {
                unique.remove(&k);
                pruned.push((k, v));
            }
        }
        self.stats.pruned.add(pruned.len() as u64);
        debug!("ddt: pruned {} unique entries", pruned.len());
        pruned
    }

    pub(crate) fn class_snapshot(&self, class: DdtClass) -> Vec<(DdtKey, DdtPhys)> {
        let classes = self.classes.lock().unwrap();
        classes[&class].iter().map(|(k, v)| (*k, *v)).collect()
    }

    pub(crate) fn log_snapshots(&self) -> (Vec<(DdtKey, DdtPhys)>, Vec<(DdtKey, DdtPhys)>) {
        let a = self
            .log_active
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        let f = self
            .log_flushing
            .lock()
            .unwrap()
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect();
        (a, f)
    }

    pub(crate) fn load_class(&self, class: DdtClass, entries: Vec<(DdtKey, DdtPhys)>) {
        let mut classes = self.classes.lock().unwrap();
        let tree = classes.get_mut(&class).unwrap();
        for (k, v) in entries {
            tree.insert(k, v);
        }
    }

    pub(crate) fn load_logs(
        &self,
        active: Vec<(DdtKey, DdtPhys)>,
        flushing: Vec<(DdtKey, DdtPhys)>,
    ) {
        {
            let mut a = self.log_active.lock().unwrap();
            for (k, v) in active {
                a.insert(k, v);
            }
        }
        let mut f = self.log_flushing.lock().unwrap();
        for (k, v) in flushing {
            f.insert(k, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u64) -> DdtKey {
        DdtKey {
            cksum: Cksum([n, 0, 0, 0]),
            lsize: 0x10000,
            psize: 0x10000,
            compress: 2,
            crypt: false,
        }
    }

    fn dvas(n: u64) -> [Dva; 3] {
        [
            Dva {
                vdev: 0,
                grid: 0,
                asize: 0x10000,
                offset: n * 0x10000,
                gang: false,
            },
            Dva::default(),
            Dva::default(),
        ]
    }

    #[test]
    fn refcount_conservation() {
        let ddt = Ddt::new();
        ddt.insert_miss(key(1), dvas(1), 5, 5);
        // Two duplicate writes bump to 3.
        assert!(ddt.lookup_ref(&key(1), 6).is_some());
        assert!(ddt.lookup_ref(&key(1), 6).is_some());
        // Three frees: the last one says "free the copies".
        assert!(ddt.decref(&key(1), 7));
        assert!(ddt.decref(&key(1), 7));
        assert!(!ddt.decref(&key(1), 7));
        assert!(!ddt.contains(&key(1)));
    }

    #[test]
    fn lookup_miss_is_none() {
        let ddt = Ddt::new();
        assert!(ddt.lookup_ref(&key(9), 1).is_none());
        assert_eq!(ddt.stats.hits.count(), 0);
        assert_eq!(ddt.stats.lookups.count(), 1);
    }

    #[test]
    fn sync_moves_entries_through_banks_to_classes() {
        let ddt = Ddt::new();
        ddt.insert_miss(key(1), dvas(1), 1, 1);
        ddt.insert_miss(key(2), dvas(2), 1, 1);
        ddt.lookup_ref(&key(1), 1);

        // Txg 1: live tree journals into the active bank, which then
        // swaps into flushing once the (empty) flushing bank drains.
        assert!(ddt.sync(1));
        // Txg 2: flushing drains into the class maps.
        ddt.sync(2);
        ddt.sync(3);

        let dup = ddt.class_snapshot(DdtClass::Duplicate);
        let uniq = ddt.class_snapshot(DdtClass::Unique);
        assert_eq!(dup.len(), 1);
        assert_eq!(dup[0].1.refcount, 2);
        assert_eq!(uniq.len(), 1);
        assert_eq!(ddt.total_entries(), 2);
    }

    #[test]
    fn walk_is_stable_and_ordered() {
        let ddt = Ddt::new();
        for i in 0..10 {
            ddt.insert_miss(key(i), dvas(i), 1, 1);
        }
        for t in 1..5 {
            ddt.sync(t);
        }
        let mut cursor = DdtCursor::default();
        let mut seen = Vec::new();
        while let Some((next, k, _)) = ddt.walk(cursor) {
            seen.push(k);
            cursor = next;
        }
        assert_eq!(seen.len(), 10);
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn prune_unique_respects_age_and_refcount() {
        let ddt = Ddt::new();
        ddt.insert_miss(key(1), dvas(1), 1, 1);
        ddt.insert_miss(key(2), dvas(2), 1, 1);
        ddt.lookup_ref(&key(2), 1); // refcount 2: never pruned
        for t in 1..5 {
            ddt.sync(t);
        }
        // Too young at txg 5 with min age 100.
        assert!(ddt.prune_unique(5, 100, 100).is_empty());
        let pruned = ddt.prune_unique(200, 100, 100);
        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].0, key(1));
        assert!(ddt.contains(&key(2)));
    }

    #[test]
    fn force_txg_drains_everything() {
        let ddt = Ddt::new();
        for i in 0..10_000 {
            ddt.insert_miss(key(i), dvas(i), 1, 1);
        }
        ddt.set_flush_force_txg(2);
        ddt.sync(1);
        ddt.sync(2);
        ddt.sync(3);
        let total_in_classes = ddt.class_snapshot(DdtClass::Unique).len()
            + ddt.class_snapshot(DdtClass::Duplicate).len();
        assert_eq!(total_in_classes, 10_000);
    }
}
