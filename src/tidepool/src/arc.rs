// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The adaptive replacement cache.
//!
//! Buffers are keyed by block identity `(vdev, offset, birth)` and live
//! in one of six states. MRU holds the recently-seen-once, MFU the seen
//! again; the ghost states remember identities without data so a miss
//! that *would* have hit can steer the balance point `p`: an MRU-ghost
//! hit grows `p` (recency was being starved), an MFU-ghost hit shrinks
//! it. Eviction walks per-state sharded LRU multilists from a random
//! sublist and demotes to ghost; ghosts over target are forgotten.
//!
//! The cache itself never touches disk. Misses are the caller's problem;
//! the caller hands the payload back via `insert`. With compressed-arc
//! enabled, the stored bytes are the physical (compressed) image and
//! hits decompress on the way out.
//!
//! The hash is the single source of identity across memory and the L2
//! devices: a buffer the feed pass has copied to L2 keeps its header on
//! eviction and moves to `L2cOnly` (no data, no list membership)
//! instead of being forgotten to ghost. An access to such a header
//! tells the caller to fetch from L2 and re-install; L2 rebuild at
//! import seeds these headers back. A header whose L2 copy has since
//! been overwritten is dropped on access and read from the main pool.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::trace;
use serde::Serialize;
use tp_compress::CompressId;
use tp_utils::metric::{IncMetric, Metric, StoreMetric};
use tp_utils::Multilist;

use crate::config::Tunables;
use crate::error::IoErr;

const ARC_SHARDS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArcKey {
    pub vdev: u32,
    pub offset: u64,
    pub birth: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArcState {
    /// In flight, not yet on any list.
    Anon,
    Mru,
    MruGhost,
    Mfu,
    MfuGhost,
    L2cOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufType {
    Data,
    Metadata,
}

/// Reclaim caller identity; the shrinker limit applies to asynchronous
/// reclaim, with direct reclaim exempt by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimContext {
    Async,
    Direct,
}

struct HdrInner {
    state: ArcState,
    data: Option<Arc<Vec<u8>>>,
    compressed: bool,
    comp: CompressId,
    lsize: u32,
    /// The payload also lives on an L2 device.
    l2: bool,
    /// List the buffer was evicted from, so an L2 hit re-installs at
    /// the right temperature.
    frequent_hint: bool,
}

struct ArcHdr {
    key: ArcKey,
    typ: BufType,
    inner: Mutex<HdrInner>,
}

#[derive(Default, Serialize)]
pub struct ArcStats {
    pub hits: IncMetric,
    pub misses: IncMetric,
    pub mru_hits: IncMetric,
    pub mfu_hits: IncMetric,
    pub mru_ghost_hits: IncMetric,
    pub mfu_ghost_hits: IncMetric,
    pub evicted_bytes: IncMetric,
    pub c: StoreMetric,
    pub p: StoreMetric,
    pub size: StoreMetric,
}

/// What a lookup found.
pub enum ArcAccess {
    /// Logical bytes, ready to use.
    Hit(Arc<Vec<u8>>),
    /// Identity known and the payload lives on an L2 device; the caller
    /// fetches it there and re-inserts at the hinted temperature.
    L2Only { frequent: bool },
    /// Identity remembered but data gone; caller reads from disk and
    /// re-inserts (the balance point has already been adjusted).
    GhostHit,
    Miss,
}

fn key_hash(key: &ArcKey) -> usize {
    let mut h = DefaultHasher::new();
    key.hash(&mut h);
    h.finish() as usize
}

struct StateLists {
    mru: [Multilist<ArcKey>; 2],
    mru_ghost: [Multilist<ArcKey>; 2],
    mfu: [Multilist<ArcKey>; 2],
    mfu_ghost: [Multilist<ArcKey>; 2],
}

pub struct ArcCache {
    shards: Vec<Mutex<HashMap<ArcKey, Arc<ArcHdr>>>>,
    lists: StateLists,
    /// Byte sizes per (state, data/meta): mru, mru_ghost, mfu, mfu_ghost.
    sizes: [[AtomicU64; 2]; 4],
    c: AtomicU64,
    p: AtomicU64,
    c_min: u64,
    c_max: u64,
    no_grow: AtomicBool,
    compressed_arc: bool,
    shrinker_limit_bytes: u64,
    shrinker_limit_all: bool,
    pub stats: ArcStats,
}

fn new_lists(n: usize) -> [Multilist<ArcKey>; 2] {
    [
        Multilist::new(n, |k: &ArcKey| key_hash(k)),
        Multilist::new(n, |k: &ArcKey| key_hash(k)),
    ]
}

const S_MRU: usize = 0;
const S_MRU_GHOST: usize = 1;
const S_MFU: usize = 2;
const S_MFU_GHOST: usize = 3;

impl ArcCache {
    pub fn new(tunables: &Tunables) -> Self {
        let n = tunables.num_sublists();
        let c = tunables.zfs_arc_max / 2 + tunables.zfs_arc_min / 2;
        ArcCache {
            shards: (0..ARC_SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            lists: StateLists {
                mru: new_lists(n),
                mru_ghost: new_lists(n),
                mfu: new_lists(n),
                mfu_ghost: new_lists(n),
            },
            sizes: Default::default(),
            c: AtomicU64::new(c.max(tunables.zfs_arc_min)),
            p: AtomicU64::new(c / 2),
            c_min: tunables.zfs_arc_min,
            c_max: tunables.zfs_arc_max,
            no_grow: AtomicBool::new(false),
            compressed_arc: tunables.zfs_compressed_arc_enabled,
            shrinker_limit_bytes: tunables.zfs_arc_shrinker_limit * 4096,
            shrinker_limit_all: tunables.zfs_arc_shrinker_limit_all_contexts,
            stats: ArcStats::default(),
        }
    }

    pub fn compressed_enabled(&self) -> bool {
        self.compressed_arc
    }

    fn shard(&self, key: &ArcKey) -> &Mutex<HashMap<ArcKey, Arc<ArcHdr>>> {
        &self.shards[key_hash(key) % ARC_SHARDS]
    }

    fn list(&self, state: usize, typ: BufType) -> &Multilist<ArcKey> {
        let t = (typ == BufType::Metadata) as usize;
        match state {
            S_MRU => &self.lists.mru[t],
            S_MRU_GHOST => &self.lists.mru_ghost[t],
            S_MFU => &self.lists.mfu[t],
            _ => &self.lists.mfu_ghost[t],
        }
    }

    fn size_of(&self, state: usize) -> u64 {
        self.sizes[state][0].load(Ordering::Relaxed) + self.sizes[state][1].load(Ordering::Relaxed)
    }

    fn add_size(&self, state: usize, typ: BufType, bytes: u64) {
        self.sizes[state][(typ == BufType::Metadata) as usize].fetch_add(bytes, Ordering::Relaxed);
    }

    fn sub_size(&self, state: usize, typ: BufType, bytes: u64) {
        self.sizes[state][(typ == BufType::Metadata) as usize].fetch_sub(bytes, Ordering::Relaxed);
    }

    fn state_index(state: ArcState) -> Option<usize> {
        match state {
            ArcState::Mru => Some(S_MRU),
            ArcState::MruGhost => Some(S_MRU_GHOST),
            ArcState::Mfu => Some(S_MFU),
            ArcState::MfuGhost => Some(S_MFU_GHOST),
            _ => None,
        }
    }

    pub fn cached_size(&self) -> u64 {
        self.size_of(S_MRU) + self.size_of(S_MFU)
    }

    pub fn target(&self) -> u64 {
        self.c.load(Ordering::Relaxed)
    }

    /// Look up a block. Hits promote MRU to MFU and refresh recency;
    /// ghost hits tune `p` and report themselves so the caller re-reads.
    pub fn access(&self, key: &ArcKey) -> ArcAccess {
        let hdr = {
            let shard = self.shard(key).lock().unwrap();
            match shard.get(key) {
                Some(h) => Arc::clone(h),
                None => {
                    self.stats.misses.inc();
                    return ArcAccess::Miss;
                }
            }
        };
        let mut inner = hdr.inner.lock().unwrap();
        match inner.state {
            ArcState::Mru | ArcState::Mfu | ArcState::Anon => {
                let data = match &inner.data {
                    Some(d) => Arc::clone(d),
                    None => {
                        self.stats.misses.inc();
                        return ArcAccess::Miss;
                    }
                };
                self.stats.hits.inc();
                let size = data.len() as u64;
                if inner.state == ArcState::Mru {
                    // Second touch: recency graduates to frequency.
                    self.stats.mru_hits.inc();
                    self.list(S_MRU, hdr.typ).remove(key);
                    self.sub_size(S_MRU, hdr.typ, size);
                    inner.state = ArcState::Mfu;
                    self.list(S_MFU, hdr.typ).insert(*key);
                    self.add_size(S_MFU, hdr.typ, size);
                } else if inner.state == ArcState::Mfu {
                    self.stats.mfu_hits.inc();
                    self.list(S_MFU, hdr.typ).touch(key);
                }
                let out = if inner.compressed {
                    match tp_compress::decompress(inner.comp, &data, inner.lsize as usize) {
                        Ok(d) => Arc::new(d),
                        Err(_) => return ArcAccess::Miss,
                    }
                } else {
                    data
                };
                ArcAccess::Hit(out)
            }
            ArcState::MruGhost => {
                // Recency was evicted too eagerly; widen its share.
                self.stats.mru_ghost_hits.inc();
                let grow = u64::from(inner.lsize).max(4096);
                let c = self.c.load(Ordering::Relaxed);
                let p = self.p.load(Ordering::Relaxed);
                self.p.store((p + grow).min(c), Ordering::Relaxed);
                let lsize = inner.lsize;
                inner.state = ArcState::Anon;
                drop(inner);
                self.forget(&hdr.key, hdr.typ, lsize, S_MRU_GHOST);
                self.stats.misses.inc();
                ArcAccess::GhostHit
            }
            ArcState::MfuGhost => {
                self.stats.mfu_ghost_hits.inc();
                let shrink = u64::from(inner.lsize).max(4096);
                let p = self.p.load(Ordering::Relaxed);
                self.p.store(p.saturating_sub(shrink), Ordering::Relaxed);
                let lsize = inner.lsize;
                inner.state = ArcState::Anon;
                drop(inner);
                self.forget(&hdr.key, hdr.typ, lsize, S_MFU_GHOST);
                self.stats.misses.inc();
                ArcAccess::GhostHit
            }
            ArcState::L2cOnly => ArcAccess::L2Only {
                frequent: inner.frequent_hint,
            },
        }
    }

    fn forget(&self, key: &ArcKey, typ: BufType, lsize: u32, state: usize) {
        self.list(state, typ).remove(key);
        self.sub_size(state, typ, u64::from(lsize));
        self.shard(key).lock().unwrap().remove(key);
    }

    /// Install a block read from disk (or just written). `data` is
    /// physical when `compressed`, logical otherwise. A ghost hit that
    /// led here lands in MFU; fresh identities land in MRU.
    pub fn insert(
        &self,
        key: ArcKey,
        typ: BufType,
        data: Vec<u8>,
        compressed: bool,
        comp: CompressId,
        lsize: u32,
        frequent: bool,
    ) {
        debug_assert!(!compressed || self.compressed_arc);
        let size = data.len() as u64;
        let state = if frequent { ArcState::Mfu } else { ArcState::Mru };
        let sidx = Self::state_index(state).unwrap();
        let hdr = Arc::new(ArcHdr {
            key,
            typ,
            inner: Mutex::new(HdrInner {
                state,
                data: Some(Arc::new(data)),
                compressed,
                comp,
                lsize,
                l2: false,
                frequent_hint: false,
            }),
        });
        {
            let mut shard = self.shard(&key).lock().unwrap();
            if let Some(old) = shard.insert(key, Arc::clone(&hdr)) {
                // One header per identity: displace the old one.
                let old_inner = old.inner.lock().unwrap();
                if let Some(oidx) = Self::state_index(old_inner.state) {
                    self.list(oidx, old.typ).remove(&key);
                    let osize = old_inner
                        .data
                        .as_ref()
                        .map(|d| d.len() as u64)
                        .unwrap_or(u64::from(old_inner.lsize));
                    self.sub_size(oidx, old.typ, osize);
                }
            }
        }
        self.list(sidx, typ).insert(key);
        self.add_size(sidx, typ, size);
        self.maybe_grow(size);
        self.adjust();
        self.publish_stats();
    }

    fn maybe_grow(&self, by: u64) {
        if self.no_grow.load(Ordering::Relaxed) {
            return;
        }
        let c = self.c.load(Ordering::Relaxed);
        if self.cached_size() + by > c && c < self.c_max {
            self.c
                .store((c + by).min(self.c_max), Ordering::Relaxed);
        }
    }

    /// Evict until sizes respect `c` and `p`. Ghost lists are bounded by
    /// `c` each.
    pub fn adjust(&self) {
        let c = self.c.load(Ordering::Relaxed);
        let p = self.p.load(Ordering::Relaxed);
        let mut guard = 0;
        while self.cached_size() > c && guard < 1_000_000 {
            guard += 1;
            let from_mru = self.size_of(S_MRU) > p || self.size_of(S_MFU) == 0;
            let state = if from_mru { S_MRU } else { S_MFU };
            if !self.evict_one(state) {
                let other = if from_mru { S_MFU } else { S_MRU };
                if !self.evict_one(other) {
                    break;
                }
            }
        }
        for ghost in &[S_MRU_GHOST, S_MFU_GHOST] {
            while self.size_of(*ghost) > c {
                if !self.drop_ghost(*ghost) {
                    break;
                }
            }
        }
        self.publish_stats();
    }

    /// Demote the coldest buffer of `state` to its ghost list.
    fn evict_one(&self, state: usize) -> bool {
        let (typ_idx, typ) = if self.sizes[state][0].load(Ordering::Relaxed)
            >= self.sizes[state][1].load(Ordering::Relaxed)
        {
            (0usize, BufType::Data)
        } else {
            (1usize, BufType::Metadata)
        };
        let _ = typ_idx;
        let list = self.list(state, typ);
        let key = match list.pop_oldest_from(list.random_sublist()) {
            Some(k) => k,
            None => {
                // Try the other type before giving up.
                let other = if typ == BufType::Data {
                    BufType::Metadata
                } else {
                    BufType::Data
                };
                let olist = self.list(state, other);
                match olist.pop_oldest_from(olist.random_sublist()) {
                    Some(k) => k,
                    None => return false,
                }
            }
        };
        let hdr = {
            let shard = self.shard(&key).lock().unwrap();
            match shard.get(&key) {
                Some(h) => Arc::clone(h),
                None => return true,
            }
        };
        let mut inner = hdr.inner.lock().unwrap();
        let size = inner
            .data
            .as_ref()
            .map(|d| d.len() as u64)
            .unwrap_or(0);
        self.sub_size(state, hdr.typ, size);
        inner.data = None;
        if inner.l2 {
            // The payload survives on an L2 device: keep the identity,
            // off every list, until the device forgets it.
            inner.state = ArcState::L2cOnly;
            inner.frequent_hint = state == S_MFU;
            self.stats.evicted_bytes.add(size);
            trace!("arc: evicted {:?} ({} bytes) to l2-only", key, size);
            return true;
        }
        let ghost = if state == S_MRU { S_MRU_GHOST } else { S_MFU_GHOST };
        inner.state = if state == S_MRU {
            ArcState::MruGhost
        } else {
            ArcState::MfuGhost
        };
        self.list(ghost, hdr.typ).insert(key);
        self.add_size(ghost, hdr.typ, u64::from(inner.lsize));
        self.stats.evicted_bytes.add(size);
        trace!("arc: evicted {:?} ({} bytes) to ghost", key, size);
        true
    }

    fn drop_ghost(&self, state: usize) -> bool {
        for typ in &[BufType::Data, BufType::Metadata] {
            let list = self.list(state, *typ);
            if let Some(key) = list.pop_oldest_from(list.random_sublist()) {
                let mut shard = self.shard(&key).lock().unwrap();
                if let Some(hdr) = shard.remove(&key) {
                    let inner = hdr.inner.lock().unwrap();
                    self.sub_size(state, hdr.typ, u64::from(inner.lsize));
                }
                return true;
            }
        }
        false
    }

    /// Drop every in-memory buffer and ghost. Identities that still
    /// have an L2 copy are kept as `L2cOnly` headers so the devices
    /// remain reachable; everything else is forgotten. Tests use this
    /// to force device reads.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut map = shard.lock().unwrap();
            map.retain(|_, hdr| {
                let mut inner = hdr.inner.lock().unwrap();
                if inner.l2 {
                    inner.state = ArcState::L2cOnly;
                    inner.data = None;
                    true
                } else {
                    false
                }
            });
        }
        for state in &[S_MRU, S_MRU_GHOST, S_MFU, S_MFU_GHOST] {
            for typ in &[BufType::Data, BufType::Metadata] {
                let list = self.list(*state, *typ);
                while list.pop_oldest_from(0).is_some() {}
            }
        }
        for per_state in &self.sizes {
            for size in per_state {
                size.store(0, Ordering::Relaxed);
            }
        }
        self.publish_stats();
    }

    /// Record that `key`'s payload now also lives on an L2 device.
    pub fn mark_l2(&self, key: &ArcKey) -> bool {
        let hdr = {
            let shard = self.shard(key).lock().unwrap();
            match shard.get(key) {
                Some(h) => Arc::clone(h),
                None => return false,
            }
        };
        hdr.inner.lock().unwrap().l2 = true;
        true
    }

    /// Seed an identity whose only copy is on an L2 device (rebuild at
    /// import). A live header for the same identity wins.
    pub fn insert_l2only(&self, key: ArcKey, typ: BufType, lsize: u32, frequent: bool) {
        let mut shard = self.shard(&key).lock().unwrap();
        if shard.contains_key(&key) {
            return;
        }
        shard.insert(
            key,
            Arc::new(ArcHdr {
                key,
                typ,
                inner: Mutex::new(HdrInner {
                    state: ArcState::L2cOnly,
                    data: None,
                    compressed: false,
                    comp: CompressId::Off,
                    lsize,
                    l2: true,
                    frequent_hint: frequent,
                }),
            }),
        );
    }

    /// The L2 copy behind an `L2cOnly` header is gone (device wrap or
    /// corruption): forget the identity so the next access misses.
    pub fn forget_l2only(&self, key: &ArcKey) {
        let mut shard = self.shard(key).lock().unwrap();
        let stale = shard
            .get(key)
            .map_or(false, |h| h.inner.lock().unwrap().state == ArcState::L2cOnly);
        if stale {
            shard.remove(key);
        }
    }

    /// Drop a specific identity (block freed).
    pub fn invalidate(&self, key: &ArcKey) {
        let hdr = {
            let mut shard = self.shard(key).lock().unwrap();
            match shard.remove(key) {
                Some(h) => h,
                None => return,
            }
        };
        let inner = hdr.inner.lock().unwrap();
        if let Some(sidx) = Self::state_index(inner.state) {
            self.list(sidx, hdr.typ).remove(key);
            let size = inner
                .data
                .as_ref()
                .map(|d| d.len() as u64)
                .unwrap_or(u64::from(inner.lsize));
            self.sub_size(sidx, hdr.typ, size);
        }
    }

    // ---- memory-pressure surface ---------------------------------------

    /// How many bytes could be evicted, clamped by the shrinker limit so
    /// an aggressive external reclaimer cannot demand a catastrophic
    /// shrink.
    pub fn shrinker_count(&self, ctx: ReclaimContext) -> u64 {
        let clean = self.cached_size();
        let limited = match ctx {
            ReclaimContext::Direct => !self.shrinker_limit_all,
            ReclaimContext::Async => true,
        };
        if limited && self.shrinker_limit_bytes > 0 {
            clean.min(self.shrinker_limit_bytes)
        } else {
            clean
        }
    }

    /// Evict roughly `bytes`; reduces `c`, freezes growth, and returns
    /// what was actually released. Never blocks on anything but list
    /// locks, so it is safe from an allocation path.
    pub fn shrinker_scan(&self, bytes: u64, _ctx: ReclaimContext) -> u64 {
        let before = self.cached_size();
        let c = self.c.load(Ordering::Relaxed);
        let new_c = c.saturating_sub(bytes).max(self.c_min);
        self.c.store(new_c, Ordering::Relaxed);
        self.no_grow.store(true, Ordering::Relaxed);
        self.adjust();
        let after = self.cached_size();
        // Half the ask is good enough to report progress.
        before.saturating_sub(after)
    }

    pub fn set_no_grow(&self, v: bool) {
        self.no_grow.store(v, Ordering::Relaxed);
    }

    /// Cold-end candidates for the L2 feed: up to `max` buffers from the
    /// tails of MRU and MFU with their stored bytes.
    pub fn feed_candidates(
        &self,
        max: usize,
    ) -> Vec<(ArcKey, Vec<u8>, bool, CompressId, u32)> {
        let mut out = Vec::new();
        for state in &[S_MRU, S_MFU] {
            for typ in &[BufType::Data, BufType::Metadata] {
                let list = self.list(*state, *typ);
                for idx in 0..list.num_sublists() {
                    for key in list.peek_oldest_in(idx, 4) {
                        if out.len() >= max {
                            return out;
                        }
                        let hdr = {
                            let shard = self.shard(&key).lock().unwrap();
                            match shard.get(&key) {
                                Some(h) => Arc::clone(h),
                                None => continue,
                            }
                        };
                        let inner = hdr.inner.lock().unwrap();
                        if let Some(data) = &inner.data {
                            out.push((
                                key,
                                (**data).clone(),
                                inner.compressed,
                                inner.comp,
                                inner.lsize,
                            ));
                        }
                    }
                }
            }
        }
        out
    }

    fn publish_stats(&self) {
        self.stats.c.store(self.c.load(Ordering::Relaxed));
        self.stats.p.store(self.p.load(Ordering::Relaxed));
        self.stats.size.store(self.cached_size());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_arc(max: u64) -> ArcCache {
        let mut t = Tunables::default();
        t.zfs_arc_max = max;
        t.zfs_arc_min = max / 8;
        t.zfs_compressed_arc_enabled = false;
        t.zfs_multilist_num_sublists = 4;
        ArcCache::new(&t)
    }

    fn key(i: u64) -> ArcKey {
        ArcKey {
            vdev: 0,
            offset: i * 0x1000,
            birth: 1,
        }
    }

    #[test]
    fn hit_promotes_mru_to_mfu() {
        let arc = small_arc(1 << 20);
        arc.insert(key(1), BufType::Data, vec![7u8; 4096], false, CompressId::Off, 4096, false);
        match arc.access(&key(1)) {
            ArcAccess::Hit(d) => assert_eq!(d.len(), 4096),
            _ => panic!("expected hit"),
        }
        // Promoted: accounted under MFU now.
        assert_eq!(arc.size_of(S_MRU), 0);
        assert_eq!(arc.size_of(S_MFU), 4096);
        assert!(matches!(arc.access(&key(1)), ArcAccess::Hit(_)));
        assert_eq!(arc.stats.mfu_hits.count(), 1);
    }

    #[test]
    fn eviction_demotes_to_ghost_and_ghost_hit_tunes_p() {
        let arc = small_arc(64 * 1024);
        for i in 0..64 {
            arc.insert(key(i), BufType::Data, vec![0u8; 4096], false, CompressId::Off, 4096, false);
        }
        assert!(arc.cached_size() <= arc.target());
        // Some early key must have been ghosted.
        let mut saw_ghost = false;
        let p_before = arc.p.load(Ordering::Relaxed);
        for i in 0..64 {
            if matches!(arc.access(&key(i)), ArcAccess::GhostHit) {
                saw_ghost = true;
                break;
            }
        }
        assert!(saw_ghost, "expected at least one ghost hit");
        assert!(arc.p.load(Ordering::Relaxed) >= p_before);
    }

    #[test]
    fn one_header_per_identity() {
        let arc = small_arc(1 << 20);
        arc.insert(key(2), BufType::Data, vec![1u8; 4096], false, CompressId::Off, 4096, false);
        arc.insert(key(2), BufType::Data, vec![2u8; 4096], false, CompressId::Off, 4096, false);
        match arc.access(&key(2)) {
            ArcAccess::Hit(d) => assert_eq!(d[0], 2),
            _ => panic!("expected hit"),
        }
        assert_eq!(arc.cached_size(), 4096);
    }

    #[test]
    fn invalidate_removes_identity() {
        let arc = small_arc(1 << 20);
        arc.insert(key(3), BufType::Metadata, vec![0u8; 512], false, CompressId::Off, 512, false);
        arc.invalidate(&key(3));
        assert!(matches!(arc.access(&key(3)), ArcAccess::Miss));
        assert_eq!(arc.cached_size(), 0);
    }

    #[test]
    fn shrinker_clamps_and_scans() {
        let arc = small_arc(1 << 20);
        for i in 0..32 {
            arc.insert(key(i), BufType::Data, vec![0u8; 4096], false, CompressId::Off, 4096, false);
        }
        let count = arc.shrinker_count(ReclaimContext::Async);
        assert!(count <= arc.cached_size());
        let released = arc.shrinker_scan(64 * 1024, ReclaimContext::Async);
        assert!(released > 0);
        assert!(arc.target() >= arc.c_min);
    }

    #[test]
    fn l2_resident_identity_survives_eviction() {
        let arc = small_arc(1 << 20);
        arc.insert(key(5), BufType::Data, vec![3u8; 4096], false, CompressId::Off, 4096, false);
        arc.insert(key(6), BufType::Data, vec![4u8; 4096], false, CompressId::Off, 4096, false);
        assert!(arc.mark_l2(&key(5)));

        // Dropping all in-memory data keeps only the L2-resident
        // identity, as an l2-only header.
        arc.clear();
        assert_eq!(arc.cached_size(), 0);
        match arc.access(&key(5)) {
            ArcAccess::L2Only { .. } => {}
            _ => panic!("l2-resident header must survive as l2-only"),
        }
        assert!(matches!(arc.access(&key(6)), ArcAccess::Miss));

        // A vanished L2 copy forgets the identity.
        arc.forget_l2only(&key(5));
        assert!(matches!(arc.access(&key(5)), ArcAccess::Miss));
    }

    #[test]
    fn l2only_seed_defers_to_live_header() {
        let arc = small_arc(1 << 20);
        arc.insert(key(7), BufType::Data, vec![1u8; 512], false, CompressId::Off, 512, false);
        // Rebuild seeding must not displace the live buffer.
        arc.insert_l2only(key(7), BufType::Data, 512, true);
        assert!(matches!(arc.access(&key(7)), ArcAccess::Hit(_)));
        arc.insert_l2only(key(8), BufType::Data, 4096, true);
        match arc.access(&key(8)) {
            ArcAccess::L2Only { frequent } => assert!(frequent),
            _ => panic!("seeded identity must report l2-only"),
        }
        // forget_l2only never drops a live header.
        arc.forget_l2only(&key(7));
        assert!(matches!(arc.access(&key(7)), ArcAccess::Hit(_)));
    }

    #[test]
    fn compressed_arc_decompresses_on_hit() {
        let mut t = Tunables::default();
        t.zfs_arc_max = 1 << 20;
        t.zfs_arc_min = 1 << 17;
        t.zfs_compressed_arc_enabled = true;
        t.zfs_multilist_num_sublists = 4;
        let arc = ArcCache::new(&t);
        let logical = vec![9u8; 8192];
        let physical = tp_compress::compress(CompressId::Lzjb, &logical)
            .unwrap()
            .unwrap();
        arc.insert(
            key(4),
            BufType::Data,
            physical,
            true,
            CompressId::Lzjb,
            8192,
            false,
        );
        match arc.access(&key(4)) {
            ArcAccess::Hit(d) => assert_eq!(&*d, &logical),
            _ => panic!("expected hit"),
        }
    }
}
