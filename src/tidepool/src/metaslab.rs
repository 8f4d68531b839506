// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Space allocation.
//!
//! Each top-level vdev is cut into metaslabs. A metaslab's first bytes
//! are a reserved region holding its space map in two ping-pong halves;
//! the rest is allocatable. Allocations mutate the in-memory free tree
//! immediately but only become durable when the txg syncs and the space
//! map half for that txg parity is rewritten; a crash before the
//! uberblock commit simply discards them, which is what makes allocation
//! idempotent per txg.
//!
//! Groups rotate under a weight built from free space decayed by
//! fragmentation. The `queue_depth_pct` cap applies to the normal class
//! only: a group over its unsynced-bytes share is passed over while any
//! other group has room.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, warn};
use tp_allocator::{RangeTree, SpaceMap, SpaceMapEntry};
use tp_checksum::{embedded_generate, embedded_verify, ChecksumId, Cksum, ECK_SIZE};

use crate::blkptr::Dva;
use crate::config::Tunables;
use crate::error::{Error, IoErr, Result};
use crate::vdev::queue::IoClass;
use crate::vdev::{IoEnv, Vdev, VdevKind};

/// Allocation classes. Dedicated log/special/dedup vdevs are not
/// modeled; the classes exist so callers express intent and so the
/// normal-class queue-depth cap can exempt the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocClass {
    Normal,
    Log,
    Special,
    Dedup,
}

const SM_HALF_PAYLOAD: u64 = 64 * 1024;
const SM_MAGIC: u64 = 0x0074_7073_6d61_7030; // "tpsmap0"
const SM_HEADER: usize = 32;
/// Target metaslab count per top-level vdev.
const MS_COUNT_TARGET: u64 = 64;
const MS_MIN_SIZE: u64 = 4 * 1024 * 1024;

struct Metaslab {
    /// Data-space offset of the metaslab (space map region included).
    start: u64,
    size: u64,
    sm_region: u64,
    free: RangeTree,
    sm: SpaceMap,
    /// Per-txg deltas awaiting sync.
    alloc_pending: Vec<(u64, u64, u64)>, // (txg, offset, size)
    free_pending: Vec<(u64, u64, u64)>,
}

impl Metaslab {
    fn allocatable_start(&self) -> u64 {
        self.start + self.sm_region
    }

    fn allocatable_size(&self) -> u64 {
        self.size - self.sm_region
    }

    fn weight(&self) -> u64 {
        let frag = self.free.fragmentation();
        self.free.space() * (100 - frag.min(99)) / 100
    }
}

struct Group {
    top_id: u32,
    /// Allocation unit (1 << ashift).
    unit: u64,
    /// All offsets and sizes are multiples of this (raidz row size).
    align: u64,
    /// Gross asize multiplier for parity: dva.asize = net * num / den.
    gross_num: u64,
    gross_den: u64,
    metaslabs: Vec<Mutex<Metaslab>>,
    rotor: AtomicUsize,
    /// Allocated-but-unsynced bytes, for the queue-depth cap.
    unsynced: AtomicU64,
    asize: u64,
}

impl Group {
    fn new(top: &Vdev) -> Self {
        let unit = 1u64 << top.ashift.load(Ordering::Acquire);
        let (align, gross_num, gross_den) = match &top.kind {
            VdevKind::Raidz { nparity } => {
                let ndata = (top.children.len() - nparity) as u64;
                (unit * ndata, top.children.len() as u64, ndata)
            }
            _ => (unit, 1, 1),
        };
        let asize = top.asize.load(Ordering::Acquire) / align * align;
        let ms_size = (asize / MS_COUNT_TARGET)
            .max(MS_MIN_SIZE)
            .max(4 * sm_region_size(align))
            / align
            * align;
        let count = (asize / ms_size).max(1);
        let sm_region = sm_region_size(align);
        let mut metaslabs = Vec::with_capacity(count as usize);
        for i in 0..count {
            let start = i * ms_size;
            let size = if i == count - 1 { asize - start } else { ms_size };
            let mut free = RangeTree::new();
            if size > sm_region {
                free.add(start + sm_region, size - sm_region)
                    .expect("fresh metaslab range");
            }
            metaslabs.push(Mutex::new(Metaslab {
                start,
                size,
                sm_region,
                free,
                sm: SpaceMap::new(),
                alloc_pending: Vec::new(),
                free_pending: Vec::new(),
            }));
        }
        Group {
            top_id: top.id,
            unit,
            align,
            gross_num,
            gross_den,
            metaslabs,
            rotor: AtomicUsize::new(0),
            unsynced: AtomicU64::new(0),
            asize,
        }
    }

    fn gross(&self, net: u64) -> u64 {
        net * self.gross_num / self.gross_den
    }

    fn net(&self, gross: u64) -> u64 {
        gross * self.gross_den / self.gross_num
    }

    fn align_up(&self, v: u64) -> u64 {
        (v + self.align - 1) / self.align * self.align
    }

    fn over_queue_depth(&self, tunables: &Tunables) -> bool {
        let cap = self.asize / 1000 * tunables.zfs_vdev_queue_depth_pct.max(1);
        self.unsynced.load(Ordering::Relaxed) > cap
    }

    fn alloc(&self, size: u64, txg: u64) -> Option<(u64, u64)> {
        let net = self.align_up(size);
        let n = self.metaslabs.len();
        let start = self.rotor.fetch_add(1, Ordering::Relaxed) % n;
        // Weight-ordered candidates starting from the rotor.
        let mut order: Vec<usize> = (0..n).map(|i| (start + i) % n).collect();
        order.sort_by_key(|i| {
            let ms = self.metaslabs[*i].lock().unwrap();
            std::cmp::Reverse(ms.weight())
        });
        for i in order {
            let mut ms = self.metaslabs[i].lock().unwrap();
            if ms.free.space() < net {
                continue;
            }
            if let Ok(offset) = ms.free.alloc(net, self.align) {
                ms.alloc_pending.push((txg, offset, net));
                self.unsynced.fetch_add(net, Ordering::Relaxed);
                return Some((offset, net));
            }
        }
        None
    }

    fn ms_for(&self, offset: u64) -> Option<&Mutex<Metaslab>> {
        self.metaslabs.iter().find(|m| {
            let ms = m.lock().unwrap();
            offset >= ms.start && offset < ms.start + ms.size
        })
    }

    fn free(&self, offset: u64, net: u64, txg: u64) {
        if let Some(m) = self.ms_for(offset) {
            let mut ms = m.lock().unwrap();
            ms.free_pending.push((txg, offset, net));
        } else {
            warn!("free of unmapped range {:#x}+{:#x}", offset, net);
        }
    }

    fn claim(&self, offset: u64, net: u64, txg: u64) -> std::result::Result<(), IoErr> {
        let m = self.ms_for(offset).ok_or(IoErr::Io)?;
        let mut ms = m.lock().unwrap();
        if ms.free.contains(offset, net) {
            ms.free.remove(offset, net).map_err(|_| IoErr::Io)?;
            ms.alloc_pending.push((txg, offset, net));
        }
        // Already absent from the free tree: the allocation is durable.
        Ok(())
    }
}

fn sm_region_size(align: u64) -> u64 {
    let half = (SM_HALF_PAYLOAD + align - 1) / align * align;
    2 * half
}

pub struct Allocator {
    groups: Vec<Group>,
}

impl Allocator {
    pub fn new(tops: &[Arc<Vdev>]) -> Self {
        Allocator {
            groups: tops.iter().map(|t| Group::new(t)).collect(),
        }
    }

    /// Allocate `copies` DVAs of `size` net bytes. Copies land on
    /// distinct top-level vdevs when there are enough.
    pub fn alloc(
        &self,
        tunables: &Tunables,
        size: u64,
        copies: usize,
        class: AllocClass,
        txg: u64,
    ) -> std::result::Result<Vec<Dva>, IoErr> {
        debug_assert!(copies >= 1 && copies <= 3);
        let ngroups = self.groups.len();
        let mut dvas = Vec::with_capacity(copies);
        let mut used: Vec<usize> = Vec::new();
        for _ in 0..copies {
            let mut placed = false;
            // First pass honors the queue-depth cap for the normal
            // class; the second ignores it rather than failing.
            for relax in 0..2 {
                let mut candidates: Vec<usize> = (0..ngroups).collect();
                candidates.sort_by_key(|g| (used.contains(g)) as u8);
                for g in candidates {
                    if relax == 0
                        && class == AllocClass::Normal
                        && self.groups[g].over_queue_depth(tunables)
                    {
                        continue;
                    }
                    if let Some((offset, net)) = self.groups[g].alloc(size, txg) {
                        dvas.push(Dva {
                            vdev: self.groups[g].top_id,
                            grid: 0,
                            asize: self.groups[g].gross(net),
                            offset,
                            gang: false,
                        });
                        used.push(g);
                        placed = true;
                        break;
                    }
                }
                if placed {
                    break;
                }
            }
            if !placed {
                // Roll back partial copies; the caller may gang instead.
                for dva in &dvas {
                    self.free(dva, txg);
                }
                return Err(IoErr::NoSpace);
            }
        }
        Ok(dvas)
    }

    pub fn free(&self, dva: &Dva, txg: u64) {
        if let Some(group) = self.groups.get(dva.vdev as usize) {
            group.free(dva.offset, group.net(dva.asize), txg);
        }
    }

    /// Mark a DVA allocated outside the txg machinery (intent-log claim
    /// at import).
    pub fn claim(&self, dva: &Dva, txg: u64) -> std::result::Result<(), IoErr> {
        let group = self.groups.get(dva.vdev as usize).ok_or(IoErr::Io)?;
        group.claim(dva.offset, group.net(dva.asize), txg)
    }

    pub fn space(&self) -> (u64, u64) {
        let mut total = 0;
        let mut free = 0;
        for g in &self.groups {
            for m in &g.metaslabs {
                let ms = m.lock().unwrap();
                total += ms.allocatable_size();
                free += ms.free.space();
            }
        }
        (total, total - free)
    }

    /// Fold txg deltas into the space maps and persist them. Frees
    /// become visible (and reusable) here, not before.
    pub fn sync(
        &self,
        env: &IoEnv<'_>,
        tops: &[Arc<Vdev>],
        txg: u64,
    ) -> Result<()> {
        for (gi, group) in self.groups.iter().enumerate() {
            let top = &tops[gi];
            let mut synced_bytes = 0u64;
            for m in &group.metaslabs {
                let mut ms = m.lock().unwrap();
                let mut dirty = false;
                let allocs: Vec<(u64, u64, u64)> = ms
                    .alloc_pending
                    .iter()
                    .filter(|(t, _, _)| *t <= txg)
                    .cloned()
                    .collect();
                ms.alloc_pending.retain(|(t, _, _)| *t > txg);
                for (_, offset, size) in allocs {
                    ms.sm.append(SpaceMapEntry::Alloc { offset, size });
                    synced_bytes += size;
                    dirty = true;
                }
                let frees: Vec<(u64, u64, u64)> = ms
                    .free_pending
                    .iter()
                    .filter(|(t, _, _)| *t <= txg)
                    .cloned()
                    .collect();
                ms.free_pending.retain(|(t, _, _)| *t > txg);
                for (_, offset, size) in frees {
                    if let Err(e) = ms.free.add(offset, size) {
                        warn!("space map free merge: {}", e);
                    }
                    ms.sm.append(SpaceMapEntry::Free { offset, size });
                    dirty = true;
                }
                if dirty {
                    if ms.sm.should_condense(ms.free.num_segments()) {
                        // Rewrite as the image of allocated space.
                        let mut allocated = RangeTree::new();
                        allocated
                            .add(ms.allocatable_start(), ms.allocatable_size())
                            .ok();
                        for (off, len) in ms.free.iter() {
                            allocated.remove(off, len).ok();
                        }
                        ms.sm.condense(&allocated);
                        debug!(
                            "metaslab {:#x}: condensed space map to {} entries",
                            ms.start,
                            ms.sm.num_entries()
                        );
                    }
                    self.write_sm_half(env, top, group, &ms, txg)?;
                }
            }
            group
                .unsynced
                .fetch_sub(synced_bytes.min(group.unsynced.load(Ordering::Relaxed)), Ordering::Relaxed);
        }
        Ok(())
    }

    fn half_geometry(group: &Group) -> u64 {
        (SM_HALF_PAYLOAD + group.align - 1) / group.align * group.align
    }

    fn write_sm_half(
        &self,
        env: &IoEnv<'_>,
        top: &Arc<Vdev>,
        group: &Group,
        ms: &Metaslab,
        txg: u64,
    ) -> Result<()> {
        let half_size = Self::half_geometry(group);
        let half = txg % 2;
        let off = ms.start + half * half_size;
        let mut buf = vec![0u8; half_size as usize];
        let bytes = ms.sm.bytes();
        let avail = half_size as usize - SM_HEADER - ECK_SIZE;
        if bytes.len() > avail {
            return Err(Error::NoSpace);
        }
        LittleEndian::write_u64(&mut buf[0..8], SM_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], txg);
        LittleEndian::write_u64(&mut buf[16..24], bytes.len() as u64);
        LittleEndian::write_u64(&mut buf[24..32], ms.sm.allocated());
        buf[SM_HEADER..SM_HEADER + bytes.len()].copy_from_slice(bytes);
        let eck_off = half_size as usize - ECK_SIZE;
        embedded_generate(ChecksumId::Label, &mut buf, eck_off, Cksum([off, 0, 0, 0]))?;
        top.write(env, off, &buf, txg, IoClass::SyncWrite)
            .map_err(Error::from)?;
        Ok(())
    }

    /// Rebuild free trees from the persisted space maps. Only halves
    /// with txg <= `uber_txg` are trusted; the newer of the two wins.
    pub fn load(
        &self,
        env: &IoEnv<'_>,
        tops: &[Arc<Vdev>],
        uber_txg: u64,
    ) -> Result<()> {
        for (gi, group) in self.groups.iter().enumerate() {
            let top = &tops[gi];
            let half_size = Self::half_geometry(group);
            for m in &group.metaslabs {
                let mut ms = m.lock().unwrap();
                let mut best: Option<(u64, SpaceMap)> = None;
                for half in 0..2u64 {
                    let off = ms.start + half * half_size;
                    let mut buf = match top.read_variant(
                        env,
                        0,
                        off,
                        half_size,
                        0,
                        IoClass::SyncRead,
                    ) {
                        Ok(b) => b,
                        Err(_) => continue,
                    };
                    let eck_off = half_size as usize - ECK_SIZE;
                    if LittleEndian::read_u64(&buf[0..8]) != SM_MAGIC {
                        continue;
                    }
                    if embedded_verify(
                        ChecksumId::Label,
                        &mut buf,
                        eck_off,
                        Cksum([off, 0, 0, 0]),
                    )
                    .is_err()
                    {
                        continue;
                    }
                    let sm_txg = LittleEndian::read_u64(&buf[8..16]);
                    if sm_txg > uber_txg {
                        continue;
                    }
                    let len = LittleEndian::read_u64(&buf[16..24]) as usize;
                    let alloc = LittleEndian::read_u64(&buf[24..32]);
                    if len > buf.len() - SM_HEADER - ECK_SIZE {
                        continue;
                    }
                    let sm =
                        match SpaceMap::open(buf[SM_HEADER..SM_HEADER + len].to_vec(), alloc) {
                            Ok(sm) => sm,
                            Err(_) => continue,
                        };
                    if best.as_ref().map_or(true, |(t, _)| sm_txg > *t) {
                        best = Some((sm_txg, sm));
                    }
                }
                if let Some((_, sm)) = best {
                    let mut free = RangeTree::new();
                    free.add(ms.allocatable_start(), ms.allocatable_size())?;
                    sm.replay_into(&mut free)?;
                    ms.free = free;
                    ms.sm = sm;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventRing;
    use crate::inject::InjectRegistry;
    use crate::vdev::VdevSpec;
    use std::fs::File;
    use std::io::Write;

    fn setup(n_files: usize) -> (tempfile::TempDir, Vec<Arc<Vdev>>, Arc<Vdev>) {
        let dir = tempfile::tempdir().unwrap();
        let tunables = Tunables::default();
        let specs: Vec<VdevSpec> = (0..n_files)
            .map(|i| {
                let path = dir.path().join(format!("d{}", i));
                let mut f = File::create(&path).unwrap();
                f.write_all(&vec![0u8; 32 * 1024 * 1024]).unwrap();
                VdevSpec::File {
                    path: path.to_string_lossy().into_owned(),
                }
            })
            .collect();
        let root = Vdev::build(&specs, 0x999, &tunables).unwrap();
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let env = IoEnv {
            inject: &inject,
            events: &events,
            tunables: &tunables,
        };
        root.open(&env).unwrap();
        let tops = root.children.clone();
        (dir, tops, root)
    }

    #[test]
    fn alloc_and_free_roundtrip() {
        let (_dir, tops, _root) = setup(1);
        let alloc = Allocator::new(&tops);
        let t = Tunables::default();
        let dvas = alloc.alloc(&t, 0x4000, 1, AllocClass::Normal, 5).unwrap();
        assert_eq!(dvas.len(), 1);
        assert_eq!(dvas[0].asize, 0x4000);
        let (_total, used) = alloc.space();
        assert_eq!(used, 0x4000);
        alloc.free(&dvas[0], 6);
        // Frees only land at sync; space still counts used.
        let (_total, used) = alloc.space();
        assert_eq!(used, 0x4000);
    }

    #[test]
    fn copies_land_on_distinct_tops() {
        let (_dir, tops, _root) = setup(2);
        let alloc = Allocator::new(&tops);
        let t = Tunables::default();
        let dvas = alloc.alloc(&t, 0x2000, 2, AllocClass::Normal, 1).unwrap();
        assert_eq!(dvas.len(), 2);
        assert_ne!(dvas[0].vdev, dvas[1].vdev);
    }

    #[test]
    fn exhaustion_returns_nospace() {
        let (_dir, tops, _root) = setup(1);
        let alloc = Allocator::new(&tops);
        let t = Tunables::default();
        let (total, _) = alloc.space();
        assert_eq!(
            alloc
                .alloc(&t, total + 0x100000, 1, AllocClass::Normal, 1)
                .unwrap_err(),
            IoErr::NoSpace
        );
    }

    #[test]
    fn sync_persists_and_load_restores() {
        let (_dir, tops, root) = setup(1);
        let tunables = Tunables::default();
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let env = IoEnv {
            inject: &inject,
            events: &events,
            tunables: &tunables,
        };
        let alloc = Allocator::new(&tops);
        let dvas = alloc
            .alloc(&tunables, 0x8000, 1, AllocClass::Normal, 7)
            .unwrap();
        alloc.sync(&env, &tops, 7).unwrap();
        root.flush_all().unwrap();

        // A fresh allocator sees the allocation after load.
        let alloc2 = Allocator::new(&tops);
        alloc2.load(&env, &tops, 7).unwrap();
        let (_t, used) = alloc2.space();
        assert_eq!(used, 0x8000);
        // And claiming the same DVA is idempotent.
        alloc2.claim(&dvas[0], 8).unwrap();
        let (_t, used) = alloc2.space();
        assert_eq!(used, 0x8000);
    }

    #[test]
    fn crash_before_sync_discards_allocation() {
        let (_dir, tops, _root) = setup(1);
        let tunables = Tunables::default();
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let env = IoEnv {
            inject: &inject,
            events: &events,
            tunables: &tunables,
        };
        let alloc = Allocator::new(&tops);
        let _ = alloc
            .alloc(&tunables, 0x8000, 1, AllocClass::Normal, 7)
            .unwrap();
        // No sync: a reload sees nothing allocated.
        let alloc2 = Allocator::new(&tops);
        alloc2.load(&env, &tops, 7).unwrap();
        let (_t, used) = alloc2.space();
        assert_eq!(used, 0);
    }
}
