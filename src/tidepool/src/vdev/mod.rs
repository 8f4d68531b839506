// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The vdev tree.
//!
//! Leaves are files; interior vdevs (mirror, raidz) route I/O across
//! their children and carry the redundancy policy. The root aggregates
//! top-level state into pool health.
//!
//! Reads are expressed as *variants*: variant 0 is the preferred way to
//! read (chosen mirror child, direct raidz columns), higher variants are
//! alternate sources (other mirror children, parity reconstructions).
//! The I/O pipeline walks variants until the block checksums, then tells
//! the vdev which variant produced bad data so it can count the error
//! and issue the repair write. That division keeps checksums out of the
//! vdev layer entirely.
//!
//! Each leaf tracks a dirty-time log (DTL) of txgs it missed while
//! unreachable; mirror reads skip children whose DTL covers the block's
//! birth txg, and resilver walks exactly those ranges.

pub mod file;
pub mod queue;
pub mod raidz;

use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tp_allocator::RangeTree;
use tp_utils::metric::{IncMetric, Metric};

use crate::config::Tunables;
use crate::error::{Error, IoErr, Result};
use crate::events::{EventKind, EventRing};
use crate::inject::{InjectKind, InjectRegistry};
use crate::label::{self, LabelConfig, LabelSection, Uberblock, LABEL_START_SIZE};

use self::file::FileLeaf;
use self::queue::IoClass;
use self::raidz::RaidzMap;

/// Static pool topology, as stored in every label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum VdevSpec {
    File { path: String },
    Mirror { children: Vec<VdevSpec> },
    Raidz { nparity: usize, children: Vec<VdevSpec> },
}

impl VdevSpec {
    pub fn leaf_paths(&self) -> Vec<String> {
        match self {
            VdevSpec::File { path } => vec![path.clone()],
            VdevSpec::Mirror { children } | VdevSpec::Raidz { children, .. } => {
                children.iter().flat_map(|c| c.leaf_paths()).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VdevState {
    Closed,
    CantOpen,
    Faulted,
    Offline,
    Removed,
    Degraded,
    Healthy,
}

/// Why a vdev is in a bad state, mirrored into status output and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VdevAux {
    None,
    OpenFailed,
    BadLabel,
    NoReplicas,
    CorruptData,
    IoFailure,
    External,
}

#[derive(Default, Serialize)]
pub struct VdevStats {
    pub read_ops: IncMetric,
    pub write_ops: IncMetric,
    pub read_bytes: IncMetric,
    pub write_bytes: IncMetric,
    pub read_errors: IncMetric,
    pub write_errors: IncMetric,
    pub checksum_errors: IncMetric,
    pub self_healed_bytes: IncMetric,
}

pub enum VdevKind {
    Root,
    Mirror,
    Raidz { nparity: usize },
    File(FileLeaf),
}

/// Everything vdev I/O needs from the pool, passed down per call so the
/// vdev tree never holds a back-reference.
pub struct IoEnv<'a> {
    pub inject: &'a InjectRegistry,
    pub events: &'a EventRing,
    pub tunables: &'a Tunables,
}

pub struct Vdev {
    /// Index within the parent (column index for raidz).
    pub id: u32,
    pub guid: u64,
    /// Index of the top-level vdev this belongs to.
    pub top_id: u32,
    pub kind: VdevKind,
    pub children: Vec<Arc<Vdev>>,
    state: Mutex<(VdevState, VdevAux)>,
    /// Usable bytes for allocation (top-level vdevs; data space for raidz).
    pub asize: AtomicU64,
    pub ashift: AtomicU32,
    /// Txgs this vdev missed.
    pub dtl: Mutex<RangeTree>,
    pub stats: VdevStats,
}

impl Vdev {
    /// Build the in-memory tree from a spec. Guids are deterministic from
    /// the pool guid and position so every label agrees.
    pub fn build(specs: &[VdevSpec], pool_guid: u64, tunables: &Tunables) -> Result<Arc<Vdev>> {
        let mut tops = Vec::new();
        for (top_id, spec) in specs.iter().enumerate() {
            tops.push(Self::build_one(
                spec,
                top_id as u32,
                top_id as u32,
                pool_guid,
                tunables,
            )?);
        }
        Ok(Arc::new(Vdev {
            id: 0,
            guid: pool_guid,
            top_id: 0,
            kind: VdevKind::Root,
            children: tops,
            state: Mutex::new((VdevState::Closed, VdevAux::None)),
            asize: AtomicU64::new(0),
            ashift: AtomicU32::new(0),
            dtl: Mutex::new(RangeTree::new()),
            stats: VdevStats::default(),
        }))
    }

    fn build_one(
        spec: &VdevSpec,
        id: u32,
        top_id: u32,
        pool_guid: u64,
        tunables: &Tunables,
    ) -> Result<Arc<Vdev>> {
        let guid = guid_for(pool_guid, top_id, id, spec);
        let (kind, children) = match spec {
            VdevSpec::File { path } => (
                VdevKind::File(FileLeaf::new(Path::new(path), tunables)),
                Vec::new(),
            ),
            VdevSpec::Mirror { children } => {
                let kids = children
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Self::build_one(c, i as u32, top_id, pool_guid ^ guid, tunables))
                    .collect::<Result<Vec<_>>>()?;
                if kids.iter().any(|k| !k.is_leaf()) {
                    return Err(Error::Config("mirror children must be leaves".into()));
                }
                (VdevKind::Mirror, kids)
            }
            VdevSpec::Raidz { nparity, children } => {
                if *nparity == 0 || *nparity > 3 || children.len() <= *nparity {
                    return Err(Error::Config("bad raidz geometry".into()));
                }
                let kids = children
                    .iter()
                    .enumerate()
                    .map(|(i, c)| Self::build_one(c, i as u32, top_id, pool_guid ^ guid, tunables))
                    .collect::<Result<Vec<_>>>()?;
                if kids.iter().any(|k| !k.is_leaf()) {
                    return Err(Error::Config("raidz children must be leaves".into()));
                }
                (VdevKind::Raidz { nparity: *nparity }, kids)
            }
        };
        Ok(Arc::new(Vdev {
            id,
            guid,
            top_id,
            kind,
            children,
            state: Mutex::new((VdevState::Closed, VdevAux::None)),
            asize: AtomicU64::new(0),
            ashift: AtomicU32::new(12),
            dtl: Mutex::new(RangeTree::new()),
            stats: VdevStats::default(),
        }))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, VdevKind::File(_))
    }

    pub fn leaf(&self) -> Option<&FileLeaf> {
        match &self.kind {
            VdevKind::File(f) => Some(f),
            _ => None,
        }
    }

    pub fn state(&self) -> (VdevState, VdevAux) {
        *self.state.lock().unwrap()
    }

    pub fn set_state(&self, state: VdevState, aux: VdevAux, events: Option<&EventRing>) {
        let mut cur = self.state.lock().unwrap();
        if cur.0 != state {
            debug!(
                "vdev {}: {:?} -> {:?} ({:?})",
                self.guid, cur.0, state, aux
            );
            if let Some(ring) = events {
                ring.post(
                    EventKind::StateChange,
                    Some(self.guid),
                    format!("{:?} -> {:?} ({:?})", cur.0, state, aux),
                );
            }
        }
        *cur = (state, aux);
    }

    pub fn is_readable(&self) -> bool {
        matches!(self.state().0, VdevState::Healthy | VdevState::Degraded)
    }

    /// Open the tree, leaf-first; interior vdevs inherit geometry from
    /// their children. Returns an error only when the tree cannot serve
    /// reads at all.
    pub fn open(&self, env: &IoEnv<'_>) -> Result<()> {
        match &self.kind {
            VdevKind::File(leaf) => match leaf.open() {
                Ok((usable, _dev)) => {
                    self.asize.store(usable, Ordering::Release);
                    self.set_state(VdevState::Healthy, VdevAux::None, Some(env.events));
                    Ok(())
                }
                Err(e) => {
                    warn!("vdev {}: open failed: {}", self.guid, e);
                    self.set_state(VdevState::CantOpen, VdevAux::OpenFailed, Some(env.events));
                    Err(Error::Device(e))
                }
            },
            VdevKind::Mirror => {
                let mut healthy = 0;
                let mut min_asize = u64::MAX;
                for child in &self.children {
                    if child.open(env).is_ok() {
                        healthy += 1;
                        min_asize = min_asize.min(child.asize.load(Ordering::Acquire));
                    }
                }
                self.finish_interior_open(env, healthy, self.children.len(), min_asize, 1)
            }
            VdevKind::Raidz { nparity } => {
                let mut healthy = 0;
                let mut min_asize = u64::MAX;
                for child in &self.children {
                    if child.open(env).is_ok() {
                        healthy += 1;
                        min_asize = min_asize.min(child.asize.load(Ordering::Acquire));
                    }
                }
                let n = self.children.len();
                let needed = n - nparity;
                let result =
                    self.finish_interior_open(env, healthy, n, min_asize, needed)?;
                // Data space: ndata * per-child, row-aligned.
                if min_asize != u64::MAX {
                    let unit = 1u64 << self.ashift.load(Ordering::Acquire);
                    let rows = min_asize / unit;
                    self.asize
                        .store(rows * unit * (n - nparity) as u64, Ordering::Release);
                }
                Ok(result)
            }
            VdevKind::Root => {
                let mut any_bad = false;
                let mut all_bad = true;
                for top in &self.children {
                    match top.open(env) {
                        Ok(()) => all_bad = false,
                        Err(_) => any_bad = true,
                    }
                }
                if all_bad {
                    self.set_state(VdevState::CantOpen, VdevAux::NoReplicas, Some(env.events));
                    return Err(Error::CannotOpen("pool".into(), "no usable top-level vdevs"));
                }
                let state = if any_bad {
                    VdevState::Degraded
                } else {
                    VdevState::Healthy
                };
                self.set_state(state, VdevAux::None, Some(env.events));
                Ok(())
            }
        }
    }

    fn finish_interior_open(
        &self,
        env: &IoEnv<'_>,
        healthy: usize,
        total: usize,
        min_asize: u64,
        needed: usize,
    ) -> Result<()> {
        if healthy < needed {
            self.set_state(VdevState::CantOpen, VdevAux::NoReplicas, Some(env.events));
            return Err(Error::CannotOpen("vdev".into(), "insufficient replicas"));
        }
        self.asize.store(min_asize, Ordering::Release);
        let state = if healthy == total {
            VdevState::Healthy
        } else {
            VdevState::Degraded
        };
        self.set_state(state, VdevAux::None, Some(env.events));
        Ok(())
    }

    pub fn close(&self) {
        for child in &self.children {
            child.close();
        }
        if let Some(leaf) = self.leaf() {
            leaf.close();
        }
        self.set_state(VdevState::Closed, VdevAux::None, None);
    }

    /// Flush every leaf beneath this vdev.
    pub fn flush_all(&self) -> Result<()> {
        if let Some(leaf) = self.leaf() {
            leaf.flush().map_err(Error::Device)?;
        }
        for child in &self.children {
            child.flush_all()?;
        }
        Ok(())
    }

    pub fn for_each_leaf(&self, f: &mut dyn FnMut(&Vdev)) {
        if self.is_leaf() {
            f(self);
        }
        for child in &self.children {
            child.for_each_leaf(f);
        }
    }

    /// Quick liveness probe: read a pad region of label 0.
    pub fn probe(&self) -> bool {
        match self.leaf() {
            Some(leaf) => leaf.raw_read(label::PAD1_OFF, 512).is_ok(),
            None => self.children.iter().any(|c| c.probe()),
        }
    }

    // ---- data-region I/O ------------------------------------------------

    /// Number of distinct ways a read can be satisfied.
    pub fn read_variants(&self) -> usize {
        match &self.kind {
            VdevKind::File(_) => 1,
            VdevKind::Mirror => self.children.len(),
            VdevKind::Raidz { nparity } => {
                let ndata = self.children.len() - nparity;
                // Direct, P-reconstruct each column, Q-reconstruct each
                // column when double parity.
                1 + ndata + if *nparity >= 2 { ndata } else { 0 }
            }
            VdevKind::Root => 1,
        }
    }

    /// Mirror child preference: rotor by offset, children whose DTL
    /// covers the birth txg go last, unreadable children last of all.
    fn mirror_order(&self, offset: u64, birth: u64) -> Vec<usize> {
        let n = self.children.len();
        let preferred = ((offset >> 20) as usize) % n;
        let mut order: Vec<usize> = (0..n).map(|i| (preferred + i) % n).collect();
        order.sort_by_key(|i| {
            let child = &self.children[*i];
            let dtl_miss = birth != 0 && child.dtl.lock().unwrap().contains(birth, 1);
            let unreadable = !child.is_readable();
            // Stable sort keeps the rotor order within each bucket.
            (unreadable as u8) * 2 + (dtl_miss as u8)
        });
        order
    }

    /// Read `len` bytes at data-space `offset`, using the given variant.
    pub fn read_variant(
        &self,
        env: &IoEnv<'_>,
        variant: usize,
        offset: u64,
        len: u64,
        birth: u64,
        class: IoClass,
    ) -> std::result::Result<Vec<u8>, IoErr> {
        match &self.kind {
            VdevKind::File(_) => {
                if variant != 0 {
                    return Err(IoErr::Io);
                }
                self.leaf_read(env, offset, len, class)
            }
            VdevKind::Mirror => {
                let order = self.mirror_order(offset, birth);
                let child_idx = *order.get(variant).ok_or(IoErr::Io)?;
                self.children[child_idx].read_variant(env, 0, offset, len, birth, class)
            }
            VdevKind::Raidz { nparity } => self.raidz_read(env, *nparity, variant, offset, len, class),
            VdevKind::Root => Err(IoErr::Io),
        }
    }

    /// A variant produced data that failed verification upstream: count
    /// it and repair the implicated device from `good`.
    pub fn note_bad_variant(
        &self,
        env: &IoEnv<'_>,
        variant: usize,
        offset: u64,
        birth: u64,
        good: &[u8],
    ) {
        match &self.kind {
            VdevKind::File(_) => {
                self.stats.checksum_errors.inc();
                env.events.post(
                    EventKind::ChecksumError,
                    Some(self.guid),
                    format!("offset {:#x}", offset),
                );
                // Single copy below this leaf: rewrite in place with the
                // good bytes (they came from another DVA or a parent).
                if self
                    .leaf_write(env, offset, good, IoClass::AsyncWrite)
                    .is_ok()
                {
                    self.stats.self_healed_bytes.add(good.len() as u64);
                    env.events.post(
                        EventKind::SelfHealed,
                        Some(self.guid),
                        format!("offset {:#x} len {:#x}", offset, good.len()),
                    );
                }
            }
            VdevKind::Mirror => {
                let order = self.mirror_order(offset, birth);
                if let Some(child_idx) = order.get(variant) {
                    self.children[*child_idx].note_bad_variant(env, 0, offset, birth, good);
                }
            }
            VdevKind::Raidz { nparity } => {
                // Variant k > 0 reconstructed one column; rewrite that
                // column's units from the good data.
                if variant == 0 || good.is_empty() {
                    return;
                }
                let ndata = self.children.len() - nparity;
                let col = (variant - 1) % ndata;
                let ashift = self.ashift.load(Ordering::Acquire);
                let map = RaidzMap::new(
                    offset,
                    round_up(good.len() as u64, (1u64 << ashift) * ndata as u64),
                    ashift,
                    self.children.len(),
                    *nparity,
                );
                let child = &self.children[map.data_child(col)];
                child.stats.checksum_errors.inc();
                env.events.post(
                    EventKind::ChecksumError,
                    Some(child.guid),
                    format!("raidz column {} offset {:#x}", col, offset),
                );
                let cols = split_columns(good, &map);
                let mut healed = 0u64;
                let mut ok = true;
                for (row, data_cols) in cols.iter().enumerate() {
                    let child_off = map.row_child_offset(map.first_row + row as u64);
                    if child
                        .leaf_write(env, child_off, &data_cols[col], IoClass::AsyncWrite)
                        .is_err()
                    {
                        ok = false;
                    } else {
                        healed += map.unit;
                    }
                }
                if ok {
                    child.stats.self_healed_bytes.add(healed);
                    env.events.post(
                        EventKind::SelfHealed,
                        Some(child.guid),
                        format!("raidz column {} offset {:#x}", col, offset),
                    );
                }
            }
            VdevKind::Root => {}
        }
    }

    fn raidz_read(
        &self,
        env: &IoEnv<'_>,
        nparity: usize,
        variant: usize,
        offset: u64,
        len: u64,
        class: IoClass,
    ) -> std::result::Result<Vec<u8>, IoErr> {
        let ashift = self.ashift.load(Ordering::Acquire);
        let ndata = self.children.len() - nparity;
        let row_bytes = (1u64 << ashift) * ndata as u64;
        let padded = round_up(len, row_bytes);
        let map = RaidzMap::new(offset, padded, ashift, self.children.len(), nparity);

        let (recon_col, use_q) = match variant {
            0 => (None, false),
            v if v <= ndata => (Some(v - 1), false),
            v if nparity >= 2 && v <= 2 * ndata => (Some(v - 1 - ndata), true),
            _ => return Err(IoErr::Io),
        };

        let mut out = Vec::with_capacity(padded as usize);
        for r in 0..map.nrows {
            let row = map.first_row + r;
            let child_off = map.row_child_offset(row);
            // Read the data columns we can, reconstructing the chosen one.
            let mut cols: Vec<Option<Vec<u8>>> = Vec::with_capacity(ndata);
            for d in 0..ndata {
                if recon_col == Some(d) {
                    cols.push(None);
                    continue;
                }
                let child = &self.children[map.data_child(d)];
                match child.read_variant(env, 0, child_off, map.unit, 0, class) {
                    Ok(buf) => cols.push(Some(buf)),
                    Err(e) => return Err(e),
                }
            }
            if let Some(missing) = recon_col {
                let parity_idx = if use_q { 1 } else { 0 };
                let pchild = &self.children[parity_idx];
                let pbuf = pchild.read_variant(env, 0, child_off, map.unit, 0, class)?;
                let rebuilt = if use_q {
                    raidz::reconstruct_q(&cols, &pbuf, missing)?
                } else {
                    raidz::reconstruct_p(&cols, &pbuf, missing)?
                };
                cols[missing] = Some(rebuilt);
            }
            for col in cols {
                out.extend_from_slice(&col.unwrap());
            }
        }
        out.truncate(len as usize);
        Ok(out)
    }

    /// Write `data` at data-space `offset`. Interior vdevs fan out;
    /// success requires enough children for later reads.
    pub fn write(
        &self,
        env: &IoEnv<'_>,
        offset: u64,
        data: &[u8],
        txg: u64,
        class: IoClass,
    ) -> std::result::Result<(), IoErr> {
        match &self.kind {
            VdevKind::File(_) => self.leaf_write(env, offset, data, class),
            VdevKind::Mirror => {
                let mut failures = 0;
                for child in &self.children {
                    // A resilvering child only needs writes its DTL says
                    // it is missing plus everything current.
                    match child.leaf_write(env, offset, data, class) {
                        Ok(()) => {}
                        Err(_) => {
                            failures += 1;
                            if txg != 0 {
                                let mut dtl = child.dtl.lock().unwrap();
                                if !dtl.contains(txg, 1) {
                                    let _ = dtl.add(txg, 1);
                                }
                            }
                        }
                    }
                }
                if failures == self.children.len() {
                    Err(IoErr::Io)
                } else {
                    Ok(())
                }
            }
            VdevKind::Raidz { nparity } => {
                let ashift = self.ashift.load(Ordering::Acquire);
                let ndata = self.children.len() - nparity;
                let row_bytes = (1u64 << ashift) * ndata as u64;
                let padded = round_up(data.len() as u64, row_bytes);
                let mut buf = data.to_vec();
                buf.resize(padded as usize, 0);
                let map = RaidzMap::new(offset, padded, ashift, self.children.len(), *nparity);
                let rows = split_columns(&buf, &map);
                let mut failures = 0;
                for (r, data_cols) in rows.iter().enumerate() {
                    let child_off = map.row_child_offset(map.first_row + r as u64);
                    let parity = raidz::generate_parity(data_cols, *nparity);
                    for (p, pbuf) in parity.iter().enumerate() {
                        if self.children[p]
                            .leaf_write(env, child_off, pbuf, class)
                            .is_err()
                        {
                            failures += 1;
                            note_dtl(&self.children[p], txg);
                        }
                    }
                    for (d, dbuf) in data_cols.iter().enumerate() {
                        if self.children[map.data_child(d)]
                            .leaf_write(env, child_off, dbuf, class)
                            .is_err()
                        {
                            failures += 1;
                            note_dtl(&self.children[map.data_child(d)], txg);
                        }
                    }
                }
                if failures > *nparity * map.nrows as usize {
                    Err(IoErr::Io)
                } else {
                    Ok(())
                }
            }
            VdevKind::Root => Err(IoErr::Io),
        }
    }

    fn leaf_read(
        &self,
        env: &IoEnv<'_>,
        offset: u64,
        len: u64,
        class: IoClass,
    ) -> std::result::Result<Vec<u8>, IoErr> {
        let leaf = match self.leaf() {
            Some(l) => l,
            None => return Err(IoErr::Io),
        };
        if let Some(InjectKind::DeviceFault) = env.inject.check_device(self.guid) {
            self.stats.read_errors.inc();
            return Err(IoErr::Io);
        }
        let result = leaf.queue.run_read(class, offset, || {
            leaf.raw_read(LABEL_START_SIZE + offset, len as usize)
                .map_err(|_| IoErr::Io)
        });
        match &result {
            Ok(buf) => {
                self.stats.read_ops.inc();
                self.stats.read_bytes.add(buf.len() as u64);
            }
            Err(_) => {
                self.stats.read_errors.inc();
                env.events.post(
                    EventKind::IoError,
                    Some(self.guid),
                    format!("read {:#x}+{:#x}", offset, len),
                );
            }
        }
        result
    }

    fn leaf_write(
        &self,
        env: &IoEnv<'_>,
        offset: u64,
        data: &[u8],
        class: IoClass,
    ) -> std::result::Result<(), IoErr> {
        let leaf = match self.leaf() {
            Some(l) => l,
            None => return Err(IoErr::Io),
        };
        if let Some(InjectKind::DeviceFault) = env.inject.check_device(self.guid) {
            self.stats.write_errors.inc();
            return Err(IoErr::Io);
        }
        let result = leaf
            .queue
            .run_write(class, offset, data.to_vec(), |merged_off, merged| {
                leaf.raw_write(LABEL_START_SIZE + merged_off, merged)
                    .map_err(|_| IoErr::Io)
            });
        match &result {
            Ok(()) => {
                self.stats.write_ops.inc();
                self.stats.write_bytes.add(data.len() as u64);
            }
            Err(_) => {
                self.stats.write_errors.inc();
                env.events.post(
                    EventKind::IoError,
                    Some(self.guid),
                    format!("write {:#x}+{:#x}", offset, data.len()),
                );
            }
        }
        result
    }

    // ---- labels ---------------------------------------------------------

    /// Write the config region of all four labels, two-staged: even
    /// labels, flush, odd labels, flush.
    pub fn write_label_configs(&self, env: &IoEnv<'_>, config: &LabelConfig) -> Result<()> {
        let leaf = self.leaf().ok_or(Error::Label("not a leaf"))?;
        let offsets = label::label_offsets(leaf.dev_size());
        for phase in 0..2 {
            for (i, label_off) in offsets.iter().enumerate() {
                if i % 2 != phase {
                    continue;
                }
                if env.inject.check_label(self.guid, LabelSection::Nvlist) {
                    env.events.post(
                        EventKind::LabelError,
                        Some(self.guid),
                        format!("injected nvlist fault on label {}", i),
                    );
                    continue;
                }
                let region = label::encode_config_region(config, *label_off)?;
                leaf.raw_write(label_off + label::NVLIST_OFF, &region)
                    .map_err(Error::Device)?;
            }
            leaf.flush().map_err(Error::Device)?;
        }
        Ok(())
    }

    /// Best readable config among the four labels.
    pub fn read_label_config(&self, env: &IoEnv<'_>) -> Result<LabelConfig> {
        let leaf = self.leaf().ok_or(Error::Label("not a leaf"))?;
        let offsets = label::label_offsets(leaf.dev_size());
        let mut last_err = Error::Label("no readable label");
        for label_off in offsets.iter() {
            if env.inject.check_label(self.guid, LabelSection::Nvlist) {
                continue;
            }
            match leaf.raw_read(label_off + label::NVLIST_OFF, label::NVLIST_SIZE as usize) {
                Ok(mut region) => match label::decode_config_region(&mut region, *label_off) {
                    Ok(cfg) => return Ok(cfg),
                    Err(e) => last_err = e,
                },
                Err(e) => last_err = Error::Device(e),
            }
        }
        self.set_state(VdevState::CantOpen, VdevAux::BadLabel, Some(env.events));
        Err(last_err)
    }

    /// Write `ub` into its ring slot on all four labels, even labels
    /// first, flushing between phases, so one intact copy always exists.
    pub fn write_uberblock(&self, env: &IoEnv<'_>, ub: &Uberblock) -> Result<()> {
        let leaf = self.leaf().ok_or(Error::Label("not a leaf"))?;
        let offsets = label::label_offsets(leaf.dev_size());
        let slot = Uberblock::slot(ub.txg);
        let mut wrote = 0;
        for phase in 0..2 {
            for (i, label_off) in offsets.iter().enumerate() {
                if i % 2 != phase {
                    continue;
                }
                if env.inject.check_label(self.guid, LabelSection::Uberblock) {
                    env.events.post(
                        EventKind::LabelError,
                        Some(self.guid),
                        format!("injected uberblock fault on label {}", i),
                    );
                    continue;
                }
                let slot_off = label_off + label::UBER_RING_OFF + slot * label::UBER_SLOT_SIZE;
                let mut buf = vec![0u8; label::UBER_SLOT_SIZE as usize];
                ub.encode(&mut buf, slot_off)?;
                leaf.raw_write(slot_off, &buf).map_err(Error::Device)?;
                wrote += 1;
            }
            leaf.flush().map_err(Error::Device)?;
        }
        if wrote == 0 {
            return Err(Error::Label("no uberblock copy written"));
        }
        Ok(())
    }

    /// Scan all labels and slots for the newest valid uberblock.
    pub fn find_best_uberblock(&self, env: &IoEnv<'_>) -> Option<Uberblock> {
        let leaf = self.leaf()?;
        let offsets = label::label_offsets(leaf.dev_size());
        let mut best: Option<Uberblock> = None;
        for label_off in offsets.iter() {
            if env.inject.check_label(self.guid, LabelSection::Uberblock) {
                continue;
            }
            for slot in 0..label::UBER_SLOTS {
                let slot_off = label_off + label::UBER_RING_OFF + slot * label::UBER_SLOT_SIZE;
                let mut buf = match leaf.raw_read(slot_off, label::UBER_SLOT_SIZE as usize) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if let Ok(ub) = Uberblock::decode(&mut buf, slot_off) {
                    if best.as_ref().map_or(true, |b| ub.is_newer_than(b)) {
                        best = Some(ub);
                    }
                }
            }
        }
        best
    }
}

fn note_dtl(child: &Vdev, txg: u64) {
    if txg != 0 {
        let mut dtl = child.dtl.lock().unwrap();
        if !dtl.contains(txg, 1) {
            let _ = dtl.add(txg, 1);
        }
    }
}

fn round_up(v: u64, to: u64) -> u64 {
    (v + to - 1) / to * to
}

/// Split a row-aligned buffer into per-row data columns.
fn split_columns(buf: &[u8], map: &RaidzMap) -> Vec<Vec<Vec<u8>>> {
    let unit = map.unit as usize;
    let ndata = map.ndata();
    let mut rows = Vec::with_capacity(map.nrows as usize);
    for row in buf.chunks(unit * ndata) {
        let mut cols = Vec::with_capacity(ndata);
        for c in 0..ndata {
            let start = c * unit;
            let end = ((c + 1) * unit).min(row.len());
            let mut col = if start < row.len() {
                row[start..end].to_vec()
            } else {
                Vec::new()
            };
            col.resize(unit, 0);
            cols.push(col);
        }
        rows.push(cols);
    }
    rows
}

fn guid_for(pool_guid: u64, top_id: u32, id: u32, spec: &VdevSpec) -> u64 {
    // Deterministic guid so every label names the same tree.
    let mut h = pool_guid ^ 0x9e37_79b9_7f4a_7c15;
    h = h
        .wrapping_mul(0x100_0000_01b3)
        .wrapping_add(u64::from(top_id) << 32 | u64::from(id));
    if let VdevSpec::File { path } = spec {
        for b in path.as_bytes() {
            h = (h ^ u64::from(*b)).wrapping_mul(0x100_0000_01b3);
        }
    }
    h | 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::PathBuf;

    fn scratch_files(dir: &tempfile::TempDir, n: usize, len: u64) -> Vec<PathBuf> {
        (0..n)
            .map(|i| {
                let path = dir.path().join(format!("leaf{}", i));
                let mut f = File::create(&path).unwrap();
                f.write_all(&vec![0u8; len as usize]).unwrap();
                path
            })
            .collect()
    }

    fn env<'a>(
        inject: &'a InjectRegistry,
        events: &'a EventRing,
        tunables: &'a Tunables,
    ) -> IoEnv<'a> {
        IoEnv {
            inject,
            events,
            tunables,
        }
    }

    fn mirror_spec(paths: &[PathBuf]) -> Vec<VdevSpec> {
        vec![VdevSpec::Mirror {
            children: paths
                .iter()
                .map(|p| VdevSpec::File {
                    path: p.to_string_lossy().into_owned(),
                })
                .collect(),
        }]
    }

    #[test]
    fn mirror_reads_survive_one_dead_child() {
        let dir = tempfile::tempdir().unwrap();
        let paths = scratch_files(&dir, 2, 8 * 1024 * 1024);
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let tunables = Tunables::default();
        let e = env(&inject, &events, &tunables);

        let root = Vdev::build(&mirror_spec(&paths), 0xabc, &tunables).unwrap();
        root.open(&e).unwrap();
        let top = &root.children[0];
        top.write(&e, 0, &vec![7u8; 4096], 1, IoClass::SyncWrite)
            .unwrap();

        // Both variants read the same data.
        let a = top
            .read_variant(&e, 0, 0, 4096, 1, IoClass::SyncRead)
            .unwrap();
        let b = top
            .read_variant(&e, 1, 0, 4096, 1, IoClass::SyncRead)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a, vec![7u8; 4096]);

        // Fault child 0: variant walk still finds the data.
        let g0 = top.children[0].guid;
        inject.add(InjectKind::DeviceFault, Some(g0), None, u64::MAX);
        let mut got = None;
        for v in 0..top.read_variants() {
            if let Ok(buf) = top.read_variant(&e, v, 0, 4096, 1, IoClass::SyncRead) {
                got = Some(buf);
                break;
            }
        }
        assert_eq!(got.unwrap(), vec![7u8; 4096]);
        assert!(top.children[0].stats.read_errors.count() >= 1);
    }

    #[test]
    fn mirror_write_records_dtl_on_failed_child() {
        let dir = tempfile::tempdir().unwrap();
        let paths = scratch_files(&dir, 2, 8 * 1024 * 1024);
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let tunables = Tunables::default();
        let e = env(&inject, &events, &tunables);
        let root = Vdev::build(&mirror_spec(&paths), 0xabc, &tunables).unwrap();
        root.open(&e).unwrap();
        let top = &root.children[0];
        let g1 = top.children[1].guid;
        inject.add(InjectKind::DeviceFault, Some(g1), None, 1);
        top.write(&e, 0, &vec![1u8; 4096], 33, IoClass::AsyncWrite)
            .unwrap();
        assert!(top.children[1].dtl.lock().unwrap().contains(33, 1));
        // Reads of blocks born at txg 33 now prefer child 0.
        let order = top.mirror_order(0, 33);
        assert_eq!(*order.last().unwrap(), 1);
    }

    #[test]
    fn raidz_roundtrip_and_reconstruction_variants() {
        let dir = tempfile::tempdir().unwrap();
        let paths = scratch_files(&dir, 4, 8 * 1024 * 1024);
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let tunables = Tunables::default();
        let e = env(&inject, &events, &tunables);
        let spec = vec![VdevSpec::Raidz {
            nparity: 1,
            children: paths
                .iter()
                .map(|p| VdevSpec::File {
                    path: p.to_string_lossy().into_owned(),
                })
                .collect(),
        }];
        let root = Vdev::build(&spec, 0xdef, &tunables).unwrap();
        root.open(&e).unwrap();
        let top = &root.children[0];

        let data: Vec<u8> = (0..65536u32)
            .map(|i| (i ^ 0xa5) as u8)
            .collect();
        top.write(&e, 0, &data, 5, IoClass::SyncWrite).unwrap();

        for v in 0..top.read_variants() {
            let got = top
                .read_variant(&e, v, 0, data.len() as u64, 5, IoClass::SyncRead)
                .unwrap();
            assert_eq!(got, data, "variant {}", v);
        }
    }

    #[test]
    fn root_aggregates_state() {
        let dir = tempfile::tempdir().unwrap();
        let paths = scratch_files(&dir, 1, 8 * 1024 * 1024);
        let inject = InjectRegistry::new();
        let events = EventRing::new();
        let tunables = Tunables::default();
        let e = env(&inject, &events, &tunables);
        let spec = vec![VdevSpec::File {
            path: paths[0].to_string_lossy().into_owned(),
        }];
        let root = Vdev::build(&spec, 1, &tunables).unwrap();
        root.open(&e).unwrap();
        assert_eq!(root.state().0, VdevState::Healthy);
        assert!(events.count(EventKind::StateChange) >= 1);
    }
}
