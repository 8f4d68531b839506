// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The storage pool allocator: pool lifecycle and the context object
//! every subsystem hangs off.
//!
//! A [`PoolCore`] owns the vdev tree, the block cache, the allocator,
//! the dedup table, the dataset layer and the txg engine, constructed
//! leaf-first and torn down in reverse. There are no process-wide
//! singletons here; only the crypto/checksum provider registries are
//! global, as they describe algorithms, not state.
//!
//! Commit protocol: when a txg has work, the sync thread flushes dataset
//! dirty state, dedup state and the meta objset, then the space maps,
//! and finally writes the new uberblock into every leaf's label ring
//! and flushes. Until that flush returns, the previous uberblock is the
//! pool; after it, the new one is. There is no in-between on disk.

pub mod scan;
pub mod stats;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::arc::{ArcAccess, ArcCache, ArcKey, BufType};
use crate::blkptr::{BlockPtr, Dva, ObjType};
use crate::config::{Failmode, Tunables};
use crate::ddt::{Ddt, DdtKey, DdtStoreSet};
use crate::dmu::dbuf::DbufHash;
use crate::dmu::{self, tx::DmuTxBuilder};
use crate::dsl::{Dataset, DatasetConfig, DslPool};
use crate::error::{Error, IoErr, Result};
use crate::events::{EventKind, EventRing};
use crate::inject::InjectRegistry;
use crate::l2arc::L2Device;
use crate::label::{LabelConfig, Uberblock, POOL_VERSION, UBERBLOCK_MAGIC};
use crate::metaslab::Allocator;
use crate::txg::{TxgEngine, TxgHold};
use crate::vdev::queue::IoClass;
use crate::vdev::{IoEnv, Vdev, VdevSpec};
use crate::zil::{self, ItxRecord};
use crate::zio::{flags as zflags, CryptCtx, Zio};
use tp_utils::deadman::{Deadman, DeadmanConfig, DeadmanHandle, OpClass};
use tp_utils::Taskq;

/// Txgs an import skips past the last committed uberblock. A crash can
/// leave device writes (encrypted payloads included) issued under txgs
/// that never committed; starting beyond every txg the dead process
/// could have opened guarantees their AEAD nonces are never reissued
/// under the same keys.
const TXG_IMPORT_SLACK: u64 = 8;

pub struct PoolCore {
    pub name: String,
    pub guid: u64,
    pub tunables: Tunables,
    pub inject: InjectRegistry,
    pub events: EventRing,
    pub dbufs: DbufHash,
    pub arc: ArcCache,
    pub ddt: Ddt,
    root_vdev: RwLock<Option<Arc<Vdev>>>,
    tops: RwLock<Vec<Arc<Vdev>>>,
    allocator: RwLock<Option<Allocator>>,
    l2devs: RwLock<Vec<Arc<L2Device>>>,
    txg: Mutex<Option<TxgEngine>>,
    dsl: RwLock<Option<Arc<DslPool>>>,
    ddt_store: DdtStoreSet,
    zio_taskq: Taskq,
    deadman: Mutex<Option<Deadman>>,
    dirty: AtomicU64,
    iv_counter: AtomicU64,
    mmp_seq: AtomicU64,
    suspended: Mutex<Option<String>>,
    suspend_cv: Condvar,
    shutdown: AtomicBool,
    feed_thread: Mutex<Option<thread::JoinHandle<()>>>,
    mmp_thread: Mutex<Option<thread::JoinHandle<()>>>,
    multihost: bool,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl PoolCore {
    fn new(name: &str, guid: u64, tunables: Tunables, multihost: bool) -> Arc<PoolCore> {
        let workers = num_cpus::get().max(2);
        Arc::new(PoolCore {
            name: name.to_string(),
            guid,
            arc: ArcCache::new(&tunables),
            tunables,
            inject: InjectRegistry::new(),
            events: EventRing::new(),
            dbufs: DbufHash::new(),
            ddt: Ddt::new(),
            root_vdev: RwLock::new(None),
            tops: RwLock::new(Vec::new()),
            allocator: RwLock::new(None),
            l2devs: RwLock::new(Vec::new()),
            txg: Mutex::new(None),
            dsl: RwLock::new(None),
            ddt_store: crate::dsl::ddt_store_set(),
            zio_taskq: Taskq::new("zio_issue", workers),
            deadman: Mutex::new(None),
            dirty: AtomicU64::new(0),
            iv_counter: AtomicU64::new(1),
            mmp_seq: AtomicU64::new(1),
            suspended: Mutex::new(None),
            suspend_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            feed_thread: Mutex::new(None),
            mmp_thread: Mutex::new(None),
            multihost,
        })
    }

    // ---- context accessors used across the engine ----------------------

    pub fn io_env(&self) -> IoEnv<'_> {
        IoEnv {
            inject: &self.inject,
            events: &self.events,
            tunables: &self.tunables,
        }
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn zio_taskq(&self) -> &Taskq {
        &self.zio_taskq
    }

    pub fn top_vdev(&self, id: u32) -> Option<Arc<Vdev>> {
        self.tops.read().unwrap().get(id as usize).cloned()
    }

    pub fn root_vdev(&self) -> Option<Arc<Vdev>> {
        self.root_vdev.read().unwrap().clone()
    }

    pub fn allocator(&self) -> impl std::ops::Deref<Target = Allocator> + '_ {
        struct Guard<'a>(std::sync::RwLockReadGuard<'a, Option<Allocator>>);
        impl<'a> std::ops::Deref for Guard<'a> {
            type Target = Allocator;
            fn deref(&self) -> &Allocator {
                self.0.as_ref().expect("allocator not initialized")
            }
        }
        Guard(self.allocator.read().unwrap())
    }

    pub fn dsl(&self) -> Arc<DslPool> {
        self.dsl
            .read()
            .unwrap()
            .clone()
            .expect("dsl not initialized")
    }

    /// Per-process uniquifier for AEAD nonces. The nonce's first word is
    /// the write's txg; this sequence only breaks ties between the
    /// writes of one txg, so its reset at process start is harmless: a
    /// fresh process always runs in txgs no prior process ever used.
    pub fn next_iv_seq(&self) -> u32 {
        self.iv_counter.fetch_add(1, Ordering::Relaxed) as u32
    }

    pub fn add_dirty_bytes(&self, n: u64) {
        self.dirty.fetch_add(n, Ordering::Relaxed);
    }

    pub fn sub_dirty_bytes(&self, n: u64) {
        let cur = self.dirty.load(Ordering::Relaxed);
        self.dirty.store(cur.saturating_sub(n), Ordering::Relaxed);
    }

    pub fn dirty_bytes(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn deadman_track(&self, desc: &str) -> Option<DeadmanHandle> {
        self.deadman
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.track(OpClass::Io, desc.to_string()))
    }

    // ---- txg plumbing ---------------------------------------------------

    pub fn txg_hold_open(&self) -> TxgHold {
        self.txg
            .lock()
            .unwrap()
            .as_ref()
            .expect("txg engine not running")
            .hold_open()
    }

    pub fn txg_wait_all(&self) {
        let engine = self.txg.lock().unwrap();
        if let Some(e) = engine.as_ref() {
            e.wait_all_synced();
        }
    }

    /// Wait for at least one txg to retire (the hard throttle).
    pub fn txg_wait_one(&self) {
        let target = {
            let engine = self.txg.lock().unwrap();
            match engine.as_ref() {
                Some(e) => e.synced_txg() + 1,
                None => return,
            }
        };
        let engine = self.txg.lock().unwrap();
        if let Some(e) = engine.as_ref() {
            e.wait_synced(target);
        }
    }

    pub fn txg_kick_and_wait(&self) {
        self.txg_wait_all();
    }

    pub fn synced_txg(&self) -> u64 {
        self.txg
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.synced_txg())
            .unwrap_or(0)
    }

    pub fn open_txg(&self) -> u64 {
        self.txg
            .lock()
            .unwrap()
            .as_ref()
            .map(|e| e.open_txg())
            .unwrap_or(0)
    }

    // ---- suspension -----------------------------------------------------

    pub fn is_suspended(&self) -> bool {
        self.suspended.lock().unwrap().is_some()
    }

    pub fn suspend(&self, reason: &str) {
        let mut s = self.suspended.lock().unwrap();
        if s.is_none() {
            warn!("pool '{}' suspended: {}", self.name, reason);
            self.events
                .post(EventKind::PoolSuspended, None, reason.to_string());
            *s = Some(reason.to_string());
        }
    }

    pub fn resume(&self) {
        let mut s = self.suspended.lock().unwrap();
        if s.take().is_some() {
            info!("pool '{}' resumed", self.name);
            self.events.post(EventKind::PoolResumed, None, String::new());
        }
        drop(s);
        self.suspend_cv.notify_all();
    }

    /// I/O barrier: under `failmode=wait` a suspended pool parks the
    /// caller until resume; under `continue` it errors out.
    pub fn suspend_barrier(&self) -> std::result::Result<(), IoErr> {
        let mut s = self.suspended.lock().unwrap();
        while s.is_some() {
            match self.tunables.failmode {
                Failmode::Continue => return Err(IoErr::Suspended),
                Failmode::Panic => panic!("pool suspended with failmode=panic"),
                Failmode::Wait => {
                    s = self.suspend_cv.wait(s).unwrap();
                }
            }
        }
        Ok(())
    }

    pub fn flush_all_vdevs(&self) -> Result<()> {
        if let Some(root) = self.root_vdev() {
            root.flush_all()?;
        }
        Ok(())
    }

    // ---- dedup hooks (called from the write/free pipeline) -------------

    pub fn ddt_lookup_ref(&self, key: &DdtKey, txg: u64) -> Option<(Vec<Dva>, u64)> {
        self.ddt.lookup_ref(key, txg)
    }

    pub fn ddt_insert_miss(&self, bp: &BlockPtr, _lsize: u32, txg: u64) {
        let key = DdtKey::from_bp(bp);
        self.ddt.insert_miss(key, bp.dva, bp.birth, txg);
    }

    pub fn ddt_decref(&self, bp: &BlockPtr, txg: u64) -> bool {
        let key = DdtKey::from_bp(bp);
        self.ddt.decref(&key, txg)
    }

    // ---- the cached read path ------------------------------------------

    /// Read a block through ARC and L2ARC, verifying, healing and
    /// decrypting along the way. Returns logical bytes.
    pub fn read_block(
        self: &Arc<Self>,
        bp: &BlockPtr,
        crypt: Option<Arc<CryptCtx>>,
        typ: BufType,
        bookmark: Option<(u64, u64, u8, u64)>,
        speculative: bool,
    ) -> std::result::Result<Vec<u8>, IoErr> {
        if bp.is_hole() {
            return Ok(vec![0u8; bp.lsize as usize]);
        }
        if bp.is_embedded() {
            let zio = Zio::read(Arc::clone(self), bp.clone(), 0, IoClass::SyncRead, crypt);
            return zio.wait().map(|o| o.data.unwrap_or_default());
        }
        let key = ArcKey {
            vdev: bp.dva[0].vdev,
            offset: bp.dva[0].offset,
            birth: bp.physical_birth(),
        };
        let (frequent, l2_resident) = match self.arc.access(&key) {
            ArcAccess::Hit(data) => return Ok((*data).clone()),
            ArcAccess::L2Only { frequent } => (frequent, true),
            ArcAccess::GhostHit => (true, false),
            ArcAccess::Miss => (false, false),
        };
        let compressed_ok = self.arc.compressed_enabled() && crypt.is_none() && !bp.is_gang();

        // The header says the payload lives on an L2 device. L2 reads
        // verify their own checksum; a vanished or corrupt copy drops
        // the identity and falls through to the main pool.
        if l2_resident {
            for l2 in self.l2devs.read().unwrap().iter() {
                if let Some((data, compressed, comp, lsize)) = l2.read(&key) {
                    let logical = if compressed {
                        match tp_compress::decompress(comp, &data, lsize as usize) {
                            Ok(d) => d,
                            Err(_) => continue,
                        }
                    } else {
                        data.clone()
                    };
                    self.arc
                        .insert(key, typ, data, compressed, comp, lsize, frequent);
                    self.arc.mark_l2(&key);
                    return Ok(logical);
                }
            }
            self.arc.forget_l2only(&key);
        }

        let mut flags = 0;
        if speculative {
            flags |= zflags::SPECULATIVE;
        }
        // With compressed-arc on, fetch the physical image and keep it.
        let raw = compressed_ok && bp.compress != tp_compress::CompressId::Off;
        if raw {
            flags |= zflags::RAW;
        }
        let zio = Zio::read(
            Arc::clone(self),
            bp.clone(),
            flags,
            if speculative {
                IoClass::AsyncRead
            } else {
                IoClass::SyncRead
            },
            crypt,
        );
        if let Some((os, obj, lvl, blkid)) = bookmark {
            zio.set_bookmark(os, obj, lvl, blkid);
        }
        let outcome = zio.wait()?;
        let data = outcome.data.ok_or(IoErr::Io)?;
        let logical = if raw {
            tp_compress::decompress(bp.compress, &data, bp.lsize as usize)
                .map_err(|_| IoErr::Checksum)?
        } else {
            data.clone()
        };
        self.arc.insert(
            key,
            typ,
            data,
            raw,
            bp.compress,
            bp.lsize,
            frequent,
        );
        Ok(logical)
    }

    // ---- sync -----------------------------------------------------------

    /// One txg's worth of durability. Runs on the sync thread only.
    fn spa_sync(self: &Arc<Self>, txg: u64) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let dsl = match self.dsl.read().unwrap().clone() {
            Some(d) => d,
            None => return,
        };
        let _sync_guard = self
            .deadman
            .lock()
            .unwrap()
            .as_ref()
            .map(|d| d.track(OpClass::Sync, format!("txg {} sync", txg)));

        dsl.run_sync_tasks(txg);

        let datasets = dsl.open_datasets();
        let mut busy = false;
        for ds in &datasets {
            if ds.os.is_dirty(txg) {
                busy = true;
                if let Err(e) = dsl.sync_dataset(self, ds, txg) {
                    warn!("txg {}: dataset '{}' sync failed: {}", txg, ds.name, e);
                    self.suspend("dataset sync failure");
                }
            }
        }

        let ddt_changed = self.ddt.sync(txg);
        if ddt_changed {
            busy = true;
            if let Err(e) = self.ddt_store.persist(self, &dsl.mos, &self.ddt, txg) {
                warn!("txg {}: dedup store persist failed: {}", txg, e);
            }
        }

        busy = busy || dsl.mos.is_dirty(txg);
        if !busy {
            // Nothing happened this txg; keep the old uberblock.
            return;
        }

        let rootbp = match dsl.sync_mos(self, txg) {
            Ok(bp) => bp,
            Err(e) => {
                warn!("txg {}: meta objset sync failed: {}", txg, e);
                self.suspend("meta objset sync failure");
                return;
            }
        };

        for ds in &datasets {
            zil::zil_sync(self, &ds.os, &ds.zilog, txg);
        }

        {
            let env = self.io_env();
            let tops = self.tops.read().unwrap().clone();
            if let Err(e) = self.allocator().sync(&env, &tops, txg) {
                warn!("txg {}: space map sync failed: {}", txg, e);
            }
        }

        // The commit point: the new uberblock on every leaf, flushed.
        let ub = Uberblock {
            magic: UBERBLOCK_MAGIC,
            version: POOL_VERSION,
            txg,
            guid_sum: self.guid,
            timestamp: now_secs(),
            rootbp,
            mmp_seq: self.mmp_seq.load(Ordering::Relaxed),
            mmp_delay_ns: self.tunables.zfs_multihost_interval * 1_000_000,
        };
        let env = self.io_env();
        let mut wrote = 0usize;
        let mut leaves = 0usize;
        if let Some(root) = self.root_vdev() {
            root.for_each_leaf(&mut |leaf| {
                leaves += 1;
                if leaf.write_uberblock(&env, &ub).is_ok() {
                    wrote += 1;
                }
            });
        }
        if wrote == 0 && leaves > 0 {
            self.suspend("uberblock write failure");
            return;
        }
        if let Err(e) = self.flush_all_vdevs() {
            warn!("txg {}: flush failed: {}", txg, e);
        }
        debug!("txg {} committed ({} of {} leaves)", txg, wrote, leaves);
    }

    fn start_txg_engine(self: &Arc<Self>, first_txg: u64) {
        let weak = Arc::downgrade(self);
        let engine = TxgEngine::start(
            first_txg,
            Duration::from_secs(self.tunables.zfs_txg_timeout.max(1)),
            move |txg| {
                if let Some(pool) = weak.upgrade() {
                    pool.spa_sync(txg);
                }
            },
        );
        *self.txg.lock().unwrap() = Some(engine);
    }

    fn start_deadman(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let failmode = self.tunables.zfs_deadman_failmode;
        let deadman = Deadman::new(
            DeadmanConfig {
                synctime_ms: self.tunables.zfs_deadman_synctime_ms,
                ziotime_ms: self.tunables.zfs_deadman_ziotime_ms,
                check_interval_ms: 500,
            },
            move |_class, desc, elapsed| {
                if let Some(pool) = weak.upgrade() {
                    pool.events.post(
                        EventKind::DeadmanFired,
                        None,
                        format!("{} outstanding {}ms", desc, elapsed.as_millis()),
                    );
                    match failmode {
                        Failmode::Panic => panic!("deadman: {} hung", desc),
                        Failmode::Wait => pool.suspend("deadman"),
                        Failmode::Continue => {}
                    }
                }
            },
        );
        *self.deadman.lock().unwrap() = Some(deadman);
    }

    fn start_l2_feed(self: &Arc<Self>) {
        if self.l2devs.read().unwrap().is_empty() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = Duration::from_secs(self.tunables.zfs_l2arc_feed_secs.max(1));
        let handle = thread::Builder::new()
            .name("l2arc_feed".into())
            .spawn(move || loop {
                thread::sleep(interval);
                let pool = match weak.upgrade() {
                    Some(p) => p,
                    None => return,
                };
                if pool.shutdown.load(Ordering::Acquire) {
                    return;
                }
                pool.l2_feed_pass();
            })
            .expect("spawn l2arc_feed");
        *self.feed_thread.lock().unwrap() = Some(handle);
    }

    /// One feed pass: scan the cold end of the cache and spill eligible
    /// buffers to the L2 devices.
    pub fn l2_feed_pass(&self) {
        let l2devs = self.l2devs.read().unwrap().clone();
        if l2devs.is_empty() {
            return;
        }
        let candidates = self.arc.feed_candidates(64);
        for dev in l2devs.iter() {
            let batch: Vec<_> = candidates
                .iter()
                .filter(|(k, ..)| !dev.contains(k))
                .cloned()
                .collect();
            if batch.is_empty() {
                continue;
            }
            if let Err(e) = dev.feed(&self.tunables, &batch) {
                warn!("l2arc feed: {}", e);
            }
            // Headers of fed buffers become l2-resident: eviction keeps
            // their identity as l2-only instead of ghosting it.
            for (key, ..) in &batch {
                if dev.contains(key) {
                    self.arc.mark_l2(key);
                }
            }
        }
    }

    fn start_mmp(self: &Arc<Self>) {
        if !self.multihost {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = Duration::from_millis(self.tunables.zfs_multihost_interval.max(100));
        let fail_intervals = self.tunables.zfs_multihost_fail_intervals;
        let handle = thread::Builder::new()
            .name("mmp".into())
            .spawn(move || {
                let mut failures = 0u64;
                loop {
                    thread::sleep(interval);
                    let pool = match weak.upgrade() {
                        Some(p) => p,
                        None => return,
                    };
                    if pool.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    if pool.mmp_write_heartbeat() {
                        failures = 0;
                    } else {
                        failures += 1;
                        if fail_intervals > 0 && failures >= fail_intervals {
                            pool.suspend("multihost heartbeat failure");
                        }
                    }
                }
            })
            .expect("spawn mmp");
        *self.mmp_thread.lock().unwrap() = Some(handle);
    }

    /// Rewrite the current uberblock slot with a bumped heartbeat
    /// sequence, proving this host still owns the pool.
    fn mmp_write_heartbeat(self: &Arc<Self>) -> bool {
        let dsl = match self.dsl.read().unwrap().clone() {
            Some(d) => d,
            None => return false,
        };
        let txg = self.synced_txg();
        if txg == 0 {
            return true;
        }
        let rootbp = dsl.mos.last_rootbp.lock().unwrap().clone();
        let ub = Uberblock {
            magic: UBERBLOCK_MAGIC,
            version: POOL_VERSION,
            txg,
            guid_sum: self.guid,
            timestamp: now_secs(),
            rootbp,
            mmp_seq: self.mmp_seq.fetch_add(1, Ordering::Relaxed) + 1,
            mmp_delay_ns: self.tunables.zfs_multihost_interval * 1_000_000,
        };
        let env = self.io_env();
        let mut ok = false;
        if let Some(root) = self.root_vdev() {
            root.for_each_leaf(&mut |leaf| {
                if leaf.write_uberblock(&env, &ub).is_ok() {
                    ok = true;
                }
            });
        }
        ok
    }
}

/// The public handle: a pool open in this process.
pub struct Pool {
    pub core: Arc<PoolCore>,
}

impl Pool {
    /// Create a pool on pre-sized files/devices and bring it online.
    pub fn create(
        name: &str,
        specs: &[VdevSpec],
        tunables: Tunables,
        l2_paths: &[String],
    ) -> Result<Pool> {
        tunables.validate()?;
        tunables.apply_global()?;
        let guid = now_secs()
            .wrapping_mul(0x9e37_79b9_7f4a_7c15)
            ^ name.bytes().fold(0u64, |a, b| a.wrapping_mul(31) ^ u64::from(b))
            | 1;
        let multihost = tunables.multihost;
        let core = PoolCore::new(name, guid, tunables, multihost);

        let root = Vdev::build(specs, guid, &core.tunables)?;
        {
            let env = core.io_env();
            root.open(&env)?;
        }
        *core.tops.write().unwrap() = root.children.clone();
        *core.root_vdev.write().unwrap() = Some(Arc::clone(&root));

        // Stamp every leaf's labels with the shared config.
        {
            let env = core.io_env();
            let mut result = Ok(());
            root.for_each_leaf(&mut |leaf| {
                let config = LabelConfig {
                    pool_name: name.to_string(),
                    pool_guid: guid,
                    version: POOL_VERSION,
                    leaf_guid: leaf.guid,
                    top_id: leaf.top_id,
                    ashift: 12,
                    vdev_tree: specs.to_vec(),
                    multihost,
                };
                if result.is_ok() {
                    result = leaf.write_label_configs(&env, &config);
                }
            });
            result?;
        }

        *core.allocator.write().unwrap() = Some(Allocator::new(&core.tops.read().unwrap()));
        core.open_l2(l2_paths, false)?;

        // The first txg builds the meta objset.
        let first_txg = 1;
        let dsl = Arc::new(DslPool::create(&core, first_txg)?);
        *core.dsl.write().unwrap() = Some(dsl);
        core.start_txg_engine(first_txg);
        core.start_deadman();
        core.start_l2_feed();
        core.start_mmp();
        core.txg_kick_and_wait();
        info!("created pool '{}' (guid {:#x})", name, guid);
        Ok(Pool { core })
    }

    /// Import from leaf paths: labels rebuild the topology, the newest
    /// uberblock names the root, the space maps and dedup table reload,
    /// and every dataset's intent log is claimed and replayed.
    pub fn import(leaf_paths: &[String], tunables: Tunables, l2_paths: &[String]) -> Result<Pool> {
        tunables.validate()?;
        tunables.apply_global()?;

        // Any readable label describes the pool.
        let probe_core = PoolCore::new("import-probe", 0, tunables.clone(), false);
        let mut config: Option<LabelConfig> = None;
        for path in leaf_paths {
            let spec = [VdevSpec::File { path: path.clone() }];
            if let Ok(root) = Vdev::build(&spec, 0, &probe_core.tunables) {
                let env = probe_core.io_env();
                if root.open(&env).is_ok() {
                    if let Ok(cfg) = root.children[0].read_label_config(&env) {
                        config = Some(cfg);
                        root.close();
                        break;
                    }
                }
                root.close();
            }
        }
        let config = config.ok_or(Error::CannotOpen("import".into(), "no readable label"))?;

        let core = PoolCore::new(&config.pool_name, config.pool_guid, tunables, config.multihost);
        let specs = config.vdev_tree.clone();
        let root = Vdev::build(&specs, config.pool_guid, &core.tunables)?;
        {
            let env = core.io_env();
            root.open(&env)?;
        }
        *core.tops.write().unwrap() = root.children.clone();
        *core.root_vdev.write().unwrap() = Some(Arc::clone(&root));

        // Newest uberblock across every leaf wins.
        let mut best: Option<Uberblock> = None;
        {
            let env = core.io_env();
            root.for_each_leaf(&mut |leaf| {
                if let Some(ub) = leaf.find_best_uberblock(&env) {
                    if best.as_ref().map_or(true, |b| ub.is_newer_than(b)) {
                        best = Some(ub);
                    }
                }
            });
        }
        let ub = best.ok_or(Error::CannotOpen(config.pool_name.clone(), "no uberblock"))?;

        // Multihost: watch for another live writer before touching
        // anything.
        if config.multihost {
            core.mmp_import_check(&root, &ub)?;
        }

        *core.allocator.write().unwrap() = Some(Allocator::new(&core.tops.read().unwrap()));
        {
            let env = core.io_env();
            let tops = core.tops.read().unwrap().clone();
            core.allocator().load(&env, &tops, ub.txg)?;
        }

        let dsl = Arc::new(DslPool::open(&core, ub.rootbp.clone())?);
        *core.dsl.write().unwrap() = Some(Arc::clone(&dsl));
        core.ddt_store.load(&core, &dsl.mos, &core.ddt)?;
        core.mmp_seq.store(ub.mmp_seq + 1, Ordering::Relaxed);
        core.start_txg_engine(ub.txg + TXG_IMPORT_SLACK);
        core.start_deadman();
        core.open_l2(l2_paths, true)?;
        core.start_l2_feed();
        core.start_mmp();

        // Claim and replay every dataset's intent log.
        let pool = Pool { core };
        let names = pool.core.dsl().list_datasets(&pool.core)?;
        for name in names {
            let ds = pool.core.dsl().open_dataset(&pool.core, &name)?;
            let replay_txg = pool.core.open_txg();
            let mut apply = zil::replay_into_objset(&pool.core, &ds.os);
            let n = zil::zil_replay(&pool.core, &ds.os, &ds.zilog, replay_txg, &mut apply)?;
            if n > 0 {
                info!("dataset '{}': replayed {} intent-log records", name, n);
            }
            let fresh = zil::zil_open(&pool.core, &ds.os, &ds.zilog, pool.core.open_txg())?;
            if fresh {
                pool.core.txg_kick_and_wait();
            }
        }
        pool.core.txg_kick_and_wait();
        info!("imported pool '{}' at txg {}", pool.core.name, ub.txg);
        Ok(pool)
    }

    // ---- dataset surface ------------------------------------------------

    pub fn create_dataset(&self, name: &str, config: DatasetConfig) -> Result<Arc<Dataset>> {
        let ds = self.core.dsl().create_dataset(&self.core, name, config)?;
        let fresh = zil::zil_open(&self.core, &ds.os, &ds.zilog, self.core.open_txg())?;
        if fresh {
            self.core.txg_kick_and_wait();
        }
        Ok(ds)
    }

    pub fn open_dataset(&self, name: &str) -> Result<Arc<Dataset>> {
        self.core.dsl().open_dataset(&self.core, name)
    }

    pub fn destroy_dataset(&self, name: &str) -> Result<()> {
        self.core.dsl().destroy_dataset(&self.core, name)
    }

    /// Ensure an object exists with a specific id.
    pub fn ensure_object(&self, ds: &Arc<Dataset>, object: u64) -> Result<u64> {
        let mut builder = DmuTxBuilder::new(&self.core);
        builder.hold_bonus(object);
        let tx = builder.assign()?;
        let id = dmu::object_claim(
            &self.core,
            &ds.os,
            &tx,
            object,
            ObjType::Data,
            DslPool::default_blksz(),
        )?;
        tx.commit();
        Ok(id)
    }

    pub fn create_object(&self, ds: &Arc<Dataset>) -> Result<u64> {
        let mut builder = DmuTxBuilder::new(&self.core);
        builder.hold_bonus(0);
        let tx = builder.assign()?;
        let id = dmu::object_alloc(
            &self.core,
            &ds.os,
            &tx,
            ObjType::Data,
            DslPool::default_blksz(),
        )?;
        tx.commit();
        Ok(id)
    }

    pub fn write(&self, ds: &Arc<Dataset>, object: u64, offset: u64, data: &[u8]) -> Result<()> {
        let mut builder = DmuTxBuilder::new(&self.core);
        builder.hold_write(object, offset, data.len() as u64);
        let tx = builder.assign()?;
        dmu::dmu_write(&self.core, &ds.os, &tx, object, offset, data)?;
        tx.commit();
        Ok(())
    }

    /// Synchronous write: logged in the intent log and durable on
    /// return, ahead of its txg.
    pub fn write_sync(
        &self,
        ds: &Arc<Dataset>,
        object: u64,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let mut builder = DmuTxBuilder::new(&self.core);
        builder.hold_write(object, offset, data.len() as u64);
        let tx = builder.assign()?;
        dmu::dmu_write(&self.core, &ds.os, &tx, object, offset, data)?;
        let seq = ds.zilog.itx_assign(
            ItxRecord::Write {
                object,
                offset,
                data: data.to_vec(),
            },
            tx.txg(),
        );
        tx.commit();
        zil::zil_commit(&self.core, &ds.os, &ds.zilog, seq)
    }

    pub fn read(&self, ds: &Arc<Dataset>, object: u64, offset: u64, len: u64) -> Result<Vec<u8>> {
        dmu::dmu_read(&self.core, &ds.os, object, offset, len)
    }

    pub fn object_len(&self, ds: &Arc<Dataset>, object: u64) -> Result<u64> {
        dmu::object_len(&self.core, &ds.os, object)
    }

    /// Force everything dirty to disk.
    pub fn sync(&self) {
        self.core.txg_kick_and_wait();
    }

    pub fn resume(&self) {
        self.core.resume();
        // Parked zios re-run their device stages via the barrier.
    }

    /// Clean shutdown: final sync, uberblock, close.
    pub fn export(self) -> Result<()> {
        self.core.txg_kick_and_wait();
        self.core.teardown(true);
        Ok(())
    }

    /// Abandon the pool without a final sync, as a crash would.
    pub fn crash(self) {
        self.core.teardown(false);
    }

    // ---- fault injection surface ---------------------------------------

    /// Corrupt reads of a block range, addressed `dataset/object/level/
    /// blkid` the way the operator tool resolves targets.
    pub fn inject_data_fault(
        &self,
        dataset: &str,
        object: u64,
        level: u8,
        blkid_range: (u64, u64),
        shots: u64,
    ) -> Result<u64> {
        let ds = self.open_dataset(dataset)?;
        Ok(self.core.inject.add(
            crate::inject::InjectKind::DataCorrupt,
            None,
            Some(crate::inject::Bookmark {
                objset: ds.object,
                object,
                level,
                blkid_start: blkid_range.0,
                blkid_end: blkid_range.1,
            }),
            shots,
        ))
    }

    /// Corrupt a raw `objset:object:level:blkid` bookmark (hex).
    pub fn inject_raw_bookmark_fault(&self, bookmark: &str, shots: u64) -> Result<u64> {
        let bm = InjectRegistry::parse_raw_bookmark(bookmark)
            .ok_or_else(|| Error::Config(format!("bad bookmark '{}'", bookmark)))?;
        Ok(self
            .core
            .inject
            .add(crate::inject::InjectKind::DataCorrupt, None, Some(bm), shots))
    }

    /// Device-level fault or delay by vdev guid.
    pub fn inject_device_fault(&self, guid: u64, delay_ms: Option<u64>, shots: u64) -> u64 {
        let kind = match delay_ms {
            Some(ms) => crate::inject::InjectKind::DelayIo(ms),
            None => crate::inject::InjectKind::DeviceFault,
        };
        self.core.inject.add(kind, Some(guid), None, shots)
    }

    /// Label-section fault by name: `label_pad1`, `label_pad2`,
    /// `label_nvlist`, `label_uberblock`.
    pub fn inject_label_fault(&self, guid: u64, section: &str, shots: u64) -> Result<u64> {
        let section = crate::label::LabelSection::from_name(section)
            .ok_or_else(|| Error::Config(format!("unknown label section '{}'", section)))?;
        Ok(self.core.inject.add(
            crate::inject::InjectKind::LabelFault(section),
            Some(guid),
            None,
            shots,
        ))
    }

    pub fn clear_faults(&self) {
        self.core.inject.clear();
    }

    pub fn stats_json(&self) -> serde_json::Value {
        stats::pool_stats_json(&self.core)
    }

    pub fn scrub(&self) -> Result<scan::ScanStats> {
        scan::scrub(&self.core)
    }

    pub fn resilver(&self) -> Result<scan::ScanStats> {
        scan::resilver(&self.core)
    }
}

impl PoolCore {
    fn open_l2(&self, l2_paths: &[String], rebuild: bool) -> Result<()> {
        let mut devs = Vec::new();
        for path in l2_paths {
            let dev = L2Device::open(std::path::Path::new(path), &self.tunables)?;
            if rebuild {
                let _ = dev.rebuild();
                // Rebuilt entries come back as l2-only headers so the
                // identity hash covers them from the first access.
                for (key, lsize) in dev.entries_snapshot() {
                    self.arc.insert_l2only(key, BufType::Data, lsize, false);
                }
            }
            devs.push(Arc::new(dev));
        }
        *self.l2devs.write().unwrap() = devs;
        Ok(())
    }

    pub fn l2_devices(&self) -> Vec<Arc<L2Device>> {
        self.l2devs.read().unwrap().clone()
    }

    fn mmp_import_check(&self, root: &Arc<Vdev>, ub: &Uberblock) -> Result<()> {
        let intervals = self.tunables.zfs_multihost_import_intervals.max(1);
        let wait = Duration::from_millis(self.tunables.zfs_multihost_interval * intervals);
        thread::sleep(wait);
        let env = self.io_env();
        let mut newest: Option<Uberblock> = None;
        root.for_each_leaf(&mut |leaf| {
            if let Some(u) = leaf.find_best_uberblock(&env) {
                if newest.as_ref().map_or(true, |b| u.is_newer_than(b)) {
                    newest = Some(u);
                }
            }
        });
        if let Some(n) = newest {
            if n.mmp_seq > ub.mmp_seq || n.timestamp > ub.timestamp {
                return Err(Error::ActiveOtherHost);
            }
        }
        Ok(())
    }

    fn teardown(self: &Arc<Self>, clean: bool) {
        self.shutdown.store(true, Ordering::Release);
        // Unpark anything stuck on suspension so threads can exit.
        self.resume();
        if let Some(mut engine) = self.txg.lock().unwrap().take() {
            engine.shutdown();
        }
        if let Some(t) = self.feed_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        if let Some(t) = self.mmp_thread.lock().unwrap().take() {
            let _ = t.join();
        }
        *self.deadman.lock().unwrap() = None;
        self.zio_taskq.wait();
        if clean {
            let _ = self.flush_all_vdevs();
        }
        if let Some(root) = self.root_vdev.write().unwrap().take() {
            root.close();
        }
        debug!("pool '{}' torn down (clean={})", self.name, clean);
    }
}

