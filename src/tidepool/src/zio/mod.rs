// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The I/O pipeline.
//!
//! Every logical I/O is a node in a DAG of parents and children, carried
//! through an ordered set of stages by an explicit stage cursor; there
//! is no recursion through stages, and a zio parked on a suspended pool
//! restarts from the top on resume. Stage bits are monotonic: a zio's
//! pipeline mask is fixed at creation and bits are only ever skipped,
//! never revisited.
//!
//! Writes: compress (and possibly embed), encrypt, checksum, dedup
//! short-circuit, allocate, device write. Reads: walk the block's DVAs
//! and each vdev's read variants until the payload checksums, telling
//! the vdev layer which variants produced bad bytes so it can count and
//! self-heal; then authenticate/decrypt and decompress. A write too
//! large for any contiguous allocation becomes a gang tree: a header
//! block of child pointers plus child writes, reassembled transparently
//! on read.
//!
//! Parents observe children only at the ready/done gates. Error
//! propagation is worst-of across non-canfail children; speculative
//! children never propagate.

pub mod flags {
    pub const CANFAIL: u32 = 1 << 0;
    pub const SPECULATIVE: u32 = 1 << 1;
    pub const CONFIG_WRITER: u32 = 1 << 2;
    pub const DONT_RETRY: u32 = 1 << 3;
    pub const DONT_CACHE: u32 = 1 << 4;
    pub const NODATA: u32 = 1 << 5;
    pub const IO_RETRY: u32 = 1 << 6;
    pub const PROBE: u32 = 1 << 7;
    pub const TRYHARD: u32 = 1 << 8;
    pub const OPTIONAL: u32 = 1 << 9;
    pub const DONT_QUEUE: u32 = 1 << 10;
    pub const DONT_PROPAGATE: u32 = 1 << 11;
    pub const IO_REPAIR: u32 = 1 << 12;
    pub const SELF_HEAL: u32 = 1 << 13;
    pub const RESILVER: u32 = 1 << 14;
    pub const SCRUB: u32 = 1 << 15;
    pub const RAW: u32 = 1 << 16;
    pub const GANG_CHILD: u32 = 1 << 17;
    pub const DDT_CHILD: u32 = 1 << 18;
    pub const GODFATHER: u32 = 1 << 19;
    pub const REEXECUTED: u32 = 1 << 20;
    pub const INDUCE_DAMAGE: u32 = 1 << 21;
}

pub mod stage {
    pub const OPEN: u32 = 1 << 0;
    pub const READ_BP_INIT: u32 = 1 << 1;
    pub const WRITE_BP_INIT: u32 = 1 << 2;
    pub const FREE_BP_INIT: u32 = 1 << 3;
    pub const ISSUE_ASYNC: u32 = 1 << 4;
    pub const ENCRYPT: u32 = 1 << 5;
    pub const CHECKSUM_GENERATE: u32 = 1 << 6;
    pub const DDT_WRITE: u32 = 1 << 7;
    pub const DDT_FREE: u32 = 1 << 8;
    pub const GANG_ASSEMBLE: u32 = 1 << 9;
    pub const GANG_ISSUE: u32 = 1 << 10;
    pub const DVA_ALLOCATE: u32 = 1 << 11;
    pub const DVA_FREE: u32 = 1 << 12;
    pub const DVA_CLAIM: u32 = 1 << 13;
    pub const READY: u32 = 1 << 14;
    pub const VDEV_IO_START: u32 = 1 << 15;
    pub const VDEV_IO_DONE: u32 = 1 << 16;
    pub const CHECKSUM_VERIFY: u32 = 1 << 17;
    pub const DECRYPT: u32 = 1 << 18;
    pub const DONE: u32 = 1 << 19;

    pub const READ_PIPELINE: u32 = OPEN
        | READ_BP_INIT
        | VDEV_IO_START
        | VDEV_IO_DONE
        | CHECKSUM_VERIFY
        | DECRYPT
        | DONE;
    pub const WRITE_PIPELINE: u32 = OPEN
        | WRITE_BP_INIT
        | ISSUE_ASYNC
        | ENCRYPT
        | CHECKSUM_GENERATE
        | DDT_WRITE
        | GANG_ASSEMBLE
        | DVA_ALLOCATE
        | READY
        | VDEV_IO_START
        | VDEV_IO_DONE
        | DONE;
    pub const FREE_PIPELINE: u32 = OPEN | FREE_BP_INIT | DDT_FREE | DVA_FREE | DONE;
    pub const CLAIM_PIPELINE: u32 = OPEN | DVA_CLAIM | DONE;
    pub const NULL_PIPELINE: u32 = OPEN | READY | DONE;
}

use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{debug, trace};
use tp_checksum::{compute, embedded_generate, embedded_verify, ChecksumId, Cksum, ECK_SIZE};
use tp_compress::CompressId;
use tp_crypto::{block_iv, CtxTemplate};

use crate::blkptr::{BlockPtr, BpCrypt, Dva, EmbeddedType, ObjType, BP_EMBEDDED_PAYLOAD, BP_SIZE, SECTOR};
use crate::config::Failmode;
use crate::error::IoErr;
use crate::metaslab::AllocClass;
use crate::spa::PoolCore;
use crate::vdev::queue::IoClass;
use tp_utils::Metric;

/// Gang headers are one sector: three child pointers plus a trailer.
pub const GANG_HEADER_SIZE: usize = 512;
pub const GANG_CHILDREN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZioType {
    Null,
    Read,
    Write,
    Free,
    Claim,
}

/// Encryption context attached to writes and reads of protected
/// datasets. The template caches the key schedule.
pub struct CryptCtx {
    pub template: Box<dyn CtxTemplate>,
    pub salt: u64,
}

/// Per-write policy resolved by the DMU from dataset properties.
pub struct WriteProps {
    pub checksum: ChecksumId,
    pub compress: CompressId,
    pub copies: usize,
    pub dedup: bool,
    pub class: AllocClass,
    pub obj_type: ObjType,
    pub level: u8,
    pub crypt: Option<Arc<CryptCtx>>,
}

impl Default for WriteProps {
    fn default() -> Self {
        WriteProps {
            checksum: ChecksumId::Fletcher4,
            compress: CompressId::Off,
            copies: 1,
            dedup: false,
            class: AllocClass::Normal,
            obj_type: ObjType::Data,
            level: 0,
            crypt: None,
        }
    }
}

struct ZioInner {
    flags: u32,
    stage: u32,
    pipeline: u32,
    bp: BlockPtr,
    data: Option<Vec<u8>>,
    lsize: u32,
    txg: u64,
    props: WriteProps,
    bookmark: Option<(u64, u64, u8, u64)>,
    error: Option<IoErr>,
    pending_children: usize,
    parents: Vec<Weak<Zio>>,
    ddt_insert_pending: bool,
    reissue: bool,
    done: bool,
}

/// The result visible to a waiter: the final block pointer (writes) and
/// the payload (reads).
pub struct ZioOutcome {
    pub bp: BlockPtr,
    pub data: Option<Vec<u8>>,
}

pub struct Zio {
    pub io_type: ZioType,
    pub priority: IoClass,
    pool: Arc<PoolCore>,
    inner: Mutex<ZioInner>,
    cv: Condvar,
}

impl Zio {
    fn new(
        pool: Arc<PoolCore>,
        io_type: ZioType,
        pipeline: u32,
        flags: u32,
        priority: IoClass,
    ) -> Arc<Zio> {
        Arc::new(Zio {
            io_type,
            priority,
            pool,
            inner: Mutex::new(ZioInner {
                flags,
                stage: 0,
                pipeline,
                bp: BlockPtr::default(),
                data: None,
                lsize: 0,
                txg: 0,
                props: WriteProps::default(),
                bookmark: None,
                error: None,
                pending_children: 0,
                parents: Vec::new(),
                ddt_insert_pending: false,
                reissue: false,
                done: false,
            }),
            cv: Condvar::new(),
        })
    }

    /// A grouping node with no I/O of its own.
    pub fn null(pool: Arc<PoolCore>, flags: u32) -> Arc<Zio> {
        Zio::new(pool, ZioType::Null, stage::NULL_PIPELINE, flags, IoClass::SyncRead)
    }

    pub fn read(
        pool: Arc<PoolCore>,
        bp: BlockPtr,
        flags: u32,
        priority: IoClass,
        crypt: Option<Arc<CryptCtx>>,
    ) -> Arc<Zio> {
        let zio = Zio::new(pool, ZioType::Read, stage::READ_PIPELINE, flags, priority);
        {
            let mut inner = zio.inner.lock().unwrap();
            inner.lsize = bp.lsize;
            inner.bp = bp;
            inner.props.crypt = crypt;
        }
        zio
    }

    pub fn write(
        pool: Arc<PoolCore>,
        data: Vec<u8>,
        props: WriteProps,
        txg: u64,
        flags: u32,
        priority: IoClass,
    ) -> Arc<Zio> {
        let zio = Zio::new(pool, ZioType::Write, stage::WRITE_PIPELINE, flags, priority);
        {
            let mut inner = zio.inner.lock().unwrap();
            inner.lsize = data.len() as u32;
            inner.data = Some(data);
            inner.props = props;
            inner.txg = txg;
        }
        zio
    }

    pub fn free(pool: Arc<PoolCore>, bp: BlockPtr, txg: u64) -> Arc<Zio> {
        let zio = Zio::new(
            pool,
            ZioType::Free,
            stage::FREE_PIPELINE,
            flags::CANFAIL,
            IoClass::AsyncWrite,
        );
        {
            let mut inner = zio.inner.lock().unwrap();
            inner.bp = bp;
            inner.txg = txg;
        }
        zio
    }

    pub fn claim(pool: Arc<PoolCore>, bp: BlockPtr, txg: u64) -> Arc<Zio> {
        let zio = Zio::new(
            pool,
            ZioType::Claim,
            stage::CLAIM_PIPELINE,
            0,
            IoClass::SyncWrite,
        );
        {
            let mut inner = zio.inner.lock().unwrap();
            inner.bp = bp;
            inner.txg = txg;
        }
        zio
    }

    pub fn set_bookmark(&self, objset: u64, object: u64, level: u8, blkid: u64) {
        self.inner.lock().unwrap().bookmark = Some((objset, object, level, blkid));
    }

    /// Link `child` under `parent`; must happen before the child runs.
    pub fn add_child(parent: &Arc<Zio>, child: &Arc<Zio>) {
        parent.inner.lock().unwrap().pending_children += 1;
        child
            .inner
            .lock()
            .unwrap()
            .parents
            .push(Arc::downgrade(parent));
    }

    /// Dispatch onto the pool's issue taskq and return immediately.
    pub fn nowait(self: &Arc<Zio>) {
        let this = Arc::clone(self);
        self.pool.zio_taskq().dispatch(move || {
            this.execute();
        });
    }

    /// Execute inline and wait for this zio and all children.
    pub fn wait(self: &Arc<Zio>) -> std::result::Result<ZioOutcome, IoErr> {
        self.execute();
        let mut inner = self.inner.lock().unwrap();
        while !inner.done || inner.pending_children > 0 {
            inner = self.cv.wait(inner).unwrap();
        }
        match inner.error {
            Some(e) => Err(e),
            None => Ok(ZioOutcome {
                bp: inner.bp.clone(),
                data: inner.data.take(),
            }),
        }
    }

    /// The final block pointer; meaningful after `done`.
    pub fn bp(&self) -> BlockPtr {
        self.inner.lock().unwrap().bp.clone()
    }

    // ---- pipeline -------------------------------------------------------

    fn execute(self: &Arc<Zio>) {
        loop {
            let (stage_bit, flags) = {
                let inner = self.inner.lock().unwrap();
                if inner.done {
                    return;
                }
                let done_mask = if inner.stage == 0 {
                    0
                } else {
                    inner.stage | (inner.stage - 1)
                };
                let remaining = inner.pipeline & !done_mask;
                if remaining == 0 {
                    drop(inner);
                    self.finish();
                    return;
                }
                (remaining & remaining.wrapping_neg(), inner.flags)
            };

            // A suspended pool parks I/O that touches devices unless the
            // zio is exempted (probes, config writers, resume traffic).
            if matches!(
                stage_bit,
                stage::VDEV_IO_START | stage::DVA_ALLOCATE
            ) && flags & (flags::CONFIG_WRITER | flags::PROBE | flags::GODFATHER) == 0
            {
                match self.pool.suspend_barrier() {
                    Ok(()) => {}
                    Err(e) => {
                        self.set_error(e);
                        self.skip_to_done();
                        continue;
                    }
                }
            }

            let result = match stage_bit {
                stage::OPEN => Ok(()),
                stage::READ_BP_INIT => self.stage_read_bp_init(),
                stage::WRITE_BP_INIT => self.stage_write_bp_init(),
                stage::FREE_BP_INIT => Ok(()),
                stage::ISSUE_ASYNC => Ok(()),
                stage::ENCRYPT => self.stage_encrypt(),
                stage::CHECKSUM_GENERATE => self.stage_checksum_generate(),
                stage::DDT_WRITE => self.stage_ddt_write(),
                stage::DDT_FREE => self.stage_ddt_free(),
                stage::GANG_ASSEMBLE => Ok(()),
                stage::GANG_ISSUE => Ok(()),
                stage::DVA_ALLOCATE => self.stage_dva_allocate(),
                stage::DVA_FREE => self.stage_dva_free(),
                stage::DVA_CLAIM => self.stage_dva_claim(),
                stage::READY => self.stage_ready(),
                stage::VDEV_IO_START => self.stage_vdev_io(),
                stage::VDEV_IO_DONE => Ok(()),
                stage::CHECKSUM_VERIFY => Ok(()), // folded into vdev_io for reads
                stage::DECRYPT => self.stage_decrypt(),
                stage::DONE => Ok(()),
                _ => Ok(()),
            };

            let mut inner = self.inner.lock().unwrap();
            if inner.reissue {
                // Pool suspension parked us mid-write; restart from the
                // top once the barrier lets us through again.
                inner.reissue = false;
                inner.stage = 0;
                continue;
            }
            inner.stage = stage_bit;
            if let Err(e) = result {
                inner.error = IoErr::worst(inner.error, Some(e));
                // Terminal: run out the pipeline to DONE.
                inner.pipeline = inner.stage | stage::DONE;
            }
            if stage_bit == stage::DONE {
                drop(inner);
                self.finish();
                return;
            }
        }
    }

    fn set_error(&self, e: IoErr) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = IoErr::worst(inner.error, Some(e));
    }

    fn skip_to_done(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.pipeline = inner.stage | stage::DONE;
    }

    fn finish(self: &Arc<Zio>) {
        // Wait for children before reporting upward, so a parent's error
        // is final when its own done runs.
        let (error, flags, parents, ddt_insert) = {
            let mut inner = self.inner.lock().unwrap();
            while inner.pending_children > 0 {
                inner = self.cv.wait(inner).unwrap();
            }
            inner.done = true;
            (
                inner.error,
                inner.flags,
                std::mem::take(&mut inner.parents),
                inner.ddt_insert_pending && inner.error.is_none(),
            )
        };

        if ddt_insert {
            let inner = self.inner.lock().unwrap();
            self.pool
                .ddt_insert_miss(&inner.bp, inner.lsize, inner.txg);
        }

        for parent in parents {
            if let Some(parent) = parent.upgrade() {
                let mut pi = parent.inner.lock().unwrap();
                let swallow = flags & (flags::CANFAIL | flags::DONT_PROPAGATE | flags::SPECULATIVE)
                    != 0
                    || pi.flags & flags::GODFATHER != 0;
                if !swallow {
                    pi.error = IoErr::worst(pi.error, error);
                }
                pi.pending_children -= 1;
                drop(pi);
                parent.cv.notify_all();
            }
        }
        self.cv.notify_all();
        if let Some(e) = error {
            trace!("zio {:?} failed: {}", self.io_type, e);
        }
    }

    fn stage_ready(&self) -> std::result::Result<(), IoErr> {
        // Parents that care about our bp may observe it now.
        Ok(())
    }

    // ---- write side -----------------------------------------------------

    fn stage_write_bp_init(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let lsize = match &inner.data {
            Some(d) => d.len() as u32,
            None => return Err(IoErr::Io),
        };
        debug_assert!(lsize as u64 % SECTOR == 0 || lsize as usize <= BP_EMBEDDED_PAYLOAD);
        let obj_type = inner.props.obj_type;
        let level = inner.props.level;
        let checksum = inner.props.checksum.resolve();
        let dedup = inner.props.dedup;
        let encrypted = inner.props.crypt.is_some();
        let txg = inner.txg;

        // All-zero data becomes a hole; no storage, no checksum.
        let is_zero = inner.data.as_ref().map_or(false, |d| tp_compress::is_all_zero(d));
        if is_zero && !encrypted {
            let mut bp = BlockPtr::new_hole(lsize);
            bp.obj_type = obj_type;
            bp.level = level;
            inner.bp = bp;
            inner.pipeline = inner.stage | stage::READY | stage::DONE;
            return Ok(());
        }

        let mut psize = lsize;
        let mut compress = CompressId::Off;
        let resolved = inner.props.compress.resolve();
        if resolved != CompressId::Off && resolved != CompressId::Empty {
            let attempt = {
                let data = inner.data.as_ref().ok_or(IoErr::Io)?;
                tp_compress::compress(resolved, data).map_err(|_| IoErr::Io)?
            };
            if let Some(compressed) = attempt {
                // Pad the physical payload to sector granularity.
                let padded = ((compressed.len() as u64 + SECTOR - 1) / SECTOR * SECTOR) as usize;
                let can_embed =
                    compressed.len() <= BP_EMBEDDED_PAYLOAD && !dedup && !encrypted;
                if can_embed {
                    let mut bp = BlockPtr::default();
                    bp.obj_type = obj_type;
                    bp.level = level;
                    bp.compress = resolved;
                    bp.lsize = lsize;
                    bp.psize = compressed.len() as u32;
                    bp.birth = txg;
                    bp.fill = 1;
                    bp.embedded = Some((EmbeddedType::Data, compressed));
                    inner.bp = bp;
                    inner.pipeline = inner.stage | stage::READY | stage::DONE;
                    return Ok(());
                }
                if padded < lsize as usize {
                    let mut buf = compressed;
                    buf.resize(padded, 0);
                    psize = padded as u32;
                    compress = resolved;
                    inner.data = Some(buf);
                }
            }
        }

        let bp = &mut inner.bp;
        bp.obj_type = obj_type;
        bp.level = level;
        bp.checksum = checksum;
        bp.compress = compress;
        bp.lsize = lsize;
        bp.psize = psize;
        bp.birth = txg;
        bp.fill = 1;
        bp.dedup = dedup;
        inner.lsize = lsize;
        Ok(())
    }

    fn stage_encrypt(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let crypt = match &inner.props.crypt {
            Some(c) => Arc::clone(c),
            None => return Ok(()),
        };
        let data = inner.data.take().ok_or(IoErr::Io)?;
        // Nonce: the write's txg plus a per-process tiebreaker. Txgs are
        // monotonic across the pool's whole lifetime (import skips past
        // anything a crashed txg may have issued), so a (key, nonce)
        // pair can never recur the way a plain in-memory counter would
        // after an export/import cycle.
        debug_assert!(inner.txg != 0, "encrypted writes carry their txg");
        let iv1 = inner.txg;
        let iv2 = self.pool.next_iv_seq();
        let iv = block_iv(iv1, iv2);
        let aad = crypt.salt.to_le_bytes();
        let (ciphertext, mac) = crypt
            .template
            .encrypt(&iv, &aad, &data)
            .map_err(|_| IoErr::Auth)?;
        inner.data = Some(ciphertext);
        inner.bp.crypt = Some(BpCrypt {
            salt: crypt.salt,
            iv1,
            iv2,
            mac,
        });
        Ok(())
    }

    fn stage_checksum_generate(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let data = inner.data.as_ref().ok_or(IoErr::Io)?;
        let cksum = compute(inner.bp.checksum, data, false).map_err(|_| IoErr::Io)?;
        inner.bp.cksum = if inner.bp.crypt.is_some() {
            // Half the space belongs to the MAC.
            Cksum([cksum.0[0], cksum.0[1], 0, 0])
        } else {
            cksum
        };
        Ok(())
    }

    fn stage_ddt_write(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.props.dedup {
            return Ok(());
        }
        let key = crate::ddt::DdtKey {
            cksum: inner.bp.cksum,
            lsize: inner.bp.lsize,
            psize: inner.bp.psize,
            compress: inner.bp.compress as u8,
            crypt: inner.bp.crypt.is_some(),
        };
        match self.pool.ddt_lookup_ref(&key, inner.txg) {
            Some((dvas, birth)) => {
                // Duplicate: adopt the existing copies, skip allocation
                // and the device write entirely.
                for (i, dva) in dvas.iter().enumerate().take(3) {
                    inner.bp.dva[i] = *dva;
                }
                inner.bp.phys_birth = birth;
                inner.pipeline &= !(stage::DVA_ALLOCATE | stage::VDEV_IO_START | stage::VDEV_IO_DONE);
                debug!("ddt hit: {} refcount bumped", key.cksum);
            }
            None => {
                inner.ddt_insert_pending = true;
            }
        }
        Ok(())
    }

    fn stage_dva_allocate(self: &Arc<Zio>) -> std::result::Result<(), IoErr> {
        let (psize, copies, class, txg) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.bp.psize as u64,
                inner.props.copies,
                inner.props.class,
                inner.txg,
            )
        };
        match self
            .pool
            .allocator()
            .alloc(self.pool.tunables(), psize, copies, class, txg)
        {
            Ok(dvas) => {
                let mut inner = self.inner.lock().unwrap();
                for (i, dva) in dvas.iter().enumerate().take(3) {
                    inner.bp.dva[i] = *dva;
                }
                Ok(())
            }
            Err(IoErr::NoSpace) => self.gang_write(psize, copies, class, txg),
            Err(e) => Err(e),
        }
    }

    /// Split an unallocatable write into a gang tree.
    fn gang_write(
        self: &Arc<Zio>,
        psize: u64,
        copies: usize,
        class: AllocClass,
        txg: u64,
    ) -> std::result::Result<(), IoErr> {
        if psize <= SECTOR * GANG_CHILDREN as u64 {
            return Err(IoErr::NoSpace);
        }
        let header_dvas =
            self.pool
                .allocator()
                .alloc(self.pool.tunables(), SECTOR, copies, class, txg)?;

        let (data, props_cksum, obj_type, level, flags) = {
            let mut inner = self.inner.lock().unwrap();
            (
                inner.data.take().ok_or(IoErr::Io)?,
                inner.props.checksum,
                inner.props.obj_type,
                inner.props.level,
                inner.flags,
            )
        };

        // Split into sector-aligned thirds.
        let chunk = {
            let per = (data.len() as u64 + GANG_CHILDREN as u64 - 1) / GANG_CHILDREN as u64;
            (per + SECTOR - 1) / SECTOR * SECTOR
        };
        let mut children = Vec::new();
        let mut off = 0usize;
        while off < data.len() {
            let end = (off + chunk as usize).min(data.len());
            let mut piece = data[off..end].to_vec();
            let padded = ((piece.len() as u64 + SECTOR - 1) / SECTOR * SECTOR) as usize;
            piece.resize(padded, 0);
            let child = Zio::write(
                Arc::clone(&self.pool),
                piece,
                WriteProps {
                    checksum: props_cksum,
                    compress: CompressId::Off,
                    copies,
                    dedup: false,
                    class,
                    obj_type,
                    level,
                    crypt: None,
                },
                txg,
                flags | flags::GANG_CHILD,
                self.priority,
            );
            Zio::add_child(self, &child);
            child.nowait();
            children.push(child);
            off = end;
        }

        // Children must be done before their pointers can be written
        // into the header.
        {
            let mut inner = self.inner.lock().unwrap();
            while inner.pending_children > 0 {
                inner = self.cv.wait(inner).unwrap();
            }
            if let Some(e) = inner.error {
                return Err(e);
            }
        }

        let mut header = vec![0u8; GANG_HEADER_SIZE];
        for (i, child) in children.iter().enumerate().take(GANG_CHILDREN) {
            child.bp().encode(&mut header[i * BP_SIZE..(i + 1) * BP_SIZE]);
        }
        let eck_off = GANG_HEADER_SIZE - ECK_SIZE;
        embedded_generate(
            ChecksumId::GangHeader,
            &mut header,
            eck_off,
            Cksum([header_dvas[0].offset, 0, 0, 0]),
        )
        .map_err(|_| IoErr::Io)?;

        let env = self.pool.io_env();
        for dva in &header_dvas {
            let top = self.pool.top_vdev(dva.vdev).ok_or(IoErr::Io)?;
            top.write(&env, dva.offset, &header, txg, self.priority)
                .map_err(|e| e)?;
        }

        let mut inner = self.inner.lock().unwrap();
        for (i, dva) in header_dvas.iter().enumerate().take(3) {
            inner.bp.dva[i] = *dva;
            inner.bp.dva[i].gang = true;
        }
        // The gang bp's checksum still covers the assembled payload,
        // which is already in bp.cksum. Device I/O happened here.
        inner.pipeline &= !(stage::VDEV_IO_START | stage::VDEV_IO_DONE);
        debug!("gang write: {} children", children.len());
        Ok(())
    }

    // ---- shared device leg ----------------------------------------------

    fn stage_vdev_io(self: &Arc<Zio>) -> std::result::Result<(), IoErr> {
        match self.io_type {
            ZioType::Write => self.vdev_write(),
            ZioType::Read => self.vdev_read_verify(),
            _ => Ok(()),
        }
    }

    fn vdev_write(&self) -> std::result::Result<(), IoErr> {
        let (bp, data, txg) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.bp.clone(),
                inner.data.clone().ok_or(IoErr::Io)?,
                inner.txg,
            )
        };
        let env = self.pool.io_env();
        let mut wrote = 0;
        let mut last_err = IoErr::Io;
        for dva in bp.dva.iter().filter(|d| d.is_valid()) {
            let top = match self.pool.top_vdev(dva.vdev) {
                Some(t) => t,
                None => continue,
            };
            let _guard = self.pool.deadman_track("vdev write");
            match top.write(&env, dva.offset, &data, txg, self.priority) {
                Ok(()) => wrote += 1,
                Err(e) => last_err = e,
            }
        }
        if wrote == 0 {
            // A write that cannot reach any copy is what suspension is
            // for; the barrier at the top of the pipeline re-runs us
            // after resume when failmode=wait.
            match self.pool.tunables().failmode {
                Failmode::Panic => panic!("pool write failure with failmode=panic"),
                Failmode::Wait => {
                    self.pool.suspend("write failure");
                    let mut inner = self.inner.lock().unwrap();
                    inner.reissue = true;
                    inner.flags |= flags::REEXECUTED;
                    return Ok(());
                }
                Failmode::Continue => return Err(last_err),
            }
        }
        Ok(())
    }

    fn vdev_read_verify(&self) -> std::result::Result<(), IoErr> {
        let (bp, bookmark, flags) = {
            let inner = self.inner.lock().unwrap();
            (inner.bp.clone(), inner.bookmark, inner.flags)
        };
        let env = self.pool.io_env();
        let mut worst: Option<IoErr> = None;
        // A scrub keeps walking after the first good copy so every
        // variant gets verified (and healed); a plain read stops early.
        let scrub = flags & flags::SCRUB != 0;
        let speculative = flags & flags::SPECULATIVE != 0;

        let valid_dvas: Vec<Dva> = bp.dva.iter().filter(|d| d.is_valid()).cloned().collect();
        let mut good: Option<Vec<u8>> = None;
        for (di, dva) in valid_dvas.iter().enumerate() {
            let top = match self.pool.top_vdev(dva.vdev) {
                Some(t) => t,
                None => continue,
            };
            if bp.is_gang() {
                match self.gang_read(&top, dva, &bp) {
                    Ok(data) => {
                        self.heal_other_copies(&valid_dvas, di, &data, &bp);
                        self.inner.lock().unwrap().data = Some(data);
                        return Ok(());
                    }
                    Err(e) => {
                        worst = IoErr::worst(worst, Some(e));
                        continue;
                    }
                }
            }
            let nvariants = top.read_variants();
            let mut bad_variants: Vec<usize> = Vec::new();
            let had_good = good.is_some();
            for variant in 0..nvariants {
                let _guard = self.pool.deadman_track("vdev read");
                let mut data = match top.read_variant(
                    &env,
                    variant,
                    dva.offset,
                    bp.psize as u64,
                    bp.physical_birth(),
                    self.priority,
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        worst = IoErr::worst(worst, Some(e));
                        if variant == 0 {
                            bad_variants.push(variant);
                        }
                        continue;
                    }
                };
                // Injected corruption happens "on the wire".
                if let Some((os, obj, lvl, blkid)) = bookmark {
                    if env.inject.check_data(os, obj, lvl, blkid) {
                        data[0] ^= 0xff;
                    }
                }
                let ok = match compute(bp.checksum, &data, !bp.byteorder_le) {
                    Ok(actual) => {
                        if bp.crypt.is_some() {
                            actual.0[0] == bp.cksum.0[0] && actual.0[1] == bp.cksum.0[1]
                        } else {
                            actual == bp.cksum
                        }
                    }
                    Err(_) => false,
                };
                if ok {
                    if good.is_none() {
                        good = Some(data);
                    }
                    if !scrub {
                        break;
                    }
                } else {
                    worst = IoErr::worst(worst, Some(IoErr::Checksum));
                    bad_variants.push(variant);
                }
            }
            if let Some(good_data) = &good {
                if !speculative {
                    for bad in bad_variants {
                        top.note_bad_variant(&env, bad, dva.offset, bp.physical_birth(), good_data);
                    }
                    // Only the first dva to produce good data rewrites
                    // the copies that failed before it.
                    if !had_good {
                        self.heal_other_copies(&valid_dvas, di, good_data, &bp);
                    }
                }
                if !scrub {
                    break;
                }
            }
        }
        match good {
            Some(data) => {
                self.inner.lock().unwrap().data = Some(data);
                Ok(())
            }
            None => Err(worst.unwrap_or(IoErr::Io)),
        }
    }

    /// After recovering good data, rewrite copies that came earlier in
    /// the walk and failed. Gang copies are skipped: each copy has its
    /// own header tree, so payload bytes cannot be written in place.
    fn heal_other_copies(&self, dvas: &[Dva], good_idx: usize, good: &[u8], bp: &BlockPtr) {
        if good_idx == 0 || bp.is_gang() {
            return;
        }
        let env = self.pool.io_env();
        for dva in dvas.iter().take(good_idx) {
            if let Some(top) = self.pool.top_vdev(dva.vdev) {
                let _ = top.write(&env, dva.offset, good, 0, IoClass::AsyncWrite);
                top.stats.self_healed_bytes.add(good.len() as u64);
            }
        }
    }

    fn gang_read(
        &self,
        top: &Arc<crate::vdev::Vdev>,
        dva: &Dva,
        bp: &BlockPtr,
    ) -> std::result::Result<Vec<u8>, IoErr> {
        let env = self.pool.io_env();
        let mut header =
            top.read_variant(&env, 0, dva.offset, GANG_HEADER_SIZE as u64, 0, self.priority)?;
        let eck_off = GANG_HEADER_SIZE - ECK_SIZE;
        embedded_verify(
            ChecksumId::GangHeader,
            &mut header,
            eck_off,
            Cksum([dva.offset, 0, 0, 0]),
        )
        .map_err(|_| IoErr::Checksum)?;
        let mut out = Vec::with_capacity(bp.psize as usize);
        for i in 0..GANG_CHILDREN {
            let child_bp = BlockPtr::decode(&header[i * BP_SIZE..(i + 1) * BP_SIZE])
                .map_err(|_| IoErr::Checksum)?;
            if child_bp.is_hole() {
                continue;
            }
            let child = Zio::read(
                Arc::clone(&self.pool),
                child_bp,
                flags::RAW | flags::GANG_CHILD,
                self.priority,
                None,
            );
            let outcome = child.wait()?;
            out.extend_from_slice(&outcome.data.unwrap_or_default());
        }
        out.truncate(bp.psize as usize);
        // The assembled payload must match the logical bp's checksum.
        let actual = compute(bp.checksum, &out, !bp.byteorder_le).map_err(|_| IoErr::Checksum)?;
        let expect_ok = if bp.crypt.is_some() {
            actual.0[0] == bp.cksum.0[0] && actual.0[1] == bp.cksum.0[1]
        } else {
            actual == bp.cksum
        };
        if !expect_ok {
            return Err(IoErr::Checksum);
        }
        Ok(out)
    }

    // ---- read side ------------------------------------------------------

    fn stage_read_bp_init(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let bp = inner.bp.clone();
        if bp.is_hole() {
            inner.data = Some(vec![0u8; bp.lsize as usize]);
            inner.pipeline = inner.stage | stage::DONE;
            return Ok(());
        }
        if let Some((_etype, payload)) = &bp.embedded {
            let raw = inner.flags & flags::RAW != 0;
            let data = if raw || bp.compress == CompressId::Off {
                payload.clone()
            } else {
                tp_compress::decompress(bp.compress, payload, bp.lsize as usize)
                    .map_err(|_| IoErr::Checksum)?
            };
            inner.data = Some(data);
            inner.pipeline = inner.stage | stage::DONE;
            return Ok(());
        }
        Ok(())
    }

    fn stage_decrypt(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let bp = inner.bp.clone();
        let raw = inner.flags & flags::RAW != 0;
        if raw {
            // Raw readers want the physical image untouched (cache
            // fills, resilver); the checksum already covered it.
            return Ok(());
        }

        if let Some(bpc) = &bp.crypt {
            let crypt = inner.props.crypt.clone().ok_or(IoErr::Auth)?;
            let data = inner.data.take().ok_or(IoErr::Io)?;
            let iv = block_iv(bpc.iv1, bpc.iv2);
            let aad = bpc.salt.to_le_bytes();
            let plain = crypt
                .template
                .decrypt(&iv, &aad, &data, &bpc.mac)
                .map_err(|_| IoErr::Auth)?;
            inner.data = Some(plain);
        }
        if bp.compress != CompressId::Off {
            let data = inner.data.take().ok_or(IoErr::Io)?;
            let out = tp_compress::decompress(bp.compress, &data, bp.lsize as usize)
                .map_err(|_| IoErr::Checksum)?;
            inner.data = Some(out);
        }
        Ok(())
    }

    // ---- free / claim ---------------------------------------------------

    fn stage_ddt_free(&self) -> std::result::Result<(), IoErr> {
        let mut inner = self.inner.lock().unwrap();
        let bp = inner.bp.clone();
        if !bp.dedup {
            return Ok(());
        }
        // A dedup free is a refcount drop; the DVAs are only released
        // when the last reference goes.
        if self.pool.ddt_decref(&bp, inner.txg) {
            inner.pipeline &= !stage::DVA_FREE;
        }
        Ok(())
    }

    fn stage_dva_free(self: &Arc<Zio>) -> std::result::Result<(), IoErr> {
        let inner = self.inner.lock().unwrap();
        let bp = inner.bp.clone();
        let txg = inner.txg;
        drop(inner);
        if bp.is_embedded() || bp.is_hole() {
            return Ok(());
        }
        if bp.is_gang() {
            // Free the children first, then the header blocks.
            if let Some(top) = self.pool.top_vdev(bp.dva[0].vdev) {
                let env = self.pool.io_env();
                if let Ok(mut header) = top.read_variant(
                    &env,
                    0,
                    bp.dva[0].offset,
                    GANG_HEADER_SIZE as u64,
                    0,
                    IoClass::AsyncRead,
                ) {
                    if embedded_verify(
                        ChecksumId::GangHeader,
                        &mut header,
                        GANG_HEADER_SIZE - ECK_SIZE,
                        Cksum([bp.dva[0].offset, 0, 0, 0]),
                    )
                    .is_ok()
                    {
                        for i in 0..GANG_CHILDREN {
                            if let Ok(child_bp) =
                                BlockPtr::decode(&header[i * BP_SIZE..(i + 1) * BP_SIZE])
                            {
                                if !child_bp.is_hole() {
                                    let child = Zio::free(Arc::clone(&self.pool), child_bp, txg);
                                    let _ = child.wait();
                                }
                            }
                        }
                    }
                }
            }
        }
        for dva in bp.dva.iter().filter(|d| d.is_valid()) {
            self.pool.allocator().free(dva, txg);
        }
        Ok(())
    }

    fn stage_dva_claim(&self) -> std::result::Result<(), IoErr> {
        let inner = self.inner.lock().unwrap();
        let bp = inner.bp.clone();
        let txg = inner.txg;
        drop(inner);
        for dva in bp.dva.iter().filter(|d| d.is_valid()) {
            self.pool.allocator().claim(dva, txg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_bits_are_monotonic() {
        let order = [
            stage::OPEN,
            stage::READ_BP_INIT,
            stage::WRITE_BP_INIT,
            stage::FREE_BP_INIT,
            stage::ISSUE_ASYNC,
            stage::ENCRYPT,
            stage::CHECKSUM_GENERATE,
            stage::DDT_WRITE,
            stage::DDT_FREE,
            stage::GANG_ASSEMBLE,
            stage::GANG_ISSUE,
            stage::DVA_ALLOCATE,
            stage::DVA_FREE,
            stage::DVA_CLAIM,
            stage::READY,
            stage::VDEV_IO_START,
            stage::VDEV_IO_DONE,
            stage::CHECKSUM_VERIFY,
            stage::DECRYPT,
            stage::DONE,
        ];
        for w in order.windows(2) {
            assert!(w[0] < w[1]);
        }
        // Every pipeline starts open and finishes done.
        for p in &[
            stage::READ_PIPELINE,
            stage::WRITE_PIPELINE,
            stage::FREE_PIPELINE,
            stage::CLAIM_PIPELINE,
            stage::NULL_PIPELINE,
        ] {
            assert!(p & stage::OPEN != 0);
            assert!(p & stage::DONE != 0);
        }
    }
}
