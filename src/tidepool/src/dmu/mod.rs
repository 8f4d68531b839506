// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The data management unit: objects, objsets, and copy-on-write
//! staging.
//!
//! An objset is a collection of dnodes backed by one meta-dnode whose
//! data blocks are the dnode array. All reads and writes go through
//! dbufs; a write dirties the dbuf and every ancestor up to the dnode in
//! the same txg, and the syncing txg turns dirty records into block
//! writes leaf-first, so a parent's buffer always carries its children's
//! final pointers before it is checksummed itself.

pub mod dbuf;
pub mod dnode;
pub mod tx;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use log::trace;

use crate::arc::BufType;
use crate::blkptr::{BlockPtr, ObjType, BP_SIZE};
use crate::error::{Error, IoErr, Result};
use crate::spa::PoolCore;
use crate::vdev::queue::IoClass;
use crate::zil::ZilHeader;
use crate::zio::{CryptCtx, WriteProps, Zio};
use tp_checksum::ChecksumId;
use tp_compress::CompressId;

use self::dbuf::{Dbuf, DbufKey, DbufState, DirtyRecord};
use self::dnode::{Dnode, DnodePhys, DNODE_SIZE, DN_EPBS, DN_IND_BLKSIZE};

pub const OBJSET_PHYS_SIZE: usize = 2048;
/// Default record size for data objects.
pub const DEFAULT_DATA_BLKSZ: u32 = 128 * 1024;
/// Record size for engine-internal objects.
pub const META_DATA_BLKSZ: u32 = 16 * 1024;

/// Per-dataset write policy.
#[derive(Debug, Clone)]
pub struct DatasetProps {
    pub checksum: ChecksumId,
    pub compress: CompressId,
    pub dedup: bool,
    pub copies: usize,
}

impl Default for DatasetProps {
    fn default() -> Self {
        DatasetProps {
            checksum: ChecksumId::Fletcher4,
            compress: CompressId::Lzjb,
            dedup: false,
            copies: 1,
        }
    }
}

/// The objset's root block.
#[derive(Debug, Clone)]
pub struct ObjsetPhys {
    pub meta_dnode: DnodePhys,
    pub zil_header: ZilHeader,
}

impl ObjsetPhys {
    pub fn new_empty() -> Self {
        ObjsetPhys {
            meta_dnode: DnodePhys::new(ObjType::DnodeArray, DN_IND_BLKSIZE as u32, 3),
            zil_header: ZilHeader::default(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; OBJSET_PHYS_SIZE];
        self.meta_dnode.encode(&mut buf[0..DNODE_SIZE]);
        self.zil_header.encode(&mut buf[DNODE_SIZE..DNODE_SIZE + ZilHeader::SIZE]);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < OBJSET_PHYS_SIZE {
            return Err(Error::Label("short objset phys"));
        }
        Ok(ObjsetPhys {
            meta_dnode: DnodePhys::decode(&buf[0..DNODE_SIZE])?,
            zil_header: ZilHeader::decode(&buf[DNODE_SIZE..DNODE_SIZE + ZilHeader::SIZE])?,
        })
    }
}

/// A collection of dnodes.
pub struct Objset {
    pub id: u64,
    pub props: Mutex<DatasetProps>,
    pub crypt: Option<Arc<CryptCtx>>,
    pub meta_dnode: Arc<Dnode>,
    pub zil_header: Mutex<ZilHeader>,
    dnodes: Mutex<HashMap<u64, Arc<Dnode>>>,
    /// Per-txg dirty dbufs, appended at dirty time and drained by sync.
    dirty_dbufs: Mutex<HashMap<u64, Vec<(Arc<Dbuf>, Arc<DirtyRecord>)>>>,
    /// Objects whose dnode needs rewriting per txg.
    dirty_dnodes: Mutex<HashMap<u64, HashSet<u64>>>,
    next_object: AtomicU64,
    /// The intent-log header changed; the next sync must rewrite the
    /// objset phys even with no data dirty.
    pub zil_dirty: std::sync::atomic::AtomicBool,
    /// Root bp of the last synced objset phys, freed on replace.
    pub last_rootbp: Mutex<BlockPtr>,
}

impl Objset {
    pub fn open(
        id: u64,
        phys: ObjsetPhys,
        rootbp: BlockPtr,
        props: DatasetProps,
        crypt: Option<Arc<CryptCtx>>,
    ) -> Arc<Objset> {
        Arc::new(Objset {
            id,
            props: Mutex::new(props),
            crypt,
            meta_dnode: Arc::new(Dnode::new(0, phys.meta_dnode)),
            zil_header: Mutex::new(phys.zil_header),
            dnodes: Mutex::new(HashMap::new()),
            dirty_dbufs: Mutex::new(HashMap::new()),
            dirty_dnodes: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(1),
            zil_dirty: std::sync::atomic::AtomicBool::new(false),
            last_rootbp: Mutex::new(rootbp),
        })
    }

    pub fn create(id: u64, props: DatasetProps, crypt: Option<Arc<CryptCtx>>) -> Arc<Objset> {
        Self::open(id, ObjsetPhys::new_empty(), BlockPtr::default(), props, crypt)
    }

    fn register_dirty(&self, txg: u64, db: Arc<Dbuf>, dr: Arc<DirtyRecord>) {
        self.dirty_dbufs
            .lock()
            .unwrap()
            .entry(txg)
            .or_insert_with(Vec::new)
            .push((db, dr));
    }

    fn take_dirty(&self, txg: u64) -> Vec<(Arc<Dbuf>, Arc<DirtyRecord>)> {
        self.dirty_dbufs
            .lock()
            .unwrap()
            .remove(&txg)
            .unwrap_or_default()
    }

    pub fn is_dirty(&self, txg: u64) -> bool {
        if self.zil_dirty.load(Ordering::Acquire) {
            return true;
        }
        let dbufs = self.dirty_dbufs.lock().unwrap();
        let dnodes = self.dirty_dnodes.lock().unwrap();
        dbufs.get(&txg).map_or(false, |v| !v.is_empty())
            || dnodes.get(&txg).map_or(false, |s| !s.is_empty())
    }

    fn mark_dnode_dirty(&self, txg: u64, object: u64) {
        self.dirty_dnodes
            .lock()
            .unwrap()
            .entry(txg)
            .or_insert_with(HashSet::new)
            .insert(object);
    }
}

// ---- dnode handling -----------------------------------------------------

/// Fetch an object's dnode, reading its array block on first use.
pub fn dnode_hold(pool: &Arc<PoolCore>, os: &Arc<Objset>, object: u64) -> Result<Arc<Dnode>> {
    if object == 0 {
        return Ok(Arc::clone(&os.meta_dnode));
    }
    {
        let dnodes = os.dnodes.lock().unwrap();
        if let Some(dn) = dnodes.get(&object) {
            return Ok(Arc::clone(dn));
        }
    }
    let blkid = Dnode::array_blkid(object);
    let meta = Arc::clone(&os.meta_dnode);
    if blkid > meta.phys.read().unwrap().maxblkid && meta.phys.read().unwrap().blkptr[0].is_hole()
    {
        return Err(Error::NoSuchObject(object));
    }
    let db = dbuf_hold_read(pool, os, &meta, 0, blkid)?;
    let phys = {
        let inner = db.inner.lock().unwrap();
        let data = inner.data.as_ref().ok_or(Error::NoSuchObject(object))?;
        let off = Dnode::array_offset(object);
        DnodePhys::decode(&data[off..off + DNODE_SIZE])?
    };
    pool.dbufs.rele(&db, "dbuf_read");
    if !phys.is_allocated() {
        return Err(Error::NoSuchObject(object));
    }
    let dn = Arc::new(Dnode::new(object, phys));
    os.dnodes.lock().unwrap().insert(object, Arc::clone(&dn));
    Ok(dn)
}

/// Allocate a fresh object in the open txg.
pub fn object_alloc(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    tx: &tx::DmuTx,
    obj_type: ObjType,
    datablksz: u32,
) -> Result<u64> {
    loop {
        let candidate = os.next_object.fetch_add(1, Ordering::Relaxed);
        if candidate == 0 {
            continue;
        }
        match dnode_hold(pool, os, candidate) {
            Err(Error::NoSuchObject(_)) => {
                let dn = Arc::new(Dnode::new(
                    candidate,
                    DnodePhys::new(obj_type, datablksz, 1),
                ));
                os.dnodes.lock().unwrap().insert(candidate, Arc::clone(&dn));
                dn.dirty_txgs.lock().unwrap().insert(tx.txg());
                os.mark_dnode_dirty(tx.txg(), candidate);
                trace!("objset {}: allocated object {}", os.id, candidate);
                return Ok(candidate);
            }
            Err(e) => return Err(e),
            Ok(_) => continue,
        }
    }
}

/// Allocate a specific object number (intent-log replay recreates
/// objects by id).
pub fn object_claim(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    tx: &tx::DmuTx,
    object: u64,
    obj_type: ObjType,
    datablksz: u32,
) -> Result<u64> {
    match dnode_hold(pool, os, object) {
        Ok(_) => Ok(object),
        Err(Error::NoSuchObject(_)) => {
            let dn = Arc::new(Dnode::new(object, DnodePhys::new(obj_type, datablksz, 1)));
            os.dnodes.lock().unwrap().insert(object, Arc::clone(&dn));
            dn.dirty_txgs.lock().unwrap().insert(tx.txg());
            os.mark_dnode_dirty(tx.txg(), object);
            Ok(object)
        }
        Err(e) => Err(e),
    }
}

/// Free an object: release every block it references and zero its
/// dnode.
pub fn object_free(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    tx: &tx::DmuTx,
    object: u64,
) -> Result<()> {
    let dn = dnode_hold(pool, os, object)?;
    let phys = dn.phys.read().unwrap().clone();
    for bp in phys.blkptr.iter() {
        free_tree(pool, os, bp, phys.nlevels - 1, tx.txg())?;
    }
    *dn.phys.write().unwrap() = DnodePhys::default();
    dn.dirty_txgs.lock().unwrap().insert(tx.txg());
    os.mark_dnode_dirty(tx.txg(), object);
    os.dnodes.lock().unwrap().remove(&object);
    // Drop any cached dbufs for the dead object.
    pool.dbufs.evict_objset_object(os.id, object);
    Ok(())
}

/// Free a block-pointer tree rooted at `bp` at `level`.
fn free_tree(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    bp: &BlockPtr,
    level: u8,
    txg: u64,
) -> Result<()> {
    if bp.is_hole() {
        return Ok(());
    }
    if level > 0 {
        let data = pool
            .read_block(bp, os.crypt.clone(), BufType::Metadata, None, false)
            .map_err(Error::from)?;
        for slot in data.chunks_exact(BP_SIZE) {
            let child = BlockPtr::decode(slot)?;
            free_tree(pool, os, &child, level - 1, txg)?;
        }
    }
    let zio = Zio::free(pool.clone(), bp.clone(), txg);
    let _ = zio.wait();
    Ok(())
}

pub fn object_len(pool: &Arc<PoolCore>, os: &Arc<Objset>, object: u64) -> Result<u64> {
    let dn = dnode_hold(pool, os, object)?;
    let used = dn.phys.read().unwrap().used;
    Ok(used)
}

// ---- dbuf path ----------------------------------------------------------

fn block_size_at(dn: &Dnode, level: u8) -> usize {
    if level == 0 {
        dn.datablksz() as usize
    } else {
        DN_IND_BLKSIZE
    }
}

/// Find the block pointer covering `(level, blkid)` by walking down from
/// the dnode. Returns a hole bp for never-written ranges.
fn dbuf_find_bp(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    level: u8,
    blkid: u64,
) -> Result<BlockPtr> {
    let phys = dn.phys.read().unwrap();
    let nlevels = phys.nlevels;
    if level >= nlevels {
        return Ok(BlockPtr::new_hole(block_size_at(dn, level) as u32));
    }
    if level == nlevels - 1 {
        let idx = phys.top_index(blkid);
        if idx >= phys.nblkptr as usize {
            return Ok(BlockPtr::new_hole(block_size_at(dn, level) as u32));
        }
        return Ok(phys.blkptr[idx].clone());
    }
    drop(phys);
    let parent = dbuf_hold_read(pool, os, dn, level + 1, blkid >> DN_EPBS)?;
    let bp = {
        let inner = parent.inner.lock().unwrap();
        let data = inner.data.as_ref().ok_or(Error::Zio(IoErr::Io))?;
        let slot = (blkid & ((1 << DN_EPBS) - 1)) as usize;
        BlockPtr::decode(&data[slot * BP_SIZE..(slot + 1) * BP_SIZE])?
    };
    pool.dbufs.rele(&parent, "dbuf_read");
    Ok(bp)
}

/// Hold `(level, blkid)` and bring it to CACHED, reading through the
/// cache hierarchy on a miss.
pub fn dbuf_hold_read(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    level: u8,
    blkid: u64,
) -> Result<Arc<Dbuf>> {
    let key = DbufKey {
        objset: os.id,
        object: dn.object,
        level,
        blkid,
    };
    let db = pool.dbufs.hold(key, "dbuf_read");
    loop {
        let mut inner = db.inner.lock().unwrap();
        match inner.state {
            DbufState::Cached => {
                drop(inner);
                return Ok(db);
            }
            DbufState::Uncached => {
                inner.state = DbufState::Read;
                drop(inner);
                let bp = match dbuf_find_bp(pool, os, dn, level, blkid) {
                    Ok(bp) => bp,
                    Err(e) => {
                        db.read_failed();
                        pool.dbufs.rele(&db, "dbuf_read");
                        return Err(e);
                    }
                };
                let blksz = block_size_at(dn, level);
                let result = if bp.is_hole() {
                    Ok(vec![0u8; blksz])
                } else {
                    let typ = if level > 0 || dn.phys.read().unwrap().obj_type.is_metadata() {
                        BufType::Metadata
                    } else {
                        BufType::Data
                    };
                    pool.read_block(
                        &bp,
                        os.crypt.clone(),
                        typ,
                        Some((os.id, dn.object, level, blkid)),
                        false,
                    )
                    .map_err(Error::from)
                };
                match result {
                    Ok(data) => {
                        db.fill_done(data);
                        return Ok(db);
                    }
                    Err(e) => {
                        db.read_failed();
                        pool.dbufs.rele(&db, "dbuf_read");
                        return Err(e);
                    }
                }
            }
            DbufState::Read | DbufState::Fill | DbufState::NoFill => {
                // Another thread is filling; wait on db_changed.
                let _unused = db.cv.wait(inner).unwrap();
            }
            DbufState::Evicting => {
                drop(inner);
                pool.dbufs.rele(&db, "dbuf_read");
                return Err(Error::Busy("dbuf evicting"));
            }
        }
    }
}

/// Hold `(0, blkid)` for a full overwrite; no read happens.
pub fn dbuf_hold_fill(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    blkid: u64,
) -> Result<Arc<Dbuf>> {
    let key = DbufKey {
        objset: os.id,
        object: dn.object,
        level: 0,
        blkid,
    };
    let db = pool.dbufs.hold(key, "dbuf_read");
    loop {
        let mut inner = db.inner.lock().unwrap();
        match inner.state {
            DbufState::Uncached => {
                inner.state = DbufState::Fill;
                drop(inner);
                db.fill_done(vec![0u8; dn.datablksz() as usize]);
                return Ok(db);
            }
            DbufState::Cached => {
                drop(inner);
                return Ok(db);
            }
            DbufState::Evicting => {
                drop(inner);
                pool.dbufs.rele(&db, "dbuf_read");
                return Err(Error::Busy("dbuf evicting"));
            }
            _ => {
                let _unused = db.cv.wait(inner).unwrap();
            }
        }
    }
}

/// Note an impending modification: create (or reuse) the txg's dirty
/// record, freeze any older record, and dirty every ancestor.
pub fn dbuf_will_dirty(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    db: &Arc<Dbuf>,
    txg: u64,
) -> Result<Arc<DirtyRecord>> {
    let (dr, newly_dirty) = {
        let mut inner = db.inner.lock().unwrap();
        debug_assert_eq!(inner.state, DbufState::Cached);
        if let Some(head) = inner.dirty.first() {
            if head.txg == txg {
                return Ok(Arc::clone(head));
            }
            debug_assert!(head.txg < txg, "dirty records must descend in txg");
            // The older txg keeps the image it saw.
            let mut frozen = head.frozen.lock().unwrap();
            if frozen.is_none() {
                *frozen = inner.data.clone();
            }
        }
        let dr = Arc::new(DirtyRecord {
            txg,
            key: db.key,
            frozen: Mutex::new(None),
            children: Mutex::new(Vec::new()),
            override_bp: Mutex::new(None),
        });
        inner.dirty.insert(0, Arc::clone(&dr));
        (dr, true)
    };
    if newly_dirty {
        os.register_dirty(txg, Arc::clone(db), Arc::clone(&dr));
        pool.add_dirty_bytes(block_size_at(dn, db.key.level) as u64);
        dn.dirty_txgs.lock().unwrap().insert(txg);
        os.mark_dnode_dirty(txg, dn.object);

        // Dirty the ancestor chain in the same txg.
        let nlevels = dn.phys.read().unwrap().nlevels;
        if db.key.level + 1 < nlevels {
            let parent = dbuf_hold_read(pool, os, dn, db.key.level + 1, db.key.blkid >> DN_EPBS)?;
            let parent_dr = dbuf_will_dirty(pool, os, dn, &parent, txg)?;
            parent_dr.children.lock().unwrap().push(Arc::clone(&dr));
            pool.dbufs.rele(&parent, "dbuf_read");
        }
    }
    Ok(dr)
}

/// Grow the dnode's tree until `blkid` is addressable.
fn dnode_ensure_height(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    blkid: u64,
    txg: u64,
) -> Result<()> {
    loop {
        {
            let phys = dn.phys.read().unwrap();
            if u64::from(phys.nblkptr) == 0 {
                return Err(Error::Config("dnode without pointers".into()));
            }
            if blkid < phys.capacity() {
                return Ok(());
            }
        }
        // Demote the current pointers into a fresh indirect block that
        // becomes the new top.
        let mut phys = dn.phys.write().unwrap();
        if blkid < phys.capacity() {
            // Another writer grew the tree while we waited.
            continue;
        }
        let old_top_level = phys.nlevels - 1;
        let mut data = vec![0u8; DN_IND_BLKSIZE];
        for (i, bp) in phys.blkptr.iter().enumerate() {
            bp.encode(&mut data[i * BP_SIZE..(i + 1) * BP_SIZE]);
        }
        for bp in phys.blkptr.iter_mut() {
            *bp = BlockPtr::default();
        }
        phys.nlevels += 1;
        let new_level = old_top_level + 1;
        drop(phys);

        let key = DbufKey {
            objset: os.id,
            object: dn.object,
            level: new_level,
            blkid: 0,
        };
        let db = pool.dbufs.hold(key, "dbuf_read");
        {
            let mut inner = db.inner.lock().unwrap();
            if inner.state == DbufState::Uncached {
                inner.state = DbufState::Fill;
            }
            inner.data = Some(data);
            inner.state = DbufState::Cached;
        }
        dbuf_will_dirty(pool, os, dn, &db, txg)?;
        pool.dbufs.rele(&db, "dbuf_read");
        trace!(
            "objset {} object {}: grew to {} levels",
            os.id,
            dn.object,
            dn.nlevels()
        );
    }
}

// ---- read / write -------------------------------------------------------

pub fn dmu_read(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    object: u64,
    offset: u64,
    len: u64,
) -> Result<Vec<u8>> {
    let dn = dnode_hold(pool, os, object)?;
    let blksz = dn.datablksz() as u64;
    let mut out = Vec::with_capacity(len as usize);
    let mut pos = offset;
    let end = offset + len;
    while pos < end {
        let blkid = pos / blksz;
        let boff = (pos % blksz) as usize;
        let take = ((end - pos) as usize).min(blksz as usize - boff);
        let over_eof = {
            let phys = dn.phys.read().unwrap();
            blkid > phys.maxblkid && phys.used == 0
        };
        if over_eof {
            out.extend(std::iter::repeat(0).take(take));
        } else {
            let db = dbuf_hold_read(pool, os, &dn, 0, blkid)?;
            {
                let inner = db.inner.lock().unwrap();
                let data = inner.data.as_ref().ok_or(Error::Zio(IoErr::Io))?;
                out.extend_from_slice(&data[boff..boff + take]);
            }
            pool.dbufs.rele(&db, "dbuf_read");
        }
        pos += take as u64;
    }
    Ok(out)
}

pub fn dmu_write(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    tx: &tx::DmuTx,
    object: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let dn = dnode_hold(pool, os, object)?;
    dmu_write_impl(pool, os, &dn, tx.txg(), offset, data)
}

/// Shared by the open-context path and syncing-context metadata
/// updates.
fn dmu_write_impl(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    txg: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    if data.is_empty() {
        return Ok(());
    }
    let blksz = dn.datablksz() as u64;
    let last_blkid = (offset + data.len() as u64 - 1) / blksz;
    dnode_ensure_height(pool, os, dn, last_blkid, txg)?;

    let mut pos = offset;
    let end = offset + data.len() as u64;
    while pos < end {
        let blkid = pos / blksz;
        let boff = (pos % blksz) as usize;
        let take = ((end - pos) as usize).min(blksz as usize - boff);
        let full_block = boff == 0 && take == blksz as usize;
        let never_written = dbuf_find_bp(pool, os, dn, 0, blkid)?.is_hole()
            && pool
                .dbufs
                .lookup(&DbufKey {
                    objset: os.id,
                    object: dn.object,
                    level: 0,
                    blkid,
                })
                .map_or(true, |db| db.state() != DbufState::Cached);
        let db = if full_block || never_written {
            dbuf_hold_fill(pool, os, dn, blkid)?
        } else {
            dbuf_hold_read(pool, os, dn, 0, blkid)?
        };
        dbuf_will_dirty(pool, os, dn, &db, txg)?;
        {
            let mut inner = db.inner.lock().unwrap();
            let buf = inner.data.as_mut().ok_or(Error::Zio(IoErr::Io))?;
            let src = &data[(pos - offset) as usize..(pos - offset) as usize + take];
            buf[boff..boff + take].copy_from_slice(src);
        }
        pool.dbufs.rele(&db, "dbuf_read");
        pos += take as u64;
    }

    {
        let mut phys = dn.phys.write().unwrap();
        phys.maxblkid = phys.maxblkid.max(last_blkid);
        phys.used = phys.used.max(end);
    }
    dn.dirty_txgs.lock().unwrap().insert(txg);
    os.mark_dnode_dirty(txg, dn.object);
    Ok(())
}

pub fn dmu_truncate(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    tx: &tx::DmuTx,
    object: u64,
    new_len: u64,
) -> Result<()> {
    let dn = dnode_hold(pool, os, object)?;
    {
        let mut phys = dn.phys.write().unwrap();
        phys.used = phys.used.min(new_len);
    }
    dn.dirty_txgs.lock().unwrap().insert(tx.txg());
    os.mark_dnode_dirty(tx.txg(), object);
    Ok(())
}

// ---- sync ---------------------------------------------------------------

fn write_props_for(os: &Objset, dn: &DnodePhys, level: u8) -> WriteProps {
    let props = os.props.lock().unwrap();
    let metadata = level > 0 || dn.obj_type.is_metadata();
    if metadata {
        WriteProps {
            checksum: ChecksumId::Fletcher4,
            compress: CompressId::Lzjb,
            copies: props.copies,
            dedup: false,
            class: crate::metaslab::AllocClass::Normal,
            obj_type: dn.obj_type,
            level,
            crypt: None,
        }
    } else {
        WriteProps {
            checksum: if props.dedup {
                ChecksumId::Sha256
            } else {
                props.checksum
            },
            compress: props.compress,
            copies: props.copies,
            dedup: props.dedup,
            class: crate::metaslab::AllocClass::Normal,
            obj_type: dn.obj_type,
            level,
            crypt: os.crypt.clone(),
        }
    }
}

/// Count the non-hole pointers in an indirect or dnode-array block.
fn fill_count(data: &[u8], level: u8, obj_type: ObjType) -> u64 {
    if level > 0 {
        data.chunks_exact(BP_SIZE)
            .filter(|c| BlockPtr::decode(c).map_or(false, |bp| !bp.is_hole()))
            .count() as u64
    } else if obj_type == ObjType::DnodeArray {
        data.chunks_exact(DNODE_SIZE)
            .filter(|c| c.iter().any(|b| *b != 0))
            .count() as u64
    } else {
        1
    }
}

/// Install a freshly written child bp into its parent's pending image.
fn install_bp(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    dn: &Arc<Dnode>,
    key: &DbufKey,
    bp: &BlockPtr,
    txg: u64,
) -> Result<BlockPtr> {
    let nlevels = dn.phys.read().unwrap().nlevels;
    if key.level == nlevels - 1 {
        let mut phys = dn.phys.write().unwrap();
        let idx = phys.top_index(key.blkid);
        let old = phys.blkptr[idx].clone();
        phys.blkptr[idx] = bp.clone();
        return Ok(old);
    }
    let parent_key = DbufKey {
        objset: os.id,
        object: dn.object,
        level: key.level + 1,
        blkid: key.blkid >> DN_EPBS,
    };
    let parent = pool
        .dbufs
        .lookup(&parent_key)
        .ok_or(Error::Busy("parent dbuf missing during sync"))?;
    let slot = (key.blkid & ((1 << DN_EPBS) - 1)) as usize;
    let parent_dr = parent
        .dirty_record_for(txg)
        .ok_or(Error::Busy("parent not dirty during sync"))?;
    // Install into the image this txg will sync (the frozen copy when a
    // newer txg has already redirtied the parent) AND the live buffer,
    // so later txgs inherit the final pointer too.
    let old;
    {
        let mut frozen = parent_dr.frozen.lock().unwrap();
        if let Some(buf) = frozen.as_mut() {
            old = BlockPtr::decode(&buf[slot * BP_SIZE..(slot + 1) * BP_SIZE])?;
            bp.encode(&mut buf[slot * BP_SIZE..(slot + 1) * BP_SIZE]);
        } else {
            old = BlockPtr::default();
        }
    }
    let old = {
        let mut inner = parent.inner.lock().unwrap();
        let buf = inner.data.as_mut().ok_or(Error::Zio(IoErr::Io))?;
        let live_old = BlockPtr::decode(&buf[slot * BP_SIZE..(slot + 1) * BP_SIZE])?;
        bp.encode(&mut buf[slot * BP_SIZE..(slot + 1) * BP_SIZE]);
        if old.is_hole() {
            live_old
        } else {
            old
        }
    };
    Ok(old)
}

/// Sync every dirty dbuf of `os` for `txg` and return the new objset
/// root block pointer. Runs in syncing context only.
pub fn objset_sync(pool: &Arc<PoolCore>, os: &Arc<Objset>, txg: u64) -> Result<BlockPtr> {
    let mut passes = 0;
    loop {
        passes += 1;
        debug_assert!(passes < 64, "objset sync did not converge");

        let mut dirty = os.take_dirty(txg);
        let dirty_objects: Vec<u64> = {
            let mut map = os.dirty_dnodes.lock().unwrap();
            map.remove(&txg).unwrap_or_default().into_iter().collect()
        };
        if dirty.is_empty() && dirty_objects.is_empty() {
            break;
        }

        // Children before parents: ascending level, and within a level
        // descending blkid for determinism.
        dirty.sort_by_key(|(db, _)| (db.key.level, db.key.blkid));

        for (db, dr) in dirty {
            let dn = dnode_hold(pool, os, db.key.object)?;
            let data = db
                .sync_data(&dr)
                .ok_or(Error::Busy("dirty dbuf without data"))?;

            let new_bp = if let Some(bp) = dr.override_bp.lock().unwrap().clone() {
                // Block already written outside the sync path.
                bp
            } else {
                let dn_phys = dn.phys.read().unwrap().clone();
                let props = write_props_for(os, &dn_phys, db.key.level);
                let fill = fill_count(&data, db.key.level, dn_phys.obj_type);
                let zio = Zio::write(
                    Arc::clone(pool),
                    data,
                    props,
                    txg,
                    0,
                    IoClass::SyncWrite,
                );
                zio.set_bookmark(os.id, db.key.object, db.key.level, db.key.blkid);
                let outcome = zio.wait().map_err(Error::from)?;
                let mut bp = outcome.bp;
                bp.fill = fill;
                bp
            };

            let old_bp = install_bp(pool, os, &dn, &db.key, &new_bp, txg)?;
            if !old_bp.is_hole() && old_bp.birth < txg {
                let free = Zio::free(Arc::clone(pool), old_bp, txg);
                let _ = free.wait();
            }
            db.undirty(txg);
            pool.sub_dirty_bytes(block_size_at(&dn, db.key.level) as u64);
        }

        // Rewrite the dnodes of every object touched this pass; the
        // writes land in the dirty list and the next pass flushes them.
        for object in dirty_objects {
            if object == 0 {
                continue;
            }
            let dn = match os.dnodes.lock().unwrap().get(&object) {
                Some(dn) => Arc::clone(dn),
                None => continue,
            };
            let mut buf = vec![0u8; DNODE_SIZE];
            dn.phys.read().unwrap().encode(&mut buf);
            let meta = Arc::clone(&os.meta_dnode);
            {
                // The array object tracks how many dnodes it covers.
                let mut mphys = meta.phys.write().unwrap();
                let want = (object + 1) * DNODE_SIZE as u64;
                if mphys.used < want {
                    mphys.used = want;
                }
            }
            dmu_write_impl(
                pool,
                os,
                &meta,
                txg,
                object * DNODE_SIZE as u64,
                &buf,
            )?;
            dn.dirty_txgs.lock().unwrap().remove(&txg);
        }
    }

    os.zil_dirty
        .store(false, std::sync::atomic::Ordering::Release);
    // The objset root: meta-dnode plus the current intent-log header.
    let phys = ObjsetPhys {
        meta_dnode: os.meta_dnode.phys.read().unwrap().clone(),
        zil_header: os.zil_header.lock().unwrap().clone(),
    };
    let props = WriteProps {
        checksum: ChecksumId::Fletcher4,
        compress: CompressId::Lzjb,
        copies: 1,
        dedup: false,
        class: crate::metaslab::AllocClass::Normal,
        obj_type: ObjType::Objset,
        level: 0,
        crypt: None,
    };
    let zio = Zio::write(
        Arc::clone(pool),
        phys.encode(),
        props,
        txg,
        0,
        IoClass::SyncWrite,
    );
    zio.set_bookmark(os.id, 0, 0, 0);
    let outcome = zio.wait().map_err(Error::from)?;

    let old_root = {
        let mut last = os.last_rootbp.lock().unwrap();
        std::mem::replace(&mut *last, outcome.bp.clone())
    };
    if !old_root.is_hole() && old_root.birth < txg {
        let free = Zio::free(Arc::clone(pool), old_root, txg);
        let _ = free.wait();
    }
    Ok(outcome.bp)
}

/// Read an entire small object (directories, dataset records).
pub fn dmu_read_all(pool: &Arc<PoolCore>, os: &Arc<Objset>, object: u64) -> Result<Vec<u8>> {
    let len = object_len(pool, os, object)?;
    dmu_read(pool, os, object, 0, len)
}

/// Syncing-context write: no transaction, no throttle. Only the sync
/// thread mutates the meta objset, so the txg is passed directly.
pub fn dmu_write_sync(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    txg: u64,
    object: u64,
    offset: u64,
    data: &[u8],
) -> Result<()> {
    let dn = dnode_hold(pool, os, object)?;
    dmu_write_impl(pool, os, &dn, txg, offset, data)
}

/// Syncing-context truncate-to-zero plus rewrite.
pub fn dmu_rewrite_sync(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    txg: u64,
    object: u64,
    data: &[u8],
) -> Result<()> {
    let dn = dnode_hold(pool, os, object)?;
    {
        let mut phys = dn.phys.write().unwrap();
        phys.used = 0;
    }
    dmu_write_impl(pool, os, &dn, txg, 0, data)?;
    let dn2 = dnode_hold(pool, os, object)?;
    {
        let mut phys = dn2.phys.write().unwrap();
        phys.used = data.len() as u64;
    }
    Ok(())
}

/// Free every block an objset references: each object's tree, then the
/// dnode array's own tree. Used by dataset destroy in syncing context.
pub fn objset_free_all(pool: &Arc<PoolCore>, os: &Arc<Objset>, txg: u64) -> Result<()> {
    let nobjs = os.meta_dnode.phys.read().unwrap().used / DNODE_SIZE as u64;
    for object in 1..=nobjs {
        let dn = match dnode_hold(pool, os, object) {
            Ok(dn) => dn,
            Err(Error::NoSuchObject(_)) => continue,
            Err(e) => return Err(e),
        };
        let phys = dn.phys.read().unwrap().clone();
        for bp in phys.blkptr.iter() {
            free_tree(pool, os, bp, phys.nlevels - 1, txg)?;
        }
    }
    let meta = os.meta_dnode.phys.read().unwrap().clone();
    for bp in meta.blkptr.iter() {
        free_tree(pool, os, bp, meta.nlevels - 1, txg)?;
    }
    Ok(())
}

/// Syncing-context object allocation.
pub fn object_alloc_sync(
    pool: &Arc<PoolCore>,
    os: &Arc<Objset>,
    txg: u64,
    obj_type: ObjType,
    datablksz: u32,
) -> Result<u64> {
    loop {
        let candidate = os.next_object.fetch_add(1, Ordering::Relaxed);
        if candidate == 0 {
            continue;
        }
        match dnode_hold(pool, os, candidate) {
            Err(Error::NoSuchObject(_)) => {
                let dn = Arc::new(Dnode::new(
                    candidate,
                    DnodePhys::new(obj_type, datablksz, 1),
                ));
                os.dnodes.lock().unwrap().insert(candidate, Arc::clone(&dn));
                dn.dirty_txgs.lock().unwrap().insert(txg);
                os.mark_dnode_dirty(txg, candidate);
                return Ok(candidate);
            }
            Err(e) => return Err(e),
            Ok(_) => continue,
        }
    }
}
