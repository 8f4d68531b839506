// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Dnodes: on-disk object descriptors.
//!
//! A dnode is 512 bytes: a 64-byte header, up to three block pointers,
//! and a bonus area. An object's data blocks hang off the block
//! pointers, through an indirect tree once the object outgrows them.
//! Tree height only ever grows: when a block id exceeds the current
//! capacity, the existing pointers are demoted into a fresh indirect
//! block and the dnode gains a level.

use std::collections::HashSet;
use std::sync::{Mutex, RwLock};

use byteorder::{ByteOrder, LittleEndian};

use crate::blkptr::{BlockPtr, ObjType, BP_SIZE};
use crate::error::Result;

pub const DNODE_SIZE: usize = 512;
pub const DN_MAX_NBLKPTR: usize = 3;
pub const DN_BONUS_SIZE: usize = 64;
/// log2 of block pointers per indirect block (128 per 16 KiB block).
pub const DN_EPBS: u8 = 7;
pub const DN_IND_BLKSHIFT: u8 = 14;
pub const DN_IND_BLKSIZE: usize = 1 << DN_IND_BLKSHIFT;
pub const DNODES_PER_BLOCK: u64 = (DN_IND_BLKSIZE as u64) / (DNODE_SIZE as u64);

#[derive(Debug, Clone)]
pub struct DnodePhys {
    pub obj_type: ObjType,
    pub indblkshift: u8,
    pub nlevels: u8,
    pub nblkptr: u8,
    pub bonustype: u8,
    pub checksum: u8,
    pub compress: u8,
    pub flags: u8,
    /// Data block size in 512-byte sectors.
    pub datablkszsec: u16,
    pub bonuslen: u16,
    pub maxblkid: u64,
    /// Logical byte length of the object.
    pub used: u64,
    pub blkptr: [BlockPtr; DN_MAX_NBLKPTR],
    pub bonus: [u8; DN_BONUS_SIZE],
}

impl Default for DnodePhys {
    fn default() -> Self {
        DnodePhys {
            obj_type: ObjType::None,
            indblkshift: DN_IND_BLKSHIFT,
            nlevels: 1,
            nblkptr: 1,
            bonustype: 0,
            checksum: 0,
            compress: 0,
            flags: 0,
            datablkszsec: 0,
            bonuslen: 0,
            maxblkid: 0,
            used: 0,
            blkptr: [
                BlockPtr::default(),
                BlockPtr::default(),
                BlockPtr::default(),
            ],
            bonus: [0; DN_BONUS_SIZE],
        }
    }
}

impl DnodePhys {
    pub fn new(obj_type: ObjType, datablksz: u32, nblkptr: u8) -> Self {
        debug_assert!(datablksz % 512 == 0);
        debug_assert!(nblkptr >= 1 && nblkptr as usize <= DN_MAX_NBLKPTR);
        DnodePhys {
            obj_type,
            nblkptr,
            datablkszsec: (datablksz / 512) as u16,
            ..Default::default()
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.obj_type != ObjType::None
    }

    pub fn datablksz(&self) -> u32 {
        u32::from(self.datablkszsec) * 512
    }

    /// Highest addressable blkid + 1 at the current height.
    pub fn capacity(&self) -> u64 {
        u64::from(self.nblkptr) << (DN_EPBS as u64 * (u64::from(self.nlevels) - 1))
    }

    /// Index into the dnode's own pointer array for a block id.
    pub fn top_index(&self, blkid: u64) -> usize {
        (blkid >> (DN_EPBS as u64 * (u64::from(self.nlevels) - 1))) as usize
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= DNODE_SIZE);
        for b in buf[..DNODE_SIZE].iter_mut() {
            *b = 0;
        }
        buf[0] = self.obj_type as u8;
        buf[1] = self.indblkshift;
        buf[2] = self.nlevels;
        buf[3] = self.nblkptr;
        buf[4] = self.bonustype;
        buf[5] = self.checksum;
        buf[6] = self.compress;
        buf[7] = self.flags;
        LittleEndian::write_u16(&mut buf[8..10], self.datablkszsec);
        LittleEndian::write_u16(&mut buf[10..12], self.bonuslen);
        LittleEndian::write_u64(&mut buf[16..24], self.maxblkid);
        LittleEndian::write_u64(&mut buf[24..32], self.used);
        for (i, bp) in self.blkptr.iter().enumerate() {
            bp.encode(&mut buf[64 + i * BP_SIZE..64 + (i + 1) * BP_SIZE]);
        }
        buf[448..448 + DN_BONUS_SIZE].copy_from_slice(&self.bonus);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert!(buf.len() >= DNODE_SIZE);
        let mut blkptr = [
            BlockPtr::default(),
            BlockPtr::default(),
            BlockPtr::default(),
        ];
        for (i, bp) in blkptr.iter_mut().enumerate() {
            *bp = BlockPtr::decode(&buf[64 + i * BP_SIZE..64 + (i + 1) * BP_SIZE])?;
        }
        let mut bonus = [0u8; DN_BONUS_SIZE];
        bonus.copy_from_slice(&buf[448..448 + DN_BONUS_SIZE]);
        Ok(DnodePhys {
            obj_type: ObjType::from_u8(buf[0])?,
            indblkshift: buf[1],
            nlevels: buf[2].max(1),
            nblkptr: buf[3].max(1),
            bonustype: buf[4],
            checksum: buf[5],
            compress: buf[6],
            flags: buf[7],
            datablkszsec: LittleEndian::read_u16(&buf[8..10]),
            bonuslen: LittleEndian::read_u16(&buf[10..12]),
            maxblkid: LittleEndian::read_u64(&buf[16..24]),
            used: LittleEndian::read_u64(&buf[24..32]),
            blkptr,
            bonus,
        })
    }
}

/// In-memory object handle.
pub struct Dnode {
    pub object: u64,
    pub phys: RwLock<DnodePhys>,
    /// Txgs with outstanding dirty state.
    pub dirty_txgs: Mutex<HashSet<u64>>,
}

impl Dnode {
    pub fn new(object: u64, phys: DnodePhys) -> Self {
        Dnode {
            object,
            phys: RwLock::new(phys),
            dirty_txgs: Mutex::new(HashSet::new()),
        }
    }

    pub fn datablksz(&self) -> u32 {
        self.phys.read().unwrap().datablksz()
    }

    pub fn nlevels(&self) -> u8 {
        self.phys.read().unwrap().nlevels
    }

    /// The meta-dnode block id holding `object`'s dnode.
    pub fn array_blkid(object: u64) -> u64 {
        object / DNODES_PER_BLOCK
    }

    pub fn array_offset(object: u64) -> usize {
        ((object % DNODES_PER_BLOCK) as usize) * DNODE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phys_roundtrip() {
        let mut phys = DnodePhys::new(ObjType::Data, 128 * 1024, 1);
        phys.maxblkid = 42;
        phys.used = 0x123456;
        phys.bonuslen = 16;
        phys.bonus[0] = 0xaa;
        phys.blkptr[0].birth = 9;
        phys.blkptr[0].lsize = 128 * 1024;
        phys.blkptr[0].obj_type = ObjType::Data;
        let mut buf = [0u8; DNODE_SIZE];
        phys.encode(&mut buf);
        let back = DnodePhys::decode(&buf).unwrap();
        assert_eq!(back.obj_type, ObjType::Data);
        assert_eq!(back.datablksz(), 128 * 1024);
        assert_eq!(back.maxblkid, 42);
        assert_eq!(back.used, 0x123456);
        assert_eq!(back.bonus[0], 0xaa);
        assert_eq!(back.blkptr[0].birth, 9);
    }

    #[test]
    fn free_dnode_is_all_zero() {
        let phys = DnodePhys::default();
        let mut buf = [0xffu8; DNODE_SIZE];
        phys.encode(&mut buf);
        assert!(buf.iter().all(|b| *b == 0));
        assert!(!DnodePhys::decode(&buf).unwrap().is_allocated());
    }

    #[test]
    fn capacity_by_level() {
        let mut phys = DnodePhys::new(ObjType::Data, 4096, 1);
        assert_eq!(phys.capacity(), 1);
        phys.nlevels = 2;
        assert_eq!(phys.capacity(), 128);
        phys.nlevels = 3;
        assert_eq!(phys.capacity(), 128 * 128);

        let mut meta = DnodePhys::new(ObjType::DnodeArray, DN_IND_BLKSIZE as u32, 3);
        assert_eq!(meta.capacity(), 3);
        meta.nlevels = 2;
        assert_eq!(meta.capacity(), 3 * 128);
        assert_eq!(meta.top_index(129), 1);
    }

    #[test]
    fn array_addressing() {
        assert_eq!(DNODES_PER_BLOCK, 32);
        assert_eq!(Dnode::array_blkid(0), 0);
        assert_eq!(Dnode::array_blkid(31), 0);
        assert_eq!(Dnode::array_blkid(32), 1);
        assert_eq!(Dnode::array_offset(33), DNODE_SIZE);
    }
}
