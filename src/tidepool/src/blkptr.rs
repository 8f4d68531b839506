// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Block pointers.
//!
//! A block pointer is the 128-byte on-disk identity of one block: up to
//! three device-virtual-addresses, a packed properties word, birth
//! transaction groups, a fill count, and either a 256-bit checksum or the
//! encryption parameters plus MAC. The word-by-word layout:
//!
//! ```text
//!  word 0/1  DVA 1: (pad | vdev:32 | grid:8 | asize:24) (gang:1 | offset:63)
//!  word 2/3  DVA 2
//!  word 4/5  DVA 3          (salt / iv1 when encrypted)
//!  word 6    B:1 D:1 X:1 | level:5 | type:8 | checksum:8 | E:1 | comp:7 | psize:16 | lsize:16
//!  word 7/8  padding
//!  word 9    physical birth txg
//!  word 10   logical birth txg
//!  word 11   fill count     (iv2:32 | fill:32 when encrypted)
//!  word 12..15  checksum[4] (checksum[2] + mac[2] when encrypted)
//! ```
//!
//! Embedded block pointers carry their payload in the DVA, padding and
//! checksum words instead (14 words, 112 bytes), with byte-granular
//! psize/lsize and an embedded-type field where the checksum id would be.
//!
//! One bit per block pointer selects byte order; the decoder byteswaps
//! when the stored order is not ours. Sizes are stored in 512-byte
//! sectors (minus one); in memory everything is bytes.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tp_checksum::{ChecksumId, Cksum};
use tp_compress::CompressId;

use crate::error::{Error, Result};

pub const BP_SIZE: usize = 128;
pub const SECTOR: u64 = 512;
pub const DVAS_PER_BP: usize = 3;
/// Max payload of an embedded block pointer.
pub const BP_EMBEDDED_PAYLOAD: usize = 112;

/// DMU object types, stored in the block pointer and the dnode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjType {
    None = 0,
    /// The dnode-array object backing an objset.
    DnodeArray = 1,
    /// An objset phys block.
    Objset = 2,
    /// Name -> object directory (dataset namespace, dedup stores index).
    Directory = 3,
    /// Plain data.
    Data = 4,
    /// Dedup table store.
    DdtStore = 5,
    /// Intent log block.
    IntentLog = 6,
}

impl ObjType {
    pub fn from_u8(v: u8) -> Result<Self> {
        Ok(match v {
            0 => ObjType::None,
            1 => ObjType::DnodeArray,
            2 => ObjType::Objset,
            3 => ObjType::Directory,
            4 => ObjType::Data,
            5 => ObjType::DdtStore,
            6 => ObjType::IntentLog,
            other => return Err(Error::Config(format!("bad object type {}", other))),
        })
    }

    /// Metadata types are cached as metadata and checksummed even when
    /// the dataset says `checksum=off`.
    pub fn is_metadata(self) -> bool {
        matches!(
            self,
            ObjType::DnodeArray | ObjType::Objset | ObjType::Directory | ObjType::DdtStore
        )
    }
}

/// Embedded block pointer payload interpretation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EmbeddedType {
    Data = 0,
    Redacted = 2,
}

/// A device-virtual-address: which vdev, where, and how much was
/// allocated (parity and gang headers included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dva {
    pub vdev: u32,
    pub grid: u8,
    /// Allocated bytes; always a multiple of the vdev's sector size.
    pub asize: u64,
    /// Byte offset into the vdev's data region.
    pub offset: u64,
    pub gang: bool,
}

impl Dva {
    pub fn is_empty(&self) -> bool {
        self.asize == 0 && self.offset == 0 && self.vdev == 0 && !self.gang
    }

    pub fn is_valid(&self) -> bool {
        self.asize != 0
    }

    fn encode(&self) -> (u64, u64) {
        let word0 = (u64::from(self.vdev) << 32)
            | (u64::from(self.grid) << 24)
            | ((self.asize / SECTOR) & 0x00ff_ffff);
        let word1 = ((self.gang as u64) << 63) | ((self.offset / SECTOR) & ((1 << 63) - 1));
        (word0, word1)
    }

    fn decode(word0: u64, word1: u64) -> Self {
        Dva {
            vdev: (word0 >> 32) as u32,
            grid: ((word0 >> 24) & 0xff) as u8,
            asize: (word0 & 0x00ff_ffff) * SECTOR,
            offset: (word1 & ((1 << 63) - 1)) * SECTOR,
            gang: word1 >> 63 != 0,
        }
    }
}

impl std::fmt::Display for Dva {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}:{:#x}:{:#x}>", self.vdev, self.offset, self.asize)
    }
}

/// Encryption parameters packed into an encrypted block pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BpCrypt {
    pub salt: u64,
    pub iv1: u64,
    pub iv2: u32,
    pub mac: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPtr {
    pub dva: [Dva; DVAS_PER_BP],
    /// True when written in little-endian byte order.
    pub byteorder_le: bool,
    pub dedup: bool,
    pub level: u8,
    pub obj_type: ObjType,
    pub checksum: ChecksumId,
    pub compress: CompressId,
    /// Physical (post-compression) size in bytes.
    pub psize: u32,
    /// Logical size in bytes.
    pub lsize: u32,
    /// Txg dva[0] was written; zero when equal to `birth`.
    pub phys_birth: u64,
    /// Txg the block was logically born.
    pub birth: u64,
    /// Non-hole blocks beneath this one (1 for data blocks).
    pub fill: u64,
    pub cksum: Cksum,
    /// Present iff the block is encrypted.
    pub crypt: Option<BpCrypt>,
    /// Present iff the pointer embeds its payload.
    pub embedded: Option<(EmbeddedType, Vec<u8>)>,
}

impl Default for BlockPtr {
    fn default() -> Self {
        BlockPtr {
            dva: [Dva::default(); DVAS_PER_BP],
            byteorder_le: true,
            dedup: false,
            level: 0,
            obj_type: ObjType::None,
            checksum: ChecksumId::Off,
            compress: CompressId::Off,
            psize: 0,
            lsize: 0,
            phys_birth: 0,
            birth: 0,
            fill: 0,
            cksum: Cksum::default(),
            crypt: None,
            embedded: None,
        }
    }
}

impl BlockPtr {
    /// A hole: never written, or punched. Reads of a hole return zeros.
    pub fn new_hole(lsize: u32) -> Self {
        BlockPtr {
            lsize,
            ..Default::default()
        }
    }

    pub fn is_hole(&self) -> bool {
        self.embedded.is_none() && self.dva[0].is_empty() && self.birth == 0
    }

    pub fn is_embedded(&self) -> bool {
        self.embedded.is_some()
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypt.is_some()
    }

    pub fn is_gang(&self) -> bool {
        !self.is_embedded() && self.dva[0].gang
    }

    pub fn ndvas(&self) -> usize {
        if self.is_embedded() {
            return 0;
        }
        self.dva.iter().filter(|d| d.is_valid()).count()
    }

    /// Total allocated bytes across copies.
    pub fn asize(&self) -> u64 {
        self.dva.iter().map(|d| d.asize).sum()
    }

    pub fn physical_birth(&self) -> u64 {
        if self.is_embedded() {
            0
        } else if self.phys_birth != 0 {
            self.phys_birth
        } else {
            self.birth
        }
    }

    /// The identity DVA; cache keys and dedup comparisons use dva[0].
    pub fn identity(&self) -> &Dva {
        &self.dva[0]
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= BP_SIZE);
        let mut words = [0u64; 16];
        match &self.embedded {
            Some((etype, payload)) => {
                debug_assert!(payload.len() <= BP_EMBEDDED_PAYLOAD);
                debug_assert!(self.crypt.is_none());
                let prop = (1u64 << 63)  // byteorder: little
                    | (u64::from(self.level) & 0x1f) << 56
                    | u64::from(self.obj_type as u8) << 48
                    | u64::from(*etype as u8) << 40
                    | 1u64 << 39         // embedded
                    | (u64::from(self.compress as u8) & 0x7f) << 32
                    | u64::from(payload.len() as u64 & 0x7f) << 25
                    | u64::from(self.lsize) & 0x1ff_ffff;
                words[6] = prop;
                words[10] = self.birth;
                // Payload words: 0..=5, 7..=9, 11..=15.
                let slots: [usize; 14] = [0, 1, 2, 3, 4, 5, 7, 8, 9, 11, 12, 13, 14, 15];
                let mut padded = [0u8; BP_EMBEDDED_PAYLOAD];
                padded[..payload.len()].copy_from_slice(payload);
                for (i, slot) in slots.iter().enumerate() {
                    words[*slot] = LittleEndian::read_u64(&padded[i * 8..i * 8 + 8]);
                }
            }
            None => {
                for (i, dva) in self.dva.iter().enumerate() {
                    let (w0, w1) = dva.encode();
                    words[i * 2] = w0;
                    words[i * 2 + 1] = w1;
                }
                let prop = (1u64 << 63)
                    | (self.dedup as u64) << 62
                    | (self.crypt.is_some() as u64) << 61
                    | (u64::from(self.level) & 0x1f) << 56
                    | u64::from(self.obj_type as u8) << 48
                    | u64::from(self.checksum as u8) << 40
                    | (u64::from(self.compress as u8) & 0x7f) << 32
                    | u64::from(sectors_m1(self.psize)) << 16
                    | u64::from(sectors_m1(self.lsize));
                words[6] = prop;
                words[9] = self.phys_birth;
                words[10] = self.birth;
                match &self.crypt {
                    Some(c) => {
                        words[4] = c.salt;
                        words[5] = c.iv1;
                        words[11] = (u64::from(c.iv2) << 32) | (self.fill & 0xffff_ffff);
                        words[12] = self.cksum.0[0];
                        words[13] = self.cksum.0[1];
                        words[14] = LittleEndian::read_u64(&c.mac[0..8]);
                        words[15] = LittleEndian::read_u64(&c.mac[8..16]);
                    }
                    None => {
                        words[11] = self.fill;
                        for i in 0..4 {
                            words[12 + i] = self.cksum.0[i];
                        }
                    }
                }
            }
        }
        for (i, w) in words.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..i * 8 + 8], *w);
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        debug_assert!(buf.len() >= BP_SIZE);
        // A never-written pointer slot is all zeros: a hole.
        if buf[..BP_SIZE].iter().all(|b| *b == 0) {
            return Ok(BlockPtr::default());
        }
        let mut words = [0u64; 16];
        for (i, w) in words.iter_mut().enumerate() {
            *w = LittleEndian::read_u64(&buf[i * 8..i * 8 + 8]);
        }
        // The byteorder bit is always written as 1; reading it as 0 means
        // the writer had the opposite order.
        let byteorder_le = words[6] >> 63 != 0;
        if !byteorder_le {
            for (i, w) in words.iter_mut().enumerate() {
                *w = BigEndian::read_u64(&buf[i * 8..i * 8 + 8]);
            }
            if words[6] >> 63 == 0 {
                return Err(Error::Label("unreadable block pointer byte order"));
            }
        }
        let prop = words[6];
        let embedded = (prop >> 39) & 1 != 0;
        let level = ((prop >> 56) & 0x1f) as u8;
        let obj_type = ObjType::from_u8(((prop >> 48) & 0xff) as u8)?;
        let compress = CompressId::from_u8(((prop >> 32) & 0x7f) as u8)?;

        if embedded {
            let etype = match (prop >> 40) & 0xff {
                0 => EmbeddedType::Data,
                2 => EmbeddedType::Redacted,
                other => return Err(Error::Config(format!("bad embedded type {}", other))),
            };
            let psize = ((prop >> 25) & 0x7f) as usize;
            let lsize = (prop & 0x1ff_ffff) as u32;
            let slots: [usize; 14] = [0, 1, 2, 3, 4, 5, 7, 8, 9, 11, 12, 13, 14, 15];
            let mut padded = [0u8; BP_EMBEDDED_PAYLOAD];
            for (i, slot) in slots.iter().enumerate() {
                LittleEndian::write_u64(&mut padded[i * 8..i * 8 + 8], words[*slot]);
            }
            return Ok(BlockPtr {
                byteorder_le,
                level,
                obj_type,
                compress,
                checksum: ChecksumId::Off,
                psize: psize as u32,
                lsize,
                birth: words[10],
                fill: 1,
                embedded: Some((etype, padded[..psize].to_vec())),
                ..Default::default()
            });
        }

        let dedup = (prop >> 62) & 1 != 0;
        let encrypted = (prop >> 61) & 1 != 0;
        let checksum = ChecksumId::from_u8(((prop >> 40) & 0xff) as u8)?;
        let psize = bytes_from_sectors_m1((prop >> 16) as u16);
        let lsize = bytes_from_sectors_m1(prop as u16);

        let mut dva = [Dva::default(); DVAS_PER_BP];
        let ndva = if encrypted { 2 } else { 3 };
        for (i, d) in dva.iter_mut().enumerate().take(ndva) {
            *d = Dva::decode(words[i * 2], words[i * 2 + 1]);
        }

        let (fill, cksum, crypt) = if encrypted {
            let mut mac = [0u8; 16];
            LittleEndian::write_u64(&mut mac[0..8], words[14]);
            LittleEndian::write_u64(&mut mac[8..16], words[15]);
            (
                words[11] & 0xffff_ffff,
                Cksum([words[12], words[13], 0, 0]),
                Some(BpCrypt {
                    salt: words[4],
                    iv1: words[5],
                    iv2: (words[11] >> 32) as u32,
                    mac,
                }),
            )
        } else {
            (
                words[11],
                Cksum([words[12], words[13], words[14], words[15]]),
                None,
            )
        };

        Ok(BlockPtr {
            dva,
            byteorder_le,
            dedup,
            level,
            obj_type,
            checksum,
            compress,
            psize,
            lsize,
            phys_birth: words[9],
            birth: words[10],
            fill,
            cksum,
            crypt,
            embedded: None,
        })
    }
}

fn sectors_m1(bytes: u32) -> u16 {
    if bytes == 0 {
        0
    } else {
        ((u64::from(bytes) / SECTOR) - 1) as u16
    }
}

fn bytes_from_sectors_m1(v: u16) -> u32 {
    ((u64::from(v) + 1) * SECTOR) as u32
}

impl std::fmt::Display for BlockPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_hole() {
            return write!(f, "<hole L{} lsize={:#x}>", self.level, self.lsize);
        }
        if let Some((etype, payload)) = &self.embedded {
            return write!(
                f,
                "<embedded {:?} {}B lsize={:#x} birth={}>",
                etype,
                payload.len(),
                self.lsize,
                self.birth
            );
        }
        write!(
            f,
            "{} L{} {:?} birth={} lsize={:#x} psize={:#x}",
            self.dva[0], self.level, self.obj_type, self.birth, self.lsize, self.psize
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bp() -> BlockPtr {
        BlockPtr {
            dva: [
                Dva { vdev: 1, grid: 0, asize: 0x4000, offset: 0x1_2000, gang: false },
                Dva { vdev: 2, grid: 0, asize: 0x4000, offset: 0x8_0000, gang: false },
                Dva::default(),
            ],
            byteorder_le: true,
            dedup: true,
            level: 2,
            obj_type: ObjType::Data,
            checksum: ChecksumId::Sha256,
            compress: CompressId::Lzjb,
            psize: 0x2000,
            lsize: 0x4000,
            phys_birth: 0,
            birth: 77,
            fill: 1,
            cksum: Cksum([1, 2, 3, 4]),
            crypt: None,
            embedded: None,
        }
    }

    #[test]
    fn roundtrip_plain() {
        let bp = sample_bp();
        let mut buf = [0u8; BP_SIZE];
        bp.encode(&mut buf);
        let back = BlockPtr::decode(&buf).unwrap();
        assert_eq!(back, bp);
        assert_eq!(back.ndvas(), 2);
        assert_eq!(back.physical_birth(), 77);
    }

    #[test]
    fn roundtrip_encrypted() {
        let mut bp = sample_bp();
        bp.dedup = false;
        bp.dva[1] = Dva::default();
        bp.cksum = Cksum([10, 11, 0, 0]);
        bp.crypt = Some(BpCrypt {
            salt: 0x5a17,
            iv1: 0x1111_2222_3333_4444,
            iv2: 0x5566_7788,
            mac: *b"0123456789abcdef",
        });
        let mut buf = [0u8; BP_SIZE];
        bp.encode(&mut buf);
        let back = BlockPtr::decode(&buf).unwrap();
        assert_eq!(back, bp);
        assert!(back.is_encrypted());
        // Encrypted pointers have at most two copies.
        assert!(back.dva[2].is_empty());
    }

    #[test]
    fn roundtrip_embedded() {
        let payload: Vec<u8> = (0..100u8).collect();
        let bp = BlockPtr {
            obj_type: ObjType::Data,
            compress: CompressId::Off,
            lsize: 100,
            psize: 100,
            birth: 12,
            fill: 1,
            embedded: Some((EmbeddedType::Data, payload.clone())),
            ..Default::default()
        };
        let mut buf = [0u8; BP_SIZE];
        bp.encode(&mut buf);
        let back = BlockPtr::decode(&buf).unwrap();
        assert!(back.is_embedded());
        assert_eq!(back.embedded.as_ref().unwrap().1, payload);
        assert_eq!(back.birth, 12);
        assert_eq!(back.physical_birth(), 0);
    }

    #[test]
    fn hole_properties() {
        let hole = BlockPtr::new_hole(0x4000);
        assert!(hole.is_hole());
        assert_eq!(hole.ndvas(), 0);
        let mut buf = [0u8; BP_SIZE];
        hole.encode(&mut buf);
        let back = BlockPtr::decode(&buf).unwrap();
        assert!(back.is_hole());
        assert_eq!(back.lsize, 0x4000);
    }

    #[test]
    fn foreign_byteorder_decodes() {
        let bp = sample_bp();
        let mut buf = [0u8; BP_SIZE];
        bp.encode(&mut buf);
        // Simulate a big-endian writer by swapping every word.
        for w in buf.chunks_exact_mut(8) {
            w.reverse();
        }
        let back = BlockPtr::decode(&buf).unwrap();
        assert!(!back.byteorder_le);
        assert_eq!(back.dva[0], bp.dva[0]);
        assert_eq!(back.lsize, bp.lsize);
        assert_eq!(back.cksum, bp.cksum);
    }

    #[test]
    fn sector_granularity() {
        let mut bp = sample_bp();
        bp.lsize = 512;
        bp.psize = 512;
        let mut buf = [0u8; BP_SIZE];
        bp.encode(&mut buf);
        let back = BlockPtr::decode(&buf).unwrap();
        assert_eq!(back.lsize, 512);
        assert_eq!(back.psize, 512);
    }
}
