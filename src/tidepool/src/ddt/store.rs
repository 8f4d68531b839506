// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Durable form of the dedup table.
//!
//! Each class map and each log bank is one meta-objset object holding a
//! count followed by records. A record is the 42-byte key, then a
//! version byte (bit 7 = host byte order when written, bits 0..6 = the
//! compression function applied to the phys: zero-length encoding, or
//! off when it did not shrink), a 2-byte compressed length, and the
//! compressed 72-byte phys. A reader on the opposite byte order
//! byteswaps the phys words after decompressing.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::info;
use tp_checksum::Cksum;
use tp_compress::{zle_compress, zle_decompress, CompressId};

use crate::blkptr::Dva;
use crate::ddt::{Ddt, DdtClass, DdtKey, DdtPhys};
use crate::dmu::{self, Objset};
use crate::error::{Error, Result};
use crate::spa::PoolCore;

pub const DDT_LOG_OBJECTS: usize = 2;

const KEY_BYTES: usize = 42;
const PHYS_BYTES: usize = 72;
const VERSION_BYTEORDER: u8 = 0x80;
const VERSION_FUNC_MASK: u8 = 0x7f;

/// The meta-objset objects backing one dedup table.
#[derive(Debug, Clone, Copy)]
pub struct DdtStoreSet {
    pub dup_obj: u64,
    pub unique_obj: u64,
    pub log_objs: [u64; DDT_LOG_OBJECTS],
}

fn encode_key(key: &DdtKey, buf: &mut [u8]) {
    key.cksum.encode(&mut buf[0..32]);
    LittleEndian::write_u32(&mut buf[32..36], key.lsize);
    LittleEndian::write_u32(&mut buf[36..40], key.psize);
    buf[40] = key.compress;
    buf[41] = key.crypt as u8;
}

fn decode_key(buf: &[u8]) -> DdtKey {
    DdtKey {
        cksum: Cksum::decode(&buf[0..32]),
        lsize: LittleEndian::read_u32(&buf[32..36]),
        psize: LittleEndian::read_u32(&buf[36..40]),
        compress: buf[40],
        crypt: buf[41] != 0,
    }
}

fn encode_phys(phys: &DdtPhys) -> [u8; PHYS_BYTES] {
    let mut buf = [0u8; PHYS_BYTES];
    for (i, dva) in phys.dvas.iter().enumerate() {
        let base = i * 16;
        LittleEndian::write_u32(&mut buf[base..base + 4], dva.vdev);
        buf[base + 4] = dva.grid;
        buf[base + 5] = dva.gang as u8;
        // asize fits 24 bits of sectors; stored as bytes/512 here.
        LittleEndian::write_u16(&mut buf[base + 6..base + 8], (dva.asize / 512) as u16);
        LittleEndian::write_u64(&mut buf[base + 8..base + 16], dva.offset);
    }
    LittleEndian::write_u64(&mut buf[48..56], phys.refcount);
    LittleEndian::write_u64(&mut buf[56..64], phys.birth);
    LittleEndian::write_u64(&mut buf[64..72], phys.class_start);
    buf
}

fn decode_phys(buf: &[u8]) -> DdtPhys {
    let mut dvas = [Dva::default(); 3];
    for (i, dva) in dvas.iter_mut().enumerate() {
        let base = i * 16;
        *dva = Dva {
            vdev: LittleEndian::read_u32(&buf[base..base + 4]),
            grid: buf[base + 4],
            gang: buf[base + 5] != 0,
            asize: u64::from(LittleEndian::read_u16(&buf[base + 6..base + 8])) * 512,
            offset: LittleEndian::read_u64(&buf[base + 8..base + 16]),
        };
    }
    DdtPhys {
        dvas,
        refcount: LittleEndian::read_u64(&buf[48..56]),
        birth: LittleEndian::read_u64(&buf[56..64]),
        class_start: LittleEndian::read_u64(&buf[64..72]),
    }
}

fn byteswap_phys(buf: &mut [u8]) {
    for word in buf.chunks_exact_mut(8) {
        word.reverse();
    }
}

/// Serialize a table image: count, then framed records.
pub fn encode_entries(entries: &[(DdtKey, DdtPhys)]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + entries.len() * (KEY_BYTES + 3 + PHYS_BYTES));
    let mut hdr = [0u8; 8];
    LittleEndian::write_u64(&mut hdr, entries.len() as u64);
    out.extend_from_slice(&hdr);
    for (key, phys) in entries {
        let mut kb = [0u8; KEY_BYTES];
        encode_key(key, &mut kb);
        out.extend_from_slice(&kb);
        let raw = encode_phys(phys);
        let (version, payload) = match zle_compress(&raw, PHYS_BYTES - 1) {
            Some(c) => (VERSION_BYTEORDER | CompressId::Zle as u8, c),
            None => (VERSION_BYTEORDER, raw.to_vec()),
        };
        out.push(version);
        let mut len = [0u8; 2];
        LittleEndian::write_u16(&mut len, payload.len() as u16);
        out.extend_from_slice(&len);
        out.extend_from_slice(&payload);
    }
    out
}

pub fn decode_entries(buf: &[u8]) -> Result<Vec<(DdtKey, DdtPhys)>> {
    if buf.len() < 8 {
        return Ok(Vec::new());
    }
    let count = LittleEndian::read_u64(&buf[0..8]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut off = 8usize;
    for _ in 0..count {
        if off + KEY_BYTES + 3 > buf.len() {
            return Err(Error::Label("truncated dedup record"));
        }
        let key = decode_key(&buf[off..off + KEY_BYTES]);
        off += KEY_BYTES;
        let version = buf[off];
        let clen = LittleEndian::read_u16(&buf[off + 1..off + 3]) as usize;
        off += 3;
        if off + clen > buf.len() {
            return Err(Error::Label("truncated dedup payload"));
        }
        let func = version & VERSION_FUNC_MASK;
        let mut raw = if func == CompressId::Zle as u8 {
            zle_decompress(&buf[off..off + clen], PHYS_BYTES)?
        } else {
            buf[off..off + clen].to_vec()
        };
        off += clen;
        // Written on the opposite byte order: swab the phys words.
        if version & VERSION_BYTEORDER == 0 {
            byteswap_phys(&mut raw);
        }
        entries.push((key, decode_phys(&raw)));
    }
    Ok(entries)
}

impl DdtStoreSet {
    /// Persist the class maps and both log banks.
    pub fn persist(
        &self,
        pool: &Arc<PoolCore>,
        mos: &Arc<Objset>,
        ddt: &Ddt,
        txg: u64,
    ) -> Result<()> {
        let dup = ddt.class_snapshot(DdtClass::Duplicate);
        let unique = ddt.class_snapshot(DdtClass::Unique);
        let (active, flushing) = ddt.log_snapshots();
        dmu::dmu_rewrite_sync(pool, mos, txg, self.dup_obj, &encode_entries(&dup))?;
        dmu::dmu_rewrite_sync(pool, mos, txg, self.unique_obj, &encode_entries(&unique))?;
        dmu::dmu_rewrite_sync(pool, mos, txg, self.log_objs[0], &encode_entries(&active))?;
        dmu::dmu_rewrite_sync(pool, mos, txg, self.log_objs[1], &encode_entries(&flushing))?;
        Ok(())
    }

    /// Rehydrate the table at import.
    pub fn load(&self, pool: &Arc<PoolCore>, mos: &Arc<Objset>, ddt: &Ddt) -> Result<()> {
        let mut loaded = 0usize;
        for (class, obj) in &[
            (DdtClass::Duplicate, self.dup_obj),
            (DdtClass::Unique, self.unique_obj),
        ] {
            let bytes = dmu::dmu_read_all(pool, mos, *obj)?;
            let entries = decode_entries(&bytes)?;
            loaded += entries.len();
            ddt.load_class(*class, entries);
        }
        let active = decode_entries(&dmu::dmu_read_all(pool, mos, self.log_objs[0])?)?;
        let flushing = decode_entries(&dmu::dmu_read_all(pool, mos, self.log_objs[1])?)?;
        loaded += active.len() + flushing.len();
        ddt.load_logs(active, flushing);
        info!("ddt: loaded {} entries", loaded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<(DdtKey, DdtPhys)> {
        (0..5u64)
            .map(|i| {
                (
                    DdtKey {
                        cksum: Cksum([i, i + 1, 0, 0]),
                        lsize: 0x20000,
                        psize: 0x10000,
                        compress: 3,
                        crypt: i % 2 == 0,
                    },
                    DdtPhys {
                        dvas: [
                            Dva {
                                vdev: 1,
                                grid: 0,
                                asize: 0x10000,
                                offset: i * 0x10000,
                                gang: false,
                            },
                            Dva::default(),
                            Dva::default(),
                        ],
                        refcount: i + 1,
                        birth: 100 + i,
                        class_start: 7,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn entries_roundtrip() {
        let entries = sample();
        let bytes = encode_entries(&entries);
        let back = decode_entries(&bytes).unwrap();
        assert_eq!(back.len(), entries.len());
        for ((k1, p1), (k2, p2)) in entries.iter().zip(back.iter()) {
            assert_eq!(k1, k2);
            assert_eq!(p1, p2);
        }
    }

    #[test]
    fn version_byte_carries_compression_and_order() {
        let entries = sample();
        let bytes = encode_entries(&entries);
        // First record's version byte: host order bit must be set, and
        // a mostly-zero phys should take the zle path.
        let version = bytes[8 + KEY_BYTES];
        assert_eq!(version & VERSION_BYTEORDER, VERSION_BYTEORDER);
        assert_eq!(version & VERSION_FUNC_MASK, CompressId::Zle as u8);
    }

    #[test]
    fn foreign_byteorder_phys_is_swabbed() {
        let entries = vec![sample().remove(0)];
        let mut bytes = encode_entries(&entries);
        // Rewrite the record as if a big-endian host produced it: clear
        // the order bit and byteswap the stored (uncompressed) phys.
        let voff = 8 + KEY_BYTES;
        let func = bytes[voff] & VERSION_FUNC_MASK;
        if func == CompressId::Zle as u8 {
            // Decompress, swab, store uncompressed for the test.
            let clen = LittleEndian::read_u16(&bytes[voff + 1..voff + 3]) as usize;
            let mut raw = zle_decompress(&bytes[voff + 3..voff + 3 + clen], PHYS_BYTES).unwrap();
            byteswap_phys(&mut raw);
            let mut rebuilt = bytes[..voff].to_vec();
            rebuilt.push(0); // foreign order, no compression
            let mut len = [0u8; 2];
            LittleEndian::write_u16(&mut len, raw.len() as u16);
            rebuilt.extend_from_slice(&len);
            rebuilt.extend_from_slice(&raw);
            bytes = rebuilt;
        }
        let back = decode_entries(&bytes).unwrap();
        assert_eq!(back[0].1, entries[0].1);
    }

    #[test]
    fn truncated_input_rejected() {
        let entries = sample();
        let bytes = encode_entries(&entries);
        assert!(decode_entries(&bytes[..bytes.len() - 4]).is_err());
    }
}
