// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Second-level cache devices.
//!
//! An L2 device is a log-structured spillover: a feed pass scans the
//! cold end of the primary cache and writes eligible buffers at a
//! rolling hand, bounded per pass by `write_max` (+ `write_boost` until
//! the device first wraps). Entries live in an in-memory hash; a chained
//! log of entry records is persisted behind a small device header so the
//! hash can be rebuilt at import. Payloads carry their own fletcher
//! checksum: a failed L2 read is never an error, it just falls back to
//! the main pool and counts.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use serde::Serialize;
use tp_checksum::{compute, embedded_generate, embedded_verify, ChecksumId, Cksum, ECK_SIZE};
use tp_compress::CompressId;
use tp_utils::metric::{IncMetric, Metric};

use crate::arc::ArcKey;
use crate::config::Tunables;
use crate::error::{Error, Result};
use crate::vdev::file::FileLeaf;

const L2_HDR_SIZE: u64 = 4096;
const L2_MAGIC: u64 = 0x006c_3261_7263_6c6f; // "l2arclo"
const L2_LOG_MAGIC: u64 = 0x006c_3261_7263_6c67;
/// Fixed size of one persisted log block.
const L2_LOG_SIZE: usize = 16 * 1024;
const L2_ENTRY_SIZE: usize = 48;

#[derive(Debug, Clone, Copy)]
pub struct L2Entry {
    pub daddr: u64,
    pub psize: u32,
    pub lsize: u32,
    pub compressed: bool,
    pub comp: CompressId,
    pub cksum: u64,
}

#[derive(Default, Serialize)]
pub struct L2Stats {
    pub hits: IncMetric,
    pub misses: IncMetric,
    pub cksum_bad: IncMetric,
    pub writes: IncMetric,
    pub write_bytes: IncMetric,
    pub rebuilt_entries: IncMetric,
    pub evicted_on_wrap: IncMetric,
}

pub struct L2Device {
    leaf: FileLeaf,
    size: u64,
    hand: AtomicU64,
    last_log: AtomicU64,
    /// Set once the hand first wraps; disables the write boost.
    wrapped: AtomicU64,
    entries: Mutex<HashMap<ArcKey, L2Entry>>,
    pub stats: L2Stats,
}

impl L2Device {
    pub fn open(path: &Path, tunables: &Tunables) -> Result<Self> {
        let leaf = FileLeaf::new(path, tunables);
        let (_usable, dev_size) = leaf.open().map_err(Error::Device)?;
        Ok(L2Device {
            leaf,
            size: dev_size,
            hand: AtomicU64::new(L2_HDR_SIZE),
            last_log: AtomicU64::new(0),
            wrapped: AtomicU64::new(0),
            entries: Mutex::new(HashMap::new()),
            stats: L2Stats::default(),
        })
    }

    pub fn contains(&self, key: &ArcKey) -> bool {
        self.entries.lock().unwrap().contains_key(key)
    }

    /// Snapshot of `(key, lsize)` for every tracked entry; the cache
    /// seeds l2-only headers from this after a rebuild.
    pub fn entries_snapshot(&self) -> Vec<(ArcKey, u32)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(k, e)| (*k, e.lsize))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Bytes one feed pass may write.
    fn pass_budget(&self, tunables: &Tunables) -> u64 {
        let mut budget = tunables.zfs_l2arc_write_max;
        if self.wrapped.load(Ordering::Relaxed) == 0 {
            budget += tunables.zfs_l2arc_write_boost;
        }
        budget
    }

    /// Write a batch of buffers and persist a log block describing them.
    /// `batch` entries are `(key, stored bytes, compressed, comp, lsize)`.
    pub fn feed(
        &self,
        tunables: &Tunables,
        batch: &[(ArcKey, Vec<u8>, bool, CompressId, u32)],
    ) -> Result<usize> {
        let budget = self.pass_budget(tunables);
        let mut spent = 0u64;
        let mut written = Vec::new();

        for (key, data, compressed, comp, lsize) in batch {
            if self.contains(key) {
                continue;
            }
            let psize = data.len() as u64;
            if spent + psize + L2_LOG_SIZE as u64 > budget {
                break;
            }
            let daddr = self.reserve(psize + L2_LOG_SIZE as u64)?;
            self.leaf.raw_write(daddr, data).map_err(Error::Device)?;
            let cksum = compute(ChecksumId::Fletcher4, data, false)?.0[0];
            let entry = L2Entry {
                daddr,
                psize: psize as u32,
                lsize: *lsize,
                compressed: *compressed,
                comp: *comp,
                cksum,
            };
            self.entries.lock().unwrap().insert(*key, entry);
            written.push((*key, entry));
            spent += psize;
            self.stats.writes.inc();
            self.stats.write_bytes.add(psize);
        }

        if !written.is_empty() {
            self.append_log(&written)?;
            self.write_header()?;
            self.leaf.flush().map_err(Error::Device)?;
        }
        Ok(written.len())
    }

    /// Allocate space at the hand, wrapping when the end is reached and
    /// invalidating entries the new window overwrites.
    fn reserve(&self, need: u64) -> Result<u64> {
        let mut hand = self.hand.load(Ordering::Acquire);
        if hand + need > self.size {
            self.wrapped.store(1, Ordering::Relaxed);
            hand = L2_HDR_SIZE;
            let mut entries = self.entries.lock().unwrap();
            let before = entries.len();
            entries.retain(|_, e| e.daddr >= hand + need);
            self.stats
                .evicted_on_wrap
                .add((before - entries.len()) as u64);
        }
        if hand + need > self.size {
            return Err(Error::NoSpace);
        }
        self.hand.store(hand + need, Ordering::Release);
        Ok(hand)
    }

    fn append_log(&self, written: &[(ArcKey, L2Entry)]) -> Result<()> {
        let mut buf = vec![0u8; L2_LOG_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], L2_LOG_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.last_log.load(Ordering::Acquire));
        let count = written
            .len()
            .min((L2_LOG_SIZE - 24 - ECK_SIZE) / L2_ENTRY_SIZE);
        LittleEndian::write_u64(&mut buf[16..24], count as u64);
        for (i, (key, e)) in written.iter().take(count).enumerate() {
            let off = 24 + i * L2_ENTRY_SIZE;
            LittleEndian::write_u32(&mut buf[off..off + 4], key.vdev);
            LittleEndian::write_u32(&mut buf[off + 4..off + 8], e.psize);
            LittleEndian::write_u64(&mut buf[off + 8..off + 16], key.offset);
            LittleEndian::write_u64(&mut buf[off + 16..off + 24], key.birth);
            LittleEndian::write_u64(&mut buf[off + 24..off + 32], e.daddr);
            LittleEndian::write_u32(&mut buf[off + 32..off + 36], e.lsize);
            buf[off + 36] = e.compressed as u8;
            buf[off + 37] = e.comp as u8;
            LittleEndian::write_u64(&mut buf[off + 40..off + 48], e.cksum);
        }
        let log_off = self.reserve(L2_LOG_SIZE as u64)?;
        let eck_off = L2_LOG_SIZE - ECK_SIZE;
        embedded_generate(ChecksumId::Label, &mut buf, eck_off, Cksum([log_off, 0, 0, 0]))?;
        self.leaf.raw_write(log_off, &buf).map_err(Error::Device)?;
        self.last_log.store(log_off, Ordering::Release);
        Ok(())
    }

    fn write_header(&self) -> Result<()> {
        let mut buf = vec![0u8; L2_HDR_SIZE as usize];
        LittleEndian::write_u64(&mut buf[0..8], L2_MAGIC);
        LittleEndian::write_u64(&mut buf[8..16], self.hand.load(Ordering::Acquire));
        LittleEndian::write_u64(&mut buf[16..24], self.last_log.load(Ordering::Acquire));
        let eck_off = L2_HDR_SIZE as usize - ECK_SIZE;
        embedded_generate(ChecksumId::Label, &mut buf, eck_off, Cksum([0, 0, 0, 0]))?;
        self.leaf.raw_write(0, &buf).map_err(Error::Device)?;
        Ok(())
    }

    /// Repopulate the entry hash from the persisted log chain.
    pub fn rebuild(&self) -> Result<usize> {
        let mut hdr = match self.leaf.raw_read(0, L2_HDR_SIZE as usize) {
            Ok(b) => b,
            Err(_) => return Ok(0),
        };
        if LittleEndian::read_u64(&hdr[0..8]) != L2_MAGIC {
            return Ok(0);
        }
        if embedded_verify(
            ChecksumId::Label,
            &mut hdr,
            L2_HDR_SIZE as usize - ECK_SIZE,
            Cksum([0, 0, 0, 0]),
        )
        .is_err()
        {
            return Ok(0);
        }
        let hand = LittleEndian::read_u64(&hdr[8..16]);
        let mut log_off = LittleEndian::read_u64(&hdr[16..24]);
        self.hand.store(hand.max(L2_HDR_SIZE), Ordering::Release);
        self.last_log.store(log_off, Ordering::Release);

        let mut restored = 0usize;
        let mut entries = self.entries.lock().unwrap();
        while log_off >= L2_HDR_SIZE {
            let mut buf = match self.leaf.raw_read(log_off, L2_LOG_SIZE) {
                Ok(b) => b,
                Err(_) => break,
            };
            if LittleEndian::read_u64(&buf[0..8]) != L2_LOG_MAGIC {
                break;
            }
            if embedded_verify(
                ChecksumId::Label,
                &mut buf,
                L2_LOG_SIZE - ECK_SIZE,
                Cksum([log_off, 0, 0, 0]),
            )
            .is_err()
            {
                break;
            }
            let prev = LittleEndian::read_u64(&buf[8..16]);
            let count = LittleEndian::read_u64(&buf[16..24]) as usize;
            for i in 0..count.min((L2_LOG_SIZE - 24 - ECK_SIZE) / L2_ENTRY_SIZE) {
                let off = 24 + i * L2_ENTRY_SIZE;
                let key = ArcKey {
                    vdev: LittleEndian::read_u32(&buf[off..off + 4]),
                    offset: LittleEndian::read_u64(&buf[off + 8..off + 16]),
                    birth: LittleEndian::read_u64(&buf[off + 16..off + 24]),
                };
                let comp = CompressId::from_u8(buf[off + 37]).unwrap_or(CompressId::Off);
                let entry = L2Entry {
                    daddr: LittleEndian::read_u64(&buf[off + 24..off + 32]),
                    psize: LittleEndian::read_u32(&buf[off + 4..off + 8]),
                    lsize: LittleEndian::read_u32(&buf[off + 32..off + 36]),
                    compressed: buf[off + 36] != 0,
                    comp,
                    cksum: LittleEndian::read_u64(&buf[off + 40..off + 48]),
                };
                if entries.insert(key, entry).is_none() {
                    restored += 1;
                }
            }
            log_off = prev;
        }
        self.stats.rebuilt_entries.add(restored as u64);
        info!("l2arc: rebuilt {} entries", restored);
        Ok(restored)
    }

    /// Try to satisfy a read. Returns the stored bytes plus how to
    /// interpret them; a checksum mismatch counts and misses.
    pub fn read(&self, key: &ArcKey) -> Option<(Vec<u8>, bool, CompressId, u32)> {
        let entry = match self.entries.lock().unwrap().get(key) {
            Some(e) => *e,
            None => {
                self.stats.misses.inc();
                return None;
            }
        };
        let data = match self.leaf.raw_read(entry.daddr, entry.psize as usize) {
            Ok(d) => d,
            Err(_) => {
                self.stats.misses.inc();
                return None;
            }
        };
        let actual = compute(ChecksumId::Fletcher4, &data, false).ok()?.0[0];
        if actual != entry.cksum {
            self.stats.cksum_bad.inc();
            self.entries.lock().unwrap().remove(key);
            debug!("l2arc: checksum mismatch for {:?}, falling back", key);
            return None;
        }
        self.stats.hits.inc();
        Some((data, entry.compressed, entry.comp, entry.lsize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn l2(tunables: &Tunables) -> (tempfile::TempDir, L2Device) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachedev");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; 8 * 1024 * 1024]).unwrap();
        let dev = L2Device::open(&path, tunables).unwrap();
        (dir, dev)
    }

    fn key(i: u64) -> ArcKey {
        ArcKey {
            vdev: 0,
            offset: i * 0x2000,
            birth: 3,
        }
    }

    #[test]
    fn feed_then_read_roundtrip() {
        let t = Tunables::default();
        let (_dir, dev) = l2(&t);
        let batch = vec![(key(1), vec![0x5au8; 4096], false, CompressId::Off, 4096)];
        assert_eq!(dev.feed(&t, &batch).unwrap(), 1);
        let (data, compressed, _comp, lsize) = dev.read(&key(1)).unwrap();
        assert_eq!(data, vec![0x5au8; 4096]);
        assert!(!compressed);
        assert_eq!(lsize, 4096);
        assert_eq!(dev.stats.hits.count(), 1);
    }

    #[test]
    fn corrupt_payload_falls_back() {
        let t = Tunables::default();
        let (_dir, dev) = l2(&t);
        dev.feed(&t, &[(key(2), vec![1u8; 4096], false, CompressId::Off, 4096)])
            .unwrap();
        let daddr = dev.entries.lock().unwrap()[&key(2)].daddr;
        dev.leaf.raw_write(daddr, &[0xffu8; 16]).unwrap();
        assert!(dev.read(&key(2)).is_none());
        assert_eq!(dev.stats.cksum_bad.count(), 1);
        // The entry is dropped, so the next read is a plain miss.
        assert!(dev.read(&key(2)).is_none());
        assert_eq!(dev.stats.misses.count(), 1);
    }

    #[test]
    fn rebuild_restores_entries() {
        let t = Tunables::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cachedev");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; 8 * 1024 * 1024]).unwrap();

        {
            let dev = L2Device::open(&path, &t).unwrap();
            let batch: Vec<_> = (0..5)
                .map(|i| (key(i), vec![i as u8; 4096], false, CompressId::Off, 4096))
                .collect();
            dev.feed(&t, &batch).unwrap();
        }
        let dev = L2Device::open(&path, &t).unwrap();
        assert_eq!(dev.len(), 0);
        assert_eq!(dev.rebuild().unwrap(), 5);
        let (data, ..) = dev.read(&key(3)).unwrap();
        assert_eq!(data, vec![3u8; 4096]);
    }

    #[test]
    fn budget_bounds_one_pass() {
        let mut t = Tunables::default();
        t.zfs_l2arc_write_max = 64 * 1024;
        t.zfs_l2arc_write_boost = 0;
        let (_dir, dev) = l2(&t);
        let batch: Vec<_> = (0..32)
            .map(|i| (key(i), vec![0u8; 8192], false, CompressId::Off, 8192))
            .collect();
        let n = dev.feed(&t, &batch).unwrap();
        assert!(n < 32, "budget must cut the pass short, wrote {}", n);
        assert!(n > 0);
    }
}
