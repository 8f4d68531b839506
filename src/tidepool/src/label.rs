// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Vdev labels and uberblocks.
//!
//! Every leaf device carries four 256 KiB labels: two at the front, two
//! at the back, so that a wipe of either end of the device leaves a
//! readable pair. A label is:
//!
//! ```text
//!   0 KiB   8 KiB padding           (pad1)
//!   8 KiB  16 KiB boot block + pad  (pad2)
//!  24 KiB 104 KiB config region     (nvlist: length-prefixed JSON + trailer)
//! 128 KiB 128 KiB uberblock ring    (128 slots of 1 KiB)
//! ```
//!
//! Each uberblock slot and the config region carry an embedded checksum
//! whose verifier is the section's device offset, so a block copied to
//! the wrong place never verifies. The newest uberblock wins by
//! (txg, timestamp); commits write one slot per txg round-robin and the
//! previous slot stays intact, which is what makes the commit atomic.
//!
//! This module is pure layout and codec; the leaf vdev does the actual
//! device I/O (and consults fault injection while doing it).

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use tp_checksum::{embedded_generate, embedded_verify, ChecksumId, Cksum, ECK_SIZE};

use crate::blkptr::{BlockPtr, BP_SIZE};
use crate::error::{Error, Result};

pub const LABEL_SIZE: u64 = 256 * 1024;
pub const LABELS_PER_DEV: usize = 4;
/// Front labels together; DVA offset 0 starts right after.
pub const LABEL_START_SIZE: u64 = 2 * LABEL_SIZE;
/// Back labels together.
pub const LABEL_END_SIZE: u64 = 2 * LABEL_SIZE;

pub const PAD1_OFF: u64 = 0;
pub const PAD1_SIZE: u64 = 8 * 1024;
pub const PAD2_OFF: u64 = 8 * 1024;
pub const PAD2_SIZE: u64 = 16 * 1024;
pub const NVLIST_OFF: u64 = 24 * 1024;
pub const NVLIST_SIZE: u64 = 104 * 1024;
pub const UBER_RING_OFF: u64 = 128 * 1024;
pub const UBER_RING_SIZE: u64 = 128 * 1024;
pub const UBER_SLOT_SIZE: u64 = 1024;
pub const UBER_SLOTS: u64 = UBER_RING_SIZE / UBER_SLOT_SIZE;

pub const UBERBLOCK_MAGIC: u64 = 0x0075_6265_7270_6f6f; // "uberpoo\0"-ish
pub const POOL_VERSION: u64 = 1;

/// Label sections addressable by the fault-injection surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelSection {
    Pad1,
    Pad2,
    Nvlist,
    Uberblock,
}

impl LabelSection {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "label_pad1" => LabelSection::Pad1,
            "label_pad2" => LabelSection::Pad2,
            "label_nvlist" => LabelSection::Nvlist,
            "label_uberblock" => LabelSection::Uberblock,
            _ => return None,
        })
    }

    pub fn range(self) -> (u64, u64) {
        match self {
            LabelSection::Pad1 => (PAD1_OFF, PAD1_SIZE),
            LabelSection::Pad2 => (PAD2_OFF, PAD2_SIZE),
            LabelSection::Nvlist => (NVLIST_OFF, NVLIST_SIZE),
            LabelSection::Uberblock => (UBER_RING_OFF, UBER_RING_SIZE),
        }
    }
}

/// Device offsets of the four labels.
pub fn label_offsets(dev_size: u64) -> [u64; LABELS_PER_DEV] {
    [
        0,
        LABEL_SIZE,
        dev_size - 2 * LABEL_SIZE,
        dev_size - LABEL_SIZE,
    ]
}

/// The root of everything: written last in each transaction group.
#[derive(Debug, Clone, PartialEq)]
pub struct Uberblock {
    pub magic: u64,
    pub version: u64,
    pub txg: u64,
    pub guid_sum: u64,
    pub timestamp: u64,
    pub rootbp: BlockPtr,
    /// Multihost heartbeat fields.
    pub mmp_seq: u64,
    pub mmp_delay_ns: u64,
}

impl Uberblock {
    pub fn encode(&self, buf: &mut [u8], slot_offset: u64) -> Result<()> {
        debug_assert!(buf.len() >= UBER_SLOT_SIZE as usize);
        for b in buf.iter_mut() {
            *b = 0;
        }
        LittleEndian::write_u64(&mut buf[0..8], self.magic);
        LittleEndian::write_u64(&mut buf[8..16], self.version);
        LittleEndian::write_u64(&mut buf[16..24], self.txg);
        LittleEndian::write_u64(&mut buf[24..32], self.guid_sum);
        LittleEndian::write_u64(&mut buf[32..40], self.timestamp);
        self.rootbp.encode(&mut buf[40..40 + BP_SIZE]);
        LittleEndian::write_u64(&mut buf[168..176], self.mmp_seq);
        LittleEndian::write_u64(&mut buf[176..184], self.mmp_delay_ns);
        let eck_off = UBER_SLOT_SIZE as usize - ECK_SIZE;
        embedded_generate(
            ChecksumId::Label,
            &mut buf[..UBER_SLOT_SIZE as usize],
            eck_off,
            Cksum([slot_offset, 0, 0, 0]),
        )?;
        Ok(())
    }

    pub fn decode(buf: &mut [u8], slot_offset: u64) -> Result<Self> {
        debug_assert!(buf.len() >= UBER_SLOT_SIZE as usize);
        if LittleEndian::read_u64(&buf[0..8]) != UBERBLOCK_MAGIC {
            return Err(Error::Label("bad uberblock magic"));
        }
        let eck_off = UBER_SLOT_SIZE as usize - ECK_SIZE;
        embedded_verify(
            ChecksumId::Label,
            &mut buf[..UBER_SLOT_SIZE as usize],
            eck_off,
            Cksum([slot_offset, 0, 0, 0]),
        )
        .map_err(|_| Error::Label("uberblock checksum"))?;
        Ok(Uberblock {
            magic: UBERBLOCK_MAGIC,
            version: LittleEndian::read_u64(&buf[8..16]),
            txg: LittleEndian::read_u64(&buf[16..24]),
            guid_sum: LittleEndian::read_u64(&buf[24..32]),
            timestamp: LittleEndian::read_u64(&buf[32..40]),
            rootbp: BlockPtr::decode(&buf[40..40 + BP_SIZE])?,
            mmp_seq: LittleEndian::read_u64(&buf[168..176]),
            mmp_delay_ns: LittleEndian::read_u64(&buf[176..184]),
        })
    }

    /// Ring slot for this txg.
    pub fn slot(txg: u64) -> u64 {
        txg % UBER_SLOTS
    }

    /// Ordering for newest-wins scans.
    pub fn is_newer_than(&self, other: &Uberblock) -> bool {
        (self.txg, self.timestamp) > (other.txg, other.timestamp)
    }
}

/// The per-leaf slice of pool configuration stored in every label.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LabelConfig {
    pub pool_name: String,
    pub pool_guid: u64,
    pub version: u64,
    /// This leaf's guid.
    pub leaf_guid: u64,
    /// Top-level vdev index this leaf belongs to.
    pub top_id: u32,
    pub ashift: u32,
    /// The whole vdev tree, so any one surviving label can rebuild it.
    pub vdev_tree: Vec<crate::vdev::VdevSpec>,
    /// Multihost enable.
    pub multihost: bool,
}

/// Frame the config region: length-prefixed JSON with an embedded
/// trailer at the region end.
pub fn encode_config_region(config: &LabelConfig, label_offset: u64) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(config).map_err(|e| Error::Config(e.to_string()))?;
    if json.len() as u64 > NVLIST_SIZE - 8 - ECK_SIZE as u64 {
        return Err(Error::Label("config too large for label"));
    }
    let mut region = vec![0u8; NVLIST_SIZE as usize];
    LittleEndian::write_u32(&mut region[0..4], json.len() as u32);
    region[8..8 + json.len()].copy_from_slice(&json);
    let eck_off = NVLIST_SIZE as usize - ECK_SIZE;
    embedded_generate(
        ChecksumId::Label,
        &mut region,
        eck_off,
        Cksum([label_offset + NVLIST_OFF, 0, 0, 0]),
    )?;
    Ok(region)
}

pub fn decode_config_region(region: &mut [u8], label_offset: u64) -> Result<LabelConfig> {
    debug_assert_eq!(region.len(), NVLIST_SIZE as usize);
    let eck_off = NVLIST_SIZE as usize - ECK_SIZE;
    embedded_verify(
        ChecksumId::Label,
        region,
        eck_off,
        Cksum([label_offset + NVLIST_OFF, 0, 0, 0]),
    )
    .map_err(|_| Error::Label("config region checksum"))?;
    let len = LittleEndian::read_u32(&region[0..4]) as usize;
    if len > NVLIST_SIZE as usize - 8 - ECK_SIZE {
        return Err(Error::Label("config region length"));
    }
    serde_json::from_slice(&region[8..8 + len]).map_err(|e| Error::Config(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vdev::VdevSpec;

    fn sample_uber(txg: u64) -> Uberblock {
        Uberblock {
            magic: UBERBLOCK_MAGIC,
            version: POOL_VERSION,
            txg,
            guid_sum: 0x1234,
            timestamp: 99,
            rootbp: BlockPtr::new_hole(1024),
            mmp_seq: 0,
            mmp_delay_ns: 0,
        }
    }

    #[test]
    fn uberblock_roundtrip() {
        let ub = sample_uber(42);
        let mut buf = vec![0u8; UBER_SLOT_SIZE as usize];
        ub.encode(&mut buf, 0x2_0000).unwrap();
        let back = Uberblock::decode(&mut buf, 0x2_0000).unwrap();
        assert_eq!(back, ub);
    }

    #[test]
    fn uberblock_wrong_slot_rejected() {
        let ub = sample_uber(42);
        let mut buf = vec![0u8; UBER_SLOT_SIZE as usize];
        ub.encode(&mut buf, 0x2_0000).unwrap();
        assert!(Uberblock::decode(&mut buf, 0x2_0400).is_err());
    }

    #[test]
    fn newest_wins_ordering() {
        let a = sample_uber(10);
        let mut b = sample_uber(10);
        b.timestamp = 100;
        assert!(b.is_newer_than(&a));
        let c = sample_uber(11);
        assert!(c.is_newer_than(&b));
    }

    #[test]
    fn config_region_roundtrip() {
        let cfg = LabelConfig {
            pool_name: "t".into(),
            pool_guid: 7,
            version: POOL_VERSION,
            leaf_guid: 8,
            top_id: 0,
            ashift: 12,
            vdev_tree: vec![VdevSpec::File {
                path: "/dev/null".into(),
            }],
            multihost: false,
        };
        let mut region = encode_config_region(&cfg, LABEL_SIZE).unwrap();
        let back = decode_config_region(&mut region, LABEL_SIZE).unwrap();
        assert_eq!(back, cfg);
        // Same region at a different label offset must not verify.
        assert!(decode_config_region(&mut region, 0).is_err());
    }

    #[test]
    fn label_offsets_front_and_back() {
        let offs = label_offsets(64 * 1024 * 1024);
        assert_eq!(offs[0], 0);
        assert_eq!(offs[1], LABEL_SIZE);
        assert_eq!(offs[2], 64 * 1024 * 1024 - 2 * LABEL_SIZE);
        assert_eq!(offs[3], 64 * 1024 * 1024 - LABEL_SIZE);
    }

    #[test]
    fn section_names() {
        assert_eq!(
            LabelSection::from_name("label_uberblock"),
            Some(LabelSection::Uberblock)
        );
        assert_eq!(LabelSection::from_name("label_bogus"), None);
        let (off, size) = LabelSection::Nvlist.range();
        assert_eq!((off, size), (NVLIST_OFF, NVLIST_SIZE));
    }
}
