// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! The durable form of a range tree: an append-only delta log.
//!
//! Each record is two little-endian words. Word 0 carries the entry type
//! in its top bit and the offset in the low 63; word 1 is the size.
//! Replaying the log in order reconstructs the allocated set. The engine
//! owns the backing object; this module is just the codec and the replay
//! and condense logic.

use byteorder::{ByteOrder, LittleEndian};

use crate::{Error, RangeTree, Result};

const SM_RECORD_SIZE: usize = 16;
const SM_TYPE_SHIFT: u64 = 63;
const SM_OFFSET_MASK: u64 = (1 << SM_TYPE_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpaceMapEntry {
    Alloc { offset: u64, size: u64 },
    Free { offset: u64, size: u64 },
}

impl SpaceMapEntry {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SM_RECORD_SIZE);
        let (word0, size) = match *self {
            SpaceMapEntry::Alloc { offset, size } => (offset & SM_OFFSET_MASK, size),
            SpaceMapEntry::Free { offset, size } => {
                ((offset & SM_OFFSET_MASK) | (1 << SM_TYPE_SHIFT), size)
            }
        };
        LittleEndian::write_u64(&mut buf[0..8], word0);
        LittleEndian::write_u64(&mut buf[8..16], size);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SM_RECORD_SIZE {
            return Err(Error::BadRecord(0));
        }
        let word0 = LittleEndian::read_u64(&buf[0..8]);
        let size = LittleEndian::read_u64(&buf[8..16]);
        if size == 0 {
            return Err(Error::BadRecord(0));
        }
        let offset = word0 & SM_OFFSET_MASK;
        if word0 >> SM_TYPE_SHIFT == 0 {
            Ok(SpaceMapEntry::Alloc { offset, size })
        } else {
            Ok(SpaceMapEntry::Free { offset, size })
        }
    }
}

/// An in-memory space map image: the log bytes plus running totals.
/// The engine persists `data` and the totals; on load it hands the bytes
/// back and replays.
#[derive(Debug, Clone, Default)]
pub struct SpaceMap {
    data: Vec<u8>,
    /// Net allocated bytes according to the log.
    alloc: u64,
    nentries: u64,
}

impl SpaceMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// Rehydrate from persisted bytes.
    pub fn open(data: Vec<u8>, alloc: u64) -> Result<Self> {
        if data.len() % SM_RECORD_SIZE != 0 {
            return Err(Error::BadRecord(data.len()));
        }
        let nentries = (data.len() / SM_RECORD_SIZE) as u64;
        Ok(SpaceMap {
            data,
            alloc,
            nentries,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn allocated(&self) -> u64 {
        self.alloc
    }

    pub fn num_entries(&self) -> u64 {
        self.nentries
    }

    pub fn append(&mut self, entry: SpaceMapEntry) {
        let mut rec = [0u8; SM_RECORD_SIZE];
        entry.encode(&mut rec);
        self.data.extend_from_slice(&rec);
        self.nentries += 1;
        match entry {
            SpaceMapEntry::Alloc { size, .. } => self.alloc += size,
            SpaceMapEntry::Free { size, .. } => self.alloc -= size,
        }
    }

    /// Append one entry per segment of `tree` with the given polarity.
    pub fn append_tree(&mut self, tree: &RangeTree, alloc: bool) {
        for (offset, size) in tree.iter() {
            let entry = if alloc {
                SpaceMapEntry::Alloc { offset, size }
            } else {
                SpaceMapEntry::Free { offset, size }
            };
            self.append(entry);
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = Result<SpaceMapEntry>> + '_ {
        self.data
            .chunks(SM_RECORD_SIZE)
            .enumerate()
            .map(|(i, chunk)| {
                SpaceMapEntry::decode(chunk).map_err(|_| Error::BadRecord(i * SM_RECORD_SIZE))
            })
    }

    /// Replay the log into `free`, which must start as the full extent of
    /// the managed region. Allocs remove from it, frees add back.
    pub fn replay_into(&self, free: &mut RangeTree) -> Result<()> {
        for entry in self.entries() {
            match entry? {
                SpaceMapEntry::Alloc { offset, size } => free.remove(offset, size)?,
                SpaceMapEntry::Free { offset, size } => free.add(offset, size)?,
            }
        }
        Ok(())
    }

    /// Should this log be rewritten from the live tree? True once the log
    /// carries more than twice the records a fresh image would.
    pub fn should_condense(&self, live_segments: usize) -> bool {
        self.nentries > 2 * live_segments.max(1) as u64
    }

    /// Rewrite as a fresh image of `allocated`.
    pub fn condense(&mut self, allocated: &RangeTree) {
        self.data.clear();
        self.nentries = 0;
        self.alloc = 0;
        self.append_tree(allocated, true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let mut buf = [0u8; SM_RECORD_SIZE];
        let entries = [
            SpaceMapEntry::Alloc {
                offset: 0x7ff_ffff_f000,
                size: 0x2000,
            },
            SpaceMapEntry::Free {
                offset: 0,
                size: 512,
            },
        ];
        for e in entries.iter() {
            e.encode(&mut buf);
            assert_eq!(SpaceMapEntry::decode(&buf).unwrap(), *e);
        }
    }

    #[test]
    fn replay_reconstructs_free_space() {
        let mut sm = SpaceMap::new();
        sm.append(SpaceMapEntry::Alloc {
            offset: 0x1000,
            size: 0x3000,
        });
        sm.append(SpaceMapEntry::Free {
            offset: 0x2000,
            size: 0x1000,
        });
        assert_eq!(sm.allocated(), 0x2000);

        let mut free = RangeTree::new();
        free.add(0, 0x10000).unwrap();
        sm.replay_into(&mut free).unwrap();
        assert!(!free.contains(0x1000, 1));
        assert!(free.contains(0x2000, 0x1000));
        assert!(!free.contains(0x3000, 1));
        assert_eq!(free.space(), 0x10000 - 0x2000);
    }

    #[test]
    fn open_matches_appended_image() {
        let mut sm = SpaceMap::new();
        sm.append(SpaceMapEntry::Alloc {
            offset: 0,
            size: 0x1000,
        });
        let reopened = SpaceMap::open(sm.bytes().to_vec(), sm.allocated()).unwrap();
        assert_eq!(reopened.num_entries(), 1);
        assert_eq!(reopened.allocated(), 0x1000);
    }

    #[test]
    fn condense_collapses_log() {
        let mut sm = SpaceMap::new();
        let mut allocated = RangeTree::new();
        // Churn: allocate and free the same block many times.
        for _ in 0..64 {
            sm.append(SpaceMapEntry::Alloc {
                offset: 0x1000,
                size: 0x1000,
            });
            sm.append(SpaceMapEntry::Free {
                offset: 0x1000,
                size: 0x1000,
            });
        }
        sm.append(SpaceMapEntry::Alloc {
            offset: 0x8000,
            size: 0x1000,
        });
        allocated.add(0x8000, 0x1000).unwrap();
        assert!(sm.should_condense(allocated.num_segments()));
        sm.condense(&allocated);
        assert_eq!(sm.num_entries(), 1);
        assert_eq!(sm.allocated(), 0x1000);
    }

    #[test]
    fn truncated_record_rejected() {
        assert!(SpaceMap::open(vec![0u8; 17], 0).is_err());
        assert!(SpaceMapEntry::decode(&[0u8; 8]).is_err());
    }
}
