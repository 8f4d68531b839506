// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Space accounting primitives for the tidepool storage engine.
//!
//! A [`RangeTree`](range_tree::RangeTree) tracks disjoint extents of a
//! linear address space (free space in a metaslab, missing-txg spans in a
//! dirty-time log). A [`SpaceMap`](space_map::SpaceMap) is the durable
//! form: an append-only log of alloc/free deltas that replays into a
//! range tree. Neither knows anything about pools or devices; the engine
//! supplies the backing store.

use thiserror::Error;

pub mod range_tree;
pub mod space_map;

pub use range_tree::RangeTree;
pub use space_map::{SpaceMap, SpaceMapEntry};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("no segment of {0} bytes available")]
    NoSpace(u64),
    #[error("range [{0:#x}, {0:#x}+{1:#x}) overlaps an existing segment")]
    Overlap(u64, u64),
    #[error("range [{0:#x}, {0:#x}+{1:#x}) is not fully present")]
    NotPresent(u64, u64),
    #[error("malformed space map record at offset {0}")]
    BadRecord(usize),
    #[error("zero-length range")]
    EmptyRange,
}

pub type Result<T> = std::result::Result<T, Error>;
