// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Helpers and utilities shared by the tidepool storage engine components.
//!
//! The pieces here are deliberately free of any engine policy: sharded LRU
//! lists, bounded worker pools, hold counting, metrics, an I/O watchdog and
//! an ordered container. Engine crates compose them; nothing here knows
//! about pools, vdevs or transaction groups.

pub mod btree;
pub mod deadman;
pub mod metric;
pub mod multilist;
pub mod refcount;
pub mod taskq;

pub use btree::Btree;
pub use deadman::{Deadman, DeadmanConfig, DeadmanHandle};
pub use metric::{IncMetric, Metric, StoreMetric};
pub use multilist::Multilist;
pub use refcount::Refcount;
pub use taskq::Taskq;
