// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Tidepool: a transactional, copy-on-write, pooled block object store.
//!
//! A pool turns a set of block devices (or plain files) into a
//! transactional object store with end-to-end checksums, compression,
//! optional AEAD encryption, deduplication, an adaptive cache, and
//! crash recovery through an intent log. Redundancy comes from mirror
//! and raidz vdevs with self-healing reads; durability comes from
//! transaction groups that commit by rewriting an uberblock ring in the
//! device labels.
//!
//! ```no_run
//! use tidepool::{DatasetConfig, Pool, Tunables, VdevSpec};
//!
//! let pool = Pool::create(
//!     "t",
//!     &[VdevSpec::File { path: "/tmp/dev0".into() }],
//!     Tunables::default(),
//!     &[],
//! )?;
//! let ds = pool.create_dataset("t/fs", DatasetConfig::default())?;
//! let obj = pool.create_object(&ds)?;
//! pool.write(&ds, obj, 0, b"payload")?;
//! pool.sync();
//! assert_eq!(pool.read(&ds, obj, 0, 7)?, b"payload");
//! pool.export()?;
//! # Ok::<(), tidepool::Error>(())
//! ```

pub mod arc;
pub mod blkptr;
pub mod config;
pub mod ddt;
pub mod dmu;
pub mod dsl;
pub mod error;
pub mod events;
pub mod inject;
pub mod l2arc;
pub mod label;
pub mod metaslab;
pub mod spa;
pub mod txg;
pub mod vdev;
pub mod zil;
pub mod zio;

pub use config::{Failmode, Tunables};
pub use dsl::{Dataset, DatasetConfig};
pub use tp_utils::metric::Metric;
pub use error::{Error, IoErr, Result};
pub use events::EventKind;
pub use inject::{Bookmark, InjectKind};
pub use label::LabelSection;
pub use spa::Pool;
pub use vdev::VdevSpec;
