// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Engine tunables and pool configuration.
//!
//! Every knob the engine recognizes lives on [`Tunables`] with a serde
//! default, so a pool can be created from a plain JSON fragment and a
//! default-constructed config is always valid. Validation happens once at
//! pool open, not at use sites.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Behavior when the pool cannot make forward progress on I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Failmode {
    /// Block new I/O until an operator resumes the pool.
    Wait,
    /// Fail in-flight and new I/O with an error.
    Continue,
    /// Panic the process.
    Panic,
}

impl Default for Failmode {
    fn default() -> Self {
        Failmode::Wait
    }
}

fn default_arc_max() -> u64 {
    64 * 1024 * 1024
}
fn default_arc_min() -> u64 {
    8 * 1024 * 1024
}
fn default_arc_shrinker_limit() -> u64 {
    10_000
}
fn default_arc_pc_percent() -> u64 {
    0
}
fn default_dirty_data_max() -> u64 {
    64 * 1024 * 1024
}
fn default_dirty_data_max_percent() -> u64 {
    10
}
fn default_dirty_data_max_max() -> u64 {
    4 * 1024 * 1024 * 1024
}
fn default_delay_max_ns() -> u64 {
    100_000_000
}
fn default_delay_scale() -> u64 {
    500_000
}
fn default_delay_min_dirty_percent() -> u64 {
    60
}
fn default_min_active() -> u32 {
    1
}
fn default_sync_max_active() -> u32 {
    10
}
fn default_async_max_active() -> u32 {
    3
}
fn default_aggregation_limit() -> u64 {
    1024 * 1024
}
fn default_read_gap_limit() -> u64 {
    32 * 1024
}
fn default_write_gap_limit() -> u64 {
    4 * 1024
}
fn default_txg_timeout_secs() -> u64 {
    5
}
fn default_deadman_synctime_ms() -> u64 {
    600_000
}
fn default_deadman_ziotime_ms() -> u64 {
    300_000
}
fn default_multihost_interval_ms() -> u64 {
    1_000
}
fn default_multihost_import_intervals() -> u64 {
    20
}
fn default_multihost_fail_intervals() -> u64 {
    10
}
fn default_fletcher_4_impl() -> String {
    "fastest".to_string()
}
fn default_true() -> bool {
    true
}
fn default_queue_depth_pct() -> u64 {
    1000
}
fn default_scan_vdev_limit() -> u64 {
    4 * 1024 * 1024
}
fn default_resilver_min_time_ms() -> u64 {
    3_000
}
fn default_livelist_min_percent_shared() -> u64 {
    75
}
fn default_l2arc_write_max() -> u64 {
    8 * 1024 * 1024
}
fn default_l2arc_write_boost() -> u64 {
    8 * 1024 * 1024
}
fn default_l2arc_feed_secs() -> u64 {
    1
}

/// The knobs the engine recognizes. Field names match the operator
/// surface; everything has a usable default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Tunables {
    pub zfs_arc_max: u64,
    pub zfs_arc_min: u64,
    /// Cap on pages an external shrinker may request per call.
    pub zfs_arc_shrinker_limit: u64,
    /// Floor for evictable reporting, proportional to page cache.
    pub zfs_arc_pc_percent: u64,
    /// Apply the shrinker limit to every async reclaim context, not just
    /// the kswapd-equivalent one.
    pub zfs_arc_shrinker_limit_all_contexts: bool,

    pub zfs_dirty_data_max: u64,
    pub zfs_dirty_data_max_percent: u64,
    pub zfs_dirty_data_max_max: u64,
    pub zfs_delay_max_ns: u64,
    pub zfs_delay_scale: u64,
    pub zfs_delay_min_dirty_percent: u64,

    pub zfs_vdev_sync_read_min_active: u32,
    pub zfs_vdev_sync_read_max_active: u32,
    pub zfs_vdev_sync_write_min_active: u32,
    pub zfs_vdev_sync_write_max_active: u32,
    pub zfs_vdev_async_read_min_active: u32,
    pub zfs_vdev_async_read_max_active: u32,
    pub zfs_vdev_async_write_min_active: u32,
    pub zfs_vdev_async_write_max_active: u32,
    pub zfs_vdev_aggregation_limit: u64,
    pub zfs_vdev_read_gap_limit: u64,
    pub zfs_vdev_write_gap_limit: u64,
    /// Share of queued allocations per top-level vdev; applies to the
    /// normal class only.
    pub zfs_vdev_queue_depth_pct: u64,

    pub zfs_txg_timeout: u64,
    pub zfs_deadman_synctime_ms: u64,
    pub zfs_deadman_ziotime_ms: u64,
    pub zfs_deadman_failmode: Failmode,

    pub zfs_multihost_interval: u64,
    pub zfs_multihost_import_intervals: u64,
    pub zfs_multihost_fail_intervals: u64,
    /// Pool property: write heartbeats and refuse double imports.
    pub multihost: bool,

    /// Sublist fan-out for cache eviction lists; 0 means CPU count.
    pub zfs_multilist_num_sublists: u64,
    pub zfs_fletcher_4_impl: String,
    pub zfs_compressed_arc_enabled: bool,

    /// Accepted for compatibility; clone livelists are out of scope and
    /// these drive nothing.
    pub zfs_livelist_min_percent_shared: u64,

    pub zfs_scan_legacy: bool,
    pub zfs_scan_vdev_limit: u64,
    pub zfs_resilver_min_time_ms: u64,

    pub zfs_l2arc_write_max: u64,
    pub zfs_l2arc_write_boost: u64,
    pub zfs_l2arc_feed_secs: u64,

    pub failmode: Failmode,
}

impl Default for Tunables {
    fn default() -> Self {
        Tunables {
            zfs_arc_max: default_arc_max(),
            zfs_arc_min: default_arc_min(),
            zfs_arc_shrinker_limit: default_arc_shrinker_limit(),
            zfs_arc_pc_percent: default_arc_pc_percent(),
            zfs_arc_shrinker_limit_all_contexts: default_true(),
            zfs_dirty_data_max: default_dirty_data_max(),
            zfs_dirty_data_max_percent: default_dirty_data_max_percent(),
            zfs_dirty_data_max_max: default_dirty_data_max_max(),
            zfs_delay_max_ns: default_delay_max_ns(),
            zfs_delay_scale: default_delay_scale(),
            zfs_delay_min_dirty_percent: default_delay_min_dirty_percent(),
            zfs_vdev_sync_read_min_active: default_min_active(),
            zfs_vdev_sync_read_max_active: default_sync_max_active(),
            zfs_vdev_sync_write_min_active: default_min_active(),
            zfs_vdev_sync_write_max_active: default_sync_max_active(),
            zfs_vdev_async_read_min_active: default_min_active(),
            zfs_vdev_async_read_max_active: default_async_max_active(),
            zfs_vdev_async_write_min_active: default_min_active(),
            zfs_vdev_async_write_max_active: default_async_max_active(),
            zfs_vdev_aggregation_limit: default_aggregation_limit(),
            zfs_vdev_read_gap_limit: default_read_gap_limit(),
            zfs_vdev_write_gap_limit: default_write_gap_limit(),
            zfs_vdev_queue_depth_pct: default_queue_depth_pct(),
            zfs_txg_timeout: default_txg_timeout_secs(),
            zfs_deadman_synctime_ms: default_deadman_synctime_ms(),
            zfs_deadman_ziotime_ms: default_deadman_ziotime_ms(),
            zfs_deadman_failmode: Failmode::default(),
            zfs_multihost_interval: default_multihost_interval_ms(),
            zfs_multihost_import_intervals: default_multihost_import_intervals(),
            zfs_multihost_fail_intervals: default_multihost_fail_intervals(),
            multihost: false,
            zfs_multilist_num_sublists: 0,
            zfs_fletcher_4_impl: default_fletcher_4_impl(),
            zfs_compressed_arc_enabled: default_true(),
            zfs_livelist_min_percent_shared: default_livelist_min_percent_shared(),
            zfs_scan_legacy: false,
            zfs_scan_vdev_limit: default_scan_vdev_limit(),
            zfs_resilver_min_time_ms: default_resilver_min_time_ms(),
            zfs_l2arc_write_max: default_l2arc_write_max(),
            zfs_l2arc_write_boost: default_l2arc_write_boost(),
            zfs_l2arc_feed_secs: default_l2arc_feed_secs(),
            failmode: Failmode::default(),
        }
    }
}

impl Tunables {
    pub fn validate(&self) -> Result<()> {
        if self.zfs_arc_min > self.zfs_arc_max {
            return Err(Error::Config(format!(
                "zfs_arc_min ({}) exceeds zfs_arc_max ({})",
                self.zfs_arc_min, self.zfs_arc_max
            )));
        }
        if self.zfs_dirty_data_max == 0 {
            return Err(Error::Config("zfs_dirty_data_max must be nonzero".into()));
        }
        if self.zfs_dirty_data_max > self.zfs_dirty_data_max_max {
            return Err(Error::Config(format!(
                "zfs_dirty_data_max ({}) exceeds zfs_dirty_data_max_max ({})",
                self.zfs_dirty_data_max, self.zfs_dirty_data_max_max
            )));
        }
        if self.zfs_delay_min_dirty_percent > 100 {
            return Err(Error::Config(
                "zfs_delay_min_dirty_percent must be <= 100".into(),
            ));
        }
        let queue_pairs = [
            (self.zfs_vdev_sync_read_min_active, self.zfs_vdev_sync_read_max_active, "sync_read"),
            (self.zfs_vdev_sync_write_min_active, self.zfs_vdev_sync_write_max_active, "sync_write"),
            (self.zfs_vdev_async_read_min_active, self.zfs_vdev_async_read_max_active, "async_read"),
            (self.zfs_vdev_async_write_min_active, self.zfs_vdev_async_write_max_active, "async_write"),
        ];
        for (min, max, name) in queue_pairs.iter() {
            if *max == 0 || min > max {
                return Err(Error::Config(format!(
                    "zfs_vdev_{}_{{min,max}}_active invalid ({}, {})",
                    name, min, max
                )));
            }
        }
        if self.zfs_vdev_queue_depth_pct == 0 {
            return Err(Error::Config("zfs_vdev_queue_depth_pct must be nonzero".into()));
        }
        let names = tp_checksum::fletcher_4_impl_names();
        if !names.contains(&self.zfs_fletcher_4_impl.as_str()) {
            return Err(Error::Config(format!(
                "zfs_fletcher_4_impl '{}' not in {:?}",
                self.zfs_fletcher_4_impl, names
            )));
        }
        Ok(())
    }

    /// Apply process-wide selections (fletcher backend).
    pub fn apply_global(&self) -> Result<()> {
        tp_checksum::fletcher_4_select(&self.zfs_fletcher_4_impl)?;
        Ok(())
    }

    pub fn num_sublists(&self) -> usize {
        if self.zfs_multilist_num_sublists == 0 {
            tp_utils::multilist::default_num_sublists()
        } else {
            (self.zfs_multilist_num_sublists as usize).max(4)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Tunables::default().validate().unwrap();
    }

    #[test]
    fn json_fragment_overrides_one_field() {
        let t: Tunables = serde_json::from_str(r#"{"zfs_txg_timeout": 1}"#).unwrap();
        assert_eq!(t.zfs_txg_timeout, 1);
        assert_eq!(t.zfs_arc_max, default_arc_max());
        t.validate().unwrap();
    }

    #[test]
    fn bad_configs_rejected() {
        let mut t = Tunables::default();
        t.zfs_arc_min = t.zfs_arc_max + 1;
        assert!(t.validate().is_err());

        let mut t = Tunables::default();
        t.zfs_vdev_sync_read_max_active = 0;
        assert!(t.validate().is_err());

        let mut t = Tunables::default();
        t.zfs_fletcher_4_impl = "avx512".into();
        assert!(t.validate().is_err());
    }

    #[test]
    fn failmode_serde_names() {
        let t: Tunables = serde_json::from_str(r#"{"failmode": "panic"}"#).unwrap();
        assert_eq!(t.failmode, Failmode::Panic);
    }
}
