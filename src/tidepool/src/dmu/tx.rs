// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Transactions: how writers join a txg.
//!
//! A transaction declares what it will touch, then assigns itself to the
//! open txg. Assignment is where the dirty-data throttle lives: past the
//! hard cap the writer blocks for a sync; past the soft threshold it
//! eats a delay that grows as dirty data approaches the cap. The hold
//! taken at assign is what the quiesce phase waits on.

use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::error::Result;
use crate::spa::PoolCore;
use crate::txg::TxgHold;

pub struct DmuTxBuilder {
    pool: Arc<PoolCore>,
    reserved: u64,
}

impl DmuTxBuilder {
    pub fn new(pool: &Arc<PoolCore>) -> Self {
        DmuTxBuilder {
            pool: Arc::clone(pool),
            reserved: 0,
        }
    }

    /// Declare an upcoming write of `len` bytes.
    pub fn hold_write(&mut self, _object: u64, _offset: u64, len: u64) -> &mut Self {
        self.reserved += len;
        self
    }

    /// Declare a metadata-only change.
    pub fn hold_bonus(&mut self, _object: u64) -> &mut Self {
        self.reserved += 512;
        self
    }

    /// Join the open txg, applying the write throttle.
    pub fn assign(self) -> Result<DmuTx> {
        let t = self.pool.tunables();
        let max = t.zfs_dirty_data_max;
        // Hard cap: wait for a sync to retire dirty data. A single
        // over-sized reservation proceeds once the pool is clean.
        while self.pool.dirty_bytes() > 0 && self.pool.dirty_bytes() + self.reserved > max {
            self.pool.txg_wait_one();
        }
        // Soft throttle: delay grows as dirty approaches the cap.
        let dirty = self.pool.dirty_bytes() + self.reserved;
        let min_dirty = max / 100 * t.zfs_delay_min_dirty_percent;
        if dirty > min_dirty {
            let over = dirty - min_dirty;
            let room = max.saturating_sub(dirty).max(1);
            let delay_ns = (t.zfs_delay_scale.saturating_mul(over) / room).min(t.zfs_delay_max_ns);
            if delay_ns > 0 {
                trace!("write throttle: delaying {}ns ({} dirty)", delay_ns, dirty);
                std::thread::sleep(Duration::from_nanos(delay_ns));
            }
        }
        let hold = self.pool.txg_hold_open();
        Ok(DmuTx {
            hold,
            reserved: self.reserved,
        })
    }
}

/// An assigned transaction. Dropping (or `commit`) releases the txg
/// hold; the data itself rides the dirty records created under it.
pub struct DmuTx {
    hold: TxgHold,
    #[allow(dead_code)]
    reserved: u64,
}

impl DmuTx {
    pub fn txg(&self) -> u64 {
        self.hold.txg()
    }

    pub fn commit(self) {
        // The hold drops here; quiesce of this txg can proceed.
    }
}
