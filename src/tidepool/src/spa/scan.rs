// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Scrub and resilver.
//!
//! Both walk every reachable block pointer from the meta objset down.
//! Scrub reads through the normal verify path, so a bad copy is counted
//! and healed exactly as a foreground read would heal it. Resilver
//! narrows the walk to blocks born in txgs some leaf is missing (its
//! DTL) and rewrites their physical image through the full vdev fanout,
//! then clears the DTLs it satisfied. Pacing sleeps the walker after
//! each `zfs_scan_vdev_limit` bytes so a scan cannot monopolize the
//! devices.

use std::sync::Arc;
use std::time::Duration;

use log::info;
use serde::Serialize;

use crate::arc::BufType;
use crate::blkptr::{BlockPtr, ObjType, BP_SIZE};
use crate::dmu::dnode::{DnodePhys, DNODE_SIZE};
use crate::dmu::ObjsetPhys;
use crate::error::{Error, Result};
use crate::spa::PoolCore;
use crate::vdev::queue::IoClass;
use crate::zio::{flags as zflags, Zio};

#[derive(Debug, Default, Clone, Serialize)]
pub struct ScanStats {
    pub blocks: u64,
    pub bytes: u64,
    pub errors: u64,
    pub repaired: u64,
}

struct Scan<'a> {
    pool: &'a Arc<PoolCore>,
    stats: ScanStats,
    budget: u64,
    resilver: bool,
}

impl<'a> Scan<'a> {
    fn pace(&mut self, bytes: u64) {
        self.stats.bytes += bytes;
        self.budget += bytes;
        let limit = self.pool.tunables().zfs_scan_vdev_limit.max(1);
        if self.budget >= limit {
            self.budget = 0;
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Visit one block pointer, recursing through indirect levels.
    fn visit(&mut self, bp: &BlockPtr, level: u8) -> Result<()> {
        if bp.is_hole() || bp.is_embedded() {
            return Ok(());
        }
        if bp.obj_type == ObjType::IntentLog {
            // Log chains verify through their own trailer scheme.
            return Ok(());
        }
        self.stats.blocks += 1;
        self.pace(u64::from(bp.psize));

        if self.resilver {
            self.resilver_bp(bp)?;
        }

        if level == 0 {
            // Leaf payloads only need verification; a raw read checks
            // the checksum (and heals) without keys or decompression.
            let zio = Zio::read(
                Arc::clone(self.pool),
                bp.clone(),
                zflags::RAW | zflags::SCRUB,
                IoClass::AsyncRead,
                None,
            );
            if zio.wait().is_err() {
                self.stats.errors += 1;
            }
            return Ok(());
        }

        // Indirect levels go through the cache so their pointers decode.
        let data = match self.pool.read_block(bp, None, BufType::Metadata, None, false) {
            Ok(d) => d,
            Err(_) => {
                self.stats.errors += 1;
                return Ok(());
            }
        };
        for slot in data.chunks_exact(BP_SIZE) {
            let child = BlockPtr::decode(slot)?;
            self.visit(&child, level - 1)?;
        }
        Ok(())
    }

    /// Rewrite a block through the full vdev fanout when some leaf
    /// missed its birth txg.
    fn resilver_bp(&mut self, bp: &BlockPtr) -> Result<()> {
        let birth = bp.physical_birth();
        for dva in bp.dva.iter().filter(|d| d.is_valid()) {
            let top = match self.pool.top_vdev(dva.vdev) {
                Some(t) => t,
                None => continue,
            };
            let mut stale = false;
            top.for_each_leaf(&mut |leaf| {
                if leaf.dtl.lock().unwrap().contains(birth, 1) {
                    stale = true;
                }
            });
            if !stale {
                continue;
            }
            let zio = Zio::read(
                Arc::clone(self.pool),
                bp.clone(),
                zflags::RAW | zflags::RESILVER,
                IoClass::AsyncRead,
                None,
            );
            let physical = match zio.wait() {
                Ok(outcome) => outcome.data.unwrap_or_default(),
                Err(_) => {
                    self.stats.errors += 1;
                    continue;
                }
            };
            let env = self.pool.io_env();
            if top
                .write(&env, dva.offset, &physical, 0, IoClass::AsyncWrite)
                .is_ok()
            {
                self.stats.repaired += 1;
            }
        }
        Ok(())
    }

    /// Walk an objset: the meta-dnode tree, then every object tree
    /// found in the dnode array.
    fn visit_objset(&mut self, rootbp: &BlockPtr) -> Result<()> {
        if rootbp.is_hole() {
            return Ok(());
        }
        self.stats.blocks += 1;
        let bytes = self
            .pool
            .read_block(rootbp, None, BufType::Metadata, None, false)
            .map_err(Error::from)?;
        let phys = ObjsetPhys::decode(&bytes)?;
        let meta = &phys.meta_dnode;

        // Walk the dnode array, collecting leaf blocks to decode.
        let mut array_blocks: Vec<Vec<u8>> = Vec::new();
        for bp in meta.blkptr.iter() {
            self.collect_leaves(bp, meta.nlevels - 1, &mut array_blocks)?;
        }
        for block in array_blocks {
            for raw in block.chunks_exact(DNODE_SIZE) {
                let dn = match DnodePhys::decode(raw) {
                    Ok(dn) => dn,
                    Err(_) => continue,
                };
                if !dn.is_allocated() {
                    continue;
                }
                for bp in dn.blkptr.iter() {
                    self.visit(bp, dn.nlevels - 1)?;
                }
            }
        }
        Ok(())
    }

    /// Like `visit`, but hands back level-0 payloads.
    fn collect_leaves(
        &mut self,
        bp: &BlockPtr,
        level: u8,
        out: &mut Vec<Vec<u8>>,
    ) -> Result<()> {
        if bp.is_hole() {
            return Ok(());
        }
        self.stats.blocks += 1;
        self.pace(u64::from(bp.psize));
        if self.resilver {
            self.resilver_bp(bp)?;
        }
        let data = match self.pool.read_block(bp, None, BufType::Metadata, None, false) {
            Ok(d) => d,
            Err(_) => {
                self.stats.errors += 1;
                return Ok(());
            }
        };
        if level == 0 {
            out.push(data);
        } else {
            for slot in data.chunks_exact(BP_SIZE) {
                let child = BlockPtr::decode(slot)?;
                self.collect_leaves(&child, level - 1, out)?;
            }
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let dsl = self.pool.dsl();
        // The meta objset itself.
        let mos_root = dsl.mos.last_rootbp.lock().unwrap().clone();
        self.visit_objset(&mos_root)?;
        // Every dataset reachable from the directory.
        for name in dsl.list_datasets(self.pool)? {
            let ds = dsl.open_dataset(self.pool, &name)?;
            let root = ds.os.last_rootbp.lock().unwrap().clone();
            self.visit_objset(&root)?;
        }
        Ok(())
    }
}

/// Verify every reachable block, healing what can be healed.
pub fn scrub(pool: &Arc<PoolCore>) -> Result<ScanStats> {
    // Scan what is on disk, not what is in flight.
    pool.txg_kick_and_wait();
    let mut scan = Scan {
        pool,
        stats: ScanStats::default(),
        budget: 0,
        resilver: false,
    };
    scan.run()?;
    info!(
        "scrub: {} blocks, {} bytes, {} errors",
        scan.stats.blocks, scan.stats.bytes, scan.stats.errors
    );
    Ok(scan.stats)
}

/// Rewrite blocks that out-of-date leaves missed, then clear their
/// dirty-time logs.
pub fn resilver(pool: &Arc<PoolCore>) -> Result<ScanStats> {
    pool.txg_kick_and_wait();
    let mut scan = Scan {
        pool,
        stats: ScanStats::default(),
        budget: 0,
        resilver: true,
    };
    scan.run()?;
    if let Some(root) = pool.root_vdev() {
        root.for_each_leaf(&mut |leaf| {
            leaf.dtl.lock().unwrap().clear();
        });
        root.flush_all()?;
    }
    info!(
        "resilver: {} blocks, {} repaired, {} errors",
        scan.stats.blocks, scan.stats.repaired, scan.stats.errors
    );
    Ok(scan.stats)
}
