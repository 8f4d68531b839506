// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Pool status snapshots.
//!
//! The snapshot is built from atomics and brief per-subsystem peeks; it
//! never takes a pool-wide lock, so concurrent mutation can leave the
//! numbers transiently inconsistent with each other. That is the
//! documented contract: these are statistics, not an audit.

use serde_json::{json, Value};

use crate::spa::PoolCore;
use crate::vdev::Vdev;

fn vdev_json(vd: &Vdev) -> Value {
    let (state, aux) = vd.state();
    let kind = match &vd.kind {
        crate::vdev::VdevKind::Root => "root".to_string(),
        crate::vdev::VdevKind::Mirror => "mirror".to_string(),
        crate::vdev::VdevKind::Raidz { nparity } => format!("raidz{}", nparity),
        crate::vdev::VdevKind::File(leaf) => leaf.path().display().to_string(),
    };
    let dtl = vd.dtl.lock().unwrap();
    json!({
        "kind": kind,
        "guid": vd.guid,
        "state": state,
        "aux": aux,
        "stats": &vd.stats,
        "dtl_txgs": dtl.space(),
        "children": vd.children.iter().map(|c| vdev_json(c)).collect::<Vec<_>>(),
    })
}

/// A full status snapshot as JSON.
pub fn pool_stats_json(pool: &PoolCore) -> Value {
    let (space_total, space_used) = pool
        .allocator
        .read()
        .unwrap()
        .as_ref()
        .map(|a| a.space())
        .unwrap_or((0, 0));
    let vdevs = pool
        .root_vdev()
        .map(|root| vdev_json(&root))
        .unwrap_or(Value::Null);
    let l2: Vec<Value> = pool
        .l2_devices()
        .iter()
        .map(|d| json!({ "entries": d.len(), "stats": &d.stats }))
        .collect();
    let fletcher: Vec<Value> = tp_checksum::fletcher_4_benchmark_results()
        .iter()
        .map(|(name, bps)| json!({ "impl": name, "bytes_per_sec": bps }))
        .collect();
    json!({
        "name": pool.name,
        "guid": pool.guid,
        "suspended": pool.is_suspended(),
        "txg": {
            "open": pool.open_txg(),
            "synced": pool.synced_txg(),
        },
        "space": {
            "total": space_total,
            "allocated": space_used,
        },
        "dirty_bytes": pool.dirty_bytes(),
        "vdev_tree": vdevs,
        "arc": &pool.arc.stats,
        "ddt": &pool.ddt.stats,
        "l2arc": l2,
        "fletcher4": fletcher,
        "events_pending": pool.events.len(),
    })
}
