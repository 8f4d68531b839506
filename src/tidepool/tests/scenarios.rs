// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pool scenarios against file-backed vdevs.

use std::sync::Arc;
use std::time::Instant;

use tidepool::dsl::Dataset;
use tidepool::{DatasetConfig, Metric, Pool, Tunables, VdevSpec};
use test_utils::{xor_pattern, ScratchDevs, DEFAULT_DEV_SIZE};

fn file_specs(devs: &ScratchDevs) -> Vec<VdevSpec> {
    devs.path_strings()
        .into_iter()
        .map(|path| VdevSpec::File { path })
        .collect()
}

fn quiet_tunables() -> Tunables {
    let mut t = Tunables::default();
    // Tests drive syncs explicitly; a short timeout would race them.
    t.zfs_txg_timeout = 3600;
    t
}

fn plain_dataset(pool: &Pool, name: &str) -> Arc<Dataset> {
    pool.create_dataset(name, DatasetConfig::default()).unwrap()
}

/// Write, sync, export, reimport, read back.
#[test]
fn s1_write_read_reopen() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = plain_dataset(&pool, "t/fs");
    pool.ensure_object(&ds, 3).unwrap();
    pool.write(&ds, 3, 0, b"\xDE\xAD\xBE\xEF\xCA\xFE\xBA\xBE").unwrap();
    pool.sync();
    pool.export().unwrap();

    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    let ds = pool.open_dataset("t/fs").unwrap();
    let got = pool.read(&ds, 3, 0, 8).unwrap();
    assert_eq!(got, b"\xDE\xAD\xBE\xEF\xCA\xFE\xBA\xBE");
    pool.export().unwrap();
}

/// A corrupt mirror child is detected, read around, counted, and
/// repaired in place.
#[test]
fn s2_mirror_self_heal() {
    let devs = ScratchDevs::new(2, DEFAULT_DEV_SIZE);
    let spec = vec![VdevSpec::Mirror {
        children: file_specs(&devs),
    }];
    let pool = Pool::create("t", &spec, quiet_tunables(), &[]).unwrap();
    let mut config = DatasetConfig::default();
    config.compress = "off".into();
    let ds = pool.create_dataset("t/fs", config).unwrap();
    pool.ensure_object(&ds, 4).unwrap();
    let block = vec![0x41u8; 4096];
    pool.write(&ds, 4, 0, &block).unwrap();
    pool.sync();

    // Find the stored copy on child 0 by its pattern and zero it.
    let dev_bytes = devs.raw_read(0, 0, DEFAULT_DEV_SIZE as usize);
    let needle = vec![0x41u8; 4096];
    let pos = dev_bytes
        .windows(4096)
        .position(|w| w == &needle[..])
        .expect("pattern must be on disk with compression off") as u64;
    devs.corrupt(0, pos, &vec![0u8; 4096]);

    // Drop the cached copy so the read goes to the devices.
    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);

    let got = pool.read(&ds, 4, 0, 4096).unwrap();
    assert_eq!(got, block);

    // The faulty child was counted and repaired.
    let top = pool.core.top_vdev(0).unwrap();
    let child0 = &top.children[0];
    assert!(
        child0.stats.checksum_errors.count() >= 1,
        "checksum error must be attributed to child 0"
    );
    assert!(child0.stats.self_healed_bytes.count() > 0);
    let healed = devs.raw_read(0, pos, 4096);
    assert_eq!(healed, block, "repair write must restore child 0");
    pool.export().unwrap();
}

/// One zeroed raidz data column reconstructs from parity.
#[test]
fn s3_raidz_reconstruction() {
    let devs = ScratchDevs::new(4, DEFAULT_DEV_SIZE);
    let spec = vec![VdevSpec::Raidz {
        nparity: 1,
        children: file_specs(&devs),
    }];
    let pool = Pool::create("t", &spec, quiet_tunables(), &[]).unwrap();
    let mut config = DatasetConfig::default();
    config.compress = "off".into();
    let ds = pool.create_dataset("t/fs", config).unwrap();
    pool.ensure_object(&ds, 5).unwrap();
    let pattern = xor_pattern(65536);
    pool.write(&ds, 5, 0, &pattern).unwrap();
    pool.sync();

    // Zero the first 4 KiB column of the block on its data child.
    let mut found = None;
    for dev in 1..4 {
        let bytes = devs.raw_read(dev, 0, DEFAULT_DEV_SIZE as usize);
        if let Some(pos) = bytes.windows(4096).position(|w| w == &pattern[0..4096]) {
            found = Some((dev, pos as u64));
            break;
        }
    }
    let (dev, pos) = found.expect("first column must exist on some data child");
    devs.corrupt(dev, pos, &vec![0u8; 4096]);

    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);

    let got = pool.read(&ds, 5, 0, 65536).unwrap();
    assert_eq!(got, pattern, "reconstruction must produce the exact pattern");
    pool.export().unwrap();
}

/// Two identical writes share storage through the dedup table.
#[test]
fn s4_dedup_hit() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let mut config = DatasetConfig::default();
    config.dedup = true;
    config.checksum = "sha256".into();
    let ds = pool.create_dataset("t/fs", config).unwrap();
    pool.ensure_object(&ds, 6).unwrap();
    pool.ensure_object(&ds, 7).unwrap();

    let x = vec![0x5au8; 65536];
    pool.write(&ds, 6, 0, &x).unwrap();
    pool.sync();
    let (_, used_after_first) = pool.core.allocator().space();

    pool.write(&ds, 7, 0, &x).unwrap();
    pool.sync();
    let (_, used_after_second) = pool.core.allocator().space();

    assert_eq!(pool.core.ddt.stats.hits.count(), 1, "second write must hit");
    // The duplicate data allocated nothing new; only metadata grew.
    let delta = used_after_second - used_after_first;
    assert!(
        delta < 0x40000,
        "duplicate write must not re-allocate the payload (delta {:#x})",
        delta
    );

    // Flush the table and find the entry with refcount 2.
    pool.core.ddt.set_flush_force_txg(1);
    pool.sync();
    pool.sync();
    pool.sync();
    let mut cursor = tidepool::ddt::DdtCursor::default();
    let mut found_ref2 = false;
    while let Some((next, _key, phys)) = pool.core.ddt.walk(cursor) {
        if phys.refcount == 2 {
            found_ref2 = true;
        }
        cursor = next;
    }
    assert!(found_ref2, "dedup entry with refcount 2 must exist");

    // Both objects read back the same bytes.
    assert_eq!(pool.read(&ds, 6, 0, 65536).unwrap(), x);
    assert_eq!(pool.read(&ds, 7, 0, 65536).unwrap(), x);
    pool.export().unwrap();
}

/// A synchronous write survives a crash that beats the txg sync.
#[test]
fn s5_zil_replay() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = plain_dataset(&pool, "t/fs");
    pool.ensure_object(&ds, 8).unwrap();
    pool.write_sync(&ds, 8, 0, b"hello\n").unwrap();
    // Crash: no txg sync for the write.
    pool.crash();

    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    let ds = pool.open_dataset("t/fs").unwrap();
    let got = pool.read(&ds, 8, 0, 6).unwrap();
    assert_eq!(got, b"hello\n");

    // Replay is idempotent: another crash/import cycle reads the same.
    pool.crash();
    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    let ds = pool.open_dataset("t/fs").unwrap();
    assert_eq!(pool.read(&ds, 8, 0, 6).unwrap(), b"hello\n");
    pool.export().unwrap();
}

/// The dirty-data throttle slows writers instead of failing them.
#[test]
fn s6_throttle_engagement() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let mut t = quiet_tunables();
    t.zfs_dirty_data_max = 4 * 1024 * 1024;
    t.zfs_delay_min_dirty_percent = 10;
    t.zfs_delay_scale = 2_000_000;
    t.zfs_delay_max_ns = 20_000_000;
    let pool = Pool::create("t", &file_specs(&devs), t, &[]).unwrap();
    let ds = plain_dataset(&pool, "t/fs");
    let obj = pool.create_object(&ds).unwrap();

    let chunk = vec![0x33u8; 128 * 1024];
    let start = Instant::now();
    let mut offset = 0u64;
    for _ in 0..64 {
        // 8 MiB total against a 4 MiB dirty cap: the throttle must
        // engage, and nothing may fail with out-of-space.
        pool.write(&ds, obj, offset, &chunk).unwrap();
        offset += chunk.len() as u64;
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed.as_millis() >= 20,
        "throttle should have delayed writers ({}ms)",
        elapsed.as_millis()
    );
    pool.sync();
    assert_eq!(pool.read(&ds, obj, 0, 4).unwrap(), vec![0x33u8; 4]);
    pool.export().unwrap();
}
