// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Crash, corruption and fault-injection scenarios.

use std::sync::Arc;
use std::time::Duration;

use tidepool::label::{LABEL_SIZE, UBER_RING_OFF, UBER_SLOT_SIZE};
use tidepool::{DatasetConfig, EventKind, InjectKind, Metric, Pool, Tunables, VdevSpec};
use test_utils::{ScratchDevs, DEFAULT_DEV_SIZE};

fn file_specs(devs: &ScratchDevs) -> Vec<VdevSpec> {
    devs.path_strings()
        .into_iter()
        .map(|path| VdevSpec::File { path })
        .collect()
}

fn quiet_tunables() -> Tunables {
    let mut t = Tunables::default();
    t.zfs_txg_timeout = 3600;
    t
}

/// Wiping both front labels still leaves an importable pool: the back
/// pair carries the config and the uberblocks.
#[test]
fn import_survives_front_label_loss() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = pool.create_dataset("t/fs", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    pool.write(&ds, obj, 0, b"survives").unwrap();
    pool.sync();
    pool.export().unwrap();

    devs.corrupt(0, 0, &vec![0u8; (2 * LABEL_SIZE) as usize]);

    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    let ds = pool.open_dataset("t/fs").unwrap();
    assert_eq!(pool.read(&ds, obj, 0, 8).unwrap(), b"survives");
    pool.export().unwrap();
}

/// Destroying the newest uberblock in every label falls back to the
/// previous committed state; there is no torn in-between.
#[test]
fn uberblock_fallback_to_previous_txg() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = pool.create_dataset("t/fs", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();

    pool.write(&ds, obj, 0, b"AAAA").unwrap();
    pool.sync();
    let txg_a = pool.core.synced_txg();

    pool.write(&ds, obj, 0, b"BBBB").unwrap();
    pool.sync();
    let txg_b = pool.core.synced_txg();
    assert!(txg_b > txg_a);
    pool.export().unwrap();

    // Zero the ring slots of txg_b and anything the export might have
    // added after it, in all four labels, as a torn final write would
    // leave them.
    let dev_size = DEFAULT_DEV_SIZE;
    for txg in txg_b..txg_b + 4 {
        let slot = txg % 128;
        for label_off in &[0, LABEL_SIZE, dev_size - 2 * LABEL_SIZE, dev_size - LABEL_SIZE] {
            let off = label_off + UBER_RING_OFF + slot * UBER_SLOT_SIZE;
            devs.corrupt(0, off, &vec![0u8; UBER_SLOT_SIZE as usize]);
        }
    }

    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    assert!(pool.core.synced_txg() >= txg_a);
    let ds = pool.open_dataset("t/fs").unwrap();
    // The pool reads as of txg_a: the earlier content, never a blend.
    assert_eq!(pool.read(&ds, obj, 0, 4).unwrap(), b"AAAA");
    pool.export().unwrap();
}

/// A suspended pool parks the sync pipeline; resume releases it.
#[test]
fn suspend_parks_sync_until_resume() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = pool.create_dataset("t/fs", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();

    pool.core.suspend("test fault");
    pool.write(&ds, obj, 0, b"parked").unwrap();

    let synced_before = pool.core.synced_txg();
    let core = Arc::clone(&pool.core);
    let syncer = std::thread::spawn(move || {
        core.txg_kick_and_wait();
    });
    std::thread::sleep(Duration::from_millis(200));
    assert!(
        !syncer.is_finished(),
        "sync must park while the pool is suspended"
    );
    assert_eq!(pool.core.synced_txg(), synced_before);
    assert_eq!(pool.core.events.count(EventKind::PoolSuspended), 1);

    pool.core.resume();
    syncer.join().unwrap();
    assert!(pool.core.synced_txg() > synced_before);
    assert_eq!(pool.read(&ds, obj, 0, 6).unwrap(), b"parked");
    pool.export().unwrap();
}

/// Device faults injected by guid surface as I/O errors and events.
#[test]
fn injected_device_fault_fails_reads() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = pool.create_dataset("t/fs", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    pool.write(&ds, obj, 0, b"faulty").unwrap();
    pool.sync();

    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);

    let top = pool.core.top_vdev(0).unwrap();
    let handler = pool
        .core
        .inject
        .add(InjectKind::DeviceFault, Some(top.guid), None, u64::MAX);
    assert!(pool.read(&ds, obj, 0, 6).is_err());
    assert!(top.stats.read_errors.count() >= 1);
    assert!(pool.core.events.count(EventKind::IoError) >= 1);

    pool.core.inject.remove(handler);
    assert_eq!(pool.read(&ds, obj, 0, 6).unwrap(), b"faulty");
    pool.export().unwrap();
}

/// Scrub heals latent corruption on redundant storage.
#[test]
fn scrub_heals_corrupt_mirror_copy() {
    let devs = ScratchDevs::new(2, DEFAULT_DEV_SIZE);
    let spec = vec![VdevSpec::Mirror {
        children: file_specs(&devs),
    }];
    let pool = Pool::create("t", &spec, quiet_tunables(), &[]).unwrap();
    let mut config = DatasetConfig::default();
    config.compress = "off".into();
    let ds = pool.create_dataset("t/fs", config).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    let block = vec![0x77u8; 8192];
    pool.write(&ds, obj, 0, &block).unwrap();
    pool.sync();

    let bytes = devs.raw_read(1, 0, DEFAULT_DEV_SIZE as usize);
    let pos = bytes
        .windows(8192)
        .position(|w| w == &block[..])
        .expect("uncompressed block on child 1") as u64;
    devs.corrupt(1, pos, &vec![0xffu8; 8192]);

    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);

    let stats = pool.scrub().unwrap();
    assert_eq!(stats.errors, 0, "redundant corruption heals, not errors");
    assert_eq!(devs.raw_read(1, pos, 8192), block, "scrub must repair child 1");
    pool.export().unwrap();
}

/// An encrypted dataset round-trips across export/import; blocks are
/// unreadable ciphertext on disk.
#[test]
fn encrypted_dataset_roundtrip() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let mut config = DatasetConfig::default();
    config.compress = "off".into();
    config.encryption = "CKM_AES_GCM".into();
    config.key_hex = "aa".repeat(32);
    let ds = pool.create_dataset("t/secret", config).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    let secret = b"attack at dawn, bring snacks";
    pool.write(&ds, obj, 0, secret).unwrap();
    pool.sync();
    pool.export().unwrap();

    // The plaintext never appears on the device.
    let raw = devs.raw_read(0, 0, DEFAULT_DEV_SIZE as usize);
    assert!(
        !raw.windows(secret.len()).any(|w| w == &secret[..]),
        "plaintext leaked to disk"
    );

    let pool = Pool::import(&devs.path_strings(), quiet_tunables(), &[]).unwrap();
    let ds = pool.open_dataset("t/secret").unwrap();
    assert_eq!(pool.read(&ds, obj, 0, secret.len() as u64).unwrap(), secret);
    pool.export().unwrap();
}

/// L2 devices absorb evicted buffers and serve them back.
#[test]
fn l2arc_feed_and_hit() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let cache_devs = ScratchDevs::new(1, 16 * 1024 * 1024);
    let pool = Pool::create(
        "t",
        &file_specs(&devs),
        quiet_tunables(),
        &cache_devs.path_strings(),
    )
    .unwrap();
    let ds = pool.create_dataset("t/fs", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    let data = test_utils::random_bytes(128 * 1024, 42);
    pool.write(&ds, obj, 0, &data).unwrap();
    pool.sync();

    // Populate the cache, spill it to L2, then force a cold primary.
    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);
    assert_eq!(pool.read(&ds, obj, 0, data.len() as u64).unwrap(), data);
    pool.core.l2_feed_pass();
    let l2 = &pool.core.l2_devices()[0];
    assert!(l2.len() > 0, "feed pass must have written entries");

    pool.core.arc.clear();
    pool.core.dbufs.evict_objset(ds.object);
    assert_eq!(pool.read(&ds, obj, 0, data.len() as u64).unwrap(), data);
    assert!(l2.stats.hits.count() > 0, "second cold read must hit L2");
    pool.export().unwrap();
}

/// Dataset destroy returns its space and forgets the name.
#[test]
fn dataset_destroy_releases_space() {
    let devs = ScratchDevs::new(1, DEFAULT_DEV_SIZE);
    let pool = Pool::create("t", &file_specs(&devs), quiet_tunables(), &[]).unwrap();
    let ds = pool.create_dataset("t/doomed", DatasetConfig::default()).unwrap();
    let obj = pool.create_object(&ds).unwrap();
    pool.write(&ds, obj, 0, &vec![9u8; 512 * 1024]).unwrap();
    pool.sync();
    let (_, used_full) = pool.core.allocator().space();

    pool.destroy_dataset("t/doomed").unwrap();
    pool.sync();
    pool.sync();
    let (_, used_after) = pool.core.allocator().space();
    assert!(
        used_after < used_full,
        "destroy must release space ({:#x} -> {:#x})",
        used_full,
        used_after
    );
    assert!(pool.open_dataset("t/doomed").is_err());
    pool.export().unwrap();
}
