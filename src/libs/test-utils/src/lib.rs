// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Fixtures for tidepool tests: scratch backing files sized like small
//! devices, and deterministic data patterns.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tempfile::TempDir;

/// Default scratch device size: big enough for labels, space maps and a
/// few megabytes of data.
pub const DEFAULT_DEV_SIZE: u64 = 64 * 1024 * 1024;

/// A set of scratch backing files that disappears with the value.
pub struct ScratchDevs {
    pub dir: TempDir,
    pub paths: Vec<PathBuf>,
}

impl ScratchDevs {
    pub fn new(count: usize, size: u64) -> ScratchDevs {
        let dir = tempfile::tempdir().expect("scratch tempdir");
        let paths = (0..count)
            .map(|i| {
                let path = dir.path().join(format!("dev{}", i));
                let mut f = File::create(&path).expect("scratch file");
                f.write_all(&vec![0u8; size as usize]).expect("scratch fill");
                path
            })
            .collect();
        ScratchDevs { dir, paths }
    }

    pub fn path_strings(&self) -> Vec<String> {
        self.paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect()
    }

    /// Overwrite raw device bytes, simulating on-disk corruption.
    pub fn corrupt(&self, dev: usize, offset: u64, bytes: &[u8]) {
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(&self.paths[dev])
            .expect("open for corruption");
        f.write_all_at(bytes, offset).expect("corrupt write");
        f.sync_data().expect("corrupt sync");
    }

    /// Read raw device bytes back.
    pub fn raw_read(&self, dev: usize, offset: u64, len: usize) -> Vec<u8> {
        use std::os::unix::fs::FileExt;
        let f = File::open(&self.paths[dev]).expect("open for raw read");
        let mut buf = vec![0u8; len];
        f.read_exact_at(&mut buf, offset).expect("raw read");
        buf
    }
}

/// `len` bytes of the repeating 32-bit pattern `i ^ 0xA5A5A5A5`.
pub fn xor_pattern(len: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    let mut i: u32 = 0;
    while out.len() < len {
        out.extend_from_slice(&(i ^ 0xa5a5_a5a5).to_le_bytes());
        i += 1;
    }
    out.truncate(len);
    out
}

/// Deterministic pseudo-random bytes.
pub fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut buf = vec![0u8; len];
    rng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_devs_round_trip_raw_io() {
        let devs = ScratchDevs::new(2, 2 * 1024 * 1024);
        devs.corrupt(1, 4096, b"mark");
        assert_eq!(devs.raw_read(1, 4096, 4), b"mark");
        assert_eq!(devs.raw_read(0, 4096, 4), [0u8; 4]);
    }

    #[test]
    fn xor_pattern_is_stable() {
        let a = xor_pattern(64);
        let b = xor_pattern(64);
        assert_eq!(a, b);
        assert_eq!(&a[0..4], &0xa5a5_a5a5u32.to_le_bytes());
    }
}
