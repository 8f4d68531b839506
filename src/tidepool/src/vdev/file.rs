// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! File-backed leaf devices.
//!
//! A leaf is a plain file (or block device node) addressed with
//! positional reads and writes; `flush` maps to fdatasync. Device-region
//! addressing is absolute; the vdev layer translates DVA offsets past
//! the front labels before calling in here.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use crate::config::Tunables;
use crate::label::{LABEL_END_SIZE, LABEL_START_SIZE};
use crate::vdev::queue::VdevQueue;

pub struct FileLeaf {
    path: PathBuf,
    file: RwLock<Option<File>>,
    dev_size: AtomicU64,
    pub queue: VdevQueue,
}

impl FileLeaf {
    pub fn new(path: &Path, tunables: &Tunables) -> Self {
        FileLeaf {
            path: path.to_path_buf(),
            file: RwLock::new(None),
            dev_size: AtomicU64::new(0),
            queue: VdevQueue::new(tunables),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the backing file; returns (usable bytes, device bytes).
    pub fn open(&self) -> io::Result<(u64, u64)> {
        let file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let dev_size = file.metadata()?.len();
        let min = LABEL_START_SIZE + LABEL_END_SIZE + 512;
        if dev_size < min {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("device {} smaller than {} bytes", self.path.display(), min),
            ));
        }
        self.dev_size.store(dev_size, Ordering::Release);
        *self.file.write().unwrap() = Some(file);
        Ok((dev_size - LABEL_START_SIZE - LABEL_END_SIZE, dev_size))
    }

    pub fn close(&self) {
        *self.file.write().unwrap() = None;
    }

    pub fn is_open(&self) -> bool {
        self.file.read().unwrap().is_some()
    }

    pub fn dev_size(&self) -> u64 {
        self.dev_size.load(Ordering::Acquire)
    }

    fn with_file<T>(&self, f: impl FnOnce(&File) -> io::Result<T>) -> io::Result<T> {
        let guard = self.file.read().unwrap();
        match guard.as_ref() {
            Some(file) => f(file),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "vdev closed")),
        }
    }

    /// Positional read at an absolute device offset.
    pub fn raw_read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        self.with_file(|file| {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok(buf)
        })
    }

    /// Positional write at an absolute device offset.
    pub fn raw_write(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        self.with_file(|file| file.write_all_at(data, offset))
    }

    /// Push written data to stable storage.
    pub fn flush(&self) -> io::Result<()> {
        self.with_file(|file| file.sync_data())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn scratch(len: u64) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leaf");
        let mut f = File::create(&path).unwrap();
        f.write_all(&vec![0u8; len as usize]).unwrap();
        (dir, path)
    }

    #[test]
    fn open_reports_usable_size() {
        let (_dir, path) = scratch(8 * 1024 * 1024);
        let leaf = FileLeaf::new(&path, &Tunables::default());
        let (usable, dev) = leaf.open().unwrap();
        assert_eq!(dev, 8 * 1024 * 1024);
        assert_eq!(usable, dev - LABEL_START_SIZE - LABEL_END_SIZE);
    }

    #[test]
    fn too_small_device_rejected() {
        let (_dir, path) = scratch(1024 * 1024);
        let leaf = FileLeaf::new(&path, &Tunables::default());
        assert!(leaf.open().is_err());
    }

    #[test]
    fn raw_io_roundtrip() {
        let (_dir, path) = scratch(4 * 1024 * 1024);
        let leaf = FileLeaf::new(&path, &Tunables::default());
        leaf.open().unwrap();
        leaf.raw_write(4096, b"hello labels").unwrap();
        leaf.flush().unwrap();
        assert_eq!(leaf.raw_read(4096, 12).unwrap(), b"hello labels");
        leaf.close();
        assert!(leaf.raw_read(0, 1).is_err());
    }
}
