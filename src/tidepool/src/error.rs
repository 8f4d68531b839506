// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Engine error taxonomy.
//!
//! [`IoErr`] is the compact per-I/O kind that flows through the pipeline
//! and aggregates worst-of across children; [`Error`] is the rich error
//! surfaced by engine entry points.

use thiserror::Error;

/// The pipeline-level error kind. Ordered by severity: when several
/// children fail, the worst survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoErr {
    /// Device-level failure.
    Io,
    /// Data read back but failed its checksum.
    Checksum,
    /// Allocation failed.
    NoSpace,
    /// AEAD authentication failure; never retried, never healed.
    Auth,
    /// Pool is suspended and `failmode=continue`.
    Suspended,
}

impl std::fmt::Display for IoErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IoErr::Io => "I/O error",
            IoErr::Checksum => "checksum error",
            IoErr::NoSpace => "out of space",
            IoErr::Auth => "authentication error",
            IoErr::Suspended => "pool suspended",
        };
        f.write_str(s)
    }
}

impl IoErr {
    /// Worst-of combination used when propagating child errors.
    pub fn worst(a: Option<IoErr>, b: Option<IoErr>) -> Option<IoErr> {
        match (a, b) {
            (None, x) => x,
            (x, None) => x,
            (Some(x), Some(y)) => Some(x.max(y)),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o pipeline error: {0}")]
    Zio(IoErr),
    #[error("device error: {0}")]
    Device(#[from] std::io::Error),
    #[error("no such dataset '{0}'")]
    NoSuchDataset(String),
    #[error("dataset '{0}' already exists")]
    DatasetExists(String),
    #[error("no such object {0}")]
    NoSuchObject(u64),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("pool '{0}' cannot be opened: {1}")]
    CannotOpen(String, &'static str),
    #[error("pool is suspended")]
    Suspended,
    #[error("pool is busy: {0}")]
    Busy(&'static str),
    #[error("pool appears active on another host (mmp)")]
    ActiveOtherHost,
    #[error("out of space")]
    NoSpace,
    #[error("quota exceeded")]
    QuotaExceeded,
    #[error("label: {0}")]
    Label(&'static str),
    #[error("intent log: {0}")]
    Zil(&'static str),
    #[error("checksum: {0}")]
    Checksum(#[from] tp_checksum::ChecksumError),
    #[error("compress: {0}")]
    Compress(#[from] tp_compress::CompressError),
    #[error("crypto: {0}")]
    Crypto(#[from] tp_crypto::CryptoError),
    #[error("allocator: {0}")]
    Allocator(#[from] tp_allocator::Error),
}

impl From<IoErr> for Error {
    fn from(e: IoErr) -> Self {
        match e {
            IoErr::NoSpace => Error::NoSpace,
            IoErr::Suspended => Error::Suspended,
            other => Error::Zio(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worst_of_ordering() {
        assert_eq!(IoErr::worst(None, None), None);
        assert_eq!(IoErr::worst(Some(IoErr::Io), None), Some(IoErr::Io));
        assert_eq!(
            IoErr::worst(Some(IoErr::Io), Some(IoErr::Checksum)),
            Some(IoErr::Checksum)
        );
        assert_eq!(
            IoErr::worst(Some(IoErr::NoSpace), Some(IoErr::Checksum)),
            Some(IoErr::NoSpace)
        );
    }
}
