// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Block compression providers.
//!
//! The compression function is selected by a 7-bit id in the block
//! pointer. A compressor only "wins" when it saves at least one eighth of
//! the logical size; otherwise the block is stored uncompressed and the
//! id in the block pointer says so. All-zero blocks are detected up front
//! and stored as holes by the caller (`Empty`).

use std::io::{Read, Write};

use thiserror::Error;

mod lzjb;
mod zle;

pub use lzjb::{lzjb_compress, lzjb_decompress};
pub use zle::{zle_compress, zle_decompress};

#[derive(Error, Debug)]
pub enum CompressError {
    #[error("unknown compression id {0}")]
    UnknownId(u8),
    #[error("corrupt {0} stream")]
    Corrupt(&'static str),
    #[error("decompressed length {got}, expected {want}")]
    BadLength { got: usize, want: usize },
    #[error("gzip: {0}")]
    Gzip(#[from] std::io::Error),
}

/// On-disk compression ids; persisted in block pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CompressId {
    Inherit = 0,
    On = 1,
    Off = 2,
    Lzjb = 3,
    Empty = 4,
    Gzip1 = 5,
    Gzip2 = 6,
    Gzip3 = 7,
    Gzip4 = 8,
    Gzip5 = 9,
    Gzip6 = 10,
    Gzip7 = 11,
    Gzip8 = 12,
    Gzip9 = 13,
    Zle = 14,
}

impl CompressId {
    pub fn from_u8(v: u8) -> Result<Self, CompressError> {
        Ok(match v {
            0 => CompressId::Inherit,
            1 => CompressId::On,
            2 => CompressId::Off,
            3 => CompressId::Lzjb,
            4 => CompressId::Empty,
            5 => CompressId::Gzip1,
            6 => CompressId::Gzip2,
            7 => CompressId::Gzip3,
            8 => CompressId::Gzip4,
            9 => CompressId::Gzip5,
            10 => CompressId::Gzip6,
            11 => CompressId::Gzip7,
            12 => CompressId::Gzip8,
            13 => CompressId::Gzip9,
            14 => CompressId::Zle,
            other => return Err(CompressError::UnknownId(other)),
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressId::Inherit => "inherit",
            CompressId::On => "on",
            CompressId::Off => "off",
            CompressId::Lzjb => "lzjb",
            CompressId::Empty => "empty",
            CompressId::Gzip1 => "gzip-1",
            CompressId::Gzip2 => "gzip-2",
            CompressId::Gzip3 => "gzip-3",
            CompressId::Gzip4 => "gzip-4",
            CompressId::Gzip5 => "gzip-5",
            CompressId::Gzip6 => "gzip-6",
            CompressId::Gzip7 => "gzip-7",
            CompressId::Gzip8 => "gzip-8",
            CompressId::Gzip9 => "gzip-9",
            CompressId::Zle => "zle",
        }
    }

    /// The function used once `On`/`Inherit` are resolved.
    pub fn resolve(self) -> Self {
        match self {
            CompressId::On | CompressId::Inherit => CompressId::Lzjb,
            other => other,
        }
    }

    fn gzip_level(self) -> Option<u32> {
        let v = self as u8;
        if (CompressId::Gzip1 as u8..=CompressId::Gzip9 as u8).contains(&v) {
            Some(u32::from(v - CompressId::Gzip1 as u8) + 1)
        } else {
            None
        }
    }
}

pub fn is_all_zero(data: &[u8]) -> bool {
    data.iter().all(|b| *b == 0)
}

/// Minimum savings for compression to be worth it: one eighth.
fn max_compressed_len(lsize: usize) -> usize {
    lsize - (lsize >> 3)
}

/// Compress `src`. Returns `None` when the data did not shrink enough
/// and must be stored uncompressed.
pub fn compress(id: CompressId, src: &[u8]) -> Result<Option<Vec<u8>>, CompressError> {
    let id = id.resolve();
    let limit = max_compressed_len(src.len());
    let out = match id {
        CompressId::Off | CompressId::Empty => return Ok(None),
        CompressId::Lzjb => lzjb_compress(src, limit),
        CompressId::Zle => zle_compress(src, limit),
        _ => {
            let level = id.gzip_level().ok_or(CompressError::UnknownId(id as u8))?;
            let mut enc = flate2::write::ZlibEncoder::new(
                Vec::with_capacity(limit),
                flate2::Compression::new(level),
            );
            enc.write_all(src)?;
            let buf = enc.finish()?;
            if buf.len() <= limit {
                Some(buf)
            } else {
                None
            }
        }
    };
    Ok(out)
}

/// Decompress `src` into exactly `lsize` bytes.
pub fn decompress(id: CompressId, src: &[u8], lsize: usize) -> Result<Vec<u8>, CompressError> {
    match id.resolve() {
        CompressId::Off => Ok(src.to_vec()),
        CompressId::Empty => Ok(vec![0u8; lsize]),
        CompressId::Lzjb => lzjb_decompress(src, lsize),
        CompressId::Zle => zle_decompress(src, lsize),
        id => {
            id.gzip_level().ok_or(CompressError::UnknownId(id as u8))?;
            let mut out = Vec::with_capacity(lsize);
            let mut dec = flate2::read::ZlibDecoder::new(src);
            dec.read_to_end(&mut out)?;
            if out.len() != lsize {
                return Err(CompressError::BadLength {
                    got: out.len(),
                    want: lsize,
                });
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn compressible(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i / 64) % 7) as u8).collect()
    }

    #[test]
    fn id_roundtrip() {
        for raw in 0..=14u8 {
            assert_eq!(CompressId::from_u8(raw).unwrap() as u8, raw);
        }
        assert!(CompressId::from_u8(99).is_err());
    }

    #[test]
    fn compressible_data_roundtrips() {
        let src = compressible(16 * 1024);
        for id in &[CompressId::Lzjb, CompressId::Gzip1, CompressId::Gzip6, CompressId::Gzip9] {
            let out = compress(*id, &src).unwrap().expect("should compress");
            assert!(out.len() <= max_compressed_len(src.len()));
            assert_eq!(decompress(*id, &out, src.len()).unwrap(), src, "{:?}", id);
        }
    }

    #[test]
    fn incompressible_data_declined() {
        let mut rng = StdRng::seed_from_u64(0xc0ffee);
        let mut src = vec![0u8; 8192];
        rng.fill_bytes(&mut src);
        assert!(compress(CompressId::Lzjb, &src).unwrap().is_none());
        assert!(compress(CompressId::Gzip9, &src).unwrap().is_none());
    }

    #[test]
    fn zle_handles_zero_runs() {
        let mut src = vec![0u8; 4096];
        src[100] = 0xaa;
        src[2000..2010].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        let out = compress(CompressId::Zle, &src).unwrap().expect("zle wins on zeros");
        assert!(out.len() < src.len() / 4);
        assert_eq!(decompress(CompressId::Zle, &out, src.len()).unwrap(), src);
    }

    #[test]
    fn zero_detection() {
        assert!(is_all_zero(&[0u8; 512]));
        let mut buf = [0u8; 512];
        buf[511] = 1;
        assert!(!is_all_zero(&buf));
    }

    #[test]
    fn on_resolves_to_lzjb() {
        assert_eq!(CompressId::On.resolve(), CompressId::Lzjb);
        let src = compressible(4096);
        let via_on = compress(CompressId::On, &src).unwrap().unwrap();
        assert_eq!(decompress(CompressId::Lzjb, &via_on, src.len()).unwrap(), src);
    }
}
