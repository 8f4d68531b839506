// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Checksum providers for the tidepool storage engine.
//!
//! Every block carries a 256-bit checksum (or, for protected blocks, a
//! MAC that lives in the same space). The checksum function is selected
//! by an 8-bit id in the block pointer; this crate owns the id table, the
//! algorithms, and the runtime-switchable fletcher-4 backend registry.
//!
//! Blocks that must be self-describing (labels, gang headers, intent-log
//! blocks) use the embedded scheme: a trailer inside the block holds the
//! checksum, and a caller-supplied verifier (device offset or log
//! sequence) is folded into the computation so a block can never verify
//! at the wrong location.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

pub mod fletcher;
mod sha;

pub use fletcher::{
    fletcher_4_benchmark_results, fletcher_4_impl_names, fletcher_4_select, Fletcher4Backend,
};

/// Width of an encoded checksum, in bytes.
pub const CKSUM_BYTES: usize = 32;

/// Magic for embedded checksum trailers ("tidecksm", sort of).
pub const ECK_MAGIC: u64 = 0x0210da7ab10c_cc00;

/// Size of an encoded [`EckTrailer`].
pub const ECK_SIZE: usize = 40;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("unknown checksum id {0}")]
    UnknownId(u8),
    #[error("checksum id {0:?} cannot be computed directly")]
    NotComputable(ChecksumId),
    #[error("unknown fletcher4 implementation '{0}'")]
    UnknownImpl(String),
    #[error("embedded checksum trailer magic mismatch")]
    BadTrailer,
    #[error("checksum mismatch")]
    Mismatch,
}

/// A 256-bit checksum as four little-endian words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, PartialOrd, Ord)]
pub struct Cksum(pub [u64; 4]);

impl Cksum {
    pub fn is_zero(&self) -> bool {
        self.0 == [0; 4]
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= CKSUM_BYTES);
        for (i, w) in self.0.iter().enumerate() {
            LittleEndian::write_u64(&mut buf[i * 8..i * 8 + 8], *w);
        }
    }

    pub fn decode(buf: &[u8]) -> Self {
        debug_assert!(buf.len() >= CKSUM_BYTES);
        let mut words = [0u64; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = LittleEndian::read_u64(&buf[i * 8..i * 8 + 8]);
        }
        Cksum(words)
    }
}

impl std::fmt::Display for Cksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:016x}:{:016x}:{:016x}:{:016x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// On-disk checksum function ids. The numeric values are persisted in
/// block pointers and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ChecksumId {
    Inherit = 0,
    On = 1,
    Off = 2,
    Label = 3,
    GangHeader = 4,
    Zilog = 5,
    Fletcher2 = 6,
    Fletcher4 = 7,
    Sha256 = 8,
}

impl ChecksumId {
    pub fn from_u8(v: u8) -> Result<Self, ChecksumError> {
        Ok(match v {
            0 => ChecksumId::Inherit,
            1 => ChecksumId::On,
            2 => ChecksumId::Off,
            3 => ChecksumId::Label,
            4 => ChecksumId::GangHeader,
            5 => ChecksumId::Zilog,
            6 => ChecksumId::Fletcher2,
            7 => ChecksumId::Fletcher4,
            8 => ChecksumId::Sha256,
            other => return Err(ChecksumError::UnknownId(other)),
        })
    }

    /// The function actually used once `On`/`Inherit` are resolved.
    pub fn resolve(self) -> Self {
        match self {
            ChecksumId::On | ChecksumId::Inherit => ChecksumId::Fletcher4,
            other => other,
        }
    }
}

/// Static description of one checksum function.
pub struct ChecksumInfo {
    pub id: ChecksumId,
    pub name: &'static str,
    /// Uses the in-block trailer scheme.
    pub embedded: bool,
    /// Strong enough to key deduplication.
    pub dedup_ok: bool,
    /// Acceptable for metadata blocks.
    pub metadata_ok: bool,
}

static CHECKSUM_TABLE: &[ChecksumInfo] = &[
    ChecksumInfo { id: ChecksumId::Inherit, name: "inherit", embedded: false, dedup_ok: false, metadata_ok: false },
    ChecksumInfo { id: ChecksumId::On, name: "on", embedded: false, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::Off, name: "off", embedded: false, dedup_ok: false, metadata_ok: false },
    ChecksumInfo { id: ChecksumId::Label, name: "label", embedded: true, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::GangHeader, name: "gang_header", embedded: true, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::Zilog, name: "zilog", embedded: true, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::Fletcher2, name: "fletcher2", embedded: false, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::Fletcher4, name: "fletcher4", embedded: false, dedup_ok: false, metadata_ok: true },
    ChecksumInfo { id: ChecksumId::Sha256, name: "sha256", embedded: false, dedup_ok: true, metadata_ok: true },
];

pub fn checksum_info(id: ChecksumId) -> &'static ChecksumInfo {
    &CHECKSUM_TABLE[id as usize]
}

/// Compute a checksum over `data`. `byteswap` is set when the block was
/// written by a peer of the opposite byte order.
pub fn compute(id: ChecksumId, data: &[u8], byteswap: bool) -> Result<Cksum, ChecksumError> {
    match id.resolve() {
        ChecksumId::Fletcher2 => Ok(if byteswap {
            fletcher::fletcher_2_byteswap(data)
        } else {
            fletcher::fletcher_2_native(data)
        }),
        ChecksumId::Fletcher4 | ChecksumId::Label | ChecksumId::GangHeader | ChecksumId::Zilog => {
            Ok(fletcher::fletcher_4(data, byteswap))
        }
        ChecksumId::Sha256 => Ok(sha::sha256(data)),
        ChecksumId::Off => Ok(Cksum::default()),
        other => Err(ChecksumError::NotComputable(other)),
    }
}

/// The embedded trailer: magic plus the stored checksum. The verifier is
/// not stored; it is reproduced by the reader from context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EckTrailer {
    pub magic: u64,
    pub cksum: Cksum,
}

impl EckTrailer {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= ECK_SIZE);
        LittleEndian::write_u64(&mut buf[0..8], self.magic);
        self.cksum.encode(&mut buf[8..ECK_SIZE]);
    }

    pub fn decode(buf: &[u8]) -> Self {
        EckTrailer {
            magic: LittleEndian::read_u64(&buf[0..8]),
            cksum: Cksum::decode(&buf[8..ECK_SIZE]),
        }
    }
}

/// Checksum `data` in place for an embedded-trailer block. The trailer
/// lives at `eck_off`; `verifier` is folded in by seeding the trailer's
/// checksum slot before computing over the whole block.
pub fn embedded_generate(
    id: ChecksumId,
    data: &mut [u8],
    eck_off: usize,
    verifier: Cksum,
) -> Result<(), ChecksumError> {
    debug_assert!(checksum_info(id.resolve()).embedded || id.resolve() == ChecksumId::Fletcher4);
    EckTrailer {
        magic: ECK_MAGIC,
        cksum: verifier,
    }
    .encode(&mut data[eck_off..eck_off + ECK_SIZE]);
    let cksum = compute(id, data, false)?;
    cksum.encode(&mut data[eck_off + 8..eck_off + ECK_SIZE]);
    Ok(())
}

/// Verify an embedded-trailer block; `data` is restored before returning.
pub fn embedded_verify(
    id: ChecksumId,
    data: &mut [u8],
    eck_off: usize,
    verifier: Cksum,
) -> Result<(), ChecksumError> {
    let trailer = EckTrailer::decode(&data[eck_off..eck_off + ECK_SIZE]);
    if trailer.magic != ECK_MAGIC {
        return Err(ChecksumError::BadTrailer);
    }
    verifier.encode(&mut data[eck_off + 8..eck_off + ECK_SIZE]);
    let actual = compute(id, data, false)?;
    trailer.cksum.encode(&mut data[eck_off + 8..eck_off + ECK_SIZE]);
    if actual == trailer.cksum {
        Ok(())
    } else {
        Err(ChecksumError::Mismatch)
    }
}

/// Big-endian word view used by SHA-256 (the digest is big-endian by
/// definition; keeping the words BE makes the stored value match other
/// tools' renderings).
pub(crate) fn cksum_from_be_bytes(digest: &[u8]) -> Cksum {
    let mut words = [0u64; 4];
    for (i, w) in words.iter_mut().enumerate() {
        *w = BigEndian::read_u64(&digest[i * 8..i * 8 + 8]);
    }
    Cksum(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cksum_codec_roundtrip() {
        let c = Cksum([1, u64::MAX, 0xdead_beef, 42]);
        let mut buf = [0u8; CKSUM_BYTES];
        c.encode(&mut buf);
        assert_eq!(Cksum::decode(&buf), c);
    }

    #[test]
    fn id_roundtrip_and_resolve() {
        for raw in 0..=8u8 {
            let id = ChecksumId::from_u8(raw).unwrap();
            assert_eq!(id as u8, raw);
        }
        assert!(ChecksumId::from_u8(200).is_err());
        assert_eq!(ChecksumId::On.resolve(), ChecksumId::Fletcher4);
    }

    #[test]
    fn checksum_is_pure() {
        let data = vec![0xa5u8; 4096];
        let a = compute(ChecksumId::Fletcher4, &data, false).unwrap();
        let b = compute(ChecksumId::Fletcher4, &data, false).unwrap();
        assert_eq!(a, b);
        let c = compute(ChecksumId::Sha256, &data, false).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn embedded_roundtrip_and_wrong_verifier() {
        let mut block = vec![0x5au8; 1024];
        let eck_off = block.len() - ECK_SIZE;
        let verifier = Cksum([7, 0, 0, 0]);
        embedded_generate(ChecksumId::Zilog, &mut block, eck_off, verifier).unwrap();
        embedded_verify(ChecksumId::Zilog, &mut block, eck_off, verifier).unwrap();
        // A block claiming a different sequence must not verify.
        assert_eq!(
            embedded_verify(ChecksumId::Zilog, &mut block, eck_off, Cksum([8, 0, 0, 0])),
            Err(ChecksumError::Mismatch)
        );
        // And it must still verify at the right one afterwards.
        embedded_verify(ChecksumId::Zilog, &mut block, eck_off, verifier).unwrap();
    }

    #[test]
    fn embedded_detects_corruption() {
        let mut block = vec![0u8; 512];
        let eck_off = block.len() - ECK_SIZE;
        embedded_generate(ChecksumId::Label, &mut block, eck_off, Cksum::default()).unwrap();
        block[3] ^= 0x40;
        assert_eq!(
            embedded_verify(ChecksumId::Label, &mut block, eck_off, Cksum::default()),
            Err(ChecksumError::Mismatch)
        );
    }
}
