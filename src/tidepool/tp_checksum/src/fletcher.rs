// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Fletcher checksums.
//!
//! Fletcher-2 runs over 64-bit word pairs with two lane accumulators.
//! Fletcher-4 runs over 32-bit words with four cascaded accumulators and
//! is the workhorse for non-dedup blocks, so it gets a backend registry:
//! a scalar reference plus multi-lane variants that trade one pass of
//! dependent adds for independent streams recombined at the end. Every
//! backend must produce bit-identical results to scalar for every input;
//! the selector benchmarks them at first use and `fastest` picks the
//! winner. The active backend can be switched at runtime by name.

use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use byteorder::{ByteOrder, LittleEndian};
use lazy_static::lazy_static;
use log::debug;

use crate::{ChecksumError, Cksum};

/// Fletcher-2, native byte order.
pub fn fletcher_2_native(data: &[u8]) -> Cksum {
    let mut a0: u64 = 0;
    let mut a1: u64 = 0;
    let mut b0: u64 = 0;
    let mut b1: u64 = 0;
    let mut chunks = data.chunks_exact(16);
    for pair in &mut chunks {
        a0 = a0.wrapping_add(LittleEndian::read_u64(&pair[0..8]));
        a1 = a1.wrapping_add(LittleEndian::read_u64(&pair[8..16]));
        b0 = b0.wrapping_add(a0);
        b1 = b1.wrapping_add(a1);
    }
    let rem = chunks.remainder();
    if rem.len() >= 8 {
        a0 = a0.wrapping_add(LittleEndian::read_u64(&rem[0..8]));
        b0 = b0.wrapping_add(a0);
    }
    Cksum([a0, a1, b0, b1])
}

/// Fletcher-2 over byte-swapped words.
pub fn fletcher_2_byteswap(data: &[u8]) -> Cksum {
    let mut a0: u64 = 0;
    let mut a1: u64 = 0;
    let mut b0: u64 = 0;
    let mut b1: u64 = 0;
    let mut chunks = data.chunks_exact(16);
    for pair in &mut chunks {
        a0 = a0.wrapping_add(LittleEndian::read_u64(&pair[0..8]).swap_bytes());
        a1 = a1.wrapping_add(LittleEndian::read_u64(&pair[8..16]).swap_bytes());
        b0 = b0.wrapping_add(a0);
        b1 = b1.wrapping_add(a1);
    }
    let rem = chunks.remainder();
    if rem.len() >= 8 {
        a0 = a0.wrapping_add(LittleEndian::read_u64(&rem[0..8]).swap_bytes());
        b0 = b0.wrapping_add(a0);
    }
    Cksum([a0, a1, b0, b1])
}

#[inline]
fn load_word(data: &[u8], byteswap: bool) -> u64 {
    let w = LittleEndian::read_u32(data);
    if byteswap {
        w.swap_bytes() as u64
    } else {
        w as u64
    }
}

fn fletcher_4_scalar(data: &[u8], byteswap: bool) -> Cksum {
    let mut a: u64 = 0;
    let mut b: u64 = 0;
    let mut c: u64 = 0;
    let mut d: u64 = 0;
    for word in data.chunks_exact(4) {
        a = a.wrapping_add(load_word(word, byteswap));
        b = b.wrapping_add(a);
        c = c.wrapping_add(b);
        d = d.wrapping_add(c);
    }
    Cksum([a, b, c, d])
}

/// Per-lane moments of the fletcher-4 recurrence: running a plain
/// fletcher-4 over a lane's word stream yields exactly
/// `(Σv, Σk·v, ΣTri(k)·v, ΣTet(k)·v)` with `k` counted from the stream
/// tail, which is what the recombination below consumes.
#[derive(Default, Clone, Copy)]
struct Lane {
    m0: u64,
    m1: u64,
    m2: u64,
    m3: u64,
}

impl Lane {
    #[inline]
    fn update(&mut self, v: u64) {
        self.m0 = self.m0.wrapping_add(v);
        self.m1 = self.m1.wrapping_add(self.m0);
        self.m2 = self.m2.wrapping_add(self.m1);
        self.m3 = self.m3.wrapping_add(self.m2);
    }
}

/// Two interleaved lanes (even/odd words), recombined with the closed-form
/// weights of the global recurrence.
fn fletcher_4_superscalar2(data: &[u8], byteswap: bool) -> Cksum {
    if data.len() % 8 != 0 {
        return fletcher_4_scalar(data, byteswap);
    }
    let mut even = Lane::default();
    let mut odd = Lane::default();
    for pair in data.chunks_exact(8) {
        even.update(load_word(&pair[0..4], byteswap));
        odd.update(load_word(&pair[4..8], byteswap));
    }
    let a = even.m0.wrapping_add(odd.m0);
    let b = even
        .m1
        .wrapping_mul(2)
        .wrapping_add(odd.m1.wrapping_mul(2))
        .wrapping_sub(odd.m0);
    let c = even
        .m2
        .wrapping_mul(4)
        .wrapping_sub(even.m1)
        .wrapping_add(odd.m2.wrapping_mul(4))
        .wrapping_sub(odd.m1.wrapping_mul(3));
    let d = even
        .m3
        .wrapping_mul(8)
        .wrapping_sub(even.m2.wrapping_mul(4))
        .wrapping_add(odd.m3.wrapping_mul(8))
        .wrapping_sub(odd.m2.wrapping_mul(8))
        .wrapping_add(odd.m1);
    Cksum([a, b, c, d])
}

/// Four interleaved lanes. Weights per lane r (k counted from the tail):
///   B: 4k - r
///   C: 16·Tri(k) - (6 + 4r)·k + Tri(r - 1)
///   D: 64·Tet(k) - (48 + 16r)·Tri(k) + (2r² + 4r + 4)·k - Tet(r - 2)
fn fletcher_4_superscalar4(data: &[u8], byteswap: bool) -> Cksum {
    if data.len() % 16 != 0 {
        return fletcher_4_scalar(data, byteswap);
    }
    let mut lanes = [Lane::default(); 4];
    for quad in data.chunks_exact(16) {
        for r in 0..4 {
            lanes[r].update(load_word(&quad[r * 4..r * 4 + 4], byteswap));
        }
    }
    const C_M0: [u64; 4] = [0, 0, 1, 3]; // Tri(r - 1)
    const D_M1: [u64; 4] = [4, 10, 20, 34]; // 2r² + 4r + 4
    const D_M0: [u64; 4] = [0, 0, 0, 1]; // Tet(r - 2)
    let mut a: u64 = 0;
    let mut b: u64 = 0;
    let mut c: u64 = 0;
    let mut d: u64 = 0;
    for (r, lane) in lanes.iter().enumerate() {
        let r64 = r as u64;
        a = a.wrapping_add(lane.m0);
        b = b
            .wrapping_add(lane.m1.wrapping_mul(4))
            .wrapping_sub(lane.m0.wrapping_mul(r64));
        c = c
            .wrapping_add(lane.m2.wrapping_mul(16))
            .wrapping_sub(lane.m1.wrapping_mul(6 + 4 * r64))
            .wrapping_add(lane.m0.wrapping_mul(C_M0[r]));
        d = d
            .wrapping_add(lane.m3.wrapping_mul(64))
            .wrapping_sub(lane.m2.wrapping_mul(48 + 16 * r64))
            .wrapping_add(lane.m1.wrapping_mul(D_M1[r]))
            .wrapping_sub(lane.m0.wrapping_mul(D_M0[r]));
    }
    Cksum([a, b, c, d])
}

/// One fletcher-4 backend: a name plus an entry point taking the
/// byteswap flag.
pub struct Fletcher4Backend {
    pub name: &'static str,
    pub native: fn(&[u8], bool) -> Cksum,
}

static BACKENDS: &[Fletcher4Backend] = &[
    Fletcher4Backend { name: "scalar", native: fletcher_4_scalar },
    Fletcher4Backend { name: "superscalar2", native: fletcher_4_superscalar2 },
    Fletcher4Backend { name: "superscalar4", native: fletcher_4_superscalar4 },
];

struct Selected {
    backend: &'static Fletcher4Backend,
}

lazy_static! {
    static ref BENCH_RESULTS: Vec<(&'static str, u64)> = run_benchmark();
    static ref CURRENT: ArcSwap<Selected> = {
        // Fastest-by-benchmark is the boot default.
        let winner = BENCH_RESULTS
            .iter()
            .max_by_key(|(_, bps)| *bps)
            .map(|(name, _)| *name)
            .unwrap_or("scalar");
        let backend = BACKENDS.iter().find(|b| b.name == winner).unwrap();
        debug!("fletcher4: selected '{}' backend", backend.name);
        ArcSwap::from(Arc::new(Selected { backend }))
    };
}

const BENCH_BUF_SIZE: usize = 64 * 1024;
const BENCH_ITERS: u32 = 16;

fn run_benchmark() -> Vec<(&'static str, u64)> {
    let buf: Vec<u8> = (0..BENCH_BUF_SIZE).map(|i| (i * 31) as u8).collect();
    BACKENDS
        .iter()
        .map(|b| {
            let start = Instant::now();
            let mut sink = 0u64;
            for _ in 0..BENCH_ITERS {
                sink = sink.wrapping_add((b.native)(&buf, false).0[0]);
            }
            let nanos = start.elapsed().as_nanos().max(1) as u64;
            // Defeat dead-code elimination of the loop above.
            std::sync::atomic::compiler_fence(std::sync::atomic::Ordering::SeqCst);
            let _ = sink;
            let bytes = (BENCH_BUF_SIZE as u64) * u64::from(BENCH_ITERS);
            (b.name, bytes.saturating_mul(1_000_000_000) / nanos)
        })
        .collect()
}

/// Benchmark results as `(impl name, bytes/sec)`, for stats surfaces.
pub fn fletcher_4_benchmark_results() -> &'static [(&'static str, u64)] {
    &BENCH_RESULTS
}

pub fn fletcher_4_impl_names() -> Vec<&'static str> {
    let mut names = vec!["fastest"];
    names.extend(BACKENDS.iter().map(|b| b.name));
    names
}

/// Switch the active fletcher-4 backend (`zfs_fletcher_4_impl`).
pub fn fletcher_4_select(name: &str) -> Result<(), ChecksumError> {
    let target = if name == "fastest" {
        BENCH_RESULTS
            .iter()
            .max_by_key(|(_, bps)| *bps)
            .map(|(n, _)| *n)
            .unwrap_or("scalar")
    } else {
        name
    };
    match BACKENDS.iter().find(|b| b.name == target) {
        Some(backend) => {
            CURRENT.store(Arc::new(Selected { backend }));
            Ok(())
        }
        None => Err(ChecksumError::UnknownImpl(name.to_string())),
    }
}

/// Fletcher-4 through the active backend.
pub fn fletcher_4(data: &[u8], byteswap: bool) -> Cksum {
    let sel = CURRENT.load();
    (sel.backend.native)(data, byteswap)
}

/// Always-scalar fletcher-4, the reference the others are tested against.
pub fn fletcher_4_reference(data: &[u8], byteswap: bool) -> Cksum {
    fletcher_4_scalar(data, byteswap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use rstest::rstest;

    fn random_buf(len: usize, seed: u64) -> Vec<u8> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut buf = vec![0u8; len];
        rng.fill_bytes(&mut buf);
        buf
    }

    #[rstest]
    #[case("superscalar2")]
    #[case("superscalar4")]
    fn backend_matches_scalar(#[case] name: &str) {
        let backend = BACKENDS.iter().find(|b| b.name == name).unwrap();
        for (len, seed) in &[(0usize, 1u64), (4, 2), (12, 3), (512, 4), (4096, 5), (65536, 6), (131072, 7)] {
            let buf = random_buf(*len, *seed);
            assert_eq!(
                (backend.native)(&buf, false),
                fletcher_4_scalar(&buf, false),
                "{} native diverged at len {}",
                name,
                len
            );
            assert_eq!(
                (backend.native)(&buf, true),
                fletcher_4_scalar(&buf, true),
                "{} byteswap diverged at len {}",
                name,
                len
            );
        }
    }

    #[test]
    fn byteswap_matches_scalar_of_swapped_input() {
        let buf = random_buf(8192, 99);
        let mut swapped = buf.clone();
        for w in swapped.chunks_exact_mut(4) {
            w.reverse();
        }
        assert_eq!(
            fletcher_4_scalar(&buf, true),
            fletcher_4_scalar(&swapped, false)
        );
    }

    #[test]
    fn select_by_name() {
        fletcher_4_select("scalar").unwrap();
        let buf = random_buf(1024, 11);
        let a = fletcher_4(&buf, false);
        fletcher_4_select("superscalar4").unwrap();
        assert_eq!(fletcher_4(&buf, false), a);
        fletcher_4_select("fastest").unwrap();
        assert_eq!(fletcher_4(&buf, false), a);
        assert!(fletcher_4_select("avx1024").is_err());
    }

    #[test]
    fn benchmark_covers_all_backends() {
        let results = fletcher_4_benchmark_results();
        assert_eq!(results.len(), BACKENDS.len());
        assert!(results.iter().all(|(_, bps)| *bps > 0));
    }

    #[test]
    fn fletcher2_known_value() {
        // One 16-byte pair: a0 = 1, a1 = 2, b0 = 1, b1 = 2.
        let mut buf = [0u8; 16];
        buf[0] = 1;
        buf[8] = 2;
        assert_eq!(fletcher_2_native(&buf), Cksum([1, 2, 1, 2]));
    }
}
