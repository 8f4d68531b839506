// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! RAID-Z parity math and column maps.
//!
//! Parity is generated row-major over 64-bit words: P is plain XOR, Q
//! accumulates with a GF(2^8) multiply-by-2 per column step, R with
//! multiply-by-4. The 64-bit multiply operates on eight packed GF bytes
//! at once. Reconstruction uses XOR for a single data column under P,
//! and log/exp-table Vandermonde elimination for a column under Q or a
//! pair under P+Q. The scalar routines here are the reference backend;
//! alternates must match them bit-for-bit for every alignment.

use once_cell::sync::Lazy;

use crate::error::IoErr;

/// Packed GF(2^8) multiply-by-2 of eight bytes (polynomial 0x11d).
#[inline]
pub fn gf64_mul2(mut x: u64) -> u64 {
    let mut mask = x & 0x8080_8080_8080_8080;
    mask = (mask << 1).wrapping_sub(mask >> 7);
    x = ((x << 1) & 0xfefe_fefe_fefe_fefe) ^ (mask & 0x1d1d_1d1d_1d1d_1d1d);
    x
}

/// Packed GF(2^8) multiply-by-4.
#[inline]
pub fn gf64_mul4(x: u64) -> u64 {
    gf64_mul2(gf64_mul2(x))
}

struct GfTables {
    log: [u8; 256],
    exp: [u8; 512],
}

static GF: Lazy<GfTables> = Lazy::new(|| {
    let mut tables = GfTables {
        log: [0; 256],
        exp: [0; 512],
    };
    let mut x: u8 = 1;
    for i in 0..255usize {
        tables.exp[i] = x;
        tables.exp[i + 255] = x;
        tables.log[x as usize] = i as u8;
        // x *= 2 in GF(2^8)/0x11d.
        let hi = x & 0x80 != 0;
        x <<= 1;
        if hi {
            x ^= 0x1d;
        }
    }
    tables
});

#[inline]
fn gf_mul(a: u8, b: u8) -> u8 {
    if a == 0 || b == 0 {
        return 0;
    }
    GF.exp[GF.log[a as usize] as usize + GF.log[b as usize] as usize]
}

#[inline]
fn gf_div(a: u8, b: u8) -> u8 {
    debug_assert!(b != 0);
    if a == 0 {
        return 0;
    }
    GF.exp[255 + GF.log[a as usize] as usize - GF.log[b as usize] as usize]
}

#[inline]
fn gf_pow2(e: usize) -> u8 {
    GF.exp[e % 255]
}

fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= *s;
    }
}

/// One word-at-a-time pass: `q = mul2(q) ^ data`.
fn q_step(q: &mut [u8], data: &[u8]) {
    debug_assert_eq!(q.len() % 8, 0);
    for (qw, dw) in q.chunks_exact_mut(8).zip(data.chunks_exact(8)) {
        let mut w = u64::from_le_bytes([qw[0], qw[1], qw[2], qw[3], qw[4], qw[5], qw[6], qw[7]]);
        w = gf64_mul2(w);
        let d = u64::from_le_bytes([dw[0], dw[1], dw[2], dw[3], dw[4], dw[5], dw[6], dw[7]]);
        w ^= d;
        qw.copy_from_slice(&w.to_le_bytes());
    }
}

fn r_step(r: &mut [u8], data: &[u8]) {
    for (rw, dw) in r.chunks_exact_mut(8).zip(data.chunks_exact(8)) {
        let mut w = u64::from_le_bytes([rw[0], rw[1], rw[2], rw[3], rw[4], rw[5], rw[6], rw[7]]);
        w = gf64_mul4(w);
        let d = u64::from_le_bytes([dw[0], dw[1], dw[2], dw[3], dw[4], dw[5], dw[6], dw[7]]);
        w ^= d;
        rw.copy_from_slice(&w.to_le_bytes());
    }
}

/// Generate parity columns for one row. `data[0]` is the first data
/// column; columns are all `colsize` bytes. Returns `nparity` columns.
///
/// Q and R accumulate in reverse column order, so the coefficient of
/// data column `i` (0-based) ends up `2^(n-1-i)` / `4^(n-1-i)`.
pub fn generate_parity(data: &[Vec<u8>], nparity: usize) -> Vec<Vec<u8>> {
    debug_assert!(!data.is_empty());
    let colsize = data[0].len();
    let mut parity = vec![vec![0u8; colsize]; nparity];
    for col in data.iter() {
        debug_assert_eq!(col.len(), colsize);
        if nparity >= 1 {
            xor_into(&mut parity[0], col);
        }
        if nparity >= 2 {
            q_step(&mut parity[1], col);
        }
        if nparity >= 3 {
            r_step(&mut parity[2], col);
        }
    }
    parity
}

/// Reconstruct a single missing data column from P.
pub fn reconstruct_p(
    data: &[Option<Vec<u8>>],
    p: &[u8],
    missing: usize,
) -> Result<Vec<u8>, IoErr> {
    let mut out = p.to_vec();
    for (i, col) in data.iter().enumerate() {
        if i == missing {
            continue;
        }
        let col = col.as_ref().ok_or(IoErr::Io)?;
        xor_into(&mut out, col);
    }
    Ok(out)
}

/// Reconstruct a single missing data column from Q alone (P lost too).
pub fn reconstruct_q(
    data: &[Option<Vec<u8>>],
    q: &[u8],
    missing: usize,
) -> Result<Vec<u8>, IoErr> {
    let n = data.len();
    // Recompute Q with the missing column as zeros, then divide out the
    // coefficient.
    let mut partial = vec![0u8; q.len()];
    for (i, col) in data.iter().enumerate() {
        let zeros;
        let col: &[u8] = match col {
            Some(c) => c,
            None if i == missing => {
                zeros = vec![0u8; q.len()];
                &zeros
            }
            None => return Err(IoErr::Io),
        };
        q_step(&mut partial, col);
    }
    let coeff = gf_pow2(n - 1 - missing);
    let mut out = vec![0u8; q.len()];
    for i in 0..q.len() {
        out[i] = gf_div(q[i] ^ partial[i], coeff);
    }
    Ok(out)
}

/// Reconstruct two missing data columns from P and Q.
pub fn reconstruct_pq(
    data: &[Option<Vec<u8>>],
    p: &[u8],
    q: &[u8],
    x: usize,
    y: usize,
) -> Result<(Vec<u8>, Vec<u8>), IoErr> {
    debug_assert!(x < y);
    let n = data.len();
    let colsize = p.len();
    // Parity of the surviving columns.
    let mut pxy = vec![0u8; colsize];
    let mut qxy = vec![0u8; colsize];
    for (i, col) in data.iter().enumerate() {
        let zeros;
        let col: &[u8] = match col {
            Some(c) => c,
            None if i == x || i == y => {
                zeros = vec![0u8; colsize];
                &zeros
            }
            None => return Err(IoErr::Io),
        };
        if i != x && i != y {
            xor_into(&mut pxy, col);
        }
        q_step(&mut qxy, col);
    }
    // P ^ pxy = Dx ^ Dy;  Q ^ qxy = cx*Dx ^ cy*Dy.
    let cx = gf_pow2(n - 1 - x);
    let cy = gf_pow2(n - 1 - y);
    let denom = cx ^ cy;
    if denom == 0 {
        return Err(IoErr::Io);
    }
    let mut dx = vec![0u8; colsize];
    let mut dy = vec![0u8; colsize];
    for i in 0..colsize {
        let pd = p[i] ^ pxy[i];
        let qd = q[i] ^ qxy[i];
        // Dx = (Q' ^ cy*P') / (cx ^ cy)
        let xi = gf_div(qd ^ gf_mul(cy, pd), denom);
        dx[i] = xi;
        dy[i] = pd ^ xi;
    }
    Ok((dx, dy))
}

/// How a logical extent lays out across a raidz group.
///
/// The logical (DVA) space of a raidz top-level covers only data bytes;
/// each row of `ndata` columns carries `nparity` parity columns ahead of
/// it on disk. Columns are one allocation unit (`1 << ashift`) wide.
#[derive(Debug, Clone)]
pub struct RaidzMap {
    pub unit: u64,
    pub nparity: usize,
    pub ncols: usize,
    /// First row index touched.
    pub first_row: u64,
    pub nrows: u64,
}

impl RaidzMap {
    pub fn new(offset: u64, len: u64, ashift: u32, ncols: usize, nparity: usize) -> Self {
        let unit = 1u64 << ashift;
        let ndata = (ncols - nparity) as u64;
        debug_assert_eq!(offset % unit, 0);
        debug_assert_eq!(len % unit, 0);
        let first_row = offset / (ndata * unit);
        let last = (offset + len - 1) / (ndata * unit);
        RaidzMap {
            unit,
            nparity,
            ncols,
            first_row,
            nrows: last - first_row + 1,
        }
    }

    pub fn ndata(&self) -> usize {
        self.ncols - self.nparity
    }

    /// Physical child offset of a row.
    pub fn row_child_offset(&self, row: u64) -> u64 {
        row * self.unit
    }

    /// Which child holds data column `dcol` (parity columns come first).
    pub fn data_child(&self, dcol: usize) -> usize {
        self.nparity + dcol
    }

    /// Allocated size on each child for a logical size.
    pub fn asize_per_child(&self, lsize: u64) -> u64 {
        let ndata = self.ndata() as u64;
        let rows = (lsize + ndata * self.unit - 1) / (ndata * self.unit);
        rows * self.unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};

    fn random_cols(n: usize, colsize: usize, seed: u64) -> Vec<Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                let mut c = vec![0u8; colsize];
                rng.fill_bytes(&mut c);
                c
            })
            .collect()
    }

    #[test]
    fn p_reconstructs_any_single_column() {
        let data = random_cols(5, 4096, 1);
        let parity = generate_parity(&data, 1);
        for missing in 0..5 {
            let mut partial: Vec<Option<Vec<u8>>> =
                data.iter().cloned().map(Some).collect();
            partial[missing] = None;
            let got = reconstruct_p(&partial, &parity[0], missing).unwrap();
            assert_eq!(got, data[missing], "column {}", missing);
        }
    }

    #[test]
    fn q_reconstructs_any_single_column() {
        let data = random_cols(6, 2048, 2);
        let parity = generate_parity(&data, 2);
        for missing in 0..6 {
            let mut partial: Vec<Option<Vec<u8>>> =
                data.iter().cloned().map(Some).collect();
            partial[missing] = None;
            let got = reconstruct_q(&partial, &parity[1], missing).unwrap();
            assert_eq!(got, data[missing], "column {}", missing);
        }
    }

    #[test]
    fn pq_reconstructs_any_pair() {
        let data = random_cols(5, 1024, 3);
        let parity = generate_parity(&data, 2);
        for x in 0..5 {
            for y in (x + 1)..5 {
                let mut partial: Vec<Option<Vec<u8>>> =
                    data.iter().cloned().map(Some).collect();
                partial[x] = None;
                partial[y] = None;
                let (dx, dy) = reconstruct_pq(&partial, &parity[0], &parity[1], x, y).unwrap();
                assert_eq!(dx, data[x], "pair ({}, {}) x", x, y);
                assert_eq!(dy, data[y], "pair ({}, {}) y", x, y);
            }
        }
    }

    #[test]
    fn triple_parity_generation_is_deterministic() {
        let data = random_cols(4, 512, 4);
        let a = generate_parity(&data, 3);
        let b = generate_parity(&data, 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 3);
        // R differs from Q and P on random data.
        assert_ne!(a[2], a[1]);
        assert_ne!(a[2], a[0]);
    }

    #[test]
    fn gf_mul2_matches_bytewise_reference() {
        fn ref_mul2(b: u8) -> u8 {
            let hi = b & 0x80 != 0;
            let mut x = b << 1;
            if hi {
                x ^= 0x1d;
            }
            x
        }
        let mut rng = StdRng::seed_from_u64(5);
        for _ in 0..1000 {
            let w = rng.next_u64();
            let got = gf64_mul2(w).to_le_bytes();
            let want: Vec<u8> = w.to_le_bytes().iter().map(|b| ref_mul2(*b)).collect();
            assert_eq!(&got[..], &want[..]);
        }
    }

    #[test]
    fn map_geometry() {
        // 4-wide raidz1, ashift 12: rows of 3 data units.
        let m = RaidzMap::new(0, 64 * 1024, 12, 4, 1);
        assert_eq!(m.ndata(), 3);
        assert_eq!(m.first_row, 0);
        // 64K / (3 * 4K) = 5.33 -> 6 rows.
        assert_eq!(m.nrows, 6);
        assert_eq!(m.asize_per_child(64 * 1024), 6 * 4096);
        assert_eq!(m.data_child(0), 1);
    }
}
