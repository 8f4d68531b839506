// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! SHA-256, the dedup-capable checksum.

use sha2::{Digest, Sha256};

use crate::{cksum_from_be_bytes, Cksum};

pub fn sha256(data: &[u8]) -> Cksum {
    let digest = Sha256::digest(data);
    cksum_from_be_bytes(&digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_matches_fips_vector() {
        // SHA-256("") = e3b0c442...
        let c = sha256(b"");
        assert_eq!(c.0[0], 0xe3b0_c442_98fc_1c14);
        assert_eq!(c.0[3], 0xa495_991b_7852_b855);
    }

    #[test]
    fn distinct_inputs_distinct_sums() {
        assert_ne!(sha256(b"abc"), sha256(b"abd"));
    }
}
