// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Built-in AEAD providers: AES (GCM and CCM modes) and
//! ChaCha20-Poly1305. All use 256-bit keys, 12-byte nonces and 16-byte
//! tags, so the engine's block-pointer layout is mode-agnostic.

use std::sync::Arc;

use aes::Aes256;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use ccm::consts::{U12, U16};
use ccm::Ccm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::{
    CryptoError, CtxTemplate, MechClass, ProviderOps, Result, CKM_AES_CCM, CKM_AES_GCM,
    CKM_CHACHA20_POLY1305, IV_BYTES, KEY_BYTES, MAC_BYTES,
};

type Aes256Ccm = Ccm<Aes256, U16, U12>;

fn check_key(key: &[u8]) -> Result<()> {
    if key.len() != KEY_BYTES {
        return Err(CryptoError::BadKeyLength(key.len()));
    }
    Ok(())
}

/// Shared encrypt/decrypt plumbing over any `aead::Aead` cipher.
fn aead_encrypt<C: Aead>(
    cipher: &C,
    iv: &[u8; IV_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; MAC_BYTES])> {
    let mut combined = cipher
        .encrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::CipherFailed)?;
    // The tag is appended to the ciphertext; split it back out so the
    // caller can place it in the block pointer.
    let tag_at = combined.len() - MAC_BYTES;
    let mut mac = [0u8; MAC_BYTES];
    mac.copy_from_slice(&combined[tag_at..]);
    combined.truncate(tag_at);
    Ok((combined, mac))
}

fn aead_decrypt<C: Aead>(
    cipher: &C,
    iv: &[u8; IV_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
    mac: &[u8; MAC_BYTES],
) -> Result<Vec<u8>> {
    let mut combined = Vec::with_capacity(ciphertext.len() + MAC_BYTES);
    combined.extend_from_slice(ciphertext);
    combined.extend_from_slice(mac);
    cipher
        .decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: &combined,
                aad,
            },
        )
        .map_err(|_| CryptoError::AuthFailed)
}

macro_rules! aead_template {
    ($name:ident, $cipher:ty) => {
        struct $name($cipher);

        impl CtxTemplate for $name {
            fn encrypt(
                &self,
                iv: &[u8; IV_BYTES],
                aad: &[u8],
                plaintext: &[u8],
            ) -> Result<(Vec<u8>, [u8; MAC_BYTES])> {
                aead_encrypt(&self.0, iv, aad, plaintext)
            }

            fn decrypt(
                &self,
                iv: &[u8; IV_BYTES],
                aad: &[u8],
                ciphertext: &[u8],
                mac: &[u8; MAC_BYTES],
            ) -> Result<Vec<u8>> {
                aead_decrypt(&self.0, iv, aad, ciphertext, mac)
            }
        }
    };
}

aead_template!(GcmTemplate, Aes256Gcm);
aead_template!(CcmTemplate, Aes256Ccm);
aead_template!(ChapolyTemplate, ChaCha20Poly1305);

/// AES provider; serves both the GCM and CCM mechanisms.
pub struct AesProvider {
    gcm: bool,
}

impl ProviderOps for AesProvider {
    fn mech_name(&self) -> &'static str {
        if self.gcm {
            CKM_AES_GCM
        } else {
            CKM_AES_CCM
        }
    }

    fn mech_class(&self) -> MechClass {
        MechClass::Cipher
    }

    fn create_ctx_template(&self, key: &[u8]) -> Result<Box<dyn CtxTemplate>> {
        check_key(key)?;
        if self.gcm {
            Ok(Box::new(GcmTemplate(Aes256Gcm::new(
                GenericArray::from_slice(key),
            ))))
        } else {
            Ok(Box::new(CcmTemplate(Aes256Ccm::new(GenericArray::from_slice(
                key,
            )))))
        }
    }
}

/// ChaCha20-Poly1305 provider, the non-AES alternate.
pub struct ChapolyProvider;

impl ProviderOps for ChapolyProvider {
    fn mech_name(&self) -> &'static str {
        CKM_CHACHA20_POLY1305
    }

    fn mech_class(&self) -> MechClass {
        MechClass::Cipher
    }

    fn create_ctx_template(&self, key: &[u8]) -> Result<Box<dyn CtxTemplate>> {
        check_key(key)?;
        Ok(Box::new(ChapolyTemplate(ChaCha20Poly1305::new(
            GenericArray::from_slice(key),
        ))))
    }
}

pub(crate) fn default_providers() -> Vec<Arc<dyn ProviderOps>> {
    vec![
        Arc::new(AesProvider { gcm: true }),
        Arc::new(AesProvider { gcm: false }),
        Arc::new(ChapolyProvider),
    ]
}
