// Copyright (C) 2026 The Tidepool Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

//! Mechanism registry and AEAD providers.
//!
//! Modeled on a kernel-crypto-framework registry: a process-wide table of
//! mechanism slots, partitioned by class, into which providers install
//! themselves at init. Consumers resolve a mechanism by name once and
//! then dispatch through the slot. Registration failures are fatal to the
//! module that depends on the mechanism, so the table never has to
//! answer "maybe" at I/O time.
//!
//! The engine's per-block encryption is AEAD only: a 12-byte IV derived
//! from block-pointer fields, the dataset salt as associated data, and a
//! 16-byte MAC stored where an unprotected block would keep checksum
//! words.

use std::collections::HashMap;
use std::sync::{Arc, Once, RwLock};

use lazy_static::lazy_static;
use log::info;
use thiserror::Error;

mod providers;

pub use providers::{AesProvider, ChapolyProvider};

pub const MAC_BYTES: usize = 16;
pub const IV_BYTES: usize = 12;
pub const KEY_BYTES: usize = 32;

/// Mechanism names, kernel-crypto style.
pub const CKM_AES_GCM: &str = "CKM_AES_GCM";
pub const CKM_AES_CCM: &str = "CKM_AES_CCM";
pub const CKM_CHACHA20_POLY1305: &str = "CKM_CHACHA20_POLY1305";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    #[error("mechanism '{0}' is not registered")]
    UnknownMechanism(String),
    #[error("mechanism table is full")]
    TableFull,
    #[error("mechanism '{0}' already registered")]
    AlreadyRegistered(String),
    #[error("bad key length {0}")]
    BadKeyLength(usize),
    #[error("authentication failed")]
    AuthFailed,
    #[error("cipher failure")]
    CipherFailed,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// Opaque mechanism handle; index into the mechanism table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MechType(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MechClass {
    Cipher,
    Mac,
}

/// A cached key schedule. Creating one per dataset key amortizes cipher
/// setup across every block I/O.
pub trait CtxTemplate: Send + Sync {
    /// Returns ciphertext and MAC.
    fn encrypt(&self, iv: &[u8; IV_BYTES], aad: &[u8], plaintext: &[u8])
        -> Result<(Vec<u8>, [u8; MAC_BYTES])>;
    /// Verifies the MAC; authentication failure is terminal.
    fn decrypt(
        &self,
        iv: &[u8; IV_BYTES],
        aad: &[u8],
        ciphertext: &[u8],
        mac: &[u8; MAC_BYTES],
    ) -> Result<Vec<u8>>;
}

/// One provider's entry points for a mechanism.
pub trait ProviderOps: Send + Sync {
    fn mech_name(&self) -> &'static str;
    fn mech_class(&self) -> MechClass;

    fn create_ctx_template(&self, key: &[u8]) -> Result<Box<dyn CtxTemplate>>;

    fn encrypt_atomic(
        &self,
        key: &[u8],
        iv: &[u8; IV_BYTES],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<(Vec<u8>, [u8; MAC_BYTES])> {
        self.create_ctx_template(key)?.encrypt(iv, aad, plaintext)
    }

    fn decrypt_atomic(
        &self,
        key: &[u8],
        iv: &[u8; IV_BYTES],
        aad: &[u8],
        ciphertext: &[u8],
        mac: &[u8; MAC_BYTES],
    ) -> Result<Vec<u8>> {
        self.create_ctx_template(key)?
            .decrypt(iv, aad, ciphertext, mac)
    }
}

const MECH_TABLE_SLOTS: usize = 32;

struct MechEntry {
    name: &'static str,
    class: MechClass,
    ops: Arc<dyn ProviderOps>,
}

struct MechTabs {
    slots: Vec<Option<MechEntry>>,
    by_name: HashMap<&'static str, MechType>,
}

lazy_static! {
    static ref MECH_TABS: RwLock<MechTabs> = RwLock::new(MechTabs {
        slots: (0..MECH_TABLE_SLOTS).map(|_| None).collect(),
        by_name: HashMap::new(),
    });
}

/// Install a provider. The slot index becomes the mechanism handle.
pub fn register_provider(ops: Arc<dyn ProviderOps>) -> Result<MechType> {
    let mut tabs = MECH_TABS.write().unwrap();
    let name = ops.mech_name();
    if tabs.by_name.contains_key(name) {
        return Err(CryptoError::AlreadyRegistered(name.to_string()));
    }
    let slot = tabs
        .slots
        .iter()
        .position(|s| s.is_none())
        .ok_or(CryptoError::TableFull)?;
    let class = ops.mech_class();
    tabs.slots[slot] = Some(MechEntry { name, class, ops });
    tabs.by_name.insert(name, MechType(slot));
    info!("crypto: registered mechanism '{}' in slot {}", name, slot);
    Ok(MechType(slot))
}

/// O(1) mechanism lookup by name.
pub fn mech_from_name(name: &str) -> Result<MechType> {
    MECH_TABS
        .read()
        .unwrap()
        .by_name
        .get(name)
        .copied()
        .ok_or_else(|| CryptoError::UnknownMechanism(name.to_string()))
}

pub fn mech_name(mech: MechType) -> Option<&'static str> {
    MECH_TABS.read().unwrap().slots[mech.0]
        .as_ref()
        .map(|e| e.name)
}

pub fn mech_class(mech: MechType) -> Option<MechClass> {
    MECH_TABS.read().unwrap().slots[mech.0]
        .as_ref()
        .map(|e| e.class)
}

fn mech_ops(mech: MechType) -> Result<Arc<dyn ProviderOps>> {
    MECH_TABS.read().unwrap().slots[mech.0]
        .as_ref()
        .map(|e| Arc::clone(&e.ops))
        .ok_or_else(|| CryptoError::UnknownMechanism(format!("slot {}", mech.0)))
}

static DEFAULT_PROVIDERS: Once = Once::new();

/// Register the built-in providers. Idempotent; any engine path that
/// needs encryption calls this first. A failure here would indicate a
/// duplicate registration and is a programming error, hence the panic.
pub fn init_default_providers() {
    DEFAULT_PROVIDERS.call_once(|| {
        for ops in providers::default_providers() {
            register_provider(ops).expect("builtin crypto provider registration");
        }
    });
}

/// Encrypt one block through the mechanism's provider.
pub fn encrypt_atomic(
    mech: MechType,
    key: &[u8],
    iv: &[u8; IV_BYTES],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; MAC_BYTES])> {
    mech_ops(mech)?.encrypt_atomic(key, iv, aad, plaintext)
}

/// Decrypt and authenticate one block.
pub fn decrypt_atomic(
    mech: MechType,
    key: &[u8],
    iv: &[u8; IV_BYTES],
    aad: &[u8],
    ciphertext: &[u8],
    mac: &[u8; MAC_BYTES],
) -> Result<Vec<u8>> {
    mech_ops(mech)?.decrypt_atomic(key, iv, aad, ciphertext, mac)
}

/// Build a reusable key schedule for a mechanism.
pub fn create_ctx_template(mech: MechType, key: &[u8]) -> Result<Box<dyn CtxTemplate>> {
    mech_ops(mech)?.create_ctx_template(key)
}

/// Pack the per-block IV from block-pointer fields.
pub fn block_iv(iv1: u64, iv2: u32) -> [u8; IV_BYTES] {
    let mut iv = [0u8; IV_BYTES];
    iv[0..8].copy_from_slice(&iv1.to_le_bytes());
    iv[8..12].copy_from_slice(&iv2.to_le_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() {
        init_default_providers();
    }

    #[test]
    fn lookup_by_name() {
        setup();
        for name in &[CKM_AES_GCM, CKM_AES_CCM, CKM_CHACHA20_POLY1305] {
            let mech = mech_from_name(name).unwrap();
            assert_eq!(mech_name(mech), Some(*name));
            assert_eq!(mech_class(mech), Some(MechClass::Cipher));
        }
        assert!(mech_from_name("CKM_ROT13").is_err());
    }

    #[test]
    fn all_mechanisms_roundtrip() {
        setup();
        let key = [0x42u8; KEY_BYTES];
        let iv = block_iv(0x1111_2222_3333_4444, 0x5555_6666);
        let aad = b"salt and bookkeeping";
        let pt = b"the block contents under protection".to_vec();
        for name in &[CKM_AES_GCM, CKM_AES_CCM, CKM_CHACHA20_POLY1305] {
            let mech = mech_from_name(name).unwrap();
            let (ct, mac) = encrypt_atomic(mech, &key, &iv, aad, &pt).unwrap();
            assert_eq!(ct.len(), pt.len(), "{}: AEAD must not pad", name);
            assert_ne!(ct, pt);
            let back = decrypt_atomic(mech, &key, &iv, aad, &ct, &mac).unwrap();
            assert_eq!(back, pt, "{}", name);
        }
    }

    #[test]
    fn tamper_detection_is_terminal() {
        setup();
        let key = [7u8; KEY_BYTES];
        let iv = block_iv(1, 2);
        let mech = mech_from_name(CKM_AES_GCM).unwrap();
        let (mut ct, mac) = encrypt_atomic(mech, &key, &iv, b"", b"payload").unwrap();
        ct[0] ^= 1;
        assert_eq!(
            decrypt_atomic(mech, &key, &iv, b"", &ct, &mac),
            Err(CryptoError::AuthFailed)
        );
        // Wrong key also fails authentication, not garbage output.
        ct[0] ^= 1;
        let wrong = [8u8; KEY_BYTES];
        assert_eq!(
            decrypt_atomic(mech, &wrong, &iv, b"", &ct, &mac),
            Err(CryptoError::AuthFailed)
        );
    }

    #[test]
    fn template_matches_atomic() {
        setup();
        let key = [9u8; KEY_BYTES];
        let iv = block_iv(3, 4);
        let mech = mech_from_name(CKM_CHACHA20_POLY1305).unwrap();
        let tmpl = create_ctx_template(mech, &key).unwrap();
        let (ct1, mac1) = tmpl.encrypt(&iv, b"aad", b"data").unwrap();
        let (ct2, mac2) = encrypt_atomic(mech, &key, &iv, b"aad", b"data").unwrap();
        assert_eq!((ct1, mac1), (ct2, mac2));
    }

    #[test]
    fn bad_key_length_rejected() {
        setup();
        let mech = mech_from_name(CKM_AES_GCM).unwrap();
        assert_eq!(
            create_ctx_template(mech, &[0u8; 16]).err(),
            Some(CryptoError::BadKeyLength(16))
        );
    }
}
