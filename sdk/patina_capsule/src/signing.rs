//! Signing of capsule payloads.
//!
//! The signature in an FMP authentication header covers the payload followed by the little-endian
//! 64-bit monotonic count. [`sign_payload`] builds that blob, hands it to a [`SigningCapability`]
//! and assembles the resulting [`CertBlockRsa2048Sha256`].
//!
//! With the `std` feature two capabilities are available: [`RsaKeySigner`] signs in-process from a
//! PEM private key, [`OpensslSigner`] drives an external `openssl` executable.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#[cfg(any(test, feature = "mockall"))]
use mockall::automock;

use alloc::vec::Vec;

use crate::{
    cert_block::{CertBlockRsa2048Sha256, EFI_HASH_ALGORITHM_SHA256_GUID, RSA_2048_KEY_SIZE},
    err::{CapsuleError, Result},
};

#[cfg(feature = "std")]
mod openssl;
#[cfg(feature = "std")]
mod rsa_key;

#[cfg(feature = "std")]
pub use openssl::{OPENSSL_PATH_ENV, OpensslSigner};
#[cfg(feature = "std")]
pub use rsa_key::RsaKeySigner;

/// An RSA-2048/SHA-256 private key able to sign data.
///
/// Implementations own the private key handle. Both operations fail with
/// [`CapsuleError::KeyError`] when the key material can not be read or used.
#[cfg_attr(any(test, feature = "mockall"), automock)]
pub trait SigningCapability {
    /// The big-endian public modulus matching the private key.
    ///
    /// The natural representation may be shorter than 256 bytes; callers pad it.
    fn derive_public_modulus(&self) -> Result<Vec<u8>>;

    /// RSA-2048 PKCS#1 v1.5 signature over the SHA-256 digest of `data`.
    fn sign_rsa2048_sha256(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// The exact bytes covered by the signature: `payload || monotonic_count` (little-endian).
pub fn signed_blob(payload: &[u8], monotonic_count: u64) -> Vec<u8> {
    let mut blob = Vec::with_capacity(payload.len() + core::mem::size_of::<u64>());
    blob.extend_from_slice(payload);
    blob.extend_from_slice(&monotonic_count.to_le_bytes());
    blob
}

/// Sign `payload` bound to `monotonic_count` and build the certificate block.
///
/// Any failure of the capability, or key material of the wrong size, is reported as
/// [`CapsuleError::SigningFailed`].
pub fn sign_payload(
    signer: &dyn SigningCapability,
    payload: &[u8],
    monotonic_count: u64,
) -> Result<CertBlockRsa2048Sha256> {
    let blob = signed_blob(payload, monotonic_count);

    let modulus = signer.derive_public_modulus().map_err(|err| {
        log::error!("unable to derive public modulus: {err}");
        CapsuleError::SigningFailed
    })?;
    let modulus = normalize_modulus(&modulus).ok_or_else(|| {
        log::error!("public modulus of {} bytes is not an RSA-2048 key", modulus.len());
        CapsuleError::SigningFailed
    })?;

    let signature = signer.sign_rsa2048_sha256(&blob).map_err(|err| {
        log::error!("unable to sign payload: {err}");
        CapsuleError::SigningFailed
    })?;
    if signature.len() != RSA_2048_KEY_SIZE {
        log::error!("signature is {} bytes, expected {RSA_2048_KEY_SIZE}", signature.len());
        return Err(CapsuleError::SigningFailed);
    }

    log::debug!("signed {:#x} payload bytes with monotonic count {monotonic_count:#x}", payload.len());
    CertBlockRsa2048Sha256::new(EFI_HASH_ALGORITHM_SHA256_GUID, &modulus, &signature)
}

/// Left-pad a big-endian modulus to 256 bytes. Leading zero bytes beyond that are dropped.
fn normalize_modulus(modulus: &[u8]) -> Option<[u8; RSA_2048_KEY_SIZE]> {
    let first_nonzero = modulus.iter().position(|&b| b != 0).unwrap_or(modulus.len());
    let significant = &modulus[first_nonzero..];
    if significant.len() > RSA_2048_KEY_SIZE {
        return None;
    }
    let mut padded = [0u8; RSA_2048_KEY_SIZE];
    padded[RSA_2048_KEY_SIZE - significant.len()..].copy_from_slice(significant);
    Some(padded)
}
