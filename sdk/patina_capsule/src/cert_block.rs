//! EFI_CERT_BLOCK_RSA_2048_SHA256 support.
//!
//! ```text
//! typedef struct {
//!   EFI_GUID HashType;
//!   UINT8    PublicKey[256];
//!   UINT8    Signature[256];
//! } EFI_CERT_BLOCK_RSA_2048_SHA256;
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{format, string::String, vec, vec::Vec};
use core::fmt::{self, Write};

use r_efi::efi;
use scroll::Pwrite;

use crate::{
    err::{CapsuleError, Result},
    guid::{self, GUID_SIZE, Guid},
};

/// EFI_HASH_ALGORITHM_SHA256_GUID
pub const EFI_HASH_ALGORITHM_SHA256_GUID: efi::Guid =
    efi::Guid::from_fields(0x51aa59de, 0xfdf2, 0x4ea3, 0xbc, 0x63, &[0x87, 0x5f, 0xb7, 0x84, 0x2e, 0xe9]);

/// Size in bytes of an RSA-2048 modulus and of an RSA-2048 signature.
pub const RSA_2048_KEY_SIZE: usize = 256;

/// Encoded size of [`CertBlockRsa2048Sha256`].
pub const CERT_BLOCK_RSA_2048_SHA256_SIZE: usize = GUID_SIZE + 2 * RSA_2048_KEY_SIZE;

/// RSA-2048/SHA-256 certificate block: hash algorithm, public modulus and detached signature.
///
/// The public exponent is implicit (65537) and not stored.
#[derive(Clone, PartialEq, Eq)]
pub struct CertBlockRsa2048Sha256 {
    /// Hash algorithm GUID, [`EFI_HASH_ALGORITHM_SHA256_GUID`] for blocks produced by this crate.
    pub hash_type: efi::Guid,
    /// Big-endian RSA modulus.
    pub public_key: [u8; RSA_2048_KEY_SIZE],
    /// PKCS#1 v1.5 signature.
    pub signature: [u8; RSA_2048_KEY_SIZE],
}

impl CertBlockRsa2048Sha256 {
    /// Build a certificate block, rejecting a modulus or signature that is not exactly 256 bytes.
    pub fn new(hash_type: efi::Guid, public_key: &[u8], signature: &[u8]) -> Result<Self> {
        Ok(Self { hash_type, public_key: to_key_array(public_key)?, signature: to_key_array(signature)? })
    }

    /// Serialize to the 528-byte on-disk layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buffer = vec![0u8; CERT_BLOCK_RSA_2048_SHA256_SIZE];
        let mut offset = 0;
        // The buffer is sized for the fixed layout, writes cannot fail.
        let _ = guid::write_guid(&mut buffer, &mut offset, &self.hash_type);
        let _ = buffer.gwrite_with(self.public_key.as_slice(), &mut offset, ());
        let _ = buffer.gwrite_with(self.signature.as_slice(), &mut offset, ());
        debug_assert_eq!(offset, CERT_BLOCK_RSA_2048_SHA256_SIZE);
        buffer
    }

    /// Parse a certificate block from the start of `buffer`. Trailing bytes are ignored.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < CERT_BLOCK_RSA_2048_SHA256_SIZE {
            log::error!(
                "certificate block needs {CERT_BLOCK_RSA_2048_SHA256_SIZE:#x} bytes, only {:#x} available",
                buffer.len()
            );
            return Err(CapsuleError::TruncatedInput);
        }
        let mut offset = 0;
        let hash_type = guid::read_guid(buffer, &mut offset)?;
        let public_key = &buffer[offset..offset + RSA_2048_KEY_SIZE];
        offset += RSA_2048_KEY_SIZE;
        let signature = &buffer[offset..offset + RSA_2048_KEY_SIZE];
        Self::new(hash_type, public_key, signature)
    }

    /// Render every field for diagnostics.
    pub fn dump_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "EFI_CERT_BLOCK_RSA_2048_SHA256.HashType  = {}", Guid::from_ref(&self.hash_type));
        let _ = writeln!(out, "EFI_CERT_BLOCK_RSA_2048_SHA256.PublicKey = {}", hex_preview(&self.public_key));
        let _ = writeln!(out, "EFI_CERT_BLOCK_RSA_2048_SHA256.Signature = {}", hex_preview(&self.signature));
        out
    }
}

impl fmt::Debug for CertBlockRsa2048Sha256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertBlockRsa2048Sha256")
            .field("hash_type", &Guid::from_ref(&self.hash_type))
            .field("public_key", &hex_preview(&self.public_key))
            .field("signature", &hex_preview(&self.signature))
            .finish()
    }
}

fn to_key_array(bytes: &[u8]) -> Result<[u8; RSA_2048_KEY_SIZE]> {
    bytes.try_into().map_err(|_| CapsuleError::InvalidCertificateSize(bytes.len()))
}

// First and last eight bytes, enough to tell keys and signatures apart.
fn hex_preview(bytes: &[u8]) -> String {
    let hex = |chunk: &[u8]| chunk.iter().map(|b| format!("{b:02X}")).collect::<String>();
    if bytes.len() <= 16 {
        return hex(bytes);
    }
    format!("{}...{} ({:#x} bytes)", hex(&bytes[..8]), hex(&bytes[bytes.len() - 8..]), bytes.len())
}
