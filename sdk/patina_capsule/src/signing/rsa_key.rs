//! In-process RSA-2048/SHA-256 signer backed by a PEM private key.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::{fs, path::Path};

use rsa::{
    Pkcs1v15Sign, RsaPrivateKey, pkcs1::DecodeRsaPrivateKey, pkcs8::DecodePrivateKey, traits::PublicKeyParts,
};
use sha2::{Digest, Sha256};

use super::SigningCapability;
use crate::{
    cert_block::RSA_2048_KEY_SIZE,
    err::{CapsuleError, Result},
};

/// Signs with an RSA private key held in memory.
///
/// PKCS#1 v1.5 padding is deterministic: the same key and data always yield the same signature,
/// identical to `openssl dgst -sha256 -sign`.
#[derive(Clone)]
pub struct RsaKeySigner {
    key: RsaPrivateKey,
}

impl RsaKeySigner {
    /// Wrap an existing private key. Keys other than 2048 bits are rejected with
    /// [`CapsuleError::KeyError`].
    pub fn new(key: RsaPrivateKey) -> Result<Self> {
        if key.size() != RSA_2048_KEY_SIZE {
            log::error!("private key is {} bits, RSA-2048 required", key.size() * 8);
            return Err(CapsuleError::KeyError);
        }
        Ok(Self { key })
    }

    /// Parse a PEM encoded key, either PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1
    /// (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPrivateKey::from_pkcs8_pem(pem).or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem)).map_err(|err| {
            log::error!("unable to parse private key: {err}");
            CapsuleError::KeyError
        })?;
        Self::new(key)
    }

    /// Read and parse a PEM private key file.
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = fs::read_to_string(path).map_err(|err| {
            log::error!("read signing private key file {} failed: {err}", path.display());
            CapsuleError::KeyError
        })?;
        Self::from_pem(&pem)
    }
}

impl SigningCapability for RsaKeySigner {
    fn derive_public_modulus(&self) -> Result<Vec<u8>> {
        Ok(self.key.n().to_bytes_be())
    }

    fn sign_rsa2048_sha256(&self, data: &[u8]) -> Result<Vec<u8>> {
        let digest = Sha256::digest(data);
        self.key.sign(Pkcs1v15Sign::new::<Sha256>(), &digest).map_err(|err| {
            log::error!("RSA signing failed: {err}");
            CapsuleError::KeyError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;
    use std::path::PathBuf;

    const TEST_KEY: &str = include_str!("../../resources/test/rsa2048_test_key.pem");
    const TEST_KEY_PKCS1: &str = include_str!("../../resources/test/rsa2048_test_key_pkcs1.pem");
    const TEST_KEY_1024: &str = include_str!("../../resources/test/rsa1024_test_key.pem");
    const TEST_KEY_MODULUS: &[u8] = include_bytes!("../../resources/test/rsa2048_test_key.modulus");
    const ZERO_PAYLOAD_SIGNATURE: &[u8] = include_bytes!("../../resources/test/zero_payload_count0.sig");

    #[test]
    fn pkcs8_and_pkcs1_keys_derive_the_same_modulus() {
        let pkcs8 = RsaKeySigner::from_pem(TEST_KEY).unwrap();
        let pkcs1 = RsaKeySigner::from_pem(TEST_KEY_PKCS1).unwrap();
        assert_eq!(pkcs8.derive_public_modulus().unwrap(), TEST_KEY_MODULUS);
        assert_eq!(pkcs1.derive_public_modulus().unwrap(), TEST_KEY_MODULUS);
    }

    #[test]
    fn signature_matches_openssl_dgst_output() {
        let signer = RsaKeySigner::from_pem(TEST_KEY).unwrap();
        let signature = signer.sign_rsa2048_sha256(&[0u8; 12]).unwrap();
        assert_eq!(signature, ZERO_PAYLOAD_SIGNATURE);
    }

    #[test]
    fn signature_verifies_with_public_key() {
        let signer = RsaKeySigner::from_pem(TEST_KEY).unwrap();
        let signature = signer.sign_rsa2048_sha256(b"capsule image").unwrap();

        let public_key = RsaPublicKey::from(&signer.key);
        let digest = Sha256::digest(b"capsule image");
        public_key.verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &signature).unwrap();
    }

    #[test]
    fn non_2048_bit_keys_are_rejected() {
        assert!(matches!(RsaKeySigner::from_pem(TEST_KEY_1024), Err(CapsuleError::KeyError)));
    }

    #[test]
    fn garbage_and_missing_keys_are_key_errors() {
        assert!(matches!(RsaKeySigner::from_pem("not a key"), Err(CapsuleError::KeyError)));
        let missing = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources/test/missing.pem");
        assert!(matches!(RsaKeySigner::from_pem_file(&missing), Err(CapsuleError::KeyError)));
    }

    #[test]
    fn key_file_is_loaded() {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("resources/test/rsa2048_test_key.pem");
        let signer = RsaKeySigner::from_pem_file(&path).unwrap();
        assert_eq!(signer.derive_public_modulus().unwrap(), TEST_KEY_MODULUS);
    }
}
