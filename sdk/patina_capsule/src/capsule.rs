//! Building and parsing complete signed FMP capsules.
//!
//! A capsule nests four layers, outermost first:
//!
//! ```text
//! EFI_CAPSULE_HEADER
//!   EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER
//!     EFI_FIRMWARE_MANAGEMENT_CAPSULE_IMAGE_HEADER
//!       EFI_FIRMWARE_IMAGE_AUTHENTICATION
//!         EFI_CERT_BLOCK_RSA_2048_SHA256
//!         payload
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{string::String, vec::Vec};

use r_efi::efi;

use crate::{
    auth_header::FmpAuthHeader,
    capsule_header::{EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID, UefiCapsuleHeader},
    err::Result,
    fmp_header::FmpCapsuleHeader,
    guid::Guid,
    signing::{self, SigningCapability},
};

/// Parameters for producing a signed single-payload FMP capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapsuleBuilder {
    capsule_guid: efi::Guid,
    image_type_id: efi::Guid,
    hardware_instance: u64,
    monotonic_count: u64,
    oem_flags: u16,
    persist_across_reset: bool,
    initiate_reset: bool,
}

impl CapsuleBuilder {
    /// A builder for payloads updating the FMP image type `image_type_id`.
    ///
    /// The capsule GUID defaults to EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID, every other setting to
    /// zero or unset.
    pub fn new(image_type_id: efi::Guid) -> Self {
        Self {
            capsule_guid: EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID,
            image_type_id,
            hardware_instance: 0,
            monotonic_count: 0,
            oem_flags: 0,
            persist_across_reset: false,
            initiate_reset: false,
        }
    }

    /// Override the GUID in the UEFI capsule header.
    pub fn with_capsule_guid(mut self, capsule_guid: efi::Guid) -> Self {
        self.capsule_guid = capsule_guid;
        self
    }

    /// Restrict the update to one hardware instance.
    pub fn with_hardware_instance(mut self, hardware_instance: u64) -> Self {
        self.hardware_instance = hardware_instance;
        self
    }

    /// Set the anti-rollback counter bound into the signature.
    pub fn with_monotonic_count(mut self, monotonic_count: u64) -> Self {
        self.monotonic_count = monotonic_count;
        self
    }

    /// Set the capsule GUID specific low 16 bits of the capsule flags.
    pub fn with_oem_flags(mut self, oem_flags: u16) -> Self {
        self.oem_flags = oem_flags;
        self
    }

    /// Set CAPSULE_FLAGS_PERSIST_ACROSS_RESET.
    pub fn with_persist_across_reset(mut self, persist_across_reset: bool) -> Self {
        self.persist_across_reset = persist_across_reset;
        self
    }

    /// Set CAPSULE_FLAGS_INITIATE_RESET. Encoding fails unless persist across reset is set too.
    pub fn with_initiate_reset(mut self, initiate_reset: bool) -> Self {
        self.initiate_reset = initiate_reset;
        self
    }

    /// Sign `payload` and wrap it in the authentication, FMP and UEFI capsule headers.
    pub fn encode(&self, payload: &[u8], signer: &dyn SigningCapability) -> Result<Vec<u8>> {
        let cert_block = signing::sign_payload(signer, payload, self.monotonic_count)?;

        let auth_header = FmpAuthHeader::new(self.monotonic_count, cert_block, payload.to_vec());
        log::info!("{}", auth_header.dump_info());

        let mut fmp_header = FmpCapsuleHeader::new();
        fmp_header.add_payload(self.image_type_id, auth_header.encode(), self.hardware_instance)?;
        let fmp_capsule = fmp_header.encode()?;
        log::info!("{}", fmp_header.dump_info());

        let mut capsule_header = UefiCapsuleHeader::new(self.capsule_guid, fmp_capsule);
        capsule_header.oem_flags = self.oem_flags;
        capsule_header.persist_across_reset = self.persist_across_reset;
        capsule_header.initiate_reset = self.initiate_reset;
        let capsule = capsule_header.encode()?;
        log::info!("{}", capsule_header.dump_info());

        Ok(capsule)
    }
}

/// Every layer of a parsed capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedCapsule {
    /// Outermost layer.
    pub capsule_header: UefiCapsuleHeader,
    /// The FMP capsule carried by `capsule_header`.
    pub fmp_header: FmpCapsuleHeader,
    /// The authenticated first payload item of `fmp_header`.
    pub auth_header: FmpAuthHeader,
}

impl DecodedCapsule {
    /// The signed image at the core of the capsule.
    pub fn image_payload(&self) -> &[u8] {
        &self.auth_header.payload
    }

    /// Render all layers, outermost first.
    pub fn dump_info(&self) -> String {
        let mut out = String::from("========\n");
        out.push_str(&self.capsule_header.dump_info());
        out.push_str("--------\n");
        out.push_str(&self.fmp_header.dump_info());
        out.push_str("--------\n");
        out.push_str(&self.auth_header.dump_info());
        out.push_str("========\n");
        out
    }
}

/// Peel every layer of `buffer`. The first failing layer aborts decoding.
///
/// Only the first FMP payload item is authenticated. Signatures are not verified.
pub fn decode_capsule(buffer: &[u8]) -> Result<DecodedCapsule> {
    let capsule_header = UefiCapsuleHeader::decode(buffer)?;
    if capsule_header.capsule_guid != EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID {
        log::warn!("capsule GUID {} is not the FMP capsule id", Guid::from_ref(&capsule_header.capsule_guid));
    }
    let fmp_header = FmpCapsuleHeader::decode(&capsule_header.payload)?;
    let auth_header = FmpAuthHeader::decode(&fmp_header.image_header(0)?.payload)?;
    Ok(DecodedCapsule { capsule_header, fmp_header, auth_header })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        auth_header::{FMP_AUTH_HEADER_FIXED_SIZE, RSA2048_SHA256_AUTH_INFO_LENGTH},
        cert_block::CERT_BLOCK_RSA_2048_SHA256_SIZE,
        err::CapsuleError,
        signing::MockSigningCapability,
    };
    use alloc::vec;

    const IMAGE_TYPE: efi::Guid =
        efi::Guid::from_fields(0x8a1b2c3d, 0x4e5f, 0x6071, 0x82, 0x93, &[0xa4, 0xb5, 0xc6, 0xd7, 0xe8, 0xf9]);

    fn mock_signer() -> MockSigningCapability {
        let mut signer = MockSigningCapability::new();
        signer.expect_derive_public_modulus().returning(|| Ok(vec![0x11; 256]));
        signer.expect_sign_rsa2048_sha256().returning(|data| Ok(vec![data.len() as u8; 256]));
        signer
    }

    #[test]
    fn encoded_capsule_has_expected_layout() {
        let capsule = CapsuleBuilder::new(IMAGE_TYPE)
            .with_persist_across_reset(true)
            .with_monotonic_count(5)
            .encode(b"payload", &mock_signer())
            .unwrap();

        let auth_size = FMP_AUTH_HEADER_FIXED_SIZE + CERT_BLOCK_RSA_2048_SHA256_SIZE + 7;
        assert_eq!(capsule.len(), 28 + 8 + 8 + 40 + auth_size);
        assert_eq!(&capsule[..16], &Guid::from_ref(&EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID).as_bytes());
        assert_eq!(&capsule[capsule.len() - 7..], b"payload");

        let auth = &capsule[28 + 16 + 40..];
        assert_eq!(&auth[..8], &5u64.to_le_bytes());
        assert_eq!(&auth[8..12], &RSA2048_SHA256_AUTH_INFO_LENGTH.to_le_bytes());
    }

    #[test]
    fn decode_capsule_peels_every_layer() {
        let capsule = CapsuleBuilder::new(IMAGE_TYPE)
            .with_capsule_guid(IMAGE_TYPE)
            .with_hardware_instance(3)
            .with_monotonic_count(0x1_0000_0000)
            .with_oem_flags(0x55)
            .with_persist_across_reset(true)
            .with_initiate_reset(true)
            .encode(b"firmware image", &mock_signer())
            .unwrap();

        let decoded = decode_capsule(&capsule).unwrap();
        assert_eq!(decoded.capsule_header.capsule_guid, IMAGE_TYPE);
        assert_eq!(decoded.capsule_header.oem_flags, 0x55);
        assert!(decoded.capsule_header.persist_across_reset);
        assert!(decoded.capsule_header.initiate_reset);
        assert!(!decoded.capsule_header.populate_system_table);

        let image = decoded.fmp_header.image_header(0).unwrap();
        assert_eq!(image.update_image_type_id, IMAGE_TYPE);
        assert_eq!(image.update_hardware_instance, 3);

        assert_eq!(decoded.auth_header.monotonic_count, 0x1_0000_0000);
        assert_eq!(decoded.auth_header.cert_block.public_key, [0x11; 256]);
        // The mock signs with the signed blob length: payload plus the 8-byte count.
        assert_eq!(decoded.auth_header.cert_block.signature, [14 + 8; 256]);
        assert_eq!(decoded.image_payload(), b"firmware image");
    }

    #[test]
    fn signing_failure_aborts_encoding() {
        let mut signer = MockSigningCapability::new();
        signer.expect_derive_public_modulus().returning(|| Err(CapsuleError::KeyError));
        assert_eq!(CapsuleBuilder::new(IMAGE_TYPE).encode(b"x", &signer), Err(CapsuleError::SigningFailed));
    }

    #[test]
    fn initiate_reset_without_persist_is_rejected() {
        let result = CapsuleBuilder::new(IMAGE_TYPE).with_initiate_reset(true).encode(b"x", &mock_signer());
        assert_eq!(result, Err(CapsuleError::InvalidFlagCombination));
    }

    #[test]
    fn failing_inner_layer_aborts_decoding() {
        let mut capsule =
            CapsuleBuilder::new(IMAGE_TYPE).with_persist_across_reset(true).encode(b"x", &mock_signer()).unwrap();
        // CertType of the authentication header.
        let cert_type = 28 + 16 + 40 + 16;
        capsule[cert_type] ^= 0xff;
        assert_eq!(decode_capsule(&capsule), Err(CapsuleError::UnsupportedCertificateType));

        assert_eq!(decode_capsule(&capsule[..20]), Err(CapsuleError::TruncatedHeader));
    }

    #[test]
    fn fmp_capsule_without_auth_header_is_rejected() {
        let mut fmp_header = FmpCapsuleHeader::new();
        fmp_header.add_payload(IMAGE_TYPE, vec![0u8; 16], 0).unwrap();
        let capsule =
            UefiCapsuleHeader::new(EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID, fmp_header.encode().unwrap()).encode();
        assert_eq!(decode_capsule(&capsule.unwrap()), Err(CapsuleError::MalformedInput));
    }

    #[test]
    fn dump_info_separates_layers() {
        let capsule = CapsuleBuilder::new(IMAGE_TYPE).encode(b"x", &mock_signer()).unwrap();
        let decoded = decode_capsule(&capsule).unwrap();
        let text = decoded.dump_info();

        let rules: Vec<&str> = text.lines().filter(|line| line.starts_with("====") || line.starts_with("----")).collect();
        assert_eq!(rules, ["========", "--------", "--------", "========"]);
        assert!(text.contains("EFI_CAPSULE_HEADER.CapsuleGuid"));
        assert!(text.contains("EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER.Version"));
        assert!(text.contains("EFI_FIRMWARE_IMAGE_AUTHENTICATION.MonotonicCount"));
        assert!(text.contains("EFI_CERT_BLOCK_RSA_2048_SHA256.Signature"));
        assert_eq!(text, decoded.dump_info());
    }
}
