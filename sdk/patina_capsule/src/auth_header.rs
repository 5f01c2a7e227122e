//! EFI_FIRMWARE_IMAGE_AUTHENTICATION support.
//!
//! The authenticated payload header binds an FMP image to a monotonic count and a detached
//! RSA-2048/SHA-256 signature:
//!
//! ```text
//! typedef struct {
//!   UINT32  dwLength;
//!   UINT16  wRevision;
//!   UINT16  wCertificateType;
//! } WIN_CERTIFICATE;
//!
//! typedef struct {
//!   WIN_CERTIFICATE Hdr;
//!   EFI_GUID        CertType;
//!   UINT8           CertData[];
//! } WIN_CERTIFICATE_UEFI_GUID;
//!
//! typedef struct {
//!   UINT64                    MonotonicCount;
//!   WIN_CERTIFICATE_UEFI_GUID AuthInfo;
//! } EFI_FIRMWARE_IMAGE_AUTHENTICATION;
//! ```
//!
//! The image payload follows `CertData` directly; its length is whatever remains of the buffer.
//! Decoding does not verify the signature.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{string::String, vec, vec::Vec};
use core::fmt::Write;

use r_efi::efi;
use scroll::{
    Pread, Pwrite,
    ctx::{TryFromCtx, TryIntoCtx},
};

use crate::{
    cert_block::{CERT_BLOCK_RSA_2048_SHA256_SIZE, CertBlockRsa2048Sha256},
    err::{CapsuleError, Result},
    guid::{self, GUID_SIZE, Guid},
};

/// WIN_CERT_REVISION
pub const WIN_CERT_REVISION: u16 = 0x0200;

/// WIN_CERT_TYPE_EFI_GUID
pub const WIN_CERT_TYPE_EFI_GUID: u16 = 0x0EF1;

/// EFI_CERT_TYPE_RSA2048_SHA256_GUID
pub const EFI_CERT_TYPE_RSA2048_SHA256_GUID: efi::Guid =
    efi::Guid::from_fields(0xa7717414, 0xc616, 0x4977, 0x94, 0x20, &[0x84, 0x47, 0x12, 0xa7, 0x35, 0xbf]);

/// Size of the WIN_CERTIFICATE header (dwLength, wRevision, wCertificateType).
pub const WIN_CERTIFICATE_SIZE: usize = 8;

/// Size of WIN_CERTIFICATE_UEFI_GUID up to, not including, CertData.
pub const WIN_CERTIFICATE_UEFI_GUID_SIZE: usize = WIN_CERTIFICATE_SIZE + GUID_SIZE;

/// Fixed-size portion of EFI_FIRMWARE_IMAGE_AUTHENTICATION preceding CertData.
pub const FMP_AUTH_HEADER_FIXED_SIZE: usize = 8 + WIN_CERTIFICATE_UEFI_GUID_SIZE;

/// `dwLength` of an RSA-2048/SHA-256 authentication header.
pub const RSA2048_SHA256_AUTH_INFO_LENGTH: u32 =
    (WIN_CERTIFICATE_UEFI_GUID_SIZE + CERT_BLOCK_RSA_2048_SHA256_SIZE) as u32;

/// The fixed fields of EFI_FIRMWARE_IMAGE_AUTHENTICATION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AuthInfoHeader {
    monotonic_count: u64,
    length: u32,
    revision: u16,
    certificate_type: u16,
    cert_type: efi::Guid,
}

impl TryIntoCtx<scroll::Endian> for AuthInfoHeader {
    type Error = scroll::Error;

    fn try_into_ctx(self, dest: &mut [u8], ctx: scroll::Endian) -> core::result::Result<usize, Self::Error> {
        let mut offset = 0;
        dest.gwrite_with(self.monotonic_count, &mut offset, ctx)?;
        dest.gwrite_with(self.length, &mut offset, ctx)?;
        dest.gwrite_with(self.revision, &mut offset, ctx)?;
        dest.gwrite_with(self.certificate_type, &mut offset, ctx)?;
        dest.gwrite_with(Guid::from_ref(&self.cert_type), &mut offset, ctx)?;
        Ok(offset)
    }
}

impl TryFromCtx<'_, scroll::Endian> for AuthInfoHeader {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], ctx: scroll::Endian) -> core::result::Result<(Self, usize), Self::Error> {
        let mut offset = 0;
        let header = AuthInfoHeader {
            monotonic_count: from.gread_with(&mut offset, ctx)?,
            length: from.gread_with(&mut offset, ctx)?,
            revision: from.gread_with(&mut offset, ctx)?,
            certificate_type: from.gread_with(&mut offset, ctx)?,
            cert_type: from.gread_with::<guid::OwnedGuid>(&mut offset, ctx)?.to_efi_guid(),
        };
        Ok((header, offset))
    }
}

/// An authenticated FMP payload: monotonic count, RSA-2048/SHA-256 certificate and image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmpAuthHeader {
    /// Anti-rollback counter appended to the payload before signing.
    pub monotonic_count: u64,
    /// Certificate block carrying the public modulus and signature.
    pub cert_block: CertBlockRsa2048Sha256,
    /// The image that was signed.
    pub payload: Vec<u8>,
}

impl FmpAuthHeader {
    /// Create an authentication header around `payload`.
    pub fn new(monotonic_count: u64, cert_block: CertBlockRsa2048Sha256, payload: Vec<u8>) -> Self {
        Self { monotonic_count, cert_block, payload }
    }

    /// Value of `AuthInfo.Hdr.dwLength`: WIN_CERTIFICATE_UEFI_GUID through the certificate block.
    pub const fn auth_info_length(&self) -> u32 {
        RSA2048_SHA256_AUTH_INFO_LENGTH
    }

    /// Serialize as `MonotonicCount || AuthInfo || CertData || payload`.
    pub fn encode(&self) -> Vec<u8> {
        let header = AuthInfoHeader {
            monotonic_count: self.monotonic_count,
            length: self.auth_info_length(),
            revision: WIN_CERT_REVISION,
            certificate_type: WIN_CERT_TYPE_EFI_GUID,
            cert_type: EFI_CERT_TYPE_RSA2048_SHA256_GUID,
        };
        let mut buffer = vec![0u8; FMP_AUTH_HEADER_FIXED_SIZE];
        // Sized for the fixed header.
        let _ = buffer.pwrite_with(header, 0, scroll::LE);
        buffer.extend(self.cert_block.encode());
        buffer.extend_from_slice(&self.payload);
        log::debug!("FMP auth header wraps {:#x} payload bytes", self.payload.len());
        buffer
    }

    /// Parse an authenticated payload.
    ///
    /// The certificate shape is validated before its length so that a foreign certificate is
    /// always reported as unsupported rather than as a size problem.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let header: AuthInfoHeader = buffer.pread_with(0, scroll::LE)?;

        if header.revision != WIN_CERT_REVISION || header.certificate_type != WIN_CERT_TYPE_EFI_GUID {
            log::error!(
                "unsupported WIN_CERTIFICATE revision {:#06x} type {:#06x}",
                header.revision,
                header.certificate_type
            );
            return Err(CapsuleError::UnsupportedCertificateFormat);
        }
        if header.cert_type != EFI_CERT_TYPE_RSA2048_SHA256_GUID {
            log::error!("unsupported certificate type {}", Guid::from_ref(&header.cert_type));
            return Err(CapsuleError::UnsupportedCertificateType);
        }

        let cert_data_start = FMP_AUTH_HEADER_FIXED_SIZE;
        let cert_data_end = (header.length as usize)
            .checked_sub(WIN_CERTIFICATE_UEFI_GUID_SIZE)
            .and_then(|cert_data_size| cert_data_start.checked_add(cert_data_size))
            .ok_or(CapsuleError::TruncatedInput)?;
        if cert_data_end > buffer.len() {
            log::error!("certificate data ends at {cert_data_end:#x}, buffer is {:#x} bytes", buffer.len());
            return Err(CapsuleError::TruncatedInput);
        }

        let cert_data = &buffer[cert_data_start..cert_data_end];
        let cert_block = CertBlockRsa2048Sha256::decode(cert_data)?;
        if cert_data.len() != CERT_BLOCK_RSA_2048_SHA256_SIZE {
            return Err(CapsuleError::SizeMismatch {
                expected: CERT_BLOCK_RSA_2048_SHA256_SIZE,
                actual: cert_data.len(),
            });
        }

        Ok(Self { monotonic_count: header.monotonic_count, cert_block, payload: buffer[cert_data_end..].to_vec() })
    }

    /// Render every field for diagnostics.
    pub fn dump_info(&self) -> String {
        const PREFIX: &str = "EFI_FIRMWARE_IMAGE_AUTHENTICATION.";
        let mut out = String::new();
        let mut field = |name: &str, value: &dyn core::fmt::Display| {
            let _ = writeln!(out, "{:<63} = {value}", alloc::format!("{PREFIX}{name}"));
        };
        field("MonotonicCount", &format_args!("{:016X}", self.monotonic_count));
        field("AuthInfo.Hdr.dwLength", &format_args!("{:08X}", self.auth_info_length()));
        field("AuthInfo.Hdr.wRevision", &format_args!("{WIN_CERT_REVISION:04X}"));
        field("AuthInfo.Hdr.wCertificateType", &format_args!("{WIN_CERT_TYPE_EFI_GUID:04X}"));
        field("AuthInfo.CertType", &Guid::from_ref(&EFI_CERT_TYPE_RSA2048_SHA256_GUID));
        let _ = writeln!(out, "{:<63} = {:08X}", "sizeof (Payload)", self.payload.len());
        out.push_str(&self.cert_block.dump_info());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cert_block::EFI_HASH_ALGORITHM_SHA256_GUID;

    fn sample_header(payload: &[u8]) -> FmpAuthHeader {
        let cert_block =
            CertBlockRsa2048Sha256::new(EFI_HASH_ALGORITHM_SHA256_GUID, &[0x5a; 256], &[0xa5; 256]).unwrap();
        FmpAuthHeader::new(0x1122_3344_5566_7788, cert_block, payload.to_vec())
    }

    #[test]
    fn encoded_layout_matches_firmware_image_authentication() {
        let bytes = sample_header(b"image").encode();
        assert_eq!(bytes.len(), 32 + 528 + 5);
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_le_bytes());
        // dwLength = WIN_CERTIFICATE (8) + CertType (16) + cert block (528)
        assert_eq!(&bytes[8..12], &552u32.to_le_bytes());
        assert_eq!(&bytes[12..14], &[0x00, 0x02]);
        assert_eq!(&bytes[14..16], &[0xf1, 0x0e]);
        assert_eq!(
            &bytes[16..32],
            &[0x14, 0x74, 0x71, 0xa7, 0x16, 0xc6, 0x77, 0x49, 0x94, 0x20, 0x84, 0x47, 0x12, 0xa7, 0x35, 0xbf]
        );
        assert_eq!(&bytes[32..48], EFI_HASH_ALGORITHM_SHA256_GUID.as_bytes());
        assert_eq!(&bytes[560..], b"image");
    }

    #[test]
    fn decode_reads_back_encoded_header() {
        let header = sample_header(&[0, 1, 2, 3, 4, 5]);
        assert_eq!(FmpAuthHeader::decode(&header.encode()).unwrap(), header);

        let empty = sample_header(&[]);
        assert_eq!(FmpAuthHeader::decode(&empty.encode()).unwrap(), empty);
    }

    #[test]
    fn short_fixed_header_is_malformed_input() {
        let bytes = sample_header(b"image").encode();
        assert_eq!(FmpAuthHeader::decode(&bytes[..31]), Err(CapsuleError::MalformedInput));
    }

    #[test]
    fn certificate_type_other_than_efi_guid_is_unsupported_format() {
        let mut bytes = sample_header(b"image").encode();
        bytes[14..16].copy_from_slice(&0x0002u16.to_le_bytes());
        // Unrelated fields are not inspected once the certificate type is rejected.
        bytes[8..12].copy_from_slice(&0xffff_ffffu32.to_le_bytes());
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::UnsupportedCertificateFormat));
        assert_eq!(FmpAuthHeader::decode(&bytes[..32]), Err(CapsuleError::UnsupportedCertificateFormat));
    }

    #[test]
    fn unknown_revision_is_unsupported_format() {
        let mut bytes = sample_header(b"image").encode();
        bytes[12..14].copy_from_slice(&0x0100u16.to_le_bytes());
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::UnsupportedCertificateFormat));
    }

    #[test]
    fn pkcs7_cert_type_is_unsupported_type() {
        let mut bytes = sample_header(b"image").encode();
        // EFI_CERT_TYPE_PKCS7_GUID 4aafd29d-68df-49ee-8aa9-347d375665a7
        let pkcs7_guid =
            [0x9d, 0xd2, 0xaf, 0x4a, 0xdf, 0x68, 0xee, 0x49, 0x8a, 0xa9, 0x34, 0x7d, 0x37, 0x56, 0x65, 0xa7];
        bytes[16..32].copy_from_slice(&pkcs7_guid);
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::UnsupportedCertificateType));
    }

    #[test]
    fn short_certificate_block_is_truncated_input() {
        let bytes = sample_header(&[]).encode();
        for len in [32, 100, 559] {
            assert_eq!(FmpAuthHeader::decode(&bytes[..len]), Err(CapsuleError::TruncatedInput), "len {len}");
        }

        // dwLength claiming less certificate data than the RSA-2048 block needs.
        let mut bytes = sample_header(&[0u8; 64]).encode();
        bytes[8..12].copy_from_slice(&(552u32 - 16).to_le_bytes());
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::TruncatedInput));

        bytes[8..12].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::TruncatedInput));
    }

    #[test]
    fn oversized_certificate_data_is_size_mismatch() {
        let mut bytes = sample_header(&[0u8; 64]).encode();
        bytes[8..12].copy_from_slice(&(552u32 + 8).to_le_bytes());
        assert_eq!(FmpAuthHeader::decode(&bytes), Err(CapsuleError::SizeMismatch { expected: 528, actual: 536 }));
    }

    #[test]
    fn dump_info_is_stable() {
        let header = sample_header(b"image");
        let text = header.dump_info();
        let value_of = |name: &str| {
            text.lines().find(|line| line.starts_with(name)).and_then(|line| line.split(" = ").nth(1)).unwrap()
        };
        assert_eq!(value_of("EFI_FIRMWARE_IMAGE_AUTHENTICATION.MonotonicCount"), "1122334455667788");
        assert_eq!(value_of("EFI_FIRMWARE_IMAGE_AUTHENTICATION.AuthInfo.Hdr.dwLength"), "00000228");
        assert_eq!(value_of("EFI_FIRMWARE_IMAGE_AUTHENTICATION.AuthInfo.Hdr.wRevision"), "0200");
        assert_eq!(value_of("EFI_FIRMWARE_IMAGE_AUTHENTICATION.AuthInfo.Hdr.wCertificateType"), "0EF1");
        assert_eq!(
            value_of("EFI_FIRMWARE_IMAGE_AUTHENTICATION.AuthInfo.CertType"),
            "A7717414-C616-4977-9420-844712A735BF"
        );
        assert_eq!(value_of("sizeof (Payload)"), "00000005");
        assert!(text.contains("EFI_CERT_BLOCK_RSA_2048_SHA256.HashType"));
        assert_eq!(text, header.dump_info());
    }
}
