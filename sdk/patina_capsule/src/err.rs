//! Error types and conversions for the capsule crate.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0

use core::fmt;

use r_efi::efi;

/// A specialized [`Result`](core::result::Result) type for capsule operations.
pub type Result<T> = core::result::Result<T, CapsuleError>;

/// Error definitions for capsule encoding, decoding and signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleError {
    /// The buffer ended before a fixed-size field could be read.
    MalformedInput,
    /// The buffer is shorter than the fixed-size certificate block.
    TruncatedInput,
    /// The buffer is shorter than the UEFI capsule header it declares.
    TruncatedHeader,
    /// A declared size field disagrees with the actual buffer length.
    SizeMismatch {
        /// Size declared by the header.
        expected: usize,
        /// Size actually present.
        actual: usize,
    },
    /// The FMP capsule structure is not valid.
    MalformedCapsule,
    /// The WIN_CERTIFICATE revision or certificate type is not supported.
    UnsupportedCertificateFormat,
    /// The certificate type GUID is not EFI_CERT_TYPE_RSA2048_SHA256_GUID.
    UnsupportedCertificateType,
    /// InitiateReset was requested without PersistAcrossReset.
    InvalidFlagCombination,
    /// A second payload was added to an FMP capsule.
    MultiplePayloadsUnsupported,
    /// An FMP capsule was encoded before a payload was added.
    MissingPayload,
    /// The requested FMP image index does not exist.
    IndexOutOfRange,
    /// A public key or signature is not exactly 256 bytes.
    InvalidCertificateSize(usize),
    /// The payload does not fit into the 32-bit size fields.
    PayloadTooLarge,
    /// Signing the payload failed.
    SigningFailed,
    /// The private key could not be read or is not usable.
    KeyError,
}

impl fmt::Display for CapsuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapsuleError::MalformedInput => write!(f, "buffer too short for fixed-size field"),
            CapsuleError::TruncatedInput => write!(f, "buffer too short for RSA2048/SHA256 certificate block"),
            CapsuleError::TruncatedHeader => write!(f, "buffer too short for UEFI capsule header"),
            CapsuleError::SizeMismatch { expected, actual } => {
                write!(f, "size mismatch: header declares {expected:#x} bytes, found {actual:#x}")
            }
            CapsuleError::MalformedCapsule => write!(f, "malformed FMP capsule"),
            CapsuleError::UnsupportedCertificateFormat => write!(f, "unsupported WIN_CERTIFICATE format"),
            CapsuleError::UnsupportedCertificateType => write!(f, "unsupported certificate type GUID"),
            CapsuleError::InvalidFlagCombination => {
                write!(f, "InitiateReset requires PersistAcrossReset")
            }
            CapsuleError::MultiplePayloadsUnsupported => write!(f, "only one payload per capsule is supported"),
            CapsuleError::MissingPayload => write!(f, "no payload added to FMP capsule"),
            CapsuleError::IndexOutOfRange => write!(f, "FMP capsule image index out of range"),
            CapsuleError::InvalidCertificateSize(size) => {
                write!(f, "expected 256 bytes of certificate data, found {size}")
            }
            CapsuleError::PayloadTooLarge => write!(f, "payload too large for capsule"),
            CapsuleError::SigningFailed => write!(f, "can not sign payload"),
            CapsuleError::KeyError => write!(f, "private key unreadable or invalid"),
        }
    }
}

impl core::error::Error for CapsuleError {}

impl From<scroll::Error> for CapsuleError {
    fn from(_: scroll::Error) -> Self {
        CapsuleError::MalformedInput
    }
}

impl From<CapsuleError> for efi::Status {
    fn from(value: CapsuleError) -> Self {
        match value {
            CapsuleError::InvalidFlagCombination
            | CapsuleError::MultiplePayloadsUnsupported
            | CapsuleError::MissingPayload
            | CapsuleError::IndexOutOfRange
            | CapsuleError::InvalidCertificateSize(_) => efi::Status::INVALID_PARAMETER,
            CapsuleError::MalformedInput
            | CapsuleError::TruncatedInput
            | CapsuleError::TruncatedHeader
            | CapsuleError::SizeMismatch { .. }
            | CapsuleError::MalformedCapsule => efi::Status::VOLUME_CORRUPTED,
            CapsuleError::UnsupportedCertificateFormat | CapsuleError::UnsupportedCertificateType => {
                efi::Status::UNSUPPORTED
            }
            CapsuleError::PayloadTooLarge => efi::Status::BAD_BUFFER_SIZE,
            CapsuleError::SigningFailed | CapsuleError::KeyError => efi::Status::SECURITY_VIOLATION,
        }
    }
}
