//! Support for signed UEFI Firmware Management Protocol (FMP) capsules.
//!
//! This crate encodes a firmware image into a signed FMP capsule and decodes such capsules back
//! into their layers for inspection. Each layer has its own record type with `encode`, `decode`
//! and `dump_info`:
//!
//! - [`capsule_header::UefiCapsuleHeader`]: EFI_CAPSULE_HEADER
//! - [`fmp_header::FmpCapsuleHeader`]: EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER and its image headers
//! - [`auth_header::FmpAuthHeader`]: EFI_FIRMWARE_IMAGE_AUTHENTICATION
//! - [`cert_block::CertBlockRsa2048Sha256`]: EFI_CERT_BLOCK_RSA_2048_SHA256
//!
//! Signing goes through the [`signing::SigningCapability`] trait. With the `std` feature an
//! in-process RSA signer and an `openssl` based signer are provided, along with the
//! `generate_capsule` command line tool.
//!
//! ## Examples
//!
//! ```
//! use patina_capsule::{CapsuleBuilder, decode_capsule, err::Result, guid::Guid, signing::SigningCapability};
//!
//! struct FixedSigner;
//!
//! impl SigningCapability for FixedSigner {
//!     fn derive_public_modulus(&self) -> Result<Vec<u8>> {
//!         Ok(vec![0xc3; 256])
//!     }
//!
//!     fn sign_rsa2048_sha256(&self, _data: &[u8]) -> Result<Vec<u8>> {
//!         Ok(vec![0x5a; 256])
//!     }
//! }
//!
//! let image_type = Guid::try_from_string("8A1B2C3D-4E5F-6071-8293-A4B5C6D7E8F9").unwrap().to_efi_guid();
//! let capsule = CapsuleBuilder::new(image_type)
//!     .with_persist_across_reset(true)
//!     .with_monotonic_count(1)
//!     .encode(b"firmware", &FixedSigner)
//!     .unwrap();
//!
//! let decoded = decode_capsule(&capsule).unwrap();
//! assert_eq!(decoded.image_payload(), b"firmware");
//! assert_eq!(decoded.auth_header.monotonic_count, 1);
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod auth_header;
pub mod capsule;
pub mod capsule_header;
pub mod cert_block;
pub mod err;
pub mod fmp_header;
pub mod guid;
pub mod signing;

pub use capsule::{CapsuleBuilder, DecodedCapsule, decode_capsule};
pub use err::CapsuleError;
