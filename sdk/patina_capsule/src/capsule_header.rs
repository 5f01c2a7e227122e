//! EFI_CAPSULE_HEADER support.
//!
//! ```text
//! typedef struct {
//!   EFI_GUID CapsuleGuid;
//!   UINT32   HeaderSize;
//!   UINT32   Flags;
//!   UINT32   CapsuleImageSize;
//! } EFI_CAPSULE_HEADER;
//! ```
//!
//! `HeaderSize` may exceed the structure size; the payload always starts at `HeaderSize`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::{string::String, vec, vec::Vec};
use core::fmt::Write;

use bitflags::bitflags;
use r_efi::efi;
use scroll::{
    Pread, Pwrite,
    ctx::{TryFromCtx, TryIntoCtx},
};

use crate::{
    err::{CapsuleError, Result},
    guid::{self, Guid},
};

/// EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID
pub const EFI_FIRMWARE_MANAGEMENT_CAPSULE_ID_GUID: efi::Guid =
    efi::Guid::from_fields(0x6dcbd5ed, 0xe82d, 0x4c44, 0xbd, 0xa1, &[0x71, 0x94, 0x19, 0x9a, 0xd9, 0x2a]);

/// Size of EFI_CAPSULE_HEADER.
pub const UEFI_CAPSULE_HEADER_SIZE: usize = 28;

bitflags! {
    /// EFI_CAPSULE_HEADER.Flags
    ///
    /// The low 16 bits are defined by the capsule GUID.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct CapsuleFlags: u32 {
        /// Mask of the capsule GUID specific bits.
        const OEM_FLAGS = 0x0000_FFFF;
        /// CAPSULE_FLAGS_PERSIST_ACROSS_RESET
        const PERSIST_ACROSS_RESET = 0x0001_0000;
        /// CAPSULE_FLAGS_POPULATE_SYSTEM_TABLE
        const POPULATE_SYSTEM_TABLE = 0x0002_0000;
        /// CAPSULE_FLAGS_INITIATE_RESET
        const INITIATE_RESET = 0x0004_0000;
    }
}

#[derive(Debug, Clone, Copy)]
struct RawCapsuleHeader {
    capsule_guid: efi::Guid,
    header_size: u32,
    flags: u32,
    capsule_image_size: u32,
}

impl TryIntoCtx<scroll::Endian> for RawCapsuleHeader {
    type Error = scroll::Error;

    fn try_into_ctx(self, dest: &mut [u8], ctx: scroll::Endian) -> core::result::Result<usize, Self::Error> {
        let mut offset = 0;
        dest.gwrite_with(Guid::from_ref(&self.capsule_guid), &mut offset, ctx)?;
        dest.gwrite_with(self.header_size, &mut offset, ctx)?;
        dest.gwrite_with(self.flags, &mut offset, ctx)?;
        dest.gwrite_with(self.capsule_image_size, &mut offset, ctx)?;
        Ok(offset)
    }
}

impl TryFromCtx<'_, scroll::Endian> for RawCapsuleHeader {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], ctx: scroll::Endian) -> core::result::Result<(Self, usize), Self::Error> {
        let mut offset = 0;
        let header = RawCapsuleHeader {
            capsule_guid: from.gread_with::<guid::OwnedGuid>(&mut offset, ctx)?.to_efi_guid(),
            header_size: from.gread_with(&mut offset, ctx)?,
            flags: from.gread_with(&mut offset, ctx)?,
            capsule_image_size: from.gread_with(&mut offset, ctx)?,
        };
        Ok((header, offset))
    }
}

/// The outermost capsule layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UefiCapsuleHeader {
    /// Identifies the capsule payload format.
    pub capsule_guid: efi::Guid,
    /// Offset of the payload. Never below [`UEFI_CAPSULE_HEADER_SIZE`].
    pub header_size: u32,
    /// Capsule GUID specific flags, the low 16 bits of `Flags`.
    pub oem_flags: u16,
    /// CAPSULE_FLAGS_PERSIST_ACROSS_RESET
    pub persist_across_reset: bool,
    /// CAPSULE_FLAGS_POPULATE_SYSTEM_TABLE
    pub populate_system_table: bool,
    /// CAPSULE_FLAGS_INITIATE_RESET
    pub initiate_reset: bool,
    /// Everything after the header.
    pub payload: Vec<u8>,
}

impl UefiCapsuleHeader {
    /// A capsule header with no flags set around `payload`.
    pub fn new(capsule_guid: efi::Guid, payload: Vec<u8>) -> Self {
        Self {
            capsule_guid,
            header_size: UEFI_CAPSULE_HEADER_SIZE as u32,
            oem_flags: 0,
            persist_across_reset: false,
            populate_system_table: false,
            initiate_reset: false,
            payload,
        }
    }

    /// The composed `Flags` value.
    pub fn flags(&self) -> CapsuleFlags {
        let mut flags = CapsuleFlags::from_bits_retain(self.oem_flags as u32);
        flags.set(CapsuleFlags::PERSIST_ACROSS_RESET, self.persist_across_reset);
        flags.set(CapsuleFlags::POPULATE_SYSTEM_TABLE, self.populate_system_table);
        flags.set(CapsuleFlags::INITIATE_RESET, self.initiate_reset);
        flags
    }

    /// Value of `CapsuleImageSize`: header plus payload.
    pub fn capsule_image_size(&self) -> usize {
        self.header_size as usize + self.payload.len()
    }

    /// Serialize the header followed by the payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.initiate_reset && !self.persist_across_reset {
            log::error!("CAPSULE_FLAGS_INITIATE_RESET requires CAPSULE_FLAGS_PERSIST_ACROSS_RESET");
            return Err(CapsuleError::InvalidFlagCombination);
        }
        if self.populate_system_table && !self.persist_across_reset {
            log::warn!("CAPSULE_FLAGS_POPULATE_SYSTEM_TABLE set without CAPSULE_FLAGS_PERSIST_ACROSS_RESET");
        }
        if (self.header_size as usize) < UEFI_CAPSULE_HEADER_SIZE {
            log::error!("capsule header size {:#x} is below {UEFI_CAPSULE_HEADER_SIZE:#x}", self.header_size);
            return Err(CapsuleError::MalformedCapsule);
        }

        let capsule_image_size = u32::try_from(self.capsule_image_size()).map_err(|_| {
            log::error!("capsule of {:#x} bytes does not fit CapsuleImageSize", self.capsule_image_size());
            CapsuleError::PayloadTooLarge
        })?;
        let header = RawCapsuleHeader {
            capsule_guid: self.capsule_guid,
            header_size: self.header_size,
            flags: self.flags().bits(),
            capsule_image_size,
        };

        let mut buffer = vec![0u8; self.header_size as usize];
        buffer.pwrite_with(header, 0, scroll::LE)?;
        buffer.extend_from_slice(&self.payload);
        log::debug!("UEFI capsule header wraps {:#x} payload bytes", self.payload.len());
        Ok(buffer)
    }

    /// Parse a capsule. `CapsuleImageSize` must equal the buffer length.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        if buffer.len() < UEFI_CAPSULE_HEADER_SIZE {
            log::error!("{:#x} bytes is too small for a capsule header", buffer.len());
            return Err(CapsuleError::TruncatedHeader);
        }
        let header: RawCapsuleHeader = buffer.pread_with(0, scroll::LE)?;

        let header_size = header.header_size as usize;
        if header_size < UEFI_CAPSULE_HEADER_SIZE {
            log::error!("capsule header size {header_size:#x} is below {UEFI_CAPSULE_HEADER_SIZE:#x}");
            return Err(CapsuleError::MalformedCapsule);
        }
        if buffer.len() < header_size {
            log::error!("capsule header size {header_size:#x} exceeds {:#x} byte buffer", buffer.len());
            return Err(CapsuleError::TruncatedHeader);
        }
        if header.capsule_image_size as usize != buffer.len() {
            log::error!(
                "CapsuleImageSize {:#x} does not match {:#x} byte buffer",
                header.capsule_image_size,
                buffer.len()
            );
            return Err(CapsuleError::SizeMismatch {
                expected: header.capsule_image_size as usize,
                actual: buffer.len(),
            });
        }

        let flags = CapsuleFlags::from_bits_retain(header.flags);
        let reserved = flags.difference(CapsuleFlags::all());
        if !reserved.is_empty() {
            log::warn!("ignoring reserved capsule flag bits {:#010x}", reserved.bits());
        }

        log::debug!(
            "UEFI capsule header {} holds {:#x} payload bytes",
            Guid::from_ref(&header.capsule_guid),
            buffer.len() - header_size
        );
        Ok(Self {
            capsule_guid: header.capsule_guid,
            header_size: header.header_size,
            oem_flags: (flags & CapsuleFlags::OEM_FLAGS).bits() as u16,
            persist_across_reset: flags.contains(CapsuleFlags::PERSIST_ACROSS_RESET),
            populate_system_table: flags.contains(CapsuleFlags::POPULATE_SYSTEM_TABLE),
            initiate_reset: flags.contains(CapsuleFlags::INITIATE_RESET),
            payload: buffer[header_size..].to_vec(),
        })
    }

    /// Render every field and each set flag for diagnostics.
    pub fn dump_info(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "EFI_CAPSULE_HEADER.CapsuleGuid      = {}", Guid::from_ref(&self.capsule_guid));
        let _ = writeln!(out, "EFI_CAPSULE_HEADER.HeaderSize       = {:08X}", self.header_size);
        let _ = writeln!(out, "EFI_CAPSULE_HEADER.Flags            = {:08X}", self.flags().bits());
        let _ = writeln!(out, "  OEM Flags                         = {:04X}", self.oem_flags);
        if self.persist_across_reset {
            let _ = writeln!(out, "  CAPSULE_FLAGS_PERSIST_ACROSS_RESET");
        }
        if self.populate_system_table {
            let _ = writeln!(out, "  CAPSULE_FLAGS_POPULATE_SYSTEM_TABLE");
        }
        if self.initiate_reset {
            let _ = writeln!(out, "  CAPSULE_FLAGS_INITIATE_RESET");
        }
        let _ = writeln!(out, "EFI_CAPSULE_HEADER.CapsuleImageSize = {:08X}", self.capsule_image_size());
        let _ = writeln!(out, "sizeof (Payload)                    = {:08X}", self.payload.len());
        out
    }
}
