//! EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER support.
//!
//! ```text
//! typedef struct {
//!   UINT32 Version;
//!   UINT16 EmbeddedDriverCount;
//!   UINT16 PayloadItemCount;
//!   UINT64 ItemOffsetList[];
//! } EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER;
//!
//! typedef struct {
//!   UINT32   Version;
//!   EFI_GUID UpdateImageTypeId;
//!   UINT8    UpdateImageIndex;
//!   UINT8    reserved_bytes[3];
//!   UINT32   UpdateImageSize;
//!   UINT32   UpdateVendorCodeSize;
//!   UINT64   UpdateHardwareInstance; // Version >= 2
//!   UINT64   ImageCapsuleSupport;    // Version >= 3
//! } EFI_FIRMWARE_MANAGEMENT_CAPSULE_IMAGE_HEADER;
//! ```
//!
//! Offsets in `ItemOffsetList` are relative to the start of the FMP capsule header. Embedded driver
//! items come first, followed by the payload items.
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
use scroll::{Pread, Pwrite};

use crate::{
    err::{CapsuleError, Result},
    guid::{self, Guid},
};

/// EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER_INIT_VERSION
pub const FMP_CAPSULE_HEADER_INIT_VERSION: u32 = 0x0000_0001;

/// EFI_FIRMWARE_MANAGEMENT_CAPSULE_IMAGE_HEADER_INIT_VERSION used when encoding.
pub const FMP_CAPSULE_IMAGE_HEADER_INIT_VERSION: u32 = 0x0000_0002;

/// Size of the FMP capsule header up to, not including, `ItemOffsetList`.
pub const FMP_CAPSULE_HEADER_SIZE: usize = 8;

const ITEM_OFFSET_SIZE: usize = core::mem::size_of::<u64>();

const IMAGE_HEADER_V1_SIZE: usize = 32;
const IMAGE_HEADER_V2_SIZE: usize = 40;
const IMAGE_HEADER_V3_SIZE: usize = 48;

/// Encoded size of an image header of the given version.
pub const fn image_header_size(version: u32) -> usize {
    match version {
        0 | 1 => IMAGE_HEADER_V1_SIZE,
        2 => IMAGE_HEADER_V2_SIZE,
        _ => IMAGE_HEADER_V3_SIZE,
    }
}

/// One payload item of an FMP capsule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FmpCapsuleImageHeader {
    /// Layout version of this header.
    pub version: u32,
    /// FMP image type the payload updates.
    pub update_image_type_id: efi::Guid,
    /// 1-based FMP image index.
    pub update_image_index: u8,
    /// Target hardware instance, zero for any. Only encoded from version 2.
    pub update_hardware_instance: u64,
    /// Only encoded from version 3.
    pub image_capsule_support: u64,
    /// The update image.
    pub payload: Vec<u8>,
    /// Vendor code bytes following the update image.
    pub vendor_code: Vec<u8>,
}

impl FmpCapsuleImageHeader {
    /// A version 2 image header for image index 1.
    pub fn new(update_image_type_id: efi::Guid, payload: Vec<u8>, update_hardware_instance: u64) -> Self {
        Self {
            version: FMP_CAPSULE_IMAGE_HEADER_INIT_VERSION,
            update_image_type_id,
            update_image_index: 1,
            update_hardware_instance,
            image_capsule_support: 0,
            payload,
            vendor_code: Vec::new(),
        }
    }

    /// Value of `UpdateImageSize`.
    pub fn update_image_size(&self) -> usize {
        self.payload.len()
    }

    /// Value of `UpdateVendorCodeSize`.
    pub fn update_vendor_code_size(&self) -> usize {
        self.vendor_code.len()
    }

    /// Serialize the header followed by the payload and vendor code.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let image_size = u32::try_from(self.payload.len()).map_err(|_| CapsuleError::PayloadTooLarge)?;
        let vendor_code_size = u32::try_from(self.vendor_code.len()).map_err(|_| CapsuleError::PayloadTooLarge)?;

        let header_size = image_header_size(self.version);
        let mut buffer = vec![0u8; header_size];
        let mut offset = 0;
        buffer.gwrite_with(self.version, &mut offset, scroll::LE)?;
        guid::write_guid(&mut buffer, &mut offset, &self.update_image_type_id)?;
        buffer.gwrite_with(self.update_image_index, &mut offset, scroll::LE)?;
        offset += 3; // reserved
        buffer.gwrite_with(image_size, &mut offset, scroll::LE)?;
        buffer.gwrite_with(vendor_code_size, &mut offset, scroll::LE)?;
        if self.version >= 2 {
            buffer.gwrite_with(self.update_hardware_instance, &mut offset, scroll::LE)?;
        }
        if self.version >= 3 {
            buffer.gwrite_with(self.image_capsule_support, &mut offset, scroll::LE)?;
        }
        debug_assert_eq!(offset, header_size);

        buffer.extend_from_slice(&self.payload);
        buffer.extend_from_slice(&self.vendor_code);
        Ok(buffer)
    }

    /// Parse one payload item. `item` must span exactly the item, header through vendor code.
    pub fn decode(item: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let version: u32 = item.gread_with(&mut offset, scroll::LE)?;
        if version < 1 {
            log::error!("FMP image header version {version:#x} is invalid");
            return Err(CapsuleError::MalformedCapsule);
        }
        let update_image_type_id = guid::read_guid(item, &mut offset)?;
        let update_image_index: u8 = item.gread_with(&mut offset, scroll::LE)?;
        offset += 3; // reserved
        let image_size: u32 = item.gread_with(&mut offset, scroll::LE)?;
        let vendor_code_size: u32 = item.gread_with(&mut offset, scroll::LE)?;
        let update_hardware_instance: u64 = if version >= 2 { item.gread_with(&mut offset, scroll::LE)? } else { 0 };
        let image_capsule_support: u64 = if version >= 3 { item.gread_with(&mut offset, scroll::LE)? } else { 0 };

        if update_image_index < 1 {
            log::error!("FMP image index must start at 1");
            return Err(CapsuleError::MalformedCapsule);
        }

        let expected = offset + image_size as usize + vendor_code_size as usize;
        if expected != item.len() {
            log::error!("FMP image item declares {expected:#x} bytes, item is {:#x} bytes", item.len());
            return Err(CapsuleError::SizeMismatch { expected, actual: item.len() });
        }

        let payload_end = offset + image_size as usize;
        Ok(Self {
            version,
            update_image_type_id,
            update_image_index,
            update_hardware_instance,
            image_capsule_support,
            payload: item[offset..payload_end].to_vec(),
            vendor_code: item[payload_end..].to_vec(),
        })
    }

    /// Render every field for diagnostics.
    pub fn dump_info(&self) -> String {
        const PREFIX: &str = "EFI_FIRMWARE_MANAGEMENT_CAPSULE_IMAGE_HEADER.";
        let mut out = String::new();
        let mut field = |name: &str, value: &dyn core::fmt::Display| {
            let _ = writeln!(out, "{:<68} = {value}", alloc::format!("{PREFIX}{name}"));
        };
        field("Version", &format_args!("{:08X}", self.version));
        field("UpdateImageTypeId", &Guid::from_ref(&self.update_image_type_id));
        field("UpdateImageIndex", &format_args!("{:08X}", self.update_image_index));
        field("UpdateImageSize", &format_args!("{:08X}", self.update_image_size()));
        field("UpdateVendorCodeSize", &format_args!("{:08X}", self.update_vendor_code_size()));
        if self.version >= 2 {
            field("UpdateHardwareInstance", &format_args!("{:016X}", self.update_hardware_instance));
        }
        if self.version >= 3 {
            field("ImageCapsuleSupport", &format_args!("{:016X}", self.image_capsule_support));
        }
        let _ = writeln!(out, "{:<68} = {:08X}", "sizeof (Payload)", self.payload.len());
        let _ = writeln!(out, "{:<68} = {:08X}", "sizeof (VendorCodeBytes)", self.vendor_code.len());
        out
    }
}

/// An FMP capsule: a header, its offset list and the payload items it points at.
///
/// Only a single payload item can be added for encoding. Decoding accepts any number of items;
/// embedded driver items are skipped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FmpCapsuleHeader {
    embedded_driver_count: u16,
    item_offsets: Vec<u64>,
    images: Vec<FmpCapsuleImageHeader>,
}

impl FmpCapsuleHeader {
    /// An empty FMP capsule.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage the single payload of this capsule.
    ///
    /// A second call fails with [`CapsuleError::MultiplePayloadsUnsupported`] and leaves the first
    /// payload in place.
    pub fn add_payload(
        &mut self,
        update_image_type_id: efi::Guid,
        payload: Vec<u8>,
        update_hardware_instance: u64,
    ) -> Result<()> {
        if !self.images.is_empty() {
            log::error!("FMP capsule already holds a payload");
            return Err(CapsuleError::MultiplePayloadsUnsupported);
        }
        self.images.push(FmpCapsuleImageHeader::new(update_image_type_id, payload, update_hardware_instance));
        Ok(())
    }

    /// Value of `PayloadItemCount`.
    pub fn payload_item_count(&self) -> usize {
        self.images.len()
    }

    /// Value of `EmbeddedDriverCount` as decoded.
    pub fn embedded_driver_count(&self) -> usize {
        self.embedded_driver_count as usize
    }

    /// `ItemOffsetList` as decoded or last encoded.
    pub fn item_offsets(&self) -> &[u64] {
        &self.item_offsets
    }

    /// The payload item at `index`.
    pub fn image_header(&self, index: usize) -> Result<&FmpCapsuleImageHeader> {
        self.images.get(index).ok_or_else(|| {
            log::error!("FMP image index {index} out of range, capsule has {} items", self.images.len());
            CapsuleError::IndexOutOfRange
        })
    }

    /// Serialize the header, offset list and payload items. Embedded drivers are never emitted.
    pub fn encode(&mut self) -> Result<Vec<u8>> {
        if self.images.is_empty() {
            log::error!("FMP capsule has no payload");
            return Err(CapsuleError::MissingPayload);
        }
        let items = self.images.iter().map(FmpCapsuleImageHeader::encode).collect::<Result<Vec<_>>>()?;
        let item_count = u16::try_from(items.len()).map_err(|_| CapsuleError::PayloadTooLarge)?;

        let mut offsets = Vec::with_capacity(items.len());
        let mut next = (FMP_CAPSULE_HEADER_SIZE + ITEM_OFFSET_SIZE * items.len()) as u64;
        for item in &items {
            offsets.push(next);
            next += item.len() as u64;
        }

        let mut buffer = vec![0u8; FMP_CAPSULE_HEADER_SIZE + ITEM_OFFSET_SIZE * items.len()];
        let mut offset = 0;
        buffer.gwrite_with(FMP_CAPSULE_HEADER_INIT_VERSION, &mut offset, scroll::LE)?;
        buffer.gwrite_with(0u16, &mut offset, scroll::LE)?;
        buffer.gwrite_with(item_count, &mut offset, scroll::LE)?;
        for item_offset in &offsets {
            buffer.gwrite_with(*item_offset, &mut offset, scroll::LE)?;
        }
        for item in items {
            buffer.extend(item);
        }

        self.embedded_driver_count = 0;
        self.item_offsets = offsets;
        log::debug!("FMP capsule header wraps {item_count} item(s), {:#x} bytes", buffer.len());
        Ok(buffer)
    }

    /// Parse an FMP capsule.
    pub fn decode(buffer: &[u8]) -> Result<Self> {
        let mut offset = 0;
        let version: u32 = buffer.gread_with(&mut offset, scroll::LE)?;
        let embedded_driver_count: u16 = buffer.gread_with(&mut offset, scroll::LE)?;
        let payload_item_count: u16 = buffer.gread_with(&mut offset, scroll::LE)?;

        if version != FMP_CAPSULE_HEADER_INIT_VERSION {
            log::error!("unsupported FMP capsule header version {version:#x}");
            return Err(CapsuleError::MalformedCapsule);
        }
        if payload_item_count == 0 {
            log::error!("FMP capsule has no payload items");
            return Err(CapsuleError::MalformedCapsule);
        }

        let item_count = embedded_driver_count as usize + payload_item_count as usize;
        let item_offsets = (0..item_count)
            .map(|_| buffer.gread_with::<u64>(&mut offset, scroll::LE))
            .collect::<core::result::Result<Vec<_>, _>>()?;

        // Items must follow the offset list, stay inside the buffer and be ordered.
        let mut previous = None;
        for &item_offset in &item_offsets {
            let in_bounds = item_offset >= offset as u64 && item_offset < buffer.len() as u64;
            let ascending = previous.map_or(true, |previous| item_offset > previous);
            if !in_bounds || !ascending {
                log::error!("invalid FMP item offset {item_offset:#x} in {:#x} byte capsule", buffer.len());
                return Err(CapsuleError::MalformedCapsule);
            }
            previous = Some(item_offset);
        }

        let mut images = Vec::with_capacity(payload_item_count as usize);
        for index in embedded_driver_count as usize..item_count {
            let start = item_offsets[index] as usize;
            let end = item_offsets.get(index + 1).map_or(buffer.len(), |&next| next as usize);
            images.push(FmpCapsuleImageHeader::decode(&buffer[start..end])?);
        }

        log::debug!("FMP capsule holds {embedded_driver_count} driver(s) and {payload_item_count} payload(s)");
        Ok(Self { embedded_driver_count, item_offsets, images })
    }

    /// Render the header and every payload item for diagnostics.
    pub fn dump_info(&self) -> String {
        const PREFIX: &str = "EFI_FIRMWARE_MANAGEMENT_CAPSULE_HEADER.";
        let mut out = String::new();
        let mut field = |name: &str, value: &dyn core::fmt::Display| {
            let _ = writeln!(out, "{:<58} = {value}", alloc::format!("{PREFIX}{name}"));
        };
        field("Version", &format_args!("{FMP_CAPSULE_HEADER_INIT_VERSION:08X}"));
        field("EmbeddedDriverCount", &format_args!("{:08X}", self.embedded_driver_count));
        field("PayloadItemCount", &format_args!("{:08X}", self.payload_item_count()));
        for (index, item_offset) in self.item_offsets.iter().enumerate() {
            field(alloc::format!("ItemOffsetList[{index}]").as_str(), &format_args!("{item_offset:016X}"));
        }
        for image in &self.images {
            out.push_str(&image.dump_info());
        }
        out
    }
}
