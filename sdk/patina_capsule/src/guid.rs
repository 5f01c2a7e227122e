//! GUID support for capsule headers.
//!
//! Capsule headers carry GUIDs as 16-byte values in registry format: the first three fields are
//! little-endian, the final eight bytes are stored as written. Header structures hold plain
//! [`efi::Guid`] values; [`Guid`] wraps them for parsing from text, comparison and display, and
//! provides the `scroll` contexts used by every header codec.
//!
//! ## Examples
//!
//! ```rust
//! use patina_capsule::guid::{Guid, OwnedGuid};
//!
//! let guid = OwnedGuid::try_from_string("{6dcbd5ed-e82d-4c44-bda1-7194199ad92a}").unwrap();
//! assert_eq!(guid.as_bytes()[0], 0xed);
//! assert_eq!(guid.to_string(), "6DCBD5ED-E82D-4C44-BDA1-7194199AD92A");
//! ```
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

use core::fmt;

use r_efi::efi;
use scroll::{
    Pread, Pwrite,
    ctx::{TryFromCtx, TryIntoCtx},
};

use crate::err::CapsuleError;

/// Size of an encoded GUID in bytes.
pub const GUID_SIZE: usize = 16;

/// Number of hexadecimal digits in a registry format GUID string.
const EXPECTED_HEX_CHARS: usize = 32;

/// Error type for GUID parsing operations.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum GuidError {
    /// The string does not contain exactly 32 hexadecimal digits.
    InvalidLength {
        /// Expected number of hex digits.
        expected: usize,
        /// Number of hex digits found.
        actual: usize,
    },
    /// The string contains a character that is neither a hex digit nor a separator.
    InvalidHexCharacter {
        /// 1-based position of the offending character.
        position: usize,
        /// The offending character.
        character: char,
    },
}

impl fmt::Display for GuidError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuidError::InvalidLength { expected, actual } => {
                write!(f, "Invalid GUID length: expected {expected} hex characters, found {actual}")
            }
            GuidError::InvalidHexCharacter { position, character } => {
                write!(f, "Invalid hex character '{character}' at position {position}")
            }
        }
    }
}

impl core::error::Error for GuidError {}

/// A GUID that either borrows an existing [`efi::Guid`] from a header or owns a parsed value.
#[derive(Clone, Copy)]
pub enum Guid<'a> {
    /// GUID referenced from an existing header structure.
    Borrowed(&'a efi::Guid),
    /// GUID owned by this value.
    Owned(efi::Guid),
}

/// A GUID with no lifetime dependencies.
pub type OwnedGuid = Guid<'static>;

impl<'a> Guid<'a> {
    /// Wrap an existing `efi::Guid` reference.
    pub fn from_ref(guid: &'a efi::Guid) -> Self {
        Self::Borrowed(guid)
    }

    /// Create an owned GUID from its 16-byte registry format encoding.
    pub fn from_bytes(bytes: &[u8; GUID_SIZE]) -> OwnedGuid {
        OwnedGuid::Owned(efi::Guid::from_bytes(bytes))
    }

    /// The 16-byte registry format encoding of this GUID.
    pub fn as_bytes(&self) -> [u8; GUID_SIZE] {
        *self.efi_guid().as_bytes()
    }

    /// Copy of the wrapped `efi::Guid`.
    pub fn to_efi_guid(&self) -> efi::Guid {
        *self.efi_guid()
    }

    fn efi_guid(&self) -> &efi::Guid {
        match self {
            Self::Borrowed(guid) => guid,
            Self::Owned(guid) => guid,
        }
    }
}

impl OwnedGuid {
    /// The all-zero GUID.
    pub const ZERO: OwnedGuid = Guid::Owned(efi::Guid::from_fields(0, 0, 0, 0, 0, &[0; 6]));

    /// Parse a registry format GUID such as `6dcbd5ed-e82d-4c44-bda1-7194199ad92a`.
    ///
    /// Surrounding braces, dashes and whitespace are ignored; exactly 32 hex digits must remain.
    pub fn try_from_string(s: &str) -> Result<OwnedGuid, GuidError> {
        let trimmed = s.trim();
        let trimmed = trimmed.strip_prefix('{').and_then(|t| t.strip_suffix('}')).unwrap_or(trimmed);
        // Position reporting is relative to the original string.
        let skipped = s.find(trimmed).unwrap_or(0);

        let mut value: u128 = 0;
        let mut hex_count = 0;
        for (idx, c) in trimmed.chars().enumerate() {
            if c == '-' || c.is_ascii_whitespace() {
                continue;
            }
            let Some(nibble) = c.to_digit(16) else {
                return Err(GuidError::InvalidHexCharacter { position: skipped + idx + 1, character: c });
            };
            hex_count += 1;
            if hex_count <= EXPECTED_HEX_CHARS {
                value = (value << 4) | nibble as u128;
            }
        }

        if hex_count != EXPECTED_HEX_CHARS {
            return Err(GuidError::InvalidLength { expected: EXPECTED_HEX_CHARS, actual: hex_count });
        }

        let be = value.to_be_bytes();
        let node: [u8; 6] = [be[10], be[11], be[12], be[13], be[14], be[15]];
        Ok(Guid::Owned(efi::Guid::from_fields(
            u32::from_be_bytes([be[0], be[1], be[2], be[3]]),
            u16::from_be_bytes([be[4], be[5]]),
            u16::from_be_bytes([be[6], be[7]]),
            be[8],
            be[9],
            &node,
        )))
    }
}

impl fmt::Display for Guid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (time_low, time_mid, time_hi_and_version, clk_seq_hi_res, clk_seq_low, node) = self.efi_guid().as_fields();
        write!(f, "{time_low:08X}-{time_mid:04X}-{time_hi_and_version:04X}-{clk_seq_hi_res:02X}{clk_seq_low:02X}-")?;
        for byte in node {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl PartialEq for Guid<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Guid<'_> {}

impl<'a> From<&'a efi::Guid> for Guid<'a> {
    fn from(guid: &'a efi::Guid) -> Self {
        Self::Borrowed(guid)
    }
}

impl From<efi::Guid> for OwnedGuid {
    fn from(guid: efi::Guid) -> Self {
        Self::Owned(guid)
    }
}

impl<'a> TryFrom<&'a str> for OwnedGuid {
    type Error = GuidError;

    fn try_from(s: &'a str) -> Result<Self, Self::Error> {
        OwnedGuid::try_from_string(s)
    }
}

impl TryIntoCtx<scroll::Endian> for Guid<'_> {
    type Error = scroll::Error;

    // GUID byte order is fixed by the registry format, independent of `ctx`.
    fn try_into_ctx(self, dest: &mut [u8], _ctx: scroll::Endian) -> Result<usize, Self::Error> {
        let mut offset = 0;
        dest.gwrite_with(self.as_bytes().as_slice(), &mut offset, ())?;
        Ok(offset)
    }
}

impl TryFromCtx<'_, scroll::Endian> for OwnedGuid {
    type Error = scroll::Error;

    fn try_from_ctx(from: &[u8], _ctx: scroll::Endian) -> Result<(Self, usize), Self::Error> {
        let mut offset = 0;
        let bytes: &[u8] = from.gread_with(&mut offset, GUID_SIZE)?;
        let mut raw = [0u8; GUID_SIZE];
        raw.copy_from_slice(bytes);
        Ok((Guid::from_bytes(&raw), offset))
    }
}

/// Write `guid` at `offset`, advancing it.
pub(crate) fn write_guid(dest: &mut [u8], offset: &mut usize, guid: &efi::Guid) -> Result<(), CapsuleError> {
    dest.gwrite_with(Guid::from_ref(guid), offset, scroll::LE)?;
    Ok(())
}

/// Read a GUID at `offset`, advancing it. Fails with [`CapsuleError::MalformedInput`] on short input.
pub(crate) fn read_guid(src: &[u8], offset: &mut usize) -> Result<efi::Guid, CapsuleError> {
    let guid: OwnedGuid = src.gread_with(offset, scroll::LE)?;
    Ok(guid.to_efi_guid())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FMP_CAPSULE_ID_STRING: &str = "6dcbd5ed-e82d-4c44-bda1-7194199ad92a";
    const FMP_CAPSULE_ID_BYTES: [u8; 16] =
        [0xed, 0xd5, 0xcb, 0x6d, 0x2d, 0xe8, 0x44, 0x4c, 0xbd, 0xa1, 0x71, 0x94, 0x19, 0x9a, 0xd9, 0x2a];

    #[test]
    fn registry_format_string_encodes_first_fields_little_endian() {
        let guid = OwnedGuid::try_from_string(FMP_CAPSULE_ID_STRING).unwrap();
        assert_eq!(guid.as_bytes(), FMP_CAPSULE_ID_BYTES);
    }

    #[test]
    fn parsing_matches_uuid_bytes_le() {
        let guid = OwnedGuid::try_from_string(FMP_CAPSULE_ID_STRING).unwrap();
        let uuid = uuid::Uuid::parse_str(FMP_CAPSULE_ID_STRING).unwrap();
        assert_eq!(guid.as_bytes(), uuid.to_bytes_le());
    }

    #[test]
    fn braces_whitespace_and_missing_dashes_are_accepted() {
        let expected = OwnedGuid::try_from_string(FMP_CAPSULE_ID_STRING).unwrap();
        for s in [
            "{6dcbd5ed-e82d-4c44-bda1-7194199ad92a}",
            "  6DCBD5ED-E82D-4C44-BDA1-7194199AD92A ",
            "6dcbd5ede82d4c44bda17194199ad92a",
        ] {
            assert_eq!(OwnedGuid::try_from_string(s).unwrap(), expected, "{s}");
        }
    }

    #[test]
    fn invalid_strings_are_rejected() {
        assert_eq!(
            OwnedGuid::try_from_string("6dcbd5ed-e82d-4c44-bda1"),
            Err(GuidError::InvalidLength { expected: 32, actual: 20 })
        );
        assert_eq!(
            OwnedGuid::try_from_string("6dcbd5ed-e82d-4c44-bda1-7194199ad92a00"),
            Err(GuidError::InvalidLength { expected: 32, actual: 34 })
        );
        assert_eq!(
            OwnedGuid::try_from_string("6dcbd5ed-e82d-4c44-bda1-7194199ad9zz"),
            Err(GuidError::InvalidHexCharacter { position: 35, character: 'z' })
        );
        assert_eq!(
            OwnedGuid::try_from_string("{6dcbd5ed-g82d-4c44-bda1-7194199ad92a}"),
            Err(GuidError::InvalidHexCharacter { position: 11, character: 'g' })
        );
    }

    #[test]
    fn display_is_uppercase_registry_format() {
        let guid = Guid::from_bytes(&FMP_CAPSULE_ID_BYTES);
        assert_eq!(format!("{guid}"), "6DCBD5ED-E82D-4C44-BDA1-7194199AD92A");
        assert_eq!(format!("{:?}", OwnedGuid::ZERO), "00000000-0000-0000-0000-000000000000");
    }

    #[test]
    fn borrowed_and_owned_compare_by_value() {
        let efi_guid = efi::Guid::from_bytes(&FMP_CAPSULE_ID_BYTES);
        assert_eq!(Guid::from_ref(&efi_guid), Guid::from_bytes(&FMP_CAPSULE_ID_BYTES));
        assert_ne!(Guid::from_ref(&efi_guid), OwnedGuid::ZERO);
    }

    #[test]
    fn read_guid_requires_sixteen_bytes() {
        let mut offset = 0;
        assert_eq!(read_guid(&FMP_CAPSULE_ID_BYTES[..15], &mut offset), Err(CapsuleError::MalformedInput));

        let mut offset = 0;
        let guid = read_guid(&FMP_CAPSULE_ID_BYTES, &mut offset).unwrap();
        assert_eq!(offset, GUID_SIZE);
        assert_eq!(guid.as_bytes(), &FMP_CAPSULE_ID_BYTES);
    }

    #[test]
    fn write_guid_advances_offset() {
        let mut buffer = [0u8; 20];
        let mut offset = 2;
        let guid = efi::Guid::from_bytes(&FMP_CAPSULE_ID_BYTES);
        write_guid(&mut buffer, &mut offset, &guid).unwrap();
        assert_eq!(offset, 18);
        assert_eq!(&buffer[2..18], &FMP_CAPSULE_ID_BYTES);

        let mut offset = 10;
        assert_eq!(write_guid(&mut buffer, &mut offset, &guid), Err(CapsuleError::MalformedInput));
    }
}
