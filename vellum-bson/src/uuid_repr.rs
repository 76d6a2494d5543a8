//! UUID binary representations.
//!
//! Drivers historically disagreed on how a UUID's 16 bytes land in a
//! binary element. The standard form uses subtype 0x04 and RFC 4122 byte
//! order; the three legacy forms use subtype 0x03 and shuffle bytes per
//! their platform's native GUID layout. Encoding and decoding are
//! parameterized by the representation, and decoding refuses a binary
//! whose stored subtype does not match the selected representation, to
//! keep a legacy-encoded value from silently reading back as a different
//! UUID.

use crate::error::DecodeError;
use crate::value::{Binary, BinarySubtype};
use uuid::Uuid;

/// How UUID bytes are ordered inside a binary element.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UuidRepresentation {
    /// Subtype 0x04, RFC 4122 byte order.
    #[default]
    Standard,
    /// Subtype 0x03, the first three GUID fields little-endian.
    CSharpLegacy,
    /// Subtype 0x03, each 8-byte half reversed.
    JavaLegacy,
    /// Subtype 0x03, RFC 4122 byte order.
    PythonLegacy,
}

impl UuidRepresentation {
    /// The binary subtype this representation stores under.
    pub fn subtype(&self) -> BinarySubtype {
        match self {
            UuidRepresentation::Standard => BinarySubtype::Uuid,
            _ => BinarySubtype::UuidLegacy,
        }
    }

    /// Reorders RFC 4122 bytes into this representation's wire order.
    /// Every transform is its own inverse, so the same function maps wire
    /// order back.
    fn transpose(&self, mut bytes: [u8; 16]) -> [u8; 16] {
        match self {
            UuidRepresentation::Standard | UuidRepresentation::PythonLegacy => {}
            UuidRepresentation::JavaLegacy => {
                bytes[0..8].reverse();
                bytes[8..16].reverse();
            }
            UuidRepresentation::CSharpLegacy => {
                bytes[0..4].reverse();
                bytes[4..6].reverse();
                bytes[6..8].reverse();
            }
        }
        bytes
    }
}

/// Encodes a UUID as a binary element under the given representation.
pub fn encode_uuid(uuid: Uuid, representation: UuidRepresentation) -> Binary {
    Binary {
        subtype: representation.subtype(),
        bytes: representation.transpose(*uuid.as_bytes()).to_vec(),
    }
}

/// Decodes a binary element as a UUID under the given representation.
///
/// Fails if the payload is not 16 bytes or the stored subtype does not
/// match the representation's subtype.
pub fn decode_uuid(binary: &Binary, representation: UuidRepresentation) -> Result<Uuid, DecodeError> {
    let expected: u8 = representation.subtype().into();
    let actual: u8 = binary.subtype.into();
    if actual != expected {
        return Err(DecodeError::UuidSubtypeMismatch { expected, actual });
    }
    if binary.bytes.len() != 16 {
        return Err(DecodeError::UuidLength {
            len: binary.bytes.len(),
        });
    }
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&binary.bytes);
    Ok(Uuid::from_bytes(representation.transpose(bytes)))
}
