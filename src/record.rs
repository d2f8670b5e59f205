//! Fixed-stride record encodings shared by the buffer, the wire protocol and
//! the client mirror. All multi-byte fields are little-endian with no padding.
//!
//! ```text
//! Compact  (tag 1, 12 bytes): u16 x | u16 y | u32 attr | u32 meta
//! Extended (tag 2, 28 bytes): f32 x | f32 y | f32 z | f32 risk | f32 shock | u32 sort_key | u32 meta
//! ```

use std::fmt;

use serde_repr::{Deserialize_repr, Serialize_repr};

use crate::{
    bitmask::{RISK_MASK, RISK_SHIFT, SHOCK_MASK, SHOCK_SHIFT},
    errors::{ContractError, ContractResult},
    types::{EntityIndex, WorldPoint},
};

pub const COMPACT_STRIDE: usize = 12;
pub const EXTENDED_STRIDE: usize = 28;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Encoding {
    #[default]
    Compact = 1,
    Extended = 2,
}

impl Encoding {
    pub const ALL: [Encoding; 2] = [Encoding::Compact, Encoding::Extended];

    pub const fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> ContractResult<Self> {
        match tag {
            1 => Ok(Encoding::Compact),
            2 => Ok(Encoding::Extended),
            other => Err(ContractError::UnknownEncoding(other)),
        }
    }

    /// Accepts the encoding name or its numeric tag.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "compact" | "1" => Some(Encoding::Compact),
            "extended" | "2" => Some(Encoding::Extended),
            _ => None,
        }
    }

    pub const fn stride(self) -> usize {
        match self {
            Encoding::Compact => COMPACT_STRIDE,
            Encoding::Extended => EXTENDED_STRIDE,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Encoding::Compact => "compact",
            Encoding::Extended => "extended",
        }
    }

    pub const fn description(self) -> &'static str {
        match self {
            Encoding::Compact => "u16 x, u16 y, u32 attr, u32 meta (LE)",
            Encoding::Extended => {
                "f32 x, f32 y, f32 z, f32 risk, f32 shock, u32 sort_key, u32 meta (LE)"
            }
        }
    }

    pub(crate) const fn slot(self) -> usize {
        match self {
            Encoding::Compact => 0,
            Encoding::Extended => 1,
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One entity as held by the authoritative buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct EntityRecord {
    pub position: WorldPoint,
    pub sort_key: u32,
    pub attr: u32,
    pub meta: u32,
}

impl EntityRecord {
    pub fn new(position: WorldPoint, sort_key: u32, attr: u32) -> Self {
        Self {
            position: position.clamped(),
            sort_key,
            attr,
            meta: 0,
        }
    }

    pub fn write(&self, encoding: Encoding, out: &mut Vec<u8>) {
        match encoding {
            Encoding::Compact => {
                out.extend_from_slice(&quantize(self.position.x).to_le_bytes());
                out.extend_from_slice(&quantize(self.position.y).to_le_bytes());
                out.extend_from_slice(&self.attr.to_le_bytes());
                out.extend_from_slice(&self.meta.to_le_bytes());
            }
            Encoding::Extended => {
                out.extend_from_slice(&self.position.x.to_le_bytes());
                out.extend_from_slice(&self.position.y.to_le_bytes());
                out.extend_from_slice(&self.position.z.to_le_bytes());
                out.extend_from_slice(&risk_fraction(self.meta).to_le_bytes());
                out.extend_from_slice(&shock_fraction(self.meta).to_le_bytes());
                out.extend_from_slice(&self.sort_key.to_le_bytes());
                out.extend_from_slice(&self.meta.to_le_bytes());
            }
        }
    }

    /// Reads one record. Fields the encoding does not carry come back as zero.
    pub fn read(encoding: Encoding, bytes: &[u8]) -> ContractResult<Self> {
        if bytes.len() != encoding.stride() {
            return Err(ContractError::StrideMismatch {
                expected: encoding.stride(),
                actual: bytes.len(),
            });
        }
        let record = match encoding {
            Encoding::Compact => EntityRecord {
                position: WorldPoint::planar(
                    dequantize(read_u16(bytes, 0)),
                    dequantize(read_u16(bytes, 2)),
                ),
                sort_key: 0,
                attr: read_u32(bytes, 4),
                meta: read_u32(bytes, 8),
            },
            Encoding::Extended => EntityRecord {
                position: WorldPoint::new(
                    read_f32(bytes, 0),
                    read_f32(bytes, 4),
                    read_f32(bytes, 8),
                ),
                sort_key: read_u32(bytes, 20),
                attr: 0,
                meta: read_u32(bytes, 24),
            },
        };
        Ok(record)
    }
}

/// A changed record as carried by a diff frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DiffEntry {
    pub index: EntityIndex,
    pub attr: u32,
    pub meta: u32,
}

pub fn quantize(unit: f32) -> u16 {
    if !unit.is_finite() {
        return 0;
    }
    (unit.clamp(0.0, 1.0) * u16::MAX as f32).round() as u16
}

pub fn dequantize(value: u16) -> f32 {
    value as f32 / u16::MAX as f32
}

pub fn risk_fraction(meta: u32) -> f32 {
    ((meta >> RISK_SHIFT) & RISK_MASK) as f32 / 255.0
}

pub fn shock_fraction(meta: u32) -> f32 {
    ((meta >> SHOCK_SHIFT) & SHOCK_MASK) as f32 / 255.0
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([bytes[offset], bytes[offset + 1]])
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

pub(crate) fn read_f32(bytes: &[u8], offset: usize) -> f32 {
    f32::from_bits(read_u32(bytes, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmask::pack;

    #[test]
    fn test_compact_layout_bytes() {
        let record = EntityRecord {
            position: WorldPoint::planar(1.0, 0.0),
            sort_key: 9,
            attr: 0x0102_0304,
            meta: pack(1, 2, 0, 0, 0),
        };
        let mut out = Vec::new();
        record.write(Encoding::Compact, &mut out);
        assert_eq!(out.len(), COMPACT_STRIDE);
        assert_eq!(&out[0..2], &[0xFF, 0xFF]);
        assert_eq!(&out[2..4], &[0, 0]);
        assert_eq!(&out[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&out[8..12], &[1, 2, 0, 0]);
    }

    #[test]
    fn test_extended_layout_carries_normalised_channels() {
        let record = EntityRecord {
            position: WorldPoint::new(0.25, 0.5, 0.75),
            sort_key: 77,
            attr: 5,
            meta: pack(255, 51, 1, 10, 3),
        };
        let mut out = Vec::new();
        record.write(Encoding::Extended, &mut out);
        assert_eq!(out.len(), EXTENDED_STRIDE);
        assert_eq!(read_f32(&out, 8), 0.75);
        assert!((read_f32(&out, 12) - 0.2).abs() < 1e-6);
        assert_eq!(read_f32(&out, 16), 1.0);

        let back = EntityRecord::read(Encoding::Extended, &out).unwrap();
        assert_eq!(back.position, record.position);
        assert_eq!(back.sort_key, 77);
        assert_eq!(back.meta, record.meta);
        assert_eq!(back.attr, 0);
    }

    #[test]
    fn test_read_rejects_wrong_stride() {
        let err = EntityRecord::read(Encoding::Extended, &[0u8; 12]).unwrap_err();
        assert_eq!(
            err,
            ContractError::StrideMismatch {
                expected: 28,
                actual: 12
            }
        );
    }

    #[test]
    fn test_encoding_tags() {
        assert_eq!(Encoding::from_tag(2), Ok(Encoding::Extended));
        assert_eq!(Encoding::from_tag(9), Err(ContractError::UnknownEncoding(9)));
        assert_eq!(Encoding::Compact.stride(), 12);
    }
}
