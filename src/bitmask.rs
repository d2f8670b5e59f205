//! Meta word codec.
//!
//! Every entity carries a 32-bit meta word that packs its signal channels.
//! The standard layout is:
//!
//! ```text
//! bits  0- 7 : shock   (0..255)  change-point intensity
//! bits  8-15 : risk    (0..255)  composite risk / order-flow toxicity
//! bits 16-17 : trend   (0..3)    0 = flat, 1 = up, 2 = down, 3 = reserved
//! bits 18-23 : vital   (0..63)   liquidity / data-completeness proxy
//! bits 24-31 : macro   (0..255)  shared macro pressure
//! ```
//!
//! The domain layout splits bits 18-23 into a 3-bit domain (18-20) and a
//! 3-bit coarse vital (21-23). Which layout is in force is declared through
//! the metadata exchange; producer and consumers never guess.
//!
//! Packing masks every field to its width and never fails. Unpacking is the
//! exact inverse for in-width values.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::errors::ContractError;

pub const SHOCK_SHIFT: u32 = 0;
pub const RISK_SHIFT: u32 = 8;
pub const TREND_SHIFT: u32 = 16;
pub const VITAL_SHIFT: u32 = 18;
pub const MACRO_SHIFT: u32 = 24;

pub const SHOCK_MASK: u32 = 0xFF;
pub const RISK_MASK: u32 = 0xFF;
pub const TREND_MASK: u32 = 0x03;
pub const VITAL_MASK: u32 = 0x3F;
pub const MACRO_MASK: u32 = 0xFF;

const DOMAIN_SHIFT: u32 = 18;
const DOMAIN_MASK: u32 = 0x07;
const COARSE_VITAL_SHIFT: u32 = 21;
const COARSE_VITAL_MASK: u32 = 0x07;

/// Packs the five channels using the standard layout.
///
/// Inputs wider than their field are truncated, so `shock = 300` packs as
/// `300 & 0xFF = 44`.
pub fn pack(shock: u32, risk: u32, trend: u32, vital: u32, macro_pressure: u32) -> u32 {
    ((shock & SHOCK_MASK) << SHOCK_SHIFT)
        | ((risk & RISK_MASK) << RISK_SHIFT)
        | ((trend & TREND_MASK) << TREND_SHIFT)
        | ((vital & VITAL_MASK) << VITAL_SHIFT)
        | ((macro_pressure & MACRO_MASK) << MACRO_SHIFT)
}

/// Inverse of [`pack`]: `(shock, risk, trend, vital, macro)`.
pub fn unpack(word: u32) -> (u32, u32, u32, u32, u32) {
    (
        (word >> SHOCK_SHIFT) & SHOCK_MASK,
        (word >> RISK_SHIFT) & RISK_MASK,
        (word >> TREND_SHIFT) & TREND_MASK,
        (word >> VITAL_SHIFT) & VITAL_MASK,
        (word >> MACRO_SHIFT) & MACRO_MASK,
    )
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    #[default]
    Flat,
    Up,
    Down,
    Reserved,
}

impl Trend {
    pub const fn bits(self) -> u32 {
        match self {
            Trend::Flat => 0,
            Trend::Up => 1,
            Trend::Down => 2,
            Trend::Reserved => 3,
        }
    }

    pub const fn from_bits(bits: u32) -> Self {
        match bits & TREND_MASK {
            0 => Trend::Flat,
            1 => Trend::Up,
            2 => Trend::Down,
            _ => Trend::Reserved,
        }
    }
}

/// Which bit layout a deployment uses for the meta word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaLayout {
    #[default]
    Standard,
    Domain,
}

impl MetaLayout {
    pub const fn name(self) -> &'static str {
        match self {
            MetaLayout::Standard => "standard",
            MetaLayout::Domain => "domain",
        }
    }

    /// Width of the vital channel under this layout.
    pub const fn vital_bits(self) -> u32 {
        match self {
            MetaLayout::Standard => 6,
            MetaLayout::Domain => 3,
        }
    }

    pub const fn has_domain(self) -> bool {
        matches!(self, MetaLayout::Domain)
    }

    pub fn description(self) -> &'static str {
        match self {
            MetaLayout::Standard => {
                "shock:0-7 risk:8-15 trend:16-17 vital:18-23 macro:24-31"
            }
            MetaLayout::Domain => {
                "shock:0-7 risk:8-15 trend:16-17 domain:18-20 vital:21-23 macro:24-31"
            }
        }
    }
}

impl fmt::Display for MetaLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MetaLayout {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(MetaLayout::Standard),
            "domain" => Ok(MetaLayout::Domain),
            other => Err(ContractError::UnknownLayout(other.to_string())),
        }
    }
}

/// Decoded meta word. `vital` is expressed in the width of the layout it was
/// read from; `domain` is only present under [`MetaLayout::Domain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetaFields {
    pub shock: u8,
    pub risk: u8,
    pub trend: Trend,
    pub vital: u8,
    pub macro_pressure: u8,
    pub domain: Option<u8>,
}

/// Layout-aware packer shared by producer and consumers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetaCodec {
    layout: MetaLayout,
}

impl MetaCodec {
    pub const fn new(layout: MetaLayout) -> Self {
        Self { layout }
    }

    pub const fn layout(&self) -> MetaLayout {
        self.layout
    }

    pub fn pack(&self, fields: &MetaFields) -> u32 {
        let shared = ((fields.shock as u32) << SHOCK_SHIFT)
            | ((fields.risk as u32) << RISK_SHIFT)
            | (fields.trend.bits() << TREND_SHIFT)
            | ((fields.macro_pressure as u32) << MACRO_SHIFT);
        match self.layout {
            MetaLayout::Standard => shared | ((fields.vital as u32 & VITAL_MASK) << VITAL_SHIFT),
            MetaLayout::Domain => {
                let domain = fields.domain.unwrap_or(0) as u32;
                shared
                    | ((domain & DOMAIN_MASK) << DOMAIN_SHIFT)
                    | ((fields.vital as u32 & COARSE_VITAL_MASK) << COARSE_VITAL_SHIFT)
            }
        }
    }

    pub fn unpack(&self, word: u32) -> MetaFields {
        let (shock, risk, trend, _, macro_pressure) = unpack(word);
        let (vital, domain) = match self.layout {
            MetaLayout::Standard => (((word >> VITAL_SHIFT) & VITAL_MASK) as u8, None),
            MetaLayout::Domain => (
                ((word >> COARSE_VITAL_SHIFT) & COARSE_VITAL_MASK) as u8,
                Some(((word >> DOMAIN_SHIFT) & DOMAIN_MASK) as u8),
            ),
        };
        MetaFields {
            shock: shock as u8,
            risk: risk as u8,
            trend: Trend::from_bits(trend),
            vital,
            macro_pressure: macro_pressure as u8,
            domain,
        }
    }

    /// Rescales a 0..63 vital reading into this layout's vital width.
    pub fn scale_vital(&self, vital: u8) -> u8 {
        let vital = vital.min(VITAL_MASK as u8);
        vital >> (6 - self.layout.vital_bits())
    }

    /// Vital normalised to `[0, 1]` regardless of layout width.
    pub fn vital_fraction(&self, fields: &MetaFields) -> f32 {
        let max = ((1u32 << self.layout.vital_bits()) - 1) as f32;
        fields.vital as f32 / max
    }

    pub fn decode_visual(&self, word: u32) -> VisualAttrs {
        decode_visual(word, self.layout)
    }
}

/// Renderer-facing attributes derived from a meta word.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct VisualAttrs {
    pub color: [u8; 3],
    pub alpha: f32,
    pub luminosity: f32,
    pub saturation: f32,
}

pub const DOMAIN_PALETTE: [[u8; 3]; 8] = [
    [0x4e, 0x79, 0xa7],
    [0xf2, 0x8e, 0x2b],
    [0xe1, 0x57, 0x59],
    [0x76, 0xb7, 0xb2],
    [0x59, 0xa1, 0x4f],
    [0xed, 0xc9, 0x48],
    [0xb0, 0x7a, 0xa1],
    [0xff, 0x9d, 0xa7],
];

pub const TREND_PALETTE: [[u8; 3]; 4] = [
    [0x9a, 0xa0, 0xa6],
    [0x2e, 0xcc, 0x71],
    [0xe7, 0x4c, 0x3c],
    [0xf3, 0x9c, 0x12],
];

/// Pure decode used identically by the producer and every consumer.
///
/// Color comes from the domain palette when the layout carries domain bits
/// and falls back to a trend palette otherwise.
pub fn decode_visual(word: u32, layout: MetaLayout) -> VisualAttrs {
    let codec = MetaCodec::new(layout);
    let fields = codec.unpack(word);
    let color = match fields.domain {
        Some(domain) => DOMAIN_PALETTE[(domain as usize) & 0x07],
        None => TREND_PALETTE[fields.trend.bits() as usize],
    };
    VisualAttrs {
        color,
        alpha: 0.35 + 0.65 * codec.vital_fraction(&fields),
        luminosity: 0.3 + 0.7 * (fields.risk as f32 / 255.0),
        saturation: 0.4 + 0.6 * (fields.shock as f32 / 255.0),
    }
}
