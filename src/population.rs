//! Entity population loading.
//!
//! Entities are sorted by a Z-order key over their quantised position before
//! indices are assigned, so neighbouring indices are neighbours in space.

use std::{fs, path::Path};

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use crate::{
    bitmask::MetaLayout,
    buffer::PointBuffer,
    record::EntityRecord,
    types::{EntityIndex, WorldPoint},
};

/// Bits of the attr word holding the instrument's domain id.
pub const ATTR_DOMAIN_MASK: u32 = 0xFF;

#[derive(Clone, Debug, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
    #[serde(default)]
    pub domain: u8,
}

#[derive(Clone, Debug)]
pub struct Population {
    symbols: Vec<String>,
    records: Vec<EntityRecord>,
}

impl Population {
    pub fn from_specs(specs: Vec<InstrumentSpec>) -> Self {
        let mut entries: Vec<(u32, InstrumentSpec, WorldPoint)> = specs
            .into_iter()
            .map(|spec| {
                let position = WorldPoint::new(spec.x, spec.y, spec.z).clamped();
                (morton_key(position), spec, position)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.symbol.cmp(&b.1.symbol)));

        let mut symbols = Vec::with_capacity(entries.len());
        let mut records = Vec::with_capacity(entries.len());
        for (key, spec, position) in entries {
            records.push(EntityRecord::new(
                position,
                key,
                spec.domain as u32 & ATTR_DOMAIN_MASK,
            ));
            symbols.push(spec.symbol);
        }
        Self { symbols, records }
    }

    /// Reads a JSON array of instruments.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path)
            .with_context(|| format!("Failed to read population file {}", path.display()))?;
        let specs: Vec<InstrumentSpec> =
            serde_json::from_str(&data).with_context(|| "Failed to parse population JSON")?;
        anyhow::ensure!(!specs.is_empty(), "population file is empty");
        anyhow::ensure!(
            specs.len() <= u32::MAX as usize,
            "population exceeds the addressable index range"
        );
        Ok(Self::from_specs(specs))
    }

    /// Seeded population clustered around a handful of domain centres.
    pub fn synthetic(count: usize, domains: u8, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let domains = domains.max(1);
        let centres: Vec<WorldPoint> = (0..domains)
            .map(|_| {
                WorldPoint::new(
                    rng.gen_range(0.15..0.85),
                    rng.gen_range(0.15..0.85),
                    rng.gen_range(0.15..0.85),
                )
            })
            .collect();
        let specs = (0..count)
            .map(|i| {
                let domain = (i % domains as usize) as u8;
                let centre = centres[domain as usize];
                InstrumentSpec {
                    symbol: format!("SYN{i:05}"),
                    x: centre.x + rng.gen_range(-0.15..0.15),
                    y: centre.y + rng.gen_range(-0.15..0.15),
                    z: centre.z + rng.gen_range(-0.15..0.15),
                    domain,
                }
            })
            .collect();
        Self::from_specs(specs)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn symbol(&self, index: EntityIndex) -> Option<&str> {
        self.symbols.get(index.as_usize()).map(String::as_str)
    }

    pub fn index_of(&self, symbol: &str) -> Option<EntityIndex> {
        self.symbols
            .iter()
            .position(|s| s == symbol)
            .map(|i| EntityIndex(i as u32))
    }

    pub fn records(&self) -> &[EntityRecord] {
        &self.records
    }

    pub fn into_buffer(self, layout: MetaLayout) -> (PointBuffer, Vec<String>) {
        (PointBuffer::new(self.records, layout), self.symbols)
    }
}

/// 30-bit Morton code of a position quantised to 10 bits per axis.
pub fn morton_key(position: WorldPoint) -> u32 {
    let q = |v: f32| ((v.clamp(0.0, 1.0) * 1023.0).round() as u32) & 0x3FF;
    spread_bits(q(position.x)) | (spread_bits(q(position.y)) << 1) | (spread_bits(q(position.z)) << 2)
}

fn spread_bits(value: u32) -> u32 {
    let mut x = value & 0x3FF;
    x = (x | (x << 16)) & 0x0300_00FF;
    x = (x | (x << 8)) & 0x0300_F00F;
    x = (x | (x << 4)) & 0x030C_30C3;
    x = (x | (x << 2)) & 0x0924_9249;
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_morton_orders_axes() {
        assert_eq!(morton_key(WorldPoint::new(0.0, 0.0, 0.0)), 0);
        assert_eq!(spread_bits(0b11), 0b1001);
        let x = morton_key(WorldPoint::new(1.0, 0.0, 0.0));
        let y = morton_key(WorldPoint::new(0.0, 1.0, 0.0));
        assert_eq!(y, x << 1);
        assert_eq!(
            morton_key(WorldPoint::new(1.0, 1.0, 1.0)),
            (1 << 30) - 1
        );
    }

    #[test]
    fn test_population_sorted_by_sort_key() {
        let specs = vec![
            InstrumentSpec {
                symbol: "FAR".into(),
                x: 0.9,
                y: 0.9,
                z: 0.0,
                domain: 2,
            },
            InstrumentSpec {
                symbol: "NEAR".into(),
                x: 0.1,
                y: 0.1,
                z: 0.0,
                domain: 1,
            },
        ];
        let population = Population::from_specs(specs);
        assert_eq!(population.symbol(EntityIndex(0)), Some("NEAR"));
        assert_eq!(population.index_of("FAR"), Some(EntityIndex(1)));
        let keys: Vec<u32> = population.records().iter().map(|r| r.sort_key).collect();
        assert!(keys[0] < keys[1]);
        assert_eq!(population.records()[1].attr, 2);
    }

    #[test]
    fn test_synthetic_population_is_deterministic() {
        let a = Population::synthetic(200, 5, 7);
        let b = Population::synthetic(200, 5, 7);
        assert_eq!(a.len(), 200);
        assert_eq!(a.records(), b.records());
        assert!(a.records().windows(2).all(|w| w[0].sort_key <= w[1].sort_key));
    }
}
