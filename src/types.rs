use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

/// Position of an entity inside the point buffer.
///
/// Indices are assigned once at population load and never reused while the
/// process runs.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntityIndex(pub u32);

impl EntityIndex {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for EntityIndex {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}

impl From<EntityIndex> for u32 {
    fn from(value: EntityIndex) -> Self {
        value.into_inner()
    }
}

impl fmt::Display for EntityIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Normalised world position. Each axis lives in `[0, 1]`; 2-D populations
/// leave `z` at zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WorldPoint {
    pub x: f32,
    pub y: f32,
    #[serde(default)]
    pub z: f32,
}

impl WorldPoint {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub const fn planar(x: f32, y: f32) -> Self {
        Self { x, y, z: 0.0 }
    }

    pub fn clamped(self) -> Self {
        Self {
            x: clamp_unit(self.x),
            y: clamp_unit(self.y),
            z: clamp_unit(self.z),
        }
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// Shared macro-pressure scalar applied to every entity in a tick, in `[0, 1]`.
#[repr(transparent)]
#[derive(Clone, Copy, Debug, Default, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct MacroPressure(pub f64);

impl MacroPressure {
    pub fn new(value: f64) -> Self {
        Self(value)
    }

    /// Quantises into the 8-bit macro channel. Non-finite input maps to zero.
    pub fn to_channel(self) -> u8 {
        if !self.0.is_finite() {
            return 0;
        }
        (self.0.clamp(0.0, 1.0) * 255.0).round() as u8
    }
}

/// One price observation for an entity.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub price: f64,
    #[serde(default)]
    pub volume: Option<f64>,
    pub timestamp_ms: u64,
}

impl Observation {
    pub fn new(price: f64, timestamp_ms: u64) -> Self {
        Self {
            price,
            volume: None,
            timestamp_ms,
        }
    }

    pub fn with_volume(mut self, volume: f64) -> Self {
        self.volume = Some(volume);
        self
    }
}

/// Observations gathered since the last tick, at most one per entity, plus
/// the macro pressure that applies to all of them.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PriceBatch {
    pub observations: BTreeMap<EntityIndex, Observation>,
    pub macro_pressure: MacroPressure,
}

impl PriceBatch {
    pub fn new(macro_pressure: MacroPressure) -> Self {
        Self {
            observations: BTreeMap::new(),
            macro_pressure,
        }
    }

    /// Inserts an observation, keeping the newest one per entity.
    pub fn insert(&mut self, index: EntityIndex, obs: Observation) {
        match self.observations.get(&index) {
            Some(existing) if existing.timestamp_ms > obs.timestamp_ms => {}
            _ => {
                self.observations.insert(index, obs);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Folds a newer batch into this one. The newer macro pressure wins.
    pub fn merge(&mut self, newer: PriceBatch) {
        for (index, obs) in newer.observations {
            self.insert(index, obs);
        }
        self.macro_pressure = newer.macro_pressure;
    }
}
