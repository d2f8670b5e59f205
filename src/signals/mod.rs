//! Streaming signal detectors and the engine that drives them.
//!
//! Each detector is a shared, configured instance plus a small per-entity
//! state value. The engine owns one state per entity per detector; states are
//! never shared or aliased across entities.

pub mod cusum;
pub mod engine;
pub mod trend;
pub mod vpin;

use serde::Serialize;

use crate::types::Observation;

pub use cusum::{CusumConfig, CusumDetector, CusumState};
pub use engine::{EngineConfig, RiskWeights, SignalEngine, TickReport};
pub use trend::{TrendConfig, TrendDetector, TrendState};
pub use vpin::{VpinConfig, VpinDetector, VpinOutput, VpinState};

/// Why an observation was not applied. Rejections are local to one entity
/// for one tick; the entity's state is left untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    NonFinitePrice,
    NonPositivePrice,
    InvalidVolume,
    Stale,
}

/// A streaming estimator with per-entity state.
pub trait Detector {
    type State: Default + Clone;
    type Output;

    /// Applies one observation. On `Err` the state is unchanged.
    fn observe(&self, state: &mut Self::State, obs: &Observation) -> Result<(), Rejection>;

    fn output(&self, state: &Self::State) -> Self::Output;
}

pub(crate) fn validate_price(price: f64) -> Result<f64, Rejection> {
    if !price.is_finite() {
        return Err(Rejection::NonFinitePrice);
    }
    if price <= 0.0 {
        return Err(Rejection::NonPositivePrice);
    }
    Ok(price)
}

pub(crate) fn validate_observation(obs: &Observation) -> Result<(), Rejection> {
    validate_price(obs.price)?;
    if let Some(volume) = obs.volume {
        if !volume.is_finite() || volume < 0.0 {
            return Err(Rejection::InvalidVolume);
        }
    }
    Ok(())
}

/// Maps a `[0, 1]` fraction onto `0..=max`.
pub(crate) fn scale_unit(value: f64, max: u8) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * max as f64).round() as u8
}
