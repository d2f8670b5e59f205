use serde::Deserialize;

use super::{scale_unit, validate_observation, Detector, Rejection};
use crate::types::Observation;

const SIGMA_FLOOR: f64 = 1e-4;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CusumConfig {
    /// EWMA weight for the reference mean and variance of log returns.
    pub ewma_alpha: f64,
    /// Allowance subtracted every tick, in standard deviations.
    pub drift: f64,
    /// Fraction of the cumulative statistic leaked away every tick.
    pub leak: f64,
    /// Cumulative value mapped to full intensity (255).
    pub saturation: f64,
    /// Per-tick standardised deviations are clipped to this magnitude.
    pub z_clip: f64,
}

impl Default for CusumConfig {
    fn default() -> Self {
        Self {
            ewma_alpha: 0.1,
            drift: 0.5,
            leak: 0.2,
            saturation: 6.0,
            z_clip: 8.0,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CusumState {
    last_price: Option<f64>,
    mean: f64,
    variance: f64,
    pos: f64,
    neg: f64,
    samples: u64,
}

impl CusumState {
    /// Larger of the two one-sided cumulative statistics.
    pub fn statistic(&self) -> f64 {
        self.pos.max(self.neg)
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Two-sided leaky CUSUM over standardised log returns.
#[derive(Clone, Debug)]
pub struct CusumDetector {
    config: CusumConfig,
}

impl CusumDetector {
    pub fn new(config: CusumConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CusumConfig {
        &self.config
    }
}

impl Detector for CusumDetector {
    type State = CusumState;
    type Output = u8;

    fn observe(&self, state: &mut CusumState, obs: &Observation) -> Result<(), Rejection> {
        validate_observation(obs)?;
        let price = obs.price;
        let Some(prev) = state.last_price.replace(price) else {
            return Ok(());
        };

        let ret = (price / prev).ln();
        // Score against the reference before folding this return into it.
        let sigma = state.variance.sqrt().max(SIGMA_FLOOR);
        let z = ((ret - state.mean) / sigma).clamp(-self.config.z_clip, self.config.z_clip);

        let keep = 1.0 - self.config.leak;
        state.pos = (state.pos * keep + z - self.config.drift).max(0.0);
        state.neg = (state.neg * keep - z - self.config.drift).max(0.0);

        let alpha = self.config.ewma_alpha;
        let dev = ret - state.mean;
        state.mean += alpha * dev;
        state.variance = (1.0 - alpha) * (state.variance + alpha * dev * dev);
        state.samples += 1;
        Ok(())
    }

    fn output(&self, state: &CusumState) -> u8 {
        if self.config.saturation <= 0.0 {
            return 0;
        }
        scale_unit(state.statistic() / self.config.saturation, u8::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(detector: &CusumDetector, state: &mut CusumState, prices: &[f64]) -> Vec<u8> {
        prices
            .iter()
            .enumerate()
            .map(|(i, price)| {
                detector
                    .observe(state, &Observation::new(*price, i as u64 + 1))
                    .unwrap();
                detector.output(state)
            })
            .collect()
    }

    #[test]
    fn test_constant_stream_stays_at_minimum() {
        let detector = CusumDetector::new(CusumConfig::default());
        let mut state = CusumState::default();
        let out = feed(&detector, &mut state, &[100.0; 50]);
        assert!(out.iter().all(|v| *v == 0));
    }

    #[test]
    fn test_jump_rises_then_leaks_away() {
        let detector = CusumDetector::new(CusumConfig::default());
        let mut state = CusumState::default();
        feed(&detector, &mut state, &[100.0; 20]);

        let mut prices = vec![110.0];
        prices.extend(std::iter::repeat(110.0).take(40));
        let out = feed(&detector, &mut state, &prices);

        assert_eq!(out[0], 255, "jump should saturate intensity");
        for pair in out.windows(2) {
            assert!(pair[1] <= pair[0], "intensity must not grow after the jump: {out:?}");
        }
        assert!(out[3] < out[0]);
        assert_eq!(*out.last().unwrap(), 0);
    }

    #[test]
    fn test_downward_jump_uses_negative_side() {
        let detector = CusumDetector::new(CusumConfig::default());
        let mut state = CusumState::default();
        feed(&detector, &mut state, &[100.0; 10]);
        let out = feed(&detector, &mut state, &[90.0]);
        assert_eq!(out[0], 255);
        assert!(state.neg > 0.0);
        assert_eq!(state.pos, 0.0);
    }

    #[test]
    fn test_rejects_bad_prices_without_touching_state() {
        let detector = CusumDetector::new(CusumConfig::default());
        let mut state = CusumState::default();
        feed(&detector, &mut state, &[100.0, 100.0]);
        let before = state.samples();

        assert_eq!(
            detector.observe(&mut state, &Observation::new(f64::NAN, 9)),
            Err(Rejection::NonFinitePrice)
        );
        assert_eq!(
            detector.observe(&mut state, &Observation::new(-1.0, 9)),
            Err(Rejection::NonPositivePrice)
        );
        assert_eq!(state.samples(), before);
        assert_eq!(state.last_price, Some(100.0));
    }
}
