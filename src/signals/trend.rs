use serde::Deserialize;

use super::{validate_observation, Detector, Rejection};
use crate::{bitmask::Trend, types::Observation};

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// Exponential forgetting factor, `0 < lambda <= 1`.
    pub forgetting: f64,
    /// Slope magnitude (log price per tick) below which the trend is flat.
    pub dead_band: f64,
    /// Initial diagonal of the inverse covariance.
    pub initial_covariance: f64,
    /// Observations required before a direction is reported.
    pub min_samples: u32,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            forgetting: 0.97,
            dead_band: 2e-4,
            initial_covariance: 1e3,
            min_samples: 3,
        }
    }
}

/// Running coefficients of `ln(p / p0) ~ intercept + slope * t`.
#[derive(Clone, Debug, Default)]
pub struct TrendState {
    origin: Option<f64>,
    theta: [f64; 2],
    p: [[f64; 2]; 2],
    t: f64,
    samples: u32,
}

impl TrendState {
    pub fn slope(&self) -> f64 {
        self.theta[1]
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }
}

/// Exponentially weighted recursive least squares slope estimator.
#[derive(Clone, Debug)]
pub struct TrendDetector {
    config: TrendConfig,
}

impl TrendDetector {
    pub fn new(config: TrendConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, slope: f64) -> Trend {
        if !slope.is_finite() || slope.abs() <= self.config.dead_band {
            Trend::Flat
        } else if slope > 0.0 {
            Trend::Up
        } else {
            Trend::Down
        }
    }
}

impl Detector for TrendDetector {
    type State = TrendState;
    type Output = Trend;

    fn observe(&self, state: &mut TrendState, obs: &Observation) -> Result<(), Rejection> {
        validate_observation(obs)?;
        let origin = match state.origin {
            Some(origin) => origin,
            None => {
                let delta = self.config.initial_covariance;
                state.origin = Some(obs.price);
                state.p = [[delta, 0.0], [0.0, delta]];
                obs.price
            }
        };

        let y = (obs.price / origin).ln();
        let phi = [1.0, state.t];
        let p = state.p;
        let p_phi = [
            p[0][0] * phi[0] + p[0][1] * phi[1],
            p[1][0] * phi[0] + p[1][1] * phi[1],
        ];
        let lambda = self.config.forgetting;
        let denom = lambda + phi[0] * p_phi[0] + phi[1] * p_phi[1];
        if !denom.is_finite() || denom <= 0.0 {
            // Restart the covariance; the slope estimate is kept.
            let delta = self.config.initial_covariance;
            tracing::debug!(denom, samples = state.samples, "trend covariance degenerate, reset");
            state.p = [[delta, 0.0], [0.0, delta]];
            return Ok(());
        }
        let gain = [p_phi[0] / denom, p_phi[1] / denom];
        let err = y - (phi[0] * state.theta[0] + phi[1] * state.theta[1]);

        state.theta[0] += gain[0] * err;
        state.theta[1] += gain[1] * err;
        for (i, row) in state.p.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (p[i][j] - gain[i] * p_phi[j]) / lambda;
            }
        }
        state.t += 1.0;
        state.samples = state.samples.saturating_add(1);
        Ok(())
    }

    fn output(&self, state: &TrendState) -> Trend {
        if state.samples < self.config.min_samples {
            return Trend::Flat;
        }
        self.classify(state.slope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(prices: impl IntoIterator<Item = f64>) -> (Trend, TrendState) {
        let detector = TrendDetector::new(TrendConfig::default());
        let mut state = TrendState::default();
        for (i, price) in prices.into_iter().enumerate() {
            detector
                .observe(&mut state, &Observation::new(price, i as u64 + 1))
                .unwrap();
        }
        (detector.output(&state), state)
    }

    #[test]
    fn test_rising_prices_trend_up() {
        let (trend, state) = run((0..30).map(|i| 100.0 + i as f64));
        assert_eq!(trend, Trend::Up);
        assert!(state.slope() > 0.0);
    }

    #[test]
    fn test_falling_prices_trend_down() {
        let (trend, _) = run((0..30).map(|i| 200.0 - 2.0 * i as f64));
        assert_eq!(trend, Trend::Down);
    }

    #[test]
    fn test_degenerate_covariance_is_reset() {
        let detector = TrendDetector::new(TrendConfig::default());
        let (_, mut state) = run((0..5).map(|i| 100.0 + i as f64));
        let samples = state.samples();
        state.p = [[f64::NAN; 2]; 2];

        detector
            .observe(&mut state, &Observation::new(106.0, 10))
            .unwrap();
        let delta = TrendConfig::default().initial_covariance;
        assert_eq!(state.p, [[delta, 0.0], [0.0, delta]]);
        assert_eq!(state.samples(), samples);

        detector
            .observe(&mut state, &Observation::new(107.0, 11))
            .unwrap();
        assert_eq!(state.samples(), samples + 1);
        assert!(state.slope().is_finite());
    }

    #[test]
    fn test_constant_prices_are_flat() {
        let (trend, state) = run(std::iter::repeat(50.0).take(30));
        assert_eq!(trend, Trend::Flat);
        assert!(state.slope().abs() < 1e-9);
    }

    #[test]
    fn test_slope_tracks_known_rate() {
        // ln price rising by exactly 1% per tick.
        let (_, state) = run((0..60).map(|i| 100.0 * (0.01 * i as f64).exp()));
        assert!((state.slope() - 0.01).abs() < 1e-4, "slope {}", state.slope());
    }

    #[test]
    fn test_warmup_reports_flat() {
        let (trend, _) = run([100.0, 150.0]);
        assert_eq!(trend, Trend::Flat);
    }

    #[test]
    fn test_reverses_after_regime_change() {
        let detector = TrendDetector::new(TrendConfig::default());
        let mut state = TrendState::default();
        let up = (0..30).map(|i| 100.0 + i as f64);
        let down = (0..60).map(|i| 129.0 - i as f64);
        for (i, price) in up.chain(down).enumerate() {
            detector
                .observe(&mut state, &Observation::new(price, i as u64 + 1))
                .unwrap();
        }
        assert_eq!(detector.output(&state), Trend::Down);
    }
}
