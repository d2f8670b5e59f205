//! VPIN-style order-flow toxicity proxy.
//!
//! Volume is poured into fixed-size buckets. Each tick's volume is split
//! into buy and sell parts with bulk volume classification: the buy share is
//! `Phi(r / sigma)` where `r` is the tick's log return and `sigma` a running
//! estimate of its scale. When a bucket fills, its imbalance
//! `|V_buy - V_sell| / V_bucket` is pushed into a rolling window; toxicity is
//! the window mean.
//!
//! Vitality is the bucket fill rate: an EWMA of per-tick volume relative to
//! the volume needed to fill a bucket in `target_ticks_per_bucket` ticks.
//! Ticks without a volume reading count as empty, so thin or incomplete data
//! lowers vitality.

use ringbuffer::{AllocRingBuffer, RingBuffer};
use serde::Deserialize;
use statrs::function::erf::erf;

use super::{scale_unit, validate_observation, Detector, Rejection};
use crate::types::Observation;

const SIGMA_FLOOR: f64 = 1e-6;
const VOLUME_EPSILON: f64 = 1e-12;

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VpinConfig {
    /// Volume per bucket, in instrument units.
    pub bucket_volume: f64,
    /// Completed buckets kept in the rolling window.
    pub window_buckets: usize,
    /// Ticks a healthy instrument needs to fill one bucket.
    pub target_ticks_per_bucket: f64,
    /// EWMA weight for the return scale and the fill rate.
    pub ewma_alpha: f64,
}

impl Default for VpinConfig {
    fn default() -> Self {
        Self {
            bucket_volume: 1_000.0,
            window_buckets: 20,
            target_ticks_per_bucket: 10.0,
            ewma_alpha: 0.1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct VpinState {
    last_price: Option<f64>,
    return_variance: f64,
    bucket_buy: f64,
    bucket_total: f64,
    imbalances: AllocRingBuffer<f64>,
    fill_rate: f64,
    completed: u64,
}

impl Default for VpinState {
    fn default() -> Self {
        Self::with_window(VpinConfig::default().window_buckets)
    }
}

impl VpinState {
    pub fn with_window(window: usize) -> Self {
        let capacity = window.next_power_of_two().max(2);
        Self {
            last_price: None,
            return_variance: 0.0,
            bucket_buy: 0.0,
            bucket_total: 0.0,
            imbalances: AllocRingBuffer::with_capacity(capacity),
            fill_rate: 0.0,
            completed: 0,
        }
    }

    pub fn completed_buckets(&self) -> u64 {
        self.completed
    }

    fn push_imbalance(&mut self, imbalance: f64, window: usize) {
        self.imbalances.push(imbalance);
        if self.imbalances.len() > window {
            let excess = self.imbalances.len() - window;
            for _ in 0..excess {
                let _ = self.imbalances.dequeue();
            }
        }
    }

    fn toxicity(&self) -> f64 {
        if self.imbalances.len() == 0 {
            return 0.0;
        }
        self.imbalances.iter().sum::<f64>() / self.imbalances.len() as f64
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct VpinOutput {
    /// Rolling mean bucket imbalance in `[0, 1]`.
    pub toxicity: f64,
    /// Bucket fill rate in `[0, 1]`.
    pub fill_rate: f64,
    /// Fill rate mapped onto the 6-bit vital channel.
    pub vital: u8,
}

#[derive(Clone, Debug)]
pub struct VpinDetector {
    config: VpinConfig,
}

impl VpinDetector {
    pub fn new(config: VpinConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &VpinConfig {
        &self.config
    }

    /// Fresh per-entity state sized for this detector's window.
    pub fn new_state(&self) -> VpinState {
        VpinState::with_window(self.config.window_buckets)
    }

    fn buy_fraction(&self, state: &VpinState, ret: f64) -> f64 {
        let sigma = state.return_variance.sqrt().max(SIGMA_FLOOR);
        let z = ret / sigma;
        0.5 * (1.0 + erf(z / std::f64::consts::SQRT_2))
    }

    fn pour(&self, state: &mut VpinState, mut volume: f64, buy_fraction: f64) {
        let bucket = self.config.bucket_volume;
        while volume > VOLUME_EPSILON {
            let room = bucket - state.bucket_total;
            let take = volume.min(room);
            state.bucket_total += take;
            state.bucket_buy += take * buy_fraction;
            volume -= take;

            if state.bucket_total + VOLUME_EPSILON >= bucket {
                let sell = state.bucket_total - state.bucket_buy;
                let imbalance = ((state.bucket_buy - sell).abs() / state.bucket_total).min(1.0);
                state.push_imbalance(imbalance, self.config.window_buckets.max(1));
                state.completed += 1;
                state.bucket_buy = 0.0;
                state.bucket_total = 0.0;
            }
        }
    }
}

impl Detector for VpinDetector {
    type State = VpinState;
    type Output = VpinOutput;

    fn observe(&self, state: &mut VpinState, obs: &Observation) -> Result<(), Rejection> {
        validate_observation(obs)?;
        let alpha = self.config.ewma_alpha;
        let volume = obs.volume.unwrap_or(0.0);

        let expected = self.config.bucket_volume / self.config.target_ticks_per_bucket.max(1.0);
        let tick_fill = if expected > 0.0 {
            (volume / expected).min(1.0)
        } else {
            0.0
        };
        state.fill_rate = alpha * tick_fill + (1.0 - alpha) * state.fill_rate;

        let Some(prev) = state.last_price.replace(obs.price) else {
            return Ok(());
        };
        let ret = (obs.price / prev).ln();

        if volume > 0.0 && self.config.bucket_volume > 0.0 {
            let buy_fraction = self.buy_fraction(state, ret);
            self.pour(state, volume, buy_fraction);
        }
        state.return_variance = alpha * ret * ret + (1.0 - alpha) * state.return_variance;
        Ok(())
    }

    fn output(&self, state: &VpinState) -> VpinOutput {
        let fill_rate = state.fill_rate.clamp(0.0, 1.0);
        VpinOutput {
            toxicity: state.toxicity().clamp(0.0, 1.0),
            fill_rate,
            vital: scale_unit(fill_rate, 63),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> VpinDetector {
        VpinDetector::new(VpinConfig {
            bucket_volume: 100.0,
            window_buckets: 4,
            target_ticks_per_bucket: 2.0,
            ewma_alpha: 0.2,
        })
    }

    #[test]
    fn test_one_sided_flow_is_toxic() {
        let detector = detector();
        let mut state = detector.new_state();
        let mut price = 100.0;
        for ts in 1..=40 {
            price *= 1.001;
            let obs = Observation::new(price, ts).with_volume(50.0);
            detector.observe(&mut state, &obs).unwrap();
        }
        let out = detector.output(&state);
        assert!(state.completed_buckets() >= 4);
        assert!(out.toxicity > 0.5, "toxicity {}", out.toxicity);
    }

    #[test]
    fn test_alternating_flow_is_benign() {
        let detector = detector();
        let mut state = detector.new_state();
        for ts in 1..=80u64 {
            let price = if ts % 2 == 0 { 100.0 } else { 100.1 };
            let obs = Observation::new(price, ts).with_volume(50.0);
            detector.observe(&mut state, &obs).unwrap();
        }
        let out = detector.output(&state);
        assert!(out.toxicity < 0.3, "toxicity {}", out.toxicity);
    }

    #[test]
    fn test_window_is_bounded() {
        let detector = detector();
        let mut state = detector.new_state();
        for ts in 1..=200u64 {
            let obs = Observation::new(100.0 + ts as f64, ts).with_volume(300.0);
            detector.observe(&mut state, &obs).unwrap();
        }
        assert_eq!(state.imbalances.len(), 4);
    }

    #[test]
    fn test_vitality_follows_fill_rate() {
        let detector = detector();
        let mut busy = detector.new_state();
        let mut quiet = detector.new_state();
        for ts in 1..=60u64 {
            let price = 100.0 + (ts % 3) as f64 * 0.01;
            detector
                .observe(&mut busy, &Observation::new(price, ts).with_volume(60.0))
                .unwrap();
            detector
                .observe(&mut quiet, &Observation::new(price, ts))
                .unwrap();
        }
        let busy = detector.output(&busy);
        let quiet = detector.output(&quiet);
        assert!(busy.vital > 55, "busy vital {}", busy.vital);
        assert_eq!(quiet.vital, 0);
        assert_eq!(quiet.toxicity, 0.0);
    }

    #[test]
    fn test_invalid_volume_rejected() {
        let detector = detector();
        let mut state = detector.new_state();
        let obs = Observation::new(100.0, 1).with_volume(-5.0);
        assert_eq!(
            detector.observe(&mut state, &obs),
            Err(Rejection::InvalidVolume)
        );
        assert_eq!(state.last_price, None);
    }
}
