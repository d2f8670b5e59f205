//! Upstream price fetch path.
//!
//! A [`FeedPoller`] pulls batches from a [`PriceSource`] on a fixed interval
//! and folds them into the shared [`PriceInbox`]; the broadcaster takes
//! whatever accumulated on its own cadence. Retries with exponential
//! backoff live here only, never on the broadcast path.

use std::{
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;
use tokio::sync::watch;
use url::Url;

use crate::{
    errors::{FeedError, FeedResult},
    types::{EntityIndex, MacroPressure, Observation, PriceBatch},
};

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ExponentialBackoff {
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier.max(1.0)).min(self.max)
    }

    /// Applies +/-10% jitter.
    pub fn jittered(&self, delay: Duration) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.9..1.1);
        delay.mul_f64(jitter)
    }
}

/// Observations waiting for the next broadcaster cycle, latest per entity.
#[derive(Debug, Default)]
pub struct PriceInbox {
    pending: Mutex<PriceBatch>,
}

impl PriceInbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: PriceBatch) {
        self.pending.lock().merge(batch);
    }

    /// Takes everything pending. The macro pressure carries over so a later
    /// batch without one keeps the last known value.
    pub fn take(&self) -> PriceBatch {
        let mut pending = self.pending.lock();
        let macro_pressure = pending.macro_pressure;
        std::mem::replace(&mut *pending, PriceBatch::new(macro_pressure))
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait PriceSource: Send {
    fn name(&self) -> &str;

    async fn fetch(&mut self) -> FeedResult<PriceBatch>;
}

#[derive(Debug, Deserialize)]
struct FeedPayload {
    #[serde(rename = "macro", default)]
    macro_pressure: f64,
    #[serde(default)]
    ticks: Vec<TickPayload>,
}

#[derive(Debug, Deserialize)]
struct TickPayload {
    index: u32,
    price: f64,
    #[serde(default)]
    volume: Option<f64>,
    timestamp_ms: u64,
}

impl From<FeedPayload> for PriceBatch {
    fn from(payload: FeedPayload) -> Self {
        let mut batch = PriceBatch::new(MacroPressure::new(payload.macro_pressure));
        for tick in payload.ticks {
            batch.insert(
                EntityIndex(tick.index),
                Observation {
                    price: tick.price,
                    volume: tick.volume,
                    timestamp_ms: tick.timestamp_ms,
                },
            );
        }
        batch
    }
}

/// Polls a JSON endpoint returning
/// `{"macro": f64, "ticks": [{"index", "price", "volume"?, "timestamp_ms"}]}`.
#[derive(Debug, Clone)]
pub struct HttpPriceSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpPriceSource {
    pub fn new(url: &str, timeout: Duration) -> FeedResult<Self> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&mut self) -> FeedResult<PriceBatch> {
        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FeedError::with_http_status(status, &body));
        }
        let body = response.text().await?;
        let payload: FeedPayload = serde_json::from_str(&body)?;
        Ok(payload.into())
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Fraction of the population that ticks on each fetch.
    pub update_fraction: f64,
    /// Per-tick log-return standard deviation.
    pub volatility: f64,
    pub jump_probability: f64,
    /// Log-return magnitude of a jump.
    pub jump_size: f64,
    pub mean_volume: f64,
    /// Simulated clock advance per fetch.
    pub step_ms: u64,
    pub seed: u64,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            update_fraction: 0.25,
            volatility: 0.002,
            jump_probability: 0.002,
            jump_size: 0.06,
            mean_volume: 120.0,
            step_ms: 250,
            seed: 7,
        }
    }
}

/// Seeded random walk with occasional jumps and a drifting macro scalar.
#[derive(Debug)]
pub struct SyntheticPriceSource {
    config: SyntheticConfig,
    rng: StdRng,
    prices: Vec<f64>,
    macro_pressure: f64,
    clock_ms: u64,
}

impl SyntheticPriceSource {
    pub fn new(count: usize, config: SyntheticConfig) -> Self {
        let mut rng = StdRng::seed_from_u64(config.seed);
        let prices = (0..count).map(|_| rng.gen_range(5.0..500.0)).collect();
        let clock_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self {
            config,
            rng,
            prices,
            macro_pressure: 0.3,
            clock_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn next_batch(&mut self) -> PriceBatch {
        self.clock_ms += self.config.step_ms.max(1);
        let step: f64 = self.rng.gen_range(-0.02..0.02);
        self.macro_pressure = (self.macro_pressure + step).clamp(0.0, 1.0);

        let mut batch = PriceBatch::new(MacroPressure::new(self.macro_pressure));
        let fraction = self.config.update_fraction.clamp(0.0, 1.0);
        for (index, price) in self.prices.iter_mut().enumerate() {
            if !self.rng.gen_bool(fraction) {
                continue;
            }
            let noise = self.rng.gen_range(-1.0f64..1.0) * self.config.volatility * 1.7;
            let jump = if self.rng.gen_bool(self.config.jump_probability.clamp(0.0, 1.0)) {
                if self.rng.gen_bool(0.5) {
                    self.config.jump_size
                } else {
                    -self.config.jump_size
                }
            } else {
                0.0
            };
            *price *= (noise + jump).exp();
            let volume = self.config.mean_volume * self.rng.gen_range(0.2..1.8);
            batch.insert(
                EntityIndex(index as u32),
                Observation::new(*price, self.clock_ms).with_volume(volume),
            );
        }
        batch
    }
}

#[async_trait]
impl PriceSource for SyntheticPriceSource {
    fn name(&self) -> &str {
        "synthetic"
    }

    async fn fetch(&mut self) -> FeedResult<PriceBatch> {
        Ok(self.next_batch())
    }
}

/// Drives a [`PriceSource`] into a [`PriceInbox`].
pub struct FeedPoller<S> {
    source: S,
    inbox: Arc<PriceInbox>,
    interval: Duration,
    backoff: ExponentialBackoff,
    max_attempts: Option<u32>,
}

impl<S: PriceSource> FeedPoller<S> {
    pub fn new(source: S, inbox: Arc<PriceInbox>, interval: Duration) -> Self {
        Self {
            source,
            inbox,
            interval,
            backoff: ExponentialBackoff::default(),
            max_attempts: None,
        }
    }

    pub fn backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Consecutive failures tolerated before the poller gives up.
    pub fn max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub async fn poll_once(&mut self) -> FeedResult<usize> {
        let batch = self.source.fetch().await?;
        let count = batch.len();
        self.inbox.push(batch);
        Ok(count)
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> FeedResult<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut delay = self.backoff.initial;
        let mut failures = 0u32;

        tracing::info!(source = self.source.name(), interval_ms = self.interval.as_millis() as u64, "feed_poller_start");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            match self.poll_once().await {
                Ok(count) => {
                    if failures > 0 {
                        tracing::info!(failures, "feed_recovered");
                    }
                    failures = 0;
                    delay = self.backoff.initial;
                    tracing::trace!(count, "feed batch received");
                }
                Err(err) => {
                    failures += 1;
                    if let Some(max) = self.max_attempts {
                        if failures >= max {
                            tracing::error!(failures, error = %err, "feed retries exhausted");
                            return Err(FeedError::Exhausted {
                                attempts: failures,
                                last: err.to_string(),
                            });
                        }
                    }
                    let wait = self.backoff.jittered(delay);
                    tracing::warn!(failures, ?wait, error = %err, "feed fetch failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = shutdown.changed() => break,
                    }
                    delay = self.backoff.next_delay(delay);
                }
            }
        }

        tracing::info!(source = self.source.name(), "feed_poller_stop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FlakySource {
        failures_left: u32,
        calls: Arc<Mutex<u32>>,
    }

    #[async_trait]
    impl PriceSource for FlakySource {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&mut self) -> FeedResult<PriceBatch> {
            *self.calls.lock() += 1;
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(FeedError::Closed);
            }
            let mut batch = PriceBatch::new(MacroPressure::new(0.4));
            batch.insert(EntityIndex(0), Observation::new(10.0, 1));
            Ok(batch)
        }
    }

    fn fast_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
            multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let backoff = ExponentialBackoff::default();
        let mut delay = backoff.initial;
        for _ in 0..10 {
            delay = backoff.next_delay(delay);
        }
        assert_eq!(delay, backoff.max);
        let jittered = backoff.jittered(Duration::from_millis(1000));
        assert!(jittered >= Duration::from_millis(900) && jittered <= Duration::from_millis(1100));
    }

    #[test]
    fn test_inbox_coalesces_and_keeps_macro() {
        let inbox = PriceInbox::new();
        let mut first = PriceBatch::new(MacroPressure::new(0.1));
        first.insert(EntityIndex(1), Observation::new(10.0, 1));
        let mut second = PriceBatch::new(MacroPressure::new(0.6));
        second.insert(EntityIndex(1), Observation::new(11.0, 2));
        second.insert(EntityIndex(2), Observation::new(5.0, 2));
        inbox.push(first);
        inbox.push(second);

        let taken = inbox.take();
        assert_eq!(taken.len(), 2);
        assert_eq!(taken.observations[&EntityIndex(1)].price, 11.0);
        assert!(inbox.is_empty());
        assert_eq!(inbox.take().macro_pressure, MacroPressure::new(0.6));
    }

    #[test]
    fn test_payload_parses_into_batch() {
        let payload: FeedPayload = serde_json::from_str(
            r#"{"macro":0.25,"ticks":[{"index":3,"price":101.5,"timestamp_ms":42},
                {"index":4,"price":9.0,"volume":12.5,"timestamp_ms":43}]}"#,
        )
        .unwrap();
        let batch = PriceBatch::from(payload);
        assert_eq!(batch.macro_pressure, MacroPressure::new(0.25));
        assert_eq!(batch.observations[&EntityIndex(3)].volume, None);
        assert_eq!(batch.observations[&EntityIndex(4)].volume, Some(12.5));
    }

    #[test]
    fn test_synthetic_source_is_monotonic_and_seeded() {
        let config = SyntheticConfig {
            update_fraction: 1.0,
            ..SyntheticConfig::default()
        };
        let mut a = SyntheticPriceSource::new(16, config.clone());
        let mut b = SyntheticPriceSource::new(16, config);
        let first = a.next_batch();
        let second = a.next_batch();
        assert_eq!(first.len(), 16);
        let ts = |batch: &PriceBatch| batch.observations[&EntityIndex(0)].timestamp_ms;
        assert!(ts(&second) > ts(&first));

        let other = b.next_batch();
        let prices = |batch: &PriceBatch| -> Vec<f64> {
            batch.observations.values().map(|o| o.price).collect()
        };
        assert_eq!(prices(&first), prices(&other));
        assert!(first.observations.values().all(|o| o.price > 0.0));
    }

    #[tokio::test]
    async fn test_poller_retries_then_delivers() {
        let inbox = Arc::new(PriceInbox::new());
        let calls = Arc::new(Mutex::new(0));
        let source = FlakySource {
            failures_left: 2,
            calls: Arc::clone(&calls),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = FeedPoller::new(source, Arc::clone(&inbox), Duration::from_millis(5))
            .backoff(fast_backoff());
        let handle = tokio::spawn(poller.run(shutdown_rx));

        tokio::time::timeout(Duration::from_secs(2), async {
            while inbox.is_empty() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert!(*calls.lock() >= 3);
    }

    #[tokio::test]
    async fn test_poller_gives_up_after_max_attempts() {
        let source = FlakySource {
            failures_left: u32::MAX,
            calls: Arc::new(Mutex::new(0)),
        };
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let poller = FeedPoller::new(source, Arc::new(PriceInbox::new()), Duration::from_millis(1))
            .backoff(fast_backoff())
            .max_attempts(Some(3));
        let err = poller.run(shutdown_rx).await.unwrap_err();
        assert!(matches!(err, FeedError::Exhausted { attempts: 3, .. }));
    }
}
