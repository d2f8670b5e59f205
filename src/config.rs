use std::{env, fs, path::Path, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::task::JoinHandle;

use crate::{
    bitmask::MetaLayout,
    feed::{ExponentialBackoff, SyntheticConfig},
    picking::{PickingHandle, DEFAULT_CELL_SIZE_PX},
    record::Encoding,
    server::ServerConfig,
    signals::EngineConfig,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RiskfieldConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub broadcast: BroadcastSection,
    #[serde(default)]
    pub signals: EngineConfig,
    #[serde(default)]
    pub feed: FeedSection,
    #[serde(default)]
    pub picking: PickingSection,
    #[serde(default)]
    pub population: PopulationSection,
    #[serde(default)]
    pub meta_layout: MetaLayout,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// `compact` or `extended`.
    pub default_encoding: String,
    pub ping_interval_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9240".to_string(),
            default_encoding: Encoding::Compact.name().to_string(),
            ping_interval_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BroadcastSection {
    pub cadence_ms: u64,
    pub queue_capacity: usize,
    /// Slowest cadence a subscriber may negotiate.
    pub max_cadence_ms: u64,
    /// Distinct queued updates per subscriber before a resnapshot. Defaults
    /// to a budget derived from `queue_capacity`.
    pub max_queued_entries: Option<usize>,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            cadence_ms: 100,
            queue_capacity: 64,
            max_cadence_ms: 60_000,
            max_queued_entries: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedKind {
    Http,
    #[default]
    Synthetic,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedSection {
    pub kind: FeedKind,
    pub url: Option<String>,
    pub poll_interval_ms: u64,
    pub timeout_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive failures tolerated before the poller gives up.
    pub max_attempts: Option<u32>,
    pub synthetic: SyntheticConfig,
}

impl Default for FeedSection {
    fn default() -> Self {
        Self {
            kind: FeedKind::Synthetic,
            url: None,
            poll_interval_ms: 250,
            timeout_ms: 5_000,
            backoff_initial_ms: 500,
            backoff_max_ms: 30_000,
            backoff_multiplier: 2.0,
            max_attempts: None,
            synthetic: SyntheticConfig::default(),
        }
    }
}

impl FeedSection {
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PickingSection {
    pub cell_size_px: f32,
    /// Pointer tolerance for hover and select queries.
    pub radius_px: f32,
}

impl PickingSection {
    pub fn spawn(&self) -> (PickingHandle, JoinHandle<()>) {
        PickingHandle::spawn(self.cell_size_px)
    }
}

impl Default for PickingSection {
    fn default() -> Self {
        Self {
            cell_size_px: DEFAULT_CELL_SIZE_PX,
            radius_px: 12.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PopulationSection {
    /// JSON instrument list. Takes precedence over the synthetic settings.
    pub path: Option<String>,
    pub synthetic_count: usize,
    pub domains: u8,
    pub seed: u64,
}

impl Default for PopulationSection {
    fn default() -> Self {
        Self {
            path: None,
            synthetic_count: 10_000,
            domains: 8,
            seed: 7,
        }
    }
}

impl RiskfieldConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read {}", path.as_ref().display()))?;
        let mut cfg = Self::from_toml_str(&data)?;
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses without env overrides or validation.
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let mut raw: toml::Value =
            toml::from_str(data).with_context(|| "Failed to parse TOML config")?;
        // Support a nested [riskfield] table or top-level entries.
        let table = if let Some(table) = raw
            .get_mut("riskfield")
            .and_then(|v| v.as_table_mut())
            .cloned()
        {
            table
        } else {
            raw.try_into()
                .map_err(|_| anyhow::anyhow!("Invalid riskfield config structure"))?
        };
        let cfg: RiskfieldConfig = toml::from_str(&toml::to_string(&table)?)?;
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        // Scalars can be overridden by `RISKFIELD_*` env vars.
        override_string("RISKFIELD_BIND", &mut self.server.bind);
        override_string("RISKFIELD_DEFAULT_ENCODING", &mut self.server.default_encoding);
        override_u64("RISKFIELD_PING_INTERVAL_SECS", &mut self.server.ping_interval_secs);
        override_u64("RISKFIELD_CADENCE_MS", &mut self.broadcast.cadence_ms);
        override_usize("RISKFIELD_QUEUE_CAPACITY", &mut self.broadcast.queue_capacity);
        override_u64("RISKFIELD_MAX_CADENCE_MS", &mut self.broadcast.max_cadence_ms);
        if let Ok(value) = env::var("RISKFIELD_MAX_QUEUED_ENTRIES") {
            if let Ok(parsed) = value.parse::<usize>() {
                self.broadcast.max_queued_entries = Some(parsed);
            }
        }
        if let Ok(value) = env::var("RISKFIELD_FEED_KIND") {
            match value.trim().to_ascii_lowercase().as_str() {
                "http" => self.feed.kind = FeedKind::Http,
                "synthetic" => self.feed.kind = FeedKind::Synthetic,
                _ => {}
            }
        }
        if let Ok(value) = env::var("RISKFIELD_FEED_URL") {
            self.feed.url = Some(value);
        }
        override_u64("RISKFIELD_POLL_INTERVAL_MS", &mut self.feed.poll_interval_ms);
        override_u64("RISKFIELD_FEED_TIMEOUT_MS", &mut self.feed.timeout_ms);
        override_u64("RISKFIELD_BACKOFF_INITIAL_MS", &mut self.feed.backoff_initial_ms);
        override_u64("RISKFIELD_BACKOFF_MAX_MS", &mut self.feed.backoff_max_ms);
        override_f64("RISKFIELD_BACKOFF_MULTIPLIER", &mut self.feed.backoff_multiplier);
        if let Ok(value) = env::var("RISKFIELD_POPULATION_PATH") {
            self.population.path = Some(value);
        }
        override_usize(
            "RISKFIELD_SYNTHETIC_COUNT",
            &mut self.population.synthetic_count,
        );
        override_u64("RISKFIELD_SEED", &mut self.population.seed);
        override_f32("RISKFIELD_PICK_CELL_SIZE_PX", &mut self.picking.cell_size_px);
        override_f32("RISKFIELD_PICK_RADIUS_PX", &mut self.picking.radius_px);
        override_f64("RISKFIELD_RISK_TOXICITY_WEIGHT", &mut self.signals.risk.toxicity);
        override_f64("RISKFIELD_RISK_SHOCK_WEIGHT", &mut self.signals.risk.shock);
        if let Ok(value) = env::var("RISKFIELD_META_LAYOUT") {
            if let Ok(layout) = value.parse() {
                self.meta_layout = layout;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            Encoding::from_name(&self.server.default_encoding).is_some(),
            "server.default_encoding must be compact or extended"
        );
        anyhow::ensure!(
            self.server.ping_interval_secs > 0,
            "server.ping_interval_secs must be positive"
        );
        anyhow::ensure!(
            self.broadcast.cadence_ms > 0,
            "broadcast.cadence_ms must be positive"
        );
        anyhow::ensure!(
            self.broadcast.max_cadence_ms >= self.broadcast.cadence_ms,
            "broadcast.max_cadence_ms must be >= broadcast.cadence_ms"
        );
        anyhow::ensure!(
            self.broadcast.queue_capacity > 0,
            "broadcast.queue_capacity must be positive"
        );
        anyhow::ensure!(
            self.feed.kind != FeedKind::Http || self.feed.url.is_some(),
            "feed.url is required for the http feed"
        );
        anyhow::ensure!(
            self.feed.poll_interval_ms > 0,
            "feed.poll_interval_ms must be positive"
        );
        anyhow::ensure!(
            self.feed.backoff_initial_ms > 0
                && self.feed.backoff_max_ms >= self.feed.backoff_initial_ms,
            "feed backoff must satisfy 0 < initial <= max"
        );
        anyhow::ensure!(
            self.feed.backoff_multiplier >= 1.0,
            "feed.backoff_multiplier must be >= 1"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.feed.synthetic.update_fraction),
            "feed.synthetic.update_fraction must be within [0, 1]"
        );
        anyhow::ensure!(
            self.signals.cusum.ewma_alpha > 0.0 && self.signals.cusum.ewma_alpha <= 1.0,
            "signals.cusum.ewma_alpha must be within (0, 1]"
        );
        anyhow::ensure!(
            self.signals.cusum.saturation > 0.0,
            "signals.cusum.saturation must be positive"
        );
        anyhow::ensure!(
            self.signals.trend.forgetting > 0.0 && self.signals.trend.forgetting <= 1.0,
            "signals.trend.forgetting must be within (0, 1]"
        );
        anyhow::ensure!(
            self.signals.vpin.bucket_volume > 0.0 && self.signals.vpin.window_buckets > 0,
            "signals.vpin needs a positive bucket volume and window"
        );
        anyhow::ensure!(
            self.signals.risk.toxicity >= 0.0
                && self.signals.risk.shock >= 0.0
                && self.signals.risk.toxicity + self.signals.risk.shock > 0.0,
            "signals.risk weights must be non-negative and not both zero"
        );
        anyhow::ensure!(
            self.picking.cell_size_px.is_finite() && self.picking.cell_size_px > 0.0,
            "picking.cell_size_px must be positive"
        );
        anyhow::ensure!(
            self.picking.radius_px.is_finite() && self.picking.radius_px >= 0.0,
            "picking.radius_px must be finite and non-negative"
        );
        anyhow::ensure!(
            self.broadcast.max_queued_entries != Some(0),
            "broadcast.max_queued_entries must be positive"
        );
        anyhow::ensure!(
            self.population.path.is_some() || self.population.synthetic_count > 0,
            "population needs a path or a synthetic_count"
        );
        anyhow::ensure!(
            (1..=8).contains(&self.population.domains),
            "population.domains must be within 1..=8"
        );
        Ok(())
    }

    pub fn default_encoding(&self) -> Encoding {
        Encoding::from_name(&self.server.default_encoding).unwrap_or_default()
    }

    pub fn cadence(&self) -> Duration {
        Duration::from_millis(self.broadcast.cadence_ms)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind: self.server.bind.clone(),
            default_encoding: self.default_encoding(),
            base_cadence: self.cadence(),
            max_cadence: Duration::from_millis(self.broadcast.max_cadence_ms),
            ping_interval: Duration::from_secs(self.server.ping_interval_secs),
        }
    }
}

fn override_string(key: &str, field: &mut String) {
    if let Ok(value) = env::var(key) {
        if !value.trim().is_empty() {
            *field = value;
        }
    }
}

fn override_f32(key: &str, field: &mut f32) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f32>() {
            *field = parsed;
        }
    }
}

fn override_f64(key: &str, field: &mut f64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<f64>() {
            *field = parsed;
        }
    }
}

fn override_usize(key: &str, field: &mut usize) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<usize>() {
            *field = parsed;
        }
    }
}

fn override_u64(key: &str, field: &mut u64) {
    if let Ok(value) = env::var(key) {
        if let Ok(parsed) = value.parse::<u64>() {
            *field = parsed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_table_is_accepted() {
        let cfg = RiskfieldConfig::from_toml_str(
            r#"
            [riskfield]
            meta_layout = "domain"

            [riskfield.broadcast]
            cadence_ms = 50
            queue_capacity = 8

            [riskfield.signals.risk]
            toxicity = 0.5
            shock = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.meta_layout, MetaLayout::Domain);
        assert_eq!(cfg.broadcast.cadence_ms, 50);
        assert_eq!(cfg.broadcast.queue_capacity, 8);
        assert_eq!(cfg.signals.risk.toxicity, 0.5);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.signals.cusum.drift, 0.5);
        assert_eq!(cfg.picking.cell_size_px, DEFAULT_CELL_SIZE_PX);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_top_level_keys_are_accepted() {
        let cfg = RiskfieldConfig::from_toml_str(
            r#"
            [server]
            bind = "0.0.0.0:7000"
            default_encoding = "extended"

            [feed]
            kind = "http"
            url = "http://localhost:8080/prices"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.server_config().bind, "0.0.0.0:7000");
        assert_eq!(cfg.default_encoding(), Encoding::Extended);
        assert_eq!(cfg.feed.kind, FeedKind::Http);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut cfg = RiskfieldConfig::default();
        cfg.validate().unwrap();

        cfg.feed.kind = FeedKind::Http;
        assert!(cfg.validate().is_err());
        cfg.feed.url = Some("http://localhost/prices".to_string());
        cfg.validate().unwrap();

        cfg.broadcast.max_cadence_ms = 10;
        assert!(cfg.validate().is_err());
        cfg.broadcast.max_cadence_ms = 60_000;

        cfg.server.default_encoding = "zstd".to_string();
        assert!(cfg.validate().is_err());
        cfg.server.default_encoding = "compact".to_string();

        cfg.picking.radius_px = -1.0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_picking_section_configures_handle() {
        let cfg = RiskfieldConfig::from_toml_str(
            r#"
            [picking]
            cell_size_px = 8.0
            radius_px = 3.0
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        let (handle, _task) = cfg.picking.spawn();
        handle
            .rebuild(
                vec![crate::types::WorldPoint::planar(10.0, 10.0)],
                crate::picking::ScreenTransform::pixels(100.0, 100.0),
                vec![0],
                MetaLayout::Standard,
            )
            .await
            .unwrap();
        assert!(handle.query(12.0, 10.0, cfg.picking.radius_px).await.unwrap().is_some());
        assert!(handle.query(15.0, 10.0, cfg.picking.radius_px).await.unwrap().is_none());
        // 8 px cells over a single point.
        assert_eq!(handle.stats().await.unwrap().occupied_cells, 1);
    }

    #[test]
    fn test_backoff_and_server_conversion() {
        let cfg = RiskfieldConfig::default();
        let backoff = cfg.feed.backoff();
        assert_eq!(backoff.initial, Duration::from_millis(500));
        assert_eq!(backoff.max, Duration::from_secs(30));
        let server = cfg.server_config();
        assert_eq!(server.base_cadence, Duration::from_millis(100));
        assert_eq!(server.ping_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_env_override_applies() {
        env::set_var("RISKFIELD_QUEUE_CAPACITY", "3");
        let mut cfg = RiskfieldConfig::default();
        cfg.apply_env_overrides();
        env::remove_var("RISKFIELD_QUEUE_CAPACITY");
        assert_eq!(cfg.broadcast.queue_capacity, 3);
    }
}
