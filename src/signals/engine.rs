use serde::Deserialize;

use super::{
    scale_unit, CusumConfig, CusumDetector, CusumState, Detector, Rejection, TrendConfig,
    TrendDetector, TrendState, VpinConfig, VpinDetector, VpinState,
};
use crate::{
    bitmask::{MetaCodec, MetaFields},
    buffer::PointBuffer,
    errors::ContractResult,
    population::ATTR_DOMAIN_MASK,
    types::{EntityIndex, Observation, PriceBatch},
};

/// Blend of toxicity and shock that forms the risk channel.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RiskWeights {
    pub toxicity: f64,
    pub shock: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            toxicity: 0.75,
            shock: 0.25,
        }
    }
}

impl RiskWeights {
    fn blend(&self, toxicity: f64, shock: f64) -> f64 {
        let total = self.toxicity + self.shock;
        if total <= 0.0 {
            return 0.0;
        }
        (self.toxicity * toxicity + self.shock * shock) / total
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cusum: CusumConfig,
    pub trend: TrendConfig,
    pub vpin: VpinConfig,
    pub risk: RiskWeights,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Indices whose meta word changed and was written, ascending.
    pub touched: Vec<EntityIndex>,
    pub observed: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub rejected: usize,
    pub unknown: usize,
}

#[derive(Clone, Debug)]
struct EntitySignals {
    cusum: CusumState,
    trend: TrendState,
    vpin: VpinState,
    last_timestamp_ms: Option<u64>,
    word: u32,
    domain: u8,
}

/// Runs the three detectors over the population and packs their outputs.
///
/// The engine keeps no locks; the point buffer is the only synchronised
/// structure it touches.
pub struct SignalEngine {
    cusum: CusumDetector,
    trend: TrendDetector,
    vpin: VpinDetector,
    risk: RiskWeights,
    codec: MetaCodec,
    entities: Vec<EntitySignals>,
    ticks: u64,
}

impl SignalEngine {
    /// Builds per-entity state for every record in `buffer`, seeded with the
    /// buffer's current meta words.
    pub fn new(config: EngineConfig, buffer: &PointBuffer) -> Self {
        let vpin = VpinDetector::new(config.vpin);
        let entities = buffer
            .meta_words()
            .into_iter()
            .zip(buffer.attrs())
            .map(|(word, attr)| EntitySignals {
                cusum: CusumState::default(),
                trend: TrendState::default(),
                vpin: vpin.new_state(),
                last_timestamp_ms: None,
                word,
                domain: (attr & ATTR_DOMAIN_MASK) as u8,
            })
            .collect();
        Self {
            cusum: CusumDetector::new(config.cusum),
            trend: TrendDetector::new(config.trend),
            vpin,
            risk: config.risk,
            codec: MetaCodec::new(buffer.layout()),
            entities,
            ticks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn codec(&self) -> MetaCodec {
        self.codec
    }

    /// Processes one batch and writes changed words into `buffer`.
    pub fn tick(&mut self, batch: &PriceBatch, buffer: &PointBuffer) -> ContractResult<TickReport> {
        let mut report = TickReport::default();
        let macro_channel = batch.macro_pressure.to_channel();
        let mut updates = Vec::new();

        for (index, obs) in &batch.observations {
            report.observed += 1;
            let Some(entity) = self.entities.get_mut(index.as_usize()) else {
                tracing::warn!(%index, count = self.entities.len(), "observation for unknown entity");
                report.unknown += 1;
                continue;
            };

            match update_entity(
                entity,
                obs,
                (&self.cusum, &self.trend, &self.vpin),
                &self.risk,
                &self.codec,
                macro_channel,
            ) {
                Ok(Some(word)) => {
                    entity.word = word;
                    updates.push((*index, word));
                }
                Ok(None) => report.unchanged += 1,
                Err(Rejection::Stale) => {
                    tracing::trace!(%index, ts = obs.timestamp_ms, "stale observation skipped");
                    report.stale += 1;
                }
                Err(reason) => {
                    tracing::trace!(%index, ?reason, "observation rejected");
                    report.rejected += 1;
                }
            }
        }

        if !updates.is_empty() {
            buffer.set_meta_many(&updates)?;
        }
        report.touched = updates.into_iter().map(|(index, _)| index).collect();
        self.ticks += 1;
        tracing::debug!(
            tick = self.ticks,
            observed = report.observed,
            touched = report.touched.len(),
            stale = report.stale,
            rejected = report.rejected,
            "signal tick"
        );
        Ok(report)
    }

    /// Current packed word for an entity as last computed by the engine.
    pub fn word(&self, index: EntityIndex) -> Option<u32> {
        self.entities.get(index.as_usize()).map(|e| e.word)
    }
}

/// Applies one observation to all detectors. Returns the new word when it
/// differs from the previous one. Any rejection leaves every detector state
/// untouched.
fn update_entity(
    entity: &mut EntitySignals,
    obs: &Observation,
    detectors: (&CusumDetector, &TrendDetector, &VpinDetector),
    risk: &RiskWeights,
    codec: &MetaCodec,
    macro_channel: u8,
) -> Result<Option<u32>, Rejection> {
    let (cusum, trend, vpin) = detectors;
    if let Some(last) = entity.last_timestamp_ms {
        if obs.timestamp_ms <= last {
            return Err(Rejection::Stale);
        }
    }
    super::validate_observation(obs)?;

    cusum.observe(&mut entity.cusum, obs)?;
    trend.observe(&mut entity.trend, obs)?;
    vpin.observe(&mut entity.vpin, obs)?;
    entity.last_timestamp_ms = Some(obs.timestamp_ms);

    let shock = cusum.output(&entity.cusum);
    let direction = trend.output(&entity.trend);
    let flow = vpin.output(&entity.vpin);
    let risk_value = risk.blend(flow.toxicity, shock as f64 / 255.0);

    let fields = MetaFields {
        shock,
        risk: scale_unit(risk_value, u8::MAX),
        trend: direction,
        vital: codec.scale_vital(flow.vital),
        macro_pressure: macro_channel,
        domain: codec.layout().has_domain().then_some(entity.domain),
    };
    let word = codec.pack(&fields);
    if word == entity.word {
        return Ok(None);
    }
    Ok(Some(word))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bitmask::{MetaLayout, Trend},
        record::EntityRecord,
        types::{MacroPressure, WorldPoint},
    };

    fn setup(count: usize, layout: MetaLayout) -> (PointBuffer, SignalEngine) {
        let records = (0..count)
            .map(|i| EntityRecord::new(WorldPoint::planar(0.5, 0.5), i as u32, (i % 8) as u32))
            .collect();
        let buffer = PointBuffer::new(records, layout);
        let engine = SignalEngine::new(EngineConfig::default(), &buffer);
        (buffer, engine)
    }

    fn batch(entries: &[(u32, f64, u64)], macro_pressure: f64) -> PriceBatch {
        let mut batch = PriceBatch::new(MacroPressure::new(macro_pressure));
        for (index, price, ts) in entries {
            batch.insert(EntityIndex(*index), Observation::new(*price, *ts).with_volume(150.0));
        }
        batch
    }

    #[test]
    fn test_tick_writes_changed_words_and_marks_dirty() {
        let (buffer, mut engine) = setup(4, MetaLayout::Standard);
        let report = engine
            .tick(&batch(&[(0, 100.0, 1), (2, 50.0, 1)], 0.5), &buffer)
            .unwrap();
        // Macro pressure alone changes the word from its zero start.
        assert_eq!(report.touched, vec![EntityIndex(0), EntityIndex(2)]);
        assert_eq!(buffer.drain_dirty(), report.touched);
        let (_, _, _, _, macro_channel) = crate::bitmask::unpack(buffer.meta(EntityIndex(0)).unwrap());
        assert_eq!(macro_channel, 128);
    }

    #[test]
    fn test_unchanged_word_is_not_rewritten() {
        let (buffer, mut engine) = setup(2, MetaLayout::Standard);
        // No volume keeps vitality pinned at zero, so only macro moves the word.
        let quiet = |ts: u64| {
            let mut batch = PriceBatch::new(MacroPressure::new(0.2));
            batch.insert(EntityIndex(1), Observation::new(10.0, ts));
            batch
        };
        let first = engine.tick(&quiet(1), &buffer).unwrap();
        assert_eq!(first.touched, vec![EntityIndex(1)]);
        buffer.drain_dirty();

        let report = engine.tick(&quiet(2), &buffer).unwrap();
        assert!(report.touched.is_empty());
        assert_eq!(report.unchanged, 1);
        assert_eq!(buffer.dirty_len(), 0);
    }

    #[test]
    fn test_stale_and_invalid_ticks_are_skipped() {
        let (buffer, mut engine) = setup(3, MetaLayout::Standard);
        engine.tick(&batch(&[(0, 100.0, 10)], 0.0), &buffer).unwrap();
        let before = engine.word(EntityIndex(0));

        let mut next = batch(&[(0, 120.0, 9)], 0.0);
        next.insert(EntityIndex(1), Observation::new(f64::INFINITY, 11));
        next.insert(EntityIndex(7), Observation::new(5.0, 11));
        let report = engine.tick(&next, &buffer).unwrap();

        assert_eq!(report.stale, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.unknown, 1);
        assert!(report.touched.is_empty());
        assert_eq!(engine.word(EntityIndex(0)), before);
    }

    #[test]
    fn test_trend_and_shock_reach_the_word() {
        let (buffer, mut engine) = setup(1, MetaLayout::Standard);
        for ts in 1..=30u64 {
            let price = 100.0 * (1.0 + 0.01 * ts as f64);
            engine.tick(&batch(&[(0, price, ts)], 0.0), &buffer).unwrap();
        }
        let fields = engine.codec().unpack(buffer.meta(EntityIndex(0)).unwrap());
        assert_eq!(fields.trend, Trend::Up);

        engine.tick(&batch(&[(0, 200.0, 31)], 0.0), &buffer).unwrap();
        let fields = engine.codec().unpack(buffer.meta(EntityIndex(0)).unwrap());
        assert_eq!(fields.shock, 255);
        assert!(fields.risk > 0);
    }

    #[test]
    fn test_domain_layout_carries_entity_domain() {
        let (buffer, mut engine) = setup(8, MetaLayout::Domain);
        engine.tick(&batch(&[(5, 10.0, 1)], 0.1), &buffer).unwrap();
        let fields = engine.codec().unpack(buffer.meta(EntityIndex(5)).unwrap());
        assert_eq!(fields.domain, Some(5));
    }
}
