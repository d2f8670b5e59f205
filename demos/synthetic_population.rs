//! Drives the signal engine over a synthetic population without any network
//! and prints per-tick activity plus the riskiest instruments at the end.
//!
//! Usage: `synthetic_population [count] [ticks]`

use std::env;

use anyhow::Result;
use riskfield::{
    bitmask::{decode_visual, MetaLayout},
    feed::{SyntheticConfig, SyntheticPriceSource},
    logging,
    population::Population,
    protocol::encode_diff,
    record::Encoding,
    signals::{EngineConfig, SignalEngine},
    types::EntityIndex,
};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&env::var("RISKFIELD_LOG").unwrap_or_else(|_| "warn".to_string()));

    let mut args = env::args().skip(1);
    let count: usize = args.next().and_then(|v| v.parse().ok()).unwrap_or(5_000);
    let ticks: usize = args.next().and_then(|v| v.parse().ok()).unwrap_or(50);
    let layout = MetaLayout::Domain;

    let population = Population::synthetic(count, 8, 42);
    let (buffer, symbols) = population.into_buffer(layout);
    let mut engine = SignalEngine::new(EngineConfig::default(), &buffer);
    let mut source = SyntheticPriceSource::new(
        count,
        SyntheticConfig {
            seed: 42,
            ..SyntheticConfig::default()
        },
    );

    for encoding in Encoding::ALL {
        let snapshot = buffer.snapshot(encoding);
        println!(
            "{encoding} snapshot: {} entities, {} bytes ({})",
            snapshot.count,
            snapshot.bytes.len(),
            encoding.description()
        );
    }

    for tick in 1..=ticks {
        let batch = source.next_batch();
        let report = engine.tick(&batch, &buffer)?;
        let diff = buffer.drain_diff();
        let frame = encode_diff(&diff);
        if tick % 10 == 0 || tick == 1 {
            println!(
                "tick {tick:>3}: observed={} changed={} unchanged={} stale={} rejected={} diff={} bytes",
                report.observed,
                report.touched.len(),
                report.unchanged,
                report.stale,
                report.rejected,
                frame.len()
            );
        }
    }

    let codec = engine.codec();
    let mut words: Vec<(usize, u32)> = buffer.meta_words().into_iter().enumerate().collect();
    words.sort_by_key(|(_, word)| std::cmp::Reverse(codec.unpack(*word).risk));

    println!("\nRiskiest instruments ({}):", layout.description());
    for (index, word) in words.into_iter().take(5) {
        let fields = codec.unpack(word);
        let visual = decode_visual(word, layout);
        println!(
            "  {:<10} #{:<6} risk={:<3} shock={:<3} trend={:?} vital={} domain={:?} rgb={:?} alpha={:.2}",
            symbols.get(index).map(String::as_str).unwrap_or("?"),
            EntityIndex(index as u32),
            fields.risk,
            fields.shock,
            fields.trend,
            fields.vital,
            fields.domain,
            visual.color,
            visual.alpha
        );
    }

    Ok(())
}
