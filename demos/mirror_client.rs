//! Connects to a running `riskfield-server`, keeps a local mirror in sync and
//! prints what happens to it.
//!
//! Optional environment variables:
//! - `RISKFIELD_URL` (defaults to `ws://127.0.0.1:9240`)
//! - `RISKFIELD_CONFIG`: TOML file whose `[picking]` section sets the cell
//!   size and pick radius
//! - `RISKFIELD_MIN_RISK`, `RISKFIELD_CADENCE_MS`
//! - `RISKFIELD_LOG`

use std::env;

use anyhow::Result;
use riskfield::{
    client::{MirrorClient, MirrorClientConfig, MirrorEvent},
    config::RiskfieldConfig,
    logging,
    picking::ScreenTransform,
};

const VIEWPORT: (f32, f32) = (1280.0, 720.0);

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&env::var("RISKFIELD_LOG").unwrap_or_else(|_| "info".to_string()));

    let cfg = match env::var("RISKFIELD_CONFIG") {
        Ok(path) => RiskfieldConfig::from_file(path)?,
        Err(_) => {
            let mut cfg = RiskfieldConfig::default();
            cfg.apply_env_overrides();
            cfg.validate()?;
            cfg
        }
    };

    let config = MirrorClientConfig {
        url: env::var("RISKFIELD_URL").unwrap_or_else(|_| "ws://127.0.0.1:9240".to_string()),
        min_risk: env::var("RISKFIELD_MIN_RISK")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        cadence_ms: env::var("RISKFIELD_CADENCE_MS")
            .ok()
            .and_then(|v| v.parse().ok()),
        ..MirrorClientConfig::default()
    };

    let (picking, _picking_task) = cfg.picking.spawn();
    let transform = ScreenTransform::unit_square(VIEWPORT.0, VIEWPORT.1);
    let mut client = MirrorClient::new(config)?.with_picking(picking.clone(), transform);
    client.connect().await?;
    println!("Connected to {}", client.url());

    let mut diffs = 0u64;
    loop {
        let event = tokio::select! {
            event = client.next_event() => event?,
            _ = tokio::signal::ctrl_c() => break,
        };
        match event {
            MirrorEvent::Subscribed {
                subscription_id,
                cadence_ms,
            } => println!("Subscribed as #{subscription_id} at {cadence_ms} ms"),
            MirrorEvent::Snapshot { count, generation } => {
                println!("Snapshot #{generation}: {count} entities");
            }
            MirrorEvent::Diff { changed } => {
                diffs += 1;
                if diffs % 20 == 0 {
                    let pick = picking
                        .select(VIEWPORT.0 / 2.0, VIEWPORT.1 / 2.0, cfg.picking.radius_px)
                        .await?;
                    match pick.and_then(|p| p.fields.map(|f| (p.index, f))) {
                        Some((index, fields)) => println!(
                            "{diffs} diffs ({} changed in last); centre pick {index}: risk={} shock={} trend={:?}",
                            changed.len(),
                            fields.risk,
                            fields.shock,
                            fields.trend
                        ),
                        None => println!("{diffs} diffs; nothing under the centre"),
                    }
                }
            }
            MirrorEvent::Resnapshot { reason } => println!("Mirror discarded: {reason}"),
            MirrorEvent::Reconnected { attempts } => {
                println!("Reconnected after {attempts} attempt(s)");
            }
            MirrorEvent::ServerError { message } => println!("Server error: {message}"),
            MirrorEvent::Closed => println!("Server closed the connection"),
        }
    }

    client.close().await?;
    Ok(())
}
