//! Runs the full pipeline: feed poller, signal engine and broadcaster, and the
//! websocket subscription server.
//!
//! Usage: `riskfield-server [config.toml]`. Without a file the defaults are
//! used, still subject to `RISKFIELD_*` overrides. `RISKFIELD_LOG` sets the
//! log level.

use std::{env, sync::Arc};

use anyhow::{Context, Result};
use riskfield::{
    broadcast::{Broadcaster, Hub},
    config::{FeedKind, RiskfieldConfig},
    feed::{FeedPoller, HttpPriceSource, PriceInbox, PriceSource, SyntheticPriceSource},
    logging,
    population::Population,
    server::RiskfieldServer,
    signals::SignalEngine,
};
use tokio::{sync::watch, task::JoinHandle};

fn load_config() -> Result<RiskfieldConfig> {
    let path = env::args().nth(1).or_else(|| env::var("RISKFIELD_CONFIG").ok());
    match path {
        Some(path) => RiskfieldConfig::from_file(&path),
        None => {
            let mut cfg = RiskfieldConfig::default();
            cfg.apply_env_overrides();
            cfg.validate()?;
            Ok(cfg)
        }
    }
}

fn load_population(cfg: &RiskfieldConfig) -> Result<Population> {
    match &cfg.population.path {
        Some(path) => Population::from_file(path),
        None => Ok(Population::synthetic(
            cfg.population.synthetic_count,
            cfg.population.domains,
            cfg.population.seed,
        )),
    }
}

fn spawn_poller<S>(
    source: S,
    inbox: Arc<PriceInbox>,
    cfg: &RiskfieldConfig,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    S: PriceSource + 'static,
{
    let poller = FeedPoller::new(source, inbox, cfg.feed.poll_interval())
        .backoff(cfg.feed.backoff())
        .max_attempts(cfg.feed.max_attempts);
    tokio::spawn(async move {
        if let Err(err) = poller.run(shutdown).await {
            tracing::error!(error = %err, "feed poller stopped");
        }
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(&env::var("RISKFIELD_LOG").unwrap_or_else(|_| "info".to_string()));

    let cfg = load_config()?;
    let population = load_population(&cfg)?;
    tracing::info!(
        entities = population.len(),
        layout = %cfg.meta_layout,
        "population loaded"
    );

    let count = population.len();
    let (buffer, _symbols) = population.into_buffer(cfg.meta_layout);
    let buffer = Arc::new(buffer);
    let engine = SignalEngine::new(cfg.signals.clone(), &buffer);
    let inbox = Arc::new(PriceInbox::new());
    let hub = Arc::new(
        Hub::new(cfg.broadcast.queue_capacity).with_entry_limit(cfg.broadcast.max_queued_entries),
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let feed_task = match cfg.feed.kind {
        FeedKind::Http => {
            let url = cfg
                .feed
                .url
                .as_deref()
                .context("feed.url is required for the http feed")?;
            let source = HttpPriceSource::new(url, cfg.feed.timeout())?;
            spawn_poller(source, Arc::clone(&inbox), &cfg, shutdown_rx.clone())
        }
        FeedKind::Synthetic => {
            let source = SyntheticPriceSource::new(count, cfg.feed.synthetic.clone());
            spawn_poller(source, Arc::clone(&inbox), &cfg, shutdown_rx.clone())
        }
    };

    let broadcaster = Broadcaster::new(
        engine,
        Arc::clone(&buffer),
        Arc::clone(&inbox),
        Arc::clone(&hub),
        cfg.cadence(),
    );
    let broadcast_shutdown = shutdown_rx.clone();
    let broadcast_task = tokio::spawn(async move {
        match broadcaster.run(broadcast_shutdown).await {
            Ok(stats) => tracing::info!(
                cycles = stats.cycles,
                broadcasts = stats.broadcasts,
                updates_sent = stats.updates_sent,
                "broadcaster stopped"
            ),
            Err(err) => tracing::error!(error = %err, "broadcaster failed"),
        }
    });

    let server = RiskfieldServer::bind(cfg.server_config(), Arc::clone(&buffer), Arc::clone(&hub))
        .await
        .context("Failed to bind websocket server")?;
    let server_task = tokio::spawn(server.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    let (feed, broadcast, server) = tokio::join!(feed_task, broadcast_task, server_task);
    feed?;
    broadcast?;
    server??;
    Ok(())
}
