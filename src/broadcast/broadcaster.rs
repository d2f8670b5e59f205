use std::{sync::Arc, time::Duration};

use tokio::{
    sync::watch,
    time::{interval, MissedTickBehavior},
};

use super::hub::Hub;
use crate::{
    buffer::PointBuffer,
    errors::ContractResult,
    feed::PriceInbox,
    signals::SignalEngine,
    timings::timed,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CycleOutcome {
    /// No new prices arrived; the engine was not ticked.
    Idle,
    /// Prices arrived but no word changed.
    NoChanges { observed: usize },
    Broadcast {
        updates: usize,
        subscribers: usize,
        overflowed: usize,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BroadcastStats {
    pub cycles: u64,
    pub idle: u64,
    pub no_changes: u64,
    pub broadcasts: u64,
    pub updates_sent: u64,
    pub rejected: u64,
    pub overflows: u64,
    pub last_cycle_ms: f64,
}

impl BroadcastStats {
    fn record(&mut self, outcome: &CycleOutcome, rejected: usize, elapsed: Duration) {
        self.cycles += 1;
        self.rejected += rejected as u64;
        self.last_cycle_ms = elapsed.as_secs_f64() * 1e3;
        match outcome {
            CycleOutcome::Idle => self.idle += 1,
            CycleOutcome::NoChanges { .. } => self.no_changes += 1,
            CycleOutcome::Broadcast {
                updates,
                overflowed,
                ..
            } => {
                self.broadcasts += 1;
                self.updates_sent += *updates as u64;
                self.overflows += *overflowed as u64;
            }
        }
    }
}

/// Periodic tick-drain-deliver loop. Owns the signal engine.
pub struct Broadcaster {
    engine: SignalEngine,
    buffer: Arc<PointBuffer>,
    inbox: Arc<PriceInbox>,
    hub: Arc<Hub>,
    cadence: Duration,
    stats: BroadcastStats,
    stats_tx: watch::Sender<BroadcastStats>,
}

impl Broadcaster {
    pub fn new(
        engine: SignalEngine,
        buffer: Arc<PointBuffer>,
        inbox: Arc<PriceInbox>,
        hub: Arc<Hub>,
        cadence: Duration,
    ) -> Self {
        let (stats_tx, _) = watch::channel(BroadcastStats::default());
        Self {
            engine,
            buffer,
            inbox,
            hub,
            cadence,
            stats: BroadcastStats::default(),
            stats_tx,
        }
    }

    pub fn cadence(&self) -> Duration {
        self.cadence
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<BroadcastStats> {
        self.stats_tx.subscribe()
    }

    /// One cycle. Never waits for data: an empty inbox completes as `Idle`.
    pub fn cycle(&mut self) -> ContractResult<CycleOutcome> {
        let (result, elapsed) = timed("broadcast_cycle", || self.run_cycle());
        let (outcome, rejected) = result?;
        self.stats.record(&outcome, rejected, elapsed);
        self.stats_tx.send_replace(self.stats);
        Ok(outcome)
    }

    fn run_cycle(&mut self) -> ContractResult<(CycleOutcome, usize)> {
        let batch = self.inbox.take();
        if batch.is_empty() {
            return Ok((CycleOutcome::Idle, 0));
        }

        let report = self.engine.tick(&batch, &self.buffer)?;
        let rejected = report.rejected + report.stale + report.unknown;
        let diff = self.buffer.drain_diff();
        if diff.is_empty() {
            return Ok((
                CycleOutcome::NoChanges {
                    observed: report.observed,
                },
                rejected,
            ));
        }

        let delivery = self.hub.deliver(&diff);
        tracing::debug!(
            updates = diff.len(),
            subscribers = delivery.subscribers,
            filtered = delivery.filtered,
            overflowed = delivery.overflowed,
            "diff broadcast"
        );
        Ok((
            CycleOutcome::Broadcast {
                updates: diff.len(),
                subscribers: delivery.subscribers,
                overflowed: delivery.overflowed,
            },
            rejected,
        ))
    }

    /// Runs until `shutdown` flips to true. Ticks that fall behind are
    /// skipped rather than queued, so cycles never overlap or pile up.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> ContractResult<BroadcastStats> {
        let mut ticker = interval(self.cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tracing::info!(cadence_ms = self.cadence.as_millis() as u64, "broadcaster_start");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.cycle() {
                tracing::error!(error = %err, "broadcast cycle failed");
                self.hub.close_all();
                return Err(err);
            }
        }

        self.hub.close_all();
        tracing::info!(
            cycles = self.stats.cycles,
            broadcasts = self.stats.broadcasts,
            updates_sent = self.stats.updates_sent,
            "broadcaster_stop"
        );
        Ok(self.stats)
    }
}
