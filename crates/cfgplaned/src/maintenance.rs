//! Outbox housekeeping: retention purge and the stale `Unknown` sweep.
//!
//! One tick visits every shard in turn. A failing shard is logged and the
//! tick moves on to the next one.

use std::sync::Arc;
use std::time::Duration;

use cfgplane_core::obs::request_span;
use cfgplane_core::{EventOutbox, Kit};
use cfgplane_store::Shard;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn, Instrument};

/// Operator user recorded on maintenance requests.
const OPERATOR: &str = "cfgplaned";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxMaintenance {
    /// Events older than this many days are purged.
    pub retention_days: u32,
    pub purge_every: Duration,
    pub sweep_every: Duration,
    /// `Unknown` events older than this are failed.
    pub stale_after: Duration,
    /// Deadline of a single purge or sweep call.
    pub call_timeout: Duration,
}

impl Default for OutboxMaintenance {
    fn default() -> Self {
        Self {
            retention_days: 7,
            purge_every: Duration::from_secs(3600),
            sweep_every: Duration::from_secs(60),
            stale_after: Duration::from_secs(300),
            call_timeout: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub shards: usize,
    pub affected: u64,
    pub failed_shards: usize,
}

impl OutboxMaintenance {
    /// Purge every shard once.
    pub async fn purge_all(&self, outbox: &EventOutbox, shards: &[Arc<dyn Shard>]) -> TickReport {
        let mut report = TickReport::default();
        for shard in shards {
            let kit = Kit::new(OPERATOR).with_timeout(self.call_timeout);
            report.shards += 1;
            let purge = outbox.purge(&kit, shard.as_ref(), self.retention_days);
            match purge.instrument(request_span(&kit.rid)).await {
                Ok(deleted) => report.affected += deleted,
                Err(e) => {
                    warn!(shard = shard.id(), error = %e, "purge failed");
                    report.failed_shards += 1;
                }
            }
        }
        report
    }

    /// Fail stale `Unknown` events on every shard once.
    pub async fn sweep_all(&self, outbox: &EventOutbox, shards: &[Arc<dyn Shard>]) -> TickReport {
        let mut report = TickReport::default();
        for shard in shards {
            let kit = Kit::new(OPERATOR).with_timeout(self.call_timeout);
            report.shards += 1;
            let sweep = outbox.sweep_unknown(&kit, shard.as_ref(), self.stale_after);
            match sweep.instrument(request_span(&kit.rid)).await {
                Ok(failed) => report.affected += failed,
                Err(e) => {
                    warn!(shard = shard.id(), error = %e, "sweep failed");
                    report.failed_shards += 1;
                }
            }
        }
        report
    }

    /// Run both loops until `stop` flips to `true`.
    pub async fn run(
        &self,
        outbox: &EventOutbox,
        shards: &[Arc<dyn Shard>],
        mut stop: watch::Receiver<bool>,
    ) {
        let mut purge = interval(self.purge_every);
        let mut sweep = interval(self.sweep_every);
        purge.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            shards = shards.len(),
            retention_days = self.retention_days,
            "outbox maintenance started"
        );

        // A pass in flight is abandoned on stop; its open batch rolls back.
        loop {
            tokio::select! {
                _ = purge.tick() => tokio::select! {
                    report = self.purge_all(outbox, shards) => {
                        info!(
                            deleted = report.affected,
                            shards = report.shards,
                            failed_shards = report.failed_shards,
                            "purge tick"
                        );
                    }
                    _ = stopped(&mut stop) => break,
                },
                _ = sweep.tick() => tokio::select! {
                    report = self.sweep_all(outbox, shards) => {
                        info!(
                            failed_events = report.affected,
                            shards = report.shards,
                            failed_shards = report.failed_shards,
                            "sweep tick"
                        );
                    }
                    _ = stopped(&mut stop) => break,
                },
                _ = stopped(&mut stop) => break,
            }
        }
        info!("outbox maintenance stopped");
    }
}

/// Resolves once `stop` is `true` or its sender is gone.
async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}
