//! Crash recovery for stuck actions.
//!
//! An action sits in processing while a job is queued or running. If the
//! process died between claim and completion, nothing will ever move it
//! again: the reclaimer sweeps processing rows whose `updated_at` is past
//! a staleness threshold back to pending, clearing the stale job
//! correlation so the next poll dispatches them fresh. The threshold is
//! far above worst-case legitimate processing time, so a live job is
//! never stolen.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::Utc;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::backends::ReclaimerBackend;

#[derive(Clone, Debug)]
pub struct ReclaimerConfig {
    /// Sweep cadence
    pub sweep_interval: Duration,
    /// Age at which a processing action counts as stuck
    pub stale_after: Duration,
    /// Rows reclaimed per backend call
    pub batch_size: i64,
}

impl Default for ReclaimerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(600),
            stale_after: Duration::from_secs(1800),
            batch_size: 100,
        }
    }
}

/// Handle to the running sweep loop.
pub struct Reclaimer {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl Reclaimer {
    pub fn start<B>(config: ReclaimerConfig, backend: Arc<B>) -> Self
    where
        B: ReclaimerBackend + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = ReclaimerTask {
                config,
                backend,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "reclaimer terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("reclaimer task panicked: {err}")),
        }
    }
}

struct ReclaimerTask<B> {
    config: ReclaimerConfig,
    backend: Arc<B>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B: ReclaimerBackend> ReclaimerTask<B> {
    async fn run(mut self) -> Result<()> {
        info!(
            sweep_interval_secs = self.config.sweep_interval.as_secs(),
            stale_after_secs = self.config.stale_after.as_secs(),
            batch_size = self.config.batch_size,
            "starting stuck-action reclaimer",
        );

        let mut ticker = interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.sweep_until_drained().await {
                        metrics::counter!("cadence_reclaim_errors_total").increment(1);
                        error!(?err, "reclaim sweep failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("reclaimer shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// A full batch means more stale rows are likely waiting; sweep again
    /// immediately instead of holding them until the next tick.
    async fn sweep_until_drained(&self) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after)
                .map_err(|err| anyhow!("stale_after out of range: {err}"))?;

        let mut total = 0;
        loop {
            let reclaimed = self
                .backend
                .reclaim_stale_actions(cutoff, self.config.batch_size)
                .await?;
            total += reclaimed;

            if reclaimed > 0 {
                metrics::counter!("cadence_actions_reclaimed_total").increment(reclaimed);
                warn!(reclaimed, "reset stuck actions to pending");
            } else {
                debug!("no stuck actions found");
            }

            if reclaimed < self.config.batch_size as u64 {
                return Ok(total);
            }
        }
    }
}
