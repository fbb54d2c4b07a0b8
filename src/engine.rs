//! Engine assembly and lifecycle.
//!
//! Wires the backend, queue manager, worker manager, processor, scheduler,
//! and reclaimer together, plus a housekeeping ticker that trims finished
//! queue history and evicts idle queues and workers. Construction is
//! two-phase: the worker manager is built first, then the processor is
//! injected before any loop starts, so a worker can never claim a job it
//! has no processor for.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, error, info};

use crate::backends::{ProcessorBackend, QueueBackend, ReclaimerBackend, SchedulerBackend};
use crate::config::Config;
use crate::db::Database;
use crate::outbound::{Delivery, LogDelivery, SmtpDelivery};
use crate::processor::ActionProcessor;
use crate::queue::QueueManager;
use crate::reclaimer::{Reclaimer, ReclaimerConfig};
use crate::retry::BackoffConfig;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::worker::{WorkerConfig, WorkerManager};

/// The assembled engine. Dropping it does not stop the loops; call
/// [`Engine::shutdown`].
pub struct Engine<B> {
    scheduler: Scheduler,
    reclaimer: Reclaimer,
    housekeeping_tx: watch::Sender<bool>,
    housekeeping: JoinHandle<()>,
    queues: Arc<QueueManager<B>>,
    workers: Arc<WorkerManager<B>>,
}

impl Engine<Database> {
    /// Connect to Postgres, run migrations, and start every loop.
    pub async fn start(config: &Config) -> Result<Self> {
        let database = Arc::new(
            Database::connect(&config.database_url)
                .await
                .context("failed to connect to database")?,
        );
        Self::start_with_backend(config, database)
    }
}

impl<B> Engine<B>
where
    B: SchedulerBackend
        + QueueBackend
        + ProcessorBackend
        + ReclaimerBackend
        + Send
        + Sync
        + 'static,
{
    /// Start every loop against an already-constructed backend.
    pub fn start_with_backend(config: &Config, backend: Arc<B>) -> Result<Self> {
        let delivery: Arc<dyn Delivery> = match SmtpDelivery::from_config(&config.smtp)
            .context("invalid SMTP configuration")?
        {
            Some(smtp) => {
                info!("using SMTP delivery");
                Arc::new(smtp)
            }
            None => {
                info!("no SMTP host configured, using log-only delivery");
                Arc::new(LogDelivery)
            }
        };

        let queues = Arc::new(QueueManager::new(
            Arc::clone(&backend),
            config.job_max_attempts,
            BackoffConfig::queue_default(config.job_backoff_base_ms),
            config.queue_keep_finished,
        ));
        let workers = Arc::new(WorkerManager::new(
            Arc::clone(&queues),
            WorkerConfig {
                concurrency: config.worker_concurrency,
                jobs_per_minute: config.worker_jobs_per_minute,
                poll_interval: config.worker_poll_interval(),
            },
        ));
        workers.set_processor(Arc::new(ActionProcessor::new(
            Arc::clone(&backend),
            delivery,
        )));

        let scheduler = Scheduler::start(
            SchedulerConfig {
                poll_interval: config.poll_interval(),
                batch_size: config.poll_batch_size,
            },
            Arc::clone(&backend),
            Arc::clone(&queues),
            Arc::clone(&workers),
        );
        let reclaimer = Reclaimer::start(
            ReclaimerConfig {
                sweep_interval: config.reclaim_interval(),
                stale_after: Duration::from_secs(config.reclaim_stale_secs.max(0) as u64),
                batch_size: config.reclaim_batch_size,
            },
            Arc::clone(&backend),
        );

        let (housekeeping_tx, housekeeping_rx) = watch::channel(false);
        let housekeeping = tokio::spawn(housekeeping_loop(
            Arc::clone(&queues),
            Arc::clone(&workers),
            config.housekeeping_interval(),
            config.worker_idle_threshold(),
            housekeeping_rx,
        ));

        info!("engine started");
        Ok(Self {
            scheduler,
            reclaimer,
            housekeeping_tx,
            housekeeping,
            queues,
            workers,
        })
    }

    pub fn queues(&self) -> &Arc<QueueManager<B>> {
        &self.queues
    }

    pub fn workers(&self) -> &Arc<WorkerManager<B>> {
        &self.workers
    }

    /// Stop the poller first so nothing new is claimed, then drain the
    /// workers, then stop the reclaimer.
    pub async fn shutdown(self) -> Result<()> {
        info!("engine shutting down");
        self.scheduler.shutdown().await?;

        let _ = self.housekeeping_tx.send(true);
        self.housekeeping
            .await
            .map_err(|err| anyhow!("housekeeping task panicked: {err}"))?;

        self.workers.shutdown_all().await;
        self.queues.close_all();
        self.reclaimer.shutdown().await?;
        info!("engine stopped");
        Ok(())
    }
}

async fn housekeeping_loop<B>(
    queues: Arc<QueueManager<B>>,
    workers: Arc<WorkerManager<B>>,
    sweep_interval: Duration,
    worker_idle_threshold: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) where
    B: QueueBackend + ProcessorBackend + Send + Sync + 'static,
{
    let mut ticker = interval(sweep_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queues.cleanup_idle_queues().await {
                    Ok(evicted) if evicted > 0 => {
                        debug!(evicted, "housekeeping evicted idle queues");
                    }
                    Ok(_) => {}
                    Err(err) => error!(?err, "queue housekeeping failed"),
                }
                let evicted = workers.remove_idle_workers(worker_idle_threshold).await;
                if evicted > 0 {
                    debug!(evicted, "housekeeping evicted idle workers");
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_ok() && *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::db::{ActionStatus, AutomationStatus};
    use chrono::Utc;
    use tokio::time::sleep;
    use uuid::Uuid;

    #[tokio::test]
    async fn engine_processes_a_due_action() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let sequence = Uuid::new_v4();
        let conversation = backend.seed_conversation(tenant, sequence, "lead@example.com");
        backend.seed_sender(tenant, "email", "sales@corp.example.com");
        let step = backend.seed_step(sequence, "email", 0, "Hello {{first_name}}");
        let action = backend.seed_action(
            conversation,
            step,
            "email",
            Utc::now() - chrono::Duration::minutes(1),
            ActionStatus::Pending,
        );

        let config = Config::test_config("unused");
        let engine = Engine::start_with_backend(&config, backend.clone()).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            if backend.action(action).unwrap().status == ActionStatus::Sent.as_str() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            backend.action(action).unwrap().status,
            ActionStatus::Sent.as_str()
        );
        assert_eq!(
            backend.conversation(conversation).unwrap().automation_status,
            AutomationStatus::Completed.as_str()
        );

        engine.shutdown().await.unwrap();
    }
}
