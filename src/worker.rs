//! Per-tenant queue workers.
//!
//! Each tenant with queued jobs gets one lazily-spawned worker task. A
//! worker polls its tenant's queue, claims due jobs, and runs them through
//! the action processor under a concurrency semaphore and a
//! jobs-per-minute token bucket. Workers idle past a threshold are torn
//! down by the housekeeping pass and recreated on the next dispatch.
//!
//! The processor is injected after construction (`set_processor`): the
//! engine builds the worker manager first, wires the processor to the
//! same backend, then hands it over before any ticker starts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::{
    sync::{watch, OwnedSemaphorePermit, Semaphore},
    task::JoinHandle,
    time::{interval, sleep, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::backends::{ClaimedJob, ProcessorBackend, QueueBackend};
use crate::db::JobStatus;
use crate::processor::ActionProcessor;
use crate::queue::QueueManager;

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// Concurrent jobs per tenant worker
    pub concurrency: usize,
    /// Per-tenant delivery rate cap
    pub jobs_per_minute: u32,
    /// Queue poll interval
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            jobs_per_minute: 100,
            poll_interval: Duration::from_millis(1000),
        }
    }
}

/// Refill-on-read token bucket for the per-tenant rate cap.
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    fn available(&mut self) -> usize {
        self.refill();
        self.tokens as usize
    }

    fn consume(&mut self, n: usize) {
        self.tokens = (self.tokens - n as f64).max(0.0);
    }
}

struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
    last_activity: Arc<Mutex<Instant>>,
}

/// Owns one worker task per tenant.
pub struct WorkerManager<B> {
    queues: Arc<QueueManager<B>>,
    processor: OnceLock<Arc<ActionProcessor<B>>>,
    config: WorkerConfig,
    workers: Mutex<HashMap<Uuid, WorkerHandle>>,
}

impl<B> WorkerManager<B>
where
    B: QueueBackend + ProcessorBackend + Send + Sync + 'static,
{
    pub fn new(queues: Arc<QueueManager<B>>, config: WorkerConfig) -> Self {
        Self {
            queues,
            processor: OnceLock::new(),
            config,
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Inject the processor. Must happen before any worker claims a job;
    /// workers spin without claiming until it does.
    pub fn set_processor(&self, processor: Arc<ActionProcessor<B>>) {
        if self.processor.set(processor).is_err() {
            warn!("processor already set on worker manager");
        }
    }

    /// Ensure a worker task exists for the tenant.
    pub fn get_or_create_worker(self: &Arc<Self>, tenant_id: Uuid) {
        let mut workers = self.workers.lock().expect("worker map poisoned");
        if workers.contains_key(&tenant_id) {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let manager = Arc::clone(self);
        let activity = Arc::clone(&last_activity);
        let handle = tokio::spawn(async move {
            manager.run_worker(tenant_id, shutdown_rx, activity).await;
        });

        info!(tenant_id = %tenant_id, "spawned tenant worker");
        workers.insert(
            tenant_id,
            WorkerHandle {
                shutdown_tx,
                handle,
                last_activity,
            },
        );
    }

    pub fn worker_count(&self) -> usize {
        self.workers.lock().expect("worker map poisoned").len()
    }

    async fn run_worker(
        self: Arc<Self>,
        tenant_id: Uuid,
        mut shutdown_rx: watch::Receiver<bool>,
        last_activity: Arc<Mutex<Instant>>,
    ) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut bucket = TokenBucket::new(self.config.jobs_per_minute);
        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self
                        .claim_and_run(tenant_id, &semaphore, &mut bucket, &last_activity)
                        .await
                    {
                        metrics::counter!("cadence_worker_errors_total").increment(1);
                        error!(tenant_id = %tenant_id, ?err, "worker poll cycle failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_ok() && *shutdown_rx.borrow() {
                        debug!(tenant_id = %tenant_id, "tenant worker shutting down");
                        break;
                    }
                }
            }
        }

        // Let in-flight jobs finish before the task exits.
        while semaphore.available_permits() < self.config.concurrency.max(1) {
            sleep(Duration::from_millis(10)).await;
        }
    }

    async fn claim_and_run(
        &self,
        tenant_id: Uuid,
        semaphore: &Arc<Semaphore>,
        bucket: &mut TokenBucket,
        last_activity: &Arc<Mutex<Instant>>,
    ) -> anyhow::Result<()> {
        let Some(processor) = self.processor.get() else {
            debug!(tenant_id = %tenant_id, "processor not wired yet, skipping poll");
            return Ok(());
        };

        let permits = semaphore.available_permits();
        let allowance = bucket.available().min(permits);
        if allowance == 0 {
            return Ok(());
        }

        let jobs = self.queues.claim_jobs(tenant_id, allowance as i64).await?;
        if jobs.is_empty() {
            return Ok(());
        }

        bucket.consume(jobs.len());
        *last_activity.lock().expect("activity lock poisoned") = Instant::now();
        debug!(tenant_id = %tenant_id, count = jobs.len(), "claimed queue jobs");

        for job in jobs {
            let permit = semaphore.clone().acquire_owned().await?;
            let processor = Arc::clone(processor);
            let queues = Arc::clone(&self.queues);
            tokio::spawn(async move {
                Self::run_job(processor, queues, job, permit).await;
            });
        }
        Ok(())
    }

    async fn run_job(
        processor: Arc<ActionProcessor<B>>,
        queues: Arc<QueueManager<B>>,
        job: ClaimedJob,
        _permit: OwnedSemaphorePermit,
    ) {
        match processor.process(job.action_id).await {
            Ok(outcome) => {
                metrics::counter!("cadence_jobs_processed_total").increment(1);
                debug!(
                    action_id = %job.action_id,
                    outcome = ?outcome.status,
                    "job processed"
                );
                if let Err(err) = queues.complete_job(job.action_id).await {
                    error!(action_id = %job.action_id, ?err, "failed to complete job");
                }
            }
            Err(err) => {
                metrics::counter!("cadence_jobs_failed_total").increment(1);
                error!(
                    action_id = %job.action_id,
                    attempt = job.attempts + 1,
                    max_attempts = job.max_attempts,
                    ?err,
                    "job processing failed"
                );
                match queues.fail_job(job.action_id).await {
                    Ok(JobStatus::Failed) => {
                        warn!(action_id = %job.action_id, "job attempts exhausted");
                    }
                    Ok(_) => {}
                    Err(fail_err) => {
                        error!(action_id = %job.action_id, ?fail_err, "failed to record job failure");
                    }
                }
            }
        }
    }

    /// Tear down workers with no claimed work for `threshold`. Returns the
    /// number evicted.
    pub async fn remove_idle_workers(&self, threshold: Duration) -> usize {
        let idle: Vec<(Uuid, WorkerHandle)> = {
            let mut workers = self.workers.lock().expect("worker map poisoned");
            let idle_ids: Vec<Uuid> = workers
                .iter()
                .filter(|(_, handle)| {
                    handle
                        .last_activity
                        .lock()
                        .expect("activity lock poisoned")
                        .elapsed()
                        >= threshold
                })
                .map(|(id, _)| *id)
                .collect();
            idle_ids
                .into_iter()
                .filter_map(|id| workers.remove(&id).map(|h| (id, h)))
                .collect()
        };

        let count = idle.len();
        for (tenant_id, handle) in idle {
            let _ = handle.shutdown_tx.send(true);
            if let Err(err) = handle.handle.await {
                error!(tenant_id = %tenant_id, ?err, "idle worker task panicked");
            }
            info!(tenant_id = %tenant_id, "evicted idle tenant worker");
        }
        count
    }

    /// Stop every worker and wait for their in-flight jobs.
    pub async fn shutdown_all(&self) {
        let workers: Vec<(Uuid, WorkerHandle)> = {
            let mut map = self.workers.lock().expect("worker map poisoned");
            map.drain().collect()
        };

        for (_, handle) in &workers {
            let _ = handle.shutdown_tx.send(true);
        }
        for (tenant_id, handle) in workers {
            if let Err(err) = handle.handle.await {
                error!(tenant_id = %tenant_id, ?err, "worker task panicked during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;
    use crate::db::ActionStatus;
    use crate::outbound::{Delivery, DeliveryError, LogDelivery, RenderedEmail};
    use crate::retry::BackoffConfig;
    use async_trait::async_trait;
    use chrono::Utc;

    fn test_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            jobs_per_minute: 100,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn queue_manager(backend: Arc<MemoryBackend>) -> Arc<QueueManager<MemoryBackend>> {
        Arc::new(QueueManager::new(
            backend,
            3,
            BackoffConfig::queue_default(5000),
            500,
        ))
    }

    async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    struct FailingDelivery;

    #[async_trait]
    impl Delivery for FailingDelivery {
        async fn deliver_email(&self, _email: &RenderedEmail) -> Result<(), DeliveryError> {
            Err(DeliveryError::Address(
                "nope".parse::<lettre::Address>().unwrap_err(),
            ))
        }
    }

    #[tokio::test]
    async fn worker_drains_queue_end_to_end() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = queue_manager(backend.clone());
        let manager = Arc::new(WorkerManager::new(queues.clone(), test_config()));
        manager.set_processor(Arc::new(ActionProcessor::new(
            backend.clone(),
            Arc::new(LogDelivery),
        )));

        let tenant = Uuid::new_v4();
        let sequence = Uuid::new_v4();
        let conversation = backend.seed_conversation(tenant, sequence, "ada@example.com");
        backend.seed_sender(tenant, "email", "sales@corp.example.com");
        let step = backend.seed_step(sequence, "email", 0, "Hello");
        let action = backend.seed_action(
            conversation,
            step,
            "email",
            Utc::now(),
            ActionStatus::Processing,
        );

        queues.enqueue(tenant, action).await.unwrap();
        manager.get_or_create_worker(tenant);

        let sent = wait_until(
            || {
                backend
                    .action(action)
                    .map(|a| a.status == ActionStatus::Sent.as_str())
                    .unwrap_or(false)
            },
            Duration::from_secs(2),
        )
        .await;
        assert!(sent, "action was not processed in time");
        assert_eq!(backend.job_status(action), Some(JobStatus::Completed));

        manager.shutdown_all().await;
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn worker_is_created_once_per_tenant() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = queue_manager(backend.clone());
        let manager = Arc::new(WorkerManager::new(queues, test_config()));
        let tenant = Uuid::new_v4();

        manager.get_or_create_worker(tenant);
        manager.get_or_create_worker(tenant);
        assert_eq!(manager.worker_count(), 1);

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn idle_workers_are_evicted() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = queue_manager(backend.clone());
        let manager = Arc::new(WorkerManager::new(queues, test_config()));

        manager.get_or_create_worker(Uuid::new_v4());
        manager.get_or_create_worker(Uuid::new_v4());
        assert_eq!(manager.worker_count(), 2);

        // Zero threshold treats every worker as idle.
        let evicted = manager.remove_idle_workers(Duration::ZERO).await;
        assert_eq!(evicted, 2);
        assert_eq!(manager.worker_count(), 0);
    }

    #[tokio::test]
    async fn failed_delivery_delays_job_for_retry() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = queue_manager(backend.clone());
        let manager = Arc::new(WorkerManager::new(queues.clone(), test_config()));
        manager.set_processor(Arc::new(ActionProcessor::new(
            backend.clone(),
            Arc::new(FailingDelivery),
        )));

        let tenant = Uuid::new_v4();
        let sequence = Uuid::new_v4();
        let conversation = backend.seed_conversation(tenant, sequence, "ada@example.com");
        backend.seed_sender(tenant, "email", "sales@corp.example.com");
        let step = backend.seed_step(sequence, "email", 0, "Hello");
        let action = backend.seed_action(
            conversation,
            step,
            "email",
            Utc::now(),
            ActionStatus::Processing,
        );

        queues.enqueue(tenant, action).await.unwrap();
        manager.get_or_create_worker(tenant);

        let delayed = wait_until(
            || backend.job_status(action) == Some(JobStatus::Delayed),
            Duration::from_secs(2),
        )
        .await;
        assert!(delayed, "job was not delayed after failed delivery");
        assert_eq!(
            backend.action(action).unwrap().status,
            ActionStatus::Failed.as_str()
        );
        // The cursor never moved.
        assert!(backend.conversation(conversation).unwrap().last_step_sent.is_none());

        manager.shutdown_all().await;
    }
}
