//! The scheduling poller.
//!
//! A single loop wakes on a fixed cadence, finds pending actions whose
//! `scheduled_at` has passed, and moves each tenant's batch through
//! claim -> enqueue -> record-dispatch. One loop means polls never
//! overlap; tenants are dispatched independently so one tenant's broken
//! queue cannot stall the others. A partition that fails mid-dispatch has
//! its claims reverted to pending and is retried on the next tick.

use std::collections::HashMap;
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
use uuid::Uuid;

use crate::backends::{DueAction, ProcessorBackend, QueueBackend, SchedulerBackend};
use crate::queue::QueueManager;
use crate::worker::WorkerManager;

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

/// Handle to the running poll loop.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl Scheduler {
    pub fn start<B>(
        config: SchedulerConfig,
        backend: Arc<B>,
        queues: Arc<QueueManager<B>>,
        workers: Arc<WorkerManager<B>>,
    ) -> Self
    where
        B: SchedulerBackend + QueueBackend + ProcessorBackend + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let task = SchedulerTask {
                config,
                backend,
                queues,
                workers,
                shutdown_rx,
            };
            if let Err(err) = task.run().await {
                error!(?err, "scheduler terminated with error");
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
            Err(err) => Err(anyhow!("scheduler task panicked: {err}")),
        }
    }
}

/// Result of one poll pass over the due set.
struct PollPass {
    /// Due rows returned by the find query, dispatched or not.
    found: usize,
    /// Tenant partitions whose dispatch failed and was reverted.
    failed_partitions: usize,
}

struct SchedulerTask<B> {
    config: SchedulerConfig,
    backend: Arc<B>,
    queues: Arc<QueueManager<B>>,
    workers: Arc<WorkerManager<B>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<B> SchedulerTask<B>
where
    B: SchedulerBackend + QueueBackend + ProcessorBackend + Send + Sync + 'static,
{
    async fn run(mut self) -> Result<()> {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "starting scheduler",
        );

        let mut ticker = interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_until_drained().await {
                        metrics::counter!("cadence_poll_errors_total").increment(1);
                        error!(?err, "scheduler poll cycle failed");
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("scheduler shutting down");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// A full due batch usually means more rows are waiting behind it;
    /// keep polling until a batch comes back short. A pass with a failed
    /// partition stops draining: its rows were just reverted to pending
    /// and would be re-found immediately, so they wait for the next tick.
    async fn poll_until_drained(&self) -> Result<()> {
        loop {
            let pass = self.poll_once().await?;
            if pass.failed_partitions > 0 || pass.found < self.config.batch_size as usize {
                return Ok(());
            }
        }
    }

    async fn poll_once(&self) -> Result<PollPass> {
        let due = self
            .backend
            .find_due_actions(Utc::now(), self.config.batch_size)
            .await?;
        let mut pass = PollPass {
            found: due.len(),
            failed_partitions: 0,
        };
        if pass.found == 0 {
            return Ok(pass);
        }
        debug!(count = pass.found, "found due actions");

        for (tenant_id, action_ids) in partition_by_tenant(due) {
            if let Err(err) = self.dispatch_partition(tenant_id, &action_ids).await {
                pass.failed_partitions += 1;
                metrics::counter!("cadence_partition_errors_total").increment(1);
                error!(
                    tenant_id = %tenant_id,
                    ?err,
                    "partition dispatch failed, reverting claims"
                );
                match self.backend.revert_actions(&action_ids).await {
                    Ok(reverted) => {
                        metrics::counter!("cadence_actions_reverted_total")
                            .increment(reverted);
                        warn!(tenant_id = %tenant_id, reverted, "reverted claimed actions");
                    }
                    Err(revert_err) => {
                        error!(
                            tenant_id = %tenant_id,
                            ?revert_err,
                            "failed to revert claimed actions, reclaimer will recover them"
                        );
                    }
                }
            }
        }
        Ok(pass)
    }

    async fn dispatch_partition(&self, tenant_id: Uuid, action_ids: &[Uuid]) -> Result<()> {
        let claimed = self.backend.claim_actions(action_ids).await?;
        if claimed.is_empty() {
            return Ok(());
        }
        metrics::counter!("cadence_actions_claimed_total").increment(claimed.len() as u64);

        self.queues.get_or_create_queue(tenant_id);
        for action_id in &claimed {
            let job_id = self.queues.enqueue(tenant_id, *action_id).await?;
            self.backend.record_dispatch(*action_id, job_id).await?;
        }

        // A worker must exist before jobs can drain.
        self.workers.get_or_create_worker(tenant_id);

        debug!(
            tenant_id = %tenant_id,
            claimed = claimed.len(),
            "dispatched partition"
        );
        Ok(())
    }
}

/// Group due actions by tenant. Rows whose conversation no longer exists
/// carry no tenant; they are logged and left pending for cleanup.
fn partition_by_tenant(due: Vec<DueAction>) -> HashMap<Uuid, Vec<Uuid>> {
    let mut partitions: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for action in due {
        match action.tenant_id {
            Some(tenant_id) => partitions.entry(tenant_id).or_default().push(action.id),
            None => {
                metrics::counter!("cadence_orphan_actions_total").increment(1);
                warn!(
                    action_id = %action.id,
                    conversation_id = %action.conversation_id,
                    "due action has no owning conversation, skipping"
                );
            }
        }
    }
    partitions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{
        BackendError, BackendResult, ClaimedJob, DispatchContext, MemoryBackend, NewAction,
        NewMessage, QueueCounts,
    };
    use crate::db::{ActionStatus, JobStatus, SenderIdentity, SequenceStep};
    use crate::retry::BackoffConfig;
    use crate::worker::WorkerConfig;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    /// Delegating backend that fails enqueues for one tenant.
    struct FaultyBackend {
        inner: Arc<MemoryBackend>,
        fail_enqueue_for: Uuid,
    }

    #[async_trait]
    impl SchedulerBackend for FaultyBackend {
        async fn find_due_actions(
            &self,
            now: DateTime<Utc>,
            limit: i64,
        ) -> BackendResult<Vec<DueAction>> {
            self.inner.find_due_actions(now, limit).await
        }
        async fn claim_actions(&self, action_ids: &[Uuid]) -> BackendResult<Vec<Uuid>> {
            self.inner.claim_actions(action_ids).await
        }
        async fn record_dispatch(&self, action_id: Uuid, job_id: Uuid) -> BackendResult<()> {
            self.inner.record_dispatch(action_id, job_id).await
        }
        async fn revert_actions(&self, action_ids: &[Uuid]) -> BackendResult<u64> {
            self.inner.revert_actions(action_ids).await
        }
    }

    #[async_trait]
    impl QueueBackend for FaultyBackend {
        async fn enqueue_job(
            &self,
            tenant_id: Uuid,
            action_id: Uuid,
            max_attempts: i32,
        ) -> BackendResult<Uuid> {
            if tenant_id == self.fail_enqueue_for {
                return Err(BackendError::Message("queue unavailable".to_string()));
            }
            self.inner.enqueue_job(tenant_id, action_id, max_attempts).await
        }
        async fn claim_due_jobs(
            &self,
            tenant_id: Uuid,
            now: DateTime<Utc>,
            limit: i64,
        ) -> BackendResult<Vec<ClaimedJob>> {
            self.inner.claim_due_jobs(tenant_id, now, limit).await
        }
        async fn complete_job(&self, action_id: Uuid) -> BackendResult<()> {
            self.inner.complete_job(action_id).await
        }
        async fn fail_job(
            &self,
            action_id: Uuid,
            backoff: BackoffConfig,
        ) -> BackendResult<JobStatus> {
            self.inner.fail_job(action_id, backoff).await
        }
        async fn queue_counts(&self, tenant_id: Uuid) -> BackendResult<QueueCounts> {
            self.inner.queue_counts(tenant_id).await
        }
        async fn trim_finished_jobs(&self, tenant_id: Uuid, keep: i64) -> BackendResult<u64> {
            self.inner.trim_finished_jobs(tenant_id, keep).await
        }
    }

    #[async_trait]
    impl ProcessorBackend for FaultyBackend {
        async fn load_dispatch_context(
            &self,
            action_id: Uuid,
        ) -> BackendResult<Option<DispatchContext>> {
            self.inner.load_dispatch_context(action_id).await
        }
        async fn mark_action_sent(&self, action_id: Uuid) -> BackendResult<()> {
            self.inner.mark_action_sent(action_id).await
        }
        async fn mark_action_failed(&self, action_id: Uuid) -> BackendResult<()> {
            self.inner.mark_action_failed(action_id).await
        }
        async fn record_message(&self, message: &NewMessage) -> BackendResult<Uuid> {
            self.inner.record_message(message).await
        }
        async fn advance_conversation(
            &self,
            conversation_id: Uuid,
            step_id: Uuid,
        ) -> BackendResult<()> {
            self.inner.advance_conversation(conversation_id, step_id).await
        }
        async fn find_next_step(
            &self,
            sequence_id: Uuid,
            after: &SequenceStep,
        ) -> BackendResult<Option<SequenceStep>> {
            self.inner.find_next_step(sequence_id, after).await
        }
        async fn resolve_sender(
            &self,
            tenant_id: Uuid,
            channel: &str,
        ) -> BackendResult<Option<SenderIdentity>> {
            self.inner.resolve_sender(tenant_id, channel).await
        }
        async fn schedule_followup(&self, action: &NewAction) -> BackendResult<Uuid> {
            self.inner.schedule_followup(action).await
        }
        async fn complete_conversation(&self, conversation_id: Uuid) -> BackendResult<()> {
            self.inner.complete_conversation(conversation_id).await
        }
        async fn flag_needs_review(&self, conversation_id: Uuid) -> BackendResult<()> {
            self.inner.flag_needs_review(conversation_id).await
        }
    }

    fn task<B>(backend: Arc<B>) -> SchedulerTask<B>
    where
        B: SchedulerBackend + QueueBackend + ProcessorBackend + Send + Sync + 'static,
    {
        let queues = Arc::new(QueueManager::new(
            backend.clone(),
            3,
            BackoffConfig::queue_default(5000),
            500,
        ));
        let workers = Arc::new(WorkerManager::new(
            queues.clone(),
            WorkerConfig {
                poll_interval: Duration::from_secs(3600),
                ..WorkerConfig::default()
            },
        ));
        let (_tx, shutdown_rx) = watch::channel(false);
        SchedulerTask {
            config: SchedulerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
            },
            backend,
            queues,
            workers,
            shutdown_rx,
        }
    }

    fn seed_due_action(backend: &MemoryBackend, tenant: Uuid) -> (Uuid, Uuid) {
        let sequence = Uuid::new_v4();
        let conversation = backend.seed_conversation(tenant, sequence, "lead@example.com");
        let step = backend.seed_step(sequence, "email", 0, "Hello");
        let action = backend.seed_action(
            conversation,
            step,
            "email",
            Utc::now() - chrono::Duration::minutes(1),
            ActionStatus::Pending,
        );
        (action, conversation)
    }

    #[tokio::test]
    async fn poll_claims_enqueues_and_records_dispatch() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let (action, _) = seed_due_action(&backend, tenant);
        let task = task(backend.clone());

        let pass = task.poll_once().await.unwrap();

        assert_eq!(pass.found, 1);
        assert_eq!(pass.failed_partitions, 0);
        let row = backend.action(action).unwrap();
        assert_eq!(row.status, ActionStatus::Processing.as_str());
        assert!(row.dispatch_job_id.is_some());
        assert_eq!(backend.job_status(action), Some(JobStatus::Waiting));
        assert!(task.queues.has_queue(tenant));
        assert_eq!(task.workers.worker_count(), 1);

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn second_poll_does_not_redispatch_claimed_rows() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        seed_due_action(&backend, tenant);
        let task = task(backend.clone());

        assert_eq!(task.poll_once().await.unwrap().found, 1);
        assert_eq!(task.poll_once().await.unwrap().found, 0);
        assert_eq!(backend.job_count(), 1);

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn failed_partition_is_reverted_and_isolated() {
        let inner = Arc::new(MemoryBackend::new());
        let tenant_a = Uuid::new_v4();
        let tenant_b = Uuid::new_v4();
        let (action_a, _) = seed_due_action(&inner, tenant_a);
        let (action_b, _) = seed_due_action(&inner, tenant_b);

        let backend = Arc::new(FaultyBackend {
            inner: inner.clone(),
            fail_enqueue_for: tenant_a,
        });
        let task = task(backend);

        task.poll_once().await.unwrap();

        // Tenant A's claim was rolled back; tenant B dispatched normally.
        let row_a = inner.action(action_a).unwrap();
        assert_eq!(row_a.status, ActionStatus::Pending.as_str());
        assert!(row_a.dispatch_job_id.is_none());
        assert!(inner.job_status(action_a).is_none());

        let row_b = inner.action(action_b).unwrap();
        assert_eq!(row_b.status, ActionStatus::Processing.as_str());
        assert_eq!(inner.job_status(action_b), Some(JobStatus::Waiting));

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn drain_stops_when_a_partition_keeps_failing() {
        let inner = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let (action, _) = seed_due_action(&inner, tenant);

        let backend = Arc::new(FaultyBackend {
            inner: inner.clone(),
            fail_enqueue_for: tenant,
        });
        let mut task = task(backend);
        // The reverted row refills the batch every pass; the drain must
        // still give up and leave it for the next tick.
        task.config.batch_size = 1;

        task.poll_until_drained().await.unwrap();

        let row = inner.action(action).unwrap();
        assert_eq!(row.status, ActionStatus::Pending.as_str());
        assert!(inner.job_status(action).is_none());

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn redispatch_rearms_a_finished_job() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let (action, _) = seed_due_action(&backend, tenant);
        let task = task(backend.clone());

        // First dispatch; the worker claims the job and completes it as a
        // guard skip after an external revert put the action back.
        task.poll_once().await.unwrap();
        backend.claim_due_jobs(tenant, Utc::now(), 10).await.unwrap();
        backend.complete_job(action).await.unwrap();
        backend.set_action_status(action, ActionStatus::Pending);

        task.poll_once().await.unwrap();

        let row = backend.action(action).unwrap();
        assert_eq!(row.status, ActionStatus::Processing.as_str());
        // The finished job was re-armed, not handed back completed.
        assert_eq!(backend.job_status(action), Some(JobStatus::Waiting));

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn orphaned_actions_are_skipped() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let (action, _) = seed_due_action(&backend, tenant);
        // An action pointing at a conversation row that no longer exists.
        let orphan_sequence = Uuid::new_v4();
        let orphan_conversation = Uuid::new_v4();
        let orphan_step = backend.seed_step(orphan_sequence, "email", 0, "x");
        let orphan = backend.seed_action(
            orphan_conversation,
            orphan_step,
            "email",
            Utc::now() - chrono::Duration::minutes(1),
            ActionStatus::Pending,
        );

        let task = task(backend.clone());
        task.poll_once().await.unwrap();

        // The orphan stays pending and unqueued; the healthy row dispatched.
        assert_eq!(
            backend.action(orphan).unwrap().status,
            ActionStatus::Pending.as_str()
        );
        assert!(backend.job_status(orphan).is_none());
        assert_eq!(
            backend.action(action).unwrap().status,
            ActionStatus::Processing.as_str()
        );

        task.workers.shutdown_all().await;
    }

    #[tokio::test]
    async fn scheduler_handle_starts_and_shuts_down() {
        let backend = Arc::new(MemoryBackend::new());
        let tenant = Uuid::new_v4();
        let (action, _) = seed_due_action(&backend, tenant);

        let queues = Arc::new(QueueManager::new(
            backend.clone(),
            3,
            BackoffConfig::queue_default(5000),
            500,
        ));
        let workers = Arc::new(WorkerManager::new(
            queues.clone(),
            WorkerConfig {
                poll_interval: Duration::from_secs(3600),
                ..WorkerConfig::default()
            },
        ));
        let scheduler = Scheduler::start(
            SchedulerConfig {
                poll_interval: Duration::from_millis(10),
                batch_size: 100,
            },
            backend.clone(),
            queues,
            workers.clone(),
        );

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while std::time::Instant::now() < deadline {
            if backend.job_status(action).is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.job_status(action), Some(JobStatus::Waiting));

        scheduler.shutdown().await.unwrap();
        workers.shutdown_all().await;
    }
}
