//! Per-tenant durable queue handles.
//!
//! The queue itself lives in Postgres (`outreach_jobs`, keyed by action id
//! so enqueues are idempotent); this module owns the lazily-created
//! per-tenant handles, the retry policy applied to enqueued jobs, and the
//! housekeeping pass that trims finished-job history and evicts handles
//! for queues with nothing left to do.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::backends::{BackendResult, ClaimedJob, QueueBackend, QueueCounts};
use crate::db::JobStatus;
use crate::retry::BackoffConfig;

/// Snapshot returned by [`QueueManager::get_queue_metrics`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueMetrics {
    pub counts: QueueCounts,
    pub paused: bool,
}

#[derive(Debug)]
struct QueueHandle {
    name: String,
    paused: bool,
}

/// Owns one durable queue handle per tenant.
pub struct QueueManager<B> {
    backend: Arc<B>,
    max_attempts: i32,
    backoff: BackoffConfig,
    keep_finished: i64,
    queues: Mutex<HashMap<Uuid, QueueHandle>>,
}

impl<B: QueueBackend> QueueManager<B> {
    pub fn new(
        backend: Arc<B>,
        max_attempts: i32,
        backoff: BackoffConfig,
        keep_finished: i64,
    ) -> Self {
        Self {
            backend,
            max_attempts,
            backoff,
            keep_finished,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// The queue name for a tenant, creating the handle on first use.
    pub fn get_or_create_queue(&self, tenant_id: Uuid) -> String {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        queues
            .entry(tenant_id)
            .or_insert_with(|| {
                let name = format!("outreach:{tenant_id}");
                info!(tenant_id = %tenant_id, queue = %name, "created tenant queue");
                QueueHandle {
                    name: name.clone(),
                    paused: false,
                }
            })
            .name
            .clone()
    }

    pub fn has_queue(&self, tenant_id: Uuid) -> bool {
        self.queues
            .lock()
            .expect("queue map poisoned")
            .contains_key(&tenant_id)
    }

    fn is_paused(&self, tenant_id: Uuid) -> bool {
        self.queues
            .lock()
            .expect("queue map poisoned")
            .get(&tenant_id)
            .map(|q| q.paused)
            .unwrap_or(false)
    }

    /// Pause claiming for a tenant. Returns false when no handle exists.
    pub fn pause_queue(&self, tenant_id: Uuid) -> bool {
        self.set_paused(tenant_id, true)
    }

    /// Resume claiming for a tenant. Returns false when no handle exists.
    pub fn resume_queue(&self, tenant_id: Uuid) -> bool {
        self.set_paused(tenant_id, false)
    }

    fn set_paused(&self, tenant_id: Uuid, paused: bool) -> bool {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        match queues.get_mut(&tenant_id) {
            Some(handle) => {
                handle.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Enqueue a job for a claimed action. Idempotent on the action id:
    /// re-enqueueing returns the existing job's id.
    pub async fn enqueue(&self, tenant_id: Uuid, action_id: Uuid) -> BackendResult<Uuid> {
        self.get_or_create_queue(tenant_id);
        let job_id = self
            .backend
            .enqueue_job(tenant_id, action_id, self.max_attempts)
            .await?;
        metrics::counter!("cadence_jobs_enqueued_total").increment(1);
        Ok(job_id)
    }

    /// Claim up to `limit` due jobs for a tenant. Paused queues yield
    /// nothing.
    pub async fn claim_jobs(&self, tenant_id: Uuid, limit: i64) -> BackendResult<Vec<ClaimedJob>> {
        if limit <= 0 || self.is_paused(tenant_id) {
            return Ok(Vec::new());
        }
        self.backend.claim_due_jobs(tenant_id, Utc::now(), limit).await
    }

    pub async fn complete_job(&self, action_id: Uuid) -> BackendResult<()> {
        self.backend.complete_job(action_id).await
    }

    /// Record a failed attempt, applying this queue's backoff policy.
    pub async fn fail_job(&self, action_id: Uuid) -> BackendResult<JobStatus> {
        self.backend.fail_job(action_id, self.backoff).await
    }

    /// Queue depth for a tenant, `None` when no handle has been created.
    pub async fn get_queue_metrics(&self, tenant_id: Uuid) -> BackendResult<Option<QueueMetrics>> {
        let paused = {
            let queues = self.queues.lock().expect("queue map poisoned");
            match queues.get(&tenant_id) {
                Some(handle) => handle.paused,
                None => return Ok(None),
            }
        };
        let counts = self.backend.queue_counts(tenant_id).await?;
        Ok(Some(QueueMetrics { counts, paused }))
    }

    /// Trim finished-job history and drop handles for idle queues.
    /// Returns the number of handles evicted.
    pub async fn cleanup_idle_queues(&self) -> BackendResult<usize> {
        let tenants: Vec<Uuid> = {
            let queues = self.queues.lock().expect("queue map poisoned");
            queues.keys().copied().collect()
        };

        let mut evicted = 0;
        for tenant_id in tenants {
            let trimmed = self
                .backend
                .trim_finished_jobs(tenant_id, self.keep_finished)
                .await?;
            if trimmed > 0 {
                debug!(tenant_id = %tenant_id, trimmed, "trimmed finished jobs");
            }

            let counts = self.backend.queue_counts(tenant_id).await?;
            if counts.is_idle() {
                let mut queues = self.queues.lock().expect("queue map poisoned");
                if let Some(handle) = queues.remove(&tenant_id) {
                    info!(tenant_id = %tenant_id, queue = %handle.name, "evicted idle queue");
                    evicted += 1;
                }
            }
        }
        Ok(evicted)
    }

    /// Drop every handle. Jobs in Postgres are untouched and will be
    /// picked up again once a queue is recreated.
    pub fn close_all(&self) {
        let mut queues = self.queues.lock().expect("queue map poisoned");
        let count = queues.len();
        queues.clear();
        if count > 0 {
            info!(count, "closed all tenant queues");
        }
    }

    pub fn queue_count(&self) -> usize {
        self.queues.lock().expect("queue map poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::MemoryBackend;

    fn manager(backend: Arc<MemoryBackend>) -> QueueManager<MemoryBackend> {
        QueueManager::new(backend, 3, BackoffConfig::queue_default(5000), 500)
    }

    #[tokio::test]
    async fn queue_is_created_lazily() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend);
        let tenant = Uuid::new_v4();

        assert!(!queues.has_queue(tenant));
        let name = queues.get_or_create_queue(tenant);
        assert_eq!(name, format!("outreach:{tenant}"));
        assert!(queues.has_queue(tenant));
        assert_eq!(queues.queue_count(), 1);

        // Second call reuses the handle.
        queues.get_or_create_queue(tenant);
        assert_eq!(queues.queue_count(), 1);
    }

    #[tokio::test]
    async fn metrics_are_none_without_a_handle() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend);
        let tenant = Uuid::new_v4();

        assert!(queues.get_queue_metrics(tenant).await.unwrap().is_none());

        queues.enqueue(tenant, Uuid::new_v4()).await.unwrap();
        let metrics = queues.get_queue_metrics(tenant).await.unwrap().unwrap();
        assert_eq!(metrics.counts.waiting, 1);
        assert!(!metrics.paused);
    }

    #[tokio::test]
    async fn paused_queue_claims_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend);
        let tenant = Uuid::new_v4();

        queues.enqueue(tenant, Uuid::new_v4()).await.unwrap();
        assert!(queues.pause_queue(tenant));
        assert!(queues.claim_jobs(tenant, 10).await.unwrap().is_empty());

        assert!(queues.resume_queue(tenant));
        assert_eq!(queues.claim_jobs(tenant, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_evicts_idle_queues_only() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend.clone());
        let idle_tenant = Uuid::new_v4();
        let busy_tenant = Uuid::new_v4();

        let done_action = Uuid::new_v4();
        queues.enqueue(idle_tenant, done_action).await.unwrap();
        queues.claim_jobs(idle_tenant, 1).await.unwrap();
        queues.complete_job(done_action).await.unwrap();

        queues.enqueue(busy_tenant, Uuid::new_v4()).await.unwrap();

        let evicted = queues.cleanup_idle_queues().await.unwrap();
        assert_eq!(evicted, 1);
        assert!(!queues.has_queue(idle_tenant));
        assert!(queues.has_queue(busy_tenant));
    }

    #[tokio::test]
    async fn fail_job_applies_queue_backoff() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend.clone());
        let tenant = Uuid::new_v4();
        let action = Uuid::new_v4();

        queues.enqueue(tenant, action).await.unwrap();
        queues.claim_jobs(tenant, 1).await.unwrap();

        assert_eq!(queues.fail_job(action).await.unwrap(), JobStatus::Delayed);
        assert_eq!(queues.fail_job(action).await.unwrap(), JobStatus::Delayed);
        assert_eq!(queues.fail_job(action).await.unwrap(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn close_all_drops_handles_but_keeps_jobs() {
        let backend = Arc::new(MemoryBackend::new());
        let queues = manager(backend.clone());
        let tenant = Uuid::new_v4();

        queues.enqueue(tenant, Uuid::new_v4()).await.unwrap();
        queues.close_all();
        assert_eq!(queues.queue_count(), 0);
        assert_eq!(backend.job_count(), 1);
    }
}
