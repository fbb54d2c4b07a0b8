//! Backend interfaces for the scheduling and dispatch loops.
//!
//! Each component of the engine talks to persistence through a narrow
//! capability trait. The Postgres implementation lives in
//! [`super::postgres`]; an in-memory implementation for tests and local
//! runs lives in [`super::memory`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::{Conversation, ScheduledAction, SenderIdentity, SequenceStep};
use crate::retry::BackoffConfig;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A due action as seen by the poller: the action id plus the owning
/// conversation's tenant, eagerly joined so partitioning needs no second
/// round trip. `tenant_id` is `None` when the conversation row is gone.
#[derive(Clone, Debug)]
pub struct DueAction {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub tenant_id: Option<Uuid>,
    pub scheduled_at: DateTime<Utc>,
}

/// A queue job claimed by a tenant worker.
#[derive(Clone, Debug)]
pub struct ClaimedJob {
    pub action_id: Uuid,
    pub job_id: Uuid,
    pub tenant_id: Uuid,
    pub attempts: i32,
    pub max_attempts: i32,
}

/// Snapshot of one tenant queue's depth.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub waiting: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub delayed: i64,
}

impl QueueCounts {
    /// A queue with nothing waiting and nothing in flight is idle.
    pub fn is_idle(&self) -> bool {
        self.waiting == 0 && self.active == 0 && self.delayed == 0
    }
}

/// Everything the processor needs to act on one scheduled action.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    pub action: ScheduledAction,
    pub conversation: Conversation,
    pub step: SequenceStep,
    pub sender: Option<SenderIdentity>,
}

/// Payload for creating the follow-up action after a successful send.
#[derive(Clone, Debug)]
pub struct NewAction {
    pub conversation_id: Uuid,
    pub step_id: Uuid,
    pub channel: String,
    pub action_type: String,
    pub scheduled_at: DateTime<Utc>,
    pub sender_identity_id: Option<Uuid>,
}

/// Audit record appended after a successful delivery.
#[derive(Clone, Debug)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub action_id: Uuid,
    pub channel: String,
    pub subject: Option<String>,
    pub body: String,
    pub sender: String,
}

/// Backend capability for the scheduler poll loop.
#[async_trait]
pub trait SchedulerBackend: Send + Sync {
    /// All pending actions whose `scheduled_at` has passed, with the owning
    /// conversation's tenant joined in.
    async fn find_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<DueAction>>;

    /// Atomically flip the given pending rows to processing. Returns the
    /// ids actually claimed; rows that were cancelled or already claimed
    /// elsewhere are left untouched and excluded from the result.
    async fn claim_actions(&self, action_ids: &[Uuid]) -> BackendResult<Vec<Uuid>>;

    /// Persist the queue job correlation id onto a claimed row.
    async fn record_dispatch(&self, action_id: Uuid, job_id: Uuid) -> BackendResult<()>;

    /// Compensating action after a failed claim-and-enqueue pass: flip
    /// processing rows back to pending and clear their correlation ids.
    async fn revert_actions(&self, action_ids: &[Uuid]) -> BackendResult<u64>;
}

/// Backend capability for the durable per-tenant job queue.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Enqueue a job for an action. Idempotent: the action id is the job
    /// identity, so a retried enqueue returns the existing job's id. A
    /// finished (completed or failed) job is re-armed to waiting with
    /// fresh attempts so a re-claimed action gets delivered again.
    async fn enqueue_job(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        max_attempts: i32,
    ) -> BackendResult<Uuid>;

    /// Claim up to `limit` due jobs for one tenant, marking them active.
    async fn claim_due_jobs(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<ClaimedJob>>;

    /// Mark a job completed.
    async fn complete_job(&self, action_id: Uuid) -> BackendResult<()>;

    /// Record a failed attempt. Returns the job's new status: `Delayed`
    /// with a backoff-computed `next_attempt_at` while attempts remain,
    /// `Failed` once they are exhausted.
    async fn fail_job(
        &self,
        action_id: Uuid,
        backoff: BackoffConfig,
    ) -> BackendResult<crate::db::JobStatus>;

    /// Queue depth counts for one tenant.
    async fn queue_counts(&self, tenant_id: Uuid) -> BackendResult<QueueCounts>;

    /// Delete finished job rows beyond the most recent `keep`.
    async fn trim_finished_jobs(&self, tenant_id: Uuid, keep: i64) -> BackendResult<u64>;
}

/// Backend capability for the action processor.
#[async_trait]
pub trait ProcessorBackend: Send + Sync {
    /// Load the action with every relation needed to act. `None` when the
    /// action row no longer exists (already handled or cleaned up).
    async fn load_dispatch_context(
        &self,
        action_id: Uuid,
    ) -> BackendResult<Option<DispatchContext>>;

    /// Terminal success: status `sent`.
    async fn mark_action_sent(&self, action_id: Uuid) -> BackendResult<()>;

    /// Terminal failure: status `failed`.
    async fn mark_action_failed(&self, action_id: Uuid) -> BackendResult<()>;

    /// Append the audit message for a delivered send.
    async fn record_message(&self, message: &NewMessage) -> BackendResult<Uuid>;

    /// Advance the conversation cursors after a successful send.
    async fn advance_conversation(
        &self,
        conversation_id: Uuid,
        step_id: Uuid,
    ) -> BackendResult<()>;

    /// The next step template in a sequence, strictly after the given step
    /// in `(day_offset, id)` order. Deterministic under equal offsets.
    async fn find_next_step(
        &self,
        sequence_id: Uuid,
        after: &SequenceStep,
    ) -> BackendResult<Option<SequenceStep>>;

    /// Resolve an enabled sender identity for a tenant and channel.
    async fn resolve_sender(
        &self,
        tenant_id: Uuid,
        channel: &str,
    ) -> BackendResult<Option<SenderIdentity>>;

    /// Insert the follow-up action and set the conversation's
    /// `next_action_at` in one step.
    async fn schedule_followup(&self, action: &NewAction) -> BackendResult<Uuid>;

    /// Sequence exhausted: mark the conversation completed and clear
    /// `next_action_at`.
    async fn complete_conversation(&self, conversation_id: Uuid) -> BackendResult<()>;

    /// Missing sender or other human-attention condition: park the
    /// conversation for review without erroring.
    async fn flag_needs_review(&self, conversation_id: Uuid) -> BackendResult<()>;
}

/// Backend capability for crash recovery.
#[async_trait]
pub trait ReclaimerBackend: Send + Sync {
    /// Reset processing actions whose `updated_at` is older than the cutoff
    /// back to pending, clearing their correlation ids and dropping any
    /// stuck queue jobs. Returns the number of actions reclaimed.
    async fn reclaim_stale_actions(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<u64>;
}
