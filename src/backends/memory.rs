//! In-memory backend for tests and local runs.
//!
//! Implements every capability trait against `HashMap`s behind a single
//! mutex, with seeding and inspection helpers so component tests can drive
//! the engine without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::base::{
    BackendResult, ClaimedJob, DispatchContext, DueAction, NewAction, NewMessage,
    ProcessorBackend, QueueBackend, QueueCounts, ReclaimerBackend, SchedulerBackend,
};
use crate::db::{
    ActionStatus, AutomationStatus, Conversation, JobStatus, ScheduledAction, SenderIdentity,
    SequenceStep,
};
use crate::retry::BackoffConfig;

#[derive(Clone, Debug)]
struct JobRow {
    action_id: Uuid,
    job_id: Uuid,
    tenant_id: Uuid,
    status: JobStatus,
    attempts: i32,
    max_attempts: i32,
    next_attempt_at: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

/// A recorded audit message with its generated id.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: Uuid,
    pub message: NewMessage,
}

#[derive(Default)]
struct State {
    actions: HashMap<Uuid, ScheduledAction>,
    conversations: HashMap<Uuid, Conversation>,
    steps: HashMap<Uuid, SequenceStep>,
    senders: HashMap<Uuid, SenderIdentity>,
    jobs: HashMap<Uuid, JobRow>,
    messages: Vec<StoredMessage>,
}

/// Backend that stores rows in memory.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("memory backend poisoned")
    }

    // ------------------------------------------------------------------
    // Seeding helpers
    // ------------------------------------------------------------------

    pub fn seed_conversation(
        &self,
        tenant_id: Uuid,
        sequence_id: Uuid,
        person_email: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.lock().conversations.insert(
            id,
            Conversation {
                id,
                tenant_id,
                sequence_id,
                person_email: person_email.to_string(),
                person_name: None,
                automation_status: AutomationStatus::Active.as_str().to_string(),
                current_step: None,
                last_step_sent: None,
                next_action_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    pub fn seed_step(
        &self,
        sequence_id: Uuid,
        channel: &str,
        day_offset: i32,
        body_template: &str,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().steps.insert(
            id,
            SequenceStep {
                id,
                sequence_id,
                channel: channel.to_string(),
                day_offset,
                subject_template: Some(format!("Step day {day_offset}")),
                body_template: body_template.to_string(),
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn seed_sender(&self, tenant_id: Uuid, channel: &str, address: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.lock().senders.insert(
            id,
            SenderIdentity {
                id,
                tenant_id,
                channel: channel.to_string(),
                address: address.to_string(),
                display_name: None,
                enabled: true,
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn seed_action(
        &self,
        conversation_id: Uuid,
        step_id: Uuid,
        channel: &str,
        scheduled_at: DateTime<Utc>,
        status: ActionStatus,
    ) -> Uuid {
        let id = Uuid::new_v4();
        let now = Utc::now();
        self.lock().actions.insert(
            id,
            ScheduledAction {
                id,
                conversation_id,
                step_id,
                channel: channel.to_string(),
                action_type: "send_message".to_string(),
                scheduled_at,
                status: status.as_str().to_string(),
                sender_identity_id: None,
                dispatch_job_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        id
    }

    // ------------------------------------------------------------------
    // Inspection / mutation helpers
    // ------------------------------------------------------------------

    pub fn action(&self, id: Uuid) -> Option<ScheduledAction> {
        self.lock().actions.get(&id).cloned()
    }

    pub fn conversation(&self, id: Uuid) -> Option<Conversation> {
        self.lock().conversations.get(&id).cloned()
    }

    pub fn actions_for_conversation(&self, conversation_id: Uuid) -> Vec<ScheduledAction> {
        let mut actions: Vec<_> = self
            .lock()
            .actions
            .values()
            .filter(|a| a.conversation_id == conversation_id)
            .cloned()
            .collect();
        actions.sort_by_key(|a| a.created_at);
        actions
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.lock().messages.clone()
    }

    pub fn job_status(&self, action_id: Uuid) -> Option<JobStatus> {
        self.lock().jobs.get(&action_id).map(|j| j.status)
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn set_automation_status(&self, conversation_id: Uuid, status: AutomationStatus) {
        if let Some(conversation) = self.lock().conversations.get_mut(&conversation_id) {
            conversation.automation_status = status.as_str().to_string();
            conversation.updated_at = Utc::now();
        }
    }

    pub fn set_action_status(&self, action_id: Uuid, status: ActionStatus) {
        if let Some(action) = self.lock().actions.get_mut(&action_id) {
            action.status = status.as_str().to_string();
            action.updated_at = Utc::now();
        }
    }

    /// Backdate a processing row so reclaimer tests can age it.
    pub fn set_action_updated_at(&self, action_id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(action) = self.lock().actions.get_mut(&action_id) {
            action.updated_at = updated_at;
        }
    }

    pub fn remove_action(&self, action_id: Uuid) {
        self.lock().actions.remove(&action_id);
    }
}

#[async_trait]
impl SchedulerBackend for MemoryBackend {
    async fn find_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<DueAction>> {
        let state = self.lock();
        let mut due: Vec<DueAction> = state
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Pending.as_str() && a.scheduled_at <= now)
            .map(|a| DueAction {
                id: a.id,
                conversation_id: a.conversation_id,
                tenant_id: state
                    .conversations
                    .get(&a.conversation_id)
                    .map(|c| c.tenant_id),
                scheduled_at: a.scheduled_at,
            })
            .collect();
        due.sort_by_key(|a| a.scheduled_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn claim_actions(&self, action_ids: &[Uuid]) -> BackendResult<Vec<Uuid>> {
        let mut state = self.lock();
        let mut claimed = Vec::new();
        for id in action_ids {
            if let Some(action) = state.actions.get_mut(id) {
                if action.status == ActionStatus::Pending.as_str() {
                    action.status = ActionStatus::Processing.as_str().to_string();
                    action.updated_at = Utc::now();
                    claimed.push(*id);
                }
            }
        }
        Ok(claimed)
    }

    async fn record_dispatch(&self, action_id: Uuid, job_id: Uuid) -> BackendResult<()> {
        if let Some(action) = self.lock().actions.get_mut(&action_id) {
            action.dispatch_job_id = Some(job_id);
            action.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn revert_actions(&self, action_ids: &[Uuid]) -> BackendResult<u64> {
        let mut state = self.lock();
        let mut reverted = 0;
        for id in action_ids {
            if let Some(action) = state.actions.get_mut(id) {
                if action.status == ActionStatus::Processing.as_str() {
                    action.status = ActionStatus::Pending.as_str().to_string();
                    action.dispatch_job_id = None;
                    action.updated_at = Utc::now();
                    reverted += 1;
                }
            }
        }
        Ok(reverted)
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    async fn enqueue_job(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        max_attempts: i32,
    ) -> BackendResult<Uuid> {
        let mut state = self.lock();
        if let Some(existing) = state.jobs.get_mut(&action_id) {
            // A finished job is re-armed so a re-claimed action can be
            // delivered again; a live one is returned untouched.
            if matches!(existing.status, JobStatus::Completed | JobStatus::Failed) {
                existing.status = JobStatus::Waiting;
                existing.attempts = 0;
                existing.next_attempt_at = Utc::now();
                existing.finished_at = None;
            }
            return Ok(existing.job_id);
        }
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        state.jobs.insert(
            action_id,
            JobRow {
                action_id,
                job_id,
                tenant_id,
                status: JobStatus::Waiting,
                attempts: 0,
                max_attempts,
                next_attempt_at: now,
                enqueued_at: now,
                finished_at: None,
            },
        );
        Ok(job_id)
    }

    async fn claim_due_jobs(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<ClaimedJob>> {
        let mut state = self.lock();
        let mut due: Vec<Uuid> = state
            .jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && matches!(j.status, JobStatus::Waiting | JobStatus::Delayed)
                    && j.next_attempt_at <= now
            })
            .map(|j| j.action_id)
            .collect();
        due.sort_by_key(|id| state.jobs[id].enqueued_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for action_id in due {
            let job = state.jobs.get_mut(&action_id).expect("job exists");
            job.status = JobStatus::Active;
            claimed.push(ClaimedJob {
                action_id: job.action_id,
                job_id: job.job_id,
                tenant_id: job.tenant_id,
                attempts: job.attempts,
                max_attempts: job.max_attempts,
            });
        }
        Ok(claimed)
    }

    async fn complete_job(&self, action_id: Uuid) -> BackendResult<()> {
        if let Some(job) = self.lock().jobs.get_mut(&action_id) {
            job.status = JobStatus::Completed;
            job.finished_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        action_id: Uuid,
        backoff: BackoffConfig,
    ) -> BackendResult<JobStatus> {
        let mut state = self.lock();
        let job = state
            .jobs
            .get_mut(&action_id)
            .ok_or_else(|| super::base::BackendError::Message(format!("no job for {action_id}")))?;

        job.attempts += 1;
        if job.attempts >= job.max_attempts {
            job.status = JobStatus::Failed;
            job.finished_at = Some(Utc::now());
        } else {
            job.status = JobStatus::Delayed;
            let delay_ms = backoff.calculate_delay_ms(job.attempts);
            job.next_attempt_at = Utc::now() + chrono::Duration::milliseconds(delay_ms);
        }
        Ok(job.status)
    }

    async fn queue_counts(&self, tenant_id: Uuid) -> BackendResult<QueueCounts> {
        let state = self.lock();
        let mut counts = QueueCounts::default();
        for job in state.jobs.values().filter(|j| j.tenant_id == tenant_id) {
            match job.status {
                JobStatus::Waiting => counts.waiting += 1,
                JobStatus::Active => counts.active += 1,
                JobStatus::Completed => counts.completed += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Delayed => counts.delayed += 1,
            }
        }
        Ok(counts)
    }

    async fn trim_finished_jobs(&self, tenant_id: Uuid, keep: i64) -> BackendResult<u64> {
        let mut state = self.lock();
        let mut finished: Vec<(Uuid, DateTime<Utc>)> = state
            .jobs
            .values()
            .filter(|j| {
                j.tenant_id == tenant_id
                    && matches!(j.status, JobStatus::Completed | JobStatus::Failed)
            })
            .map(|j| (j.action_id, j.finished_at.unwrap_or(j.enqueued_at)))
            .collect();
        finished.sort_by(|a, b| b.1.cmp(&a.1));

        let mut trimmed = 0;
        for (action_id, _) in finished.into_iter().skip(keep.max(0) as usize) {
            state.jobs.remove(&action_id);
            trimmed += 1;
        }
        Ok(trimmed)
    }
}

#[async_trait]
impl ProcessorBackend for MemoryBackend {
    async fn load_dispatch_context(
        &self,
        action_id: Uuid,
    ) -> BackendResult<Option<DispatchContext>> {
        let state = self.lock();
        let Some(action) = state.actions.get(&action_id).cloned() else {
            return Ok(None);
        };
        let Some(conversation) = state.conversations.get(&action.conversation_id).cloned()
        else {
            return Ok(None);
        };
        let Some(step) = state.steps.get(&action.step_id).cloned() else {
            return Ok(None);
        };
        let sender = action
            .sender_identity_id
            .and_then(|id| state.senders.get(&id).cloned());
        Ok(Some(DispatchContext {
            action,
            conversation,
            step,
            sender,
        }))
    }

    async fn mark_action_sent(&self, action_id: Uuid) -> BackendResult<()> {
        if let Some(action) = self.lock().actions.get_mut(&action_id) {
            action.status = ActionStatus::Sent.as_str().to_string();
            action.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_action_failed(&self, action_id: Uuid) -> BackendResult<()> {
        if let Some(action) = self.lock().actions.get_mut(&action_id) {
            action.status = ActionStatus::Failed.as_str().to_string();
            action.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_message(&self, message: &NewMessage) -> BackendResult<Uuid> {
        let id = Uuid::new_v4();
        self.lock().messages.push(StoredMessage {
            id,
            message: message.clone(),
        });
        Ok(id)
    }

    async fn advance_conversation(
        &self,
        conversation_id: Uuid,
        step_id: Uuid,
    ) -> BackendResult<()> {
        if let Some(conversation) = self.lock().conversations.get_mut(&conversation_id) {
            conversation.last_step_sent = Some(step_id);
            conversation.current_step = Some(step_id);
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn find_next_step(
        &self,
        sequence_id: Uuid,
        after: &SequenceStep,
    ) -> BackendResult<Option<SequenceStep>> {
        let state = self.lock();
        let mut candidates: Vec<&SequenceStep> = state
            .steps
            .values()
            .filter(|s| {
                s.sequence_id == sequence_id && (s.day_offset, s.id) > (after.day_offset, after.id)
            })
            .collect();
        candidates.sort_by_key(|s| (s.day_offset, s.id));
        Ok(candidates.first().map(|s| (*s).clone()))
    }

    async fn resolve_sender(
        &self,
        tenant_id: Uuid,
        channel: &str,
    ) -> BackendResult<Option<SenderIdentity>> {
        let state = self.lock();
        let mut candidates: Vec<&SenderIdentity> = state
            .senders
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.channel == channel && s.enabled)
            .collect();
        candidates.sort_by_key(|s| (s.created_at, s.id));
        Ok(candidates.first().map(|s| (*s).clone()))
    }

    async fn schedule_followup(&self, action: &NewAction) -> BackendResult<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let mut state = self.lock();
        state.actions.insert(
            id,
            ScheduledAction {
                id,
                conversation_id: action.conversation_id,
                step_id: action.step_id,
                channel: action.channel.clone(),
                action_type: action.action_type.clone(),
                scheduled_at: action.scheduled_at,
                status: ActionStatus::Pending.as_str().to_string(),
                sender_identity_id: action.sender_identity_id,
                dispatch_job_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        if let Some(conversation) = state.conversations.get_mut(&action.conversation_id) {
            conversation.next_action_at = Some(action.scheduled_at);
            conversation.updated_at = now;
        }
        Ok(id)
    }

    async fn complete_conversation(&self, conversation_id: Uuid) -> BackendResult<()> {
        if let Some(conversation) = self.lock().conversations.get_mut(&conversation_id) {
            conversation.automation_status = AutomationStatus::Completed.as_str().to_string();
            conversation.next_action_at = None;
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn flag_needs_review(&self, conversation_id: Uuid) -> BackendResult<()> {
        if let Some(conversation) = self.lock().conversations.get_mut(&conversation_id) {
            conversation.automation_status = AutomationStatus::NeedsReview.as_str().to_string();
            conversation.updated_at = Utc::now();
        }
        Ok(())
    }
}

#[async_trait]
impl ReclaimerBackend for MemoryBackend {
    async fn reclaim_stale_actions(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<u64> {
        let mut state = self.lock();
        let mut stale: Vec<(Uuid, DateTime<Utc>)> = state
            .actions
            .values()
            .filter(|a| a.status == ActionStatus::Processing.as_str() && a.updated_at < older_than)
            .map(|a| (a.id, a.updated_at))
            .collect();
        stale.sort_by_key(|(_, updated_at)| *updated_at);
        stale.truncate(limit.max(0) as usize);

        let mut reclaimed = 0;
        for (id, _) in stale {
            state.jobs.remove(&id);
            let action = state.actions.get_mut(&id).expect("action exists");
            action.status = ActionStatus::Pending.as_str().to_string();
            action.dispatch_job_id = None;
            action.updated_at = Utc::now();
            reclaimed += 1;
        }
        Ok(reclaimed)
    }
}
