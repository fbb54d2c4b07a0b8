//! Postgres implementations of the backend capability traits.
//!
//! All operations run against the [`Database`] pool. The claim paths use
//! `FOR UPDATE SKIP LOCKED` so concurrent pollers or workers never block
//! each other on the same rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::base::{
    BackendResult, ClaimedJob, DispatchContext, DueAction, NewAction, NewMessage,
    ProcessorBackend, QueueBackend, QueueCounts, ReclaimerBackend, SchedulerBackend,
};
use crate::db::{
    Conversation, Database, JobStatus, ScheduledAction, SenderIdentity, SequenceStep,
};
use crate::retry::BackoffConfig;

#[async_trait]
impl SchedulerBackend for Database {
    async fn find_due_actions(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<DueAction>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.conversation_id, c.tenant_id, a.scheduled_at
            FROM scheduled_actions a
            LEFT JOIN conversations c ON c.id = a.conversation_id
            WHERE a.status = 'pending' AND a.scheduled_at <= $1
            ORDER BY a.scheduled_at
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| DueAction {
                id: row.get("id"),
                conversation_id: row.get("conversation_id"),
                tenant_id: row.get("tenant_id"),
                scheduled_at: row.get("scheduled_at"),
            })
            .collect())
    }

    async fn claim_actions(&self, action_ids: &[Uuid]) -> BackendResult<Vec<Uuid>> {
        if action_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'processing', updated_at = NOW()
            WHERE id = ANY($1) AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(action_ids)
        .fetch_all(self.pool())
        .await?;

        Ok(rows.into_iter().map(|row| row.get("id")).collect())
    }

    async fn record_dispatch(&self, action_id: Uuid, job_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET dispatch_job_id = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action_id)
        .bind(job_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn revert_actions(&self, action_ids: &[Uuid]) -> BackendResult<u64> {
        if action_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'pending', dispatch_job_id = NULL, updated_at = NOW()
            WHERE id = ANY($1) AND status = 'processing'
            "#,
        )
        .bind(action_ids)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QueueBackend for Database {
    async fn enqueue_job(
        &self,
        tenant_id: Uuid,
        action_id: Uuid,
        max_attempts: i32,
    ) -> BackendResult<Uuid> {
        // On conflict a live job is returned untouched, while a finished
        // one is re-armed to waiting with fresh attempts: a re-claimed
        // action must get a deliverable job, not a completed husk.
        let row = sqlx::query(
            r#"
            INSERT INTO outreach_jobs (action_id, job_id, tenant_id, max_attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (action_id) DO UPDATE SET
                status = CASE WHEN outreach_jobs.status IN ('completed', 'failed')
                              THEN 'waiting' ELSE outreach_jobs.status END,
                attempts = CASE WHEN outreach_jobs.status IN ('completed', 'failed')
                                THEN 0 ELSE outreach_jobs.attempts END,
                next_attempt_at = CASE WHEN outreach_jobs.status IN ('completed', 'failed')
                                       THEN NOW() ELSE outreach_jobs.next_attempt_at END,
                finished_at = CASE WHEN outreach_jobs.status IN ('completed', 'failed')
                                   THEN NULL ELSE outreach_jobs.finished_at END
            RETURNING job_id
            "#,
        )
        .bind(action_id)
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(max_attempts)
        .fetch_one(self.pool())
        .await?;

        Ok(row.get("job_id"))
    }

    async fn claim_due_jobs(
        &self,
        tenant_id: Uuid,
        now: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<Vec<ClaimedJob>> {
        let rows = sqlx::query(
            r#"
            UPDATE outreach_jobs
            SET status = 'active'
            WHERE action_id IN (
                SELECT action_id
                FROM outreach_jobs
                WHERE tenant_id = $1
                  AND status IN ('waiting', 'delayed')
                  AND next_attempt_at <= $2
                ORDER BY enqueued_at
                LIMIT $3
                FOR UPDATE SKIP LOCKED
            )
            RETURNING action_id, job_id, tenant_id, attempts, max_attempts
            "#,
        )
        .bind(tenant_id)
        .bind(now)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| ClaimedJob {
                action_id: row.get("action_id"),
                job_id: row.get("job_id"),
                tenant_id: row.get("tenant_id"),
                attempts: row.get("attempts"),
                max_attempts: row.get("max_attempts"),
            })
            .collect())
    }

    async fn complete_job(&self, action_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE outreach_jobs
            SET status = 'completed', finished_at = NOW()
            WHERE action_id = $1
            "#,
        )
        .bind(action_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn fail_job(
        &self,
        action_id: Uuid,
        backoff: BackoffConfig,
    ) -> BackendResult<JobStatus> {
        let row = sqlx::query(
            r#"
            SELECT attempts, max_attempts FROM outreach_jobs WHERE action_id = $1
            "#,
        )
        .bind(action_id)
        .fetch_one(self.pool())
        .await?;

        let attempts: i32 = row.get("attempts");
        let max_attempts: i32 = row.get("max_attempts");
        let next_attempt = attempts + 1;

        if next_attempt >= max_attempts {
            sqlx::query(
                r#"
                UPDATE outreach_jobs
                SET attempts = $2, status = 'failed', finished_at = NOW()
                WHERE action_id = $1
                "#,
            )
            .bind(action_id)
            .bind(next_attempt)
            .execute(self.pool())
            .await?;
            return Ok(JobStatus::Failed);
        }

        let delay_ms = backoff.calculate_delay_ms(next_attempt);
        sqlx::query(
            r#"
            UPDATE outreach_jobs
            SET attempts = $2,
                status = 'delayed',
                next_attempt_at = NOW() + ($3::bigint * interval '1 millisecond')
            WHERE action_id = $1
            "#,
        )
        .bind(action_id)
        .bind(next_attempt)
        .bind(delay_ms)
        .execute(self.pool())
        .await?;

        Ok(JobStatus::Delayed)
    }

    async fn queue_counts(&self, tenant_id: Uuid) -> BackendResult<QueueCounts> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS count
            FROM outreach_jobs
            WHERE tenant_id = $1
            GROUP BY status
            "#,
        )
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await?;

        let mut counts = QueueCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match status.as_str() {
                "waiting" => counts.waiting = count,
                "active" => counts.active = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                "delayed" => counts.delayed = count,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn trim_finished_jobs(&self, tenant_id: Uuid, keep: i64) -> BackendResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outreach_jobs
            WHERE action_id IN (
                SELECT action_id
                FROM outreach_jobs
                WHERE tenant_id = $1 AND status IN ('completed', 'failed')
                ORDER BY finished_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(tenant_id)
        .bind(keep)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ProcessorBackend for Database {
    async fn load_dispatch_context(
        &self,
        action_id: Uuid,
    ) -> BackendResult<Option<DispatchContext>> {
        let action = sqlx::query_as::<_, ScheduledAction>(
            r#"
            SELECT id, conversation_id, step_id, channel, action_type, scheduled_at,
                   status, sender_identity_id, dispatch_job_id, created_at, updated_at
            FROM scheduled_actions
            WHERE id = $1
            "#,
        )
        .bind(action_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(action) = action else {
            return Ok(None);
        };

        let conversation = sqlx::query_as::<_, Conversation>(
            r#"
            SELECT id, tenant_id, sequence_id, person_email, person_name,
                   automation_status, current_step, last_step_sent, next_action_at,
                   created_at, updated_at
            FROM conversations
            WHERE id = $1
            "#,
        )
        .bind(action.conversation_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(conversation) = conversation else {
            return Ok(None);
        };

        let step = sqlx::query_as::<_, SequenceStep>(
            r#"
            SELECT id, sequence_id, channel, day_offset, subject_template,
                   body_template, created_at
            FROM sequence_steps
            WHERE id = $1
            "#,
        )
        .bind(action.step_id)
        .fetch_optional(self.pool())
        .await?;

        let Some(step) = step else {
            return Ok(None);
        };

        let sender = match action.sender_identity_id {
            Some(sender_id) => {
                sqlx::query_as::<_, SenderIdentity>(
                    r#"
                    SELECT id, tenant_id, channel, address, display_name, enabled, created_at
                    FROM sender_identities
                    WHERE id = $1
                    "#,
                )
                .bind(sender_id)
                .fetch_optional(self.pool())
                .await?
            }
            None => None,
        };

        Ok(Some(DispatchContext {
            action,
            conversation,
            step,
            sender,
        }))
    }

    async fn mark_action_sent(&self, action_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'sent', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn mark_action_failed(&self, action_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE scheduled_actions
            SET status = 'failed', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn record_message(&self, message: &NewMessage) -> BackendResult<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO messages (conversation_id, action_id, channel, subject, body, sender)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(message.conversation_id)
        .bind(message.action_id)
        .bind(&message.channel)
        .bind(&message.subject)
        .bind(&message.body)
        .bind(&message.sender)
        .fetch_one(self.pool())
        .await?;

        Ok(row.get("id"))
    }

    async fn advance_conversation(
        &self,
        conversation_id: Uuid,
        step_id: Uuid,
    ) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_step_sent = $2, current_step = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .bind(step_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn find_next_step(
        &self,
        sequence_id: Uuid,
        after: &SequenceStep,
    ) -> BackendResult<Option<SequenceStep>> {
        // Row comparison keeps the choice deterministic when several steps
        // share a day offset.
        let step = sqlx::query_as::<_, SequenceStep>(
            r#"
            SELECT id, sequence_id, channel, day_offset, subject_template,
                   body_template, created_at
            FROM sequence_steps
            WHERE sequence_id = $1 AND (day_offset, id) > ($2, $3)
            ORDER BY day_offset, id
            LIMIT 1
            "#,
        )
        .bind(sequence_id)
        .bind(after.day_offset)
        .bind(after.id)
        .fetch_optional(self.pool())
        .await?;

        Ok(step)
    }

    async fn resolve_sender(
        &self,
        tenant_id: Uuid,
        channel: &str,
    ) -> BackendResult<Option<SenderIdentity>> {
        let sender = sqlx::query_as::<_, SenderIdentity>(
            r#"
            SELECT id, tenant_id, channel, address, display_name, enabled, created_at
            FROM sender_identities
            WHERE tenant_id = $1 AND channel = $2 AND enabled
            ORDER BY created_at, id
            LIMIT 1
            "#,
        )
        .bind(tenant_id)
        .bind(channel)
        .fetch_optional(self.pool())
        .await?;

        Ok(sender)
    }

    async fn schedule_followup(&self, action: &NewAction) -> BackendResult<Uuid> {
        let mut tx = self.pool().begin().await?;

        let row = sqlx::query(
            r#"
            INSERT INTO scheduled_actions
                (conversation_id, step_id, channel, action_type, scheduled_at,
                 status, sender_identity_id)
            VALUES ($1, $2, $3, $4, $5, 'pending', $6)
            RETURNING id
            "#,
        )
        .bind(action.conversation_id)
        .bind(action.step_id)
        .bind(&action.channel)
        .bind(&action.action_type)
        .bind(action.scheduled_at)
        .bind(action.sender_identity_id)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE conversations
            SET next_action_at = $2, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(action.conversation_id)
        .bind(action.scheduled_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(row.get("id"))
    }

    async fn complete_conversation(&self, conversation_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET automation_status = 'completed', next_action_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    async fn flag_needs_review(&self, conversation_id: Uuid) -> BackendResult<()> {
        sqlx::query(
            r#"
            UPDATE conversations
            SET automation_status = 'needs_review', updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(conversation_id)
        .execute(self.pool())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ReclaimerBackend for Database {
    async fn reclaim_stale_actions(
        &self,
        older_than: DateTime<Utc>,
        limit: i64,
    ) -> BackendResult<u64> {
        // Dropping the stuck job row lets the next poll re-enqueue under a
        // fresh job id.
        let result = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM scheduled_actions
                WHERE status = 'processing' AND updated_at < $1
                ORDER BY updated_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            ),
            dropped AS (
                DELETE FROM outreach_jobs
                WHERE action_id IN (SELECT id FROM stale)
            )
            UPDATE scheduled_actions
            SET status = 'pending', dispatch_job_id = NULL, updated_at = NOW()
            WHERE id IN (SELECT id FROM stale)
            "#,
        )
        .bind(older_than)
        .bind(limit)
        .execute(self.pool())
        .await?;

        Ok(result.rows_affected())
    }
}
