//! The action processor: executes one claimed scheduled action.
//!
//! Called by tenant workers with an action id pulled off the queue. The
//! processor re-reads the action and its conversation immediately before
//! any side effect, so rows cancelled or paused after claiming are skipped
//! rather than sent. On success it records the audit message, advances the
//! conversation cursor, and schedules the next step in the sequence (or
//! completes the conversation when the sequence is exhausted).

use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backends::{BackendError, DispatchContext, NewAction, NewMessage, ProcessorBackend};
use crate::db::{ActionStatus, ActionType, AutomationStatus, Channel, SenderIdentity};
use crate::outbound::{ContentRenderer, Delivery, DeliveryError};

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),
}

/// What the processor did with one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Delivered and recorded.
    Sent,
    /// Guard declined: action gone, no longer processing, or the
    /// conversation is not active. Nothing was sent.
    Skipped,
    /// Terminal failure that retrying cannot fix.
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessOutcome {
    pub action_id: Uuid,
    pub status: ProcessStatus,
}

impl ProcessOutcome {
    fn new(action_id: Uuid, status: ProcessStatus) -> Self {
        Self { action_id, status }
    }
}

pub struct ActionProcessor<B> {
    backend: Arc<B>,
    delivery: Arc<dyn Delivery>,
}

impl<B: ProcessorBackend> ActionProcessor<B> {
    pub fn new(backend: Arc<B>, delivery: Arc<dyn Delivery>) -> Self {
        Self { backend, delivery }
    }

    /// Process one claimed action end to end.
    ///
    /// Errors propagate to the caller so queue backoff governs redelivery;
    /// the action is marked failed first, which makes any redelivered
    /// attempt a guarded no-op.
    pub async fn process(&self, action_id: Uuid) -> Result<ProcessOutcome, ProcessError> {
        let Some(ctx) = self.backend.load_dispatch_context(action_id).await? else {
            info!(action_id = %action_id, "action no longer exists, skipping");
            return Ok(ProcessOutcome::new(action_id, ProcessStatus::Skipped));
        };

        // Guard re-check: the claim happened up to a queue-delay ago, and
        // the row may have been cancelled or reclaimed since.
        if ActionStatus::parse(&ctx.action.status) != Some(ActionStatus::Processing) {
            info!(
                action_id = %action_id,
                status = %ctx.action.status,
                "action not in processing state, skipping"
            );
            return Ok(ProcessOutcome::new(action_id, ProcessStatus::Skipped));
        }
        if AutomationStatus::parse(&ctx.conversation.automation_status)
            != Some(AutomationStatus::Active)
        {
            info!(
                action_id = %action_id,
                conversation_id = %ctx.conversation.id,
                automation_status = %ctx.conversation.automation_status,
                "conversation automation not active, skipping"
            );
            return Ok(ProcessOutcome::new(action_id, ProcessStatus::Skipped));
        }

        match Channel::parse(&ctx.action.channel) {
            Some(Channel::Email) => self.process_email(&ctx).await,
            Some(Channel::Social) | None => {
                error!(
                    action_id = %action_id,
                    channel = %ctx.action.channel,
                    "no dispatcher implemented for channel"
                );
                self.backend.mark_action_failed(action_id).await?;
                Ok(ProcessOutcome::new(action_id, ProcessStatus::Failed))
            }
        }
    }

    async fn process_email(
        &self,
        ctx: &DispatchContext,
    ) -> Result<ProcessOutcome, ProcessError> {
        let action_id = ctx.action.id;

        let Some(sender) = self.sender_for(ctx, &ctx.action.channel).await? else {
            warn!(
                action_id = %action_id,
                tenant_id = %ctx.conversation.tenant_id,
                "no enabled sender identity, flagging conversation for review"
            );
            self.backend.flag_needs_review(ctx.conversation.id).await?;
            self.backend.mark_action_failed(action_id).await?;
            return Ok(ProcessOutcome::new(action_id, ProcessStatus::Failed));
        };

        if let Err(err) = self.deliver_and_record(ctx, &sender).await {
            // Best effort: a failed mark leaves the row for the reclaimer.
            if let Err(mark_err) = self.backend.mark_action_failed(action_id).await {
                error!(action_id = %action_id, err = ?mark_err, "failed to mark action failed");
            }
            return Err(err);
        }

        self.schedule_next(ctx).await?;

        metrics::counter!("cadence_messages_sent_total").increment(1);
        info!(
            action_id = %action_id,
            conversation_id = %ctx.conversation.id,
            step_id = %ctx.step.id,
            "action processed and sent"
        );
        Ok(ProcessOutcome::new(action_id, ProcessStatus::Sent))
    }

    /// The send itself: render, deliver, append the audit message, then
    /// flip the action to sent and advance the conversation cursor.
    async fn deliver_and_record(
        &self,
        ctx: &DispatchContext,
        sender: &SenderIdentity,
    ) -> Result<(), ProcessError> {
        let email = ContentRenderer::render_email(&ctx.step, &ctx.conversation, sender);
        self.delivery.deliver_email(&email).await?;

        self.backend
            .record_message(&NewMessage {
                conversation_id: ctx.conversation.id,
                action_id: ctx.action.id,
                channel: ctx.action.channel.clone(),
                subject: Some(email.subject.clone()),
                body: email.body.clone(),
                sender: email.from_address.clone(),
            })
            .await?;
        self.backend.mark_action_sent(ctx.action.id).await?;
        self.backend
            .advance_conversation(ctx.conversation.id, ctx.step.id)
            .await?;
        Ok(())
    }

    /// Schedule the sequence's next step, or complete the conversation.
    async fn schedule_next(&self, ctx: &DispatchContext) -> Result<(), ProcessError> {
        let next = self
            .backend
            .find_next_step(ctx.conversation.sequence_id, &ctx.step)
            .await?;

        let Some(next) = next else {
            info!(
                conversation_id = %ctx.conversation.id,
                "sequence exhausted, completing conversation"
            );
            self.backend.complete_conversation(ctx.conversation.id).await?;
            return Ok(());
        };

        let Some(next_sender) = self.sender_for(ctx, &next.channel).await? else {
            warn!(
                conversation_id = %ctx.conversation.id,
                channel = %next.channel,
                "no sender identity for next step, flagging conversation for review"
            );
            self.backend.flag_needs_review(ctx.conversation.id).await?;
            return Ok(());
        };

        // A next step with a smaller day offset than the current one would
        // schedule into the past; clamp the delta to zero instead.
        let delta_days = (next.day_offset - ctx.step.day_offset).max(0);
        let scheduled_at = Utc::now() + Duration::days(delta_days as i64);

        let followup_id = self
            .backend
            .schedule_followup(&NewAction {
                conversation_id: ctx.conversation.id,
                step_id: next.id,
                channel: next.channel.clone(),
                action_type: ActionType::SendMessage.as_str().to_string(),
                scheduled_at,
                sender_identity_id: Some(next_sender.id),
            })
            .await?;

        info!(
            conversation_id = %ctx.conversation.id,
            followup_action_id = %followup_id,
            step_id = %next.id,
            delta_days,
            "scheduled follow-up action"
        );
        Ok(())
    }

    /// The action's pinned sender when present, otherwise the tenant's
    /// first enabled identity for the channel.
    async fn sender_for(
        &self,
        ctx: &DispatchContext,
        channel: &str,
    ) -> Result<Option<SenderIdentity>, ProcessError> {
        if let Some(sender) = &ctx.sender {
            if sender.enabled && sender.channel == channel {
                return Ok(Some(sender.clone()));
            }
        }
        Ok(self
            .backend
            .resolve_sender(ctx.conversation.tenant_id, channel)
            .await?)
    }
}
