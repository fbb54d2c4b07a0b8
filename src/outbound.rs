//! Outbound content rendering and delivery.
//!
//! The processor renders a step template against the conversation, then
//! hands the rendered content to a [`Delivery`] implementation. Production
//! runs use [`SmtpDelivery`] over an SMTP relay; tests and local runs
//! without an SMTP host use [`LogDelivery`], which records instead of
//! sending.

use async_trait::async_trait;
use lettre::{
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use thiserror::Error;
use tracing::info;

use crate::config::SmtpConfig;
use crate::db::{Conversation, SenderIdentity, SequenceStep};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("invalid address: {0}")]
    Address(#[from] lettre::address::AddressError),

    #[error("failed to build message: {0}")]
    Build(#[from] lettre::error::Error),

    #[error("smtp transport error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),
}

/// A rendered outbound email, ready for delivery.
#[derive(Clone, Debug)]
pub struct RenderedEmail {
    pub from_address: String,
    pub from_name: Option<String>,
    pub to_address: String,
    pub subject: String,
    pub body: String,
}

/// Renders step templates against a conversation.
///
/// Templates use `{{first_name}}` and `{{email}}` placeholders. Unknown
/// placeholders are left verbatim so a typo shows up in the audit trail
/// instead of silently vanishing.
pub struct ContentRenderer;

impl ContentRenderer {
    pub fn render_email(
        step: &SequenceStep,
        conversation: &Conversation,
        sender: &SenderIdentity,
    ) -> RenderedEmail {
        let subject = step
            .subject_template
            .as_deref()
            .map(|t| Self::substitute(t, conversation))
            .unwrap_or_default();
        let body = Self::substitute(&step.body_template, conversation);

        RenderedEmail {
            from_address: sender.address.clone(),
            from_name: sender.display_name.clone(),
            to_address: conversation.person_email.clone(),
            subject,
            body,
        }
    }

    fn substitute(template: &str, conversation: &Conversation) -> String {
        let first_name = conversation
            .person_name
            .as_deref()
            .and_then(|n| n.split_whitespace().next())
            .unwrap_or("there");

        template
            .replace("{{first_name}}", first_name)
            .replace("{{email}}", &conversation.person_email)
    }
}

/// Transport seam for outbound sends.
#[async_trait]
pub trait Delivery: Send + Sync {
    async fn deliver_email(&self, email: &RenderedEmail) -> Result<(), DeliveryError>;
}

/// Delivery over an SMTP relay with STARTTLS.
pub struct SmtpDelivery {
    transport: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpDelivery {
    pub fn from_config(config: &SmtpConfig) -> Result<Option<Self>, DeliveryError> {
        let Some(host) = config.host.as_deref() else {
            return Ok(None);
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)?;
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        Ok(Some(Self {
            transport: builder.build(),
        }))
    }
}

#[async_trait]
impl Delivery for SmtpDelivery {
    async fn deliver_email(&self, email: &RenderedEmail) -> Result<(), DeliveryError> {
        let from = match &email.from_name {
            Some(name) => format!("{name} <{}>", email.from_address).parse()?,
            None => email.from_address.parse()?,
        };

        let message = Message::builder()
            .from(from)
            .to(email.to_address.parse()?)
            .subject(&email.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(email.body.clone())?;

        self.transport.send(message).await?;
        Ok(())
    }
}

/// Log-only delivery for local runs without an SMTP relay.
pub struct LogDelivery;

#[async_trait]
impl Delivery for LogDelivery {
    async fn deliver_email(&self, email: &RenderedEmail) -> Result<(), DeliveryError> {
        info!(
            to = %email.to_address,
            from = %email.from_address,
            subject = %email.subject,
            "delivery disabled, logging outbound email"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn conversation(name: Option<&str>) -> Conversation {
        let now = Utc::now();
        Conversation {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            person_email: "ada@example.com".to_string(),
            person_name: name.map(String::from),
            automation_status: "active".to_string(),
            current_step: None,
            last_step_sent: None,
            next_action_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn step(subject: Option<&str>, body: &str) -> SequenceStep {
        SequenceStep {
            id: Uuid::new_v4(),
            sequence_id: Uuid::new_v4(),
            channel: "email".to_string(),
            day_offset: 0,
            subject_template: subject.map(String::from),
            body_template: body.to_string(),
            created_at: Utc::now(),
        }
    }

    fn sender() -> SenderIdentity {
        SenderIdentity {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            channel: "email".to_string(),
            address: "sales@corp.example.com".to_string(),
            display_name: Some("Corp Sales".to_string()),
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn render_substitutes_first_name_and_email() {
        let email = ContentRenderer::render_email(
            &step(Some("Hi {{first_name}}"), "Reaching {{email}}"),
            &conversation(Some("Ada Lovelace")),
            &sender(),
        );
        assert_eq!(email.subject, "Hi Ada");
        assert_eq!(email.body, "Reaching ada@example.com");
        assert_eq!(email.from_address, "sales@corp.example.com");
    }

    #[test]
    fn render_falls_back_when_name_missing() {
        let email = ContentRenderer::render_email(
            &step(None, "Hello {{first_name}}"),
            &conversation(None),
            &sender(),
        );
        assert_eq!(email.subject, "");
        assert_eq!(email.body, "Hello there");
    }

    #[test]
    fn render_leaves_unknown_placeholders() {
        let email = ContentRenderer::render_email(
            &step(None, "{{company}} news"),
            &conversation(Some("Ada")),
            &sender(),
        );
        assert_eq!(email.body, "{{company}} news");
    }

    #[test]
    fn smtp_delivery_is_none_without_host() {
        let delivery = SmtpDelivery::from_config(&SmtpConfig::default()).unwrap();
        assert!(delivery.is_none());
    }
}
