//! SMTP mail transport via lettre.

use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::{Attachment, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{MailEnvelope, MailTransport, TransportReceipt};
use crate::error::{ChannelError, ConfigError};

const CHANNEL_NAME: &str = "email";

// ── Configuration ───────────────────────────────────────────────────

/// SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
}

impl SmtpConfig {
    /// Fails with `MissingEnvVar` when `SMTP_HOST` is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("SMTP_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("SMTP_HOST".into()))?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        let username = std::env::var("SMTP_USER").unwrap_or_default();
        let password = std::env::var("SMTP_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone());

        if from_address.is_empty() {
            return Err(ConfigError::MissingRequired {
                key: "SMTP_FROM".into(),
                hint: "set SMTP_FROM or SMTP_USER".into(),
            });
        }

        Ok(Self {
            host,
            port,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

// ── Transport ───────────────────────────────────────────────────────

/// Sends application emails with the document attached.
pub struct SmtpMailer {
    config: SmtpConfig,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl MailTransport for SmtpMailer {
    async fn send_mail(
        &self,
        envelope: &MailEnvelope,
        attachment: &[u8],
    ) -> Result<TransportReceipt, ChannelError> {
        let message = build_message(&self.config.from_address, envelope, attachment.to_vec())?;
        let config = self.config.clone();
        let to = envelope.to.clone();

        let response = tokio::task::spawn_blocking(move || {
            let creds = Credentials::new(
                config.username.clone(),
                config.password.expose_secret().to_string(),
            );
            let transport = SmtpTransport::relay(&config.host)
                .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
                .port(config.port)
                .credentials(creds)
                .build();
            transport
                .send(&message)
                .map_err(|e| send_failed(format!("SMTP send failed: {e}")))
        })
        .await
        .map_err(|e| send_failed(format!("SMTP task failed: {e}")))??;

        let diagnostic = format!(
            "{} {}",
            response.code(),
            response
                .message()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        );
        tracing::info!("Email sent to {to}");
        Ok(TransportReceipt {
            accepted: response.is_positive(),
            diagnostic,
        })
    }
}

fn send_failed(reason: String) -> ChannelError {
    ChannelError::SendFailed {
        name: CHANNEL_NAME.into(),
        reason,
    }
}

/// Build a plain-text message with the PDF attached.
fn build_message(
    from: &str,
    envelope: &MailEnvelope,
    attachment: Vec<u8>,
) -> Result<Message, ChannelError> {
    let pdf = ContentType::parse("application/pdf")
        .map_err(|e| send_failed(format!("Invalid content type: {e}")))?;

    Message::builder()
        .from(
            from.parse()
                .map_err(|e| send_failed(format!("Invalid from address: {e}")))?,
        )
        .to(envelope
            .to
            .parse()
            .map_err(|e| send_failed(format!("Invalid to address: {e}")))?)
        .subject(envelope.subject.clone())
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(envelope.body.clone()))
                .singlepart(Attachment::new(envelope.attachment_name.clone()).body(attachment, pdf)),
        )
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}
