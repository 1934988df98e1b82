//! External collaborators: the chat feed we read from and the mail transport we send through.
//!
//! Both are traits so passes can run against stubs in tests.

pub mod email;
pub mod telegram;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SourceConfig;
use crate::error::ChannelError;

pub use email::{SmtpConfig, SmtpMailer};
pub use telegram::{TelegramConfig, TelegramSource};

// ── Chat source ─────────────────────────────────────────────────────

/// A resolved chat the source can be read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityHandle {
    pub chat_id: i64,
    /// Public username, used to build permalinks.
    pub handle: Option<String>,
}

impl EntityHandle {
    /// Link to a message in this chat, if one can be built.
    pub fn permalink(&self, message_id: i64) -> Option<String> {
        if let Some(handle) = &self.handle {
            return Some(format!("https://t.me/{handle}/{message_id}"));
        }
        // Private supergroups and channels use the -100 prefix.
        let id = self.chat_id.to_string();
        id.strip_prefix("-100")
            .map(|internal| format!("https://t.me/c/{internal}/{message_id}"))
    }
}

/// A message as delivered by the chat source, before sanitization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawMessage {
    pub message_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender_id: Option<i64>,
    pub text: Option<String>,
    pub raw: serde_json::Value,
}

/// Read side of a chat network.
#[async_trait]
pub trait ChatSource: Send + Sync {
    /// Source name (e.g. "telegram").
    fn name(&self) -> &str;

    /// Turn a configured source into a readable chat.
    async fn resolve_entity(&self, source: &SourceConfig) -> Result<EntityHandle, ChannelError>;

    /// Messages with id strictly greater than `watermark`, oldest first, at most `limit`.
    async fn fetch_messages_since(
        &self,
        entity: &EntityHandle,
        watermark: i64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, ChannelError>;

    /// Confirm consumed updates. Called only after a pass read every enabled
    /// source to the end and stored everything it fetched.
    async fn acknowledge(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

// ── Mail transport ──────────────────────────────────────────────────

/// One outbound application email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailEnvelope {
    pub to: String,
    pub subject: String,
    pub body: String,
    /// File name shown for the attached document.
    pub attachment_name: String,
}

/// Outcome reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportReceipt {
    pub accepted: bool,
    /// Opaque server response, stored for audit.
    pub diagnostic: String,
}

/// Write side: the only way mail leaves the process.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send_mail(
        &self,
        envelope: &MailEnvelope,
        attachment: &[u8],
    ) -> Result<TransportReceipt, ChannelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permalink_prefers_public_handle() {
        let entity = EntityHandle {
            chat_id: -1001234,
            handle: Some("remotejobs".into()),
        };
        assert_eq!(
            entity.permalink(7).as_deref(),
            Some("https://t.me/remotejobs/7")
        );
    }

    #[test]
    fn permalink_for_private_supergroup() {
        let entity = EntityHandle {
            chat_id: -1001234,
            handle: None,
        };
        assert_eq!(entity.permalink(7).as_deref(), Some("https://t.me/c/1234/7"));
    }

    #[test]
    fn no_permalink_for_basic_group() {
        let entity = EntityHandle {
            chat_id: -4567,
            handle: None,
        };
        assert_eq!(entity.permalink(7), None);
    }
}
