//! Telegram chat source over the Bot API.
//!
//! The bot must be a member of every source chat. Updates are pulled once per
//! pass with `getUpdates`, filtered per chat by the ingestion watermark, and
//! only confirmed (by advancing the update offset) after the pass has stored
//! everything it fetched.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;

use crate::channels::{ChatSource, EntityHandle, RawMessage};
use crate::config::SourceConfig;
use crate::error::{ChannelError, ConfigError};

const CHANNEL_NAME: &str = "telegram";

/// Fallback wait when a 429 carries no `retry_after`.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Bot API configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub bot_token: SecretString,
    pub api_base: String,
}

impl TelegramConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))?;
        let api_base = std::env::var("TELEGRAM_API_BASE")
            .unwrap_or_else(|_| "https://api.telegram.org".to_string());
        Ok(Self {
            bot_token: SecretString::from(bot_token),
            api_base,
        })
    }
}

/// Telegram source backed by the Bot API.
pub struct TelegramSource {
    config: TelegramConfig,
    client: reqwest::Client,
    /// Updates pulled for the current pass, fetched lazily on first use.
    updates: Mutex<Option<Vec<serde_json::Value>>>,
}

impl TelegramSource {
    pub fn new(config: TelegramConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            updates: Mutex::new(None),
        }
    }

    fn api_url(&self, method: &str) -> String {
        format!(
            "{}/bot{}/{method}",
            self.config.api_base.trim_end_matches('/'),
            self.config.bot_token.expose_secret()
        )
    }

    async fn call(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Http(format!("{method}: {e}")))?;

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ChannelError::InvalidMessage(format!("{method}: {e}")))?;

        interpret_response(method, data)
    }

    /// Pull pending updates once per pass.
    async fn pending_updates(&self) -> Result<Vec<serde_json::Value>, ChannelError> {
        let mut cache = self.updates.lock().await;
        if let Some(updates) = cache.as_ref() {
            return Ok(updates.clone());
        }

        let result = self
            .call(
                "getUpdates",
                serde_json::json!({
                    "timeout": 0,
                    "limit": 100,
                    "allowed_updates": ["message", "channel_post"],
                }),
            )
            .await?;

        let updates = result.as_array().cloned().unwrap_or_default();
        tracing::debug!(count = updates.len(), "Telegram updates pulled");
        *cache = Some(updates.clone());
        Ok(updates)
    }
}

#[async_trait]
impl ChatSource for TelegramSource {
    fn name(&self) -> &str {
        CHANNEL_NAME
    }

    async fn resolve_entity(&self, source: &SourceConfig) -> Result<EntityHandle, ChannelError> {
        let handle = source.handle().map(str::to_string);

        if let Some(chat_id) = source.resolved_entity_id {
            return Ok(EntityHandle { chat_id, handle });
        }

        let Some(public) = handle else {
            return Err(ChannelError::EntityResolution {
                source_id: source.source_id.clone(),
                reason: "no public handle or resolved_entity_id; run validate-sources first"
                    .into(),
            });
        };

        let chat = self
            .call("getChat", serde_json::json!({ "chat_id": format!("@{public}") }))
            .await
            .map_err(|e| match e {
                ChannelError::RateLimited { .. } => e,
                other => ChannelError::EntityResolution {
                    source_id: source.source_id.clone(),
                    reason: other.to_string(),
                },
            })?;

        let chat_id = chat.get("id").and_then(serde_json::Value::as_i64).ok_or_else(|| {
            ChannelError::EntityResolution {
                source_id: source.source_id.clone(),
                reason: "getChat response has no id".into(),
            }
        })?;

        Ok(EntityHandle {
            chat_id,
            handle: Some(public),
        })
    }

    async fn fetch_messages_since(
        &self,
        entity: &EntityHandle,
        watermark: i64,
        limit: usize,
    ) -> Result<Vec<RawMessage>, ChannelError> {
        let updates = self.pending_updates().await?;
        Ok(select_messages(&updates, entity.chat_id, watermark, limit))
    }

    async fn acknowledge(&self) -> Result<(), ChannelError> {
        let mut cache = self.updates.lock().await;
        let Some(highest) = cache.as_ref().and_then(|u| highest_update_id(u)) else {
            return Ok(());
        };

        self.call(
            "getUpdates",
            serde_json::json!({ "offset": highest + 1, "limit": 1, "timeout": 0 }),
        )
        .await?;

        tracing::info!(offset = highest + 1, "Telegram updates confirmed");
        *cache = None;
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Unwrap a Bot API envelope, mapping failures to typed errors.
fn interpret_response(
    method: &str,
    data: serde_json::Value,
) -> Result<serde_json::Value, ChannelError> {
    if data.get("ok").and_then(serde_json::Value::as_bool) == Some(true) {
        return Ok(data.get("result").cloned().unwrap_or(serde_json::Value::Null));
    }

    let code = data.get("error_code").and_then(serde_json::Value::as_i64);
    let description = data
        .get("description")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("unknown error")
        .to_string();

    match code {
        Some(429) => {
            let retry_after = data
                .get("parameters")
                .and_then(|p| p.get("retry_after"))
                .and_then(serde_json::Value::as_u64)
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            Err(ChannelError::RateLimited {
                name: CHANNEL_NAME.into(),
                retry_after,
            })
        }
        Some(401) => Err(ChannelError::AuthFailed {
            name: CHANNEL_NAME.into(),
            reason: description,
        }),
        _ => Err(ChannelError::FetchFailed {
            name: CHANNEL_NAME.into(),
            reason: format!("{method}: {description}"),
        }),
    }
}

fn highest_update_id(updates: &[serde_json::Value]) -> Option<i64> {
    updates
        .iter()
        .filter_map(|u| u.get("update_id").and_then(serde_json::Value::as_i64))
        .max()
}

/// Messages for one chat newer than `watermark`, ascending by id, capped at `limit`.
fn select_messages(
    updates: &[serde_json::Value],
    chat_id: i64,
    watermark: i64,
    limit: usize,
) -> Vec<RawMessage> {
    let mut messages: Vec<RawMessage> = updates
        .iter()
        .filter_map(|u| u.get("message").or_else(|| u.get("channel_post")))
        .filter(|m| {
            m.get("chat")
                .and_then(|c| c.get("id"))
                .and_then(serde_json::Value::as_i64)
                == Some(chat_id)
        })
        .filter_map(to_raw_message)
        .filter(|m| m.message_id > watermark)
        .collect();

    messages.sort_by_key(|m| m.message_id);
    messages.dedup_by_key(|m| m.message_id);
    messages.truncate(limit);
    messages
}

fn to_raw_message(message: &serde_json::Value) -> Option<RawMessage> {
    let message_id = message.get("message_id")?.as_i64()?;
    let date = message
        .get("date")
        .and_then(serde_json::Value::as_i64)
        .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));
    let sender_id = message
        .get("from")
        .and_then(|f| f.get("id"))
        .and_then(serde_json::Value::as_i64);
    let text = message
        .get("text")
        .or_else(|| message.get("caption"))
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    Some(RawMessage {
        message_id,
        date,
        sender_id,
        text,
        raw: message.clone(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────
