//! Telegram Bot API delivery.
//!
//! Sends one short message per qualifying transfer to a configured chat (and
//! optionally a forum topic). Also exposes the `getUpdates` long poll used by
//! the `chat-id` command to discover which chat id to configure.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::error::NotifyError;
use crate::notifier::{format_message, Notifier};

pub const API_URL: &str = "https://api.telegram.org";

/// Seconds the server holds a `getUpdates` request open.
const LONG_POLL_SECS: u64 = 30;

#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub chat_id: String,
    /// Forum topic to post into (`message_thread_id`).
    pub topic_id: Option<i64>,
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        !self.bot_token.is_empty() && !self.chat_id.is_empty()
    }
}

pub struct TelegramNotifier {
    config: TelegramConfig,
    client: Client,
    api_base: String,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("configured", &self.config.is_configured())
            .field("chat_id", &self.config.chat_id)
            .field("api_base", &"<redacted>")
            .finish()
    }
}

/// Sender of a message seen through `getUpdates`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingChat {
    pub update_id: i64,
    pub chat_id: i64,
    pub topic_id: Option<i64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub title: Option<String>,
    pub text: Option<String>,
}

/// Result of one `getUpdates` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Updates {
    /// Highest update id received, message or not. The next poll starts after it.
    pub last_update_id: Option<i64>,
    pub chats: Vec<IncomingChat>,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig, timeout: Duration) -> Result<Self, NotifyError> {
        Self::with_api_url(config, API_URL, timeout)
    }

    /// Points the notifier at a self-hosted Bot API server.
    pub fn with_api_url(
        config: TelegramConfig,
        api_url: &str,
        timeout: Duration,
    ) -> Result<Self, NotifyError> {
        let api_base = format!("{}/bot{}", api_url.trim_end_matches('/'), config.bot_token);
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            config,
            client,
            api_base,
        })
    }

    /// Sends `text` to the configured chat.
    pub async fn send_message(&self, text: &str) -> Result<(), NotifyError> {
        self.send_to(json!(self.config.chat_id), self.config.topic_id, text)
            .await
    }

    async fn send_to(
        &self,
        chat_id: Value,
        topic_id: Option<i64>,
        text: &str,
    ) -> Result<(), NotifyError> {
        let mut payload = json!({
            "chat_id": chat_id,
            "text": text,
        });
        if let Some(topic) = topic_id {
            payload["message_thread_id"] = json!(topic);
        }

        let resp = self
            .client
            .post(format!("{}/sendMessage", self.api_base))
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        check_reply(status, &body)
    }

    /// One `getUpdates` long poll starting at `offset`.
    pub async fn poll_updates(&self, offset: i64) -> Result<Updates, NotifyError> {
        let offset = offset.to_string();
        let timeout = LONG_POLL_SECS.to_string();
        let resp = self
            .client
            .get(format!("{}/getUpdates", self.api_base))
            .query(&[("offset", offset.as_str()), ("timeout", timeout.as_str())])
            .timeout(Duration::from_secs(LONG_POLL_SECS + 5))
            .send()
            .await?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(NotifyError::Status { status, body });
        }
        parse_updates(&body)
    }

    /// Tells a chat its own id, so the operator can copy it into the config.
    pub async fn reply_with_chat_id(&self, chat: &IncomingChat) -> Result<(), NotifyError> {
        let mut text = format!("Your chat id: {}", chat.chat_id);
        if let Some(topic) = chat.topic_id {
            text.push_str(&format!("\nTopic id: {topic}"));
        }
        self.send_to(json!(chat.chat_id), chat.topic_id, &text).await
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, amount: &Amount, label: &str) -> bool {
        let message = format_message(amount, label);
        match self.send_message(&message).await {
            Ok(()) => {
                info!("[Telegram] sent: {}", message);
                true
            }
            Err(e) => {
                warn!("[Telegram] failed to send {:?}: {}", message, e);
                false
            }
        }
    }
}

#[derive(Deserialize)]
struct ApiReply {
    ok: bool,
    description: Option<String>,
    #[serde(default)]
    result: Value,
}

fn check_reply(status: reqwest::StatusCode, body: &str) -> Result<(), NotifyError> {
    if !status.is_success() {
        let body: String = body.chars().take(200).collect();
        return Err(NotifyError::Status { status, body });
    }
    match serde_json::from_str::<ApiReply>(body) {
        Ok(reply) if reply.ok => Ok(()),
        Ok(reply) => Err(NotifyError::Rejected(
            reply.description.unwrap_or_else(|| "unknown error".to_string()),
        )),
        Err(e) => Err(NotifyError::Rejected(format!("unreadable reply: {e}"))),
    }
}

#[derive(Deserialize)]
struct Update {
    update_id: i64,
    message: Option<Message>,
}

#[derive(Deserialize)]
struct Message {
    chat: Chat,
    message_thread_id: Option<i64>,
    text: Option<String>,
}

#[derive(Deserialize)]
struct Chat {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
    title: Option<String>,
}

/// Extracts message senders from a `getUpdates` reply. Updates without a
/// message (edits, callbacks, ...) are skipped.
pub fn parse_updates(body: &str) -> Result<Updates, NotifyError> {
    let reply: ApiReply = serde_json::from_str(body)
        .map_err(|e| NotifyError::Rejected(format!("unreadable reply: {e}")))?;
    if !reply.ok {
        return Err(NotifyError::Rejected(
            reply.description.unwrap_or_else(|| "unknown error".to_string()),
        ));
    }
    let updates: Vec<Update> = serde_json::from_value(reply.result)
        .map_err(|e| NotifyError::Rejected(format!("unreadable updates: {e}")))?;

    let last_update_id = updates.iter().map(|u| u.update_id).max();
    let chats = updates
        .into_iter()
        .filter_map(|update| {
            let message = update.message?;
            Some(IncomingChat {
                update_id: update.update_id,
                chat_id: message.chat.id,
                topic_id: message.message_thread_id,
                username: message.chat.username,
                first_name: message.chat.first_name,
                title: message.chat.title,
                text: message.text,
            })
        })
        .collect();
    Ok(Updates {
        last_update_id,
        chats,
    })
}
