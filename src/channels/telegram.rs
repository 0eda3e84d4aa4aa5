//! Telegram channel — long-polls the Bot API for updates.
//!
//! Handles plain messages and inline-keyboard callback queries, renders
//! menus as inline keyboards, and splits long stories into several messages.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;

use crate::channels::{
    Channel, IncomingEvent, MessageStream, OutgoingMessage, StatusUpdate, split_message,
};
use crate::error::ChannelError;

/// Chunk size for outgoing text. Below the API's 4096 limit to leave room
/// for Markdown escaping.
pub const TELEGRAM_CHUNK_CHARS: usize = 3800;

const API_BASE: &str = "https://api.telegram.org";

/// Telegram channel — connects to the Bot API via long-polling.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        method_url(&self.bot_token, method)
    }

    fn send_failed(reason: impl Into<String>) -> ChannelError {
        ChannelError::SendFailed {
            name: "telegram".into(),
            reason: reason.into(),
        }
    }

    /// Send one chunk, trying Markdown first with plain text fallback.
    async fn send_chunk(
        &self,
        chat_id: i64,
        text: &str,
        reply_markup: Option<&Value>,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "Markdown",
        });
        if let Some(markup) = reply_markup {
            body["reply_markup"] = markup.clone();
        }

        let markdown_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if markdown_resp.status().is_success() {
            return Ok(());
        }

        let markdown_status = markdown_resp.status();
        tracing::warn!(
            status = ?markdown_status,
            "Telegram sendMessage with Markdown failed; retrying without parse_mode"
        );

        if let Some(obj) = body.as_object_mut() {
            obj.remove("parse_mode");
        }
        let plain_resp = self
            .client
            .post(self.api_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::send_failed(e.to_string()))?;

        if !plain_resp.status().is_success() {
            let plain_err = plain_resp.text().await.unwrap_or_default();
            return Err(Self::send_failed(format!(
                "sendMessage failed (markdown: {markdown_status}, plain: {plain_err})"
            )));
        }
        Ok(())
    }
}

fn method_url(token: &SecretString, method: &str) -> String {
    format!("{API_BASE}/bot{}/{method}", token.expose_secret())
}

/// Render button rows as an `inline_keyboard` reply markup.
fn inline_keyboard(message: &OutgoingMessage) -> Option<Value> {
    if !message.has_buttons() {
        return None;
    }
    let rows: Vec<Value> = message
        .buttons
        .iter()
        .filter(|row| !row.is_empty())
        .map(|row| {
            Value::Array(
                row.iter()
                    .map(|b| serde_json::json!({"text": b.label, "callback_data": b.id}))
                    .collect(),
            )
        })
        .collect();
    Some(serde_json::json!({ "inline_keyboard": rows }))
}

/// Convert one `getUpdates` entry into an event.
///
/// Returns `None` for update kinds the bot does not handle.
fn parse_update(update: &Value) -> Option<IncomingEvent> {
    if let Some(message) = update.get("message") {
        let text = message.get("text").and_then(Value::as_str)?;
        let from = message.get("from")?;
        let user_id = from.get("id").and_then(Value::as_i64)?;
        let chat_id = message
            .get("chat")
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
            .unwrap_or(user_id);

        let mut event = IncomingEvent::text("telegram", user_id, chat_id, text);
        if let Some(name) = display_name(from) {
            event = event.with_user_name(name);
        }
        return Some(event);
    }

    if let Some(query) = update.get("callback_query") {
        let data = query.get("data").and_then(Value::as_str)?;
        let from = query.get("from")?;
        let user_id = from.get("id").and_then(Value::as_i64)?;
        let chat_id = query
            .get("message")
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(Value::as_i64)
            .unwrap_or(user_id);

        let mut event = IncomingEvent::button("telegram", user_id, chat_id, data);
        if let Some(id) = query.get("id").and_then(Value::as_str) {
            event = event.with_callback_id(id);
        }
        if let Some(name) = display_name(from) {
            event = event.with_user_name(name);
        }
        return Some(event);
    }

    None
}

fn display_name(from: &Value) -> Option<&str> {
    from.get("first_name")
        .and_then(Value::as_str)
        .or_else(|| from.get("username").and_then(Value::as_str))
}

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for updates...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram poll error");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!(error = %e.without_url(), "Telegram parse error");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(Value::as_array) else {
                    continue;
                };

                for update in results {
                    if let Some(uid) = update.get("update_id").and_then(Value::as_i64) {
                        offset = uid + 1;
                    }

                    let Some(event) = parse_update(update) else {
                        continue;
                    };

                    if tx.send(event).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, chat_id: i64, message: OutgoingMessage) -> Result<(), ChannelError> {
        let markup = inline_keyboard(&message);
        let chunks = split_message(&message.text, TELEGRAM_CHUNK_CHARS);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            // Buttons ride on the final chunk so the menu sits under the story's end
            let chunk_markup = if i == last { markup.as_ref() } else { None };
            self.send_chunk(chat_id, chunk, chunk_markup).await?;
        }
        Ok(())
    }

    async fn send_status(&self, chat_id: i64, status: StatusUpdate) -> Result<(), ChannelError> {
        match status {
            StatusUpdate::Writing => {
                let resp = self
                    .client
                    .post(self.api_url("sendChatAction"))
                    .json(&serde_json::json!({
                        "chat_id": chat_id,
                        "action": "typing"
                    }))
                    .send()
                    .await;
                if let Err(e) = resp {
                    tracing::debug!(error = %e.without_url(), "sendChatAction failed");
                }
            }
        }
        Ok(())
    }

    async fn acknowledge(&self, event: &IncomingEvent) -> Result<(), ChannelError> {
        let Some(callback_id) = event.callback_id.as_deref() else {
            return Ok(());
        };
        self.client
            .post(self.api_url("answerCallbackQuery"))
            .json(&serde_json::json!({ "callback_query_id": callback_id }))
            .send()
            .await
            .map_err(|e| Self::send_failed(e.without_url().to_string()))?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.without_url().to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{EventPayload, MenuButton};

    #[test]
    fn telegram_channel_name() {
        let ch = TelegramChannel::new(SecretString::from("fake-token"));
        assert_eq!(ch.name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        let ch = TelegramChannel::new(SecretString::from("123:ABC"));
        assert_eq!(
            ch.api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn parses_text_message() {
        let update = serde_json::json!({
            "update_id": 10,
            "message": {
                "text": "/start",
                "from": {"id": 42, "first_name": "Anna", "username": "anna"},
                "chat": {"id": 4242}
            }
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.user_id, 42);
        assert_eq!(event.chat_id, 4242);
        assert_eq!(event.payload, EventPayload::Text("/start".into()));
        assert_eq!(event.user_name.as_deref(), Some("Anna"));
        assert!(event.callback_id.is_none());
    }

    #[test]
    fn parses_callback_query() {
        let update = serde_json::json!({
            "update_id": 11,
            "callback_query": {
                "id": "cb-1",
                "data": "story_random_moral",
                "from": {"id": 42, "username": "anna"},
                "message": {"chat": {"id": 4242}}
            }
        });
        let event = parse_update(&update).unwrap();
        assert_eq!(event.payload, EventPayload::Button("story_random_moral".into()));
        assert_eq!(event.callback_id.as_deref(), Some("cb-1"));
        assert_eq!(event.user_name.as_deref(), Some("anna"));
    }

    #[test]
    fn ignores_non_text_updates() {
        let sticker = serde_json::json!({
            "update_id": 12,
            "message": {"sticker": {}, "from": {"id": 1}, "chat": {"id": 1}}
        });
        assert!(parse_update(&sticker).is_none());

        let edited = serde_json::json!({"update_id": 13, "edited_message": {}});
        assert!(parse_update(&edited).is_none());
    }

    #[test]
    fn keyboard_rows_map_to_callback_data() {
        let msg = OutgoingMessage::text("menu").with_buttons(vec![
            vec![MenuButton::new("wishes", "Wishes")],
            vec![],
            vec![
                MenuButton::new("feedback_star_1", "⭐"),
                MenuButton::new("feedback_star_2", "⭐⭐"),
            ],
        ]);
        let markup = inline_keyboard(&msg).unwrap();
        let rows = markup["inline_keyboard"].as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0]["callback_data"], "wishes");
        assert_eq!(rows[1][1]["text"], "⭐⭐");
    }

    #[test]
    fn no_keyboard_without_buttons() {
        assert!(inline_keyboard(&OutgoingMessage::text("plain")).is_none());
    }
}
