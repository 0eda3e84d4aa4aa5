//! Channel abstraction for message I/O.
//!
//! A channel turns a transport (Telegram, stdin) into a stream of
//! [`IncomingEvent`]s and renders [`OutgoingMessage`]s, including long-text
//! splitting and menu buttons.

pub mod cli;
pub mod telegram;

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;

use crate::error::ChannelError;
use crate::profile::model::UserId;

pub use cli::CliChannel;
pub use telegram::TelegramChannel;

/// What the user did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// Typed text, including `/commands`.
    Text(String),
    /// A menu button press, carrying the button id.
    Button(String),
}

/// One inbound user action.
#[derive(Debug, Clone)]
pub struct IncomingEvent {
    pub channel: String,
    pub user_id: UserId,
    pub chat_id: i64,
    pub user_name: Option<String>,
    pub payload: EventPayload,
    /// Transport handle for acknowledging a button press.
    pub callback_id: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingEvent {
    pub fn text(channel: &str, user_id: UserId, chat_id: i64, text: impl Into<String>) -> Self {
        Self::new(channel, user_id, chat_id, EventPayload::Text(text.into()))
    }

    pub fn button(channel: &str, user_id: UserId, chat_id: i64, id: impl Into<String>) -> Self {
        Self::new(channel, user_id, chat_id, EventPayload::Button(id.into()))
    }

    fn new(channel: &str, user_id: UserId, chat_id: i64, payload: EventPayload) -> Self {
        Self {
            channel: channel.to_string(),
            user_id,
            chat_id,
            user_name: None,
            payload,
            callback_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_callback_id(mut self, id: impl Into<String>) -> Self {
        self.callback_id = Some(id.into());
        self
    }
}

/// A menu control. `id` is what comes back in [`EventPayload::Button`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuButton {
    pub id: String,
    pub label: String,
}

impl MenuButton {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

/// Text plus optional rows of buttons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    pub buttons: Vec<Vec<MenuButton>>,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn with_buttons(mut self, rows: Vec<Vec<MenuButton>>) -> Self {
        self.buttons = rows;
        self
    }

    pub fn has_buttons(&self) -> bool {
        self.buttons.iter().any(|row| !row.is_empty())
    }
}

/// Transient progress indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    /// A story is being written.
    Writing,
}

pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingEvent> + Send>>;

/// A chat transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving events.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a message of any length to a chat.
    async fn send(&self, chat_id: i64, message: OutgoingMessage) -> Result<(), ChannelError>;

    async fn send_status(&self, chat_id: i64, status: StatusUpdate) -> Result<(), ChannelError>;

    /// Confirm receipt of a button press.
    async fn acknowledge(&self, _event: &IncomingEvent) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Split text into chunks of at most `max_chars` characters.
///
/// Prefers paragraph breaks, then line breaks, then spaces; hard-cuts only
/// when a window has none of those. Cuts always fall on character
/// boundaries, so multi-byte text is never broken mid-character.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        let Some((window_end, _)) = remaining.char_indices().nth(max_chars) else {
            chunks.push(remaining.to_string());
            break;
        };

        let window = &remaining[..window_end];
        let split_at = if remaining[window_end..].starts_with(char::is_whitespace) {
            window_end
        } else {
            [window.rfind("\n\n"), window.rfind('\n'), window.rfind(' ')]
                .into_iter()
                .flatten()
                .find(|&i| i > 0)
                .unwrap_or(window_end)
        };

        let chunk = remaining[..split_at].trim_end();
        if !chunk.is_empty() {
            chunks.push(chunk.to_string());
        }
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}
