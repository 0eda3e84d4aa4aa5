//! CLI channel — stdin/stdout REPL for local testing.
//!
//! Lines starting with `!` press a menu button (`!story_random_moral`);
//! anything else is typed text.

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, IncomingEvent, MessageStream, OutgoingMessage, StatusUpdate};
use crate::error::ChannelError;

/// The single local user the CLI speaks for.
pub const CLI_USER_ID: i64 = 1;

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel;

impl CliChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_line(line: &str) -> Option<IncomingEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let event = match line.strip_prefix('!') {
        Some(id) if !id.trim().is_empty() => {
            IncomingEvent::button("cli", CLI_USER_ID, CLI_USER_ID, id.trim())
        }
        _ => IncomingEvent::text("cli", CLI_USER_ID, CLI_USER_ID, line),
    };
    Some(event.with_user_name("local-user"))
}

fn render(message: &OutgoingMessage) -> String {
    let mut out = message.text.clone();
    for row in message.buttons.iter().filter(|r| !r.is_empty()) {
        out.push('\n');
        let labels: Vec<String> = row.iter().map(|b| format!("[!{}] {}", b.id, b.label)).collect();
        out.push_str(&labels.join("   "));
    }
    out
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let Some(event) = parse_line(&line) else {
                            eprint!("> ");
                            continue;
                        };
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, _chat_id: i64, message: OutgoingMessage) -> Result<(), ChannelError> {
        println!("\n{}\n", render(&message));
        eprint!("> ");
        Ok(())
    }

    async fn send_status(&self, _chat_id: i64, status: StatusUpdate) -> Result<(), ChannelError> {
        match status {
            StatusUpdate::Writing => eprintln!("✒️ Writing a fable..."),
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
