//! Wire types and transport for OpenAI-compatible chat completion endpoints.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::LlmError;

#[derive(Debug, Serialize)]
pub struct ChatMessage<'a> {
    pub role: &'static str,
    pub content: &'a str,
}

impl<'a> ChatMessage<'a> {
    pub fn system(content: &'a str) -> Self {
        Self {
            role: "system",
            content,
        }
    }

    pub fn user(content: &'a str) -> Self {
        Self {
            role: "user",
            content,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage<'a>>,
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    pub stream: bool,
}

#[derive(Debug, Deserialize)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
pub struct Choice {
    pub message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatResponse {
    /// Trimmed content of the first choice, if non-empty.
    pub fn first_content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .map(str::trim)
            .filter(|c| !c.is_empty())
    }
}

/// POST a chat request and decode the response, mapping transport failures
/// and non-success statuses onto [`LlmError`].
pub async fn post_chat(
    client: &reqwest::Client,
    provider: &str,
    url: &str,
    api_key: &SecretString,
    request: &ChatRequest<'_>,
    timeout: Duration,
) -> Result<ChatResponse, LlmError> {
    debug!(provider, url, model = request.model, "Sending chat completion request");

    let resp = client
        .post(url)
        .bearer_auth(api_key.expose_secret())
        .timeout(timeout)
        .json(request)
        .send()
        .await
        .map_err(|e| transport_error(provider, timeout, e))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify_error(provider, status.as_u16(), &body));
    }

    resp.json::<ChatResponse>()
        .await
        .map_err(|e| transport_error(provider, timeout, e))
}

fn transport_error(provider: &str, timeout: Duration, e: reqwest::Error) -> LlmError {
    if e.is_timeout() {
        LlmError::Timeout {
            provider: provider.to_string(),
            timeout,
        }
    } else if e.is_decode() {
        LlmError::InvalidResponse {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    }
}

/// Map a non-success HTTP status and body onto an error kind.
///
/// 402, or a message mentioning balance or insufficient funds, is the
/// quota sub-case.
pub fn classify_error(provider: &str, status: u16, body: &str) -> LlmError {
    let message = error_message(body);
    let lower = message.to_lowercase();

    if status == 402 || lower.contains("balance") || lower.contains("insufficient") {
        LlmError::QuotaExhausted {
            provider: provider.to_string(),
            reason: message,
        }
    } else if status == 401 || status == 403 {
        LlmError::AuthFailed {
            provider: provider.to_string(),
        }
    } else {
        LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {message}"),
        }
    }
}

/// Pull `error.message` out of a JSON error body, else a truncated raw body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        match value.get("error") {
            Some(serde_json::Value::Object(obj)) => {
                if let Some(msg) = obj.get("message").and_then(|m| m.as_str()) {
                    return msg.to_string();
                }
            }
            Some(serde_json::Value::String(s)) => return s.clone(),
            _ => {}
        }
    }
    body.chars().take(500).collect()
}
