//! Story generator backed by the DeepSeek chat API.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tracing::{error, info};

use super::StoryGenerator;
use super::chat::{ChatMessage, ChatRequest, post_chat};
use crate::error::LlmError;

const PROVIDER: &str = "deepseek";

/// Settings for [`DeepSeekGenerator`].
#[derive(Debug, Clone)]
pub struct DeepSeekConfig {
    pub api_key: SecretString,
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    /// Language the fables are written in.
    pub language: String,
}

impl DeepSeekConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            api_url: "https://api.deepseek.com/v1/chat/completions".to_string(),
            model: "deepseek-chat".to_string(),
            temperature: 0.8,
            max_tokens: 2000,
            timeout: Duration::from_secs(60),
            language: "English".to_string(),
        }
    }
}

fn system_prompt(language: &str) -> String {
    format!(
        "You are a talented author of fables in the manner of Ivan Krylov.

You write instructive fables whose main characters are the SPECIFIC children described in the request.

Critical:
- If the request names children, use exactly those names. Never invent other names.
- If character traits are given, show them through the characters' behaviour.
- The heroes are the real children from the request, not made-up characters.

Requirements:
- Krylov-like style, instructive and easy for children to follow.
- End with a moral.
- Length: 500-900 words.
- Language: {language}.
- No profanity and no adult content."
    )
}

pub struct DeepSeekGenerator {
    client: reqwest::Client,
    config: DeepSeekConfig,
    system_prompt: String,
}

impl DeepSeekGenerator {
    pub fn new(config: DeepSeekConfig) -> Self {
        let system_prompt = system_prompt(&config.language);
        Self {
            client: reqwest::Client::new(),
            config,
            system_prompt,
        }
    }
}

#[async_trait]
impl StoryGenerator for DeepSeekGenerator {
    fn model_tag(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage::system(&self.system_prompt),
                ChatMessage::user(prompt),
            ],
            temperature: self.config.temperature,
            max_tokens: Some(self.config.max_tokens),
            response_format: None,
            stream: false,
        };

        let response = post_chat(
            &self.client,
            PROVIDER,
            &self.config.api_url,
            &self.config.api_key,
            &request,
            self.config.timeout,
        )
        .await
        .inspect_err(|e| {
            if matches!(e, LlmError::QuotaExhausted { .. }) {
                error!(error = %e, "DeepSeek balance exhausted");
            }
        })?;

        match response.first_content() {
            Some(text) => {
                info!(chars = text.chars().count(), "Story generated");
                Ok(text.to_string())
            }
            None => Err(LlmError::EmptyResponse {
                provider: PROVIDER.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_generation_settings() {
        let config = DeepSeekConfig::new(SecretString::from("k"));
        assert_eq!(config.temperature, 0.8);
        assert_eq!(config.max_tokens, 2000);
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn model_tag_is_model_name() {
        let mut config = DeepSeekConfig::new(SecretString::from("k"));
        config.model = "deepseek-reasoner".into();
        assert_eq!(DeepSeekGenerator::new(config).model_tag(), "deepseek-reasoner");
    }

    #[test]
    fn language_lands_in_system_prompt() {
        assert!(system_prompt("Russian").contains("Language: Russian."));
    }
}
