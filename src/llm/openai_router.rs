//! Router backed by an OpenAI chat model in JSON mode.

use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::chat::{ChatMessage, ChatRequest, ResponseFormat, post_chat};
use super::{IntentKind, IntentRoute, RouteDecision, StoryRouter};
use crate::error::LlmError;
use crate::profile::model::Profile;

const PROVIDER: &str = "openai";

const SYSTEM_PROMPT: &str = "You are the request router for a bot that helps parents guide their \
children through instructive fables in the style of Krylov.

Your job:
1. Read the parent's message.
2. Decide whether it corrects the child profile (names, age, character traits).
3. Write the task prompt for the fable writer.

Rules:
- If the parent corrects the profile (\"he is 6, not 5\", \"she is stubborn, not calm\", \
\"two kids: Masha and Petya\") set should_update_profile=true and fill profile_patch.
- A plain request for a story sets should_update_profile=false.
- prompt: a complete task for the fable writer that reflects the request, with a clear moral at the end.
- No profanity and no adult content.

Return ONLY valid JSON, with no commentary.";

/// Settings for [`OpenAiRouter`].
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub api_key: SecretString,
    pub api_url: String,
    pub model: String,
    pub temperature: f32,
    pub timeout: Duration,
}

impl RouterConfig {
    pub fn new(api_key: SecretString) -> Self {
        Self {
            api_key,
            api_url: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            temperature: 0.7,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RouterReply {
    #[serde(default)]
    should_update_profile: bool,
    #[serde(default)]
    profile_patch: Option<Map<String, Value>>,
    #[serde(default, alias = "deepseek_user_prompt", alias = "story_prompt")]
    prompt: Option<String>,
}

/// Routes free-form messages through the model; menu intents use local templates.
pub struct OpenAiRouter {
    client: reqwest::Client,
    config: RouterConfig,
}

impl OpenAiRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

fn profile_block(profile: Option<&Profile>) -> String {
    match profile {
        Some(p) => format!(
            "\nChild profile:\n- Names: {}\n- Age: {}\n- Traits: {}\n",
            p.child_names,
            p.age,
            if p.has_traits() { p.traits.as_str() } else { "not given" },
        ),
        None => String::new(),
    }
}

/// Decode the model's JSON reply into a decision.
///
/// Null patch values are dropped and a missing prompt falls back to the raw request.
fn parse_reply(content: &str, raw_text: &str) -> Result<RouteDecision, LlmError> {
    let reply: RouterReply =
        serde_json::from_str(content).map_err(|e| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: format!("router reply is not valid JSON: {e}"),
        })?;

    let profile_patch = reply
        .profile_patch
        .unwrap_or_default()
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .collect();

    let prompt = reply
        .prompt
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| format!("Write an instructive fable based on this request: {raw_text}"));

    Ok(RouteDecision {
        should_update_profile: reply.should_update_profile,
        profile_patch,
        prompt,
    })
}

/// Local task template for a menu intent.
pub fn intent_prompt(kind: IntentKind, raw_text: Option<&str>, profile: &Profile) -> String {
    let text = raw_text.map(str::trim).filter(|t| !t.is_empty());
    match (kind, text) {
        (IntentKind::FirstStory, Some(situation)) => format!(
            "Write an instructive fable in the style of Krylov for {}. \
             The fable must work through this situation and end with an explicit moral: {situation}",
            profile.child_names
        ),
        (IntentKind::FirstStory, None) => format!(
            "Write an instructive fable in the style of Krylov for {} with a clear moral at the end.",
            profile.child_names
        ),
        (IntentKind::NewDilemma, Some(dilemma)) => format!(
            "Write a new instructive fable that helps with this situation: {dilemma}. \
             End with an explicit moral."
        ),
        (IntentKind::RandomMoral, Some(moral)) => format!(
            "Write a self-contained instructive fable whose moral is: \"{moral}\". \
             State the moral at the end."
        ),
        (IntentKind::PreviousMoral, Some(previous)) => format!(
            "Write a new fable, different from earlier ones, on the same theme: {previous}. \
             End with an explicit moral."
        ),
        (IntentKind::FreeForm, Some(request)) => {
            format!("Write an instructive fable based on this request: {request}")
        }
        (_, None) => "Write an instructive fable in the style of Krylov with a clear moral at the end."
            .to_string(),
    }
}

#[async_trait]
impl StoryRouter for OpenAiRouter {
    async fn route(&self, raw_text: &str, profile: Option<&Profile>) -> Result<RouteDecision, LlmError> {
        let user_prompt = format!(
            "Parent's message: {raw_text}\n{}\n\
             Return JSON in this shape:\n\
             {{\"should_update_profile\": true/false, \
             \"profile_patch\": {{\"child_names\": \"string or null\", \"age\": \"string or null\", \"traits\": \"string or null\"}}, \
             \"prompt\": \"the full task for the fable writer\"}}",
            profile_block(profile)
        );

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage::system(SYSTEM_PROMPT),
                ChatMessage::user(&user_prompt),
            ],
            temperature: self.config.temperature,
            max_tokens: None,
            response_format: Some(ResponseFormat {
                kind: "json_object",
            }),
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
        .await?;

        let Some(content) = response.first_content() else {
            warn!("Router returned no content");
            return Err(LlmError::EmptyResponse {
                provider: PROVIDER.to_string(),
            });
        };

        let decision = parse_reply(content, raw_text)?;
        info!(
            should_update = decision.should_update_profile,
            patch_keys = decision.profile_patch.len(),
            "Router classified message"
        );
        Ok(decision)
    }

    async fn route_intent(
        &self,
        kind: IntentKind,
        raw_text: Option<&str>,
        profile: &Profile,
    ) -> Result<IntentRoute, LlmError> {
        let mut extra = Map::new();
        extra.insert("intent".to_string(), Value::String(kind.as_str().to_string()));
        Ok(IntentRoute {
            prompt: intent_prompt(kind, raw_text, profile),
            extra,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn profile() -> Profile {
        let now = Utc::now();
        Profile {
            user_id: 1,
            display_name: None,
            child_names: "Platon and Demid".into(),
            age: "5 and 8".into(),
            traits: String::new(),
            active_context: None,
            wishes: None,
            feedback: None,
            feedback_rating: None,
            story_total: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn reply_with_patch() {
        let decision = parse_reply(
            r#"{"should_update_profile": true,
                "profile_patch": {"age": "6", "traits": null},
                "prompt": "Write a fable about patience."}"#,
            "he is 6, not 5",
        )
        .unwrap();
        assert!(decision.should_update_profile);
        assert_eq!(decision.profile_patch.len(), 1);
        assert_eq!(decision.profile_patch["age"], "6");
        assert_eq!(decision.prompt, "Write a fable about patience.");
    }

    #[test]
    fn legacy_prompt_key_is_accepted() {
        let decision =
            parse_reply(r#"{"deepseek_user_prompt": "About a fox."}"#, "fox").unwrap();
        assert!(!decision.should_update_profile);
        assert_eq!(decision.prompt, "About a fox.");
    }

    #[test]
    fn missing_prompt_falls_back_to_request() {
        let decision = parse_reply(r#"{"should_update_profile": false}"#, "a brave hedgehog").unwrap();
        assert!(decision.prompt.contains("a brave hedgehog"));
    }

    #[test]
    fn invalid_json_is_an_error() {
        let err = parse_reply("not json", "x").unwrap_err();
        assert_eq!(err.cause(), "invalid_response");
    }

    #[test]
    fn profile_block_marks_missing_traits() {
        let block = profile_block(Some(&profile()));
        assert!(block.contains("Platon and Demid"));
        assert!(block.contains("not given"));
        assert!(profile_block(None).is_empty());
    }

    #[tokio::test]
    async fn intent_routes_are_local() {
        let router = OpenAiRouter::new(RouterConfig::new(SecretString::from("sk-test")));
        let route = router
            .route_intent(IntentKind::RandomMoral, Some("Greed loses all."), &profile())
            .await
            .unwrap();
        assert!(route.prompt.contains("Greed loses all."));
        assert_eq!(route.extra["intent"], "random_moral");
    }

    #[test]
    fn first_story_mentions_children() {
        let prompt = intent_prompt(IntentKind::FirstStory, None, &profile());
        assert!(prompt.contains("Platon and Demid"));
    }
}
