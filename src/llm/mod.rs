//! External language-model collaborators.
//!
//! Two seams:
//! - **Router** ([`StoryRouter`]): turns raw user text into a story prompt
//!   and an optional profile patch, and builds prompts for menu intents.
//! - **Generator** ([`StoryGenerator`]): turns the assembled prompt into
//!   story text.
//!
//! Production implementations talk to OpenAI-compatible chat endpoints
//! ([`openai_router::OpenAiRouter`], [`deepseek::DeepSeekGenerator`]).

pub mod chat;
pub mod deepseek;
pub mod openai_router;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::LlmError;
use crate::profile::model::Profile;

pub use deepseek::{DeepSeekConfig, DeepSeekGenerator};
pub use openai_router::{OpenAiRouter, RouterConfig};

/// Classified request kind driving which prompt is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntentKind {
    FirstStory,
    FreeForm,
    NewDilemma,
    RandomMoral,
    PreviousMoral,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FirstStory => "first_story",
            Self::FreeForm => "free_form",
            Self::NewDilemma => "new_dilemma",
            Self::RandomMoral => "random_moral",
            Self::PreviousMoral => "previous_moral",
        }
    }
}

impl FromStr for IntentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "first_story" => Ok(Self::FirstStory),
            "free_form" => Ok(Self::FreeForm),
            "new_dilemma" => Ok(Self::NewDilemma),
            "random_moral" => Ok(Self::RandomMoral),
            "previous_moral" => Ok(Self::PreviousMoral),
            other => Err(format!("unknown intent: {other}")),
        }
    }
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router verdict for a free-form message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RouteDecision {
    pub should_update_profile: bool,
    /// Loose key/value patch; filtered through `ProfilePatch::from_router_map`.
    pub profile_patch: Map<String, Value>,
    pub prompt: String,
}

/// Router output for a menu-driven intent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentRoute {
    pub prompt: String,
    pub extra: Map<String, Value>,
}

/// Natural-language routing collaborator.
#[async_trait]
pub trait StoryRouter: Send + Sync {
    /// Classify a raw message and propose a story prompt.
    async fn route(&self, raw_text: &str, profile: Option<&Profile>) -> Result<RouteDecision, LlmError>;

    /// Build the task prompt for a menu intent.
    ///
    /// `raw_text` carries the dilemma, moral, or situation text the intent is about.
    async fn route_intent(
        &self,
        kind: IntentKind,
        raw_text: Option<&str>,
        profile: &Profile,
    ) -> Result<IntentRoute, LlmError>;
}

/// Story generation collaborator.
#[async_trait]
pub trait StoryGenerator: Send + Sync {
    /// Tag stored with each story to record which model wrote it.
    fn model_tag(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intent_names_round_trip() {
        for kind in [
            IntentKind::FirstStory,
            IntentKind::FreeForm,
            IntentKind::NewDilemma,
            IntentKind::RandomMoral,
            IntentKind::PreviousMoral,
        ] {
            assert_eq!(kind.as_str().parse::<IntentKind>().unwrap(), kind);
            assert_eq!(kind.to_string(), kind.as_str());
        }
        assert!("bedtime".parse::<IntentKind>().is_err());
    }
}
