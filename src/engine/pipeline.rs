//! Story generation: resolve intent, assemble prompt, generate, persist, deliver.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channels::{Channel, OutgoingMessage, StatusUpdate};
use crate::error::{DatabaseError, GenerationError, LlmError};
use crate::guard::RateGuard;
use crate::llm::{IntentKind, StoryGenerator, StoryRouter};
use crate::morals::MoralCatalog;
use crate::profile::model::SavedStory;
use crate::profile::{Profile, ProfilePatch, ProfileStore, UserId};

use super::menu;
use super::prompt::build_story_prompt;

/// A resolved story request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    /// End of intake; `situation` is `None` when the parent answered "no".
    FirstStory { situation: Option<String> },
    /// Plain text from an idle user.
    FreeForm(String),
    /// A new situation typed after the "new situation" button.
    NewDilemma(String),
    RandomMoral,
    PreviousMoral,
}

impl Intent {
    pub fn kind(&self) -> IntentKind {
        match self {
            Self::FirstStory { .. } => IntentKind::FirstStory,
            Self::FreeForm(_) => IntentKind::FreeForm,
            Self::NewDilemma(_) => IntentKind::NewDilemma,
            Self::RandomMoral => IntentKind::RandomMoral,
            Self::PreviousMoral => IntentKind::PreviousMoral,
        }
    }
}

/// What a successful generation produced.
#[derive(Debug, Clone)]
pub struct StoryOutcome {
    pub intent: IntentKind,
    pub story: String,
    pub prompt: String,
    /// `None` when the profile was deleted while the story was being written.
    pub saved: Option<SavedStory>,
    /// The moral chosen for a random-moral story.
    pub moral: Option<String>,
}

/// Generation collaborators and settings.
pub struct GenerationPipeline {
    profiles: ProfileStore,
    guard: Arc<RateGuard>,
    router: Arc<dyn StoryRouter>,
    generator: Arc<dyn StoryGenerator>,
    channel: Arc<dyn Channel>,
    morals: MoralCatalog,
    exclude_context_for: HashSet<IntentKind>,
}

impl GenerationPipeline {
    pub fn new(
        profiles: ProfileStore,
        guard: Arc<RateGuard>,
        router: Arc<dyn StoryRouter>,
        generator: Arc<dyn StoryGenerator>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            profiles,
            guard,
            router,
            generator,
            channel,
            morals: MoralCatalog::default(),
            exclude_context_for: HashSet::from([IntentKind::RandomMoral]),
        }
    }

    pub fn with_morals(mut self, morals: MoralCatalog) -> Self {
        self.morals = morals;
        self
    }

    /// Intents whose prompt omits the active situation.
    pub fn with_context_exclusions(mut self, kinds: impl IntoIterator<Item = IntentKind>) -> Self {
        self.exclude_context_for = kinds.into_iter().collect();
        self
    }

    pub fn includes_context(&self, kind: IntentKind) -> bool {
        !self.exclude_context_for.contains(&kind)
    }

    /// Gate, generate, and deliver one story.
    ///
    /// The rate permit is held until delivery finishes and is released on
    /// every exit path.
    pub async fn run(
        &self,
        user: UserId,
        chat_id: i64,
        intent: Intent,
    ) -> Result<StoryOutcome, GenerationError> {
        let profile = self
            .profiles
            .load(user)
            .await?
            .ok_or(GenerationError::ProfileMissing { user_id: user })?;

        let _permit = self.guard.try_acquire(user).map_err(|check| {
            info!(user_id = user, reason = ?check.reason, "Generation denied");
            GenerationError::RateLimited(check)
        })?;

        if let Err(e) = self.channel.send_status(chat_id, StatusUpdate::Writing).await {
            debug!(user_id = user, error = %e, "Progress indicator failed");
        }

        let outcome = match self.generate(user, &intent, profile).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    user_id = user,
                    intent = %intent.kind(),
                    cause = e.cause(),
                    error = %e,
                    "Story generation failed"
                );
                return Err(e);
            }
        };

        let message = OutgoingMessage::text(outcome.story.clone()).with_buttons(menu::main_menu());
        if let Err(e) = self.channel.send(chat_id, message).await {
            // Persistence already happened; nothing to roll back.
            warn!(user_id = user, error = %e, "Story delivery failed");
        }

        Ok(outcome)
    }

    /// Produce and persist a story without rate gating or delivery.
    pub async fn generate(
        &self,
        user: UserId,
        intent: &Intent,
        mut profile: Profile,
    ) -> Result<StoryOutcome, GenerationError> {
        let kind = intent.kind();
        let mut moral = None;

        let task = match intent {
            Intent::FreeForm(text) => {
                let decision = self
                    .router
                    .route(text, Some(&profile))
                    .await
                    .map_err(GenerationError::Router)?;
                if decision.should_update_profile {
                    profile = self.apply_router_patch(user, &decision.profile_patch, profile).await?;
                }
                decision.prompt
            }
            Intent::NewDilemma(text) => {
                profile = self.store_context(user, Some(text)).await?;
                self.route_intent(kind, Some(text), &profile).await?
            }
            Intent::RandomMoral => {
                let picked = self.morals.pick(&profile.age);
                debug!(user_id = user, moral = picked, "Picked random moral");
                profile = self.store_context(user, Some(picked)).await?;
                moral = Some(picked.to_string());
                self.route_intent(kind, Some(picked), &profile).await?
            }
            Intent::PreviousMoral => {
                let context = profile.active_context().map(str::to_string);
                self.route_intent(kind, context.as_deref(), &profile).await?
            }
            Intent::FirstStory { situation } => {
                self.route_intent(kind, situation.as_deref(), &profile).await?
            }
        };

        let prompt = build_story_prompt(&profile, &task, self.includes_context(kind));

        let story = self
            .generator
            .generate(&prompt)
            .await
            .map_err(GenerationError::Generator)?;
        let story = story.trim();
        if story.is_empty() {
            return Err(GenerationError::Generator(LlmError::EmptyResponse {
                provider: self.generator.model_tag().to_string(),
            }));
        }

        let saved = match self
            .profiles
            .record_story(user, story, self.generator.model_tag())
            .await
        {
            Ok(saved) => {
                info!(
                    user_id = user,
                    intent = %kind,
                    story_id = saved.story_id,
                    story_total = saved.story_total,
                    trimmed = saved.trimmed,
                    "Story saved"
                );
                Some(saved)
            }
            // Reset mid-generation; the story still goes out.
            Err(DatabaseError::NotFound { .. }) => {
                warn!(user_id = user, intent = %kind, "Profile gone before save, delivering unsaved story");
                None
            }
            Err(e) => return Err(e.into()),
        };

        Ok(StoryOutcome {
            intent: kind,
            story: story.to_string(),
            prompt,
            saved,
            moral,
        })
    }

    async fn route_intent(
        &self,
        kind: IntentKind,
        raw_text: Option<&str>,
        profile: &Profile,
    ) -> Result<String, GenerationError> {
        let route = self
            .router
            .route_intent(kind, raw_text, profile)
            .await
            .map_err(GenerationError::Router)?;
        Ok(route.prompt)
    }

    async fn store_context(
        &self,
        user: UserId,
        context: Option<&str>,
    ) -> Result<Profile, GenerationError> {
        self.profiles
            .set_active_context(user, context)
            .await?
            .ok_or(GenerationError::ProfileMissing { user_id: user })
    }

    async fn apply_router_patch(
        &self,
        user: UserId,
        raw: &serde_json::Map<String, serde_json::Value>,
        profile: Profile,
    ) -> Result<Profile, GenerationError> {
        let (patch, rejected) = ProfilePatch::from_router_map(raw);
        if !rejected.is_empty() {
            warn!(user_id = user, fields = ?rejected, "Ignoring non-whitelisted profile fields");
        }
        if patch.is_empty() {
            return Ok(profile);
        }
        info!(user_id = user, fields = ?patch.fields(), "Applying router profile patch");
        self.profiles
            .update(user, &patch)
            .await?
            .ok_or(GenerationError::ProfileMissing { user_id: user })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::{Map, Value, json};

    use super::*;
    use crate::channels::MessageStream;
    use crate::error::ChannelError;
    use crate::llm::{IntentRoute, RouteDecision};
    use crate::morals::AgeBracket;
    use crate::profile::{NewProfile, ProfileCache};
    use crate::store::libsql_backend::LibSqlBackend;
    use crate::store::traits::Database;

    #[derive(Default)]
    struct StubRouter {
        patch: Map<String, Value>,
        times_out: bool,
    }

    impl StubRouter {
        fn check(&self) -> Result<(), LlmError> {
            if self.times_out {
                return Err(LlmError::Timeout {
                    provider: "openai".into(),
                    timeout: std::time::Duration::from_secs(30),
                });
            }
            Ok(())
        }
    }

    #[async_trait]
    impl StoryRouter for StubRouter {
        async fn route(
            &self,
            raw_text: &str,
            _profile: Option<&Profile>,
        ) -> Result<RouteDecision, LlmError> {
            self.check()?;
            Ok(RouteDecision {
                should_update_profile: !self.patch.is_empty(),
                profile_patch: self.patch.clone(),
                prompt: format!("Free: {raw_text}"),
            })
        }

        async fn route_intent(
            &self,
            kind: IntentKind,
            raw_text: Option<&str>,
            _profile: &Profile,
        ) -> Result<IntentRoute, LlmError> {
            self.check()?;
            Ok(IntentRoute {
                prompt: format!("{kind}: {}", raw_text.unwrap_or("-")),
                extra: Map::new(),
            })
        }
    }

    struct StubGenerator {
        reply: String,
        prompts: Mutex<Vec<String>>,
        out_of_balance: bool,
    }

    #[async_trait]
    impl StoryGenerator for StubGenerator {
        fn model_tag(&self) -> &str {
            "stub"
        }

        async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            if self.out_of_balance {
                return Err(LlmError::QuotaExhausted {
                    provider: "deepseek".into(),
                    reason: "Insufficient Balance".into(),
                });
            }
            Ok(self.reply.clone())
        }
    }

    #[derive(Default)]
    struct NullChannel {
        sent: Mutex<Vec<OutgoingMessage>>,
    }

    #[async_trait]
    impl Channel for NullChannel {
        fn name(&self) -> &str {
            "null"
        }

        async fn start(&self) -> Result<MessageStream, ChannelError> {
            Ok(Box::pin(futures::stream::empty()))
        }

        async fn send(&self, _chat_id: i64, message: OutgoingMessage) -> Result<(), ChannelError> {
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        async fn send_status(&self, _chat_id: i64, _status: StatusUpdate) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn health_check(&self) -> Result<(), ChannelError> {
            Ok(())
        }
    }

    struct Fixture {
        pipeline: GenerationPipeline,
        profiles: ProfileStore,
        guard: Arc<RateGuard>,
        generator: Arc<StubGenerator>,
        channel: Arc<NullChannel>,
    }

    async fn fixture(reply: &str, patch: Map<String, Value>) -> Fixture {
        build_fixture(
            StubRouter {
                patch,
                ..Default::default()
            },
            reply,
            false,
        )
        .await
    }

    async fn build_fixture(router: StubRouter, reply: &str, out_of_balance: bool) -> Fixture {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let profiles = ProfileStore::new(db, Arc::new(ProfileCache::default()));
        profiles
            .create(
                7,
                &NewProfile {
                    display_name: None,
                    child_names: "Mia".into(),
                    age: "7".into(),
                    traits: "curious".into(),
                    active_context: Some("won't share toys".into()),
                },
            )
            .await
            .unwrap();

        let guard = Arc::new(RateGuard::default());
        let generator = Arc::new(StubGenerator {
            reply: reply.into(),
            prompts: Mutex::new(Vec::new()),
            out_of_balance,
        });
        let channel = Arc::new(NullChannel::default());
        let pipeline = GenerationPipeline::new(
            profiles.clone(),
            guard.clone(),
            Arc::new(router),
            generator.clone(),
            channel.clone(),
        );
        Fixture {
            pipeline,
            profiles,
            guard,
            generator,
            channel,
        }
    }

    #[tokio::test]
    async fn random_moral_overwrites_context_and_omits_it_from_prompt() {
        let f = fixture("A fox learned to share.", Map::new()).await;
        let outcome = f.pipeline.run(7, 7, Intent::RandomMoral).await.unwrap();

        let moral = outcome.moral.unwrap();
        assert!(MoralCatalog::default().morals(AgeBracket::Early).contains(&moral.as_str()));

        let profile = f.profiles.load(7).await.unwrap().unwrap();
        assert_eq!(profile.active_context.as_deref(), Some(moral.as_str()));
        assert_eq!(profile.story_total, 1);

        let prompt = &f.generator.prompts.lock().unwrap()[0];
        assert!(!prompt.contains("Current situation"));
        assert!(prompt.contains(&moral));
    }

    #[tokio::test]
    async fn previous_moral_keeps_situation_in_header() {
        let f = fixture("story", Map::new()).await;
        let outcome = f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap();
        assert!(outcome.prompt.contains("Current situation: won't share toys"));
        assert!(outcome.prompt.ends_with("previous_moral: won't share toys"));
    }

    #[tokio::test]
    async fn new_dilemma_is_stored_before_generation() {
        let f = fixture("story", Map::new()).await;
        f.pipeline
            .run(7, 7, Intent::NewDilemma("afraid of the dark".into()))
            .await
            .unwrap();
        let profile = f.profiles.load(7).await.unwrap().unwrap();
        assert_eq!(profile.active_context(), Some("afraid of the dark"));

        let contexts = f
            .profiles
            .db()
            .list_contexts(7, crate::profile::model::ContextKind::Archived, 10)
            .await
            .unwrap();
        assert_eq!(contexts[0].content, "won't share toys");
    }

    #[tokio::test]
    async fn free_form_applies_whitelisted_patch_only() {
        let patch = json!({"age": 8, "traits": "brave", "story_total": 99})
            .as_object()
            .cloned()
            .unwrap();
        let f = fixture("story", patch).await;
        let outcome = f
            .pipeline
            .run(7, 7, Intent::FreeForm("Mia is 8 now and brave".into()))
            .await
            .unwrap();

        let profile = f.profiles.load(7).await.unwrap().unwrap();
        assert_eq!(profile.age, "8");
        assert_eq!(profile.traits, "brave");
        assert_eq!(profile.story_total, 1);
        assert!(outcome.prompt.contains("Age: 8"));
    }

    #[tokio::test]
    async fn empty_story_leaves_profile_untouched() {
        let f = fixture("   ", Map::new()).await;
        let err = f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap_err();
        assert_eq!(err.cause(), "empty_response");

        assert!(!f.guard.is_in_flight(7));
        assert_eq!(f.profiles.load(7).await.unwrap().unwrap().story_total, 0);
        assert!(f.profiles.db().list_recent_stories(7, 10).await.unwrap().is_empty());
        assert!(f.channel.sent.lock().unwrap().is_empty());
    }

    async fn assert_untouched(f: &Fixture) {
        assert!(!f.guard.is_in_flight(7));
        let profile = f.profiles.load(7).await.unwrap().unwrap();
        assert_eq!(profile.story_total, 0);
        assert!(f.profiles.db().list_recent_stories(7, 10).await.unwrap().is_empty());
        assert!(f.channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn router_timeout_releases_permit_and_saves_nothing() {
        let router = StubRouter {
            times_out: true,
            ..Default::default()
        };
        let f = build_fixture(router, "story", false).await;

        let err = f
            .pipeline
            .run(7, 7, Intent::FreeForm("a story about a fox".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Router(LlmError::Timeout { .. })));
        assert_eq!(err.cause(), "timeout");
        assert!(f.generator.prompts.lock().unwrap().is_empty());
        assert_untouched(&f).await;
    }

    #[tokio::test]
    async fn generator_quota_exhaustion_releases_permit_and_saves_nothing() {
        let f = build_fixture(StubRouter::default(), "story", true).await;

        let err = f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap_err();
        assert!(matches!(err, GenerationError::Generator(LlmError::QuotaExhausted { .. })));
        assert_eq!(err.cause(), "quota_exhausted");
        assert_ne!(err.cause(), "timeout");
        assert_eq!(f.generator.prompts.lock().unwrap().len(), 1);
        assert_untouched(&f).await;
    }

    #[tokio::test]
    async fn story_for_deleted_profile_is_returned_unsaved() {
        let f = fixture("Too late to save.", Map::new()).await;
        let profile = f.profiles.load(7).await.unwrap().unwrap();
        assert!(f.profiles.delete(7).await.unwrap());

        let outcome = f
            .pipeline
            .generate(7, &Intent::PreviousMoral, profile)
            .await
            .unwrap();
        assert_eq!(outcome.story, "Too late to save.");
        assert!(outcome.saved.is_none());
        assert!(f.profiles.db().list_recent_stories(7, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivered_story_carries_menu() {
        let f = fixture("The end.", Map::new()).await;
        f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap();
        let sent = f.channel.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].text, "The end.");
        assert!(sent[0].has_buttons());
    }

    #[tokio::test]
    async fn cooldown_denies_second_request() {
        let f = fixture("story", Map::new()).await;
        f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap();
        let err = f.pipeline.run(7, 7, Intent::PreviousMoral).await.unwrap_err();
        assert!(matches!(err, GenerationError::RateLimited(_)));
        assert_eq!(f.profiles.load(7).await.unwrap().unwrap().story_total, 1);
    }

    #[tokio::test]
    async fn missing_profile() {
        let f = fixture("story", Map::new()).await;
        let err = f.pipeline.run(99, 99, Intent::RandomMoral).await.unwrap_err();
        assert!(matches!(err, GenerationError::ProfileMissing { user_id: 99 }));
    }

    #[test]
    fn intent_kinds() {
        assert_eq!(Intent::RandomMoral.kind(), IntentKind::RandomMoral);
        assert_eq!(
            Intent::FirstStory { situation: None }.kind(),
            IntentKind::FirstStory
        );
    }
}
