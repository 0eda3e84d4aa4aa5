//! Conversation engine: per-user state machine for intake and the menu flow.
//!
//! Events are classified by [`event::EventParser`], routed through the
//! user's [`state::SessionState`], and terminal leaves hand off to the
//! [`pipeline::GenerationPipeline`]. Session state lives only in memory.

pub mod event;
pub mod menu;
pub mod pipeline;
pub mod prompt;
pub mod state;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use tracing::{debug, error, info, warn};

use crate::channels::{Channel, IncomingEvent, OutgoingMessage};
use crate::error::{ChannelError, Error, GenerationError, SessionError};
use crate::guard::{RateGuard, RateReason};
use crate::profile::{Profile, ProfileField, ProfilePatch, ProfileStore, UserId};
use crate::stats::StatCounter;

use event::{Command, Event, EventParser};
use menu::MenuAction;
use pipeline::{GenerationPipeline, Intent};
use state::{EditMode, IntakeDraft, IntakeStep, Session, SessionState};

pub use pipeline::StoryOutcome;

/// Sessions untouched for this long are dropped.
pub const DEFAULT_SESSION_IDLE: Duration = Duration::from_secs(3600);

const GREETING: &str = "👋 Hi! I write short fables for children, where your child is the hero \
and every story ends with a moral. First, a few questions.";

const HELP: &str = "I write personal fables for your child.\n\n\
/start: set up the profile (or see the menu if it exists)\n\
/menu: show the menu\n\
/cancel: stop the current question\n\
/reset: delete the profile and all stories\n\n\
You can also just write what the next fable should be about.";

const NO_PROFILE: &str = "I don't know your child yet. Send /start to get acquainted.";

const GENERIC_FAILURE: &str = "❌ Something went wrong. Please try again later.";

/// Answers to the situation question that mean "nothing specific".
const NEGATIVE_ANSWERS: &[&str] = &["no", "nope", "none", "nothing", "-", "нет"];

type StepResult = Result<(SessionState, Option<Intent>), Error>;

/// Routes inbound events through per-user sessions.
pub struct ConversationEngine {
    profiles: ProfileStore,
    guard: Arc<RateGuard>,
    pipeline: Arc<GenerationPipeline>,
    channel: Arc<dyn Channel>,
    sessions: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<Session>>>>,
    idle_timeout: chrono::Duration,
}

impl ConversationEngine {
    pub fn new(
        profiles: ProfileStore,
        guard: Arc<RateGuard>,
        pipeline: Arc<GenerationPipeline>,
        channel: Arc<dyn Channel>,
    ) -> Self {
        Self {
            profiles,
            guard,
            pipeline,
            channel,
            sessions: Mutex::new(HashMap::new()),
            idle_timeout: chrono::Duration::seconds(DEFAULT_SESSION_IDLE.as_secs() as i64),
        }
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout =
            chrono::Duration::from_std(timeout).unwrap_or(self.idle_timeout);
        self
    }

    /// Consume the channel's event stream until it ends or Ctrl+C.
    ///
    /// Each event runs on its own task so users never wait on each other.
    pub async fn run(self: Arc<Self>) -> Result<(), ChannelError> {
        let mut events = self.channel.start().await?;
        info!(channel = self.channel.name(), "Conversation engine started");

        loop {
            let event = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
                event = events.next() => match event {
                    Some(e) => e,
                    None => {
                        info!("Channel stream ended, shutting down...");
                        break;
                    }
                },
            };

            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.handle(event).await;
            });
        }

        self.channel.shutdown().await
    }

    /// Process one inbound event to completion, including any generation.
    pub async fn handle(&self, event: IncomingEvent) {
        let user = event.user_id;
        let chat = event.chat_id;

        if let Err(e) = self.channel.acknowledge(&event).await {
            debug!(user_id = user, error = %e, "Acknowledge failed");
        }

        let parsed = EventParser::parse(&event.payload);
        debug!(user_id = user, kind = parsed.kind(), "Event received");

        // Commands stay available while a story is being written; nothing else does.
        if !matches!(parsed, Event::Command(_)) {
            let check = self.guard.can_proceed(user);
            if check.reason == RateReason::InFlight {
                self.reply(chat, OutgoingMessage::text(check.message())).await;
                return;
            }
        }

        let slot = self.session_slot(user);
        let followup = {
            let mut session = slot.lock().await;
            session.touch(Utc::now());
            let current = std::mem::take(&mut session.state);
            let from = current.to_string();

            match self.step(&event, parsed, current).await {
                Ok((next, intent)) => {
                    if next.to_string() != from {
                        info!(user_id = user, from = %from, to = %next, "Session transition");
                    }
                    session.state = next;
                    intent
                }
                Err(e) => {
                    session.state = SessionState::Idle;
                    drop(session);
                    self.report(user, chat, e).await;
                    None
                }
            }
        };

        if let Some(intent) = followup {
            self.generate(user, chat, intent).await;
        }
    }

    /// Current state for a user, `None` when no session exists.
    pub async fn state_of(&self, user: UserId) -> Option<SessionState> {
        let slot = self.lock_sessions().get(&user).cloned()?;
        let session = slot.lock().await;
        Some(session.state.clone())
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    /// Drop sessions idle for longer than the timeout. Busy sessions are kept.
    pub fn prune_idle_sessions_at(&self, now: DateTime<Utc>) -> usize {
        let idle = self.idle_timeout;
        let mut sessions = self.lock_sessions();
        let before = sessions.len();
        sessions.retain(|_, slot| match slot.try_lock() {
            Ok(session) => now - session.touched_at < idle,
            Err(_) => true,
        });
        let pruned = before - sessions.len();
        if pruned > 0 {
            debug!(pruned, "Pruned idle sessions");
        }
        pruned
    }

    pub fn prune_idle_sessions(&self) -> usize {
        self.prune_idle_sessions_at(Utc::now())
    }

    fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<UserId, Arc<tokio::sync::Mutex<Session>>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session_slot(&self, user: UserId) -> Arc<tokio::sync::Mutex<Session>> {
        self.lock_sessions()
            .entry(user)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(Session::new(Utc::now()))))
            .clone()
    }

    // ── Transitions ─────────────────────────────────────────────────

    async fn step(&self, event: &IncomingEvent, parsed: Event, state: SessionState) -> StepResult {
        match (parsed, state) {
            (Event::Command(command), state) => self.on_command(event, command, state).await,
            (Event::Text(text), SessionState::Intake { step, draft }) => {
                self.on_intake_answer(event, &text, step, draft).await
            }
            (Event::Menu(_), SessionState::Intake { step, draft }) => {
                self.reply(
                    event.chat_id,
                    OutgoingMessage::text(format!(
                        "Let's finish getting acquainted first.\n\n{}",
                        step.question()
                    )),
                )
                .await;
                Ok((SessionState::Intake { step, draft }, None))
            }
            (Event::UnknownButton(id), state) => Err(no_transition(&state, &format!("button {id}"))),
            (Event::Menu(action), state) => match self.profiles.load(event.user_id).await? {
                Some(profile) => {
                    if state.is_pending() {
                        debug!(user_id = event.user_id, pending = %state, "Pending prompt pre-empted by menu");
                    }
                    self.on_menu(event, action, state, &profile).await
                }
                None => self.begin_intake(event).await,
            },
            (Event::Text(text), state) => match self.profiles.load(event.user_id).await? {
                Some(profile) => self.on_text(event, text, state, &profile).await,
                None => self.begin_intake(event).await,
            },
        }
    }

    async fn on_command(&self, event: &IncomingEvent, command: Command, state: SessionState) -> StepResult {
        let user = event.user_id;
        let chat = event.chat_id;

        match command {
            Command::Start => {
                self.bump(StatCounter::StartCommands).await;
                match self.profiles.load(user).await? {
                    Some(profile) => {
                        self.reply_with_menu(
                            chat,
                            format!(
                                "Welcome back! What kind of fable shall we write for {} today?",
                                profile.child_names
                            ),
                        )
                        .await;
                        Ok((SessionState::Idle, None))
                    }
                    None => self.begin_intake(event).await,
                }
            }
            Command::Cancel => {
                if state.is_intake() {
                    self.reply(
                        chat,
                        OutgoingMessage::text(
                            "Okay, I've stopped. Nothing was saved. Send /start whenever you're ready.",
                        ),
                    )
                    .await;
                } else if self.profiles.load(user).await?.is_some() {
                    let text = if state.is_pending() { "Cancelled." } else { "Nothing to cancel." };
                    self.reply_with_menu(chat, text).await;
                } else {
                    self.reply(chat, OutgoingMessage::text(NO_PROFILE)).await;
                }
                Ok((SessionState::Idle, None))
            }
            Command::Reset => {
                let text = if self.profiles.delete(user).await? {
                    info!(user_id = user, "Profile reset");
                    "🗑 The profile and all stories were deleted. Send /start to begin again."
                } else {
                    NO_PROFILE
                };
                self.reply(chat, OutgoingMessage::text(text)).await;
                Ok((SessionState::Idle, None))
            }
            Command::Menu | Command::Help => {
                let text = if command == Command::Help { HELP } else { "What shall we do next?" };
                if self.profiles.load(user).await?.is_some() {
                    self.reply_with_menu(chat, text).await;
                    Ok((SessionState::Idle, None))
                } else {
                    self.reply(chat, OutgoingMessage::text(format!("{text}\n\n{NO_PROFILE}")))
                        .await;
                    Ok((state, None))
                }
            }
            Command::Unknown(name) => {
                self.reply(
                    chat,
                    OutgoingMessage::text(format!("I don't know the command {name}. Try /help.")),
                )
                .await;
                Ok((state, None))
            }
        }
    }

    async fn begin_intake(&self, event: &IncomingEvent) -> StepResult {
        let step = IntakeStep::AskName;
        self.reply(
            event.chat_id,
            OutgoingMessage::text(format!("{GREETING}\n\n{}", step.question())),
        )
        .await;
        Ok((
            SessionState::Intake {
                step,
                draft: IntakeDraft::new(event.user_name.clone()),
            },
            None,
        ))
    }

    async fn on_intake_answer(
        &self,
        event: &IncomingEvent,
        answer: &str,
        step: IntakeStep,
        mut draft: IntakeDraft,
    ) -> StepResult {
        if answer.is_empty() {
            self.reply(event.chat_id, OutgoingMessage::text(step.question())).await;
            return Ok((SessionState::Intake { step, draft }, None));
        }

        if let Some(next) = step.next().filter(|next| step.can_transition_to(*next)) {
            draft.record(step, answer);
            self.reply(event.chat_id, OutgoingMessage::text(next.question())).await;
            return Ok((SessionState::Intake { step: next, draft }, None));
        }

        let situation = (!is_negative(answer)).then(|| answer.to_string());
        let new_profile = draft.complete(situation.clone())?;
        let (profile, created) = self.profiles.create(event.user_id, &new_profile).await?;
        self.bump(StatCounter::ProfilesCompleted).await;
        info!(
            user_id = event.user_id,
            created,
            has_situation = situation.is_some(),
            "Intake completed"
        );

        let names = profile.map(|p| p.child_names).unwrap_or(new_profile.child_names);
        self.reply(
            event.chat_id,
            OutgoingMessage::text(format!("Thank you! I'm writing the first fable for {names}...")),
        )
        .await;
        Ok((SessionState::Idle, Some(Intent::FirstStory { situation })))
    }

    async fn on_menu(
        &self,
        event: &IncomingEvent,
        action: MenuAction,
        state: SessionState,
        profile: &Profile,
    ) -> StepResult {
        let user = event.user_id;
        let chat = event.chat_id;

        let next = match action {
            MenuAction::NewDilemma => {
                self.reply(
                    chat,
                    OutgoingMessage::text(
                        "Describe the situation the next fable should help with.",
                    ),
                )
                .await;
                SessionState::AwaitingDilemma
            }
            MenuAction::RandomMoral => {
                return Ok((SessionState::Idle, Some(Intent::RandomMoral)));
            }
            MenuAction::PreviousMoral => {
                if profile.active_context().is_none() {
                    self.reply_with_menu(
                        chat,
                        "There is no previous situation or moral yet. \
                         Pick \"New situation\" or \"Random moral\" first.",
                    )
                    .await;
                    SessionState::Idle
                } else {
                    return Ok((SessionState::Idle, Some(Intent::PreviousMoral)));
                }
            }
            MenuAction::AddTraits => {
                if profile.has_traits() {
                    self.reply(
                        chat,
                        OutgoingMessage::text(format!(
                            "Current traits: {}\n\nWhat should I add?",
                            profile.traits
                        )),
                    )
                    .await;
                    SessionState::AwaitingTraits(EditMode::Append)
                } else {
                    self.reply(
                        chat,
                        OutgoingMessage::text("Describe your child's character."),
                    )
                    .await;
                    SessionState::AwaitingTraits(EditMode::Replace)
                }
            }
            MenuAction::DeleteTraits => {
                if profile.has_traits() {
                    self.update_profile(user, ProfilePatch::new().text(ProfileField::Traits, ""))
                        .await?;
                    self.reply_with_menu(chat, "Traits cleared.").await;
                } else {
                    self.reply_with_menu(chat, "There are no traits to delete.").await;
                }
                SessionState::Idle
            }
            MenuAction::Wishes => {
                let text = match profile.wishes() {
                    Some(wishes) => format!("Your wishes for every story:\n{wishes}"),
                    None => "You have no wishes yet. Wishes apply to every story, \
                             for example \"no scary villains\"."
                        .to_string(),
                };
                self.reply(
                    chat,
                    OutgoingMessage::text(text)
                        .with_buttons(menu::wishes_menu(profile.wishes().is_some())),
                )
                .await;
                SessionState::Idle
            }
            MenuAction::WishesAdd => {
                self.reply(chat, OutgoingMessage::text("Write your wishes for the stories."))
                    .await;
                SessionState::AwaitingWishes(EditMode::Replace)
            }
            MenuAction::WishesAppend => {
                self.reply(chat, OutgoingMessage::text("What should I add to your wishes?"))
                    .await;
                SessionState::AwaitingWishes(EditMode::Append)
            }
            MenuAction::WishesDelete => {
                if profile.wishes().is_some() {
                    self.update_profile(user, ProfilePatch::new().clear(ProfileField::Wishes))
                        .await?;
                    self.reply_with_menu(chat, "Wishes deleted.").await;
                } else {
                    self.reply_with_menu(chat, "There are no wishes to delete.").await;
                }
                SessionState::Idle
            }
            MenuAction::Feedback => {
                self.reply(
                    chat,
                    OutgoingMessage::text("How do you like the fables?")
                        .with_buttons(menu::rating_menu()),
                )
                .await;
                SessionState::AwaitingFeedbackRating
            }
            MenuAction::FeedbackStars(stars) => {
                self.reply(
                    chat,
                    OutgoingMessage::text(format!(
                        "Thank you for {}! Would you like to add a comment? \
                         Write it, or press Skip.",
                        "⭐".repeat(stars as usize)
                    ))
                    .with_buttons(menu::skip_menu()),
                )
                .await;
                SessionState::AwaitingFeedbackComment { stars }
            }
            MenuAction::FeedbackSkip => match state {
                SessionState::AwaitingFeedbackComment { stars } => {
                    self.save_feedback(user, stars, None).await?;
                    self.reply_with_menu(chat, "Thank you for the rating!").await;
                    SessionState::Idle
                }
                other => return Err(no_transition(&other, "feedback_skip")),
            },
        };

        Ok((next, None))
    }

    async fn on_text(
        &self,
        event: &IncomingEvent,
        text: String,
        state: SessionState,
        profile: &Profile,
    ) -> StepResult {
        let user = event.user_id;
        let chat = event.chat_id;

        if text.is_empty() {
            return Ok((state, None));
        }

        match state {
            SessionState::Idle => Ok((SessionState::Idle, Some(Intent::FreeForm(text)))),
            SessionState::AwaitingDilemma => {
                Ok((SessionState::Idle, Some(Intent::NewDilemma(text))))
            }
            SessionState::AwaitingTraits(mode) => {
                let traits = mode.apply(Some(&profile.traits), &text);
                self.update_profile(user, ProfilePatch::new().text(ProfileField::Traits, traits.clone()))
                    .await?;
                self.reply_with_menu(chat, format!("Saved. Traits: {traits}")).await;
                Ok((SessionState::Idle, None))
            }
            SessionState::AwaitingWishes(mode) => {
                let wishes = mode.apply(profile.wishes(), &text);
                self.update_profile(user, ProfilePatch::new().text(ProfileField::Wishes, wishes.clone()))
                    .await?;
                self.reply_with_menu(chat, format!("Saved. Wishes: {wishes}")).await;
                Ok((SessionState::Idle, None))
            }
            SessionState::AwaitingFeedbackComment { stars } => {
                self.save_feedback(user, stars, Some(&text)).await?;
                self.reply_with_menu(chat, "Thank you for the feedback!").await;
                Ok((SessionState::Idle, None))
            }
            other @ (SessionState::AwaitingFeedbackRating | SessionState::Intake { .. }) => {
                Err(no_transition(&other, "text"))
            }
        }
    }

    // ── Effects ─────────────────────────────────────────────────────

    async fn generate(&self, user: UserId, chat: i64, intent: Intent) {
        if let Err(e) = self.pipeline.run(user, chat, intent).await {
            let mut message = OutgoingMessage::text(e.user_message());
            if !matches!(e, GenerationError::ProfileMissing { .. }) {
                message = message.with_buttons(menu::main_menu());
            }
            self.reply(chat, message).await;
        }
    }

    async fn update_profile(&self, user: UserId, patch: ProfilePatch) -> Result<(), Error> {
        if self.profiles.update(user, &patch).await?.is_none() {
            warn!(user_id = user, fields = ?patch.fields(), "Profile vanished before update");
        }
        Ok(())
    }

    /// Feedback is overwritten on every submission; skipping clears the comment.
    async fn save_feedback(&self, user: UserId, stars: u8, comment: Option<&str>) -> Result<(), Error> {
        let patch = ProfilePatch::new().integer(ProfileField::FeedbackRating, i64::from(stars));
        let patch = match comment {
            Some(text) => patch.text(ProfileField::Feedback, text),
            None => patch.clear(ProfileField::Feedback),
        };
        self.update_profile(user, patch).await?;
        info!(user_id = user, stars, has_comment = comment.is_some(), "Feedback saved");
        Ok(())
    }

    async fn bump(&self, counter: StatCounter) {
        if let Err(e) = self.profiles.db().increment_stat(counter).await {
            warn!(counter = counter.column(), error = %e, "Failed to update daily stats");
        }
    }

    async fn report(&self, user: UserId, chat: i64, error: Error) {
        match error {
            Error::Session(e) => {
                warn!(user_id = user, error = %e, "Unhandled event; returning to idle");
                self.reply_with_menu(chat, "I didn't catch that. Here is the menu.").await;
            }
            other => {
                error!(user_id = user, error = %other, "Event handling failed");
                self.reply(chat, OutgoingMessage::text(GENERIC_FAILURE)).await;
            }
        }
    }

    async fn reply_with_menu(&self, chat: i64, text: impl Into<String>) {
        self.reply(chat, OutgoingMessage::text(text).with_buttons(menu::main_menu()))
            .await;
    }

    async fn reply(&self, chat: i64, message: OutgoingMessage) {
        if let Err(e) = self.channel.send(chat, message).await {
            warn!(chat_id = chat, error = %e, "Failed to send reply");
        }
    }
}

fn no_transition(state: &SessionState, event: &str) -> Error {
    SessionError::NoTransition {
        state: state.to_string(),
        event: event.to_string(),
    }
    .into()
}

fn is_negative(answer: &str) -> bool {
    let normalized = answer
        .trim()
        .trim_end_matches(['.', '!'])
        .to_lowercase();
    NEGATIVE_ANSWERS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_answers() {
        assert!(is_negative("no"));
        assert!(is_negative("No."));
        assert!(is_negative(" NONE "));
        assert!(is_negative("Нет"));
        assert!(!is_negative("not sharing toys"));
        assert!(!is_negative("Mia won't say no"));
    }

    #[test]
    fn no_transition_names_state() {
        let err = no_transition(&SessionState::AwaitingFeedbackRating, "text");
        assert_eq!(
            err.to_string(),
            "Session error: No transition from state awaiting_feedback_rating on event text"
        );
    }
}
