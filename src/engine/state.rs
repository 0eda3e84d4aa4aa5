//! Per-user conversation state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::profile::NewProfile;

/// The steps of the intake conversation.
///
/// Progresses linearly: AskName → AskAge → AskTraits → AskSituation.
/// Nothing is persisted until the situation answer arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntakeStep {
    AskName,
    AskAge,
    AskTraits,
    AskSituation,
}

impl IntakeStep {
    pub fn can_transition_to(&self, target: IntakeStep) -> bool {
        use IntakeStep::*;
        matches!(
            (self, target),
            (AskName, AskAge) | (AskAge, AskTraits) | (AskTraits, AskSituation)
        )
    }

    /// The answer to this step completes the intake.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AskSituation)
    }

    pub fn next(&self) -> Option<IntakeStep> {
        use IntakeStep::*;
        match self {
            AskName => Some(AskAge),
            AskAge => Some(AskTraits),
            AskTraits => Some(AskSituation),
            AskSituation => None,
        }
    }

    /// The question asked when entering this step.
    pub fn question(&self) -> &'static str {
        match self {
            Self::AskName => "What is your child's name? If there are several children, list them all.",
            Self::AskAge => "How old is the child?",
            Self::AskTraits => {
                "Tell me a little about their character: what they love, what they find hard."
            }
            Self::AskSituation => {
                "Is there a situation you'd like the fable to help with? \
                 Describe it, or answer \"no\"."
            }
        }
    }
}

impl std::fmt::Display for IntakeStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AskName => "ask_name",
            Self::AskAge => "ask_age",
            Self::AskTraits => "ask_traits",
            Self::AskSituation => "ask_situation",
        };
        write!(f, "{s}")
    }
}

/// Answers collected so far during intake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeDraft {
    pub display_name: Option<String>,
    pub child_names: Option<String>,
    pub age: Option<String>,
    pub traits: Option<String>,
}

impl IntakeDraft {
    pub fn new(display_name: Option<String>) -> Self {
        Self {
            display_name,
            ..Default::default()
        }
    }

    /// Record the answer for a non-final step.
    pub fn record(&mut self, step: IntakeStep, answer: &str) {
        let answer = Some(answer.trim().to_string());
        match step {
            IntakeStep::AskName => self.child_names = answer,
            IntakeStep::AskAge => self.age = answer,
            IntakeStep::AskTraits => self.traits = answer,
            IntakeStep::AskSituation => {}
        }
    }

    /// Finish the intake with the situation answer.
    pub fn complete(self, situation: Option<String>) -> Result<NewProfile, SessionError> {
        Ok(NewProfile {
            display_name: self.display_name,
            child_names: self.child_names.ok_or(SessionError::IncompleteIntake("child_names"))?,
            age: self.age.ok_or(SessionError::IncompleteIntake("age"))?,
            traits: self.traits.ok_or(SessionError::IncompleteIntake("traits"))?,
            active_context: situation,
        })
    }
}

/// How a free-text answer is merged into an existing field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditMode {
    Replace,
    Append,
}

impl EditMode {
    /// Merge `answer` into `current` according to the mode.
    pub fn apply(&self, current: Option<&str>, answer: &str) -> String {
        let answer = answer.trim();
        match (self, current.map(str::trim).filter(|c| !c.is_empty())) {
            (Self::Append, Some(current)) => format!("{current}, {answer}"),
            _ => answer.to_string(),
        }
    }
}

/// What the engine is waiting for from a user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Idle,
    Intake {
        step: IntakeStep,
        draft: IntakeDraft,
    },
    AwaitingDilemma,
    AwaitingTraits(EditMode),
    AwaitingWishes(EditMode),
    AwaitingFeedbackRating,
    AwaitingFeedbackComment {
        stars: u8,
    },
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn is_intake(&self) -> bool {
        matches!(self, Self::Intake { .. })
    }

    /// Waiting for a free-text answer outside of intake.
    pub fn is_pending(&self) -> bool {
        !self.is_idle() && !self.is_intake()
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Intake { step, .. } => write!(f, "{step}"),
            Self::AwaitingDilemma => write!(f, "awaiting_dilemma"),
            Self::AwaitingTraits(EditMode::Replace) => write!(f, "asking_traits"),
            Self::AwaitingTraits(EditMode::Append) => write!(f, "asking_traits_addition"),
            Self::AwaitingWishes(EditMode::Replace) => write!(f, "asking_wishes"),
            Self::AwaitingWishes(EditMode::Append) => write!(f, "asking_wishes_addition"),
            Self::AwaitingFeedbackRating => write!(f, "awaiting_feedback_rating"),
            Self::AwaitingFeedbackComment { .. } => write!(f, "awaiting_feedback_comment"),
        }
    }
}

/// One user's conversation slot.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    pub touched_at: DateTime<Utc>,
}

impl Session {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            state: SessionState::Idle,
            touched_at: now,
        }
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.touched_at = now;
    }
}
