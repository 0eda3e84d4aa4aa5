//! Menu actions and the button layouts that trigger them.

use std::str::FromStr;

use crate::channels::MenuButton;

/// A menu selection. Each maps 1:1 to a button id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    NewDilemma,
    RandomMoral,
    PreviousMoral,
    AddTraits,
    DeleteTraits,
    Wishes,
    WishesAdd,
    WishesAppend,
    WishesDelete,
    Feedback,
    FeedbackStars(u8),
    FeedbackSkip,
}

impl MenuAction {
    /// Button id sent back by the transport.
    pub fn id(&self) -> String {
        match self {
            Self::NewDilemma => "story_new_dilemma".into(),
            Self::RandomMoral => "story_random_moral".into(),
            Self::PreviousMoral => "story_previous_moral".into(),
            Self::AddTraits => "traits_add".into(),
            Self::DeleteTraits => "traits_delete".into(),
            Self::Wishes => "wishes".into(),
            Self::WishesAdd => "wishes_add".into(),
            Self::WishesAppend => "wishes_append".into(),
            Self::WishesDelete => "wishes_delete".into(),
            Self::Feedback => "feedback".into(),
            Self::FeedbackStars(n) => format!("feedback_star_{n}"),
            Self::FeedbackSkip => "feedback_skip".into(),
        }
    }

    pub fn button(&self, label: &str) -> MenuButton {
        MenuButton::new(self.id(), label)
    }
}

impl FromStr for MenuAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let action = match s {
            "story_new_dilemma" => Self::NewDilemma,
            "story_random_moral" => Self::RandomMoral,
            "story_previous_moral" => Self::PreviousMoral,
            "traits_add" => Self::AddTraits,
            "traits_delete" => Self::DeleteTraits,
            "wishes" => Self::Wishes,
            "wishes_add" => Self::WishesAdd,
            "wishes_append" => Self::WishesAppend,
            "wishes_delete" => Self::WishesDelete,
            "feedback" => Self::Feedback,
            "feedback_skip" => Self::FeedbackSkip,
            other => {
                let stars = other
                    .strip_prefix("feedback_star_")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| (1..=5).contains(n))
                    .ok_or_else(|| format!("unknown button: {other}"))?;
                Self::FeedbackStars(stars)
            }
        };
        Ok(action)
    }
}

/// The next-action menu shown after every story and on `/menu`.
pub fn main_menu() -> Vec<Vec<MenuButton>> {
    vec![
        vec![MenuAction::NewDilemma.button("📝 New situation")],
        vec![
            MenuAction::RandomMoral.button("🎲 Random moral"),
            MenuAction::PreviousMoral.button("🔁 Same moral again"),
        ],
        vec![
            MenuAction::AddTraits.button("➕ Add traits"),
            MenuAction::DeleteTraits.button("➖ Clear traits"),
        ],
        vec![
            MenuAction::Wishes.button("💭 Wishes"),
            MenuAction::Feedback.button("⭐ Feedback"),
        ],
    ]
}

/// Wishes sub-menu; the available actions depend on whether wishes exist.
pub fn wishes_menu(has_wishes: bool) -> Vec<Vec<MenuButton>> {
    if has_wishes {
        vec![vec![
            MenuAction::WishesAppend.button("➕ Add more"),
            MenuAction::WishesDelete.button("🗑 Delete"),
        ]]
    } else {
        vec![vec![MenuAction::WishesAdd.button("✍️ Write wishes")]]
    }
}

pub fn rating_menu() -> Vec<Vec<MenuButton>> {
    vec![
        (1..=5)
            .map(|n| MenuAction::FeedbackStars(n).button(&"⭐".repeat(n as usize)))
            .collect(),
    ]
}

pub fn skip_menu() -> Vec<Vec<MenuButton>> {
    vec![vec![MenuAction::FeedbackSkip.button("Skip")]]
}
