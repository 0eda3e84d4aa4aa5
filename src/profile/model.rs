//! Profile, story, and context records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

/// Opaque numeric end-user id (the chat platform's user id).
pub type UserId = i64;

/// Durable per-user record: child descriptors, situation, wishes, feedback,
/// and the story counter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: UserId,
    pub display_name: Option<String>,
    /// Free text, may name several children.
    pub child_names: String,
    /// Free text, not necessarily numeric ("7", "5 and 8", "almost six").
    pub age: String,
    pub traits: String,
    pub active_context: Option<String>,
    pub wishes: Option<String>,
    pub feedback: Option<String>,
    pub feedback_rating: Option<u8>,
    pub story_total: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Profile {
    /// The current situation, if one is set and non-blank.
    pub fn active_context(&self) -> Option<&str> {
        non_blank(self.active_context.as_deref())
    }

    /// Standing wishes, if any.
    pub fn wishes(&self) -> Option<&str> {
        non_blank(self.wishes.as_deref())
    }

    pub fn has_traits(&self) -> bool {
        !self.traits.trim().is_empty()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// A complete intake result, ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub display_name: Option<String>,
    pub child_names: String,
    pub age: String,
    pub traits: String,
    pub active_context: Option<String>,
}

/// The closed set of profile fields that may be patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfileField {
    DisplayName,
    ChildNames,
    Age,
    Traits,
    ActiveContext,
    Wishes,
    Feedback,
    FeedbackRating,
}

impl ProfileField {
    /// Column name in the `users` table.
    pub fn column(&self) -> &'static str {
        match self {
            Self::DisplayName => "display_name",
            Self::ChildNames => "child_names",
            Self::Age => "age",
            Self::Traits => "traits",
            Self::ActiveContext => "active_context",
            Self::Wishes => "wishes",
            Self::Feedback => "feedback",
            Self::FeedbackRating => "feedback_rating",
        }
    }
}

impl FromStr for ProfileField {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "display_name" => Ok(Self::DisplayName),
            "child_names" => Ok(Self::ChildNames),
            "age" => Ok(Self::Age),
            "traits" => Ok(Self::Traits),
            "active_context" => Ok(Self::ActiveContext),
            "wishes" => Ok(Self::Wishes),
            "feedback" => Ok(Self::Feedback),
            "feedback_rating" => Ok(Self::FeedbackRating),
            other => Err(SessionError::UnknownField(other.to_string())),
        }
    }
}

/// Value written into a profile column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Null,
}

/// An ordered set of whitelisted field updates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilePatch {
    changes: Vec<(ProfileField, FieldValue)>,
}

impl ProfilePatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a text field. A later update to the same field replaces the earlier one.
    pub fn text(self, field: ProfileField, value: impl Into<String>) -> Self {
        self.with(field, FieldValue::Text(value.into()))
    }

    pub fn integer(self, field: ProfileField, value: i64) -> Self {
        self.with(field, FieldValue::Integer(value))
    }

    pub fn clear(self, field: ProfileField) -> Self {
        self.with(field, FieldValue::Null)
    }

    fn with(mut self, field: ProfileField, value: FieldValue) -> Self {
        self.changes.retain(|(f, _)| *f != field);
        self.changes.push((field, value));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(ProfileField, FieldValue)> {
        self.changes.iter()
    }

    pub fn fields(&self) -> Vec<&'static str> {
        self.changes.iter().map(|(f, _)| f.column()).collect()
    }

    /// Build a patch from the router's loose key/value map.
    ///
    /// Only child descriptors may be changed this way. Unknown or disallowed
    /// keys, nulls, and blank strings are skipped; skipped keys are returned
    /// so the caller can log them.
    pub fn from_router_map(map: &serde_json::Map<String, serde_json::Value>) -> (Self, Vec<String>) {
        let mut patch = Self::new();
        let mut rejected = Vec::new();

        for (key, value) in map {
            let field = match key.parse::<ProfileField>() {
                Ok(f @ (ProfileField::ChildNames | ProfileField::Age | ProfileField::Traits)) => f,
                _ => {
                    rejected.push(key.clone());
                    continue;
                }
            };
            let text = match value {
                serde_json::Value::String(s) => s.trim().to_string(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if !text.is_empty() {
                patch = patch.text(field, text);
            }
        }

        (patch, rejected)
    }
}

/// A persisted story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Story {
    pub id: i64,
    pub owner_id: UserId,
    pub text: String,
    /// Which generator produced the text.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

/// Result of persisting a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedStory {
    pub story_id: i64,
    pub story_total: i64,
    /// Rows removed by the retention trim.
    pub trimmed: usize,
}

/// Kind of a context audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextKind {
    Active,
    Archived,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
        }
    }
}

impl FromStr for ContextKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            other => Err(format!("unknown context kind: {other}")),
        }
    }
}

impl std::fmt::Display for ContextKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the context audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextEntry {
    pub id: i64,
    pub owner_id: UserId,
    pub kind: ContextKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        let now = Utc::now();
        Profile {
            user_id: 1,
            display_name: None,
            child_names: "Mia".into(),
            age: "7".into(),
            traits: "curious".into(),
            active_context: Some("   ".into()),
            wishes: None,
            feedback: None,
            feedback_rating: None,
            story_total: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn blank_context_reads_as_none() {
        let p = profile();
        assert_eq!(p.active_context(), None);
        assert_eq!(p.wishes(), None);
        assert!(p.has_traits());
    }

    #[test]
    fn field_names_round_trip() {
        for field in [
            ProfileField::DisplayName,
            ProfileField::ChildNames,
            ProfileField::Age,
            ProfileField::Traits,
            ProfileField::ActiveContext,
            ProfileField::Wishes,
            ProfileField::Feedback,
            ProfileField::FeedbackRating,
        ] {
            assert_eq!(field.column().parse::<ProfileField>().unwrap(), field);
        }
    }

    #[test]
    fn unknown_field_is_rejected() {
        let err = "story_total".parse::<ProfileField>().unwrap_err();
        assert!(matches!(err, SessionError::UnknownField(ref k) if k == "story_total"));
    }

    #[test]
    fn later_update_to_same_field_wins() {
        let patch = ProfilePatch::new()
            .text(ProfileField::Traits, "shy")
            .text(ProfileField::Age, "6")
            .text(ProfileField::Traits, "brave");
        assert_eq!(patch.len(), 2);
        assert_eq!(patch.fields(), vec!["age", "traits"]);
    }

    #[test]
    fn router_map_keeps_only_child_descriptors() {
        let map = serde_json::json!({
            "age": 6,
            "traits": "stubborn",
            "child_names": null,
            "story_total": "100",
            "last_user_message": "hi",
        });
        let (patch, mut rejected) = ProfilePatch::from_router_map(map.as_object().unwrap());
        rejected.sort();

        assert_eq!(patch.len(), 2);
        assert!(patch
            .iter()
            .any(|(f, v)| *f == ProfileField::Age && *v == FieldValue::Text("6".into())));
        assert_eq!(rejected, vec!["last_user_message", "story_total"]);
    }
}
