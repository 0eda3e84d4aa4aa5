//! `Database` trait — single async interface for all persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::profile::model::{
    ContextEntry, ContextKind, NewProfile, Profile, ProfilePatch, SavedStory, Story, UserId,
};
use crate::stats::model::{DailyStats, StatCounter, StatsSummary};

/// Backend-agnostic database trait covering profiles, stories, contexts, and stats.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), DatabaseError>;

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user: UserId) -> Result<Option<Profile>, DatabaseError>;

    /// Insert or replace the child descriptors for `user`.
    ///
    /// Returns `true` when a new row was created. An existing `active_context`
    /// is only overwritten when `profile.active_context` is `Some`.
    async fn upsert_profile(&self, user: UserId, profile: &NewProfile) -> Result<bool, DatabaseError>;

    /// Apply a whitelisted patch. Returns `false` when the user has no profile.
    async fn update_fields(&self, user: UserId, patch: &ProfilePatch) -> Result<bool, DatabaseError>;

    /// Delete the profile and every story and context row it owns.
    async fn delete_profile(&self, user: UserId) -> Result<bool, DatabaseError>;

    // ── Stories ─────────────────────────────────────────────────────

    /// Persist a story, bump `story_total`, and trim history in one transaction.
    async fn save_story(&self, user: UserId, text: &str, model: &str) -> Result<SavedStory, DatabaseError>;

    /// Most recent stories first.
    async fn list_recent_stories(&self, user: UserId, limit: usize) -> Result<Vec<Story>, DatabaseError>;

    // ── Contexts ────────────────────────────────────────────────────

    /// Replace `active_context`, recording the audit trail.
    ///
    /// `None` clears the field. The previous non-empty value is archived.
    async fn set_active_context(&self, user: UserId, context: Option<&str>) -> Result<bool, DatabaseError>;

    /// Most recent first.
    async fn list_contexts(
        &self,
        user: UserId,
        kind: ContextKind,
        limit: usize,
    ) -> Result<Vec<ContextEntry>, DatabaseError>;

    // ── Stats ───────────────────────────────────────────────────────

    async fn increment_stat(&self, counter: StatCounter) -> Result<(), DatabaseError>;

    /// Most recent days first.
    async fn daily_stats(&self, limit: usize) -> Result<Vec<DailyStats>, DatabaseError>;

    async fn daily_stats_summary(&self) -> Result<StatsSummary, DatabaseError>;
}
