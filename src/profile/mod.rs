//! Profiles: the durable per-user record and its read-through cache.

pub mod cache;
pub mod model;

use std::sync::Arc;

use tracing::debug;

use crate::error::DatabaseError;
use crate::store::traits::Database;

pub use cache::ProfileCache;
pub use model::{NewProfile, Profile, ProfileField, ProfilePatch, SavedStory, UserId};

/// Read-through access to profiles.
///
/// Reads go cache first, then the database. Every write invalidates the
/// cached entry (whether the write succeeded or not) and re-reads the
/// authoritative row instead of guessing the post-write value.
#[derive(Clone)]
pub struct ProfileStore {
    db: Arc<dyn Database>,
    cache: Arc<ProfileCache>,
}

impl ProfileStore {
    pub fn new(db: Arc<dyn Database>, cache: Arc<ProfileCache>) -> Self {
        Self { db, cache }
    }

    pub fn cache(&self) -> &Arc<ProfileCache> {
        &self.cache
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Cached profile, falling back to the database on a miss.
    pub async fn load(&self, user: UserId) -> Result<Option<Profile>, DatabaseError> {
        if let Some(profile) = self.cache.get(user).await {
            return Ok(Some(profile));
        }
        debug!(user_id = user, "Profile cache miss");
        self.refresh(user).await
    }

    /// Bypass the cache, read the database, and re-populate.
    pub async fn refresh(&self, user: UserId) -> Result<Option<Profile>, DatabaseError> {
        let profile = self.db.get_profile(user).await?;
        match &profile {
            Some(p) => self.cache.set(user, p.clone()).await,
            None => self.cache.invalidate(user).await,
        }
        Ok(profile)
    }

    /// Persist a completed intake. Returns the stored profile and whether it is new.
    pub async fn create(
        &self,
        user: UserId,
        profile: &NewProfile,
    ) -> Result<(Option<Profile>, bool), DatabaseError> {
        let result = self.db.upsert_profile(user, profile).await;
        self.cache.invalidate(user).await;
        let created = result?;
        Ok((self.refresh(user).await?, created))
    }

    /// Apply a whitelisted patch. `None` when the user has no profile.
    pub async fn update(
        &self,
        user: UserId,
        patch: &ProfilePatch,
    ) -> Result<Option<Profile>, DatabaseError> {
        let result = self.db.update_fields(user, patch).await;
        self.cache.invalidate(user).await;
        if !result? {
            return Ok(None);
        }
        self.refresh(user).await
    }

    /// Replace (or clear) the active situation.
    pub async fn set_active_context(
        &self,
        user: UserId,
        context: Option<&str>,
    ) -> Result<Option<Profile>, DatabaseError> {
        let result = self.db.set_active_context(user, context).await;
        self.cache.invalidate(user).await;
        if !result? {
            return Ok(None);
        }
        self.refresh(user).await
    }

    /// Save a generated story; the cached `story_total` is stale afterwards.
    pub async fn record_story(
        &self,
        user: UserId,
        text: &str,
        model: &str,
    ) -> Result<SavedStory, DatabaseError> {
        let result = self.db.save_story(user, text, model).await;
        self.cache.invalidate(user).await;
        result
    }

    pub async fn delete(&self, user: UserId) -> Result<bool, DatabaseError> {
        let result = self.db.delete_profile(user).await;
        self.cache.invalidate(user).await;
        result
    }
}
