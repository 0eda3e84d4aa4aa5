//! Short-TTL read cache over profiles.
//!
//! Never authoritative: a miss (absent or expired) means the caller reads
//! the repository and calls `set`. Every write path invalidates.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::model::{Profile, UserId};

/// Default time-to-live for cached profiles.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct CacheEntry {
    profile: Profile,
    cached_at: DateTime<Utc>,
}

/// Per-user profile snapshot cache.
pub struct ProfileCache {
    ttl: chrono::Duration,
    entries: RwLock<HashMap<UserId, CacheEntry>>,
}

impl ProfileCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(300)),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, user: UserId) -> Option<Profile> {
        self.get_at(user, Utc::now()).await
    }

    /// Hit only while `now - cached_at < ttl`; an expired entry is dropped.
    pub async fn get_at(&self, user: UserId, now: DateTime<Utc>) -> Option<Profile> {
        {
            let entries = self.entries.read().await;
            match entries.get(&user) {
                Some(entry) if now - entry.cached_at < self.ttl => {
                    return Some(entry.profile.clone());
                }
                Some(_) => {}
                None => return None,
            }
        }

        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&user) {
            if now - entry.cached_at >= self.ttl {
                entries.remove(&user);
                debug!(user_id = user, "Profile cache entry expired");
            }
        }
        None
    }

    pub async fn set(&self, user: UserId, profile: Profile) {
        self.set_at(user, profile, Utc::now()).await;
    }

    pub async fn set_at(&self, user: UserId, profile: Profile, now: DateTime<Utc>) {
        self.entries.write().await.insert(
            user,
            CacheEntry {
                profile,
                cached_at: now,
            },
        );
    }

    pub async fn invalidate(&self, user: UserId) {
        if self.entries.write().await.remove(&user).is_some() {
            debug!(user_id = user, "Profile cache invalidated");
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn prune_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| now - entry.cached_at < self.ttl);
        before - entries.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

impl Default for ProfileCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}
