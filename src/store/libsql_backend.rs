//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; multi-statement writes run inside a transaction guarded by
//! `write_lock` so concurrent tasks never interleave statements into
//! someone else's transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::profile::model::{
    ContextEntry, ContextKind, FieldValue, NewProfile, Profile, ProfilePatch, SavedStory, Story,
    UserId,
};
use crate::stats::model::{DailyStats, StatCounter, StatsSummary};
use crate::store::history::HistoryTrimmer;
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
    trimmer: HistoryTrimmer,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to enable foreign keys: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
            trimmer: HistoryTrimmer::default(),
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Override how many stories and archived contexts are kept per user.
    pub fn with_history_keep(mut self, keep: usize) -> Self {
        self.trimmer = HistoryTrimmer::new(keep);
        self
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin(&self) -> Result<Transaction, DatabaseError> {
        self.conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("begin: {e}")))
    }
}

/// Commit on success, roll back on failure.
async fn finish<T>(tx: Transaction, result: Result<T, DatabaseError>) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Transaction(format!("commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(error = %rb, "Rollback failed");
            }
            Err(e)
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format. Microsecond precision with a `Z` suffix keeps
/// lexical order equal to chronological order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn today() -> String {
    Utc::now().date_naive().format("%Y-%m-%d").to_string()
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn field_value(value: &FieldValue) -> libsql::Value {
    match value {
        FieldValue::Text(s) => libsql::Value::Text(s.clone()),
        FieldValue::Integer(i) => libsql::Value::Integer(*i),
        FieldValue::Null => libsql::Value::Null,
    }
}

const PROFILE_COLUMNS: &str = "user_id, display_name, child_names, age, traits, active_context, wishes, feedback, feedback_rating, story_total, created_at, updated_at";

/// Map a libsql Row to a Profile. Column order matches PROFILE_COLUMNS.
fn row_to_profile(row: &libsql::Row) -> Result<Profile, libsql::Error> {
    let created_str: String = row.get(10)?;
    let updated_str: String = row.get(11)?;

    Ok(Profile {
        user_id: row.get(0)?,
        display_name: row.get::<String>(1).ok(),
        child_names: row.get(2)?,
        age: row.get(3)?,
        traits: row.get::<String>(4).unwrap_or_default(),
        active_context: row.get::<String>(5).ok(),
        wishes: row.get::<String>(6).ok(),
        feedback: row.get::<String>(7).ok(),
        feedback_rating: row
            .get::<i64>(8)
            .ok()
            .and_then(|v| u8::try_from(v).ok()),
        story_total: row.get(9)?,
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

const STORY_COLUMNS: &str = "id, owner_id, text, model, created_at";

fn row_to_story(row: &libsql::Row) -> Result<Story, libsql::Error> {
    let created_str: String = row.get(4)?;
    Ok(Story {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        text: row.get(2)?,
        model: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_context(row: &libsql::Row) -> Result<ContextEntry, libsql::Error> {
    let kind_str: String = row.get(2)?;
    let created_str: String = row.get(4)?;
    Ok(ContextEntry {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: kind_str.parse().unwrap_or(ContextKind::Archived),
        content: row.get(3)?,
        created_at: parse_datetime(&created_str),
    })
}

fn row_to_daily(row: &libsql::Row) -> Result<DailyStats, libsql::Error> {
    Ok(DailyStats {
        date: row.get(0)?,
        stories_count: row.get(1)?,
        new_users_count: row.get(2)?,
        start_command_count: row.get(3)?,
        profile_completed_count: row.get(4)?,
    })
}

// ── Statement helpers (usable inside a transaction) ─────────────────

async fn read_active_context(
    conn: &Connection,
    user: UserId,
) -> Result<Option<Option<String>>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT active_context FROM users WHERE user_id = ?1",
            params![user],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("read_active_context: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row.get::<String>(0).ok())),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("read_active_context: {e}"))),
    }
}

async fn bump_stat(conn: &Connection, counter: StatCounter) -> Result<(), DatabaseError> {
    let col = counter.column();
    conn.execute(
        &format!(
            "INSERT INTO daily_stats (date, {col}) VALUES (?1, 1)
             ON CONFLICT(date) DO UPDATE SET {col} = {col} + 1"
        ),
        params![today()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("increment_stat: {e}")))?;
    Ok(())
}

impl LibSqlBackend {
    /// Append audit rows for an `active_context` change and trim them.
    async fn record_context_change(
        &self,
        conn: &Connection,
        user: UserId,
        previous: Option<&str>,
        next: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let previous = previous.map(str::trim).filter(|p| !p.is_empty());
        let next = next.map(str::trim).filter(|n| !n.is_empty());
        if previous == next {
            return Ok(());
        }

        let now = timestamp(Utc::now());
        if let Some(prev) = previous {
            conn.execute(
                "INSERT INTO contexts (owner_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user, ContextKind::Archived.as_str(), prev, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("archive_context: {e}")))?;
        }
        if let Some(next) = next {
            conn.execute(
                "INSERT INTO contexts (owner_id, kind, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![user, ContextKind::Active.as_str(), next, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_context: {e}")))?;
        }

        self.trimmer
            .trim_contexts(conn, user, ContextKind::Archived)
            .await?;
        self.trimmer
            .trim_contexts(conn, user, ContextKind::Active)
            .await?;
        Ok(())
    }

    async fn upsert_profile_tx(
        &self,
        conn: &Connection,
        user: UserId,
        profile: &NewProfile,
    ) -> Result<bool, DatabaseError> {
        let now = timestamp(Utc::now());
        let previous = read_active_context(conn, user).await?;

        match previous {
            None => {
                conn.execute(
                    "INSERT INTO users (user_id, display_name, child_names, age, traits, active_context, story_total, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
                    params![
                        user,
                        opt_text(profile.display_name.as_deref()),
                        profile.child_names.as_str(),
                        profile.age.as_str(),
                        profile.traits.as_str(),
                        opt_text(profile.active_context.as_deref()),
                        now,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_profile insert: {e}")))?;

                self.record_context_change(conn, user, None, profile.active_context.as_deref())
                    .await?;
                bump_stat(conn, StatCounter::NewUsers).await?;
                Ok(true)
            }
            Some(previous) => {
                conn.execute(
                    "UPDATE users SET display_name = COALESCE(?2, display_name), child_names = ?3,
                     age = ?4, traits = ?5, updated_at = ?6 WHERE user_id = ?1",
                    params![
                        user,
                        opt_text(profile.display_name.as_deref()),
                        profile.child_names.as_str(),
                        profile.age.as_str(),
                        profile.traits.as_str(),
                        now,
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("upsert_profile update: {e}")))?;

                if let Some(ctx) = profile.active_context.as_deref() {
                    conn.execute(
                        "UPDATE users SET active_context = ?2 WHERE user_id = ?1",
                        params![user, ctx],
                    )
                    .await
                    .map_err(|e| DatabaseError::Query(format!("upsert_profile context: {e}")))?;
                    self.record_context_change(conn, user, previous.as_deref(), Some(ctx))
                        .await?;
                }
                Ok(false)
            }
        }
    }

    async fn update_fields_tx(
        &self,
        conn: &Connection,
        user: UserId,
        patch: &ProfilePatch,
    ) -> Result<bool, DatabaseError> {
        let Some(previous_context) = read_active_context(conn, user).await? else {
            return Ok(false);
        };

        let mut assignments = Vec::with_capacity(patch.len() + 1);
        let mut values = Vec::with_capacity(patch.len() + 2);
        let mut next_context: Option<Option<&str>> = None;

        for (field, value) in patch.iter() {
            values.push(field_value(value));
            assignments.push(format!("{} = ?{}", field.column(), values.len()));
            if *field == crate::profile::model::ProfileField::ActiveContext {
                next_context = Some(match value {
                    FieldValue::Text(s) => Some(s.as_str()),
                    _ => None,
                });
            }
        }
        values.push(libsql::Value::Text(timestamp(Utc::now())));
        assignments.push(format!("updated_at = ?{}", values.len()));
        values.push(libsql::Value::Integer(user));

        let sql = format!(
            "UPDATE users SET {} WHERE user_id = ?{}",
            assignments.join(", "),
            values.len()
        );
        conn.execute(&sql, libsql::params::Params::Positional(values))
            .await
            .map_err(|e| DatabaseError::Query(format!("update_fields: {e}")))?;

        if let Some(next) = next_context {
            self.record_context_change(conn, user, previous_context.as_deref(), next)
                .await?;
        }
        Ok(true)
    }

    async fn save_story_tx(
        &self,
        conn: &Connection,
        user: UserId,
        text: &str,
        model: &str,
    ) -> Result<SavedStory, DatabaseError> {
        let now = timestamp(Utc::now());

        let touched = conn
            .execute(
                "UPDATE users SET story_total = story_total + 1, updated_at = ?2 WHERE user_id = ?1",
                params![user, now.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_story counter: {e}")))?;
        if touched == 0 {
            return Err(DatabaseError::NotFound {
                entity: "profile".into(),
                id: user.to_string(),
            });
        }

        conn.execute(
            "INSERT INTO stories (owner_id, text, model, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![user, text, model, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_story insert: {e}")))?;
        let story_id = conn.last_insert_rowid();

        let trimmed = self.trimmer.trim_stories(conn, user).await?;
        bump_stat(conn, StatCounter::Stories).await?;

        let mut rows = conn
            .query(
                "SELECT story_total FROM users WHERE user_id = ?1",
                params![user],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_story total: {e}")))?;
        let story_total = match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map_err(|e| DatabaseError::Query(format!("save_story total parse: {e}")))?,
            Ok(None) => 0,
            Err(e) => return Err(DatabaseError::Query(format!("save_story total: {e}"))),
        };

        Ok(SavedStory {
            story_id,
            story_total,
            trimmed,
        })
    }

    async fn set_active_context_tx(
        &self,
        conn: &Connection,
        user: UserId,
        context: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        let Some(previous) = read_active_context(conn, user).await? else {
            return Ok(false);
        };

        conn.execute(
            "UPDATE users SET active_context = ?2, updated_at = ?3 WHERE user_id = ?1",
            params![user, opt_text(context), timestamp(Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_active_context: {e}")))?;

        self.record_context_change(conn, user, previous.as_deref(), context)
            .await?;
        Ok(true)
    }

    async fn delete_profile_tx(&self, conn: &Connection, user: UserId) -> Result<bool, DatabaseError> {
        // Explicit deletes so the cascade holds even without foreign key enforcement.
        conn.execute("DELETE FROM stories WHERE owner_id = ?1", params![user])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_profile stories: {e}")))?;
        conn.execute("DELETE FROM contexts WHERE owner_id = ?1", params![user])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_profile contexts: {e}")))?;
        let deleted = conn
            .execute("DELETE FROM users WHERE user_id = ?1", params![user])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_profile: {e}")))?;
        Ok(deleted > 0)
    }
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Profiles ────────────────────────────────────────────────────

    async fn get_profile(&self, user: UserId) -> Result<Option<Profile>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {PROFILE_COLUMNS} FROM users WHERE user_id = ?1"),
                params![user],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_profile: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let profile = row_to_profile(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_profile row parse: {e}")))?;
                Ok(Some(profile))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_profile: {e}"))),
        }
    }

    async fn upsert_profile(&self, user: UserId, profile: &NewProfile) -> Result<bool, DatabaseError> {
        let _lock = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = self.upsert_profile_tx(&tx, user, profile).await;
        let created = finish(tx, result).await?;
        debug!(user_id = user, created, "Profile upserted");
        Ok(created)
    }

    async fn update_fields(&self, user: UserId, patch: &ProfilePatch) -> Result<bool, DatabaseError> {
        if patch.is_empty() {
            return Ok(self.get_profile(user).await?.is_some());
        }
        let _lock = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = self.update_fields_tx(&tx, user, patch).await;
        let updated = finish(tx, result).await?;
        debug!(user_id = user, fields = ?patch.fields(), updated, "Profile fields updated");
        Ok(updated)
    }

    async fn delete_profile(&self, user: UserId) -> Result<bool, DatabaseError> {
        let _lock = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = self.delete_profile_tx(&tx, user).await;
        let deleted = finish(tx, result).await?;
        info!(user_id = user, deleted, "Profile deleted");
        Ok(deleted)
    }

    // ── Stories ─────────────────────────────────────────────────────

    async fn save_story(&self, user: UserId, text: &str, model: &str) -> Result<SavedStory, DatabaseError> {
        let _lock = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = self.save_story_tx(&tx, user, text, model).await;
        let saved = finish(tx, result).await?;
        debug!(
            user_id = user,
            story_id = saved.story_id,
            story_total = saved.story_total,
            trimmed = saved.trimmed,
            "Story saved"
        );
        Ok(saved)
    }

    async fn list_recent_stories(&self, user: UserId, limit: usize) -> Result<Vec<Story>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {STORY_COLUMNS} FROM stories WHERE owner_id = ?1
                     ORDER BY created_at DESC, id DESC LIMIT ?2"
                ),
                params![user, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_stories: {e}")))?;

        let mut stories = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_recent_stories: {e}")))?
        {
            stories.push(
                row_to_story(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_recent_stories row parse: {e}")))?,
            );
        }
        Ok(stories)
    }

    // ── Contexts ────────────────────────────────────────────────────

    async fn set_active_context(&self, user: UserId, context: Option<&str>) -> Result<bool, DatabaseError> {
        let _lock = self.write_lock.lock().await;
        let tx = self.begin().await?;
        let result = self.set_active_context_tx(&tx, user, context).await;
        let updated = finish(tx, result).await?;
        debug!(user_id = user, cleared = context.is_none(), updated, "Active context set");
        Ok(updated)
    }

    async fn list_contexts(
        &self,
        user: UserId,
        kind: ContextKind,
        limit: usize,
    ) -> Result<Vec<ContextEntry>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, owner_id, kind, content, created_at FROM contexts
                 WHERE owner_id = ?1 AND kind = ?2
                 ORDER BY created_at DESC, id DESC LIMIT ?3",
                params![user, kind.as_str(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_contexts: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_contexts: {e}")))?
        {
            entries.push(
                row_to_context(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_contexts row parse: {e}")))?,
            );
        }
        Ok(entries)
    }

    // ── Stats ───────────────────────────────────────────────────────

    async fn increment_stat(&self, counter: StatCounter) -> Result<(), DatabaseError> {
        let _lock = self.write_lock.lock().await;
        bump_stat(self.conn(), counter).await
    }

    async fn daily_stats(&self, limit: usize) -> Result<Vec<DailyStats>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT date, stories_count, new_users_count, start_command_count, profile_completed_count
                 FROM daily_stats ORDER BY date DESC LIMIT ?1",
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("daily_stats: {e}")))?;

        let mut days = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("daily_stats: {e}")))?
        {
            days.push(
                row_to_daily(&row)
                    .map_err(|e| DatabaseError::Query(format!("daily_stats row parse: {e}")))?,
            );
        }
        Ok(days)
    }

    async fn daily_stats_summary(&self) -> Result<StatsSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(stories_count), 0), COALESCE(SUM(new_users_count), 0),
                        COALESCE(SUM(start_command_count), 0), COALESCE(SUM(profile_completed_count), 0)
                 FROM daily_stats",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("daily_stats_summary: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let get = |i: i32| {
                    row.get::<i64>(i).map_err(|e| {
                        DatabaseError::Query(format!("daily_stats_summary row parse: {e}"))
                    })
                };
                Ok(StatsSummary {
                    days: get(0)?,
                    stories: get(1)?,
                    new_users: get(2)?,
                    start_commands: get(3)?,
                    profiles_completed: get(4)?,
                })
            }
            Ok(None) => Ok(StatsSummary::default()),
            Err(e) => Err(DatabaseError::Query(format!("daily_stats_summary: {e}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::model::ProfileField;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn new_profile(context: Option<&str>) -> NewProfile {
        NewProfile {
            display_name: Some("Anna".into()),
            child_names: "Mia".into(),
            age: "7".into(),
            traits: "curious".into(),
            active_context: context.map(String::from),
        }
    }

    // ── Profile tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_reports_creation_once() {
        let db = test_db().await;
        assert!(db.upsert_profile(1, &new_profile(None)).await.unwrap());
        assert!(!db.upsert_profile(1, &new_profile(None)).await.unwrap());

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.child_names, "Mia");
        assert_eq!(profile.story_total, 0);
        assert_eq!(profile.active_context, None);
    }

    #[tokio::test]
    async fn upsert_without_context_keeps_existing_one() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(Some("won't share toys")))
            .await
            .unwrap();
        db.upsert_profile(1, &new_profile(None)).await.unwrap();

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.active_context.as_deref(), Some("won't share toys"));
    }

    #[tokio::test]
    async fn get_profile_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_profile(99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_fields_applies_patch() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(None)).await.unwrap();

        let patch = ProfilePatch::new()
            .text(ProfileField::Traits, "brave")
            .integer(ProfileField::FeedbackRating, 4)
            .clear(ProfileField::DisplayName);
        assert!(db.update_fields(1, &patch).await.unwrap());

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.traits, "brave");
        assert_eq!(profile.feedback_rating, Some(4));
        assert_eq!(profile.display_name, None);
    }

    #[tokio::test]
    async fn update_fields_for_missing_profile_is_false() {
        let db = test_db().await;
        let patch = ProfilePatch::new().text(ProfileField::Traits, "brave");
        assert!(!db.update_fields(5, &patch).await.unwrap());
        assert!(db.get_profile(5).await.unwrap().is_none());
    }

    // ── Story tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn save_story_without_profile_is_not_found() {
        let db = test_db().await;
        let err = db.save_story(1, "once upon a time", "test").await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
        assert!(db.list_recent_stories(1, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn save_story_counts_and_trims() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(None)).await.unwrap();

        let mut last = None;
        for i in 0..7 {
            last = Some(db.save_story(1, &format!("story {i}"), "test").await.unwrap());
        }
        let last = last.unwrap();
        assert_eq!(last.story_total, 7);
        assert_eq!(last.trimmed, 1);

        let stories = db.list_recent_stories(1, 10).await.unwrap();
        let texts: Vec<_> = stories.iter().map(|s| s.text.as_str()).collect();
        assert_eq!(texts, vec!["story 6", "story 5", "story 4", "story 3", "story 2"]);

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.story_total, 7);
    }

    #[tokio::test]
    async fn custom_history_keep() {
        let db = test_db().await.with_history_keep(2);
        db.upsert_profile(1, &new_profile(None)).await.unwrap();
        for i in 0..4 {
            db.save_story(1, &format!("story {i}"), "test").await.unwrap();
        }
        assert_eq!(db.list_recent_stories(1, 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_cascades_to_stories_and_contexts() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(Some("first"))).await.unwrap();
        db.set_active_context(1, Some("second")).await.unwrap();
        db.save_story(1, "story", "test").await.unwrap();

        assert!(db.delete_profile(1).await.unwrap());
        assert!(!db.delete_profile(1).await.unwrap());

        assert!(db.get_profile(1).await.unwrap().is_none());
        assert!(db.list_recent_stories(1, 10).await.unwrap().is_empty());
        assert!(db
            .list_contexts(1, ContextKind::Archived, 10)
            .await
            .unwrap()
            .is_empty());
    }

    // ── Context tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn context_changes_are_archived_and_bounded() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(None)).await.unwrap();

        for i in 0..8 {
            assert!(db.set_active_context(1, Some(&format!("moral {i}"))).await.unwrap());
        }

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.active_context.as_deref(), Some("moral 7"));

        let archived = db.list_contexts(1, ContextKind::Archived, 10).await.unwrap();
        assert_eq!(archived.len(), 5);
        assert_eq!(archived[0].content, "moral 6");

        let active = db.list_contexts(1, ContextKind::Active, 1).await.unwrap();
        assert_eq!(active[0].content, "moral 7");
    }

    #[tokio::test]
    async fn clearing_context_archives_previous() {
        let db = test_db().await;
        db.upsert_profile(1, &new_profile(Some("bedtime fights"))).await.unwrap();
        db.set_active_context(1, None).await.unwrap();

        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.active_context, None);

        let archived = db.list_contexts(1, ContextKind::Archived, 10).await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].content, "bedtime fights");
    }

    #[tokio::test]
    async fn set_context_for_missing_profile_is_false() {
        let db = test_db().await;
        assert!(!db.set_active_context(3, Some("x")).await.unwrap());
    }

    // ── Stats tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_accumulate_per_day() {
        let db = test_db().await;
        db.increment_stat(StatCounter::StartCommands).await.unwrap();
        db.increment_stat(StatCounter::StartCommands).await.unwrap();
        db.upsert_profile(1, &new_profile(None)).await.unwrap();
        db.save_story(1, "story", "test").await.unwrap();

        let days = db.daily_stats(7).await.unwrap();
        assert_eq!(days.len(), 1);
        assert_eq!(days[0].start_command_count, 2);
        assert_eq!(days[0].new_users_count, 1);
        assert_eq!(days[0].stories_count, 1);

        let summary = db.daily_stats_summary().await.unwrap();
        assert_eq!(summary.days, 1);
        assert_eq!(summary.stories, 1);
    }

    #[tokio::test]
    async fn empty_summary_is_zero() {
        let db = test_db().await;
        assert_eq!(db.daily_stats_summary().await.unwrap(), StatsSummary::default());
    }

    #[tokio::test]
    async fn local_file_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fable.db");

        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_profile(1, &new_profile(None)).await.unwrap();
            db.save_story(1, "kept", "test").await.unwrap();
        }

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let profile = db.get_profile(1).await.unwrap().unwrap();
        assert_eq!(profile.story_total, 1);
    }
}
