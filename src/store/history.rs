//! Keep-last-N retention for stories and archived contexts.
//!
//! Trims run on the same connection (usually an open transaction) as the
//! insert that triggered them, so insert and trim commit together.

use libsql::{Connection, params};
use tracing::debug;

use crate::error::DatabaseError;
use crate::profile::model::{ContextKind, UserId};

/// Default number of rows kept per owner.
pub const DEFAULT_KEEP: usize = 5;

/// Deletes the oldest rows beyond `keep` for one owner.
///
/// Ordering is `created_at DESC, id DESC`, so rows with equal timestamps
/// are ranked by insertion id and the result is deterministic.
#[derive(Debug, Clone, Copy)]
pub struct HistoryTrimmer {
    keep: usize,
}

impl HistoryTrimmer {
    pub fn new(keep: usize) -> Self {
        Self { keep }
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    /// Trim an owner's stories. Returns the number of rows deleted.
    pub async fn trim_stories(&self, conn: &Connection, owner: UserId) -> Result<usize, DatabaseError> {
        let ids = ranked_ids(
            conn,
            "SELECT id FROM stories WHERE owner_id = ?1 ORDER BY created_at DESC, id DESC",
            params![owner],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("trim_stories: {e}")))?;

        let mut deleted = 0;
        for id in ids.iter().skip(self.keep) {
            deleted += conn
                .execute("DELETE FROM stories WHERE id = ?1", params![*id])
                .await
                .map_err(|e| DatabaseError::Query(format!("trim_stories delete: {e}")))?
                as usize;
        }

        if deleted > 0 {
            debug!(user_id = owner, deleted, keep = self.keep, "Trimmed stories");
        }
        Ok(deleted)
    }

    /// Trim an owner's context rows of one kind. Returns the number deleted.
    pub async fn trim_contexts(
        &self,
        conn: &Connection,
        owner: UserId,
        kind: ContextKind,
    ) -> Result<usize, DatabaseError> {
        let ids = ranked_ids(
            conn,
            "SELECT id FROM contexts WHERE owner_id = ?1 AND kind = ?2 ORDER BY created_at DESC, id DESC",
            params![owner, kind.as_str()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("trim_contexts: {e}")))?;

        let mut deleted = 0;
        for id in ids.iter().skip(self.keep) {
            deleted += conn
                .execute("DELETE FROM contexts WHERE id = ?1", params![*id])
                .await
                .map_err(|e| DatabaseError::Query(format!("trim_contexts delete: {e}")))?
                as usize;
        }

        if deleted > 0 {
            debug!(user_id = owner, kind = %kind, deleted, keep = self.keep, "Trimmed contexts");
        }
        Ok(deleted)
    }
}

impl Default for HistoryTrimmer {
    fn default() -> Self {
        Self::new(DEFAULT_KEEP)
    }
}

async fn ranked_ids(
    conn: &Connection,
    sql: &str,
    params: impl libsql::params::IntoParams,
) -> Result<Vec<i64>, libsql::Error> {
    let mut rows = conn.query(sql, params).await?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next().await? {
        ids.push(row.get::<i64>(0)?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::migrations::run_migrations;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        let conn = db.connect().unwrap();
        run_migrations(&conn).await.unwrap();
        conn.execute(
            "INSERT INTO users (user_id, child_names, age, created_at, updated_at)
             VALUES (1, 'Mia', '7', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            (),
        )
        .await
        .unwrap();
        conn
    }

    async fn insert_story(conn: &Connection, text: &str, created_at: &str) {
        conn.execute(
            "INSERT INTO stories (owner_id, text, model, created_at) VALUES (1, ?1, 'test', ?2)",
            params![text, created_at],
        )
        .await
        .unwrap();
    }

    async fn story_texts(conn: &Connection) -> Vec<String> {
        let mut rows = conn
            .query(
                "SELECT text FROM stories WHERE owner_id = 1 ORDER BY created_at DESC, id DESC",
                (),
            )
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(row) = rows.next().await.unwrap() {
            out.push(row.get::<String>(0).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn keeps_most_recent_five() {
        let conn = test_conn().await;
        let trimmer = HistoryTrimmer::default();

        for i in 0..8 {
            insert_story(&conn, &format!("s{i}"), &format!("2026-01-01T00:00:0{i}.000000Z")).await;
            trimmer.trim_stories(&conn, 1).await.unwrap();
        }

        assert_eq!(story_texts(&conn).await, vec!["s7", "s6", "s5", "s4", "s3"]);
    }

    #[tokio::test]
    async fn equal_timestamps_fall_back_to_insertion_order() {
        let conn = test_conn().await;
        let trimmer = HistoryTrimmer::new(2);

        for i in 0..4 {
            insert_story(&conn, &format!("s{i}"), "2026-01-01T00:00:00.000000Z").await;
        }
        let deleted = trimmer.trim_stories(&conn, 1).await.unwrap();

        assert_eq!(deleted, 2);
        assert_eq!(story_texts(&conn).await, vec!["s3", "s2"]);
    }

    #[tokio::test]
    async fn under_bound_deletes_nothing() {
        let conn = test_conn().await;
        insert_story(&conn, "only", "2026-01-01T00:00:00.000000Z").await;
        assert_eq!(HistoryTrimmer::default().trim_stories(&conn, 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn context_trim_is_scoped_to_kind() {
        let conn = test_conn().await;
        let trimmer = HistoryTrimmer::new(1);

        for (kind, content) in [
            ("archived", "a1"),
            ("archived", "a2"),
            ("active", "c1"),
            ("active", "c2"),
        ] {
            conn.execute(
                "INSERT INTO contexts (owner_id, kind, content, created_at)
                 VALUES (1, ?1, ?2, '2026-01-01T00:00:00.000000Z')",
                params![kind, content],
            )
            .await
            .unwrap();
        }

        let deleted = trimmer
            .trim_contexts(&conn, 1, ContextKind::Archived)
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let mut rows = conn
            .query("SELECT COUNT(*) FROM contexts WHERE kind = 'active'", ())
            .await
            .unwrap();
        let active: i64 = rows.next().await.unwrap().unwrap().get(0).unwrap();
        assert_eq!(active, 2);
    }
}
