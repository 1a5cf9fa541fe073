//! SQLite-backed viewer memory.
//!
//! One row per viewer with the greeting cooldown timestamp and per-kind
//! interaction counters. All queries run on the blocking pool; the
//! connection is shared behind a mutex.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use palfriend_core::memory::MemoryStore;
use palfriend_core::{EventKind, PalfriendError};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

type CoreResult<T> = palfriend_core::error::Result<T>;

#[derive(Clone)]
pub struct SqliteMemoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMemoryStore {
    pub fn open(db_path: &Path) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let conn = Connection::open(db_path).map_err(|e| e.to_string())?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, String> {
        let conn = Connection::open_in_memory().map_err(|e| e.to_string())?;
        Self::with_connection(conn)
    }

    fn with_connection(conn: Connection) -> Result<Self, String> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS viewers (
              id TEXT PRIMARY KEY,
              nickname TEXT NOT NULL DEFAULT '',
              greeted_at INTEGER,
              last_seen INTEGER NOT NULL,
              comments INTEGER NOT NULL DEFAULT 0,
              gifts INTEGER NOT NULL DEFAULT 0,
              likes INTEGER NOT NULL DEFAULT 0,
              follows INTEGER NOT NULL DEFAULT 0,
              shares INTEGER NOT NULL DEFAULT 0,
              subscribes INTEGER NOT NULL DEFAULT 0,
              joins INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_viewers_last_seen ON viewers(last_seen);
            "#,
        )
        .map_err(|e| e.to_string())?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Forget viewers not seen for `decay_days`. Returns the number removed.
    pub async fn prune_stale(&self, decay_days: u32) -> CoreResult<usize> {
        let cutoff = Utc::now() - Duration::days(i64::from(decay_days));
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM viewers WHERE last_seen < ?1",
                params![cutoff.timestamp()],
            )
        })
        .await
    }

    async fn run<T, F>(&self, query: F) -> CoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            query(&conn)
        })
        .await
        .map_err(|e| PalfriendError::Memory(format!("query task failed: {e}")))?
        .map_err(|e| PalfriendError::Memory(e.to_string()))
    }
}

fn from_timestamp(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

fn counter_column(kind: EventKind) -> &'static str {
    match kind {
        EventKind::Comment => "comments",
        EventKind::Gift => "gifts",
        EventKind::Like => "likes",
        EventKind::Follow => "follows",
        EventKind::Share => "shares",
        EventKind::Subscribe => "subscribes",
        EventKind::Join => "joins",
    }
}

#[async_trait]
impl MemoryStore for SqliteMemoryStore {
    async fn get_viewer_cooldown(&self, viewer_id: &str) -> CoreResult<Option<DateTime<Utc>>> {
        let id = viewer_id.to_string();
        let greeted: Option<Option<i64>> = self
            .run(move |conn| {
                conn.query_row(
                    "SELECT greeted_at FROM viewers WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        Ok(greeted.flatten().and_then(from_timestamp))
    }

    async fn set_viewer_cooldown(&self, viewer_id: &str, at: DateTime<Utc>) -> CoreResult<()> {
        let id = viewer_id.to_string();
        self.run(move |conn| {
            conn.execute(
                r#"
                INSERT INTO viewers (id, greeted_at, last_seen) VALUES (?1, ?2, ?2)
                ON CONFLICT(id) DO UPDATE SET greeted_at = excluded.greeted_at,
                                              last_seen = MAX(last_seen, excluded.last_seen)
                "#,
                params![id, at.timestamp()],
            )
        })
        .await?;
        Ok(())
    }

    async fn remember_event(
        &self,
        viewer_id: &str,
        nickname: &str,
        kind: EventKind,
        count: u32,
    ) -> CoreResult<()> {
        let id = viewer_id.to_string();
        let nickname = nickname.to_string();
        let now = Utc::now().timestamp();
        let increment = i64::from(count.max(1));
        let column = counter_column(kind);
        // `column` comes from a fixed list, never from input.
        let sql = format!(
            r#"
            INSERT INTO viewers (id, nickname, last_seen, {column}) VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
              nickname = CASE WHEN excluded.nickname = '' THEN nickname ELSE excluded.nickname END,
              last_seen = excluded.last_seen,
              {column} = {column} + excluded.{column}
            "#
        );
        self.run(move |conn| conn.execute(&sql, params![id, nickname, now, increment]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct ViewerSummary {
        nickname: String,
        greeted_at: Option<DateTime<Utc>>,
        comments: u64,
        gifts: u64,
        likes: u64,
        follows: u64,
    }

    fn counter(raw: i64) -> u64 {
        u64::try_from(raw).unwrap_or(0)
    }

    impl SqliteMemoryStore {
        async fn viewer(&self, viewer_id: &str) -> CoreResult<Option<ViewerSummary>> {
            let id = viewer_id.to_string();
            self.run(move |conn| {
                conn.query_row(
                    "SELECT nickname, greeted_at, comments, gifts, likes, follows
                     FROM viewers WHERE id = ?1",
                    params![id],
                    |row| {
                        let greeted_at: Option<i64> = row.get(1)?;
                        Ok(ViewerSummary {
                            nickname: row.get(0)?,
                            greeted_at: greeted_at.and_then(from_timestamp),
                            comments: counter(row.get(2)?),
                            gifts: counter(row.get(3)?),
                            likes: counter(row.get(4)?),
                            follows: counter(row.get(5)?),
                        })
                    },
                )
                .optional()
            })
            .await
        }
    }

    #[tokio::test]
    async fn cooldown_roundtrips_at_second_precision() {
        let store = SqliteMemoryStore::open_in_memory().expect("open");
        assert!(store.get_viewer_cooldown("u1").await.expect("get").is_none());

        let at = Utc.timestamp_opt(1_700_000_000, 0).single().expect("timestamp");
        store.set_viewer_cooldown("u1", at).await.expect("set");
        assert_eq!(store.get_viewer_cooldown("u1").await.expect("get"), Some(at));
    }

    #[tokio::test]
    async fn remember_event_accumulates_counters() {
        let store = SqliteMemoryStore::open_in_memory().expect("open");
        store
            .remember_event("u1", "alice", EventKind::Gift, 5)
            .await
            .expect("gift");
        store
            .remember_event("u1", "", EventKind::Gift, 2)
            .await
            .expect("gift");
        store
            .remember_event("u1", "alice2", EventKind::Follow, 1)
            .await
            .expect("follow");
        for _ in 0..3 {
            store
                .remember_event("u1", "alice2", EventKind::Comment, 1)
                .await
                .expect("comment");
        }

        let viewer = store.viewer("u1").await.expect("query").expect("row");
        assert_eq!(viewer.nickname, "alice2");
        assert_eq!(viewer.gifts, 7);
        assert_eq!(viewer.follows, 1);
        assert_eq!(viewer.comments, 3);
        assert_eq!(viewer.likes, 0);
        assert!(viewer.greeted_at.is_none());
    }

    #[tokio::test]
    async fn prune_removes_only_stale_viewers() {
        let store = SqliteMemoryStore::open_in_memory().expect("open");
        let old = Utc::now() - Duration::days(120);
        store.set_viewer_cooldown("old", old).await.expect("set");
        store
            .remember_event("fresh", "bob", EventKind::Comment, 1)
            .await
            .expect("remember");

        assert_eq!(store.prune_stale(90).await.expect("prune"), 1);
        assert!(store.viewer("old").await.expect("query").is_none());
        assert!(store.viewer("fresh").await.expect("query").is_some());
    }
}
