//! SQLite-backed context store.
//!
//! Conversations survive process restarts. Each append is one transaction:
//! a version-guarded `UPDATE` on the conversation row followed by the
//! message inserts, so a stale writer changes nothing.
//!
//! ## Tables
//!
//! - `conversations(conversation_id PK, project_id, version, created_at, updated_at)`
//! - `messages(id, conversation_id, seq, role, content, pinned, created_at)`
//!
//! Both are created with `CREATE TABLE IF NOT EXISTS` on open. Schema
//! evolution is handled outside this crate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

use switchyard_core::{ConversationContext, Message, Role};

use super::{ContextError, ContextStore};

/// Durable [`ContextStore`] using `sqlx` over SQLite.
pub struct SqliteContextStore {
    pool: SqlitePool,
}

impl SqliteContextStore {
    /// Open (creating if needed) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ContextError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        tracing::info!(path = %path.as_ref().display(), "Opened context database");
        Self::from_pool(pool).await
    }

    /// In-memory database, useful for testing.
    ///
    /// Every connection to `sqlite::memory:` is a separate database, so the
    /// pool is pinned to one connection that is never recycled.
    pub async fn in_memory() -> Result<Self, ContextError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating tables if missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, ContextError> {
        Self::create_tables(&pool).await?;
        Ok(Self { pool })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<(), ContextError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversations (
                conversation_id TEXT PRIMARY KEY,
                project_id TEXT,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id TEXT NOT NULL REFERENCES conversations(conversation_id),
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                pinned INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                UNIQUE(conversation_id, seq)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn read(
        conn: &mut SqliteConnection,
        conversation_id: &str,
    ) -> Result<Option<ConversationContext>, ContextError> {
        let Some(row) = sqlx::query(
            r#"
            SELECT project_id, version, created_at, updated_at
            FROM conversations
            WHERE conversation_id = ?
            "#,
        )
        .bind(conversation_id)
        .fetch_optional(&mut *conn)
        .await?
        else {
            return Ok(None);
        };

        let version: i64 = row.try_get("version")?;
        let mut context = ConversationContext {
            conversation_id: conversation_id.to_string(),
            project_id: row.try_get("project_id")?,
            messages: Vec::new(),
            version: version as u64,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        };

        let rows = sqlx::query(
            r#"
            SELECT role, content, pinned, created_at
            FROM messages
            WHERE conversation_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&mut *conn)
        .await?;

        for row in rows {
            let role: String = row.try_get("role")?;
            context.messages.push(Message {
                role: role.parse::<Role>().map_err(ContextError::Corrupt)?,
                content: row.try_get("content")?,
                timestamp: row.try_get::<DateTime<Utc>, _>("created_at")?,
                pinned: row.try_get("pinned")?,
            });
        }

        Ok(Some(context))
    }
}

#[async_trait]
impl ContextStore for SqliteContextStore {
    async fn get_or_create(
        &self,
        conversation_id: &str,
        project_id: Option<&str>,
    ) -> Result<ConversationContext, ContextError> {
        let now = Utc::now();
        let mut conn = self.pool.acquire().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO conversations
                (conversation_id, project_id, version, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(conversation_id)
        .bind(project_id)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        if inserted.rows_affected() > 0 {
            tracing::debug!(conversation_id = %conversation_id, "Created conversation");
        }

        Self::read(&mut conn, conversation_id)
            .await?
            .ok_or_else(|| ContextError::NotFound(conversation_id.to_string()))
    }

    async fn append_all(
        &self,
        conversation_id: &str,
        messages: Vec<Message>,
        expected_version: u64,
    ) -> Result<ConversationContext, ContextError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE conversations
            SET version = version + ?, updated_at = ?
            WHERE conversation_id = ? AND version = ?
            "#,
        )
        .bind(messages.len() as i64)
        .bind(now)
        .bind(conversation_id)
        .bind(expected_version as i64)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            let actual: Option<i64> =
                sqlx::query_scalar("SELECT version FROM conversations WHERE conversation_id = ?")
                    .bind(conversation_id)
                    .fetch_optional(&mut *tx)
                    .await?;
            tx.rollback().await?;

            return Err(match actual {
                None => ContextError::NotFound(conversation_id.to_string()),
                Some(actual) => {
                    tracing::debug!(
                        conversation_id = %conversation_id,
                        expected = expected_version,
                        actual,
                        "Rejected stale append"
                    );
                    ContextError::VersionConflict {
                        expected: expected_version,
                        actual: actual as u64,
                    }
                }
            });
        }

        for message in &messages {
            sqlx::query(
                r#"
                INSERT INTO messages (conversation_id, seq, role, content, pinned, created_at)
                VALUES (
                    ?,
                    (SELECT COALESCE(MAX(seq), -1) + 1 FROM messages WHERE conversation_id = ?),
                    ?, ?, ?, ?
                )
                "#,
            )
            .bind(conversation_id)
            .bind(conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.pinned)
            .bind(message.timestamp)
            .execute(&mut *tx)
            .await?;
        }

        let context = Self::read(&mut tx, conversation_id)
            .await?
            .ok_or_else(|| ContextError::NotFound(conversation_id.to_string()))?;
        tx.commit().await?;

        Ok(context)
    }

    async fn load(&self, conversation_id: &str) -> Result<Option<ConversationContext>, ContextError> {
        let mut conn = self.pool.acquire().await?;
        Self::read(&mut conn, conversation_id).await
    }
}

impl std::fmt::Debug for SqliteContextStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteContextStore")
            .field("connections", &self.pool.size())
            .finish()
    }
}
