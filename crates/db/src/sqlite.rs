//! SQLite persistence (sqlx).
//!
//! Tables: `roles`, `experiences`, `role_experience_relations`, `settings`,
//! `chat_sessions`, `chat_messages`. Rows are soft-deleted through a nullable
//! `deleted_at`; every read filters on it.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use cortex_core::domain::{AgentRole, ChatMessage, Experience, Session};
use cortex_core::error::StoreError;
use cortex_core::message::Role;
use cortex_core::store::{ChatStore, ExperienceQuery, ExperienceStore, RoleStore, SettingsStore};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, info};

use crate::{from_micros, to_micros};

type StoreResult<T> = Result<T, StoreError>;

const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS roles (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL,
        prompt      TEXT NOT NULL,
        principle   TEXT,
        tool_config TEXT NOT NULL DEFAULT '{}',
        is_public   INTEGER NOT NULL DEFAULT 0,
        creator_id  TEXT NOT NULL DEFAULT '',
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        deleted_at  INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS experiences (
        id          TEXT PRIMARY KEY,
        type        TEXT NOT NULL DEFAULT '',
        title       TEXT NOT NULL,
        content     TEXT NOT NULL,
        tags        TEXT NOT NULL DEFAULT '[]',
        created_by  TEXT NOT NULL,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        deleted_at  INTEGER
    )"#,
    r#"CREATE TABLE IF NOT EXISTS role_experience_relations (
        role_id       TEXT NOT NULL,
        experience_id TEXT NOT NULL,
        created_at    INTEGER NOT NULL,
        PRIMARY KEY (role_id, experience_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS settings (
        setting_group TEXT NOT NULL,
        setting_key   TEXT NOT NULL,
        value         TEXT NOT NULL,
        updated_at    INTEGER NOT NULL,
        deleted_at    INTEGER,
        PRIMARY KEY (setting_group, setting_key)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS chat_sessions (
        id          TEXT PRIMARY KEY,
        user_id     TEXT NOT NULL,
        role_id     TEXT NOT NULL,
        role_name   TEXT NOT NULL,
        provider    TEXT NOT NULL,
        model_name  TEXT NOT NULL,
        title       TEXT,
        created_at  INTEGER NOT NULL,
        updated_at  INTEGER NOT NULL,
        deleted_at  INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_chat_sessions_user ON chat_sessions(user_id, updated_at)",
    r#"CREATE TABLE IF NOT EXISTS chat_messages (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        id          TEXT NOT NULL UNIQUE,
        session_id  TEXT NOT NULL,
        role        TEXT NOT NULL,
        content     TEXT NOT NULL,
        meta        TEXT NOT NULL DEFAULT 'null',
        created_at  INTEGER NOT NULL,
        deleted_at  INTEGER
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_chat_messages_session ON chat_messages(session_id, created_at, seq)",
];

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// SQLite-backed implementation of every store trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the database at `url` and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| StoreError::Database(format!("Invalid SQLite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(db_err)?;

        let store = Self::from_pool(pool).await?;
        info!(url, "SQLite store ready");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> StoreResult<()> {
        for sql in MIGRATIONS {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        debug!("SQLite store migrations complete");
        Ok(())
    }

    /// Round-trip check used by `cortex doctor` and `/health`.
    pub async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map_err(db_err)?;
        Ok(())
    }
}

fn session_from_row(row: &SqliteRow) -> StoreResult<Session> {
    Ok(Session {
        id: row.try_get("id").map_err(db_err)?,
        user_id: row.try_get("user_id").map_err(db_err)?,
        role_id: row.try_get("role_id").map_err(db_err)?,
        role_name: row.try_get("role_name").map_err(db_err)?,
        provider: row.try_get("provider").map_err(db_err)?,
        model_name: row.try_get("model_name").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?),
        updated_at: from_micros(row.try_get("updated_at").map_err(db_err)?),
    })
}

fn message_from_row(row: &SqliteRow) -> StoreResult<ChatMessage> {
    let role: String = row.try_get("role").map_err(db_err)?;
    let meta: String = row.try_get("meta").map_err(db_err)?;
    Ok(ChatMessage {
        id: row.try_get("id").map_err(db_err)?,
        session_id: row.try_get("session_id").map_err(db_err)?,
        role: role.parse::<Role>().map_err(StoreError::Serialization)?,
        content: row.try_get("content").map_err(db_err)?,
        meta: serde_json::from_str(&meta).map_err(ser_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?),
    })
}

fn role_from_row(row: &SqliteRow) -> StoreResult<AgentRole> {
    let tool_config: String = row.try_get("tool_config").map_err(db_err)?;
    Ok(AgentRole {
        id: row.try_get("id").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        prompt: row.try_get("prompt").map_err(db_err)?,
        principle: row.try_get("principle").map_err(db_err)?,
        tool_config: serde_json::from_str(&tool_config).map_err(ser_err)?,
        is_public: row.try_get("is_public").map_err(db_err)?,
        creator_id: row.try_get("creator_id").map_err(db_err)?,
    })
}

fn experience_from_row(row: &SqliteRow) -> StoreResult<Experience> {
    let tags: String = row.try_get("tags").map_err(db_err)?;
    Ok(Experience {
        id: row.try_get("id").map_err(db_err)?,
        kind: row.try_get("type").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        content: row.try_get("content").map_err(db_err)?,
        tags: serde_json::from_str(&tags).map_err(ser_err)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: from_micros(row.try_get("created_at").map_err(db_err)?),
        updated_at: from_micros(row.try_get("updated_at").map_err(db_err)?),
    })
}

// ---------------------------------------------------------------------------
// Sessions and messages
// ---------------------------------------------------------------------------

#[async_trait]
impl ChatStore for SqliteStore {
    async fn create_session(&self, session: &Session) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO chat_sessions \
             (id, user_id, role_id, role_name, provider, model_name, title, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(&session.user_id)
        .bind(&session.role_id)
        .bind(&session.role_name)
        .bind(&session.provider)
        .bind(&session.model_name)
        .bind(&session.title)
        .bind(to_micros(&session.created_at))
        .bind(to_micros(&session.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_session(&self, user_id: &str, session_id: &str) -> StoreResult<Session> {
        let row = sqlx::query(
            "SELECT * FROM chat_sessions WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;
        session_from_row(&row)
    }

    async fn update_session_binding(
        &self,
        session_id: &str,
        role_id: &str,
        role_name: &str,
        provider: &str,
        model_name: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE chat_sessions SET role_id = ?, role_name = ?, provider = ?, model_name = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(role_id)
        .bind(role_name)
        .bind(provider)
        .bind(model_name)
        .bind(now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        Ok(())
    }

    async fn list_sessions(&self, user_id: &str) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(
            "SELECT * FROM chat_sessions WHERE user_id = ? AND deleted_at IS NULL ORDER BY updated_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(session_from_row).collect()
    }

    async fn delete_session(&self, user_id: &str, session_id: &str) -> StoreResult<()> {
        let ts = now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query(
            "UPDATE chat_sessions SET deleted_at = ? WHERE id = ? AND user_id = ? AND deleted_at IS NULL",
        )
        .bind(ts)
        .bind(session_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("session {session_id}")));
        }
        sqlx::query("UPDATE chat_messages SET deleted_at = ? WHERE session_id = ? AND deleted_at IS NULL")
            .bind(ts)
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_messages(&self, messages: &[ChatMessage]) -> StoreResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for msg in messages {
            sqlx::query(
                "INSERT INTO chat_messages (id, session_id, role, content, meta, created_at) \
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&msg.id)
            .bind(&msg.session_id)
            .bind(msg.role.as_str())
            .bind(&msg.content)
            .bind(serde_json::to_string(&msg.meta).map_err(ser_err)?)
            .bind(to_micros(&msg.created_at))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let touched: BTreeSet<&str> = messages.iter().map(|m| m.session_id.as_str()).collect();
        let ts = now();
        for session_id in touched {
            sqlx::query("UPDATE chat_sessions SET updated_at = ? WHERE id = ?")
                .bind(ts)
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn list_messages(&self, user_id: &str, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        // Ownership check first; another user's session reads as absent
        self.get_session(user_id, session_id).await?;
        let rows = sqlx::query(
            "SELECT * FROM chat_messages WHERE session_id = ? AND deleted_at IS NULL \
             ORDER BY created_at ASC, seq ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[async_trait]
impl RoleStore for SqliteStore {
    async fn get_role(&self, role_id: &str) -> StoreResult<AgentRole> {
        let row = sqlx::query("SELECT * FROM roles WHERE id = ? AND deleted_at IS NULL")
            .bind(role_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("role {role_id}")))?;
        role_from_row(&row)
    }

    async fn save_role(&self, role: &AgentRole) -> StoreResult<()> {
        let ts = now();
        sqlx::query(
            "INSERT INTO roles (id, name, prompt, principle, tool_config, is_public, creator_id, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, prompt = excluded.prompt, \
             principle = excluded.principle, tool_config = excluded.tool_config, \
             is_public = excluded.is_public, creator_id = excluded.creator_id, \
             updated_at = excluded.updated_at, deleted_at = NULL",
        )
        .bind(&role.id)
        .bind(&role.name)
        .bind(&role.prompt)
        .bind(&role.principle)
        .bind(serde_json::to_string(&role.tool_config).map_err(ser_err)?)
        .bind(role.is_public)
        .bind(&role.creator_id)
        .bind(ts)
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Experiences
// ---------------------------------------------------------------------------

/// `SELECT <select> FROM experiences e JOIN relations ... WHERE <filters>`
fn experience_filter<'a>(select: &str, role_id: &'a str, query: &'a ExperienceQuery) -> QueryBuilder<'a, Sqlite> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT {select} FROM experiences e \
         JOIN role_experience_relations r ON r.experience_id = e.id \
         WHERE e.deleted_at IS NULL AND r.role_id = "
    ));
    qb.push_bind(role_id);
    if let Some(kind) = query.kind.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND e.type = ").push_bind(kind);
    }
    if let Some(title) = query.title.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND e.title LIKE ").push_bind(format!("%{title}%"));
    }
    if let Some(tag) = query.tag.as_deref().filter(|s| !s.is_empty()) {
        // Tags are a JSON array; match the quoted element
        let quoted = serde_json::Value::String(tag.to_string()).to_string();
        qb.push(" AND e.tags LIKE ").push_bind(format!("%{quoted}%"));
    }
    if let Some(author) = query.created_by.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND e.created_by = ").push_bind(author);
    }
    qb
}

#[async_trait]
impl ExperienceStore for SqliteStore {
    async fn create_experience(&self, experience: &Experience) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO experiences (id, type, title, content, tags, created_by, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&experience.id)
        .bind(&experience.kind)
        .bind(&experience.title)
        .bind(&experience.content)
        .bind(serde_json::to_string(&experience.tags).map_err(ser_err)?)
        .bind(&experience.created_by)
        .bind(to_micros(&experience.created_at))
        .bind(to_micros(&experience.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_experience(&self, id: &str) -> StoreResult<Experience> {
        let row = sqlx::query("SELECT * FROM experiences WHERE id = ? AND deleted_at IS NULL")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StoreError::NotFound(format!("experience {id}")))?;
        experience_from_row(&row)
    }

    async fn update_experience(&self, experience: &Experience) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE experiences SET type = ?, title = ?, content = ?, tags = ?, updated_at = ? \
             WHERE id = ? AND deleted_at IS NULL",
        )
        .bind(&experience.kind)
        .bind(&experience.title)
        .bind(&experience.content)
        .bind(serde_json::to_string(&experience.tags).map_err(ser_err)?)
        .bind(to_micros(&experience.updated_at))
        .bind(&experience.id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("experience {}", experience.id)));
        }
        Ok(())
    }

    async fn delete_experience(&self, id: &str) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let result = sqlx::query("UPDATE experiences SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
            .bind(now())
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("experience {id}")));
        }
        sqlx::query("DELETE FROM role_experience_relations WHERE experience_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn link_role(&self, role_id: &str, experience_id: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO role_experience_relations (role_id, experience_id, created_at) VALUES (?, ?, ?)",
        )
        .bind(role_id)
        .bind(experience_id)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn is_linked(&self, role_id: &str, experience_id: &str) -> StoreResult<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM role_experience_relations r JOIN experiences e ON e.id = r.experience_id \
             WHERE r.role_id = ? AND r.experience_id = ? AND e.deleted_at IS NULL",
        )
        .bind(role_id)
        .bind(experience_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn list_for_role(&self, role_id: &str) -> StoreResult<Vec<Experience>> {
        let query = ExperienceQuery::default();
        let mut qb = experience_filter("e.*", role_id, &query);
        qb.push(" ORDER BY e.updated_at DESC");
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(experience_from_row).collect()
    }

    async fn search_experiences(
        &self,
        role_id: &str,
        query: &ExperienceQuery,
    ) -> StoreResult<(Vec<Experience>, u64)> {
        let total: i64 = experience_filter("COUNT(*) AS n", role_id, query)
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?
            .try_get("n")
            .map_err(db_err)?;

        let mut qb = experience_filter("e.*", role_id, query);
        qb.push(" ORDER BY e.updated_at DESC LIMIT ")
            .push_bind(i64::from(query.page_size.max(1)))
            .push(" OFFSET ")
            .push_bind(i64::from(query.offset()));
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        let page = rows.iter().map(experience_from_row).collect::<StoreResult<Vec<_>>>()?;
        Ok((page, total.max(0) as u64))
    }

    async fn fuzzy_search(&self, role_id: &str, keywords: &[String], limit: u32) -> StoreResult<Vec<Experience>> {
        if keywords.is_empty() {
            return Ok(Vec::new());
        }
        let query = ExperienceQuery::default();
        let mut qb = experience_filter("e.*", role_id, &query);
        qb.push(" AND (");
        for (i, kw) in keywords.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            let pattern = format!("%{kw}%");
            qb.push("e.title LIKE ")
                .push_bind(pattern.clone())
                .push(" OR e.content LIKE ")
                .push_bind(pattern);
        }
        qb.push(") ORDER BY e.updated_at DESC LIMIT ")
            .push_bind(i64::from(limit.max(1)));
        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        rows.iter().map(experience_from_row).collect()
    }
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

#[async_trait]
impl SettingsStore for SqliteStore {
    async fn get_setting(&self, group: &str, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let row = sqlx::query(
            "SELECT value FROM settings WHERE setting_group = ? AND setting_key = ? AND deleted_at IS NULL",
        )
        .bind(group)
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("value").map_err(db_err)?;
                Ok(Some(serde_json::from_str(&raw).map_err(ser_err)?))
            }
            None => Ok(None),
        }
    }

    async fn set_setting(&self, group: &str, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO settings (setting_group, setting_key, value, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(setting_group, setting_key) DO UPDATE SET value = excluded.value, \
             updated_at = excluded.updated_at, deleted_at = NULL",
        )
        .bind(group)
        .bind(key)
        .bind(serde_json::to_string(value).map_err(ser_err)?)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::from_pool(pool).await.unwrap()
    }

    fn role() -> AgentRole {
        AgentRole::new("r1", "Helper", "You are helpful.")
    }

    #[tokio::test]
    async fn session_is_private_to_its_owner() {
        let store = store().await;
        let session = Session::new("alice", &role(), "openai", "gpt-4o", Some("hi"));
        store.create_session(&session).await.unwrap();
        store
            .insert_messages(&[ChatMessage::new(&session.id, Role::User, "hi")])
            .await
            .unwrap();

        assert_eq!(store.get_session("alice", &session.id).await.unwrap().title.as_deref(), Some("hi"));
        assert_eq!(store.list_messages("alice", &session.id).await.unwrap().len(), 1);
        assert!(matches!(
            store.get_session("bob", &session.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.list_messages("bob", &session.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.delete_session("bob", &session.id).await.is_err());
    }

    #[tokio::test]
    async fn messages_come_back_in_creation_order() {
        let store = store().await;
        let session = Session::new("u", &role(), "openai", "m", None);
        store.create_session(&session).await.unwrap();

        let base = chrono::Utc::now();
        let mut late = ChatMessage::new(&session.id, Role::Assistant, "second");
        late.created_at = base + Duration::milliseconds(5);
        let mut early = ChatMessage::new(&session.id, Role::User, "first");
        early.created_at = base;
        // Same timestamp: insertion order breaks the tie
        let mut tie = ChatMessage::new(&session.id, Role::Tool, "third").with_meta(serde_json::json!({"k": 1}));
        tie.created_at = late.created_at;

        store.insert_messages(&[late, early, tie]).await.unwrap();
        let listed = store.list_messages("u", &session.id).await.unwrap();
        let contents: Vec<&str> = listed.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
        assert_eq!(listed[2].meta["k"], 1);
        assert!(listed.windows(2).all(|w| w[0].created_at <= w[1].created_at));
    }

    #[tokio::test]
    async fn rebinding_and_cascade_delete() {
        let store = store().await;
        let session = Session::new("u", &role(), "openai", "m1", None);
        store.create_session(&session).await.unwrap();
        store
            .update_session_binding(&session.id, "r2", "Other", "volce", "m2")
            .await
            .unwrap();
        let s = store.get_session("u", &session.id).await.unwrap();
        assert_eq!((s.role_id.as_str(), s.provider.as_str(), s.model_name.as_str()), ("r2", "volce", "m2"));

        store
            .insert_messages(&[ChatMessage::new(&session.id, Role::User, "x")])
            .await
            .unwrap();
        assert_eq!(store.list_sessions("u").await.unwrap().len(), 1);
        store.delete_session("u", &session.id).await.unwrap();
        assert!(store.list_sessions("u").await.unwrap().is_empty());
        assert!(store.list_messages("u", &session.id).await.is_err());
    }

    #[tokio::test]
    async fn role_upsert_keeps_tool_config() {
        let store = store().await;
        let mut r = role();
        r.tool_config.builtin = vec!["get_time".into()];
        store.save_role(&r).await.unwrap();
        r.principle = Some("Be brief".into());
        store.save_role(&r).await.unwrap();

        let loaded = store.get_role("r1").await.unwrap();
        assert_eq!(loaded, r);
        assert!(matches!(store.get_role("nope").await, Err(StoreError::NotFound(_))));
    }

    async fn seed_experiences(store: &SqliteStore) {
        for i in 0..12 {
            let mut e = Experience::new(
                if i % 3 == 0 { "incident" } else { "howto" },
                format!("title {i}"),
                format!("content about deploy step {i}"),
                "alice",
            );
            if i == 4 {
                e.title = "Rollback procedure".into();
                e.tags = vec!["ops".into(), "k8s".into()];
            }
            store.create_experience(&e).await.unwrap();
            store.link_role("r1", &e.id).await.unwrap();
        }
        let hidden = Experience::new("howto", "Rollback elsewhere", "not linked", "bob");
        store.create_experience(&hidden).await.unwrap();
        store.link_role("r2", &hidden.id).await.unwrap();
    }

    #[tokio::test]
    async fn search_is_scoped_filtered_and_paged() {
        let store = store().await;
        seed_experiences(&store).await;

        let q = ExperienceQuery {
            page: 2,
            page_size: 5,
            ..Default::default()
        };
        let (page, total) = store.search_experiences("r1", &q).await.unwrap();
        assert_eq!(total, 12);
        assert_eq!(page.len(), 5);

        let q = ExperienceQuery {
            kind: Some("incident".into()),
            ..Default::default()
        };
        assert_eq!(store.search_experiences("r1", &q).await.unwrap().1, 4);

        let q = ExperienceQuery {
            tag: Some("k8s".into()),
            ..Default::default()
        };
        let (hits, total) = store.search_experiences("r1", &q).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(hits[0].title, "Rollback procedure");
    }

    #[tokio::test]
    async fn fuzzy_search_ors_keywords_within_role() {
        let store = store().await;
        seed_experiences(&store).await;

        let hits = store
            .fuzzy_search("r1", &["rollback".to_string(), "step 7".to_string()], 10)
            .await
            .unwrap();
        let mut titles: Vec<String> = hits.into_iter().map(|e| e.title).collect();
        titles.sort();
        assert_eq!(titles, vec!["Rollback procedure".to_string(), "title 7".to_string()]);

        assert!(store.fuzzy_search("r1", &[], 10).await.unwrap().is_empty());
        assert_eq!(store.fuzzy_search("r2", &["rollback".to_string()], 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deleted_experience_is_unlinked() {
        let store = store().await;
        let e = Experience::new("howto", "t", "c", "alice");
        store.create_experience(&e).await.unwrap();
        store.link_role("r1", &e.id).await.unwrap();
        store.link_role("r1", &e.id).await.unwrap();
        assert!(store.is_linked("r1", &e.id).await.unwrap());

        store.delete_experience(&e.id).await.unwrap();
        assert!(!store.is_linked("r1", &e.id).await.unwrap());
        assert!(store.get_experience(&e.id).await.is_err());
        assert!(store.delete_experience(&e.id).await.is_err());
    }

    #[tokio::test]
    async fn settings_roundtrip_and_overwrite() {
        let store = store().await;
        assert!(store.get_setting("llm", "chat_config").await.unwrap().is_none());
        store
            .set_setting("llm", "chat_config", &serde_json::json!({"base_url": "http://a"}))
            .await
            .unwrap();
        store
            .set_setting("llm", "chat_config", &serde_json::json!({"base_url": "http://b"}))
            .await
            .unwrap();
        let v = store.get_setting("llm", "chat_config").await.unwrap().unwrap();
        assert_eq!(v["base_url"], "http://b");
    }
}
