//! SQLite memory backend.
//!
//! One table, `memory_messages`, ordered by `(created_at, iid)` where
//! `created_at` is Unix microseconds. Overflow is trimmed inside the same
//! transaction as the insert. Compression rewrites the session in a single
//! transaction: insert replacement, verify count, delete old rows.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::MemoryError;
use cortex_core::memory::{MemoryProvider, apply_window};
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{SessionLocks, compression, now_micros, overflow_ids};

#[derive(Debug, Clone)]
struct StoredRow {
    iid: i64,
    role: Role,
    content: String,
    created_at: i64,
}

impl StoredRow {
    fn to_message(&self) -> Message {
        match self.role {
            Role::System => Message::system(&self.content),
            Role::User => Message::user(&self.content),
            Role::Assistant => Message::assistant(&self.content),
            Role::Tool => Message {
                role: Role::Tool,
                ..Message::user(&self.content)
            },
        }
    }
}

/// Connection pool plus per-session locks; hands out [`SqliteMemory`].
#[derive(Clone)]
pub struct SqliteMemoryStore {
    pool: SqlitePool,
    locks: SessionLocks,
}

impl SqliteMemoryStore {
    /// Open (creating if missing) the database at `url`.
    pub async fn connect(url: &str) -> Result<Self, MemoryError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| MemoryError::Storage(format!("Invalid SQLite url: {e}")))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("Failed to open SQLite: {e}")))?;

        let store = Self::from_pool(pool).await?;
        info!("SQLite memory backend initialized at {url}");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, MemoryError> {
        let store = Self {
            pool,
            locks: SessionLocks::new(),
        };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), MemoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_messages (
                iid         INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id  TEXT NOT NULL,
                role        TEXT NOT NULL,
                content     TEXT NOT NULL,
                created_at  INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("memory_messages table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_session_order ON memory_messages(session_id, created_at, iid)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("memory order index: {e}")))?;

        debug!("SQLite memory migrations complete");
        Ok(())
    }

    pub fn open(&self, session_id: impl Into<String>, max_history: usize) -> SqliteMemory {
        let session_id = session_id.into();
        SqliteMemory {
            pool: self.pool.clone(),
            lock: self.locks.lock_for(&session_id),
            session_id,
            max_history,
        }
    }
}

/// SQLite-backed memory bound to one session.
pub struct SqliteMemory {
    pool: SqlitePool,
    lock: Arc<Mutex<()>>,
    session_id: String,
    max_history: usize,
}

fn query_err(e: sqlx::Error) -> MemoryError {
    MemoryError::QueryFailed(e.to_string())
}

async fn load_rows<'e, E>(executor: E, session_id: &str) -> Result<Vec<StoredRow>, MemoryError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let rows = sqlx::query(
        "SELECT iid, role, content, created_at FROM memory_messages \
         WHERE session_id = ? ORDER BY created_at ASC, iid ASC",
    )
    .bind(session_id)
    .fetch_all(executor)
    .await
    .map_err(query_err)?;

    rows.iter()
        .map(|row| {
            let role: String = row.try_get("role").map_err(query_err)?;
            Ok(StoredRow {
                iid: row.try_get("iid").map_err(query_err)?,
                role: role.parse().map_err(MemoryError::QueryFailed)?,
                content: row.try_get("content").map_err(query_err)?,
                created_at: row.try_get("created_at").map_err(query_err)?,
            })
        })
        .collect()
}

async fn delete_ids(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    ids: &[i64],
) -> Result<(), MemoryError> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM memory_messages WHERE iid IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");
    qb.build().execute(&mut **tx).await.map_err(query_err)?;
    Ok(())
}

impl SqliteMemory {
    async fn insert(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        session_id: &str,
        role: Role,
        content: &str,
        created_at: i64,
    ) -> Result<(), MemoryError> {
        sqlx::query("INSERT INTO memory_messages (session_id, role, content, created_at) VALUES (?, ?, ?, ?)")
            .bind(session_id)
            .bind(role.as_str())
            .bind(content)
            .bind(created_at)
            .execute(&mut **tx)
            .await
            .map_err(query_err)?;
        Ok(())
    }
}

#[async_trait]
impl MemoryProvider for SqliteMemory {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError> {
        if input.is_none() && output.is_none() {
            return Ok(());
        }
        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let now = now_micros();
        if let Some(text) = input {
            Self::insert(&mut tx, &self.session_id, Role::User, text, now).await?;
        }
        if let Some(text) = output {
            Self::insert(&mut tx, &self.session_id, Role::Assistant, text, now).await?;
        }

        let rows = load_rows(&mut *tx, &self.session_id).await?;
        let keys: Vec<(i64, Role)> = rows.iter().map(|r| (r.iid, r.role)).collect();
        delete_ids(&mut tx, &overflow_ids(&keys, self.max_history)).await?;

        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError> {
        let rows = load_rows(&self.pool, &self.session_id).await?;
        Ok(apply_window(
            rows.iter().map(StoredRow::to_message).collect(),
            self.max_history,
        ))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        sqlx::query("DELETE FROM memory_messages WHERE session_id = ?")
            .bind(&self.session_id)
            .execute(&self.pool)
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn compress_memory(&self, llm: &dyn LlmProvider, max_messages: usize) -> Result<bool, MemoryError> {
        let snapshot: Vec<Message> = {
            let _guard = self.lock.lock().await;
            load_rows(&self.pool, &self.session_id)
                .await?
                .iter()
                .map(StoredRow::to_message)
                .collect()
        };
        let Some(part) = compression::partition(&snapshot, max_messages) else {
            return Ok(false);
        };

        let summary = compression::summarize(llm, &part.old).await?;

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let current_rows = load_rows(&mut *tx, &self.session_id).await?;
        let current: Vec<Message> = current_rows.iter().map(StoredRow::to_message).collect();

        let Some(replacement) = compression::reconcile(&snapshot, &part, &summary, &current, max_messages)
        else {
            debug!(session_id = %self.session_id, "History changed during summarization, skipping swap");
            return Ok(false);
        };

        let pivot = current_rows.iter().map(|r| r.iid).max().unwrap_or(0);
        let sys = part.system.len();
        let tail_start = sys + part.old.len();
        for (i, msg) in replacement.iter().enumerate() {
            let created_at = if i < sys {
                current_rows[i].created_at
            } else if i == sys {
                current_rows.get(tail_start).map(|r| r.created_at).unwrap_or_else(now_micros)
            } else {
                current_rows[tail_start + i - sys - 1].created_at
            };
            Self::insert(&mut tx, &self.session_id, msg.role, &msg.content, created_at).await?;
        }

        let inserted: i64 = sqlx::query("SELECT COUNT(*) AS n FROM memory_messages WHERE session_id = ? AND iid > ?")
            .bind(&self.session_id)
            .bind(pivot)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_err)?
            .try_get("n")
            .map_err(query_err)?;

        if inserted as usize != replacement.len() {
            warn!(session_id = %self.session_id, inserted, expected = replacement.len(), "Compression verify failed");
            tx.rollback().await.map_err(query_err)?;
            return Err(MemoryError::Verification(format!(
                "expected {} rows, found {inserted}",
                replacement.len()
            )));
        }

        sqlx::query("DELETE FROM memory_messages WHERE session_id = ? AND iid <= ?")
            .bind(&self.session_id)
            .bind(pivot)
            .execute(&mut *tx)
            .await
            .map_err(query_err)?;

        tx.commit().await.map_err(query_err)?;
        debug!(session_id = %self.session_id, rows = replacement.len(), "Compressed SQLite memory");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SummaryStub;

    async fn store() -> SqliteMemoryStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteMemoryStore::from_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn save_and_load_in_order() {
        let mem = store().await.open("s1", 100);
        mem.save_context(Some("hi"), Some("hello")).await.unwrap();
        mem.save_context(Some("how are you"), Some("fine")).await.unwrap();
        let h = mem.get_chat_history().await.unwrap();
        let contents: Vec<&str> = h.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["hi", "hello", "how are you", "fine"]);
        assert_eq!(h[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn trims_to_window() {
        let mem = store().await.open("s1", 5);
        for i in 0..5 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 5);
        assert_eq!(h[0].content, "a2");
        assert_eq!(h[4].content, "a4");
    }

    #[tokio::test]
    async fn clear_only_touches_bound_session() {
        let s = store().await;
        let a = s.open("a", 10);
        let b = s.open("b", 10);
        a.save_context(Some("x"), None).await.unwrap();
        b.save_context(Some("y"), None).await.unwrap();
        a.clear().await.unwrap();
        assert!(a.get_chat_history().await.unwrap().is_empty());
        assert_eq!(b.get_chat_history().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn compress_rewrites_session() {
        let mem = store().await.open("s1", 100);
        for i in 0..30 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        let before = mem.get_chat_history().await.unwrap();
        let stub = SummaryStub::new("SUM");
        assert!(mem.compress_memory(&stub, 20).await.unwrap());

        let after = mem.get_chat_history().await.unwrap();
        assert_eq!(after.len(), 21);
        assert_eq!(after[0].content, "Previous conversation summary: SUM");
        assert_eq!(after[1..], before[40..]);

        // appends still land after the compressed history
        mem.save_context(Some("next"), None).await.unwrap();
        assert_eq!(mem.get_chat_history().await.unwrap().last().unwrap().content, "next");
    }

    #[tokio::test]
    async fn compress_noop_and_failure_leave_rows() {
        let mem = store().await.open("s1", 100);
        for i in 0..5 {
            mem.save_context(Some(&format!("q{i}")), None).await.unwrap();
        }
        let before = mem.get_chat_history().await.unwrap();
        assert!(!mem.compress_memory(&SummaryStub::new("S"), 10).await.unwrap());
        assert!(mem.compress_memory(&SummaryStub::failing(), 2).await.is_err());
        assert_eq!(mem.get_chat_history().await.unwrap(), before);
    }
}
