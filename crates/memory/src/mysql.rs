//! MySQL memory backend (sqlx).
//!
//! Same layout and transaction shape as the SQLite backend; the row lock
//! taken by `SELECT ... FOR UPDATE` serializes writers across processes.

use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::MemoryError;
use cortex_core::memory::{MemoryProvider, apply_window};
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use sqlx::{MySql, QueryBuilder, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{SessionLocks, compression, now_micros, overflow_ids};

struct StoredRow {
    iid: i64,
    role: Role,
    content: String,
    created_at: i64,
}

impl StoredRow {
    fn to_message(&self) -> Message {
        Message {
            role: self.role,
            ..Message::user(&self.content)
        }
    }
}

#[derive(Clone)]
pub struct MySqlMemoryStore {
    pool: MySqlPool,
    locks: SessionLocks,
}

impl MySqlMemoryStore {
    pub async fn connect(url: &str) -> Result<Self, MemoryError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(8)
            .connect(url)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("Failed to connect to MySQL: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS memory_messages (
                iid         BIGINT AUTO_INCREMENT PRIMARY KEY,
                session_id  VARCHAR(64) NOT NULL,
                role        VARCHAR(16) NOT NULL,
                content     LONGTEXT NOT NULL,
                created_at  BIGINT NOT NULL,
                INDEX idx_memory_session_order (session_id, created_at, iid)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| MemoryError::Storage(format!("memory_messages table: {e}")))?;

        info!("MySQL memory backend initialized");
        Ok(Self {
            pool,
            locks: SessionLocks::new(),
        })
    }

    pub fn open(&self, session_id: impl Into<String>, max_history: usize) -> MySqlMemory {
        let session_id = session_id.into();
        MySqlMemory {
            pool: self.pool.clone(),
            lock: self.locks.lock_for(&session_id),
            session_id,
            max_history,
        }
    }
}

pub struct MySqlMemory {
    pool: MySqlPool,
    lock: Arc<Mutex<()>>,
    session_id: String,
    max_history: usize,
}

fn query_err(e: sqlx::Error) -> MemoryError {
    MemoryError::QueryFailed(e.to_string())
}

async fn load_rows<'e, E>(executor: E, session_id: &str, for_update: bool) -> Result<Vec<StoredRow>, MemoryError>
where
    E: sqlx::Executor<'e, Database = MySql>,
{
    let sql = if for_update {
        "SELECT iid, role, content, created_at FROM memory_messages \
         WHERE session_id = ? ORDER BY created_at ASC, iid ASC FOR UPDATE"
    } else {
        "SELECT iid, role, content, created_at FROM memory_messages \
         WHERE session_id = ? ORDER BY created_at ASC, iid ASC"
    };
    let rows = sqlx::query(sql)
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

/// Multi-row insert in list order.
async fn insert_rows(
    tx: &mut sqlx::Transaction<'_, MySql>,
    session_id: &str,
    rows: &[(Role, &str, i64)],
) -> Result<(), MemoryError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<MySql>::new("INSERT INTO memory_messages (session_id, role, content, created_at) ");
    qb.push_values(rows, |mut b, (role, content, created_at)| {
        b.push_bind(session_id)
            .push_bind(role.as_str())
            .push_bind(*content)
            .push_bind(*created_at);
    });
    qb.build().execute(&mut **tx).await.map_err(query_err)?;
    Ok(())
}

async fn delete_ids(tx: &mut sqlx::Transaction<'_, MySql>, ids: &[i64]) -> Result<(), MemoryError> {
    if ids.is_empty() {
        return Ok(());
    }
    let mut qb = QueryBuilder::<MySql>::new("DELETE FROM memory_messages WHERE iid IN (");
    let mut sep = qb.separated(", ");
    for id in ids {
        sep.push_bind(*id);
    }
    sep.push_unseparated(")");
    qb.build().execute(&mut **tx).await.map_err(query_err)?;
    Ok(())
}

#[async_trait]
impl MemoryProvider for MySqlMemory {
    fn name(&self) -> &str {
        "mysql"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError> {
        let now = now_micros();
        let mut batch = Vec::with_capacity(2);
        if let Some(text) = input {
            batch.push((Role::User, text, now));
        }
        if let Some(text) = output {
            batch.push((Role::Assistant, text, now));
        }
        if batch.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        insert_rows(&mut tx, &self.session_id, &batch).await?;
        let rows = load_rows(&mut *tx, &self.session_id, true).await?;
        let keys: Vec<(i64, Role)> = rows.iter().map(|r| (r.iid, r.role)).collect();
        delete_ids(&mut tx, &overflow_ids(&keys, self.max_history)).await?;
        tx.commit().await.map_err(query_err)?;
        Ok(())
    }

    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError> {
        let rows = load_rows(&self.pool, &self.session_id, false).await?;
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
        let snapshot: Vec<Message> = load_rows(&self.pool, &self.session_id, false)
            .await?
            .iter()
            .map(StoredRow::to_message)
            .collect();
        let Some(part) = compression::partition(&snapshot, max_messages) else {
            return Ok(false);
        };

        let summary = compression::summarize(llm, &part.old).await?;

        let _guard = self.lock.lock().await;
        let mut tx = self.pool.begin().await.map_err(query_err)?;
        let current_rows = load_rows(&mut *tx, &self.session_id, true).await?;
        let current: Vec<Message> = current_rows.iter().map(StoredRow::to_message).collect();
        let Some(replacement) = compression::reconcile(&snapshot, &part, &summary, &current, max_messages)
        else {
            return Ok(false);
        };

        let pivot = current_rows.iter().map(|r| r.iid).max().unwrap_or(0);
        let sys = part.system.len();
        let tail_start = sys + part.old.len();
        let stamped: Vec<(Role, &str, i64)> = replacement
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                let created_at = if i < sys {
                    current_rows[i].created_at
                } else if i == sys {
                    current_rows.get(tail_start).map(|r| r.created_at).unwrap_or_else(now_micros)
                } else {
                    current_rows[tail_start + i - sys - 1].created_at
                };
                (msg.role, msg.content.as_str(), created_at)
            })
            .collect();
        insert_rows(&mut tx, &self.session_id, &stamped).await?;

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
        debug!(session_id = %self.session_id, rows = replacement.len(), "Compressed MySQL memory");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SummaryStub;

    /// Needs a live server: `CORTEX_TEST_MYSQL_URL=mysql://... cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn roundtrip_against_live_server() {
        let Ok(url) = std::env::var("CORTEX_TEST_MYSQL_URL") else {
            return;
        };
        let store = MySqlMemoryStore::connect(&url).await.unwrap();
        let mem = store.open(uuid::Uuid::new_v4().to_string(), 100);
        for i in 0..12 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        assert!(mem.compress_memory(&SummaryStub::new("SUM"), 10).await.unwrap());
        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 11);
        assert_eq!(h[0].content, "Previous conversation summary: SUM");
        mem.clear().await.unwrap();
    }
}
