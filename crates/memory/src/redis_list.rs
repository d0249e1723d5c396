//! Redis memory backend.
//!
//! Layout per session:
//! - `{prefix}:{session}` holds the turns, newest first (LPUSH + LTRIM)
//! - `{prefix}:{session}:system` holds the leading system messages in order
//!
//! Compression builds both lists under temporary keys, checks their
//! lengths, then swaps them in with one MULTI/EXEC of RENAMEs.

use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::MemoryError;
use cortex_core::memory::{MemoryProvider, apply_window};
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{SessionLocks, compression};

#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    role: Role,
    content: String,
}

fn encode(msg: &Message) -> Result<String, MemoryError> {
    serde_json::to_string(&Entry {
        role: msg.role,
        content: msg.content.clone(),
    })
    .map_err(|e| MemoryError::Storage(e.to_string()))
}

fn decode(raw: &str) -> Result<Message, MemoryError> {
    let entry: Entry = serde_json::from_str(raw).map_err(|e| MemoryError::QueryFailed(e.to_string()))?;
    Ok(Message {
        role: entry.role,
        ..Message::user(entry.content)
    })
}

fn redis_err(e: redis::RedisError) -> MemoryError {
    MemoryError::QueryFailed(e.to_string())
}

#[derive(Clone)]
pub struct RedisMemoryStore {
    conn: MultiplexedConnection,
    prefix: String,
    locks: SessionLocks,
}

impl RedisMemoryStore {
    pub async fn connect(url: &str, prefix: &str) -> Result<Self, MemoryError> {
        let client = redis::Client::open(url).map_err(|e| MemoryError::Unavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| MemoryError::Unavailable(format!("Failed to connect to Redis: {e}")))?;
        info!(prefix, "Redis memory backend initialized");
        Ok(Self {
            conn,
            prefix: prefix.trim_end_matches(':').to_string(),
            locks: SessionLocks::new(),
        })
    }

    pub fn open(&self, session_id: impl Into<String>, max_history: usize) -> RedisMemory {
        let session_id = session_id.into();
        RedisMemory {
            conn: self.conn.clone(),
            key: format!("{}:{session_id}", self.prefix),
            lock: self.locks.lock_for(&session_id),
            session_id,
            max_history,
        }
    }
}

pub struct RedisMemory {
    conn: MultiplexedConnection,
    key: String,
    lock: Arc<Mutex<()>>,
    session_id: String,
    max_history: usize,
}

impl RedisMemory {
    fn system_key(&self) -> String {
        format!("{}:system", self.key)
    }

    async fn load(&self) -> Result<(Vec<Message>, Vec<Message>), MemoryError> {
        let mut conn = self.conn.clone();
        let system: Vec<String> = conn.lrange(self.system_key(), 0, -1).await.map_err(redis_err)?;
        let turns: Vec<String> = conn.lrange(&self.key, 0, -1).await.map_err(redis_err)?;
        let system = system.iter().map(|s| decode(s)).collect::<Result<Vec<_>, _>>()?;
        let turns = turns.iter().rev().map(|s| decode(s)).collect::<Result<Vec<_>, _>>()?;
        Ok((system, turns))
    }

    async fn load_all(&self) -> Result<Vec<Message>, MemoryError> {
        let (mut all, turns) = self.load().await?;
        all.extend(turns);
        Ok(all)
    }
}

#[async_trait]
impl MemoryProvider for RedisMemory {
    fn name(&self) -> &str {
        "redis"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError> {
        let mut values = Vec::with_capacity(2);
        if let Some(text) = input {
            values.push(encode(&Message::user(text))?);
        }
        if let Some(text) = output {
            values.push(encode(&Message::assistant(text))?);
        }
        if values.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        let mut conn = self.conn.clone();
        let system_len: usize = conn.llen(self.system_key()).await.map_err(redis_err)?;
        let keep = self.max_history.saturating_sub(system_len);

        let mut pipe = redis::pipe();
        pipe.atomic().lpush(&self.key, &values);
        if keep == 0 {
            pipe.del(&self.key);
        } else {
            pipe.ltrim(&self.key, 0, keep as isize - 1);
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(redis_err)?;
        Ok(())
    }

    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError> {
        Ok(apply_window(self.load_all().await?, self.max_history))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        let mut conn = self.conn.clone();
        let _: () = conn
            .del(vec![self.key.clone(), self.system_key()])
            .await
            .map_err(redis_err)?;
        Ok(())
    }

    async fn compress_memory(&self, llm: &dyn LlmProvider, max_messages: usize) -> Result<bool, MemoryError> {
        let snapshot = self.load_all().await?;
        let Some(part) = compression::partition(&snapshot, max_messages) else {
            return Ok(false);
        };

        let summary = compression::summarize(llm, &part.old).await?;

        let _guard = self.lock.lock().await;
        let current = self.load_all().await?;
        let Some(replacement) = compression::reconcile(&snapshot, &part, &summary, &current, max_messages)
        else {
            return Ok(false);
        };

        let (head, tail) = replacement.split_at(part.system.len() + 1);
        let head = head.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
        // Stored newest first
        let tail = tail.iter().rev().map(encode).collect::<Result<Vec<_>, _>>()?;

        let tmp_key = format!("{}:compress", self.key);
        let tmp_system = format!("{}:compress", self.system_key());
        let mut conn = self.conn.clone();

        let mut build = redis::pipe();
        build.atomic().del(&tmp_key).del(&tmp_system).rpush(&tmp_system, &head);
        if !tail.is_empty() {
            build.rpush(&tmp_key, &tail);
        }
        let _: () = build.query_async(&mut conn).await.map_err(redis_err)?;

        let (system_len, turn_len): (usize, usize) = redis::pipe()
            .llen(&tmp_system)
            .llen(&tmp_key)
            .query_async(&mut conn)
            .await
            .map_err(redis_err)?;
        if system_len != head.len() || turn_len != tail.len() {
            warn!(
                session_id = %self.session_id,
                system_len,
                turn_len,
                "Compression verify failed"
            );
            let _: () = conn.del(vec![tmp_key, tmp_system]).await.map_err(redis_err)?;
            return Err(MemoryError::Verification(format!(
                "expected {}+{} entries, found {system_len}+{turn_len}",
                head.len(),
                tail.len()
            )));
        }

        let mut swap = redis::pipe();
        swap.atomic().rename(&tmp_system, self.system_key());
        if tail.is_empty() {
            swap.del(&self.key);
        } else {
            swap.rename(&tmp_key, &self.key);
        }
        let _: () = swap.query_async(&mut conn).await.map_err(redis_err)?;

        debug!(session_id = %self.session_id, rows = replacement.len(), "Compressed Redis memory");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SummaryStub;

    #[test]
    fn entries_keep_role_and_content() {
        let raw = encode(&Message::system("Previous conversation summary: x")).unwrap();
        assert_eq!(raw, r#"{"role":"system","content":"Previous conversation summary: x"}"#);
        let back = decode(&raw).unwrap();
        assert_eq!(back.role, Role::System);
        assert!(decode("not json").is_err());
    }

    /// Needs a live server: `CORTEX_TEST_REDIS_URL=redis://... cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn window_and_compress_against_live_server() {
        let Ok(url) = std::env::var("CORTEX_TEST_REDIS_URL") else {
            return;
        };
        let store = RedisMemoryStore::connect(&url, "cortex:test").await.unwrap();
        let mem = store.open(uuid::Uuid::new_v4().to_string(), 20);
        for i in 0..15 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 20);
        assert_eq!(h[0].content, "q5");

        assert!(mem.compress_memory(&SummaryStub::new("SUM"), 6).await.unwrap());
        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 7);
        assert_eq!(h[0].role, Role::System);
        assert_eq!(h[6].content, "a14");
        mem.clear().await.unwrap();
    }
}
