//! MongoDB memory backend.
//!
//! One document per message. Documents order by `(created_at, seq)`; every
//! write belongs to a `batch_id`, which lets compression insert a complete
//! replacement, verify it, and only then delete the superseded batches.

use std::sync::Arc;

use async_trait::async_trait;
use cortex_core::error::MemoryError;
use cortex_core::memory::{MemoryProvider, apply_window};
use cortex_core::message::{Message, Role};
use cortex_core::provider::LlmProvider;
use futures::TryStreamExt;
use mongodb::bson::doc;
use mongodb::{Client, Collection, IndexModel};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{SessionLocks, compression, now_micros};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MemoryDoc {
    id: String,
    session_id: String,
    role: String,
    content: String,
    created_at: i64,
    seq: i64,
    batch_id: String,
}

impl MemoryDoc {
    fn to_message(&self) -> Result<Message, MemoryError> {
        let role: Role = self.role.parse().map_err(MemoryError::QueryFailed)?;
        Ok(Message {
            role,
            ..Message::user(&self.content)
        })
    }
}

fn mongo_err(e: mongodb::error::Error) -> MemoryError {
    MemoryError::QueryFailed(e.to_string())
}

#[derive(Clone)]
pub struct MongoMemoryStore {
    collection: Collection<MemoryDoc>,
    locks: SessionLocks,
}

impl MongoMemoryStore {
    pub async fn connect(uri: &str, database: &str, collection: &str) -> Result<Self, MemoryError> {
        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("Failed to connect to MongoDB: {e}")))?;
        let collection = client.database(database).collection::<MemoryDoc>(collection);

        collection
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "session_id": 1, "created_at": 1, "seq": 1 })
                    .build(),
            )
            .await
            .map_err(|e| MemoryError::Storage(format!("memory index: {e}")))?;

        info!(database, "MongoDB memory backend initialized");
        Ok(Self {
            collection,
            locks: SessionLocks::new(),
        })
    }

    pub fn open(&self, session_id: impl Into<String>, max_history: usize) -> MongoMemory {
        let session_id = session_id.into();
        MongoMemory {
            collection: self.collection.clone(),
            lock: self.locks.lock_for(&session_id),
            session_id,
            max_history,
        }
    }
}

pub struct MongoMemory {
    collection: Collection<MemoryDoc>,
    lock: Arc<Mutex<()>>,
    session_id: String,
    max_history: usize,
}

impl MongoMemory {
    async fn load_docs(&self) -> Result<Vec<MemoryDoc>, MemoryError> {
        self.collection
            .find(doc! { "session_id": &self.session_id })
            .sort(doc! { "created_at": 1, "seq": 1 })
            .await
            .map_err(mongo_err)?
            .try_collect()
            .await
            .map_err(mongo_err)
    }

    async fn load_messages(&self) -> Result<Vec<Message>, MemoryError> {
        self.load_docs().await?.iter().map(MemoryDoc::to_message).collect()
    }

    fn new_doc(&self, batch_id: &str, role: Role, content: &str, created_at: i64, seq: usize) -> MemoryDoc {
        MemoryDoc {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            role: role.as_str().to_string(),
            content: content.to_string(),
            created_at,
            seq: seq as i64,
            batch_id: batch_id.to_string(),
        }
    }

    /// Drop the oldest non-system documents beyond the window.
    async fn trim(&self) -> Result<(), MemoryError> {
        let docs = self.load_docs().await?;
        if docs.len() <= self.max_history {
            return Ok(());
        }
        let lead = docs.iter().take_while(|d| d.role == Role::System.as_str()).count();
        let excess = docs.len() - self.max_history;
        let ids: Vec<&str> = docs[lead..].iter().take(excess).map(|d| d.id.as_str()).collect();
        if ids.is_empty() {
            return Ok(());
        }
        self.collection
            .delete_many(doc! { "session_id": &self.session_id, "id": { "$in": ids } })
            .await
            .map_err(mongo_err)?;
        Ok(())
    }
}

#[async_trait]
impl MemoryProvider for MongoMemory {
    fn name(&self) -> &str {
        "mongodb"
    }

    fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn save_context(&self, input: Option<&str>, output: Option<&str>) -> Result<(), MemoryError> {
        let now = now_micros();
        let batch_id = uuid::Uuid::new_v4().to_string();
        let mut docs = Vec::with_capacity(2);
        if let Some(text) = input {
            docs.push(self.new_doc(&batch_id, Role::User, text, now, docs.len()));
        }
        if let Some(text) = output {
            docs.push(self.new_doc(&batch_id, Role::Assistant, text, now, docs.len()));
        }
        if docs.is_empty() {
            return Ok(());
        }

        let _guard = self.lock.lock().await;
        self.collection.insert_many(docs).await.map_err(mongo_err)?;
        self.trim().await
    }

    async fn get_chat_history(&self) -> Result<Vec<Message>, MemoryError> {
        Ok(apply_window(self.load_messages().await?, self.max_history))
    }

    async fn clear(&self) -> Result<(), MemoryError> {
        let _guard = self.lock.lock().await;
        self.collection
            .delete_many(doc! { "session_id": &self.session_id })
            .await
            .map_err(mongo_err)?;
        Ok(())
    }

    async fn compress_memory(&self, llm: &dyn LlmProvider, max_messages: usize) -> Result<bool, MemoryError> {
        let snapshot = self.load_messages().await?;
        let Some(part) = compression::partition(&snapshot, max_messages) else {
            return Ok(false);
        };

        let summary = compression::summarize(llm, &part.old).await?;

        let _guard = self.lock.lock().await;
        let current_docs = self.load_docs().await?;
        let current: Vec<Message> = current_docs
            .iter()
            .map(MemoryDoc::to_message)
            .collect::<Result<_, _>>()?;
        let Some(replacement) = compression::reconcile(&snapshot, &part, &summary, &current, max_messages)
        else {
            return Ok(false);
        };

        let batch_id = uuid::Uuid::new_v4().to_string();
        let sys = part.system.len();
        let tail_start = sys + part.old.len();
        let docs: Vec<MemoryDoc> = replacement
            .iter()
            .enumerate()
            .map(|(i, msg)| {
                let created_at = if i < sys {
                    current_docs[i].created_at
                } else if i == sys {
                    current_docs.get(tail_start).map(|d| d.created_at).unwrap_or_else(now_micros)
                } else {
                    current_docs[tail_start + i - sys - 1].created_at
                };
                self.new_doc(&batch_id, msg.role, &msg.content, created_at, i)
            })
            .collect();

        self.collection.insert_many(docs).await.map_err(mongo_err)?;

        let inserted = self
            .collection
            .count_documents(doc! { "session_id": &self.session_id, "batch_id": &batch_id })
            .await
            .map_err(mongo_err)?;
        if inserted as usize != replacement.len() {
            warn!(session_id = %self.session_id, inserted, expected = replacement.len(), "Compression verify failed");
            self.collection
                .delete_many(doc! { "session_id": &self.session_id, "batch_id": &batch_id })
                .await
                .map_err(mongo_err)?;
            return Err(MemoryError::Verification(format!(
                "expected {} documents, found {inserted}",
                replacement.len()
            )));
        }

        self.collection
            .delete_many(doc! { "session_id": &self.session_id, "batch_id": { "$ne": &batch_id } })
            .await
            .map_err(mongo_err)?;
        debug!(session_id = %self.session_id, rows = replacement.len(), "Compressed MongoDB memory");
        Ok(true)
    }
}
