//! Backend selection.

use std::sync::Arc;

use cortex_config::MemorySetting;
use cortex_core::error::MemoryError;
use cortex_core::memory::MemoryProvider;
use tracing::info;

use crate::simple::SimpleMemoryStore;

enum Backend {
    Simple(Arc<SimpleMemoryStore>),
    #[cfg(feature = "sqlite")]
    Sqlite(crate::sqlite::SqliteMemoryStore),
    #[cfg(feature = "mysql")]
    MySql(crate::mysql::MySqlMemoryStore),
    #[cfg(feature = "mongodb")]
    Mongo(crate::mongo::MongoMemoryStore),
    #[cfg(feature = "redis")]
    Redis(crate::redis_list::RedisMemoryStore),
}

/// Holds one connected backend and opens per-session providers on it.
#[derive(Clone)]
pub struct MemoryFactory {
    backend: Arc<Backend>,
    default_max_history: usize,
}

impl MemoryFactory {
    /// In-process memory, no configuration needed.
    pub fn simple(default_max_history: usize) -> Self {
        Self {
            backend: Arc::new(Backend::Simple(Arc::new(SimpleMemoryStore::new()))),
            default_max_history,
        }
    }

    /// Connect the backend named by `setting`.
    pub async fn connect(setting: &MemorySetting) -> Result<Self, MemoryError> {
        let name = setting.selected_backend().to_ascii_lowercase();
        let max = setting.max_history_messages();

        let backend = match name.as_str() {
            "simple" | "memory" => Backend::Simple(Arc::new(SimpleMemoryStore::new())),
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let cfg = setting.sqlite.as_ref().ok_or_else(|| missing("sqlite"))?;
                Backend::Sqlite(crate::sqlite::SqliteMemoryStore::connect(&cfg.url).await?)
            }
            #[cfg(feature = "mysql")]
            "mysql" => {
                let cfg = setting.mysql.as_ref().ok_or_else(|| missing("mysql"))?;
                Backend::MySql(crate::mysql::MySqlMemoryStore::connect(&cfg.url).await?)
            }
            #[cfg(feature = "mongodb")]
            "mongodb" | "mongo" => {
                let cfg = setting.mongodb.as_ref().ok_or_else(|| missing("mongodb"))?;
                Backend::Mongo(
                    crate::mongo::MongoMemoryStore::connect(&cfg.uri, &cfg.database, &cfg.collection).await?,
                )
            }
            #[cfg(feature = "redis")]
            "redis" => {
                let cfg = setting.redis.as_ref().ok_or_else(|| missing("redis"))?;
                Backend::Redis(crate::redis_list::RedisMemoryStore::connect(&cfg.url, &cfg.key_prefix).await?)
            }
            other => {
                return Err(MemoryError::Unavailable(format!(
                    "Unknown or disabled memory backend: {other}"
                )));
            }
        };

        info!(backend = %name, max_history = max, "Memory backend ready");
        Ok(Self {
            backend: Arc::new(backend),
            default_max_history: max,
        })
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend.as_ref() {
            Backend::Simple(_) => "simple",
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(_) => "sqlite",
            #[cfg(feature = "mysql")]
            Backend::MySql(_) => "mysql",
            #[cfg(feature = "mongodb")]
            Backend::Mongo(_) => "mongodb",
            #[cfg(feature = "redis")]
            Backend::Redis(_) => "redis",
        }
    }

    /// Window size configured for the backend.
    pub fn default_max_history(&self) -> usize {
        self.default_max_history
    }

    /// A provider bound to `session_id`; `max_history == 0` uses the default.
    pub fn open(&self, session_id: &str, max_history: usize) -> Arc<dyn MemoryProvider> {
        let max = if max_history == 0 {
            self.default_max_history
        } else {
            max_history
        };
        match self.backend.as_ref() {
            Backend::Simple(store) => Arc::new(store.open(session_id, max)),
            #[cfg(feature = "sqlite")]
            Backend::Sqlite(store) => Arc::new(store.open(session_id, max)),
            #[cfg(feature = "mysql")]
            Backend::MySql(store) => Arc::new(store.open(session_id, max)),
            #[cfg(feature = "mongodb")]
            Backend::Mongo(store) => Arc::new(store.open(session_id, max)),
            #[cfg(feature = "redis")]
            Backend::Redis(store) => Arc::new(store.open(session_id, max)),
        }
    }
}

fn missing(block: &str) -> MemoryError {
    MemoryError::Unavailable(format!("memory backend '{block}' selected but [memory.{block}] is not configured"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cortex_config::SqlMemoryConfig;

    #[tokio::test]
    async fn default_setting_opens_simple_memory() {
        let factory = MemoryFactory::connect(&MemorySetting::default()).await.unwrap();
        assert_eq!(factory.backend_name(), "simple");
        assert_eq!(factory.default_max_history(), 100);

        let a = factory.open("s1", 0);
        a.save_context(Some("hi"), Some("hello")).await.unwrap();
        // Same backend, same session: shared history
        let b = factory.open("s1", 0);
        assert_eq!(b.get_chat_history().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        let setting = MemorySetting {
            backend: Some("cassandra".into()),
            ..Default::default()
        };
        assert!(MemoryFactory::connect(&setting).await.is_err());
    }

    #[tokio::test]
    async fn selected_backend_without_block_is_rejected() {
        let setting = MemorySetting {
            backend: Some("mysql".into()),
            ..Default::default()
        };
        let err = MemoryFactory::connect(&setting).await.err().unwrap();
        assert!(err.to_string().contains("mysql"));
    }

    #[tokio::test]
    async fn sqlite_block_selects_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("mem.db").display());
        let setting = MemorySetting {
            sqlite: Some(SqlMemoryConfig {
                url,
                max_history_messages: Some(6),
            }),
            ..Default::default()
        };
        let factory = MemoryFactory::connect(&setting).await.unwrap();
        assert_eq!(factory.backend_name(), "sqlite");

        let mem = factory.open("s", 0);
        for i in 0..5 {
            mem.save_context(Some(&format!("q{i}")), Some(&format!("a{i}"))).await.unwrap();
        }
        let h = mem.get_chat_history().await.unwrap();
        assert_eq!(h.len(), 6);
        assert_eq!(h[0].content, "q2");
    }
}
