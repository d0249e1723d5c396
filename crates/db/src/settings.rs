//! Runtime settings cached over the `settings` table.
//!
//! A stored `llm/chat_config` or `memory/config` value replaces the file
//! configuration for that block. Reads hit the store once per key; writes go
//! through [`CachedSettings::set`] and invalidate the cached entry.

use std::collections::HashMap;
use std::sync::Arc;

use cortex_config::{
    ChatLlmSetting, MemorySetting, SETTINGS_GROUP_LLM, SETTINGS_GROUP_MEMORY, SETTINGS_KEY_CHAT_CONFIG,
    SETTINGS_KEY_MEMORY_CONFIG,
};
use cortex_core::error::StoreError;
use cortex_core::store::SettingsStore;
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, warn};

type Key = (String, String);

pub struct CachedSettings {
    store: Arc<dyn SettingsStore>,
    cache: RwLock<HashMap<Key, Option<serde_json::Value>>>,
    file_llm: ChatLlmSetting,
    file_memory: MemorySetting,
}

impl CachedSettings {
    pub fn new(store: Arc<dyn SettingsStore>, file_llm: ChatLlmSetting, file_memory: MemorySetting) -> Self {
        Self {
            store,
            cache: RwLock::new(HashMap::new()),
            file_llm,
            file_memory,
        }
    }

    /// Raw value, cached (including absence).
    pub async fn get(&self, group: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
        let k = (group.to_string(), key.to_string());
        if let Some(v) = self.cache.read().await.get(&k) {
            return Ok(v.clone());
        }
        let value = self.store.get_setting(group, key).await?;
        debug!(group, key, present = value.is_some(), "Settings cache fill");
        self.cache.write().await.insert(k, value.clone());
        Ok(value)
    }

    /// Write through to the store and drop the cached entry.
    pub async fn set(&self, group: &str, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        self.store.set_setting(group, key, value).await?;
        self.cache
            .write()
            .await
            .remove(&(group.to_string(), key.to_string()));
        Ok(())
    }

    async fn typed_or<T: DeserializeOwned + Clone>(&self, group: &str, key: &str, fallback: &T) -> T {
        match self.get(group, key).await {
            Ok(Some(value)) => match serde_json::from_value::<T>(value) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(group, key, error = %e, "Stored setting is malformed, using file configuration");
                    fallback.clone()
                }
            },
            Ok(None) => fallback.clone(),
            Err(e) => {
                warn!(group, key, error = %e, "Settings lookup failed, using file configuration");
                fallback.clone()
            }
        }
    }

    /// The chat-LLM setting in effect.
    pub async fn chat_llm(&self) -> ChatLlmSetting {
        self.typed_or(SETTINGS_GROUP_LLM, SETTINGS_KEY_CHAT_CONFIG, &self.file_llm)
            .await
    }

    /// The memory setting in effect.
    pub async fn memory(&self) -> MemorySetting {
        self.typed_or(SETTINGS_GROUP_MEMORY, SETTINGS_KEY_MEMORY_CONFIG, &self.file_memory)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Counts reads hitting the backing store.
    struct Counting {
        inner: InMemoryStore,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl SettingsStore for Counting {
        async fn get_setting(&self, group: &str, key: &str) -> Result<Option<serde_json::Value>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_setting(group, key).await
        }

        async fn set_setting(&self, group: &str, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
            self.inner.set_setting(group, key, value).await
        }
    }

    fn counting() -> Arc<Counting> {
        Arc::new(Counting {
            inner: InMemoryStore::new(),
            reads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn file_config_until_stored_value_then_invalidated() {
        let store = counting();
        let settings = CachedSettings::new(store.clone(), ChatLlmSetting::default(), MemorySetting::default());

        assert_eq!(settings.chat_llm().await.base_url, "https://api.openai.com/v1");
        assert_eq!(settings.chat_llm().await.base_url, "https://api.openai.com/v1");
        assert_eq!(store.reads.load(Ordering::SeqCst), 1);

        settings
            .set("llm", "chat_config", &serde_json::json!({"base_url": "http://llm.local/v1"}))
            .await
            .unwrap();
        assert_eq!(settings.chat_llm().await.base_url, "http://llm.local/v1");
        assert_eq!(store.reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_stored_value_falls_back() {
        let store = counting();
        store
            .set_setting("memory", "config", &serde_json::json!({"sqlite": "not a table"}))
            .await
            .unwrap();
        let settings = CachedSettings::new(store, ChatLlmSetting::default(), MemorySetting::default());
        assert_eq!(settings.memory().await.selected_backend(), "simple");
    }

    #[tokio::test]
    async fn stored_memory_setting_wins() {
        let store = counting();
        store
            .set_setting("memory", "config", &serde_json::json!({"simple": {"max_history_messages": 20}}))
            .await
            .unwrap();
        let settings = CachedSettings::new(store, ChatLlmSetting::default(), MemorySetting::default());
        assert_eq!(settings.memory().await.max_history_messages(), 20);
    }
}
