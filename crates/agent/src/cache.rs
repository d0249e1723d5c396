//! LRU cache of tool results keyed by tool name and canonical arguments.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::time::Instant;

pub const DEFAULT_CAPACITY: usize = 100;
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry {
    value: serde_json::Value,
    inserted: Instant,
    last_used: u64,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, Entry>,
    tick: u64,
}

pub struct ToolCache {
    capacity: usize,
    ttl: Duration,
    inner: RwLock<Inner>,
}

impl Default for ToolCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_TTL)
    }
}

/// JSON with object keys sorted at every level.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, key) in keys.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String(key.clone()).to_string());
                    out.push(':');
                    write(&map[key], out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

/// SHA-256 over `name ‖ 0x00 ‖ canonical-json(args)`, hex encoded.
pub fn cache_key(tool_name: &str, args: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tool_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical_json(args).as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

impl ToolCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            inner: RwLock::new(Inner::default()),
        }
    }

    /// A live entry, promoted to most recently used.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        // Misses stay on the read lock
        if !self.inner.read().unwrap_or_else(|e| e.into_inner()).entries.contains_key(key) {
            return None;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;
        let ttl = self.ttl;
        let expired = match inner.entries.get_mut(key) {
            Some(e) if e.inserted.elapsed() < ttl => {
                e.last_used = tick;
                return Some(e.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: String, value: serde_json::Value) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.tick += 1;
        let tick = inner.tick;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            let ttl = self.ttl;
            inner.entries.retain(|_, e| e.inserted.elapsed() < ttl);
            if inner.entries.len() >= self.capacity
                && let Some(oldest) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
            {
                inner.entries.remove(&oldest);
            }
        }
        inner.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                last_used: tick,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_ignores_object_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": [1, 2], "x": "s"}});
        let b = serde_json::json!({"a": {"x": "s", "y": [1, 2]}, "b": 1});
        assert_eq!(cache_key("t", &a), cache_key("t", &b));
        assert_ne!(cache_key("t", &a), cache_key("u", &a));
        assert_eq!(canonical_json(&b), r#"{"a":{"x":"s","y":[1,2]},"b":1}"#);
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ToolCache::new(2, DEFAULT_TTL);
        cache.put("a".into(), serde_json::json!(1));
        cache.put("b".into(), serde_json::json!(2));
        assert!(cache.get("a").is_some());
        cache.put("c".into(), serde_json::json!(3));
        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn misses_do_not_touch_recency() {
        let cache = ToolCache::new(2, DEFAULT_TTL);
        cache.put("a".into(), serde_json::json!(1));
        cache.put("b".into(), serde_json::json!(2));
        for _ in 0..5 {
            assert!(cache.get("missing").is_none());
        }
        cache.put("c".into(), serde_json::json!(3));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(serde_json::json!(2)));
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = ToolCache::new(10, Duration::from_secs(300));
        cache.put("k".into(), serde_json::json!("v"));
        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(cache.get("k"), Some(serde_json::json!("v")));
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }
}
