//! Memory providers for Cortex.
//!
//! Every backend implements `cortex_core::MemoryProvider` bound to a single
//! session:
//! - `simple` — in-process lists
//! - `sqlite` / `mysql` — sqlx pools, transactional compression
//! - `mongodb` — document store, batch insert + verify + delete
//! - `redis` — list per session, temp key + rename
//!
//! [`MemoryFactory`] opens the backend named by the memory setting; the
//! agent engine never names a backend directly.

pub mod compression;
pub mod factory;
pub mod simple;

#[cfg(feature = "mongodb")]
pub mod mongo;
#[cfg(feature = "mysql")]
pub mod mysql;
#[cfg(feature = "redis")]
pub mod redis_list;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(test)]
pub(crate) mod testing;

pub use factory::MemoryFactory;
pub use simple::{SimpleMemory, SimpleMemoryStore};

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

/// Per-session write locks shared by all providers of one backend.
#[derive(Clone, Default)]
pub struct SessionLocks {
    inner: Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock guarding writes to `session_id`.
    ///
    /// Entries no provider holds any more are dropped on the way.
    pub fn lock_for(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.retain(|id, lock| id == session_id || Arc::strong_count(lock) > 1);
        map.entry(session_id.to_string()).or_default().clone()
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Microseconds since the Unix epoch; the stored ordering timestamp.
pub(crate) fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Ids of the oldest non-system rows to drop so that `rows` fits in `max`.
/// Leading system rows are never dropped. `rows` must be in display order.
#[cfg(any(feature = "sqlite", feature = "mysql"))]
pub(crate) fn overflow_ids(rows: &[(i64, cortex_core::Role)], max: usize) -> Vec<i64> {
    if rows.len() <= max {
        return Vec::new();
    }
    let lead = rows
        .iter()
        .take_while(|(_, role)| *role == cortex_core::Role::System)
        .count();
    let excess = rows.len() - max;
    rows[lead..].iter().take(excess).map(|(iid, _)| *iid).collect()
}
