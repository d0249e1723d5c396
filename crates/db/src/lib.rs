//! Persistence for Cortex.
//!
//! [`SqliteStore`] implements every store trait from `cortex-core` over one
//! sqlx pool. [`InMemoryStore`] is the same contract in process, for tests
//! and throwaway runs. [`CachedSettings`] layers runtime settings from the
//! `settings` table over the file configuration.

pub mod in_memory;
pub mod settings;
pub mod sqlite;

pub use in_memory::InMemoryStore;
pub use settings::CachedSettings;
pub use sqlite::SqliteStore;

use chrono::{DateTime, Utc};

/// Stored timestamps are integer microseconds so that SQL ordering is numeric.
pub(crate) fn to_micros(t: &DateTime<Utc>) -> i64 {
    t.timestamp_micros()
}

pub(crate) fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us).unwrap_or_default()
}
