//! Token-bucket admission for LLM calls.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use cortex_core::error::ProviderError;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A token bucket of `capacity` tokens refilled at `refill_per_sec`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
    allowed: AtomicU64,
    rejected: AtomicU64,
    waits: AtomicU64,
    wait_micros: AtomicU64,
}

/// Snapshot of limiter counters.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterMetrics {
    pub allowed: u64,
    pub rejected: u64,
    pub hit_rate: f64,
    pub avg_wait_ms: f64,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(10, 10.0)
    }
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            allowed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            wait_micros: AtomicU64::new(0),
        }
    }

    fn try_take(&self) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Non-blocking admission.
    pub fn allow(&self) -> bool {
        if self.try_take() {
            self.allowed.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Poll every 10 ms until a token is available, the token is cancelled,
    /// or `deadline` passes.
    pub async fn wait(
        &self,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), ProviderError> {
        let started = Instant::now();
        loop {
            if self.try_take() {
                let waited = started.elapsed();
                self.allowed.fetch_add(1, Ordering::Relaxed);
                self.waits.fetch_add(1, Ordering::Relaxed);
                self.wait_micros
                    .fetch_add(waited.as_micros() as u64, Ordering::Relaxed);
                debug!(waited_ms = waited.as_millis() as u64, "Rate limiter admitted call");
                return Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(ProviderError::Timeout("rate limiter wait exceeded deadline".into()));
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(ProviderError::Cancelled);
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let allowed = self.allowed.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let waits = self.waits.load(Ordering::Relaxed);
        let wait_micros = self.wait_micros.load(Ordering::Relaxed);
        let total = allowed + rejected;
        RateLimiterMetrics {
            allowed,
            rejected,
            hit_rate: if total == 0 { 1.0 } else { allowed as f64 / total as f64 },
            avg_wait_ms: if waits == 0 {
                0.0
            } else {
                wait_micros as f64 / waits as f64 / 1000.0
            },
        }
    }
}
