//! Rate-limit detection, `Retry-After` parsing and the retrying wrapper.
//!
//! Only rate-limit failures are retried. The delay comes from the error
//! text when it names one (`"retry after 250 ms"`), otherwise the configured
//! default applies.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use cortex_core::error::ProviderError;
use cortex_core::message::Message;
use cortex_core::provider::{ChatResponse, LlmProvider, StreamEvent, StreamReceiver, ToolDefinition};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

static RETRY_DELAY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:retry|wait|after)\D{0,20}?(\d+)\s*(milliseconds|millisecond|ms|minutes|minute|mins|min|m|seconds|second|secs|sec|s)?\b",
    )
    .unwrap_or_else(|e| panic!("invalid retry regex: {e}"))
});

/// True when an error message looks like a provider rate limit.
pub fn is_rate_limit(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("429")
        || lower.contains("rate limit")
        || lower.contains("rate_limit")
        || lower.contains("too many requests")
}

/// Extract a wait hint from an error message. A bare integer is milliseconds.
pub fn parse_retry_delay(message: &str) -> Option<Duration> {
    let caps = RETRY_DELAY_RE.captures(message)?;
    let n: u64 = caps.get(1)?.as_str().parse().ok()?;
    let unit = caps.get(2).map(|m| m.as_str().to_lowercase());
    let delay = match unit.as_deref() {
        None | Some("ms" | "millisecond" | "milliseconds") => Duration::from_millis(n),
        Some("s" | "sec" | "secs" | "second" | "seconds") => Duration::from_secs(n),
        Some("m" | "min" | "mins" | "minute" | "minutes") => Duration::from_secs(n * 60),
        Some(_) => return None,
    };
    Some(delay)
}

/// How many times to retry a rate-limited call and how long to wait by default.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub default_delay: Duration,
    /// Deadline of each attempt. Back-off sleeps run outside it.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_delay: Duration::from_secs(1),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    /// The delay to sleep for a given rate-limit message.
    pub fn delay_for(&self, message: &str) -> Duration {
        parse_retry_delay(message).unwrap_or(self.default_delay)
    }

    async fn within<T>(
        &self,
        fut: impl Future<Output = Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| Err(ProviderError::Timeout(format!("LLM call exceeded {}s", limit.as_secs())))),
            None => fut.await,
        }
    }
}

fn is_rate_limit_error(err: &ProviderError) -> bool {
    matches!(err, ProviderError::RateLimited { .. }) || is_rate_limit(&err.to_string())
}

/// Wraps any provider with 429 retry for both blocking and streaming calls.
pub struct RetryingProvider {
    inner: Arc<dyn LlmProvider>,
    policy: RetryPolicy,
}

impl RetryingProvider {
    pub fn new(inner: Arc<dyn LlmProvider>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl LlmProvider for RetryingProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn chat_with_tools(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<ChatResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            match self.policy.within(self.inner.chat_with_tools(messages, tools)).await {
                Ok(response) => return Ok(response),
                Err(e) if is_rate_limit_error(&e) => {
                    if attempt >= self.policy.max_retries {
                        warn!(provider = %self.inner.name(), attempts = attempt + 1, "Rate limit retries exhausted");
                        return Err(ProviderError::CallFailed(format!(
                            "rate limit persisted after {} retries: {e}",
                            self.policy.max_retries
                        )));
                    }
                    let delay = self.policy.delay_for(&e.to_string());
                    attempt += 1;
                    debug!(
                        provider = %self.inner.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Rate limited, sleeping before retry"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(ProviderError::Network(msg)) => return Err(ProviderError::CallFailed(msg)),
                Err(e) => return Err(e),
            }
        }
    }

    async fn chat_with_tools_stream(
        &self,
        messages: &[Message],
        tools: &[ToolDefinition],
    ) -> Result<StreamReceiver, ProviderError> {
        let (tx, rx) = mpsc::channel(64);
        let inner = self.inner.clone();
        let policy = self.policy.clone();
        let messages = messages.to_vec();
        let tools = tools.to_vec();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                if attempt > 0 && tx.send(StreamEvent::Retry { attempt }).await.is_err() {
                    return;
                }

                // A rate limit can surface either when opening the stream or as
                // the first event; both are retryable until content has flowed.
                let failure = match policy.within(inner.chat_with_tools_stream(&messages, &tools)).await {
                    Err(e) if is_rate_limit_error(&e) => e.to_string(),
                    Err(e) => {
                        let _ = tx.send(StreamEvent::Error { error: e.to_string() }).await;
                        return;
                    }
                    Ok(mut upstream) => {
                        let mut forwarded = false;
                        let mut retry_reason = None;
                        while let Some(event) = upstream.recv().await {
                            if let StreamEvent::Error { error } = &event
                                && !forwarded
                                && is_rate_limit(error)
                            {
                                retry_reason = Some(error.clone());
                                break;
                            }
                            forwarded = true;
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        match retry_reason {
                            Some(reason) => reason,
                            None => return,
                        }
                    }
                };

                if attempt >= policy.max_retries {
                    let _ = tx
                        .send(StreamEvent::Error {
                            error: ProviderError::CallFailed(format!(
                                "rate limit persisted after {} retries: {failure}",
                                policy.max_retries
                            ))
                            .to_string(),
                        })
                        .await;
                    return;
                }

                let delay = policy.delay_for(&failure);
                let notice = StreamEvent::Info {
                    message: format!("Rate limited, retrying in {} ms", delay.as_millis()),
                };
                if tx.send(notice).await.is_err() {
                    return;
                }
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = tx.closed() => return,
                }
                attempt += 1;
            }
        });

        Ok(rx)
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        self.inner.list_models().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn detects_rate_limits() {
        assert!(is_rate_limit("HTTP 429"));
        assert!(is_rate_limit("Rate Limit exceeded"));
        assert!(is_rate_limit("error code: rate_limit_exceeded"));
        assert!(is_rate_limit("Too Many Requests"));
        assert!(!is_rate_limit("internal server error"));
    }

    #[test]
    fn parses_retry_delays() {
        assert_eq!(parse_retry_delay("retry after 250 ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_retry_delay("wait: 2 seconds"), Some(Duration::from_secs(2)));
        assert_eq!(parse_retry_delay("try again after 1 minute"), Some(Duration::from_secs(60)));
        assert_eq!(
            parse_retry_delay("rate limit exceeded, retry after 100 ms"),
            Some(Duration::from_millis(100))
        );
        assert_eq!(parse_retry_delay("Please retry after 1500"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_delay("wait 3s"), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_delay("Too Many Requests"), None);
    }

    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for Flaky {
        fn name(&self) -> &str {
            "flaky"
        }
        fn model(&self) -> &str {
            "m"
        }
        async fn chat_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(ProviderError::ApiError {
                    status_code: 429,
                    message: "rate limit exceeded, retry after 100 ms".into(),
                });
            }
            Ok(ChatResponse {
                message: Message::assistant("ok"),
                usage: None,
                model: "m".into(),
            })
        }
    }

    fn wrap(failures: u32, max_retries: u32) -> (Arc<Flaky>, RetryingProvider) {
        let inner = Arc::new(Flaky {
            failures,
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            max_retries,
            default_delay: Duration::from_millis(5),
            attempt_timeout: None,
        };
        (inner.clone(), RetryingProvider::new(inner, policy))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_then_succeeds() {
        let (inner, provider) = wrap(2, 3);
        let start = tokio::time::Instant::now();
        let resp = provider.chat(&[Message::user("hi")]).await.unwrap();
        assert_eq!(resp.message.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
        assert!(start.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_fail_with_call_failed() {
        let (inner, provider) = wrap(10, 2);
        let err = provider.chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(err.to_string().contains("LLM_CALL_FAILED"));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_emits_info_and_retry() {
        let (_inner, provider) = wrap(1, 3);
        let mut rx = provider.chat_with_tools_stream(&[Message::user("hi")], &[]).await.unwrap();
        let mut kinds = Vec::new();
        while let Some(event) = rx.recv().await {
            kinds.push(match event {
                StreamEvent::Info { .. } => "info",
                StreamEvent::Retry { .. } => "retry",
                StreamEvent::Chunk { .. } => "chunk",
                StreamEvent::End { .. } => "end",
                StreamEvent::ToolCalls { .. } => "tool_calls",
                StreamEvent::Error { .. } => "error",
            });
        }
        assert_eq!(kinds, vec!["info", "retry", "chunk", "end"]);
    }

    struct Hangs;

    #[async_trait]
    impl LlmProvider for Hangs {
        fn name(&self) -> &str {
            "hangs"
        }
        fn model(&self) -> &str {
            "m"
        }
        async fn chat_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse, ProviderError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ProviderError::NoResponse)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_bounds_each_call() {
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(1)),
            ..RetryPolicy::default()
        };
        let provider = RetryingProvider::new(Arc::new(Hangs), policy);
        let start = tokio::time::Instant::now();
        let err = provider.chat(&[Message::user("hi")]).await.unwrap_err();
        assert!(matches!(err, ProviderError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    /// Rate limited once with a hint longer than the attempt timeout.
    struct LongHint {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmProvider for LongHint {
        fn name(&self) -> &str {
            "long-hint"
        }
        fn model(&self) -> &str {
            "m"
        }
        async fn chat_with_tools(
            &self,
            _messages: &[Message],
            _tools: &[ToolDefinition],
        ) -> Result<ChatResponse, ProviderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ProviderError::RateLimited {
                    message: "wait: 5 seconds".into(),
                });
            }
            Ok(ChatResponse {
                message: Message::assistant("ok"),
                usage: None,
                model: "m".into(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn back_off_sleep_is_outside_the_attempt_timeout() {
        let inner = Arc::new(LongHint {
            calls: AtomicU32::new(0),
        });
        let policy = RetryPolicy {
            attempt_timeout: Some(Duration::from_secs(1)),
            ..RetryPolicy::default()
        };
        let provider = RetryingProvider::new(inner.clone(), policy);
        let start = tokio::time::Instant::now();
        let resp = provider.chat(&[Message::user("hi")]).await.unwrap();
        assert_eq!(resp.message.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
