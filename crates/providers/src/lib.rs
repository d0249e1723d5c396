//! LLM Provider implementations for Cortex.
//!
//! All providers implement the `cortex_core::LlmProvider` trait. The factory
//! wraps the OpenAI-compatible client in the 429 retrying layer; the engine
//! admits calls through the token-bucket [`RateLimiter`].

pub mod catalog;
pub mod factory;
pub mod openai_compat;
pub mod rate_limit;
pub mod retry;

pub use factory::ProviderFactory;
pub use openai_compat::OpenAiCompatProvider;
pub use rate_limit::{RateLimiter, RateLimiterMetrics};
pub use retry::{RetryPolicy, RetryingProvider, is_rate_limit, parse_retry_delay};
