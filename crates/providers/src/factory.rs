//! Build a provider for a `(provider, model)` pair from the chat-LLM setting.

use std::sync::Arc;
use std::time::Duration;

use cortex_config::ChatLlmSetting;
use cortex_core::provider::{ChatOptions, LlmProvider};
use tracing::debug;

use crate::openai_compat::OpenAiCompatProvider;
use crate::retry::{RetryPolicy, RetryingProvider};

/// Creates providers and shares one HTTP client between them.
#[derive(Clone)]
pub struct ProviderFactory {
    client: reqwest::Client,
}

impl Default for ProviderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// The retrying OpenAI-compatible provider for `(provider, model)`.
    pub fn build(
        &self,
        setting: &ChatLlmSetting,
        provider: &str,
        model: &str,
        options: ChatOptions,
    ) -> Arc<dyn LlmProvider> {
        let endpoint = setting.resolve(provider);
        debug!(provider, model, base_url = %endpoint.base_url, api_type = %endpoint.api_type, "Building LLM provider");

        let attempt_timeout = options.timeout;
        let inner = OpenAiCompatProvider::new(provider, endpoint.base_url, endpoint.api_key, model)
            .with_organization(endpoint.organization)
            .with_options(options)
            .with_client(self.client.clone());

        Arc::new(RetryingProvider::new(
            Arc::new(inner),
            RetryPolicy {
                max_retries: setting.max_retries,
                default_delay: Duration::from_millis(setting.retry_delay_ms),
                attempt_timeout,
            },
        ))
    }

    /// List models for a provider name without binding a model.
    pub async fn list_models(
        &self,
        setting: &ChatLlmSetting,
        provider: &str,
    ) -> Result<Vec<String>, cortex_core::error::ProviderError> {
        let endpoint = setting.resolve(provider);
        let catalog_provider = if endpoint.api_type.eq_ignore_ascii_case("volce") {
            "volce"
        } else {
            provider
        };
        crate::catalog::fetch_models(
            &self.client,
            &endpoint.base_url,
            catalog_provider,
            endpoint.api_key.as_deref(),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_named_provider() {
        let setting = ChatLlmSetting::default();
        let p = ProviderFactory::new().build(&setting, "deepseek", "deepseek-chat", ChatOptions::default());
        assert_eq!(p.name(), "deepseek");
        assert_eq!(p.model(), "deepseek-chat");
    }
}
