//! Model catalog fetch for an OpenAI-compatible endpoint.

use std::time::Duration;

use cortex_core::error::ProviderError;
use tracing::debug;

/// Deadline for the catalog request.
pub const CATALOG_TIMEOUT: Duration = Duration::from_secs(10);

/// The catalog URL for a base URL and provider name.
///
/// `{base}/models` when the base already ends in `/v1`, when the provider is
/// `volce`, or when the base contains `/api/v3`; `{base}/v1/models` otherwise.
pub fn models_url(base_url: &str, provider: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/v1") || provider.eq_ignore_ascii_case("volce") || base.contains("/api/v3") {
        format!("{base}/models")
    } else {
        format!("{base}/v1/models")
    }
}

/// Pull model ids out of `{data:[{id|model|name}]}`.
pub fn parse_models(body: &serde_json::Value) -> Vec<String> {
    body["data"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|m| {
                    ["id", "model", "name"]
                        .iter()
                        .find_map(|k| m[*k].as_str())
                        .map(String::from)
                })
                .collect()
        })
        .unwrap_or_default()
}

/// GET the model list with a bearer key.
pub async fn fetch_models(
    client: &reqwest::Client,
    base_url: &str,
    provider: &str,
    api_key: Option<&str>,
) -> Result<Vec<String>, ProviderError> {
    let url = models_url(base_url, provider);
    debug!(provider, url = %url, "Fetching model catalog");

    let mut request = client.get(&url).timeout(CATALOG_TIMEOUT);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.bearer_auth(key);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            ProviderError::Timeout(format!("model catalog: {e}"))
        } else {
            ProviderError::Network(e.to_string())
        }
    })?;

    let status = response.status().as_u16();
    if status == 401 || status == 403 {
        return Err(ProviderError::AuthenticationFailed(
            "Invalid API key or insufficient permissions".into(),
        ));
    }
    if !response.status().is_success() {
        let message = response.text().await.unwrap_or_default();
        return Err(ProviderError::ApiError {
            status_code: status,
            message,
        });
    }

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| ProviderError::Network(e.to_string()))?;

    Ok(parse_models(&body))
}
