//! Authentication header helpers for provider requests.

use crate::core::builtin_providers::AuthMode;

/// Add provider-specific authentication headers to an HTTP request
///
/// Anthropic-style providers take the key in `x-api-key` together with an
/// `anthropic-version` header; everything else gets a bearer token. An empty
/// key (local servers such as Ollama) sends no credentials at all.
pub fn add_auth_headers(
    request: reqwest::RequestBuilder,
    mode: AuthMode,
    api_key: &str,
) -> reqwest::RequestBuilder {
    if api_key.is_empty() {
        return request;
    }
    match mode {
        AuthMode::Anthropic => request
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01"),
        AuthMode::OpenAi => request.header("Authorization", format!("Bearer {api_key}")),
    }
}
