//! Built-in provider configuration
//!
//! Providers shipped with the binary are embedded from
//! `builtin_providers.toml`. User-defined `[[providers]]` entries in the
//! config file override these by id.

use serde::{Deserialize, Serialize};

/// How a provider expects its API key to be presented.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    OpenAi,
    Anthropic,
}

impl AuthMode {
    pub fn from_mode(mode: Option<&str>) -> Self {
        match mode.map(str::to_ascii_lowercase).as_deref() {
            Some("anthropic") => AuthMode::Anthropic,
            _ => AuthMode::OpenAi,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinProvider {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub mode: Option<String>,
    pub default_model: Option<String>,
    #[serde(default = "default_requires_key")]
    pub requires_key: bool,
}

fn default_requires_key() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct BuiltinProvidersConfig {
    providers: Vec<BuiltinProvider>,
}

impl BuiltinProvider {
    pub fn auth_mode(&self) -> AuthMode {
        AuthMode::from_mode(self.mode.as_deref())
    }
}

/// Load built-in providers from the embedded configuration
pub fn load_builtin_providers() -> Vec<BuiltinProvider> {
    const CONFIG_CONTENT: &str = include_str!("builtin_providers.toml");

    match toml::from_str::<BuiltinProvidersConfig>(CONFIG_CONTENT) {
        Ok(config) => config.providers,
        Err(err) => {
            tracing::error!(error = %err, "Embedded provider table failed to parse");
            Vec::new()
        }
    }
}

/// Find a built-in provider by ID (case-insensitive)
pub fn find_builtin_provider(id: &str) -> Option<BuiltinProvider> {
    load_builtin_providers()
        .into_iter()
        .find(|p| p.id.eq_ignore_ascii_case(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_table_parses() {
        let providers = load_builtin_providers();
        let ids: Vec<&str> = providers.iter().map(|p| p.id.as_str()).collect();
        assert!(ids.contains(&"openai"));
        assert!(ids.contains(&"anthropic"));
        assert!(ids.contains(&"openrouter"));
        assert!(ids.contains(&"ollama"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let provider = find_builtin_provider("OpenAI").expect("openai builtin");
        assert_eq!(provider.id, "openai");
        assert!(find_builtin_provider("nonexistent").is_none());
    }

    #[test]
    fn auth_modes_and_key_requirements() {
        let anthropic = find_builtin_provider("anthropic").unwrap();
        assert_eq!(anthropic.auth_mode(), AuthMode::Anthropic);
        assert!(anthropic.requires_key);

        let ollama = find_builtin_provider("ollama").unwrap();
        assert_eq!(ollama.auth_mode(), AuthMode::OpenAi);
        assert!(!ollama.requires_key);
    }
}
