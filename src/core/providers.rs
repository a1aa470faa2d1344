use crate::core::builtin_providers::{load_builtin_providers, AuthMode};
use crate::core::config::Config;
use crate::core::keyring::{stored_api_key, KeyringAccessError};
use std::error::Error;
use std::fmt;

const DEFAULT_PROVIDER: &str = "openai";
const QUICK_FIXES: &[&str] = &[
    "export OPENAI_API_KEY=sk-...    # Key for the openai provider",
    "confab chat -p ollama           # Use a local provider that needs no key",
    "confab bot show <id>            # Check which provider a bot uses",
];

/// Everything needed to describe one provider, merged from the embedded
/// table and the user's `[[providers]]` entries.
#[derive(Clone, Debug, PartialEq)]
pub struct ProviderMetadata {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    pub auth_mode: AuthMode,
    pub api_key_env: String,
    pub requires_key: bool,
    pub default_model: Option<String>,
}

#[derive(Clone, Debug)]
pub struct ProviderSession {
    pub api_key: String,
    pub base_url: String,
    pub provider_id: String,
    pub provider_display_name: String,
    pub auth_mode: AuthMode,
    pub model: String,
}

#[derive(Debug)]
pub struct ProviderResolutionError {
    message: String,
    quick_fixes: &'static [&'static str],
    exit_code: i32,
}

impl ProviderResolutionError {
    pub fn unknown_provider(provider: &str) -> Self {
        Self::new(
            format!("Unknown provider '{provider}'. Add a [[providers]] entry to the config file."),
            QUICK_FIXES,
            2,
        )
    }

    pub fn missing_api_key(provider: &str, env_var: &str) -> Self {
        Self::new(
            format!(
                "No API key for provider '{provider}'. Set {env_var} or store a key in the system keyring (service 'confab', user '{provider}')."
            ),
            QUICK_FIXES,
            2,
        )
    }

    pub fn missing_model(provider: &str) -> Self {
        Self::new(
            format!(
                "No model selected for provider '{provider}'. Pass -m <MODEL> or set default_model."
            ),
            QUICK_FIXES,
            2,
        )
    }

    fn new(
        message: impl Into<String>,
        quick_fixes: &'static [&'static str],
        exit_code: i32,
    ) -> Self {
        Self {
            message: message.into(),
            quick_fixes,
            exit_code,
        }
    }

    pub fn quick_fixes(&self) -> &'static [&'static str] {
        self.quick_fixes
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }
}

impl fmt::Display for ProviderResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for ProviderResolutionError {}

#[derive(Debug, thiserror::Error)]
pub enum ResolveSessionError {
    #[error(transparent)]
    Provider(#[from] ProviderResolutionError),
    #[error("Unable to read stored credentials: {0}")]
    Keyring(#[from] KeyringAccessError),
}

/// Where API keys come from. The system implementation reads the process
/// environment and the platform keyring; tests substitute fixed values.
pub trait CredentialSource {
    fn env_var(&self, name: &str) -> Option<String>;
    fn keyring_key(&self, provider_id: &str) -> Result<Option<String>, KeyringAccessError>;
}

pub struct SystemCredentials;

impl CredentialSource for SystemCredentials {
    fn env_var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|value| !value.trim().is_empty())
    }

    fn keyring_key(&self, provider_id: &str) -> Result<Option<String>, KeyringAccessError> {
        stored_api_key(provider_id)
    }
}

fn default_key_env(provider_id: &str) -> String {
    let sanitized: String = provider_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{sanitized}_API_KEY")
}

/// Built-in providers overlaid with configured ones; a configured provider
/// with a built-in id replaces it.
pub fn provider_catalog(config: &Config) -> Vec<ProviderMetadata> {
    let mut catalog: Vec<ProviderMetadata> = load_builtin_providers()
        .into_iter()
        .map(|builtin| ProviderMetadata {
            api_key_env: default_key_env(&builtin.id),
            auth_mode: builtin.auth_mode(),
            id: builtin.id,
            display_name: builtin.display_name,
            base_url: builtin.base_url,
            requires_key: builtin.requires_key,
            default_model: builtin.default_model,
        })
        .collect();

    for custom in &config.providers {
        let entry = ProviderMetadata {
            id: custom.id.to_ascii_lowercase(),
            display_name: custom.display_name.clone(),
            base_url: custom.base_url.clone(),
            auth_mode: AuthMode::from_mode(custom.mode.as_deref()),
            api_key_env: custom
                .api_key_env
                .clone()
                .unwrap_or_else(|| default_key_env(&custom.id)),
            requires_key: custom.api_key_env.is_some()
                || !matches!(
                    catalog
                        .iter()
                        .find(|p| p.id.eq_ignore_ascii_case(&custom.id)),
                    Some(ProviderMetadata {
                        requires_key: false,
                        ..
                    })
                ),
            default_model: custom.default_model.clone(),
        };
        match catalog
            .iter_mut()
            .find(|p| p.id.eq_ignore_ascii_case(&entry.id))
        {
            Some(existing) => *existing = entry,
            None => catalog.push(entry),
        }
    }

    catalog
}

/// Resolves base URL, credentials and model for a turn.
///
/// Provider precedence: explicit override, then `config.default_provider`,
/// then openai. Model precedence: explicit override, then
/// `config.default_model` when the provider is the configured default, then
/// the provider's own default model.
pub fn resolve_session<S: CredentialSource>(
    source: &S,
    config: &Config,
    provider_override: Option<&str>,
    model_override: Option<&str>,
) -> Result<ProviderSession, ResolveSessionError> {
    let provider_id = provider_override
        .filter(|value| !value.is_empty())
        .or(config.default_provider.as_deref())
        .unwrap_or(DEFAULT_PROVIDER);

    let metadata = provider_catalog(config)
        .into_iter()
        .find(|p| p.id.eq_ignore_ascii_case(provider_id))
        .ok_or_else(|| ProviderResolutionError::unknown_provider(provider_id))?;

    let api_key = lookup_api_key(source, &metadata)?;

    let is_default_provider = config
        .default_provider
        .as_deref()
        .is_none_or(|default| default.eq_ignore_ascii_case(&metadata.id));
    let model = model_override
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .or_else(|| {
            is_default_provider
                .then(|| config.default_model.clone())
                .flatten()
        })
        .or_else(|| metadata.default_model.clone())
        .ok_or_else(|| ProviderResolutionError::missing_model(&metadata.id))?;

    Ok(ProviderSession {
        api_key,
        base_url: metadata.base_url,
        provider_id: metadata.id,
        provider_display_name: metadata.display_name,
        auth_mode: metadata.auth_mode,
        model,
    })
}

fn lookup_api_key<S: CredentialSource>(
    source: &S,
    metadata: &ProviderMetadata,
) -> Result<String, ResolveSessionError> {
    if let Some(key) = source.env_var(&metadata.api_key_env) {
        return Ok(key);
    }

    match source.keyring_key(&metadata.id) {
        Ok(Some(key)) => return Ok(key),
        Ok(None) => {}
        Err(err) if err.is_recoverable() => {
            tracing::warn!(
                provider = %metadata.id,
                error = %err,
                "Keyring unavailable, continuing without stored credentials"
            );
        }
        Err(err) => return Err(err.into()),
    }

    if metadata.requires_key {
        Err(ProviderResolutionError::missing_api_key(&metadata.id, &metadata.api_key_env).into())
    } else {
        Ok(String::new())
    }
}
