use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_MAX_TOOL_ROUNDS: u32 = 8;
pub const DEFAULT_PROVIDER_RETRIES: u32 = 2;
pub const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_HANDSHAKE_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_DELTA_BUFFER: usize = 64;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    pub display_name: String,
    pub base_url: String,
    /// Auth header style: "openai" (bearer) or "anthropic"
    pub mode: Option<String>,
    /// Environment variable holding the API key; defaults to `<ID>_API_KEY`
    pub api_key_env: Option<String>,
    pub default_model: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct McpServerConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// "stdio", "tcp" or "unix"; inferred from command/endpoint when absent
    pub transport: Option<String>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<HashMap<String, String>>,
    /// `tcp://host:port` or `unix:///path/to.sock`
    pub endpoint: Option<String>,
    /// When set, only these tool names are registered for the model
    pub allowed_tools: Option<Vec<String>>,
    /// Tools that run without asking the user first
    #[serde(default)]
    pub auto_confirm: Vec<String>,
    pub protocol_version: Option<String>,
    pub enabled: Option<bool>,
}

impl McpServerConfig {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }

    pub fn allows_tool(&self, tool_name: &str) -> bool {
        match &self.allowed_tools {
            Some(allowed) => allowed.iter().any(|name| name == tool_name),
            None => true,
        }
    }

    pub fn auto_confirms(&self, tool_name: &str) -> bool {
        self.auto_confirm.iter().any(|name| name == tool_name)
    }
}

/// Limits and timeouts applied to every turn.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
pub struct TurnSettings {
    pub max_tool_rounds: Option<u32>,
    pub provider_retries: Option<u32>,
    pub tool_timeout_secs: Option<u64>,
    pub handshake_timeout_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub delta_buffer: Option<usize>,
    /// Ask before running tools; defaults to true
    pub confirm_tools: Option<bool>,
}

impl TurnSettings {
    pub fn max_tool_rounds(&self) -> u32 {
        self.max_tool_rounds.unwrap_or(DEFAULT_MAX_TOOL_ROUNDS)
    }

    pub fn provider_retries(&self) -> u32 {
        self.provider_retries.unwrap_or(DEFAULT_PROVIDER_RETRIES)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(
            self.tool_timeout_secs
                .unwrap_or(DEFAULT_TOOL_TIMEOUT_SECS)
                .max(1),
        )
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(
            self.handshake_timeout_secs
                .unwrap_or(DEFAULT_HANDSHAKE_TIMEOUT_SECS)
                .max(1),
        )
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS)
                .max(1),
        )
    }

    pub fn delta_buffer(&self) -> usize {
        self.delta_buffer.unwrap_or(DEFAULT_DELTA_BUFFER).max(1)
    }

    pub fn confirm_tools(&self) -> bool {
        self.confirm_tools.unwrap_or(true)
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    pub default_provider: Option<String>,
    pub default_model: Option<String>,
    /// Bot attached to new sessions when `--bot` is not given
    pub default_bot: Option<String>,
    /// Where sessions and bots are stored; defaults to the platform data dir
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub turn: TurnSettings,
}

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

impl Config {
    pub fn get_mcp_server(&self, id: &str) -> Option<&McpServerConfig> {
        self.mcp_servers
            .iter()
            .find(|server| server.id.eq_ignore_ascii_case(id))
    }

    /// Resolves the MCP server configs a bot refers to, skipping disabled
    /// ones. Unknown ids are returned separately so callers can warn.
    pub fn mcp_servers_for<'a>(
        &'a self,
        ids: &[String],
    ) -> (Vec<&'a McpServerConfig>, Vec<String>) {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for id in ids {
            match self.get_mcp_server(id) {
                Some(server) if server.is_enabled() => found.push(server),
                Some(_) => {}
                None => missing.push(id.clone()),
            }
        }
        (found, missing)
    }
}
