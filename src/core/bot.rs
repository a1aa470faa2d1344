//! Reusable bot definitions.
//!
//! A bot pins a provider, model, system prompt and the MCP servers to
//! attach. Bots are versioned: saving an edited bot stores a new version and
//! leaves earlier ones untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    #[serde(default)]
    pub display_name: String,
    /// Assigned by the store on save.
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Provider-specific request fields such as `temperature`
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mcp_servers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tool_rounds: Option<u32>,
}

impl Bot {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: String::new(),
            version: 0,
            provider: None,
            model: None,
            params: Map::new(),
            mcp_servers: Vec::new(),
            system_prompt: None,
            max_tool_rounds: None,
        }
    }

    pub fn label(&self) -> &str {
        if self.display_name.trim().is_empty() {
            &self.id
        } else {
            &self.display_name
        }
    }
}

/// Bot ids become file names, so they are limited to a safe alphabet.
pub fn validate_bot_id(id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err("bot id must not be empty".to_string());
    }
    if id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        Ok(())
    } else {
        Err(format!(
            "invalid bot id '{id}': use letters, digits, '-' or '_'"
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_bot_parses_with_defaults() {
        let bot: Bot = serde_json::from_str(r#"{"id":"helper"}"#).unwrap();
        assert_eq!(bot.version, 0);
        assert!(bot.params.is_empty());
        assert_eq!(bot.label(), "helper");
    }

    #[test]
    fn bot_ids_are_path_safe() {
        assert!(validate_bot_id("code-review_2").is_ok());
        assert!(validate_bot_id("../etc").is_err());
        assert!(validate_bot_id("").is_err());
    }
}
