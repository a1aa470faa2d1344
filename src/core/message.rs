use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl PartialEq<&str> for Role {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool" => Ok(Role::Tool),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// A model's request to run one tool. `name` is qualified as
/// `<server>.<tool>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailureKind {
    UnknownTool,
    InvalidArguments,
    /// The server ran the tool and flagged the result with `isError`.
    ToolError,
    InvocationFailed,
    Timeout,
    ConnectionClosed,
    Cancelled,
    TurnLimitExceeded,
    /// The user declined to run the call.
    Denied,
}

impl ToolFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ToolFailureKind::UnknownTool => "unknown_tool",
            ToolFailureKind::InvalidArguments => "invalid_arguments",
            ToolFailureKind::ToolError => "tool_error",
            ToolFailureKind::InvocationFailed => "invocation_failed",
            ToolFailureKind::Timeout => "timeout",
            ToolFailureKind::ConnectionClosed => "connection_closed",
            ToolFailureKind::Cancelled => "cancelled",
            ToolFailureKind::TurnLimitExceeded => "turn_limit_exceeded",
            ToolFailureKind::Denied => "denied",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub call_id: String,
    pub success: bool,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailureKind>,
}

impl ToolCallResult {
    pub fn success(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            content: content.into(),
            failure: None,
        }
    }

    pub fn failure(
        call_id: impl Into<String>,
        kind: ToolFailureKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            content: detail.into(),
            failure: Some(kind),
        }
    }

    /// Text handed back to the model for this result.
    pub fn model_content(&self) -> String {
        match self.failure {
            Some(kind) if !self.success => format!("Error ({}): {}", kind.as_str(), self.content),
            _ => self.content.clone(),
        }
    }
}

/// A persisted message. `seq` is the message's position in its session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<ToolCallResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// A message before the store has assigned its `seq` and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub text: String,
    pub tool_calls: Vec<ToolCallRequest>,
    pub tool_result: Option<ToolCallResult>,
    pub model: Option<String>,
}

impl NewMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
            tool_calls: Vec::new(),
            tool_result: None,
            model: None,
        }
    }

    pub fn assistant(
        text: impl Into<String>,
        tool_calls: Vec<ToolCallRequest>,
        model: Option<String>,
    ) -> Self {
        Self {
            role: Role::Assistant,
            text: text.into(),
            tool_calls,
            tool_result: None,
            model,
        }
    }

    pub fn tool(result: ToolCallResult) -> Self {
        Self {
            role: Role::Tool,
            text: String::new(),
            tool_calls: Vec::new(),
            tool_result: Some(result),
            model: None,
        }
    }

    pub fn into_message(self, seq: u64, timestamp: DateTime<Utc>) -> Message {
        Message {
            seq,
            role: self.role,
            timestamp,
            text: self.text,
            tool_calls: self.tool_calls,
            tool_result: self.tool_result,
            model: self.model,
        }
    }
}

impl Message {
    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn role_serializes_as_plain_string() {
        let value = serde_json::to_value(Role::Tool).unwrap();
        assert_eq!(value, json!("tool"));
        let parsed: Role = serde_json::from_value(json!("assistant")).unwrap();
        assert_eq!(parsed, Role::Assistant);
        assert!(serde_json::from_value::<Role>(json!("system")).is_err());
    }

    #[test]
    fn failure_kind_uses_snake_case() {
        let value = serde_json::to_value(ToolFailureKind::TurnLimitExceeded).unwrap();
        assert_eq!(value, json!("turn_limit_exceeded"));
        assert_eq!(
            ToolFailureKind::ConnectionClosed.as_str(),
            serde_json::to_value(ToolFailureKind::ConnectionClosed)
                .unwrap()
                .as_str()
                .unwrap()
        );
    }

    #[test]
    fn failed_result_content_names_the_kind() {
        let result = ToolCallResult::failure("c1", ToolFailureKind::UnknownTool, "ghost.delete");
        assert!(!result.success);
        assert_eq!(result.model_content(), "Error (unknown_tool): ghost.delete");
        let ok = ToolCallResult::success("c2", "42");
        assert_eq!(ok.model_content(), "42");
    }

    #[test]
    fn optional_fields_are_omitted_when_empty() {
        let message = NewMessage::user("hi").into_message(0, Utc::now());
        let value = serde_json::to_value(&message).unwrap();
        assert!(value.get("tool_calls").is_none());
        assert!(value.get("tool_result").is_none());
        assert!(value.get("model").is_none());
    }
}
