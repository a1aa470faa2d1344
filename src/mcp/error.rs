use crate::core::message::ToolFailureKind;
use crate::mcp::connection::ConnectionState;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum McpError {
    #[error("malformed MCP frame: {0}")]
    Decode(String),

    #[error("MCP transport error: {0}")]
    Transport(String),

    #[error("MCP connection closed")]
    ConnectionClosed,

    #[error("MCP request timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("server negotiated unsupported protocol version '{0}'")]
    UnsupportedVersion(String),

    #[error("MCP handshake failed: {0}")]
    Handshake(String),

    #[error("MCP connection is not ready ({0})")]
    NotReady(ConnectionState),

    #[error("unknown tool '{0}'")]
    UnknownTool(String),

    #[error("invalid tool arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    ToolInvocation(String),

    /// An error frame in reply to a listing or other non-tool request.
    #[error("{0}")]
    Rpc(String),

    #[error("invalid MCP server config: {0}")]
    Config(String),
}

impl McpError {
    /// How this failure is recorded when it answers a tool call.
    pub fn failure_kind(&self) -> ToolFailureKind {
        match self {
            McpError::UnknownTool(_) => ToolFailureKind::UnknownTool,
            McpError::InvalidArguments(_) => ToolFailureKind::InvalidArguments,
            McpError::Timeout(_) => ToolFailureKind::Timeout,
            McpError::ConnectionClosed | McpError::NotReady(_) => {
                ToolFailureKind::ConnectionClosed
            }
            _ => ToolFailureKind::InvocationFailed,
        }
    }
}
