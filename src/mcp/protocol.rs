use rust_mcp_schema::schema_utils::ServerMessage;
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, PaginatedRequestParams, RpcError,
    LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// JSON-RPC code used by servers to indicate unsupported methods.
pub const MCP_METHOD_NOT_FOUND: i64 = -32601;

/// Protocol revisions this client can speak, newest first.
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] =
    &["2025-11-25", "2025-06-18", "2025-03-26", "2024-11-05"];

pub fn requested_protocol_version(configured: Option<&str>) -> String {
    configured
        .filter(|version| !version.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub fn is_supported_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

pub(crate) fn client_details(protocol_version: String) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "confab".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("confab".to_string()),
            description: Some("Command-line chat orchestrator".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version,
    }
}

pub(crate) fn paginated_params(cursor: Option<String>) -> Option<PaginatedRequestParams> {
    cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    })
}

pub fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == MCP_METHOD_NOT_FOUND
    )
}

/// Outcome of a correlated request: the `result` payload, or the peer's
/// error rendered for display.
pub(crate) enum Reply {
    Result(Value),
    Error(String),
}

pub(crate) fn reply_of(message: ServerMessage) -> Result<Reply, String> {
    match message {
        ServerMessage::Response(response) => serde_json::to_value(&response.result)
            .map(Reply::Result)
            .map_err(|err| err.to_string()),
        ServerMessage::Error(error) => Ok(Reply::Error(format_rpc_error(&error.error))),
        other => Err(format!("Unexpected MCP server message: {other:?}")),
    }
}

pub(crate) fn parse_result<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, String> {
    serde_json::from_value::<T>(value).map_err(|err| err.to_string())
}

pub fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| data.as_str().map(str::to_string))
            .or_else(|| serde_json::to_string(data).ok());

        if let Some(details) = details.filter(|details| !details.is_empty()) {
            output.push('\n');
            output.push_str(&details);
        }
    }
    output
}

/// Text of a `tools/call` result plus its `isError` flag.
///
/// Text blocks are joined with newlines; other content blocks are rendered
/// as compact JSON. `structuredContent` is used when there are no blocks.
pub fn call_tool_output(result: &Value) -> (String, bool) {
    let is_error = result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let blocks: Vec<String> = result
        .get("content")
        .and_then(Value::as_array)
        .map(|content| content.iter().map(render_content_block).collect())
        .unwrap_or_default();

    let text = if blocks.is_empty() {
        result
            .get("structuredContent")
            .map(Value::to_string)
            .unwrap_or_default()
    } else {
        blocks.join("\n")
    };
    (text, is_error)
}

fn render_content_block(block: &Value) -> String {
    match block.get("type").and_then(Value::as_str) {
        Some("text") => block
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        Some("resource") => block
            .get("resource")
            .and_then(|resource| resource.get("text"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| block.to_string()),
        _ => block.to_string(),
    }
}

/// Joins the text contents of a `resources/read` result. Binary contents
/// are summarised by uri and mime type.
pub fn read_resource_text(result: &Value) -> String {
    result
        .get("contents")
        .and_then(Value::as_array)
        .map(|contents| {
            contents
                .iter()
                .map(|item| match item.get("text").and_then(Value::as_str) {
                    Some(text) => text.to_string(),
                    None => format!(
                        "[binary content {} ({})]",
                        item.get("uri").and_then(Value::as_str).unwrap_or("?"),
                        item.get("mimeType")
                            .and_then(Value::as_str)
                            .unwrap_or("application/octet-stream")
                    ),
                })
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default()
}
