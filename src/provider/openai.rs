//! Adapter for OpenAI-compatible `chat/completions` endpoints.
//!
//! Tool names are qualified as `server.tool` inside confab but function
//! names on the wire may not contain dots, so they travel as
//! `server__tool` and are mapped back when the model calls them. Names
//! that collide after the rewrite get a numeric suffix.

use crate::api::{
    ChatMessage, ChatRequest, ChatResponse, ChatToolCall, ChatToolCallFunction,
    ChatToolDefinition, ChatToolFunction,
};
use crate::core::message::{Message, Role};
use crate::core::providers::ProviderSession;
use crate::provider::{
    CompletionRequest, DeltaSink, OutputDelta, ProviderAdapter, ProviderError, ToolSpec,
};
use crate::utils::auth::add_auth_headers;
use crate::utils::url::construct_api_url;
use async_trait::async_trait;
use futures_util::StreamExt;
use memchr::memchr;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

const RESERVED_PARAMS: &[&str] = &["model", "messages", "stream", "tools"];

pub struct OpenAiCompatibleProvider {
    client: reqwest::Client,
    session: ProviderSession,
}

impl OpenAiCompatibleProvider {
    pub fn new(session: ProviderSession) -> Self {
        Self::with_client(reqwest::Client::new(), session)
    }

    pub fn with_client(client: reqwest::Client, session: ProviderSession) -> Self {
        Self { client, session }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleProvider {
    fn default_model(&self) -> &str {
        &self.session.model
    }

    async fn stream_completion(
        &self,
        request: CompletionRequest,
        sink: &DeltaSink,
    ) -> Result<(), ProviderError> {
        let (body, tool_names) = build_chat_request(&request);
        let url = construct_api_url(&self.session.base_url, "chat/completions");
        debug!(
            provider = %self.session.provider_id,
            model = %body.model,
            messages = body.messages.len(),
            "Starting chat completion"
        );

        let http_request = self
            .client
            .post(url)
            .header("Content-Type", "application/json");
        let http_request =
            add_auth_headers(http_request, self.session.auth_mode, &self.session.api_key);

        let response = http_request
            .json(&body)
            .send()
            .await
            .map_err(|err| ProviderError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "<no body>".to_string());
            return Err(ProviderError::Api {
                status: Some(status.as_u16()),
                message: format_api_error(&error_text),
            });
        }

        let mut decoder = SseDecoder::new(tool_names);
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| ProviderError::Network(err.to_string()))?;
            for delta in decoder.feed(&chunk)? {
                sink.send(delta).await?;
            }
            if decoder.is_done() {
                return Ok(());
            }
        }
        for delta in decoder.finish()? {
            sink.send(delta).await?;
        }
        Ok(())
    }
}

pub fn wire_tool_name(qualified: &str) -> String {
    qualified
        .replacen('.', "__", 1)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Builds the request body and the wire-name → qualified-name table used to
/// decode the model's tool calls.
pub(crate) fn build_chat_request(
    request: &CompletionRequest,
) -> (ChatRequest, HashMap<String, String>) {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system_prompt.trim().is_empty() {
        messages.push(ChatMessage::new("system", request.system_prompt.clone()));
    }
    let (tool_names, wire_names) = assign_wire_names(&request.tools);
    messages.extend(
        request
            .messages
            .iter()
            .map(|message| to_chat_message(message, &wire_names)),
    );
    let tools = (!request.tools.is_empty()).then(|| {
        request
            .tools
            .iter()
            .map(|tool| to_tool_definition(tool, &wire_names))
            .collect()
    });

    let mut extra = request.params.clone();
    for key in RESERVED_PARAMS {
        extra.remove(*key);
    }

    (
        ChatRequest {
            model: request.model.clone(),
            messages,
            stream: true,
            tools,
            extra,
        },
        tool_names,
    )
}

/// Gives every tool a distinct wire name. Returns the wire → qualified and
/// qualified → wire tables.
fn assign_wire_names(
    tools: &[ToolSpec],
) -> (HashMap<String, String>, HashMap<String, String>) {
    let mut by_wire = HashMap::new();
    let mut by_qualified = HashMap::new();
    for tool in tools {
        let base = wire_tool_name(&tool.name);
        let mut wire = base.clone();
        let mut suffix = 2;
        while by_wire.contains_key(&wire) {
            wire = format!("{base}_{suffix}");
            suffix += 1;
        }
        if wire != base {
            warn!(tool = %tool.name, wire_name = %wire, "Tool name collides on the wire, renamed");
        }
        by_wire.insert(wire.clone(), tool.name.clone());
        by_qualified.insert(tool.name.clone(), wire);
    }
    (by_wire, by_qualified)
}

fn wire_name_for(qualified: &str, wire_names: &HashMap<String, String>) -> String {
    wire_names
        .get(qualified)
        .cloned()
        .unwrap_or_else(|| wire_tool_name(qualified))
}

fn to_chat_message(message: &Message, wire_names: &HashMap<String, String>) -> ChatMessage {
    match message.role {
        Role::User => ChatMessage::new("user", message.text.clone()),
        Role::Assistant => {
            let mut chat = ChatMessage::new("assistant", message.text.clone());
            if !message.tool_calls.is_empty() {
                chat.tool_calls = Some(
                    message
                        .tool_calls
                        .iter()
                        .map(|call| ChatToolCall {
                            id: call.id.clone(),
                            kind: "function".to_string(),
                            function: ChatToolCallFunction {
                                name: wire_name_for(&call.name, wire_names),
                                arguments: match &call.arguments {
                                    Value::String(raw) => raw.clone(),
                                    other => other.to_string(),
                                },
                            },
                        })
                        .collect(),
                );
            }
            chat
        }
        Role::Tool => {
            let (call_id, content) = match &message.tool_result {
                Some(result) => (Some(result.call_id.clone()), result.model_content()),
                None => (None, message.text.clone()),
            };
            let mut chat = ChatMessage::new("tool", content);
            chat.tool_call_id = call_id;
            chat
        }
    }
}

fn to_tool_definition(tool: &ToolSpec, wire_names: &HashMap<String, String>) -> ChatToolDefinition {
    ChatToolDefinition {
        kind: "function".to_string(),
        function: ChatToolFunction {
            name: wire_name_for(&tool.name, wire_names),
            description: tool.description.clone(),
            parameters: tool.input_schema.clone(),
        },
    }
}

/// Turns a server-sent-events byte stream into deltas. Function names may
/// arrive split across chunks, so they are collected per call index and
/// mapped back to qualified names once the response is complete.
pub(crate) struct SseDecoder {
    buffer: Vec<u8>,
    tool_names: HashMap<String, String>,
    wire_names: BTreeMap<usize, String>,
    finish_reason: Option<String>,
    done: bool,
}

impl SseDecoder {
    pub(crate) fn new(tool_names: HashMap<String, String>) -> Self {
        Self {
            buffer: Vec::new(),
            tool_names,
            wire_names: BTreeMap::new(),
            finish_reason: None,
            done: false,
        }
    }

    pub(crate) fn is_done(&self) -> bool {
        self.done
    }

    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<Vec<OutputDelta>, ProviderError> {
        self.buffer.extend_from_slice(chunk);
        let mut deltas = Vec::new();
        while !self.done {
            let Some(newline_pos) = memchr(b'\n', &self.buffer) else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            match std::str::from_utf8(&line) {
                Ok(line) => self.process_line(line.trim(), &mut deltas)?,
                Err(err) => debug!(error = %err, "Skipping invalid UTF-8 in provider stream"),
            }
        }
        Ok(deltas)
    }

    /// Flushes the final unterminated line. A stream that stopped without
    /// `[DONE]` still completes if a finish reason was seen.
    pub(crate) fn finish(&mut self) -> Result<Vec<OutputDelta>, ProviderError> {
        let mut deltas = Vec::new();
        if !self.done && !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            if let Ok(line) = std::str::from_utf8(&rest) {
                self.process_line(line.trim(), &mut deltas)?;
            }
        }
        if self.done {
            return Ok(deltas);
        }
        match self.finish_reason.take() {
            Some(reason) => {
                self.complete(Some(reason), &mut deltas);
                Ok(deltas)
            }
            None => Err(ProviderError::StreamEnded),
        }
    }

    /// Emits the collected function names, then `TurnComplete`.
    fn complete(&mut self, finish_reason: Option<String>, deltas: &mut Vec<OutputDelta>) {
        self.done = true;
        for (index, wire_name) in std::mem::take(&mut self.wire_names) {
            deltas.push(OutputDelta::ToolCallDelta {
                index,
                id: None,
                name: Some(self.qualified_name(&wire_name)),
                arguments_fragment: None,
            });
        }
        deltas.push(OutputDelta::TurnComplete { finish_reason });
    }

    fn process_line(&mut self, line: &str, deltas: &mut Vec<OutputDelta>) -> Result<(), ProviderError> {
        let Some(payload) = line.strip_prefix("data:").map(str::trim_start) else {
            return Ok(());
        };
        if payload == "[DONE]" {
            let finish_reason = self.finish_reason.take();
            self.complete(finish_reason, deltas);
            return Ok(());
        }
        if payload.trim().is_empty() {
            return Ok(());
        }

        let value: Value = serde_json::from_str(payload).map_err(|_| ProviderError::Api {
            status: None,
            message: format_api_error(payload),
        })?;
        if value.get("error").is_some() {
            return Err(ProviderError::Api {
                status: None,
                message: format_api_error(payload),
            });
        }
        let response: ChatResponse = serde_json::from_value(value)
            .map_err(|err| ProviderError::MalformedPayload(err.to_string()))?;

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(content) = choice.delta.content.filter(|content| !content.is_empty()) {
                deltas.push(OutputDelta::TextChunk(content));
            }
            let calls = choice.delta.tool_calls.unwrap_or_default();
            for (position, call) in calls.into_iter().enumerate() {
                let index = call.index.unwrap_or(position);
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                if let Some(fragment) = name.filter(|name| !name.is_empty()) {
                    self.wire_names.entry(index).or_default().push_str(&fragment);
                }
                deltas.push(OutputDelta::ToolCallDelta {
                    index,
                    id: call.id.filter(|id| !id.is_empty()),
                    name: None,
                    arguments_fragment: arguments.filter(|fragment| !fragment.is_empty()),
                });
            }
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
        }
        Ok(())
    }

    fn qualified_name(&self, wire_name: &str) -> String {
        self.tool_names
            .get(wire_name)
            .cloned()
            .unwrap_or_else(|| wire_name.replacen("__", ".", 1))
    }
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value.get("error").and_then(|v| match v {
                Value::String(s) => Some(s.to_string()),
                Value::Object(map) => map
                    .get("message")
                    .and_then(|message| message.as_str().map(str::to_owned)),
                _ => None,
            })
        })
        .or_else(|| {
            value
                .get("message")
                .and_then(|v| v.as_str().map(str::to_owned))
        });

    summary.map(|text| text.split_whitespace().collect::<Vec<_>>().join(" "))
}

pub(crate) fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            if let Some(summary) = extract_error_summary(&json_value) {
                if !summary.is_empty() {
                    return format!("API Error: {summary}\n```json\n{pretty_json}\n```");
                }
            }
            return format!("API Error:\n```json\n{pretty_json}\n```");
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{trimmed}\n```")
    } else {
        format!("API Error:\n```\n{trimmed}\n```")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::builtin_providers::AuthMode;
    use crate::core::message::{NewMessage, ToolCallRequest, ToolCallResult, ToolFailureKind};
    use crate::provider::spawn_completion;
    use chrono::Utc;
    use serde_json::{json, Map};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    fn decoder() -> SseDecoder {
        SseDecoder::new(HashMap::from([(
            "files__read".to_string(),
            "files.read".to_string(),
        )]))
    }

    fn message(seq: u64, draft: NewMessage) -> Message {
        draft.into_message(seq, Utc::now())
    }

    fn request_with_history() -> CompletionRequest {
        let call = ToolCallRequest {
            id: "call_1".into(),
            name: "files.read".into(),
            arguments: json!({"path": "/etc/hosts"}),
        };
        let mut params = Map::new();
        params.insert("temperature".into(), json!(0.2));
        params.insert("stream".into(), json!(false));
        CompletionRequest {
            model: "gpt-test".into(),
            system_prompt: "Be brief.".into(),
            messages: vec![
                message(0, NewMessage::user("read hosts")),
                message(1, NewMessage::assistant("", vec![call], None)),
                message(
                    2,
                    NewMessage::tool(ToolCallResult::failure(
                        "call_1",
                        ToolFailureKind::Timeout,
                        "no reply",
                    )),
                ),
            ],
            tools: vec![ToolSpec {
                name: "files.read".into(),
                description: Some("Read a file".into()),
                input_schema: json!({"type": "object"}),
            }],
            params,
        }
    }

    #[test]
    fn request_maps_history_tools_and_params() {
        let (body, names) = build_chat_request(&request_with_history());
        let value = serde_json::to_value(&body).unwrap();

        assert_eq!(value["model"], "gpt-test");
        assert_eq!(value["stream"], true);
        assert_eq!(value["temperature"], 0.2);
        assert_eq!(value["messages"][0], json!({"role": "system", "content": "Be brief."}));
        assert_eq!(value["messages"][1]["role"], "user");
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"],
            json!({"name": "files__read", "arguments": "{\"path\":\"/etc/hosts\"}"})
        );
        assert_eq!(
            value["messages"][3],
            json!({"role": "tool", "content": "Error (timeout): no reply", "tool_call_id": "call_1"})
        );
        assert_eq!(value["tools"][0]["function"]["name"], "files__read");
        assert_eq!(names.get("files__read").map(String::as_str), Some("files.read"));
    }

    #[test]
    fn wire_names_are_function_safe() {
        assert_eq!(wire_tool_name("files.read"), "files__read");
        assert_eq!(wire_tool_name("docs.v2.search"), "docs__v2_search");
    }

    #[test]
    fn colliding_wire_names_are_made_unique() {
        let tool = |name: &str| ToolSpec {
            name: name.to_string(),
            description: None,
            input_schema: json!({"type": "object"}),
        };
        let mut request = request_with_history();
        request.tools = vec![tool("a.b_c"), tool("a.b.c")];
        request.messages[1].tool_calls[0].name = "a.b.c".to_string();

        let (body, names) = build_chat_request(&request);
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["tools"][0]["function"]["name"], "a__b_c");
        assert_eq!(value["tools"][1]["function"]["name"], "a__b_c_2");
        assert_eq!(names.get("a__b_c").map(String::as_str), Some("a.b_c"));
        assert_eq!(names.get("a__b_c_2").map(String::as_str), Some("a.b.c"));
        assert_eq!(
            value["messages"][2]["tool_calls"][0]["function"]["name"],
            "a__b_c_2"
        );
    }

    #[test]
    fn function_names_split_across_chunks_map_once_complete() {
        let mut decoder = decoder();
        let mut deltas = decoder
            .feed(
                br#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","function":{"name":"files_"}}]}}]}
data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"name":"_read","arguments":"{}"}}]},"finish_reason":"tool_calls"}]}
data: [DONE]
"#,
            )
            .unwrap();
        assert!(matches!(
            deltas.pop(),
            Some(OutputDelta::TurnComplete { .. })
        ));

        let mut calls = crate::core::turn::accumulator::ToolCallAccumulator::default();
        for delta in deltas {
            if let OutputDelta::ToolCallDelta {
                index,
                id,
                name,
                arguments_fragment,
            } = delta
            {
                calls.push(index, id, name, arguments_fragment);
            }
        }
        let finished = calls.finish(&std::collections::HashSet::new());
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].request.name, "files.read");
        assert_eq!(finished[0].request.id, "call_a");
    }

    #[test]
    fn text_and_done_handle_spacing_variants() {
        for (chunk_line, expected, done_line) in [
            (r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#, "Hello", "data: [DONE]"),
            (r#"data:{"choices":[{"delta":{"content":"World"}}]}"#, "World", "data:[DONE]"),
        ] {
            let mut decoder = decoder();
            let stream = format!("{chunk_line}\n\n{done_line}\n");
            let deltas = decoder.feed(stream.as_bytes()).unwrap();
            assert_eq!(
                deltas,
                vec![
                    OutputDelta::TextChunk(expected.to_string()),
                    OutputDelta::TurnComplete {
                        finish_reason: None
                    },
                ]
            );
            assert!(decoder.is_done());
        }
    }

    #[test]
    fn tool_call_fragments_keep_their_index() {
        let mut decoder = decoder();
        let first = decoder
            .feed(
                br#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"call_a","type":"function","function":{"name":"files__read","arguments":"{\"pa"}}]}}]}
"#,
            )
            .unwrap();
        let second = decoder
            .feed(
                br#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"function":{"arguments":"th\":\"x\"}"}}]},"finish_reason":"tool_calls"}]}
data: [DONE]
"#,
            )
            .unwrap();

        assert_eq!(
            first,
            vec![OutputDelta::ToolCallDelta {
                index: 0,
                id: Some("call_a".into()),
                name: None,
                arguments_fragment: Some("{\"pa".into()),
            }]
        );
        assert_eq!(
            second,
            vec![
                OutputDelta::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: None,
                    arguments_fragment: Some("th\":\"x\"}".into()),
                },
                OutputDelta::ToolCallDelta {
                    index: 0,
                    id: None,
                    name: Some("files.read".into()),
                    arguments_fragment: None,
                },
                OutputDelta::TurnComplete {
                    finish_reason: Some("tool_calls".into())
                },
            ]
        );
    }

    #[test]
    fn lines_split_across_chunks_are_joined() {
        let mut decoder = decoder();
        assert!(decoder
            .feed(br#"data: {"choices":[{"delta":{"con"#)
            .unwrap()
            .is_empty());
        let deltas = decoder.feed(b"tent\":\"ok\"}}]}\n").unwrap();
        assert_eq!(deltas, vec![OutputDelta::TextChunk("ok".into())]);
    }

    #[test]
    fn stream_errors_become_api_errors() {
        let mut decoder = decoder();
        let err = decoder
            .feed(b"data: {\"error\":{\"message\":\"internal server error\"}}\n")
            .unwrap_err();
        let expected = r#"API Error: internal server error
```json
{
  "error": {
    "message": "internal server error"
  }
}
```"#;
        assert_eq!(
            err,
            ProviderError::Api {
                status: None,
                message: expected.to_string()
            }
        );
    }

    #[test]
    fn end_without_done_needs_a_finish_reason() {
        let mut truncated = decoder();
        truncated
            .feed(b"data: {\"choices\":[{\"delta\":{\"content\":\"par\"}}]}\n")
            .unwrap();
        assert_eq!(truncated.finish(), Err(ProviderError::StreamEnded));

        let mut finished = decoder();
        finished
            .feed(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}")
            .unwrap();
        assert_eq!(
            finished.finish().unwrap(),
            vec![OutputDelta::TurnComplete {
                finish_reason: Some("stop".into())
            }]
        );
    }

    #[test]
    fn format_api_error_prettifies_json_with_summary() {
        let raw = r#"{"error":{"message":"model overloaded","type":"invalid_request_error"}}"#;
        let expected = r#"API Error: model overloaded
```json
{
  "error": {
    "message": "model overloaded",
    "type": "invalid_request_error"
  }
}
```"#;
        assert_eq!(format_api_error(raw), expected);
    }

    #[test]
    fn format_api_error_handles_xml_and_plaintext() {
        assert_eq!(
            format_api_error("<error>bad</error>"),
            "API Error:\n```xml\n<error>bad</error>\n```"
        );
        assert_eq!(format_api_error("api failure"), "API Error:\n```\napi failure\n```");
        assert_eq!(format_api_error("  "), "API Error:\n```\n<empty>\n```");
    }

    /// Accepts one HTTP request, returns its raw text, and answers with
    /// `response`.
    async fn serve_once(response: String) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}/v1", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = socket.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..read]);
                let text = String::from_utf8_lossy(&received).to_string();
                if let Some(header_end) = text.find("\r\n\r\n") {
                    let length = text[..header_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if received.len() >= header_end + 4 + length || read == 0 {
                        break;
                    }
                }
                if read == 0 {
                    break;
                }
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&received).to_string()
        });
        (base_url, handle)
    }

    fn session(base_url: String) -> ProviderSession {
        ProviderSession {
            api_key: "sk-test".into(),
            base_url,
            provider_id: "openai".into(),
            provider_display_name: "OpenAI".into(),
            auth_mode: AuthMode::OpenAi,
            model: "gpt-test".into(),
        }
    }

    #[tokio::test]
    async fn streams_deltas_from_http_endpoint() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\" there\"},\"finish_reason\":\"stop\"}]}\n\n\
                    data: [DONE]\n\n";
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n{body}"
        );
        let (base_url, server) = serve_once(response).await;
        let provider = Arc::new(OpenAiCompatibleProvider::new(session(base_url)));

        let mut rx = spawn_completion(provider, request_with_history(), 8, CancellationToken::new());
        let mut deltas = Vec::new();
        while let Some(item) = rx.recv().await {
            deltas.push(item.unwrap());
        }
        assert_eq!(
            deltas,
            vec![
                OutputDelta::TextChunk("Hi".into()),
                OutputDelta::TextChunk(" there".into()),
                OutputDelta::TurnComplete {
                    finish_reason: Some("stop".into())
                },
            ]
        );

        let raw_request = server.await.unwrap();
        assert!(raw_request.starts_with("POST /v1/chat/completions"));
        assert!(raw_request
            .to_ascii_lowercase()
            .contains("authorization: bearer sk-test"));
        assert!(raw_request.contains("\"stream\":true"));
    }

    #[tokio::test]
    async fn http_errors_carry_status_and_summary() {
        let body = r#"{"error":{"message":"bad key"}}"#;
        let response = format!(
            "HTTP/1.1 401 Unauthorized\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        );
        let (base_url, _server) = serve_once(response).await;
        let provider = Arc::new(OpenAiCompatibleProvider::new(session(base_url)));

        let mut rx = spawn_completion(provider, request_with_history(), 8, CancellationToken::new());
        match rx.recv().await {
            Some(Err(ProviderError::Api { status, message })) => {
                assert_eq!(status, Some(401));
                assert!(message.starts_with("API Error: bad key"));
            }
            other => panic!("expected API error, got {other:?}"),
        }
    }
}
