//! Shared test fixtures: an in-process MCP server driven by a request
//! handler, plus helpers for building its replies.

use crate::core::config::McpServerConfig;
use crate::mcp::{McpConnection, RegistryTimeouts, ToolRegistry};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub enum Action {
    Reply(Value),
    ReplyAfter(Duration, Value),
    Hangup,
}

pub type Handler = Arc<dyn Fn(&Value) -> Vec<Action> + Send + Sync>;

/// In-process MCP server speaking over a duplex pipe.
pub struct FakeServer {
    outbound: mpsc::UnboundedSender<Option<Value>>,
    client_replies: mpsc::UnboundedReceiver<Value>,
}

impl FakeServer {
    pub fn push(&self, frame: Value) {
        let _ = self.outbound.send(Some(frame));
    }

    pub async fn next_reply(&mut self) -> Value {
        tokio::time::timeout(Duration::from_secs(2), self.client_replies.recv())
            .await
            .expect("client reply in time")
            .expect("server still running")
    }
}

pub fn fake_server(server_id: &str, handler: Handler) -> (McpConnection, FakeServer) {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_io);
    let connection = McpConnection::from_streams(server_id, client_read, client_write);

    let (server_read, mut server_write) = tokio::io::split(server_io);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Option<Value>>();
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(Some(frame)) = out_rx.recv().await {
            let mut line = serde_json::to_vec(&frame).unwrap();
            line.push(b'\n');
            if server_write.write_all(&line).await.is_err() {
                break;
            }
        }
        let _ = server_write.shutdown().await;
    });

    let outbound = out_tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(server_read).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let frame: Value = serde_json::from_str(&line).unwrap();
            if frame.get("method").is_none() {
                let _ = reply_tx.send(frame);
                continue;
            }
            if frame.get("id").is_none() {
                continue;
            }
            for action in handler(&frame) {
                match action {
                    Action::Reply(reply) => {
                        let _ = out_tx.send(Some(reply));
                    }
                    Action::ReplyAfter(delay, reply) => {
                        let out_tx = out_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = out_tx.send(Some(reply));
                        });
                    }
                    Action::Hangup => {
                        let _ = out_tx.send(None);
                        return;
                    }
                }
            }
        }
    });

    (
        connection,
        FakeServer {
            outbound,
            client_replies: reply_rx,
        },
    )
}

pub fn result(request: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": result})
}

pub fn rpc_error(request: &Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request["id"].clone(),
        "error": {"code": code, "message": message}
    })
}

pub fn text_result(request: &Value, text: &str) -> Value {
    result(
        request,
        json!({"content": [{"type": "text", "text": text}], "isError": false}),
    )
}

pub fn tool(name: &str) -> Value {
    json!({
        "name": name,
        "description": format!("The {name} tool"),
        "inputSchema": {
            "type": "object",
            "properties": {"path": {"type": "string"}},
            "required": ["path"]
        }
    })
}

pub struct Script {
    pub protocol_version: &'static str,
    pub resources: bool,
    pub tools: Vec<Value>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            protocol_version: "2025-06-18",
            resources: false,
            tools: vec![tool("read"), tool("write")],
        }
    }
}

/// Answers the handshake and listings from `script`; `tools/call` goes to
/// `on_call`, everything else gets "method not found".
pub fn scripted<F>(script: Script, on_call: F) -> Handler
where
    F: Fn(&Value) -> Vec<Action> + Send + Sync + 'static,
{
    Arc::new(move |request: &Value| {
        let method = request["method"].as_str().unwrap_or_default();
        match method {
            "initialize" => {
                let mut capabilities = json!({"tools": {}});
                if script.resources {
                    capabilities["resources"] = json!({});
                }
                vec![Action::Reply(result(
                    request,
                    json!({
                        "protocolVersion": script.protocol_version,
                        "capabilities": capabilities,
                        "serverInfo": {"name": "fake", "version": "1.0.0"}
                    }),
                ))]
            }
            "tools/list" => vec![Action::Reply(result(
                request,
                json!({"tools": script.tools.clone()}),
            ))],
            "tools/call" => on_call(request),
            "ping" => vec![Action::Reply(result(request, json!({})))],
            _ => vec![Action::Reply(rpc_error(request, -32601, "Method not found"))],
        }
    })
}

pub fn echo_calls(request: &Value) -> Vec<Action> {
    let name = request["params"]["name"].as_str().unwrap_or_default();
    vec![Action::Reply(text_result(request, &format!("ran {name}")))]
}

pub fn mcp_config(id: &str) -> McpServerConfig {
    McpServerConfig {
        id: id.to_string(),
        ..Default::default()
    }
}

pub fn fast_registry() -> ToolRegistry {
    ToolRegistry::new(RegistryTimeouts {
        handshake: Duration::from_secs(2),
        request: Duration::from_secs(2),
        tool: Duration::from_secs(2),
    })
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition reached in time");
}

/// Attaches a fake server to `registry` under `server_id`.
pub async fn attach_fake(registry: &ToolRegistry, server_id: &str, handler: Handler) -> FakeServer {
    let (connection, server) = fake_server(server_id, handler);
    registry
        .add_connection(connection, &mcp_config(server_id))
        .await
        .expect("fake server attaches");
    server
}
