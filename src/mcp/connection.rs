//! One live session with an MCP server.
//!
//! A connection owns its transport, a background reader task and the table
//! correlating outstanding request ids with their waiters. Responses are
//! routed by id, never by arrival order. Every way a request can end
//! (response, timeout, the caller dropping the future, connection close)
//! removes its table entry.

use crate::core::config::McpServerConfig;
use crate::mcp::codec::{CodecError, DecodeError, FrameReader, FrameWriter};
use crate::mcp::error::McpError;
use crate::mcp::protocol::{
    self, call_tool_output, client_details, is_method_not_found, paginated_params,
    parse_result, read_resource_text, reply_of, Reply,
};
use crate::mcp::transport::{self, BoxedReader, BoxedWriter};
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use rust_mcp_schema::{
    CallToolRequestParams, InitializeResult, ListResourceTemplatesResult, ListResourcesResult,
    ListToolsResult,
    ReadResourceRequestParams, RequestId,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::process::Child;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on tools or resources accepted from one server.
pub const MCP_MAX_LISTED: usize = 100;
const MCP_MAX_LIST_PAGES: usize = 100;
const WRITER_SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Error,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Handshaking => "handshaking",
            ConnectionState::Ready => "ready",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the server told us during the handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
    pub protocol_version: String,
    pub supports_tools: bool,
    pub supports_resources: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInfo {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

/// A parameterised resource uri, e.g. `file:///logs/{date}.txt`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTemplateInfo {
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

/// Result of `tools/call`. `is_error` mirrors the server's `isError`.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub is_error: bool,
}

#[derive(Default)]
struct PendingTable {
    waiters: HashMap<i64, oneshot::Sender<ServerMessage>>,
    closed: bool,
}

struct Shared {
    server_id: String,
    writer: tokio::sync::Mutex<FrameWriter<BoxedWriter>>,
    pending: Mutex<PendingTable>,
    next_request_id: AtomicI64,
    state: watch::Sender<ConnectionState>,
    server_info: Mutex<Option<ServerInfo>>,
    child: Mutex<Option<Child>>,
    shutdown: CancellationToken,
    /// Set when the connection is being torn down because of a failure.
    failed: AtomicBool,
}

/// Removes a correlation entry when the request ends for any reason.
struct PendingGuard<'a> {
    shared: &'a Shared,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.shared.pending().waiters.remove(&self.id);
    }
}

/// Cheap to clone; clones share the same underlying connection.
#[derive(Clone)]
pub struct McpConnection {
    shared: Arc<Shared>,
}

impl fmt::Debug for McpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("McpConnection")
            .field("server_id", &self.shared.server_id)
            .field("state", &self.state())
            .finish()
    }
}

impl McpConnection {
    /// Opens the transport configured for `config`. The connection starts
    /// in `disconnected`; call [`McpConnection::handshake`] next.
    pub async fn open(config: &McpServerConfig) -> Result<Self, McpError> {
        let transport = transport::open(config).await?;
        let connection = Self::start(config.id.clone(), transport.reader, transport.writer);
        *connection.shared.child() = transport.child;
        Ok(connection)
    }

    /// Runs the connection over an arbitrary byte stream pair.
    pub fn from_streams<R, W>(server_id: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Send + Unpin + 'static,
        W: tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(server_id.into(), Box::new(reader), Box::new(writer))
    }

    fn start(server_id: String, reader: BoxedReader, writer: BoxedWriter) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Arc::new(Shared {
            server_id,
            writer: tokio::sync::Mutex::new(FrameWriter::new(writer)),
            pending: Mutex::new(PendingTable::default()),
            next_request_id: AtomicI64::new(1),
            state,
            server_info: Mutex::new(None),
            child: Mutex::new(None),
            shutdown: CancellationToken::new(),
            failed: AtomicBool::new(false),
        });
        tokio::spawn(read_loop(Arc::clone(&shared), FrameReader::new(reader)));
        Self { shared }
    }

    pub fn server_id(&self) -> &str {
        &self.shared.server_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn server_info(&self) -> Option<ServerInfo> {
        self.shared.server_info().clone()
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.shared.pending().waiters.len()
    }

    /// Negotiates the protocol version. Any failure moves the connection to
    /// `error` and closes its transport.
    pub async fn handshake(
        &self,
        protocol_version: Option<&str>,
        timeout: Duration,
    ) -> Result<ServerInfo, McpError> {
        let current = self.state();
        if current != ConnectionState::Disconnected {
            return Err(McpError::NotReady(current));
        }
        self.shared.set_state(ConnectionState::Handshaking);

        let requested = protocol::requested_protocol_version(protocol_version);
        debug!(server_id = %self.server_id(), protocol_version = %requested, "Starting MCP handshake");

        match self.negotiate(requested, timeout).await {
            Ok(info) => {
                *self.shared.server_info() = Some(info.clone());
                let promoted = self.shared.state.send_if_modified(|state| {
                    if *state == ConnectionState::Handshaking {
                        *state = ConnectionState::Ready;
                        true
                    } else {
                        false
                    }
                });
                if !promoted {
                    return Err(McpError::ConnectionClosed);
                }
                debug!(
                    server_id = %self.server_id(),
                    server = %info.name,
                    protocol_version = %info.protocol_version,
                    "MCP connection ready"
                );
                Ok(info)
            }
            Err(err) => {
                warn!(server_id = %self.server_id(), error = %err, "MCP handshake failed");
                self.terminate(ConnectionState::Error).await;
                Err(err)
            }
        }
    }

    async fn negotiate(&self, requested: String, timeout: Duration) -> Result<ServerInfo, McpError> {
        let response = self
            .request(
                RequestFromClient::InitializeRequest(client_details(requested)),
                timeout,
            )
            .await?;
        let value = match reply_of(response).map_err(McpError::Handshake)? {
            Reply::Result(value) => value,
            Reply::Error(message) => return Err(McpError::Handshake(message)),
        };
        let result: InitializeResult = parse_result(value).map_err(McpError::Handshake)?;
        if !protocol::is_supported_version(&result.protocol_version) {
            return Err(McpError::UnsupportedVersion(result.protocol_version));
        }

        self.notify(NotificationFromClient::InitializedNotification(None))
            .await?;

        Ok(ServerInfo {
            name: result.server_info.name,
            version: result.server_info.version,
            protocol_version: result.protocol_version,
            supports_tools: result.capabilities.tools.is_some(),
            supports_resources: result.capabilities.resources.is_some(),
        })
    }

    /// Every tool the server advertises, across pages. A server without the
    /// tools capability, or one that answers "method not found", has none.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolInfo>, McpError> {
        let info = self.ensure_ready()?;
        if !info.supports_tools {
            return Ok(Vec::new());
        }

        let mut tools = Vec::new();
        let mut cursor = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let request = RequestFromClient::ListToolsRequest(paginated_params(cursor.take()));
            let Some(value) = self.listing_page(request, timeout).await? else {
                break;
            };
            let page: ListToolsResult = parse_result(value).map_err(McpError::Decode)?;
            for tool in page.tools {
                if tools.len() >= MCP_MAX_LISTED {
                    warn!(server_id = %self.server_id(), limit = MCP_MAX_LISTED, "Tool list truncated");
                    return Ok(tools);
                }
                let input_schema = serde_json::to_value(&tool.input_schema)
                    .map_err(|err| McpError::Decode(err.to_string()))?;
                tools.push(ToolInfo {
                    name: tool.name,
                    description: tool.description,
                    input_schema,
                });
            }
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(tools)
    }

    pub async fn list_resources(&self, timeout: Duration) -> Result<Vec<ResourceInfo>, McpError> {
        let info = self.ensure_ready()?;
        if !info.supports_resources {
            return Ok(Vec::new());
        }

        let mut resources = Vec::new();
        let mut cursor = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let request =
                RequestFromClient::ListResourcesRequest(paginated_params(cursor.take()));
            let Some(value) = self.listing_page(request, timeout).await? else {
                break;
            };
            let page: ListResourcesResult = parse_result(value).map_err(McpError::Decode)?;
            for resource in page.resources {
                if resources.len() >= MCP_MAX_LISTED {
                    warn!(server_id = %self.server_id(), limit = MCP_MAX_LISTED, "Resource list truncated");
                    return Ok(resources);
                }
                resources.push(ResourceInfo {
                    uri: resource.uri,
                    name: resource.name,
                    description: resource.description,
                    mime_type: resource.mime_type,
                });
            }
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(resources)
    }

    pub async fn list_resource_templates(
        &self,
        timeout: Duration,
    ) -> Result<Vec<ResourceTemplateInfo>, McpError> {
        let info = self.ensure_ready()?;
        if !info.supports_resources {
            return Ok(Vec::new());
        }

        let mut templates = Vec::new();
        let mut cursor = None;
        for _ in 0..MCP_MAX_LIST_PAGES {
            let request =
                RequestFromClient::ListResourceTemplatesRequest(paginated_params(cursor.take()));
            let Some(value) = self.listing_page(request, timeout).await? else {
                break;
            };
            let page: ListResourceTemplatesResult =
                parse_result(value).map_err(McpError::Decode)?;
            for template in page.resource_templates {
                if templates.len() >= MCP_MAX_LISTED {
                    warn!(server_id = %self.server_id(), limit = MCP_MAX_LISTED, "Resource template list truncated");
                    return Ok(templates);
                }
                templates.push(ResourceTemplateInfo {
                    uri_template: template.uri_template,
                    name: template.name,
                    description: template.description,
                    mime_type: template.mime_type,
                });
            }
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        Ok(templates)
    }

    async fn listing_page(
        &self,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<Option<Value>, McpError> {
        let response = self.request(request, timeout).await?;
        if is_method_not_found(&response) {
            return Ok(None);
        }
        match reply_of(response).map_err(McpError::Decode)? {
            Reply::Result(value) => Ok(Some(value)),
            Reply::Error(message) => Err(McpError::Rpc(message)),
        }
    }

    /// Calls `tools/call`. `name` is the server-local tool name.
    pub async fn invoke_tool(
        &self,
        name: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<ToolOutput, McpError> {
        self.ensure_ready()?;
        let mut params = CallToolRequestParams::new(name);
        match arguments {
            Value::Object(map) => params = params.with_arguments(map),
            Value::Null => {}
            other => {
                return Err(McpError::InvalidArguments(format!(
                    "expected a JSON object, got {other}"
                )));
            }
        }

        let response = self
            .request(RequestFromClient::CallToolRequest(params), timeout)
            .await?;
        match reply_of(response).map_err(McpError::Decode)? {
            Reply::Result(value) => {
                let (content, is_error) = call_tool_output(&value);
                Ok(ToolOutput { content, is_error })
            }
            Reply::Error(message) => Err(McpError::ToolInvocation(message)),
        }
    }

    pub async fn read_resource(&self, uri: &str, timeout: Duration) -> Result<String, McpError> {
        self.ensure_ready()?;
        let params = ReadResourceRequestParams {
            meta: None,
            uri: uri.to_string(),
        };
        let response = self
            .request(RequestFromClient::ReadResourceRequest(params), timeout)
            .await?;
        match reply_of(response).map_err(McpError::Decode)? {
            Reply::Result(value) => Ok(read_resource_text(&value)),
            Reply::Error(message) => Err(McpError::ToolInvocation(message)),
        }
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), McpError> {
        self.ensure_ready()?;
        let response = self
            .request(RequestFromClient::PingRequest(None), timeout)
            .await?;
        match reply_of(response).map_err(McpError::Decode)? {
            Reply::Result(_) => Ok(()),
            Reply::Error(message) => Err(McpError::Rpc(message)),
        }
    }

    /// Fails every outstanding request with `ConnectionClosed`, stops the
    /// reader and the child process, and ends in `closed`. Idempotent.
    pub async fn close(&self) {
        if self.state().is_terminal() {
            return;
        }
        self.terminate(ConnectionState::Closed).await;
    }

    async fn terminate(&self, target: ConnectionState) {
        if target == ConnectionState::Error {
            self.shared.failed.store(true, Ordering::SeqCst);
        }
        self.shared.state.send_if_modified(|state| {
            if state.is_terminal() || *state == ConnectionState::Closing {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        self.shared.shutdown.cancel();

        let mut state = self.subscribe();
        if state.wait_for(|state| state.is_terminal()).await.is_err() {
            debug!(server_id = %self.server_id(), "State channel dropped during close");
        }
    }

    fn ensure_ready(&self) -> Result<ServerInfo, McpError> {
        match self.state() {
            ConnectionState::Ready => self
                .server_info()
                .ok_or(McpError::NotReady(ConnectionState::Ready)),
            ConnectionState::Closing | ConnectionState::Closed | ConnectionState::Error => {
                Err(McpError::ConnectionClosed)
            }
            other => Err(McpError::NotReady(other)),
        }
    }

    async fn request(
        &self,
        request: RequestFromClient,
        timeout: Duration,
    ) -> Result<ServerMessage, McpError> {
        let id = self.shared.next_request_id.fetch_add(1, Ordering::SeqCst);
        let message = ClientMessage::from_message(
            MessageFromClient::RequestFromClient(request),
            Some(RequestId::Integer(id)),
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending();
            if pending.closed {
                return Err(McpError::ConnectionClosed);
            }
            pending.waiters.insert(id, tx);
        }
        let _guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        debug!(server_id = %self.server_id(), request_id = id, "Sending MCP request");
        // One deadline covers both the write and the wait for the reply.
        let mut written = false;
        let exchange = async {
            self.shared.send_frame(&message).await?;
            written = true;
            rx.await.map_err(|_| McpError::ConnectionClosed)
        };
        let outcome = tokio::time::timeout(timeout, exchange).await;

        match outcome {
            Ok(result) => result,
            Err(_) if !written => {
                // A partial frame may be on the wire; nothing after it can be
                // parsed by the peer.
                warn!(server_id = %self.server_id(), request_id = id, "MCP request write timed out");
                self.shared.abandon();
                Err(McpError::Timeout(timeout))
            }
            Err(_) => {
                debug!(server_id = %self.server_id(), request_id = id, "MCP request timed out");
                Err(McpError::Timeout(timeout))
            }
        }
    }

    async fn notify(&self, notification: NotificationFromClient) -> Result<(), McpError> {
        let message = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(notification),
            None,
        )
        .map_err(|err| McpError::Transport(err.to_string()))?;
        self.shared.send_frame(&message).await
    }
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, PendingTable> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn server_info(&self) -> MutexGuard<'_, Option<ServerInfo>> {
        self.server_info
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn child(&self) -> MutexGuard<'_, Option<Child>> {
        self.child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_replace(next);
    }

    /// Writes one frame. Shutdown interrupts a write blocked on a peer that
    /// stopped reading.
    async fn send_frame<T: Serialize + ?Sized>(&self, frame: &T) -> Result<(), McpError> {
        if self.pending().closed || self.shutdown.is_cancelled() {
            return Err(McpError::ConnectionClosed);
        }
        let mut writer = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(McpError::ConnectionClosed),
            writer = self.writer.lock() => writer,
        };
        let sent = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(McpError::ConnectionClosed),
            sent = writer.send(frame) => sent,
        };
        sent.map_err(|err| match err {
            CodecError::Io(err) if err.kind() == std::io::ErrorKind::BrokenPipe => {
                McpError::ConnectionClosed
            }
            other => McpError::Transport(other.to_string()),
        })
    }

    /// Starts a teardown ending in `error` without waiting for it.
    fn abandon(&self) {
        self.failed.store(true, Ordering::SeqCst);
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == ConnectionState::Closing {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        self.shutdown.cancel();
    }

    fn complete(&self, id: &RequestId, message: ServerMessage) {
        let RequestId::Integer(id) = id else {
            debug!(server_id = %self.server_id, request_id = ?id, "Dropping response with foreign id");
            return;
        };
        let waiter = self.pending().waiters.remove(id);
        match waiter {
            Some(tx) => {
                if tx.send(message).is_err() {
                    debug!(server_id = %self.server_id, request_id = id, "Waiter went away before response");
                }
            }
            None => {
                debug!(server_id = %self.server_id, request_id = id, "Dropping late MCP response");
            }
        }
    }

    async fn dispatch(&self, message: ServerMessage) {
        match message {
            ServerMessage::Response(response) => {
                let id = response.id.clone();
                self.complete(&id, ServerMessage::Response(response));
            }
            ServerMessage::Error(error) => match error.id.clone() {
                Some(id) => self.complete(&id, ServerMessage::Error(error)),
                None => warn!(
                    server_id = %self.server_id,
                    code = error.error.code,
                    message = %error.error.message,
                    "MCP server reported an uncorrelated error"
                ),
            },
            ServerMessage::Request(request) => {
                let method = request.method().to_string();
                let id = serde_json::to_value(request.request_id()).unwrap_or(Value::Null);
                self.answer_server_request(id, &method).await;
            }
            ServerMessage::Notification(notification) => {
                debug!(server_id = %self.server_id, notification = ?notification, "MCP notification");
            }
        }
    }

    async fn answer_server_request(&self, id: Value, method: &str) {
        debug!(server_id = %self.server_id, request_id = %id, method = %method, "MCP server request");
        let reply = if method == "ping" {
            json!({"jsonrpc": "2.0", "id": id, "result": {}})
        } else {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {
                    "code": protocol::MCP_METHOD_NOT_FOUND,
                    "message": format!("Method not found: {method}"),
                },
            })
        };
        if let Err(err) = self.send_frame(&reply).await {
            debug!(server_id = %self.server_id, error = %err, "Unable to answer MCP server request");
        }
    }

    async fn handle_decode_error(&self, err: DecodeError) {
        warn!(server_id = %self.server_id, error = %err.detail, "Skipping malformed MCP frame");
        if let (Some(id), Some(method)) = (err.request_id, err.method) {
            self.answer_server_request(id, &method).await;
        }
    }

    /// Final cleanup, run once by the reader task.
    async fn finish(&self, outcome: ConnectionState) {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closing {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });

        // Unblocks any sender still holding the writer.
        self.shutdown.cancel();

        let abandoned = {
            let mut pending = self.pending();
            pending.closed = true;
            std::mem::take(&mut pending.waiters)
        };
        if !abandoned.is_empty() {
            debug!(
                server_id = %self.server_id,
                count = abandoned.len(),
                "Failing outstanding MCP requests"
            );
        }
        drop(abandoned);

        let child = self.child().take();
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                debug!(server_id = %self.server_id, error = %err, "MCP server process already gone");
            }
        }
        let writer_shutdown = async { self.writer.lock().await.shutdown().await };
        match tokio::time::timeout(WRITER_SHUTDOWN_GRACE, writer_shutdown).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(server_id = %self.server_id, error = %err, "MCP writer shutdown failed")
            }
            Err(_) => debug!(server_id = %self.server_id, "MCP writer did not shut down in time"),
        }

        let final_state = if outcome == ConnectionState::Error || self.failed.load(Ordering::SeqCst)
        {
            ConnectionState::Error
        } else {
            ConnectionState::Closed
        };
        self.state.send_replace(final_state);
        debug!(server_id = %self.server_id, state = %final_state, "MCP connection finished");
    }
}

async fn read_loop(shared: Arc<Shared>, mut reader: FrameReader<BoxedReader>) {
    let outcome = loop {
        let frame = tokio::select! {
            _ = shared.shutdown.cancelled() => break ConnectionState::Closed,
            frame = reader.next_frame() => frame,
        };
        match frame {
            Ok(Some(message)) => shared.dispatch(message).await,
            Ok(None) => {
                debug!(server_id = %shared.server_id, "MCP peer closed the stream");
                break ConnectionState::Closed;
            }
            Err(CodecError::Decode(err)) => shared.handle_decode_error(err).await,
            Err(err) => {
                warn!(server_id = %shared.server_id, error = %err, "MCP transport failed");
                break ConnectionState::Error;
            }
        }
    };
    shared.finish(outcome).await;
}
