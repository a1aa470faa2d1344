//! Tool registry: owns every MCP connection and the descriptor caches built
//! from their listings.
//!
//! Tools are exposed under `<server>.<tool>`. Descriptors exist only while
//! the owning connection is ready; a watcher task drops them as soon as the
//! connection reaches `closed` or `error`.

use crate::core::config::{McpServerConfig, TurnSettings};
use crate::mcp::connection::{
    ConnectionState, McpConnection, ResourceInfo, ResourceTemplateInfo, ServerInfo, ToolInfo,
    ToolOutput,
};
use crate::mcp::error::McpError;
use futures_util::stream::{self, FuturesUnordered, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Servers are connected at most this many at a time.
pub const MCP_STARTUP_CONCURRENCY_LIMIT: usize = 3;

/// Synthetic per-server tool that reads a resource by uri.
pub const READ_RESOURCE_TOOL: &str = "mcp_read_resource";

#[derive(Debug, Clone, PartialEq)]
pub struct ToolDescriptor {
    /// `<server>.<tool>`
    pub qualified_name: String,
    pub server_id: String,
    pub tool_name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    /// Listed in the server's `auto_confirm`; runs without approval.
    pub auto_confirm: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDescriptor {
    pub server_id: String,
    pub uri: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceTemplateDescriptor {
    pub server_id: String,
    pub uri_template: String,
    pub name: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub server_id: String,
    pub label: String,
    pub state: ConnectionState,
    pub server_info: Option<ServerInfo>,
    pub last_error: Option<String>,
    pub tool_count: usize,
    pub resource_count: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryTimeouts {
    pub handshake: Duration,
    pub request: Duration,
    pub tool: Duration,
}

impl From<&TurnSettings> for RegistryTimeouts {
    fn from(settings: &TurnSettings) -> Self {
        Self {
            handshake: settings.handshake_timeout(),
            request: settings.request_timeout(),
            tool: settings.tool_timeout(),
        }
    }
}

impl Default for RegistryTimeouts {
    fn default() -> Self {
        Self::from(&TurnSettings::default())
    }
}

struct ServerEntry {
    label: String,
    connection: Option<McpConnection>,
    generation: u64,
    state: ConnectionState,
    server_info: Option<ServerInfo>,
    last_error: Option<String>,
    tools: Vec<ToolDescriptor>,
    resources: Vec<ResourceDescriptor>,
    templates: Vec<ResourceTemplateDescriptor>,
}

impl ServerEntry {
    fn failed(config: &McpServerConfig, state: ConnectionState, error: &McpError) -> Self {
        Self {
            label: config.label().to_string(),
            connection: None,
            generation: 0,
            state,
            server_info: None,
            last_error: Some(error.to_string()),
            tools: Vec::new(),
            resources: Vec::new(),
            templates: Vec::new(),
        }
    }

    fn forget_descriptors(&mut self) {
        self.tools.clear();
        self.resources.clear();
        self.templates.clear();
    }
}

#[derive(Default)]
struct RegistryState {
    servers: BTreeMap<String, ServerEntry>,
    next_generation: u64,
}

/// Handle to the registry. Clones share state. Locks are never held across
/// an await.
#[derive(Clone)]
pub struct ToolRegistry {
    state: Arc<RwLock<RegistryState>>,
    timeouts: RegistryTimeouts,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new(RegistryTimeouts::default())
    }
}

impl ToolRegistry {
    pub fn new(timeouts: RegistryTimeouts) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            timeouts,
        }
    }

    pub fn timeouts(&self) -> RegistryTimeouts {
        self.timeouts
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Opens, handshakes and attaches every enabled server. Failures are
    /// recorded per server and never affect the others.
    pub async fn connect_all(&self, servers: &[McpServerConfig]) {
        let enabled: Vec<McpServerConfig> = servers
            .iter()
            .filter(|server| server.is_enabled())
            .cloned()
            .collect();

        stream::iter(enabled)
            .map(|config| {
                let registry = self.clone();
                async move {
                    if let Err(err) = registry.connect_server(&config).await {
                        warn!(server_id = %config.id, error = %err, "MCP server unavailable");
                    }
                }
            })
            .buffer_unordered(MCP_STARTUP_CONCURRENCY_LIMIT)
            .collect::<Vec<()>>()
            .await;
    }

    pub async fn connect_server(&self, config: &McpServerConfig) -> Result<(), McpError> {
        let connection = match McpConnection::open(config).await {
            Ok(connection) => connection,
            Err(err) => {
                self.record_failure(config, ConnectionState::Disconnected, &err);
                return Err(err);
            }
        };
        self.add_connection(connection, config).await
    }

    /// Handshakes a freshly opened connection and attaches it.
    pub async fn add_connection(
        &self,
        connection: McpConnection,
        config: &McpServerConfig,
    ) -> Result<(), McpError> {
        if let Err(err) = connection
            .handshake(config.protocol_version.as_deref(), self.timeouts.handshake)
            .await
        {
            self.record_failure(config, connection.state(), &err);
            return Err(err);
        }
        self.attach(connection, config).await
    }

    fn record_failure(&self, config: &McpServerConfig, state: ConnectionState, error: &McpError) {
        self.write()
            .servers
            .insert(config.id.clone(), ServerEntry::failed(config, state, error));
    }

    /// Lists a ready connection's tools, resources and resource templates
    /// and registers them.
    /// Replaces any connection already attached under the same server id.
    pub async fn attach(
        &self,
        connection: McpConnection,
        config: &McpServerConfig,
    ) -> Result<(), McpError> {
        let server_id = connection.server_id().to_string();
        let Some(info) = connection.server_info() else {
            let err = McpError::NotReady(connection.state());
            self.record_failure(config, connection.state(), &err);
            return Err(err);
        };

        let listed = async {
            let tools = connection.list_tools(self.timeouts.request).await?;
            let resources = connection.list_resources(self.timeouts.request).await?;
            let templates = connection
                .list_resource_templates(self.timeouts.request)
                .await?;
            Ok::<_, McpError>((tools, resources, templates))
        }
        .await;
        let (tools, resources, templates) = match listed {
            Ok(listed) => listed,
            Err(err) => {
                warn!(server_id = %server_id, error = %err, "MCP listing failed");
                connection.close().await;
                self.record_failure(config, connection.state(), &err);
                return Err(err);
            }
        };

        let tools = build_tool_descriptors(&server_id, config, &info, tools);
        let resources = build_resource_descriptors(&server_id, resources);
        let templates = build_template_descriptors(&server_id, templates);
        info!(
            server_id = %server_id,
            tools = tools.len(),
            resources = resources.len(),
            templates = templates.len(),
            "MCP server attached"
        );

        let (generation, replaced) = {
            let mut state = self.write();
            state.next_generation += 1;
            let generation = state.next_generation;
            let replaced = state.servers.insert(
                server_id.clone(),
                ServerEntry {
                    label: config.label().to_string(),
                    connection: Some(connection.clone()),
                    generation,
                    state: connection.state(),
                    server_info: Some(info),
                    last_error: None,
                    tools,
                    resources,
                    templates,
                },
            );
            (generation, replaced.and_then(|entry| entry.connection))
        };
        if let Some(old) = replaced {
            old.close().await;
        }

        self.spawn_watcher(server_id, generation, connection);
        Ok(())
    }

    fn spawn_watcher(&self, server_id: String, generation: u64, connection: McpConnection) {
        let mut states = connection.subscribe();
        drop(connection);
        let registry = self.clone();
        tokio::spawn(async move {
            let final_state = match states.wait_for(|state| state.is_terminal()).await {
                Ok(state) => *state,
                Err(_) => ConnectionState::Closed,
            };
            registry.detach(&server_id, generation, final_state);
        });
    }

    fn detach(&self, server_id: &str, generation: u64, final_state: ConnectionState) {
        let mut state = self.write();
        let Some(entry) = state.servers.get_mut(server_id) else {
            return;
        };
        if entry.generation != generation {
            return;
        }
        debug!(
            server_id = %server_id,
            state = %final_state,
            tools = entry.tools.len(),
            "Removing MCP descriptors"
        );
        entry.forget_descriptors();
        entry.connection = None;
        entry.state = final_state;
        if final_state == ConnectionState::Error && entry.last_error.is_none() {
            entry.last_error = Some("connection failed".to_string());
        }
    }

    /// The descriptor for `qualified_name`, provided its connection is ready.
    pub fn resolve(&self, qualified_name: &str) -> Result<ToolDescriptor, McpError> {
        self.lookup(qualified_name).map(|(descriptor, _)| descriptor)
    }

    fn lookup(&self, qualified_name: &str) -> Result<(ToolDescriptor, McpConnection), McpError> {
        let state = self.read();
        state
            .servers
            .values()
            .filter_map(|entry| {
                let connection = entry.connection.as_ref()?;
                (connection.state() == ConnectionState::Ready).then_some((entry, connection))
            })
            .find_map(|(entry, connection)| {
                entry
                    .tools
                    .iter()
                    .find(|tool| tool.qualified_name == qualified_name)
                    .map(|tool| (tool.clone(), connection.clone()))
            })
            .ok_or_else(|| McpError::UnknownTool(qualified_name.to_string()))
    }

    /// Validates `arguments` against the tool's input schema and forwards
    /// the call to the owning connection. Never retries.
    pub async fn invoke(&self, qualified_name: &str, arguments: Value) -> Result<ToolOutput, McpError> {
        let (descriptor, connection) = self.lookup(qualified_name)?;
        let arguments = match arguments {
            Value::Null => json!({}),
            other => other,
        };
        validate_arguments(&descriptor.input_schema, &arguments)?;

        debug!(tool = %qualified_name, server_id = %descriptor.server_id, "Invoking MCP tool");
        if descriptor.tool_name == READ_RESOURCE_TOOL {
            let uri = arguments
                .get("uri")
                .and_then(Value::as_str)
                .ok_or_else(|| McpError::InvalidArguments("missing 'uri'".to_string()))?;
            let content = connection.read_resource(uri, self.timeouts.tool).await?;
            return Ok(ToolOutput {
                content,
                is_error: false,
            });
        }
        connection
            .invoke_tool(&descriptor.tool_name, arguments, self.timeouts.tool)
            .await
    }

    /// Tools of every ready server, in server id order.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.read()
            .servers
            .values()
            .filter(|entry| entry.connection.is_some())
            .flat_map(|entry| entry.tools.iter().cloned())
            .collect()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        self.read()
            .servers
            .values()
            .filter(|entry| entry.connection.is_some())
            .flat_map(|entry| entry.resources.iter().cloned())
            .collect()
    }

    pub fn resource_templates(&self) -> Vec<ResourceTemplateDescriptor> {
        self.read()
            .servers
            .values()
            .filter(|entry| entry.connection.is_some())
            .flat_map(|entry| entry.templates.iter().cloned())
            .collect()
    }

    pub fn server_statuses(&self) -> Vec<ServerStatus> {
        self.read()
            .servers
            .iter()
            .map(|(server_id, entry)| ServerStatus {
                server_id: server_id.clone(),
                label: entry.label.clone(),
                state: entry
                    .connection
                    .as_ref()
                    .map_or(entry.state, McpConnection::state),
                server_info: entry.server_info.clone(),
                last_error: entry.last_error.clone(),
                tool_count: entry.tools.len(),
                resource_count: entry.resources.len(),
            })
            .collect()
    }

    /// Markdown describing the attached servers, their tools with input
    /// schemas, their resources and resource templates. `None` when nothing is attached.
    pub fn prompt_section(&self) -> Option<String> {
        let state = self.read();
        let sections: Vec<String> = state
            .servers
            .iter()
            .filter(|(_, entry)| entry.connection.is_some())
            .map(|(server_id, entry)| render_server_section(server_id, entry))
            .collect();
        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }

    /// Closes every connection concurrently and forgets all descriptors.
    pub async fn close_all(&self) {
        let connections: Vec<McpConnection> = {
            let mut state = self.write();
            state
                .servers
                .values_mut()
                .filter_map(|entry| {
                    entry.forget_descriptors();
                    entry.connection.take()
                })
                .collect()
        };
        let mut closing: FuturesUnordered<_> = connections
            .iter()
            .map(|connection| connection.close())
            .collect();
        while closing.next().await.is_some() {}
        debug!(count = connections.len(), "Closed MCP connections");
    }
}

fn build_tool_descriptors(
    server_id: &str,
    config: &McpServerConfig,
    info: &ServerInfo,
    tools: Vec<ToolInfo>,
) -> Vec<ToolDescriptor> {
    let mut descriptors: Vec<ToolDescriptor> = tools
        .into_iter()
        .filter(|tool| config.allows_tool(&tool.name))
        .map(|tool| ToolDescriptor {
            qualified_name: format!("{server_id}.{}", tool.name),
            server_id: server_id.to_string(),
            auto_confirm: config.auto_confirms(&tool.name),
            tool_name: tool.name,
            description: tool.description,
            input_schema: tool.input_schema,
        })
        .collect();

    let shadowed = descriptors
        .iter()
        .any(|tool| tool.tool_name == READ_RESOURCE_TOOL);
    if info.supports_resources && !shadowed {
        descriptors.push(ToolDescriptor {
            qualified_name: format!("{server_id}.{READ_RESOURCE_TOOL}"),
            server_id: server_id.to_string(),
            tool_name: READ_RESOURCE_TOOL.to_string(),
            auto_confirm: config.auto_confirms(READ_RESOURCE_TOOL),
            description: Some(format!("Read a resource exposed by the {server_id} server.")),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "uri": {"type": "string", "description": "URI of the resource to read"}
                },
                "required": ["uri"]
            }),
        });
    }
    descriptors
}

fn build_resource_descriptors(
    server_id: &str,
    resources: Vec<ResourceInfo>,
) -> Vec<ResourceDescriptor> {
    resources
        .into_iter()
        .map(|resource| ResourceDescriptor {
            server_id: server_id.to_string(),
            uri: resource.uri,
            name: resource.name,
            description: resource.description,
            mime_type: resource.mime_type,
        })
        .collect()
}

fn build_template_descriptors(
    server_id: &str,
    templates: Vec<ResourceTemplateInfo>,
) -> Vec<ResourceTemplateDescriptor> {
    templates
        .into_iter()
        .map(|template| ResourceTemplateDescriptor {
            server_id: server_id.to_string(),
            uri_template: template.uri_template,
            name: template.name,
            description: template.description,
            mime_type: template.mime_type,
        })
        .collect()
}

fn validate_arguments(schema: &Value, arguments: &Value) -> Result<(), McpError> {
    if !arguments.is_object() {
        return Err(McpError::InvalidArguments(format!(
            "expected a JSON object, got {arguments}"
        )));
    }
    let validator = match jsonschema::validator_for(schema) {
        Ok(validator) => validator,
        Err(err) => {
            // An unusable schema from the server should not block the call.
            debug!(error = %err, "Skipping argument validation for invalid schema");
            return Ok(());
        }
    };
    validator
        .validate(arguments)
        .map_err(|err| McpError::InvalidArguments(err.to_string()))
}

fn render_server_section(server_id: &str, entry: &ServerEntry) -> String {
    let mut section = format!("## {server_id}");
    if entry.label != server_id {
        section.push_str(&format!(" ({})", entry.label));
    }

    if !entry.tools.is_empty() {
        section.push_str("\n\n### Available Tools\n");
        let tools: Vec<String> = entry
            .tools
            .iter()
            .map(|tool| {
                let mut line = format!(
                    "- {}: {}",
                    tool.qualified_name,
                    tool.description.as_deref().unwrap_or("(no description)")
                );
                if let Ok(schema) = serde_json::to_string_pretty(&tool.input_schema) {
                    line.push_str("\n    Input Schema:\n    ");
                    line.push_str(&schema.replace('\n', "\n    "));
                }
                line
            })
            .collect();
        section.push_str(&tools.join("\n\n"));
    }

    if !entry.resources.is_empty() {
        section.push_str("\n\n### Direct Resources\n");
        let resources: Vec<String> = entry
            .resources
            .iter()
            .map(|resource| {
                format!(
                    "- {} ({}): {}",
                    resource.uri,
                    resource.name,
                    resource.description.as_deref().unwrap_or("")
                )
            })
            .collect();
        section.push_str(&resources.join("\n"));
    }

    if !entry.templates.is_empty() {
        section.push_str(&format!(
            "\n\n### Resource Templates\nFill in the placeholders and read the result with {server_id}.{READ_RESOURCE_TOOL}.\n"
        ));
        let templates: Vec<String> = entry
            .templates
            .iter()
            .map(|template| {
                format!(
                    "- {} ({}): {}",
                    template.uri_template,
                    template.name,
                    template.description.as_deref().unwrap_or("")
                )
            })
            .collect();
        section.push_str(&templates.join("\n"));
    }
    section
}
