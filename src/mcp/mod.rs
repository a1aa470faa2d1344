//! Model Context Protocol client side: framing, transports, connections and
//! the registry that exposes server tools to the turn orchestrator.

pub mod codec;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use connection::{ConnectionState, McpConnection, ServerInfo, ToolOutput};
pub use error::McpError;
pub use registry::{
    RegistryTimeouts, ResourceDescriptor, ResourceTemplateDescriptor, ServerStatus,
    ToolDescriptor, ToolRegistry, READ_RESOURCE_TOOL,
};

#[cfg(test)]
mod tests;
