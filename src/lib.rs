//! Confab is a command-line chat orchestrator for LLM providers and MCP
//! tool servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns configuration, the message/session/bot data model, the
//!   session stores, provider resolution and the turn orchestrator.
//! - [`provider`] defines the streaming provider seam and the
//!   OpenAI-compatible adapter.
//! - [`mcp`] implements the Model Context Protocol client: framing,
//!   transports, connections and the tool registry.
//! - [`api`] defines the chat-completions payloads used by the adapter.
//! - [`cli`] parses arguments and renders turns in the terminal.
//!
//! The binary (`src/main.rs`) routes through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
pub mod provider;
pub mod utils;
