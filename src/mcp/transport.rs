//! Byte transports an MCP connection can run over.

use crate::core::config::McpServerConfig;
use crate::mcp::error::McpError;
use crate::utils::url::{parse_socket_endpoint, SocketEndpoint};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum McpTransportKind {
    Stdio,
    Tcp,
    Unix,
}

impl McpTransportKind {
    /// Uses `transport` when set; otherwise a `command` means stdio and an
    /// `endpoint` is classified by its scheme.
    pub fn from_config(config: &McpServerConfig) -> Result<Self, McpError> {
        if let Some(transport) = config.transport.as_deref() {
            return match transport.to_ascii_lowercase().as_str() {
                "stdio" => Ok(McpTransportKind::Stdio),
                "tcp" => Ok(McpTransportKind::Tcp),
                "unix" => Ok(McpTransportKind::Unix),
                other => Err(McpError::Config(format!(
                    "unsupported MCP transport '{other}' for server '{}'",
                    config.id
                ))),
            };
        }

        if config.command.is_some() {
            return Ok(McpTransportKind::Stdio);
        }

        match config.endpoint.as_deref() {
            Some(endpoint) => match parse_socket_endpoint(endpoint).map_err(McpError::Config)? {
                SocketEndpoint::Tcp(_) => Ok(McpTransportKind::Tcp),
                SocketEndpoint::Unix(_) => Ok(McpTransportKind::Unix),
            },
            None => Err(McpError::Config(format!(
                "server '{}' needs either a command or an endpoint",
                config.id
            ))),
        }
    }
}

/// An opened transport: the two halves of the byte stream and, for stdio,
/// the child process that owns them.
pub struct Transport {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub child: Option<Child>,
}

pub async fn open(config: &McpServerConfig) -> Result<Transport, McpError> {
    match McpTransportKind::from_config(config)? {
        McpTransportKind::Stdio => spawn_stdio(config),
        McpTransportKind::Tcp | McpTransportKind::Unix => connect_socket(config).await,
    }
}

fn spawn_stdio(config: &McpServerConfig) -> Result<Transport, McpError> {
    let command = config.command.clone().ok_or_else(|| {
        McpError::Config(format!(
            "server '{}' uses stdio but has no command",
            config.id
        ))
    })?;
    let args = config.args.clone().unwrap_or_default();
    debug!(server_id = %config.id, command = %command, args = ?args, "Starting MCP stdio server");

    // The child inherits this process's environment; configured entries
    // override it.
    let mut cmd = Command::new(&command);
    cmd.args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(env) = &config.env {
        cmd.envs(env);
    }

    let mut child = cmd
        .spawn()
        .map_err(|err| McpError::Transport(format!("failed to start '{command}': {err}")))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| McpError::Transport("unable to capture server stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| McpError::Transport("unable to capture server stdout".to_string()))?;
    if let Some(stderr) = child.stderr.take() {
        spawn_stderr_drain(config.id.clone(), stderr);
    }

    Ok(Transport {
        reader: Box::new(stdout),
        writer: Box::new(stdin),
        child: Some(child),
    })
}

fn spawn_stderr_drain(server_id: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(server_id = %server_id, "{line}");
        }
    });
}

async fn connect_socket(config: &McpServerConfig) -> Result<Transport, McpError> {
    let raw = config.endpoint.as_deref().ok_or_else(|| {
        McpError::Config(format!("server '{}' has no endpoint", config.id))
    })?;
    let endpoint = parse_socket_endpoint(raw).map_err(McpError::Config)?;
    debug!(server_id = %config.id, endpoint = %raw, "Connecting to MCP socket server");

    match endpoint {
        SocketEndpoint::Tcp(address) => {
            let stream = tokio::net::TcpStream::connect(&address)
                .await
                .map_err(|err| McpError::Transport(format!("connect {address}: {err}")))?;
            stream.set_nodelay(true).ok();
            let (reader, writer) = stream.into_split();
            Ok(Transport {
                reader: Box::new(reader),
                writer: Box::new(writer),
                child: None,
            })
        }
        #[cfg(unix)]
        SocketEndpoint::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(&path).await.map_err(|err| {
                McpError::Transport(format!("connect {}: {err}", path.display()))
            })?;
            let (reader, writer) = stream.into_split();
            Ok(Transport {
                reader: Box::new(reader),
                writer: Box::new(writer),
                child: None,
            })
        }
        #[cfg(not(unix))]
        SocketEndpoint::Unix(_) => Err(McpError::Config(
            "unix socket transports are not available on this platform".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(id: &str) -> McpServerConfig {
        McpServerConfig {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn transport_kind_is_inferred() {
        let stdio = McpServerConfig {
            command: Some("server".to_string()),
            ..server("a")
        };
        assert_eq!(
            McpTransportKind::from_config(&stdio).unwrap(),
            McpTransportKind::Stdio
        );

        let tcp = McpServerConfig {
            endpoint: Some("tcp://127.0.0.1:9000".to_string()),
            ..server("b")
        };
        assert_eq!(
            McpTransportKind::from_config(&tcp).unwrap(),
            McpTransportKind::Tcp
        );

        let unix = McpServerConfig {
            endpoint: Some("unix:///run/mcp.sock".to_string()),
            ..server("c")
        };
        assert_eq!(
            McpTransportKind::from_config(&unix).unwrap(),
            McpTransportKind::Unix
        );
    }

    #[test]
    fn explicit_transport_wins_and_unknown_is_rejected() {
        let explicit = McpServerConfig {
            transport: Some("TCP".to_string()),
            command: Some("ignored".to_string()),
            ..server("a")
        };
        assert_eq!(
            McpTransportKind::from_config(&explicit).unwrap(),
            McpTransportKind::Tcp
        );

        let bogus = McpServerConfig {
            transport: Some("carrier-pigeon".to_string()),
            ..server("b")
        };
        assert!(matches!(
            McpTransportKind::from_config(&bogus),
            Err(McpError::Config(_))
        ));
        assert!(McpTransportKind::from_config(&server("empty")).is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_transport_error() {
        let config = McpServerConfig {
            command: Some("/nonexistent/confab-test-server".to_string()),
            ..server("missing")
        };
        assert!(matches!(open(&config).await, Err(McpError::Transport(_))));
    }

    #[tokio::test]
    async fn refused_tcp_connection_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        let config = McpServerConfig {
            endpoint: Some(format!("tcp://{address}")),
            ..server("gone")
        };
        assert!(matches!(open(&config).await, Err(McpError::Transport(_))));
    }
}
