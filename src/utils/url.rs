//! URL and endpoint helpers
//!
//! Provider base URLs are joined with endpoint paths without doubling
//! slashes, and MCP socket endpoints (`tcp://host:port`, `unix:///path`) are
//! parsed into a typed form the transport layer can dial.

use std::path::PathBuf;

/// Normalize a base URL by removing trailing slashes
///
/// ```
/// use confab::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("https://api.example.com/v1/"), "https://api.example.com/v1");
/// assert_eq!(normalize_base_url("https://api.example.com/v1///"), "https://api.example.com/v1");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Construct a complete API endpoint URL from a base URL and endpoint path
///
/// ```
/// use confab::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("https://api.example.com/v1/", "/chat/completions"),
///     "https://api.example.com/v1/chat/completions"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}

/// A network location an MCP server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEndpoint {
    Tcp(String),
    Unix(PathBuf),
}

/// Parses `tcp://host:port` or `unix:///absolute/path`.
///
/// A bare `host:port` is accepted as TCP and a bare absolute path as a Unix
/// socket, since that is how most people type them into a config file.
pub fn parse_socket_endpoint(raw: &str) -> Result<SocketEndpoint, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("MCP endpoint is empty.".to_string());
    }

    if let Some(address) = trimmed.strip_prefix("tcp://") {
        return parse_tcp_address(address);
    }
    if let Some(path) = trimmed.strip_prefix("unix://") {
        if path.is_empty() {
            return Err("Unix socket endpoint is missing a path.".to_string());
        }
        return Ok(SocketEndpoint::Unix(PathBuf::from(path)));
    }
    if trimmed.contains("://") {
        return Err(format!("Unsupported MCP endpoint scheme: {trimmed}"));
    }
    if trimmed.starts_with('/') {
        return Ok(SocketEndpoint::Unix(PathBuf::from(trimmed)));
    }
    parse_tcp_address(trimmed)
}

fn parse_tcp_address(address: &str) -> Result<SocketEndpoint, String> {
    let address = address.trim_end_matches('/');
    let Some((host, port)) = address.rsplit_once(':') else {
        return Err(format!("TCP endpoint needs host:port, got '{address}'."));
    };
    if host.is_empty() {
        return Err(format!("TCP endpoint is missing a host: '{address}'."));
    }
    port.parse::<u16>()
        .map_err(|_| format!("Invalid TCP port in endpoint '{address}'."))?;
    Ok(SocketEndpoint::Tcp(address.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_api_url_avoids_double_slashes() {
        assert_eq!(
            construct_api_url("https://api.example.com/v1///", "///models"),
            "https://api.example.com/v1/models"
        );
        assert_eq!(
            construct_api_url("https://api.openai.com/v1", "chat/completions"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(normalize_base_url("///"), "");
    }

    #[test]
    fn parse_socket_endpoint_accepts_schemes_and_bare_forms() {
        assert_eq!(
            parse_socket_endpoint("tcp://127.0.0.1:7331").unwrap(),
            SocketEndpoint::Tcp("127.0.0.1:7331".to_string())
        );
        assert_eq!(
            parse_socket_endpoint("localhost:9000").unwrap(),
            SocketEndpoint::Tcp("localhost:9000".to_string())
        );
        assert_eq!(
            parse_socket_endpoint("unix:///run/mcp.sock").unwrap(),
            SocketEndpoint::Unix(PathBuf::from("/run/mcp.sock"))
        );
        assert_eq!(
            parse_socket_endpoint("/tmp/daemon.sock").unwrap(),
            SocketEndpoint::Unix(PathBuf::from("/tmp/daemon.sock"))
        );
    }

    #[test]
    fn parse_socket_endpoint_rejects_garbage() {
        assert!(parse_socket_endpoint("").is_err());
        assert!(parse_socket_endpoint("http://example.com").is_err());
        assert!(parse_socket_endpoint("tcp://:80").is_err());
        assert!(parse_socket_endpoint("tcp://host:notaport").is_err());
        assert!(parse_socket_endpoint("unix://").is_err());
    }
}
