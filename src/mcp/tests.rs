use super::*;
use crate::core::config::McpServerConfig;
use crate::utils::test_utils::{
    echo_calls, fake_server, fast_registry, mcp_config as config, result, rpc_error, scripted,
    text_result, tool, wait_until, Action, Handler, Script,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn tool_names(registry: &ToolRegistry) -> Vec<String> {
    registry
        .tools()
        .into_iter()
        .map(|tool| tool.qualified_name)
        .collect()
}

#[tokio::test]
async fn handshake_registers_qualified_tools() {
    let registry = fast_registry();
    let (connection, _server) = fake_server("files", scripted(Script::default(), echo_calls));
    registry
        .add_connection(connection.clone(), &config("files"))
        .await
        .unwrap();

    assert_eq!(connection.state(), ConnectionState::Ready);
    let info = connection.server_info().unwrap();
    assert_eq!(info.name, "fake");
    assert_eq!(info.protocol_version, "2025-06-18");
    assert_eq!(tool_names(&registry), vec!["files.read", "files.write"]);

    let output = registry
        .invoke("files.read", json!({"path": "/tmp/a"}))
        .await
        .unwrap();
    assert_eq!(output.content, "ran read");
    assert!(!output.is_error);
}

#[tokio::test]
async fn unsupported_version_fails_only_that_server() {
    let registry = fast_registry();
    let bad_script = Script {
        protocol_version: "1999-01-01",
        ..Script::default()
    };
    let (bad, _bad_server) = fake_server("legacy", scripted(bad_script, echo_calls));
    let (good, _good_server) = fake_server("files", scripted(Script::default(), echo_calls));

    let err = registry
        .add_connection(bad.clone(), &config("legacy"))
        .await
        .unwrap_err();
    assert_eq!(err, McpError::UnsupportedVersion("1999-01-01".to_string()));
    assert_eq!(bad.state(), ConnectionState::Error);

    registry.add_connection(good, &config("files")).await.unwrap();

    assert!(tool_names(&registry).iter().all(|name| name.starts_with("files.")));
    let statuses = registry.server_statuses();
    let legacy = statuses
        .iter()
        .find(|status| status.server_id == "legacy")
        .unwrap();
    assert_eq!(legacy.state, ConnectionState::Error);
    assert_eq!(legacy.tool_count, 0);
    assert!(legacy.last_error.as_deref().unwrap().contains("1999-01-01"));
    let files = statuses
        .iter()
        .find(|status| status.server_id == "files")
        .unwrap();
    assert_eq!(files.state, ConnectionState::Ready);
    assert_eq!(files.tool_count, 2);
}

#[tokio::test]
async fn concurrent_calls_are_matched_by_id() {
    let registry = fast_registry();
    let handler = scripted(Script::default(), |request: &Value| {
        let name = request["params"]["name"].as_str().unwrap_or_default();
        let reply = text_result(request, &format!("ran {name}"));
        if name == "read" {
            vec![Action::ReplyAfter(Duration::from_millis(100), reply)]
        } else {
            vec![Action::Reply(reply)]
        }
    });
    let (connection, _server) = fake_server("files", handler);
    registry
        .add_connection(connection.clone(), &config("files"))
        .await
        .unwrap();

    let (slow, fast) = tokio::join!(
        registry.invoke("files.read", json!({"path": "a"})),
        registry.invoke("files.write", json!({"path": "b"})),
    );
    assert_eq!(slow.unwrap().content, "ran read");
    assert_eq!(fast.unwrap().content, "ran write");
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn peer_drop_fails_outstanding_calls_and_removes_tools() {
    let registry = fast_registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = scripted(Script::default(), move |_request: &Value| {
        if seen.fetch_add(1, Ordering::SeqCst) == 1 {
            vec![Action::Hangup]
        } else {
            Vec::new()
        }
    });
    let (connection, _server) = fake_server("files", handler);
    registry
        .add_connection(connection.clone(), &config("files"))
        .await
        .unwrap();

    let (x, y) = tokio::join!(
        registry.invoke("files.read", json!({"path": "x"})),
        registry.invoke("files.write", json!({"path": "y"})),
    );
    assert_eq!(x.unwrap_err(), McpError::ConnectionClosed);
    assert_eq!(y.unwrap_err(), McpError::ConnectionClosed);
    assert_eq!(connection.pending_count(), 0);

    wait_until(|| registry.tools().is_empty()).await;
    assert!(connection.state().is_terminal());
    assert_eq!(
        registry.resolve("files.read").unwrap_err(),
        McpError::UnknownTool("files.read".to_string())
    );
}

#[tokio::test]
async fn timed_out_and_dropped_requests_leave_no_pending_entries() {
    let handler = scripted(Script::default(), |request: &Value| {
        let name = request["params"]["name"].as_str().unwrap_or_default();
        match name {
            "read" => vec![Action::ReplyAfter(
                Duration::from_millis(150),
                text_result(request, "late"),
            )],
            _ => vec![Action::Reply(text_result(request, "prompt"))],
        }
    });
    let (connection, _server) = fake_server("files", handler);
    connection
        .handshake(None, Duration::from_secs(2))
        .await
        .unwrap();

    let err = connection
        .invoke_tool("read", json!({"path": "a"}), Duration::from_millis(30))
        .await
        .unwrap_err();
    assert_eq!(err, McpError::Timeout(Duration::from_millis(30)));
    assert_eq!(connection.pending_count(), 0);

    let abandoned = tokio::time::timeout(
        Duration::from_millis(30),
        connection.invoke_tool("read", json!({"path": "b"}), Duration::from_secs(5)),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(connection.pending_count(), 0);

    // Late replies for the abandoned ids are dropped without disturbing
    // later requests.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let output = connection
        .invoke_tool("write", json!({"path": "c"}), Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(output.content, "prompt");
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn server_requests_are_answered() {
    let (connection, mut server) = fake_server("files", scripted(Script::default(), echo_calls));
    connection
        .handshake(None, Duration::from_secs(2))
        .await
        .unwrap();

    server.push(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}));
    let reply = server.next_reply().await;
    assert_eq!(reply["id"], json!("srv-1"));
    assert_eq!(reply["result"], json!({}));

    server.push(json!({"jsonrpc": "2.0", "id": 41, "method": "custom/unknown", "params": {}}));
    let reply = server.next_reply().await;
    assert_eq!(reply["id"], json!(41));
    assert_eq!(reply["error"]["code"], json!(-32601));

    connection.ping(Duration::from_secs(2)).await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn tool_listing_follows_cursors() {
    let handler: Handler = {
        let base = scripted(Script::default(), echo_calls);
        Arc::new(move |request: &Value| {
            if request["method"] != "tools/list" {
                return base(request);
            }
            let page = match request["params"]["cursor"].as_str() {
                None => json!({"tools": [tool("one"), tool("two")], "nextCursor": "page-2"}),
                Some("page-2") => json!({"tools": [tool("three")]}),
                Some(other) => panic!("unexpected cursor {other}"),
            };
            vec![Action::Reply(result(request, page))]
        })
    };
    let registry = fast_registry();
    let (connection, _server) = fake_server("paged", handler);
    registry
        .add_connection(connection, &config("paged"))
        .await
        .unwrap();

    assert_eq!(
        tool_names(&registry),
        vec!["paged.one", "paged.two", "paged.three"]
    );
}

#[tokio::test]
async fn allowed_tools_limit_registration() {
    let registry = fast_registry();
    let (connection, _server) = fake_server("files", scripted(Script::default(), echo_calls));
    let restricted = McpServerConfig {
        allowed_tools: Some(vec!["read".to_string()]),
        ..config("files")
    };
    registry
        .add_connection(connection, &restricted)
        .await
        .unwrap();

    assert_eq!(tool_names(&registry), vec!["files.read"]);
    assert!(matches!(
        registry.invoke("files.write", json!({"path": "a"})).await,
        Err(McpError::UnknownTool(_))
    ));
}

#[tokio::test]
async fn arguments_are_validated_before_sending() {
    let registry = fast_registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&calls);
    let handler = scripted(Script::default(), move |request: &Value| {
        seen.fetch_add(1, Ordering::SeqCst);
        echo_calls(request)
    });
    let (connection, _server) = fake_server("files", handler);
    registry
        .add_connection(connection, &config("files"))
        .await
        .unwrap();

    assert!(matches!(
        registry.invoke("files.read", json!({})).await,
        Err(McpError::InvalidArguments(_))
    ));
    assert!(matches!(
        registry.invoke("files.read", json!({"path": 7})).await,
        Err(McpError::InvalidArguments(_))
    ));
    assert!(matches!(
        registry.invoke("files.read", json!("just text")).await,
        Err(McpError::InvalidArguments(_))
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(matches!(
        registry.invoke("nowhere.read", json!({"path": "a"})).await,
        Err(McpError::UnknownTool(_))
    ));
}

#[tokio::test]
async fn tool_errors_are_reported() {
    let registry = fast_registry();
    let handler = scripted(Script::default(), |request: &Value| {
        if request["params"]["name"] == "read" {
            vec![Action::Reply(rpc_error(request, -32000, "disk on fire"))]
        } else {
            vec![Action::Reply(result(
                request,
                json!({"content": [{"type": "text", "text": "denied"}], "isError": true}),
            ))]
        }
    });
    let (connection, _server) = fake_server("files", handler);
    registry
        .add_connection(connection, &config("files"))
        .await
        .unwrap();

    let err = registry
        .invoke("files.read", json!({"path": "a"}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        McpError::ToolInvocation("MCP error -32000: disk on fire".to_string())
    );

    let output = registry
        .invoke("files.write", json!({"path": "a"}))
        .await
        .unwrap();
    assert!(output.is_error);
    assert_eq!(output.content, "denied");
}

#[tokio::test]
async fn resources_are_exposed_through_a_read_tool() {
    let script = Script {
        resources: true,
        ..Script::default()
    };
    let base = scripted(script, echo_calls);
    let handler: Handler = Arc::new(move |request: &Value| match request["method"].as_str() {
        Some("resources/list") => vec![Action::Reply(result(
            request,
            json!({"resources": [{
                "uri": "file:///notes.md",
                "name": "notes",
                "description": "Project notes",
                "mimeType": "text/markdown"
            }]}),
        ))],
        Some("resources/read") => vec![Action::Reply(result(
            request,
            json!({"contents": [{"uri": request["params"]["uri"].clone(), "text": "# Notes"}]}),
        ))],
        _ => base(request),
    });
    let registry = fast_registry();
    let (connection, _server) = fake_server("docs", handler);
    registry
        .add_connection(connection, &config("docs"))
        .await
        .unwrap();

    assert_eq!(
        tool_names(&registry),
        vec!["docs.read", "docs.write", "docs.mcp_read_resource"]
    );
    let resources = registry.resources();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "file:///notes.md");

    let output = registry
        .invoke("docs.mcp_read_resource", json!({"uri": "file:///notes.md"}))
        .await
        .unwrap();
    assert_eq!(output.content, "# Notes");

    let prompt = registry.prompt_section().unwrap();
    assert!(prompt.contains("## docs"));
    assert!(prompt.contains("### Available Tools"));
    assert!(prompt.contains("- docs.read: The read tool"));
    assert!(prompt.contains("### Direct Resources"));
    assert!(prompt.contains("- file:///notes.md (notes): Project notes"));
}

#[tokio::test]
async fn resource_templates_are_listed_across_pages() {
    let script = Script {
        resources: true,
        ..Script::default()
    };
    let base = scripted(script, echo_calls);
    let handler: Handler = Arc::new(move |request: &Value| {
        if request["method"] != "resources/templates/list" {
            return base(request);
        }
        let page = match request["params"]["cursor"].as_str() {
            None => json!({
                "resourceTemplates": [{
                    "uriTemplate": "file:///logs/{date}.txt",
                    "name": "daily log",
                    "description": "One log file per day"
                }],
                "nextCursor": "more"
            }),
            Some("more") => json!({
                "resourceTemplates": [{"uriTemplate": "db://{table}/{id}", "name": "row"}]
            }),
            Some(other) => panic!("unexpected cursor {other}"),
        };
        vec![Action::Reply(result(request, page))]
    });
    let registry = fast_registry();
    let (connection, _server) = fake_server("docs", handler);
    registry
        .add_connection(connection, &config("docs"))
        .await
        .unwrap();

    let templates = registry.resource_templates();
    let uris: Vec<&str> = templates
        .iter()
        .map(|template| template.uri_template.as_str())
        .collect();
    assert_eq!(uris, vec!["file:///logs/{date}.txt", "db://{table}/{id}"]);
    assert!(templates.iter().all(|template| template.server_id == "docs"));

    let prompt = registry.prompt_section().unwrap();
    assert!(prompt.contains("### Resource Templates"));
    assert!(prompt.contains("docs.mcp_read_resource"));
    assert!(prompt.contains("- file:///logs/{date}.txt (daily log): One log file per day"));

    registry.close_all().await;
    assert!(registry.resource_templates().is_empty());
}

#[tokio::test]
async fn missing_resource_listing_is_treated_as_empty() {
    let script = Script {
        resources: true,
        ..Script::default()
    };
    let registry = fast_registry();
    let (connection, _server) = fake_server("files", scripted(script, echo_calls));
    registry
        .add_connection(connection, &config("files"))
        .await
        .unwrap();

    assert!(registry.resources().is_empty());
    assert!(registry.resource_templates().is_empty());
    assert_eq!(registry.server_statuses()[0].state, ConnectionState::Ready);
}

#[tokio::test]
async fn close_all_closes_connections_and_forgets_tools() {
    let registry = fast_registry();
    let (connection, _server) = fake_server("files", scripted(Script::default(), echo_calls));
    registry
        .add_connection(connection.clone(), &config("files"))
        .await
        .unwrap();
    assert!(registry.prompt_section().is_some());

    registry.close_all().await;
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(registry.tools().is_empty());
    assert!(registry.prompt_section().is_none());
    assert!(matches!(
        registry.invoke("files.read", json!({"path": "a"})).await,
        Err(McpError::UnknownTool(_))
    ));
    assert_eq!(
        connection.invoke_tool("read", json!({}), Duration::from_secs(1)).await,
        Err(McpError::ConnectionClosed)
    );
}

#[tokio::test]
async fn connect_all_skips_disabled_and_records_failures() {
    let registry = fast_registry();
    let servers = vec![
        McpServerConfig {
            enabled: Some(false),
            command: Some("/nonexistent/disabled-server".to_string()),
            ..config("off")
        },
        McpServerConfig {
            command: Some("/nonexistent/confab-mcp-server".to_string()),
            ..config("broken")
        },
    ];
    registry.connect_all(&servers).await;

    let statuses = registry.server_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].server_id, "broken");
    assert!(statuses[0].last_error.is_some());
    assert!(registry.tools().is_empty());
}

/// A connection whose peer never reads: every write blocks once the pipe
/// buffer is full.
fn stalled_connection() -> (McpConnection, tokio::io::DuplexStream) {
    let (client_io, server_io) = tokio::io::duplex(16);
    let (client_read, client_write) = tokio::io::split(client_io);
    (
        McpConnection::from_streams("stalled", client_read, client_write),
        server_io,
    )
}

#[tokio::test]
async fn blocked_write_still_honours_the_timeout() {
    let (connection, _peer) = stalled_connection();

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        connection.handshake(None, Duration::from_millis(100)),
    )
    .await
    .expect("handshake returns within its own timeout");
    assert_eq!(outcome, Err(McpError::Timeout(Duration::from_millis(100))));
    assert_eq!(connection.state(), ConnectionState::Error);
    assert_eq!(connection.pending_count(), 0);
}

#[tokio::test]
async fn close_interrupts_a_blocked_write() {
    let (connection, _peer) = stalled_connection();
    let stuck = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.handshake(None, Duration::from_secs(30)).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    tokio::time::timeout(Duration::from_secs(2), connection.close())
        .await
        .expect("close finishes while a write is blocked");
    assert!(connection.state().is_terminal());

    let handshake = tokio::time::timeout(Duration::from_secs(2), stuck)
        .await
        .expect("blocked handshake is released")
        .unwrap();
    assert_eq!(handshake, Err(McpError::ConnectionClosed));
    assert_eq!(connection.pending_count(), 0);
}
