//! End-to-end scenarios against mock upstreams: shell-script stdio
//! servers, a live OpenAPI mock, hot reload fan-out, crash revival, and
//! graceful shutdown over real HTTP.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use gridctl_config::StackConfig;
use gridctl_core::logbuf::LogBuffer;

use crate::facade::build_app;
use crate::health::{UNHEALTHY_AFTER_FAILURES, run_sweep};
use crate::reload;
use crate::serve::Gateway;
use crate::session::LIST_CHANGED_METHOD;

/// Write a mock MCP server script speaking newline-delimited JSON-RPC.
/// `tools` is the JSON array literal for its tools/list response.
fn write_mock_server(dir: &Path, name: &str, tools: &str) -> PathBuf {
    let path = dir.join(format!("{name}.sh"));
    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2025-03-26","capabilities":{{"tools":{{}}}},"serverInfo":{{"name":"{name}","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *'"notifications/initialized"'*)
      ;;
    *'"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{tools}]}}}}\n' "$id"
      ;;
    *'"tools/call"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"pong from {name}"}}],"isError":false}}}}\n' "$id"
      ;;
    *'"ping"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
      ;;
  esac
done
"#
    );
    std::fs::write(&path, script).unwrap();
    make_executable(&path);
    path
}

/// A mock server that dies on its first tools/call, then behaves once
/// respawned (the marker file survives the crash).
fn write_crashing_server(dir: &Path, marker: &Path) -> PathBuf {
    let path = dir.join("crashy.sh");
    let script = format!(
        r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id"[ ]*:[ ]*\([0-9]*\).*/\1/p')
  case "$line" in
    *'"initialize"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2025-03-26","capabilities":{{}},"serverInfo":{{"name":"crashy","version":"0.1.0"}}}}}}\n' "$id"
      ;;
    *'"notifications/initialized"'*)
      ;;
    *'"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"flaky","description":"","inputSchema":{{"type":"object"}}}}]}}}}\n' "$id"
      ;;
    *'"tools/call"'*)
      if [ -f "{marker}" ]; then
        printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"revived"}}],"isError":false}}}}\n' "$id"
      else
        : > "{marker}"
        exit 1
      fi
      ;;
    *'"ping"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{}}}}\n' "$id"
      ;;
  esac
done
"#,
        marker = marker.display()
    );
    std::fs::write(&path, script).unwrap();
    make_executable(&path);
    path
}

fn make_executable(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).unwrap();
    }
}

async fn get_json(app: &axum::Router, uri: &str) -> Value {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK, "GET {uri}");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn post_json(app: &axum::Router, uri: &str, body: Value) -> Value {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn tool_names(body: &Value) -> Vec<String> {
    body["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|tool| tool["name"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn two_stdio_upstreams_aggregate_under_prefixes() {
    let dir = tempfile::tempdir().unwrap();
    let local = write_mock_server(
        dir.path(),
        "local-tools",
        r#"{"name":"echo","description":"echo","inputSchema":{"type":"object"}},{"name":"get_time","description":"clock","inputSchema":{"type":"object"}}"#,
    );
    let math = write_mock_server(
        dir.path(),
        "math",
        r#"{"name":"add","description":"add","inputSchema":{"type":"object"}}"#,
    );

    let stack = StackConfig::parse(&format!(
        "name: stdio-demo\nmcp_servers:\n  - name: local-tools\n    command: [\"sh\", \"{}\"]\n  - name: math\n    command: [\"sh\", \"{}\"]\n",
        local.display(),
        math.display()
    ))
    .unwrap();

    let gateway = Gateway::build(stack, None, Arc::new(LogBuffer::default()))
        .await
        .unwrap();
    let state = gateway.state();
    let app = build_app(Arc::clone(&state));

    let body = get_json(&app, "/api/tools").await;
    assert_eq!(
        tool_names(&body),
        ["local-tools__echo", "local-tools__get_time", "math__add"]
    );

    // Both handshakes completed, so the gateway is ready.
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Calls route to the owning upstream.
    let reply = post_json(
        &app,
        "/mcp",
        json!({"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"math__add","arguments":{"a":1,"b":2}}}),
    )
    .await;
    assert_eq!(reply["result"]["content"][0]["text"], "pong from math");

    for client in state.router.clients_snapshot().await {
        client.shutdown().await;
    }
}

#[tokio::test]
async fn openapi_upstream_calls_the_real_api() {
    // Mock HTTP API with one parameterized route.
    let api = axum::Router::new().route(
        "/items/{id}",
        axum::routing::get(|axum::extract::Path(id): axum::extract::Path<String>| async move {
            axum::Json(json!({"id": id, "name": format!("item-{id}")}))
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api).await.unwrap();
    });

    let dir = tempfile::tempdir().unwrap();
    let spec_path = dir.path().join("items.yaml");
    std::fs::write(
        &spec_path,
        r#"
openapi: "3.0.0"
info: {title: items, version: "1.0"}
paths:
  /items/{id}:
    get:
      operationId: getItem
      parameters:
        - name: id
          in: path
          required: true
          schema: {type: string}
"#,
    )
    .unwrap();

    let stack = StackConfig::parse(&format!(
        "name: openapi-demo\nmcp_servers:\n  - name: api\n    openapi:\n      spec: \"{}\"\n      base_url: \"http://{}\"\n",
        spec_path.display(),
        addr
    ))
    .unwrap();

    let gateway = Gateway::build(stack, None, Arc::new(LogBuffer::default()))
        .await
        .unwrap();
    let app = build_app(gateway.state());

    let reply = post_json(
        &app,
        "/mcp",
        json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"api__getItem","arguments":{"id":"2"}}}),
    )
    .await;
    assert!(reply["result"]["isError"].as_bool() != Some(true), "{reply}");
    let text = reply["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload, json!({"id": "2", "name": "item-2"}));

    // Missing path parameter fails before any HTTP call, naming the
    // parameter.
    let reply = post_json(
        &app,
        "/mcp",
        json!({"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"api__getItem","arguments":{}}}),
    )
    .await;
    assert_eq!(reply["result"]["isError"], true);
    assert!(
        reply["result"]["content"][0]["text"]
            .as_str()
            .unwrap()
            .contains("id")
    );
}

#[tokio::test]
async fn hot_reload_swaps_upstreams_with_one_notification() {
    let dir = tempfile::tempdir().unwrap();
    let tool = |name: &str| {
        format!(r#"{{"name":"{name}","description":"","inputSchema":{{"type":"object"}}}}"#)
    };
    let a = write_mock_server(dir.path(), "a", &tool("one"));
    let b = write_mock_server(dir.path(), "b", &tool("two"));
    let c = write_mock_server(dir.path(), "c", &tool("three"));

    let stack_yaml = |servers: &[(&str, &PathBuf)]| {
        let mut out = String::from("name: reload-demo\nmcp_servers:\n");
        for (name, path) in servers {
            out.push_str(&format!(
                "  - name: {name}\n    command: [\"sh\", \"{}\"]\n",
                path.display()
            ));
        }
        out
    };

    let stack = StackConfig::parse(&stack_yaml(&[("a", &a), ("b", &b)])).unwrap();
    let mut gateway = Gateway::build(stack, None, Arc::new(LogBuffer::default()))
        .await
        .unwrap();
    let state = gateway.state();

    // Reproduce the run loop's fan-out: every publication becomes one
    // listChanged broadcast. Bring-up publications predate any session,
    // so drop them first.
    let mut publish_rx = gateway.take_publish_rx().unwrap();
    while publish_rx.try_recv().is_ok() {}
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        while publish_rx.recv().await.is_some() {
            sessions.broadcast_list_changed();
        }
    });

    let first = state.sessions.open(None).unwrap();
    let second = state.sessions.open(None).unwrap();

    let new_stack = StackConfig::parse(&stack_yaml(&[("a", &a), ("c", &c)])).unwrap();
    let outcome = reload::apply(&state, new_stack.clone()).await;
    assert_eq!(outcome.added, ["c"]);
    assert_eq!(outcome.removed, ["b"]);
    assert!(outcome.errors.is_empty());

    let app = build_app(Arc::clone(&state));
    let servers = get_json(&app, "/api/mcp-servers").await;
    let names: Vec<&str> = servers["mcp_servers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|server| server["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"a"));
    assert!(names.contains(&"c"));
    assert!(!names.contains(&"b"));
    let c_status = servers["mcp_servers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|server| server["name"] == "c")
        .unwrap();
    assert_eq!(c_status["initialized"], true);

    // Every prior session received exactly one listChanged.
    tokio::time::sleep(Duration::from_millis(50)).await;
    for session in [&first, &second] {
        let message = session.next_message().await.unwrap();
        assert_eq!(message["method"], LIST_CHANGED_METHOD);
        assert!(session.is_closed() || session_queue_is_empty(session).await);
    }

    // Reloading an identical stack is a no-op with no notifications.
    let outcome = reload::apply(&state, new_stack).await;
    assert!(outcome.added.is_empty());
    assert!(outcome.removed.is_empty());
    assert!(!outcome.agents_updated);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(session_queue_is_empty(&first).await);

    for client in state.router.clients_snapshot().await {
        client.shutdown().await;
    }
}

async fn session_queue_is_empty(session: &Arc<crate::session::Session>) -> bool {
    tokio::time::timeout(Duration::from_millis(20), session.next_message())
        .await
        .is_err()
}

#[tokio::test]
async fn crashed_stdio_upstream_is_revived_by_the_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("crashed-once");
    let script = write_crashing_server(dir.path(), &marker);

    let stack = StackConfig::parse(&format!(
        "name: crash-demo\ngateway:\n  ping_timeout_secs: 1\nmcp_servers:\n  - name: crashy\n    command: [\"sh\", \"{}\"]\n",
        script.display()
    ))
    .unwrap();

    let gateway = Gateway::build(stack, None, Arc::new(LogBuffer::default()))
        .await
        .unwrap();
    let state = gateway.state();
    let client = state.router.clients_snapshot().await[0].clone();
    assert!(client.base().is_initialized());

    // First call kills the process; the pending request is drained with a
    // transport error which the rpc layer wraps as an is_error result.
    let app = build_app(Arc::clone(&state));
    let reply = post_json(
        &app,
        "/mcp",
        json!({"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"crashy__flaky","arguments":{}}}),
    )
    .await;
    assert_eq!(reply["result"]["isError"], true);

    // Three failed pings mark it unhealthy, then the next sweep respawns.
    let mut failures = HashMap::new();
    for _ in 0..UNHEALTHY_AFTER_FAILURES {
        run_sweep(&state.router, &mut failures).await;
    }
    assert!(!client.base().is_healthy());

    run_sweep(&state.router, &mut failures).await;
    assert!(client.base().is_healthy());
    assert!(client.base().is_initialized());

    let reply = post_json(
        &app,
        "/mcp",
        json!({"jsonrpc":"2.0","id":2,"method":"tools/call","params":{"name":"crashy__flaky","arguments":{}}}),
    )
    .await;
    assert_eq!(reply["result"]["content"][0]["text"], "revived");

    client.shutdown().await;
}

#[tokio::test]
async fn graceful_shutdown_notifies_streams_then_refuses_requests() {
    let stack = StackConfig::parse("name: shutdown-demo\ngateway:\n  shutdown_grace_secs: 2\n").unwrap();
    let gateway = Gateway::build(stack, None, Arc::new(LogBuffer::default()))
        .await
        .unwrap();
    let state = gateway.state();
    let token = gateway.shutdown_token();

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(gateway.run(listener));

    let client = reqwest::Client::new();
    let stream_one = client
        .get(format!("http://{addr}/sse"))
        .send()
        .await
        .unwrap();
    let stream_two = client
        .get(format!("http://{addr}/sse"))
        .send()
        .await
        .unwrap();

    // Wait for both sessions to register, then shut down.
    for _ in 0..50 {
        if state.sessions.count() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state.sessions.count(), 2);
    token.cancel();

    for stream in [stream_one, stream_two] {
        let body = tokio::time::timeout(Duration::from_secs(10), stream.text())
            .await
            .expect("stream should close after shutdown")
            .unwrap();
        assert!(body.contains("endpoint"), "missing endpoint event: {body}");
        assert!(
            body.contains("notifications/shutdown"),
            "missing shutdown notification: {body}"
        );
    }

    tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("server should stop")
        .unwrap()
        .unwrap();

    // The listener is gone; new requests are refused.
    assert!(
        client
            .get(format!("http://{addr}/health"))
            .send()
            .await
            .is_err()
    );
}
