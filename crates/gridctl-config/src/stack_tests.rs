use super::*;
use crate::stack::{McpServerConfig, ServerTransport};

#[test]
fn parses_every_transport_shape() {
    let stack = StackConfig::parse(
        r#"
name: demo
network: grid
mcp_servers:
  - name: remote
    url: https://example.com/mcp
    transport: http
  - name: stream
    url: https://example.com/sse
    transport: sse
    headers:
      X-Extra: "1"
  - name: local-tools
    command: ["node", "srv.js"]
    env:
      DEBUG: "1"
    tools: [echo]
  - name: far-tools
    command: ["mcp-server"]
    ssh: ops@build-host
  - name: api
    openapi:
      spec: ./petstore.yaml
      base_url: http://127.0.0.1:9000
  - name: boxed
    image: ghcr.io/example/tools:latest
    port: 7007
agents:
  - name: alpha
    uses:
      - server: local-tools
        tools: [echo]
    a2a:
      enabled: true
"#,
    )
    .unwrap();

    assert_eq!(stack.name, "demo");
    assert_eq!(stack.mcp_servers.len(), 6);

    let labels: Vec<&str> = stack
        .mcp_servers
        .iter()
        .map(|server| server.transport.label())
        .collect();
    assert_eq!(labels, ["http", "sse", "stdio", "ssh", "openapi", "container"]);

    let local = stack.server("local-tools").unwrap();
    assert_eq!(local.tools, ["echo"]);
    match &local.transport {
        ServerTransport::Command { command, env } => {
            assert_eq!(command, &["node", "srv.js"]);
            assert_eq!(env["DEBUG"], "1");
        }
        other => panic!("expected stdio, got {other:?}"),
    }

    let far = stack.server("far-tools").unwrap();
    match &far.transport {
        ServerTransport::Ssh { target, command, .. } => {
            assert_eq!(target, "ops@build-host");
            assert_eq!(command, &["mcp-server"]);
        }
        other => panic!("expected ssh, got {other:?}"),
    }

    let alpha = stack.agent("alpha").unwrap();
    assert!(alpha.a2a.enabled);
    assert_eq!(alpha.uses[0].server, "local-tools");
}

#[test]
fn unknown_transport_is_rejected() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: bad
    url: wss://example.com
    transport: websocket
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("unknown transport 'websocket'"));
}

#[test]
fn entry_without_any_transport_is_rejected() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: bad
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("missing transport"));
}

#[test]
fn mixed_transport_fields_are_rejected() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: bad
    url: https://example.com/mcp
    command: ["node", "srv.js"]
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("mixes multiple transports"));
}

#[test]
fn duplicate_server_names_are_rejected() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: twin
    command: ["a"]
  - name: twin
    command: ["b"]
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("duplicate server name 'twin'"));
}

#[test]
fn server_name_with_delimiter_is_rejected() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: my__server
    command: ["a"]
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("reserved as the tool-name delimiter"));
}

#[test]
fn container_requires_port() {
    let err = StackConfig::parse(
        r#"
mcp_servers:
  - name: boxed
    image: ghcr.io/example/tools:latest
"#,
    )
    .unwrap_err();
    assert!(format!("{err:#}").contains("requires 'port'"));
}

#[test]
fn env_placeholders_expand_with_defaults() {
    // Unset variable with a default.
    let stack = StackConfig::parse(
        r#"
gateway:
  port: ${GRIDCTL_TEST_UNSET_PORT:-9123}
"#,
    )
    .unwrap();
    assert_eq!(stack.gateway.port, 9123);
}

#[test]
fn gateway_defaults_are_sensible() {
    let stack = StackConfig::parse("name: empty\n").unwrap();
    assert_eq!(stack.gateway.max_body_bytes, 4 * 1024 * 1024);
    assert_eq!(stack.gateway.health_interval_secs, 30);
    assert_eq!(stack.gateway.call_timeout_secs, 30);
    assert_eq!(stack.gateway.ping_timeout_secs, 5);
    assert_eq!(stack.gateway.shutdown_grace_secs, 10);
    assert!(stack.gateway.api_key.is_none());
}

#[test]
fn load_reads_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stack.yaml");
    std::fs::write(
        &path,
        "name: ondisk\nmcp_servers:\n  - name: local\n    command: [\"srv\"]\n",
    )
    .unwrap();

    let stack = StackConfig::load(&path).unwrap();
    assert_eq!(stack.name, "ondisk");
    assert_eq!(stack.mcp_servers.len(), 1);
}

#[test]
fn load_missing_file_fails_with_path() {
    let err = StackConfig::load(std::path::Path::new("/nonexistent/stack.yaml")).unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/stack.yaml"));
}

#[test]
fn serialized_server_round_trips_shape() {
    let server = McpServerConfig {
        name: "remote".into(),
        transport: ServerTransport::Http {
            url: "https://example.com/mcp".into(),
            headers: Default::default(),
        },
        tools: vec![],
    };
    let yaml = serde_yaml::to_string(&server).unwrap();
    assert!(yaml.contains("url: https://example.com/mcp"));
}
