//! Child-process upstream speaking newline-delimited JSON-RPC on stdio,
//! plus the remote-shell variant that tunnels the same framing through an
//! `ssh` invocation.
//!
//! A concurrent map from request id to a one-shot sender matches responses
//! to waiters. When the reader exits, every pending entry is drained to
//! fail its waiter; leaving one behind hangs a caller forever.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use gridctl_core::GatewayError;
use gridctl_core::protocol::{self, CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolsListResult};
use gridctl_core::types::{MCP_PROTOCOL_VERSION, ToolDescriptor};

use super::{CallTimeouts, UpstreamBase};

const KILL_GRACE_SECS: u64 = 3;

type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<JsonRpcResponse, String>>>>>;

#[derive(Debug)]
pub struct ProcessUpstream {
    base: UpstreamBase,
    argv: Vec<String>,
    env: HashMap<String, String>,
    timeouts: CallTimeouts,
    next_id: AtomicU64,
    pending: PendingMap,
    io: tokio::sync::Mutex<Option<ProcessIo>>,
}

#[derive(Debug)]
struct ProcessIo {
    stdin: ChildStdin,
    child: Child,
    reader_cancel: CancellationToken,
}

impl ProcessIo {
    async fn teardown(mut self) {
        self.reader_cancel.cancel();
        match tokio::time::timeout(Duration::from_secs(KILL_GRACE_SECS), self.child.wait()).await {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                tracing::debug!(error = %error, "failed to wait on upstream child");
            }
            Err(_) => {
                let _ = self.child.kill().await;
            }
        }
    }
}

impl ProcessUpstream {
    pub fn local(
        name: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        whitelist: Vec<String>,
        timeouts: CallTimeouts,
    ) -> Result<Self, GatewayError> {
        if command.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "server '{name}': empty command"
            )));
        }
        Ok(Self {
            base: UpstreamBase::new(name, whitelist),
            argv: command,
            env,
            timeouts,
            next_id: AtomicU64::new(1),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            io: tokio::sync::Mutex::new(None),
        })
    }

    /// Remote variant: same framing, stdin/stdout tunneled over ssh. The
    /// declared env is carried to the remote side via `env KEY=VALUE`.
    pub fn remote(
        name: &str,
        target: &str,
        command: Vec<String>,
        env: HashMap<String, String>,
        whitelist: Vec<String>,
        timeouts: CallTimeouts,
    ) -> Result<Self, GatewayError> {
        if command.is_empty() {
            return Err(GatewayError::Configuration(format!(
                "server '{name}': empty command"
            )));
        }

        let mut argv = vec!["ssh".to_string(), target.to_string(), "--".to_string()];
        if !env.is_empty() {
            argv.push("env".to_string());
            let mut pairs: Vec<_> = env.iter().collect();
            pairs.sort();
            for (key, value) in pairs {
                argv.push(format!("{key}={value}"));
            }
        }
        argv.extend(command);

        Ok(Self {
            base: UpstreamBase::new(name, whitelist),
            argv,
            env: HashMap::new(),
            timeouts,
            next_id: AtomicU64::new(1),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            io: tokio::sync::Mutex::new(None),
        })
    }

    pub fn base(&self) -> &UpstreamBase {
        &self.base
    }

    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let _guard = self.base.init_guard().await;
        if self.base.is_initialized() {
            return Ok(());
        }

        self.ensure_spawned().await?;
        self.rpc(
            "initialize",
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "gridctl",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
            self.timeouts.call,
        )
        .await?;
        self.write_notification("notifications/initialized", json!({}))
            .await?;

        self.base.set_initialized(true);
        tracing::info!(server = %self.base.name(), command = %self.argv[0], "process upstream initialized");
        Ok(())
    }

    pub async fn refresh_tools(&self) -> Result<std::sync::Arc<Vec<ToolDescriptor>>, GatewayError> {
        let result = self.rpc("tools/list", json!({}), self.timeouts.call).await?;
        let listed: ToolsListResult = serde_json::from_value(result).map_err(|error| {
            GatewayError::transport(self.base.name(), format_args!("bad tools/list payload: {error}"))
        })?;
        Ok(self.base.store_tools(listed.tools))
    }

    pub async fn tools_call(&self, name: &str, args: Value) -> Result<CallToolResult, GatewayError> {
        let result = self
            .rpc(
                "tools/call",
                json!({ "name": name, "arguments": args }),
                self.timeouts.call,
            )
            .await?;
        serde_json::from_value(result).map_err(|error| {
            GatewayError::transport(self.base.name(), format_args!("bad tools/call payload: {error}"))
        })
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        let response = self.send_request("ping", json!({}), self.timeouts.ping).await?;
        match response.error {
            None => Ok(()),
            // A server without a ping handler still answered; that's alive.
            Some(error) if error.code == protocol::METHOD_NOT_FOUND => Ok(()),
            Some(error) => Err(GatewayError::transport(
                self.base.name(),
                format_args!("ping failed ({}): {}", error.code, error.message),
            )),
        }
    }

    /// Respawn with the same command vector. Idempotent: a live,
    /// initialized process is left alone.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        {
            let mut io = self.io.lock().await;
            if let Some(proc_io) = io.as_mut() {
                let alive = matches!(proc_io.child.try_wait(), Ok(None));
                if alive && self.base.is_initialized() {
                    return Ok(());
                }
                if let Some(stale) = io.take() {
                    stale.teardown().await;
                }
            }
        }

        self.base.set_initialized(false);
        self.initialize().await
    }

    pub async fn shutdown(&self) {
        if let Some(io) = self.io.lock().await.take() {
            io.teardown().await;
        }
        self.base.set_initialized(false);
    }

    async fn ensure_spawned(&self) -> Result<(), GatewayError> {
        let mut io = self.io.lock().await;
        if io.is_some() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|error| {
            GatewayError::transport(
                self.base.name(),
                format_args!("failed to spawn '{}': {error}", self.argv[0]),
            )
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            GatewayError::transport(self.base.name(), "failed to capture stdin")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            GatewayError::transport(self.base.name(), "failed to capture stdout")
        })?;

        if let Some(stderr) = child.stderr.take() {
            let server = self.base.name().to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::warn!(server = %server, "upstream stderr: {line}");
                }
            });
        }

        let reader_cancel = CancellationToken::new();
        spawn_reader(
            self.base.name().to_string(),
            stdout,
            Arc::clone(&self.pending),
            reader_cancel.clone(),
        );

        *io = Some(ProcessIo {
            stdin,
            child,
            reader_cancel,
        });
        Ok(())
    }

    async fn rpc(&self, method: &str, params: Value, deadline: Duration) -> Result<Value, GatewayError> {
        let response = self.send_request(method, params, deadline).await?;
        if let Some(error) = response.error {
            return Err(GatewayError::transport(
                self.base.name(),
                format_args!("{method} failed ({}): {}", error.code, error.message),
            ));
        }
        response.result.ok_or_else(|| {
            GatewayError::transport(self.base.name(), format_args!("{method} returned no result"))
        })
    }

    async fn send_request(
        &self,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        if let Err(error) = self.write_line(&request).await {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(error);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(reason))) => Err(GatewayError::transport(self.base.name(), reason)),
            Ok(Err(_)) => Err(GatewayError::transport(self.base.name(), "upstream terminated")),
            Err(_) => {
                self.pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id);
                Err(GatewayError::transport(
                    self.base.name(),
                    format_args!("{method} timed out after {}s", deadline.as_secs()),
                ))
            }
        }
    }

    async fn write_notification(&self, method: &str, params: Value) -> Result<(), GatewayError> {
        let note = JsonRpcRequest::notification(method, params);
        self.write_line(&note).await
    }

    async fn write_line(&self, message: &JsonRpcRequest) -> Result<(), GatewayError> {
        let mut payload = serde_json::to_string(message)
            .map_err(|error| GatewayError::Internal(error.to_string()))?;
        payload.push('\n');

        let mut io = self.io.lock().await;
        let proc_io = io.as_mut().ok_or_else(|| {
            GatewayError::transport(self.base.name(), "upstream process not running")
        })?;
        proc_io
            .stdin
            .write_all(payload.as_bytes())
            .await
            .map_err(|error| {
                GatewayError::transport(self.base.name(), format_args!("stdin write failed: {error}"))
            })?;
        proc_io.stdin.flush().await.map_err(|error| {
            GatewayError::transport(self.base.name(), format_args!("stdin flush failed: {error}"))
        })
    }
}

fn spawn_reader(
    server: String,
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        let reason = loop {
            tokio::select! {
                _ = cancel.cancelled() => break "upstream cancelled",
                line = lines.next_line() => match line {
                    Ok(Some(line)) => route_line(&server, &line, &pending),
                    Ok(None) => break "upstream terminated",
                    Err(error) => {
                        tracing::debug!(server = %server, error = %error, "upstream stdout read failed");
                        break "upstream terminated";
                    }
                }
            }
        };
        drain_pending(&pending, reason);
    });
}

fn route_line(server: &str, line: &str, pending: &PendingMap) {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return;
    }
    let Ok(response) = serde_json::from_str::<JsonRpcResponse>(trimmed) else {
        tracing::debug!(server = %server, "ignoring unparseable upstream line");
        return;
    };
    let Some(id) = response.id.as_ref().and_then(Value::as_u64) else {
        // Server-initiated notification; nothing is waiting on it.
        return;
    };
    let waiter = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&id);
    match waiter {
        Some(tx) => {
            let _ = tx.send(Ok(response));
        }
        None => {
            tracing::debug!(server = %server, id, "response with no pending waiter");
        }
    }
}

/// Fail every in-flight request. Called exactly once per reader exit.
fn drain_pending(pending: &PendingMap, reason: &str) {
    let drained: Vec<_> = pending
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .collect();
    for (_, tx) in drained {
        let _ = tx.send(Err(reason.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssh_argv_wraps_command_with_env() {
        let client = ProcessUpstream::remote(
            "far",
            "ops@build-host",
            vec!["mcp-server".into(), "--flag".into()],
            [("DEBUG".to_string(), "1".to_string())].into_iter().collect(),
            vec![],
            CallTimeouts::default(),
        )
        .unwrap();
        assert_eq!(
            client.argv,
            ["ssh", "ops@build-host", "--", "env", "DEBUG=1", "mcp-server", "--flag"]
        );
    }

    #[test]
    fn empty_command_is_a_configuration_error() {
        let err = ProcessUpstream::local(
            "bad",
            vec![],
            HashMap::new(),
            vec![],
            CallTimeouts::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::Configuration(_)));
    }

    #[tokio::test]
    async fn drain_fails_every_pending_waiter() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx1);
        pending.lock().unwrap().insert(2, tx2);

        drain_pending(&pending, "upstream terminated");

        assert_eq!(rx1.await.unwrap().unwrap_err(), "upstream terminated");
        assert_eq!(rx2.await.unwrap().unwrap_err(), "upstream terminated");
        assert!(pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn route_line_matches_waiter_by_id() {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        route_line(
            "mock",
            r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#,
            &pending,
        );

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.result.unwrap()["ok"], true);

        // Unmatched ids and notifications are ignored without panicking.
        route_line("mock", r#"{"jsonrpc":"2.0","id":99,"result":{}}"#, &pending);
        route_line(
            "mock",
            r#"{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}"#,
            &pending,
        );
    }
}
