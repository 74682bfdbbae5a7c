//! HTTP upstream: JSON-RPC request/response over POST, with SSE-framed
//! responses reassembled by request id when the server answers with
//! `text/event-stream`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio_stream::StreamExt;

use gridctl_core::GatewayError;
use gridctl_core::protocol::{CallToolResult, JsonRpcRequest, JsonRpcResponse, ToolsListResult};
use gridctl_core::types::{MCP_PROTOCOL_VERSION, ToolDescriptor};

use super::{CallTimeouts, UpstreamBase};

#[derive(Debug)]
pub struct HttpUpstream {
    base: UpstreamBase,
    label: &'static str,
    url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    next_id: AtomicU64,
    timeouts: CallTimeouts,
}

impl HttpUpstream {
    pub fn new(
        name: &str,
        url: String,
        headers: HashMap<String, String>,
        label: &'static str,
        whitelist: Vec<String>,
        timeouts: CallTimeouts,
    ) -> Self {
        Self {
            base: UpstreamBase::new(name, whitelist),
            label,
            url,
            headers,
            client: reqwest::Client::new(),
            next_id: AtomicU64::new(1),
            timeouts,
        }
    }

    pub fn base(&self) -> &UpstreamBase {
        &self.base
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub async fn initialize(&self) -> Result<(), GatewayError> {
        let _guard = self.base.init_guard().await;
        if self.base.is_initialized() {
            return Ok(());
        }

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
        self.notify("notifications/initialized", json!({})).await;

        self.base.set_initialized(true);
        tracing::info!(server = %self.base.name(), url = %self.url, "http upstream initialized");
        Ok(())
    }

    pub async fn refresh_tools(&self) -> Result<std::sync::Arc<Vec<ToolDescriptor>>, GatewayError> {
        let result = self.rpc("tools/list", json!({}), self.timeouts.call).await?;
        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|error| self.transport_err(format_args!("bad tools/list payload: {error}")))?;
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
        serde_json::from_value(result)
            .map_err(|error| self.transport_err(format_args!("bad tools/call payload: {error}")))
    }

    pub async fn ping(&self) -> Result<(), GatewayError> {
        match self.rpc("ping", json!({}), self.timeouts.ping).await {
            Ok(_) => Ok(()),
            // A well-formed "method not found" still proves liveness.
            Err(GatewayError::Transport { message, .. })
                if message.contains("-32601") || message.contains("method not found") =>
            {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    /// Idempotent: re-runs the handshake if it was never completed.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        if self.base.is_initialized() {
            return Ok(());
        }
        self.initialize().await
    }

    async fn rpc(&self, method: &str, params: Value, deadline: Duration) -> Result<Value, GatewayError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let response = tokio::time::timeout(deadline, self.post(&request))
            .await
            .map_err(|_| {
                self.transport_err(format_args!(
                    "{method} timed out after {}s",
                    deadline.as_secs()
                ))
            })??;

        if let Some(error) = response.error {
            return Err(self.transport_err(format_args!(
                "{method} failed ({}): {}",
                error.code, error.message
            )));
        }
        response
            .result
            .ok_or_else(|| self.transport_err(format_args!("{method} returned no result")))
    }

    async fn post(&self, request: &JsonRpcRequest) -> Result<JsonRpcResponse, GatewayError> {
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .json(request);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|error| self.transport_err(format_args!("request failed: {error}")))?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.transport_err(format_args!("http {status}: {body}")));
        }

        let want_id = request.id.clone();
        if content_type.starts_with("text/event-stream") {
            self.read_sse_response(response, want_id).await
        } else {
            let body = response
                .bytes()
                .await
                .map_err(|error| self.transport_err(format_args!("body read failed: {error}")))?;
            serde_json::from_slice(&body)
                .map_err(|error| self.transport_err(format_args!("invalid JSON-RPC response: {error}")))
        }
    }

    /// Read SSE frames until the event carrying the response for `want_id`
    /// arrives. A disconnect before that frame fails the call; retrying is
    /// the caller's decision.
    async fn read_sse_response(
        &self,
        response: reqwest::Response,
        want_id: Option<Value>,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let mut stream = response.bytes_stream();
        let mut pending = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|error| self.transport_err(format_args!("sse read failed: {error}")))?;
            pending.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(boundary) = find_event_boundary(&pending) {
                let event = pending[..boundary.start].to_string();
                pending.drain(..boundary.end);
                if let Some(parsed) = parse_sse_event(&event) {
                    if parsed.id == want_id {
                        return Ok(parsed);
                    }
                }
            }
        }

        Err(self.transport_err(format_args!("sse stream closed before response arrived")))
    }

    async fn notify(&self, method: &str, params: Value) {
        let note = JsonRpcRequest::notification(method, params);
        let mut builder = self.client.post(&self.url).json(&note);
        for (key, value) in &self.headers {
            builder = builder.header(key, value);
        }
        if let Err(error) = builder.send().await {
            tracing::debug!(server = %self.base.name(), error = %error, "notification send failed");
        }
    }

    fn transport_err(&self, message: std::fmt::Arguments<'_>) -> GatewayError {
        GatewayError::transport(self.base.name(), message)
    }
}

struct EventBoundary {
    /// Length of the event text itself.
    start: usize,
    /// Length including the blank-line terminator.
    end: usize,
}

fn find_event_boundary(buffer: &str) -> Option<EventBoundary> {
    let lf = buffer.find("\n\n").map(|at| EventBoundary {
        start: at,
        end: at + 2,
    });
    let crlf = buffer.find("\r\n\r\n").map(|at| EventBoundary {
        start: at,
        end: at + 4,
    });
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.start <= b.start { a } else { b }),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    }
}

/// Join the `data:` lines of one SSE event and parse them as a JSON-RPC
/// response. Non-message events (comments, keep-alives) yield `None`.
fn parse_sse_event(event: &str) -> Option<JsonRpcResponse> {
    let mut data = String::new();
    for line in event.lines() {
        if let Some(rest) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if data.is_empty() {
        return None;
    }
    serde_json::from_str(&data).ok()
}
