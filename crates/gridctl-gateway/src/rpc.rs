//! JSON-RPC method dispatch for the gateway's MCP surface. Downstream
//! protocol errors map to the standard codes; upstream failures from
//! `tools/call` come back as tool results with `is_error = true`, so the
//! JSON-RPC call itself still succeeds.

use serde_json::{Value, json};

use gridctl_core::GatewayError;
use gridctl_core::protocol::{
    self, CallToolResult, InitializeResult, JsonRpcRequest, response_err, response_ok,
};

use crate::facade::GatewayState;

/// Handle one decoded JSON-RPC message. Returns `None` for notifications.
pub async fn dispatch(state: &GatewayState, identity: Option<&str>, raw: Value) -> Option<Value> {
    let request: JsonRpcRequest = match serde_json::from_value(raw) {
        Ok(request) => request,
        Err(_) => {
            return Some(response_err(
                None,
                protocol::INVALID_REQUEST,
                "invalid JSON-RPC request",
            ));
        }
    };
    if request.jsonrpc != protocol::JSONRPC_VERSION {
        return Some(response_err(
            request.id,
            protocol::INVALID_REQUEST,
            "unsupported JSON-RPC version",
        ));
    }
    if request.is_notification() {
        // Client-side notifications (notably notifications/initialized)
        // need no reply.
        return None;
    }

    let id = request.id.clone();
    let params = request.params.unwrap_or_else(|| json!({}));
    let outcome = handle_method(state, identity, &request.method, params).await;
    Some(match outcome {
        Ok(result) => response_ok(id, result),
        Err((code, message)) => response_err(id, code, message),
    })
}

async fn handle_method(
    state: &GatewayState,
    identity: Option<&str>,
    method: &str,
    params: Value,
) -> Result<Value, (i64, String)> {
    match method {
        "initialize" => {
            let stack_name = { state.stack.lock().await.name.clone() };
            let name = if stack_name.is_empty() {
                "gridctl".to_string()
            } else {
                format!("gridctl/{stack_name}")
            };
            let result = InitializeResult::gateway(&name, env!("CARGO_PKG_VERSION"));
            serde_json::to_value(result).map_err(internal)
        }
        "ping" => Ok(json!({})),
        "tools/list" => {
            let tools = state.router.handle_tools_list(identity).await;
            Ok(json!({ "tools": tools }))
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Err((protocol::INVALID_PARAMS, "missing tool name".to_string()));
            };
            let args = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

            match state.router.handle_tools_call(identity, name, args).await {
                Ok(result) => serde_json::to_value(result).map_err(internal),
                // Upstream failures surface verbatim inside the result.
                Err(error @ GatewayError::Transport { .. }) => {
                    serde_json::to_value(CallToolResult::error(error.to_string())).map_err(internal)
                }
                Err(error) => Err((error.jsonrpc_code(), error.to_string())),
            }
        }
        "prompts/list" => registry(state).map(|reg| reg.prompts_list()),
        "prompts/get" => {
            let reg = registry(state)?;
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Err((protocol::INVALID_PARAMS, "missing prompt name".to_string()));
            };
            reg.prompt_get(name)
                .map_err(|error| (protocol::INVALID_PARAMS, error.to_string()))
        }
        "resources/list" => registry(state).map(|reg| reg.resources_list()),
        "resources/read" => {
            let reg = registry(state)?;
            let Some(uri) = params.get("uri").and_then(Value::as_str) else {
                return Err((protocol::INVALID_PARAMS, "missing resource uri".to_string()));
            };
            reg.resource_read(uri)
                .map_err(|error| (protocol::INVALID_PARAMS, error.to_string()))
        }
        other => Err((
            protocol::METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        )),
    }
}

fn registry(state: &GatewayState) -> Result<&gridctl_registry::RegistryServer, (i64, String)> {
    state.registry.as_ref().ok_or((
        protocol::METHOD_NOT_FOUND,
        "registry is not configured".to_string(),
    ))
}

fn internal(error: serde_json::Error) -> (i64, String) {
    (protocol::INTERNAL_ERROR, error.to_string())
}
