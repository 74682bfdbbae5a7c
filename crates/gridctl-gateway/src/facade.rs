//! The gateway's HTTP surface. Every request passes, in order, through
//! the request-size limit, the CORS filter, the auth filter, and the
//! identity filter before reaching a handler.

use std::collections::HashMap;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, Request, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use gridctl_config::{GatewaySettings, StackConfig};
use gridctl_core::logbuf::LogBuffer;
use gridctl_core::protocol::{self, response_err};
use gridctl_registry::RegistryServer;

use crate::api;
use crate::policy::PolicyStore;
use crate::router::Router;
use crate::rpc;
use crate::session::SessionManager;
use crate::upstream::CallTimeouts;

/// Everything a request handler can reach. The facade owns the router,
/// session manager, policy store, log buffer, and the optional registry.
pub struct GatewayState {
    pub settings: GatewaySettings,
    pub stack: tokio::sync::Mutex<StackConfig>,
    pub stack_path: Option<PathBuf>,
    pub router: Arc<Router>,
    pub sessions: Arc<SessionManager>,
    pub policy: Arc<PolicyStore>,
    pub logs: Arc<LogBuffer>,
    pub registry: Option<RegistryServer>,
    pub timeouts: CallTimeouts,
    pub shutdown: CancellationToken,
    pub started_at: DateTime<Utc>,
}

/// Identity asserted via the `X-Agent-Name` header; trusted because the
/// auth token gates the surface, validated against the policy store.
#[derive(Debug, Clone)]
pub struct AgentName(pub Option<String>);

pub fn build_app(state: Arc<GatewayState>) -> axum::Router {
    axum::Router::new()
        .route("/mcp", post(mcp_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/.well-known/agent.json", get(api::agent_card_handler))
        .route("/api/status", get(api::status_handler))
        .route("/api/mcp-servers", get(api::mcp_servers_handler))
        .route("/api/tools", get(api::tools_handler))
        .route("/api/logs", get(api::logs_handler))
        .route("/api/reload", post(api::reload_handler))
        .route("/api/agents", get(api::agents_handler))
        .route("/api/agents/{name}/logs", get(api::agent_logs_handler))
        .route("/api/agents/{name}/restart", post(api::agent_restart_handler))
        .route("/api/agents/{name}/stop", post(api::agent_stop_handler))
        .route(
            "/api/registry/skills",
            get(api::registry_list_handler).post(api::registry_create_handler),
        )
        .route(
            "/api/registry/skills/{name}",
            get(api::registry_get_handler)
                .put(api::registry_update_handler)
                .delete(api::registry_delete_handler),
        )
        .route(
            "/api/registry/skills/{name}/activate",
            post(api::registry_activate_handler),
        )
        .route(
            "/api/registry/skills/{name}/disable",
            post(api::registry_disable_handler),
        )
        .with_state(Arc::clone(&state))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            identity_filter,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_filter,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            cors_filter,
        ))
        .layer(DefaultBodyLimit::max(state.settings.max_body_bytes))
}

pub(crate) fn error_body(message: impl Into<String>) -> Json<Value> {
    Json(json!({ "error": message.into() }))
}

// --- middleware -----------------------------------------------------------

fn origin_allowed(allowed: &[String], origin: &str) -> bool {
    allowed
        .iter()
        .any(|entry| entry == "*" || entry == origin)
}

fn apply_cors_headers(response: &mut Response, origin: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-API-Key, X-Agent-Name"),
    );
}

/// Allow-list CORS. The request origin is echoed back when allowed; a
/// wildcard entry echoes any origin, but only when one is present.
async fn cors_filter(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request
        .headers()
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let allowed = origin
        .as_deref()
        .map(|origin| origin_allowed(&state.settings.allowed_origins, origin))
        .unwrap_or(false);

    if request.method() == Method::OPTIONS {
        let mut response = StatusCode::NO_CONTENT.into_response();
        if let (true, Some(origin)) = (allowed, origin.as_deref()) {
            apply_cors_headers(&mut response, origin);
        }
        return response;
    }

    let mut response = next.run(request).await;
    if let (true, Some(origin)) = (allowed, origin.as_deref()) {
        apply_cors_headers(&mut response, origin);
    }
    response
}

/// Compare digests rather than raw bytes so the comparison cost does not
/// depend on how much of the token matched.
fn token_matches(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

fn presented_token(request: &Request) -> Option<String> {
    if let Some(bearer) = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
    {
        return Some(bearer.to_string());
    }
    request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

/// Shared-token auth. Liveness endpoints and pre-flights are exempt; with
/// no key configured the surface is open (local bind).
async fn auth_filter(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let exempt = path == "/health" || path == "/ready" || request.method() == Method::OPTIONS;

    if !exempt {
        if let Some(expected) = state.settings.api_key.as_deref() {
            let authorized = presented_token(&request)
                .map(|token| token_matches(expected, &token))
                .unwrap_or(false);
            if !authorized {
                return (StatusCode::UNAUTHORIZED, error_body("unauthorized")).into_response();
            }
        }
    }

    next.run(request).await
}

/// Validate `X-Agent-Name` against the policy store and stash it for the
/// handlers. Absent identity means full visibility (administrative use).
async fn identity_filter(
    State(state): State<Arc<GatewayState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let path = request.uri().path();
    let exempt = path == "/health" || path == "/ready";

    let identity = request
        .headers()
        .get("x-agent-name")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    if !exempt {
        if let Some(name) = identity.as_deref() {
            if !state.policy.known(name) {
                return (
                    StatusCode::UNAUTHORIZED,
                    error_body(format!("unknown agent '{name}'")),
                )
                    .into_response();
            }
        }
    }

    request.extensions_mut().insert(AgentName(identity));
    next.run(request).await
}

// --- MCP surfaces ---------------------------------------------------------

async fn mcp_handler(
    State(state): State<Arc<GatewayState>>,
    axum::Extension(AgentName(identity)): axum::Extension<AgentName>,
    body: Bytes,
) -> Response {
    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(_) => {
            return Json(response_err(None, protocol::PARSE_ERROR, "parse error")).into_response();
        }
    };

    match rpc::dispatch(&state, identity.as_deref(), message).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Open a streaming session. The first event names the sibling endpoint
/// for client→server messages; notifications are delivered afterwards in
/// enqueue order by a dedicated writer task.
async fn sse_handler(
    State(state): State<Arc<GatewayState>>,
    axum::Extension(AgentName(identity)): axum::Extension<AgentName>,
) -> Response {
    let Some(session) = state.sessions.open(identity) else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("gateway is shutting down"),
        )
            .into_response();
    };

    let session_id = session.id().to_string();
    tracing::info!(session = %session_id, "streaming session opened");

    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(16);
    let sessions = Arc::clone(&state.sessions);
    tokio::spawn(async move {
        let endpoint = Event::default()
            .event("endpoint")
            .data(format!("/message?sessionId={}", session.id()));
        if tx.send(Ok(endpoint)).await.is_err() {
            sessions.close(session.id());
            return;
        }

        while let Some(message) = session.next_message().await {
            let event = Event::default().event("message").data(message.to_string());
            if tx.send(Ok(event)).await.is_err() {
                break;
            }
        }
        sessions.close(session.id());
        tracing::info!(session = %session.id(), "streaming session closed");
    });

    Sse::new(ReceiverStream::new(rx))
        .keep_alive(KeepAlive::default())
        .into_response()
}

/// Client→server half of the streaming transport. Replies are delivered
/// over the session's stream; the POST itself only acknowledges receipt.
async fn message_handler(
    State(state): State<Arc<GatewayState>>,
    axum::Extension(AgentName(header_identity)): axum::Extension<AgentName>,
    Query(params): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let Some(session_id) = params.get("sessionId").or_else(|| params.get("session_id")) else {
        return (StatusCode::BAD_REQUEST, error_body("missing sessionId")).into_response();
    };
    let Some(session) = state.sessions.get(session_id) else {
        return (
            StatusCode::NOT_FOUND,
            error_body(format!("unknown session '{session_id}'")),
        )
            .into_response();
    };
    session.touch();

    let identity = header_identity.or_else(|| session.identity().map(str::to_string));

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(_) => {
            session.enqueue(response_err(None, protocol::PARSE_ERROR, "parse error"));
            return (StatusCode::ACCEPTED, "Accepted").into_response();
        }
    };

    if let Some(response) = rpc::dispatch(&state, identity.as_deref(), message).await {
        session.enqueue(response);
    }
    (StatusCode::ACCEPTED, "Accepted").into_response()
}

async fn health_handler() -> &'static str {
    "OK"
}

/// Ready iff every registered upstream has completed its handshake.
async fn ready_handler(State(state): State<Arc<GatewayState>>) -> Response {
    let clients = state.router.clients_snapshot().await;
    let pending: Vec<String> = clients
        .iter()
        .filter(|client| !client.base().is_initialized())
        .map(|client| client.name().to_string())
        .collect();

    if pending.is_empty() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body(format!("upstreams not initialized: {}", pending.join(", "))),
        )
            .into_response()
    }
}

#[cfg(test)]
#[path = "facade_tests.rs"]
mod tests;
