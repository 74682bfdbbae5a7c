//! Administrative REST surface: status, catalog dump, logs, reload,
//! agent status, registry CRUD, and A2A discovery.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};

use gridctl_config::StackConfig;
use gridctl_core::logbuf::LogLevel;
use gridctl_core::types::MCP_PROTOCOL_VERSION;
use gridctl_registry::{REGISTRY_SERVER_NAME, RegistryError, RegistryServer, Skill, SkillState};

use crate::facade::{GatewayState, error_body};
use crate::reload;
use crate::upstream::{RegistryUpstream, UpstreamClient};

pub(crate) async fn status_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let stack = state.stack.lock().await.clone();
    let clients = state.router.clients_snapshot().await;
    let catalog = state.router.catalog().await;

    Json(json!({
        "server": {
            "name": if stack.name.is_empty() { "gridctl".to_string() } else { stack.name.clone() },
            "version": env!("CARGO_PKG_VERSION"),
            "protocol_version": MCP_PROTOCOL_VERSION,
        },
        "uptime_secs": (chrono::Utc::now() - state.started_at).num_seconds(),
        "sessions": state.sessions.count(),
        "tools": catalog.len(),
        "mcp_servers": server_statuses(&clients),
        "agents": state.policy.list().iter().map(|agent| json!({
            "name": agent.name,
            "a2a_enabled": agent.a2a_enabled,
            "servers": agent.uses.iter().map(|sel| sel.server.clone()).collect::<Vec<_>>(),
        })).collect::<Vec<_>>(),
    }))
}

pub(crate) async fn mcp_servers_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let clients = state.router.clients_snapshot().await;
    Json(json!({ "mcp_servers": server_statuses(&clients) }))
}

fn server_statuses(clients: &[Arc<UpstreamClient>]) -> Vec<Value> {
    clients
        .iter()
        .map(|client| {
            json!({
                "name": client.name(),
                "transport": client.transport_label(),
                "initialized": client.base().is_initialized(),
                "healthy": client.base().is_healthy(),
                "tools": client.tools_list().len(),
            })
        })
        .collect()
}

pub(crate) async fn tools_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let tools = state.router.handle_tools_list(None).await;
    Json(json!({ "tools": tools }))
}

#[derive(Debug, Deserialize)]
pub(crate) struct LogsQuery {
    lines: Option<usize>,
    level: Option<String>,
}

pub(crate) async fn logs_handler(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<LogsQuery>,
) -> Response {
    let min_level = match query.level.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<LogLevel>() {
            Ok(level) => Some(level),
            Err(error) => {
                return (StatusCode::BAD_REQUEST, error_body(error)).into_response();
            }
        },
    };

    let lines = query.lines.unwrap_or(100);
    let records = state.logs.tail(lines, min_level);
    Json(json!({ "logs": records })).into_response()
}

pub(crate) async fn reload_handler(State(state): State<Arc<GatewayState>>) -> Response {
    if !state.settings.reload_enabled {
        return (StatusCode::SERVICE_UNAVAILABLE, error_body("reload is not enabled"))
            .into_response();
    }
    let Some(stack_path) = state.stack_path.as_deref() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("no stack file to reload from"),
        )
            .into_response();
    };

    let new_stack = match StackConfig::load(stack_path) {
        Ok(stack) => stack,
        Err(error) => {
            return (StatusCode::BAD_REQUEST, error_body(format!("{error:#}"))).into_response();
        }
    };

    let outcome = reload::apply(&state, new_stack).await;
    Json(json!(outcome)).into_response()
}

pub(crate) async fn agents_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let agents: Vec<Value> = state
        .policy
        .list()
        .iter()
        .map(|agent| {
            json!({
                "name": agent.name,
                "a2a_enabled": agent.a2a_enabled,
                "uses": agent.uses,
            })
        })
        .collect();
    Json(json!({ "agents": agents }))
}

fn agent_action(state: &GatewayState, name: &str) -> Response {
    if state.policy.known(name) {
        // Container lifecycle belongs to the orchestrator, which is not
        // part of the control plane process.
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("container runtime not configured"),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            error_body(format!("unknown agent '{name}'")),
        )
            .into_response()
    }
}

pub(crate) async fn agent_logs_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    agent_action(&state, &name)
}

pub(crate) async fn agent_restart_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    agent_action(&state, &name)
}

pub(crate) async fn agent_stop_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    agent_action(&state, &name)
}

/// A2A discovery document for the stack: the gateway itself plus its
/// a2a-enabled agents.
pub(crate) async fn agent_card_handler(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    let stack = state.stack.lock().await.clone();
    let agents: Vec<Value> = state
        .policy
        .list()
        .iter()
        .filter(|agent| agent.a2a_enabled)
        .map(|agent| json!({ "name": agent.name }))
        .collect();

    Json(json!({
        "name": if stack.name.is_empty() { "gridctl".to_string() } else { stack.name.clone() },
        "description": "gridctl control plane",
        "url": format!("http://{}:{}", state.settings.bind, state.settings.port),
        "version": env!("CARGO_PKG_VERSION"),
        "skills": [],
        "agents": agents,
    }))
}

// --- registry CRUD --------------------------------------------------------

fn registry(state: &GatewayState) -> Result<&RegistryServer, Response> {
    state.registry.as_ref().ok_or_else(|| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            error_body("registry is not configured"),
        )
            .into_response()
    })
}

fn registry_error(error: &RegistryError) -> Response {
    let status = match error {
        RegistryError::Conflict(_) => StatusCode::CONFLICT,
        RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
        RegistryError::Invalid(_) => StatusCode::BAD_REQUEST,
        RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body(error.to_string())).into_response()
}

/// Keep the router's view of the registry in line with its content:
/// registered while at least one skill exists, absent otherwise. Exactly
/// one catalog publication per mutation.
pub(crate) async fn sync_registry(state: &GatewayState) {
    let Some(registry) = state.registry.as_ref() else {
        return;
    };
    let present = state.router.has_client(REGISTRY_SERVER_NAME).await;

    if registry.has_content() {
        if present {
            state.router.refresh_client(REGISTRY_SERVER_NAME).await;
        } else {
            let upstream = RegistryUpstream::new(REGISTRY_SERVER_NAME, registry.clone());
            if let Err(error) = upstream.initialize() {
                tracing::warn!(error = %error, "registry upstream failed to initialize");
                return;
            }
            state
                .router
                .add_client(Arc::new(UpstreamClient::Registry(upstream)))
                .await;
        }
    } else if present {
        state.router.remove_client(REGISTRY_SERVER_NAME).await;
    }
}

pub(crate) async fn registry_list_handler(State(state): State<Arc<GatewayState>>) -> Response {
    match registry(&state) {
        Ok(registry) => Json(json!({ "skills": registry.store().list() })).into_response(),
        Err(response) => response,
    }
}

pub(crate) async fn registry_get_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    let registry = match registry(&state) {
        Ok(registry) => registry,
        Err(response) => return response,
    };
    match registry.store().get(&name) {
        Some(skill) => Json(json!(skill)).into_response(),
        None => registry_error(&RegistryError::NotFound(name)),
    }
}

pub(crate) async fn registry_create_handler(
    State(state): State<Arc<GatewayState>>,
    Json(skill): Json<Skill>,
) -> Response {
    let result = match registry(&state) {
        Ok(registry) => registry.store().create(skill.clone()),
        Err(response) => return response,
    };
    match result {
        Ok(()) => {
            sync_registry(&state).await;
            (StatusCode::CREATED, Json(json!(skill))).into_response()
        }
        Err(error) => registry_error(&error),
    }
}

pub(crate) async fn registry_update_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
    Json(skill): Json<Skill>,
) -> Response {
    let result = match registry(&state) {
        Ok(registry) => registry.store().update(&name, skill),
        Err(response) => return response,
    };
    match result {
        Ok(()) => {
            sync_registry(&state).await;
            StatusCode::OK.into_response()
        }
        Err(error) => registry_error(&error),
    }
}

pub(crate) async fn registry_delete_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    let result = match registry(&state) {
        Ok(registry) => registry.store().delete(&name),
        Err(response) => return response,
    };
    match result {
        Ok(()) => {
            sync_registry(&state).await;
            StatusCode::NO_CONTENT.into_response()
        }
        Err(error) => registry_error(&error),
    }
}

async fn set_skill_state(state: Arc<GatewayState>, name: &str, new_state: SkillState) -> Response {
    let result = match registry(&state) {
        Ok(registry) => registry.store().set_state(name, new_state),
        Err(response) => return response,
    };
    match result {
        Ok(()) => {
            sync_registry(&state).await;
            StatusCode::OK.into_response()
        }
        Err(error) => registry_error(&error),
    }
}

pub(crate) async fn registry_activate_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    set_skill_state(state, &name, SkillState::Active).await
}

pub(crate) async fn registry_disable_handler(
    State(state): State<Arc<GatewayState>>,
    Path(name): Path<String>,
) -> Response {
    set_skill_state(state, &name, SkillState::Disabled).await
}
