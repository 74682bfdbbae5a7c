//! Hot reload: diff the live stack against a new one, swap upstreams and
//! policy, and broadcast a single `listChanged` no matter how many
//! entries moved. An unchanged stack is a no-op.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use gridctl_config::{McpServerConfig, StackConfig};

use crate::facade::GatewayState;
use crate::upstream::UpstreamClient;

#[derive(Debug, Default, Serialize)]
pub struct ReloadOutcome {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub replaced: Vec<String>,
    pub agents_updated: bool,
    /// Per-entry failures; each aborts only its own diff entry.
    pub errors: Vec<String>,
}

pub async fn apply(state: &GatewayState, new_stack: StackConfig) -> ReloadOutcome {
    let old_stack = state.stack.lock().await.clone();
    let mut outcome = ReloadOutcome::default();

    let old_servers: HashMap<&str, &McpServerConfig> = old_stack
        .mcp_servers
        .iter()
        .map(|server| (server.name.as_str(), server))
        .collect();
    let new_servers: HashMap<&str, &McpServerConfig> = new_stack
        .mcp_servers
        .iter()
        .map(|server| (server.name.as_str(), server))
        .collect();

    let mut removals: Vec<String> = Vec::new();
    for server in &old_stack.mcp_servers {
        if !new_servers.contains_key(server.name.as_str()) {
            removals.push(server.name.clone());
            outcome.removed.push(server.name.clone());
        }
    }

    // Construct and initialize incoming clients before touching the
    // router; a failed entry keeps whatever was running before.
    let mut additions: Vec<Arc<UpstreamClient>> = Vec::new();
    for server in &new_stack.mcp_servers {
        let verb = match old_servers.get(server.name.as_str()) {
            None => "added",
            Some(old) if *old != server => "replaced",
            Some(_) => continue,
        };

        let client = match UpstreamClient::from_config(server, state.timeouts) {
            Ok(client) => Arc::new(client),
            Err(error) => {
                outcome.errors.push(format!("{}: {error}", server.name));
                continue;
            }
        };
        if let Err(error) = client.initialize().await {
            outcome.errors.push(format!("{}: {error}", server.name));
            continue;
        }
        if let Err(error) = client.refresh_tools().await {
            tracing::warn!(server = %server.name, error = %error, "tool refresh failed during reload");
        }

        if verb == "replaced" {
            removals.push(server.name.clone());
            outcome.replaced.push(server.name.clone());
        } else {
            outcome.added.push(server.name.clone());
        }
        additions.push(client);
    }

    let any_server_change = !additions.is_empty() || !removals.is_empty();
    let mut published = false;
    if any_server_change {
        let (detached, diff_published) = state.router.apply_diff(additions, &removals).await;
        published = diff_published;
        for client in detached {
            client.shutdown().await;
        }
    }

    if old_stack.agents != new_stack.agents {
        state.policy.replace_all(&new_stack.agents);
        outcome.agents_updated = true;
        tracing::info!(agents = new_stack.agents.len(), "agent policy reloaded");
        if !published {
            // Visibility changed even though the catalog did not.
            state.router.publish();
        }
    }

    *state.stack.lock().await = new_stack;

    tracing::info!(
        added = outcome.added.len(),
        removed = outcome.removed.len(),
        replaced = outcome.replaced.len(),
        errors = outcome.errors.len(),
        "hot reload applied"
    );
    outcome
}
