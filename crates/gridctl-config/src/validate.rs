use std::collections::HashSet;

use anyhow::{Result, bail};
use gridctl_core::types::TOOL_NAME_DELIMITER;

use crate::stack::{ServerTransport, StackConfig};

/// Cross-entry validation run after parsing. Rejects duplicate names,
/// names that would break external tool-name splitting, and empty
/// required fields the shape detection cannot catch.
pub(crate) fn validate(stack: &StackConfig) -> Result<()> {
    let mut server_names: HashSet<&str> = HashSet::new();
    for server in &stack.mcp_servers {
        if server.name.is_empty() {
            bail!("mcp_servers entry with empty name");
        }
        if server.name.contains(TOOL_NAME_DELIMITER) {
            bail!(
                "server '{}': name must not contain '{}' (reserved as the tool-name delimiter)",
                server.name,
                TOOL_NAME_DELIMITER
            );
        }
        if !server_names.insert(&server.name) {
            bail!("duplicate server name '{}'", server.name);
        }

        match &server.transport {
            ServerTransport::Http { url, .. } | ServerTransport::Sse { url, .. } => {
                if url.is_empty() {
                    bail!("server '{}': empty url", server.name);
                }
            }
            ServerTransport::Ssh { target, .. } => {
                if target.is_empty() {
                    bail!("server '{}': empty ssh target", server.name);
                }
            }
            ServerTransport::OpenApi { openapi } => {
                if openapi.spec.is_empty() {
                    bail!("server '{}': openapi entry requires 'spec'", server.name);
                }
            }
            ServerTransport::Container { port, .. } => {
                if *port == 0 {
                    bail!("server '{}': container port must be non-zero", server.name);
                }
            }
            ServerTransport::Command { .. } => {}
        }
    }

    let mut agent_names: HashSet<&str> = HashSet::new();
    for agent in &stack.agents {
        if agent.name.is_empty() {
            bail!("agents entry with empty name");
        }
        if !agent_names.insert(&agent.name) {
            bail!("duplicate agent name '{}'", agent.name);
        }
    }

    Ok(())
}
