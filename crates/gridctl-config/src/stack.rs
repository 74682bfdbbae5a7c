use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gridctl_core::types::ToolSelector;
use serde::{Deserialize, Deserializer, Serialize};

use crate::expand;
use crate::validate;

pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8400;
pub const DEFAULT_MAX_BODY_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_SESSION_CAP: usize = 64;
pub const DEFAULT_SESSION_TTL_SECS: u64 = 900;
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 10;
pub const DEFAULT_CALL_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PING_TIMEOUT_SECS: u64 = 5;

/// Upstream transport configuration.
///
/// The stack file does not use an explicit tag for every shape; the
/// variant is detected from which fields an entry carries (`url`,
/// `command`, `openapi`, `image`). Serialization emits the same flat
/// shape the detection reads back.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum ServerTransport {
    /// Remote JSON-RPC endpoint, request/response HTTP POST.
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Remote endpoint whose responses arrive as `text/event-stream`.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Local child process speaking newline-delimited JSON-RPC on stdio.
    Command {
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Same framing as `Command`, tunneled through an ssh invocation.
    Ssh {
        #[serde(rename = "ssh")]
        target: String,
        command: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    /// Synthesized tools from an OpenAPI 3 document.
    OpenApi { openapi: OpenApiConfig },
    /// Container-hosted server; the orchestrator owns the container, the
    /// gateway dials the published port over HTTP.
    Container {
        image: String,
        port: u16,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        volumes: Vec<String>,
    },
}

impl ServerTransport {
    /// Short human-readable label for status payloads.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Sse { .. } => "sse",
            Self::Command { .. } => "stdio",
            Self::Ssh { .. } => "ssh",
            Self::OpenApi { .. } => "openapi",
            Self::Container { .. } => "container",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OpenApiConfig {
    /// File path or URL of the OpenAPI 3 document.
    pub spec: String,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Value for the `Authorization` header on synthesized calls.
    #[serde(default)]
    pub auth: Option<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Suppress `${VAR}` expansion inside the spec document itself.
    #[serde(default)]
    pub no_expand: bool,
}

/// One MCP-server entry of the stack file.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct McpServerConfig {
    pub name: String,
    #[serde(flatten)]
    pub transport: ServerTransport,
    /// Per-client tool whitelist (unprefixed names); empty means all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl<'de> Deserialize<'de> for McpServerConfig {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            name: String,
            // External endpoint fields
            url: Option<String>,
            transport: Option<String>,
            #[serde(default)]
            headers: HashMap<String, String>,
            // Process fields
            #[serde(default)]
            command: Vec<String>,
            #[serde(default)]
            env: HashMap<String, String>,
            ssh: Option<String>,
            // Adapter fields
            openapi: Option<OpenApiConfig>,
            // Container fields
            image: Option<String>,
            port: Option<u16>,
            #[serde(default)]
            volumes: Vec<String>,
            // Common
            #[serde(default)]
            tools: Vec<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        let name = raw.name;

        let shapes_present = [
            raw.url.is_some(),
            !raw.command.is_empty(),
            raw.openapi.is_some(),
            raw.image.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        if shapes_present > 1 {
            return Err(serde::de::Error::custom(format!(
                "server '{name}': entry mixes multiple transports; use exactly one of \
                 'url', 'command', 'openapi', 'image'"
            )));
        }

        let transport = if let Some(openapi) = raw.openapi {
            ServerTransport::OpenApi { openapi }
        } else if let Some(url) = raw.url {
            match raw.transport.as_deref().unwrap_or("http") {
                "http" => ServerTransport::Http {
                    url,
                    headers: raw.headers,
                },
                "sse" => ServerTransport::Sse {
                    url,
                    headers: raw.headers,
                },
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "server '{name}': unknown transport '{other}' (expected: http, sse)"
                    )));
                }
            }
        } else if !raw.command.is_empty() {
            match raw.ssh {
                Some(target) => ServerTransport::Ssh {
                    target,
                    command: raw.command,
                    env: raw.env,
                },
                None => ServerTransport::Command {
                    command: raw.command,
                    env: raw.env,
                },
            }
        } else if let Some(image) = raw.image {
            let port = raw.port.ok_or_else(|| {
                serde::de::Error::custom(format!(
                    "server '{name}': container entry requires 'port'"
                ))
            })?;
            ServerTransport::Container {
                image,
                port,
                env: raw.env,
                volumes: raw.volumes,
            }
        } else {
            return Err(serde::de::Error::custom(format!(
                "server '{name}': missing transport; provide 'url', 'command', \
                 'openapi', or 'image'"
            )));
        };

        Ok(McpServerConfig {
            name,
            transport,
            tools: raw.tools,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct A2aSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Base URL of the peer's A2A endpoint. When set (and enabled), the
    /// agent's skills are aggregated into the catalog like any upstream.
    #[serde(default)]
    pub url: Option<String>,
}

/// One agent entry of the stack file. The container image is orchestrated
/// externally; the control plane cares about the identity and its policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub name: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub uses: Vec<ToolSelector>,
    #[serde(default)]
    pub a2a: A2aSettings,
}

/// Gateway-facade settings, all optional in the stack file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: String,
    pub port: u16,
    /// Shared bearer/API key; `None` disables auth.
    pub api_key: Option<String>,
    pub allowed_origins: Vec<String>,
    pub max_body_bytes: usize,
    pub session_cap: usize,
    pub session_ttl_secs: u64,
    pub health_interval_secs: u64,
    pub shutdown_grace_secs: u64,
    pub call_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub reload_enabled: bool,
    /// Directory of registry skills; `None` disables the built-in registry.
    pub registry_dir: Option<PathBuf>,
    pub log_capacity: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            api_key: None,
            allowed_origins: vec!["*".to_string()],
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            session_cap: DEFAULT_SESSION_CAP,
            session_ttl_secs: DEFAULT_SESSION_TTL_SECS,
            health_interval_secs: DEFAULT_HEALTH_INTERVAL_SECS,
            shutdown_grace_secs: DEFAULT_SHUTDOWN_GRACE_SECS,
            call_timeout_secs: DEFAULT_CALL_TIMEOUT_SECS,
            ping_timeout_secs: DEFAULT_PING_TIMEOUT_SECS,
            reload_enabled: true,
            registry_dir: None,
            log_capacity: gridctl_core::logbuf::DEFAULT_LOG_CAPACITY,
        }
    }
}

/// The whole declarative stack.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StackConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerConfig>,
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    #[serde(default)]
    pub gateway: GatewaySettings,
}

impl StackConfig {
    /// Load, expand `${VAR}` placeholders, parse, and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read stack file: {}", path.display()))?;
        Self::parse(&raw)
            .with_context(|| format!("failed to load stack file: {}", path.display()))
    }

    /// Parse from raw YAML text (placeholders expanded first).
    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = expand::expand_str(raw);
        let stack: Self =
            serde_yaml::from_str(&expanded).context("failed to parse stack YAML")?;
        validate::validate(&stack)?;
        Ok(stack)
    }

    pub fn server(&self, name: &str) -> Option<&McpServerConfig> {
        self.mcp_servers.iter().find(|server| server.name == name)
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|agent| agent.name == name)
    }
}

#[cfg(test)]
#[path = "stack_tests.rs"]
mod tests;
