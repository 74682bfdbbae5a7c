//! Upstream clients as a tagged union over a shared base.
//!
//! Each variant owns its lifecycle independently; the common surface
//! (`initialize`, `tools_list`, `tools_call`, `ping`, `reconnect`)
//! delegates to variant-specific behavior. The router never retries:
//! every call yields a tool-call result or a transport error.

mod a2a;
mod http;
mod openapi;
mod process;
mod registry;

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use a2a::A2aUpstream;
pub use http::HttpUpstream;
pub use openapi::OpenApiUpstream;
pub use process::ProcessUpstream;
pub use registry::RegistryUpstream;

use gridctl_core::GatewayError;
use gridctl_core::protocol::CallToolResult;
use gridctl_core::types::ToolDescriptor;
use gridctl_config::{GatewaySettings, McpServerConfig, ServerTransport};
use serde_json::Value;

/// Per-call deadlines shared by every variant.
#[derive(Debug, Clone, Copy)]
pub struct CallTimeouts {
    pub call: Duration,
    pub ping: Duration,
}

impl CallTimeouts {
    pub fn from_settings(settings: &GatewaySettings) -> Self {
        Self {
            call: Duration::from_secs(settings.call_timeout_secs),
            ping: Duration::from_secs(settings.ping_timeout_secs),
        }
    }
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            ping: Duration::from_secs(5),
        }
    }
}

/// State shared by all upstream variants: identity, lifecycle flags, the
/// cached tool list, and the optional per-client whitelist.
#[derive(Debug)]
pub struct UpstreamBase {
    name: String,
    initialized: AtomicBool,
    healthy: AtomicBool,
    tools: std::sync::RwLock<Arc<Vec<ToolDescriptor>>>,
    whitelist: HashSet<String>,
    // Serializes `initialize`; at most one handshake may be in flight.
    init_lock: tokio::sync::Mutex<()>,
}

impl UpstreamBase {
    pub fn new(name: impl Into<String>, whitelist: Vec<String>) -> Self {
        Self {
            name: name.into(),
            initialized: AtomicBool::new(false),
            healthy: AtomicBool::new(true),
            tools: std::sync::RwLock::new(Arc::new(Vec::new())),
            whitelist: whitelist.into_iter().collect(),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::Release);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    pub fn set_healthy(&self, value: bool) {
        self.healthy.store(value, Ordering::Release);
    }

    /// Current cached tools (already whitelist-filtered).
    pub fn cached_tools(&self) -> Arc<Vec<ToolDescriptor>> {
        Arc::clone(&self.tools.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Replace the cache, applying the whitelist. Only the owning client
    /// mutates its tool list.
    pub fn store_tools(&self, tools: Vec<ToolDescriptor>) -> Arc<Vec<ToolDescriptor>> {
        let filtered: Vec<ToolDescriptor> = if self.whitelist.is_empty() {
            tools
        } else {
            tools
                .into_iter()
                .filter(|tool| self.whitelist.contains(&tool.name))
                .collect()
        };
        let published = Arc::new(filtered);
        *self.tools.write().unwrap_or_else(|e| e.into_inner()) = Arc::clone(&published);
        published
    }

    async fn init_guard(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.init_lock.lock().await
    }
}

/// One upstream of any transport kind.
#[derive(Debug)]
pub enum UpstreamClient {
    Http(HttpUpstream),
    Stdio(ProcessUpstream),
    Ssh(ProcessUpstream),
    OpenApi(OpenApiUpstream),
    A2a(A2aUpstream),
    Registry(RegistryUpstream),
}

impl UpstreamClient {
    /// Construct a client for one stack entry. Container-hosted servers
    /// are dialed over HTTP at their published port; the orchestrator
    /// owns the container itself.
    pub fn from_config(
        config: &McpServerConfig,
        timeouts: CallTimeouts,
    ) -> Result<Self, GatewayError> {
        let whitelist = config.tools.clone();
        let client = match &config.transport {
            ServerTransport::Http { url, headers } => Self::Http(HttpUpstream::new(
                &config.name,
                url.clone(),
                headers.clone(),
                "http",
                whitelist,
                timeouts,
            )),
            ServerTransport::Sse { url, headers } => Self::Http(HttpUpstream::new(
                &config.name,
                url.clone(),
                headers.clone(),
                "sse",
                whitelist,
                timeouts,
            )),
            ServerTransport::Container { port, .. } => Self::Http(HttpUpstream::new(
                &config.name,
                format!("http://127.0.0.1:{port}/mcp"),
                Default::default(),
                "container",
                whitelist,
                timeouts,
            )),
            ServerTransport::Command { command, env } => Self::Stdio(ProcessUpstream::local(
                &config.name,
                command.clone(),
                env.clone(),
                whitelist,
                timeouts,
            )?),
            ServerTransport::Ssh {
                target,
                command,
                env,
            } => Self::Ssh(ProcessUpstream::remote(
                &config.name,
                target,
                command.clone(),
                env.clone(),
                whitelist,
                timeouts,
            )?),
            ServerTransport::OpenApi { openapi } => Self::OpenApi(OpenApiUpstream::new(
                &config.name,
                openapi.clone(),
                whitelist,
                timeouts,
            )),
        };
        Ok(client)
    }

    pub fn base(&self) -> &UpstreamBase {
        match self {
            Self::Http(c) => c.base(),
            Self::Stdio(c) | Self::Ssh(c) => c.base(),
            Self::OpenApi(c) => c.base(),
            Self::A2a(c) => c.base(),
            Self::Registry(c) => c.base(),
        }
    }

    pub fn name(&self) -> &str {
        self.base().name()
    }

    pub fn transport_label(&self) -> &'static str {
        match self {
            Self::Http(c) => c.label(),
            Self::Stdio(_) => "stdio",
            Self::Ssh(_) => "ssh",
            Self::OpenApi(_) => "openapi",
            Self::A2a(_) => "a2a",
            Self::Registry(_) => "registry",
        }
    }

    /// Perform the MCP handshake. Serialized per client; a failure leaves
    /// `initialized = false` for the health monitor to retry.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        match self {
            Self::Http(c) => c.initialize().await,
            Self::Stdio(c) | Self::Ssh(c) => c.initialize().await,
            Self::OpenApi(c) => c.initialize().await,
            Self::A2a(c) => c.initialize().await,
            Self::Registry(c) => c.initialize(),
        }
    }

    /// The cached tool list; `refresh_tools` re-queries the upstream.
    pub fn tools_list(&self) -> Arc<Vec<ToolDescriptor>> {
        self.base().cached_tools()
    }

    pub async fn refresh_tools(&self) -> Result<Arc<Vec<ToolDescriptor>>, GatewayError> {
        match self {
            Self::Http(c) => c.refresh_tools().await,
            Self::Stdio(c) | Self::Ssh(c) => c.refresh_tools().await,
            Self::OpenApi(c) => c.refresh_tools().await,
            Self::A2a(c) => c.refresh_tools().await,
            Self::Registry(c) => Ok(c.refresh_tools()),
        }
    }

    /// Forward one tool call. `name` is the unprefixed upstream name.
    pub async fn tools_call(
        &self,
        name: &str,
        args: Value,
    ) -> Result<CallToolResult, GatewayError> {
        match self {
            Self::Http(c) => c.tools_call(name, args).await,
            Self::Stdio(c) | Self::Ssh(c) => c.tools_call(name, args).await,
            Self::OpenApi(c) => c.tools_call(name, args).await,
            Self::A2a(c) => c.tools_call(name, args).await,
            Self::Registry(c) => c.tools_call(name),
        }
    }

    /// Cheap health probe under the ping deadline.
    pub async fn ping(&self) -> Result<(), GatewayError> {
        match self {
            Self::Http(c) => c.ping().await,
            Self::Stdio(c) | Self::Ssh(c) => c.ping().await,
            Self::OpenApi(c) => c.ping().await,
            Self::A2a(c) => c.ping().await,
            Self::Registry(_) => Ok(()),
        }
    }

    pub fn supports_reconnect(&self) -> bool {
        matches!(self, Self::Stdio(_) | Self::Ssh(_) | Self::Http(_))
    }

    /// Idempotent reconnect for transports that support it.
    pub async fn reconnect(&self) -> Result<(), GatewayError> {
        match self {
            Self::Stdio(c) | Self::Ssh(c) => c.reconnect().await,
            Self::Http(c) => c.reconnect().await,
            _ => Ok(()),
        }
    }

    /// Close the transport, draining any pending requests.
    pub async fn shutdown(&self) {
        match self {
            Self::Stdio(c) | Self::Ssh(c) => c.shutdown().await,
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitelist_filters_stored_tools() {
        let base = UpstreamBase::new("local-tools", vec!["echo".to_string()]);
        let stored = base.store_tools(vec![
            ToolDescriptor::new("echo", "echo back"),
            ToolDescriptor::new("get_time", "clock"),
        ]);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].name, "echo");
        assert_eq!(base.cached_tools()[0].name, "echo");
    }

    #[test]
    fn empty_whitelist_exposes_all() {
        let base = UpstreamBase::new("local-tools", vec![]);
        let stored = base.store_tools(vec![
            ToolDescriptor::new("echo", ""),
            ToolDescriptor::new("get_time", ""),
        ]);
        assert_eq!(stored.len(), 2);
    }

    #[test]
    fn config_maps_to_expected_variants() {
        let stack = gridctl_config::StackConfig::parse(
            r#"
mcp_servers:
  - name: remote
    url: https://example.com/mcp
  - name: local
    command: ["srv"]
  - name: far
    command: ["srv"]
    ssh: user@host
  - name: api
    openapi:
      spec: ./x.yaml
  - name: boxed
    image: img
    port: 7007
"#,
        )
        .unwrap();

        let timeouts = CallTimeouts::default();
        let labels: Vec<&str> = stack
            .mcp_servers
            .iter()
            .map(|cfg| {
                UpstreamClient::from_config(cfg, timeouts)
                    .unwrap()
                    .transport_label()
            })
            .collect();
        assert_eq!(labels, ["http", "stdio", "ssh", "openapi", "container"]);
    }
}
