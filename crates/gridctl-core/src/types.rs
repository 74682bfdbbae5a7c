use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Delimiter between the owning server slug and the upstream tool name in
/// an externally visible tool name. Upstreams never see the prefix.
pub const TOOL_NAME_DELIMITER: &str = "__";

/// MCP protocol version advertised during `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "2025-03-26";

/// A tool as advertised by one upstream. The input schema is opaque
/// JSON-Schema carried through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", alias = "input_schema", default = "empty_object_schema")]
    pub input_schema: Value,
}

fn empty_object_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: empty_object_schema(),
        }
    }

    /// The external name of this tool when owned by `server`.
    pub fn prefixed(&self, server: &str) -> String {
        prefixed_tool_name(server, &self.name)
    }
}

/// Build the external `<server>__<tool>` name.
pub fn prefixed_tool_name(server: &str, tool: &str) -> String {
    format!("{server}{TOOL_NAME_DELIMITER}{tool}")
}

/// Split an external tool name at the **first** `__`. Tool names may
/// themselves contain `__`; server slugs may not (enforced at stack load).
pub fn split_prefixed_name(prefixed: &str) -> Option<(&str, &str)> {
    prefixed.split_once(TOOL_NAME_DELIMITER)
}

/// One row of an agent's access policy: which upstream server, and which
/// of its tools. An empty `tools` list grants every tool of that server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSelector {
    pub server: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
}

impl ToolSelector {
    pub fn allows(&self, tool: &str) -> bool {
        self.tools.is_empty() || self.tools.iter().any(|t| t == tool)
    }
}

/// A named agent identity and its tool access policy. Identities are
/// asserted via a request header; an unknown identity has no access.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    pub name: String,
    #[serde(default)]
    pub uses: Vec<ToolSelector>,
    #[serde(default)]
    pub a2a_enabled: bool,
}

impl AgentIdentity {
    /// Whether this identity may call `tool` on `server`.
    pub fn allows_tool(&self, server: &str, tool: &str) -> bool {
        self.uses
            .iter()
            .any(|sel| sel.server == server && sel.allows(tool))
    }

    /// Whether any selector names `server` at all.
    pub fn allows_server(&self, server: &str) -> bool {
        self.uses.iter().any(|sel| sel.server == server)
    }
}
