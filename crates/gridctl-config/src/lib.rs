//! Stack-file loading for gridctl: YAML parsing with transport
//! auto-detection, `${VAR}` expansion, and cross-entry validation.

pub mod expand;
pub mod stack;
mod validate;

pub use stack::{
    AgentConfig, GatewaySettings, McpServerConfig, OpenApiConfig, ServerTransport, StackConfig,
};
