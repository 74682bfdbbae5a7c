//! Shared vocabulary for the gridctl control plane: tool and identity
//! types, the error taxonomy, the MCP/JSON-RPC wire model, and the
//! structured log ring buffer.

pub mod error;
pub mod logbuf;
pub mod protocol;
pub mod redact;
pub mod types;

pub use error::GatewayError;
pub use types::{AgentIdentity, ToolDescriptor, ToolSelector};
