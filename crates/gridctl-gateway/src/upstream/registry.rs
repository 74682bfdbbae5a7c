//! The built-in skill registry viewed as an upstream client. All calls
//! are local; there is no transport to fail or reconnect.

use gridctl_core::GatewayError;
use gridctl_core::protocol::CallToolResult;
use gridctl_core::types::ToolDescriptor;
use gridctl_registry::{RegistryError, RegistryServer};

use super::UpstreamBase;

#[derive(Debug)]
pub struct RegistryUpstream {
    base: UpstreamBase,
    server: RegistryServer,
}

impl RegistryUpstream {
    pub fn new(name: &str, server: RegistryServer) -> Self {
        Self {
            base: UpstreamBase::new(name, vec![]),
            server,
        }
    }

    pub fn base(&self) -> &UpstreamBase {
        &self.base
    }

    pub fn server(&self) -> &RegistryServer {
        &self.server
    }

    pub fn initialize(&self) -> Result<(), GatewayError> {
        self.base.store_tools(self.server.tools());
        self.base.set_initialized(true);
        Ok(())
    }

    pub fn refresh_tools(&self) -> std::sync::Arc<Vec<ToolDescriptor>> {
        self.base.store_tools(self.server.tools())
    }

    pub fn tools_call(&self, name: &str) -> Result<CallToolResult, GatewayError> {
        match self.server.call(name) {
            Ok(result) => Ok(result),
            Err(RegistryError::NotFound(name)) => {
                Err(GatewayError::NotFound(format!("unknown skill '{name}'")))
            }
            Err(error) => Err(GatewayError::Internal(error.to_string())),
        }
    }
}
