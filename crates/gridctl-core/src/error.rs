use crate::protocol;

/// Gateway error taxonomy. Transport and protocol errors from one upstream
/// never affect siblings; policy errors carry a stable message so clients
/// can match on it.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("upstream '{server}': {message}")]
    Transport { server: String, message: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("access denied for tool {0}")]
    PolicyDenied(String),

    #[error("{0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn transport(server: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            server: server.into(),
            message: message.to_string(),
        }
    }

    /// JSON-RPC error code for this failure when surfaced to a downstream
    /// client.
    pub fn jsonrpc_code(&self) -> i64 {
        match self {
            Self::Protocol(_) => protocol::INVALID_REQUEST,
            Self::NotFound(_) | Self::Configuration(_) => protocol::INVALID_PARAMS,
            Self::PolicyDenied(_) | Self::Transport { .. } | Self::Internal(_) => {
                protocol::INTERNAL_ERROR
            }
        }
    }
}
