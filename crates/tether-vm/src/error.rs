use std::time::Duration;

use serde_json::Value;
use tether_rpc::{codes, RpcTransportError};
use thiserror::Error;

/// Application error code the VM uses when a reload is refused, for example
/// because the isolate is not in a reloadable state.
pub const RELOAD_BARRED: i64 = 1005;

pub type Result<T, E = VmServiceError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Error)]
pub enum VmServiceError {
    /// A payload broke an identity invariant or was missing required fields.
    #[error("failed to load service object: {0}")]
    Load(String),

    #[error("`{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("transport failure during `{method}`: {source}")]
    Transport {
        method: String,
        #[source]
        source: RpcTransportError,
    },

    /// A well-formed error response from the VM.
    #[error("`{method}` failed with code {code}: {message}")]
    Application {
        method: String,
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("could not establish a VM service connection to {uri}: {message}")]
    Handshake { uri: String, message: String },

    /// The connection owning this object has been dropped.
    #[error("the VM service connection is gone")]
    Detached,
}

impl VmServiceError {
    pub(crate) fn load(message: impl Into<String>) -> Self {
        VmServiceError::Load(message.into())
    }

    /// The application error code, if this is an application error.
    pub fn code(&self) -> Option<i64> {
        match self {
            VmServiceError::Application { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_reload_barred(&self) -> bool {
        self.code() == Some(RELOAD_BARRED)
    }

    pub fn is_method_not_found(&self) -> bool {
        self.code() == Some(codes::METHOD_NOT_FOUND)
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            VmServiceError::Transport {
                source: RpcTransportError::ConnectionClosed,
                ..
            } | VmServiceError::Detached
        )
    }
}
