use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Well-known JSON-RPC 2.0 error codes.
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const SERVER_ERROR: i64 = -32000;
}

/// Failure of the underlying channel, as opposed to an error reported by the remote side.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RpcTransportError {
    #[error("i/o error: {message}")]
    Io { message: String },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("protocol error: {message}")]
    Protocol { message: String },
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message} (code {code})")]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(codes::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(codes::INVALID_PARAMS, message)
    }

    pub fn server_error(message: impl Into<String>) -> Self {
        Self::new(codes::SERVER_ERROR, message)
    }
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] RpcTransportError),
    #[error("remote error: {0}")]
    Remote(RpcErrorObject),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
}

impl RpcError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(RpcTransportError::ConnectionClosed)
        )
    }
}
