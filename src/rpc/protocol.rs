//! RPC wire protocol

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Channel topic carrying RPC traffic
pub const RPC_TOPIC: &str = "rpc";

/// Messages exchanged on the `rpc` topic
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcMessage {
    /// Invoke a named procedure on the peer
    Request(RpcRequest),
    /// Result of a previous request
    Response(RpcResponse),
}

/// Procedure invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Correlation id, echoed by the response
    pub id: String,
    /// Procedure name
    pub name: String,
    /// Procedure input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl RpcRequest {
    /// Create a request with a fresh id
    pub fn new(name: impl Into<String>, input: Option<Value>) -> Self {
        Self {
            id: generate_request_id(),
            name: name.into(),
            input,
        }
    }
}

/// High-entropy correlation id (`rpc_<uuid>`)
pub fn generate_request_id() -> String {
    format!("rpc_{}", Uuid::new_v4().simple())
}

/// Response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcStatus {
    Success,
    Error,
}

/// Failure categories reported by the RPC layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    /// No procedure registered under the requested name
    NotFound,
    /// Input failed the procedure's input schema
    InvalidInput,
    /// Output failed the procedure's (or caller's) output schema
    InvalidOutput,
    /// Procedure failed, panicked, or the request could not be sent
    Unknown,
    /// No response within the call timeout
    Timeout,
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RpcErrorCode::NotFound => "NOT_FOUND",
            RpcErrorCode::InvalidInput => "INVALID_INPUT",
            RpcErrorCode::InvalidOutput => "INVALID_OUTPUT",
            RpcErrorCode::Unknown => "UNKNOWN",
            RpcErrorCode::Timeout => "TIMEOUT",
        };
        f.write_str(name)
    }
}

/// Error payload of a failed response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    /// Underlying cause (validation errors, panic message, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Value>,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            raw: None,
        }
    }

    pub fn with_raw(mut self, raw: Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

/// Procedure result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    /// Id of the originating request
    pub id: String,
    /// Procedure name
    pub name: String,
    pub status: RpcStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Create a success response
    pub fn success(id: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RpcStatus::Success,
            data: Some(data),
            error: None,
        }
    }

    /// Create an error response
    pub fn failure(id: impl Into<String>, name: impl Into<String>, error: RpcError) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: RpcStatus::Error,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == RpcStatus::Success
    }

    /// Error code of a failed response
    pub fn error_code(&self) -> Option<RpcErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }

    /// Convert into `Ok(data)` or `Err(error)`
    pub fn into_result(self) -> Result<Value, RpcError> {
        match self.status {
            RpcStatus::Success => Ok(self.data.unwrap_or(Value::Null)),
            RpcStatus::Error => Err(self
                .error
                .unwrap_or_else(|| RpcError::new(RpcErrorCode::Unknown, "error response without details"))),
        }
    }
}
