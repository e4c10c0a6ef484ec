//! Gateway error taxonomy
//!
//! Every failure leaving the gateway is an [`ApiError`]. Errors not marked
//! public are replaced by a generic `Internal` error at the wire boundary,
//! keeping only the correlation id, unless dev mode is on.

use crate::error::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Result of a gateway operation
pub type OperationResult<T> = std::result::Result<T, ApiError>;

/// Error category, mapped to an HTTP status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Validation,
    Forbidden,
    Timeout,
    RateLimit,
    NotFound,
    Conflict,
    Upstream,
    Unknown,
    Internal,
}

impl ErrorCode {
    /// HTTP status equivalent
    pub fn http_equivalent(self) -> u16 {
        match self {
            ErrorCode::Validation => 400,
            ErrorCode::Forbidden => 403,
            ErrorCode::NotFound => 404,
            ErrorCode::Timeout => 408,
            ErrorCode::Conflict => 409,
            ErrorCode::RateLimit => 429,
            ErrorCode::Upstream => 502,
            ErrorCode::Unknown | ErrorCode::Internal => 500,
        }
    }

    /// Whether retrying the same request may succeed
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            ErrorCode::Timeout | ErrorCode::RateLimit | ErrorCode::Upstream
        )
    }
}

/// Gateway error
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    /// Correlation id, also written to the log
    pub id: String,
    pub code: ErrorCode,
    pub message: String,
    pub http_equivalent: u16,
    /// Safe to show to callers as-is
    pub public: bool,
    pub retriable: bool,
    /// Structured details shown with public errors (schema violations, ...)
    pub details: Option<Value>,
    /// Private cause, only exposed in dev mode
    pub cause: Option<String>,
}

/// Wire form of an error
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicError {
    pub id: String,
    pub code: ErrorCode,
    pub message: String,
    pub http_equivalent: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl ApiError {
    /// Non-public error
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            id: format!("err_{}", Uuid::new_v4().simple()),
            code,
            message: message.into(),
            http_equivalent: code.http_equivalent(),
            public: false,
            retriable: code.is_retriable(),
            details: None,
            cause: None,
        }
    }

    /// Error whose message is safe to show
    pub fn public(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            public: true,
            ..Self::new(code, message)
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::public(ErrorCode::Validation, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::public(ErrorCode::Forbidden, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::public(ErrorCode::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::public(ErrorCode::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::public(ErrorCode::Timeout, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unknown, message)
    }

    /// Override the HTTP status (e.g. 413 for oversized bodies)
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_equivalent = status;
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_cause(mut self, cause: impl std::fmt::Display) -> Self {
        self.cause = Some(cause.to_string());
        self
    }

    /// HTTP status the error is reported with
    pub fn status(&self, dev_mode: bool) -> u16 {
        if self.public || dev_mode {
            self.http_equivalent
        } else {
            ErrorCode::Internal.http_equivalent()
        }
    }

    /// Sanitized wire form
    pub fn to_public(&self, dev_mode: bool) -> PublicError {
        if self.public || dev_mode {
            PublicError {
                id: self.id.clone(),
                code: self.code,
                message: self.message.clone(),
                http_equivalent: self.http_equivalent,
                details: self.details.clone(),
                cause: if dev_mode { self.cause.clone() } else { None },
            }
        } else {
            PublicError {
                id: self.id.clone(),
                code: ErrorCode::Internal,
                message: "Internal error".to_string(),
                http_equivalent: ErrorCode::Internal.http_equivalent(),
                details: None,
                cause: None,
            }
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => ApiError::validation(msg),
            Error::NotFound(msg) => ApiError::not_found(msg),
            Error::Conflict(msg) => ApiError::conflict(msg),
            Error::Forbidden(msg) => ApiError::forbidden(msg),
            Error::Timeout(msg) => ApiError::timeout(msg),
            Error::Upstream(msg) => {
                ApiError::public(ErrorCode::Upstream, "Agent process unavailable").with_cause(msg)
            }
            other @ (Error::Config(_)
            | Error::Channel(_)
            | Error::Rpc(_)
            | Error::Schema(_)
            | Error::Gateway(_)
            | Error::Io(_)
            | Error::Serialization(_)
            | Error::Internal(_)) => ApiError::internal(other.to_string()),
        }
    }
}
