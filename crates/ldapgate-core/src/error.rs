//! Error types for directory gateway operations.
//!
//! Every expected failure is modelled as a typed value with a stable kind
//! discriminator. The HTTP boundary is the only place where errors are
//! rendered; internal detail stays in the logs.

use serde::Serialize;
use thiserror::Error;

/// Main error type for gateway operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Request validation failed, a placeholder could not be substituted, or
    /// an unknown view was requested
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The LDAP server rejected the bind
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// A write was attempted against a read-only cluster
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Unknown cluster, or a distinguished name that does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate DN or exhausted uid allocation retries
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The server rejected the change as a schema violation
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// Deadline expired while talking to the directory
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The selected node (or every candidate node) is unreachable
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Invalid configuration; fails the process at startup
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Credential vault I/O failure after the local retry
    #[error("Storage error: {0}")]
    Storage(String),

    /// Uncategorized internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Specialized result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns the stable error code for this error kind.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Conflict(_) => "CONFLICT",
            Self::Unprocessable(_) => "UNPROCESSABLE",
            Self::Timeout(_) => "TIMEOUT",
            Self::ServiceUnavailable(_) => "SERVICE_UNAVAILABLE",
            Self::ConfigError(_) => "CONFIG_ERROR",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Returns the HTTP status code the boundary layer should render.
    #[must_use]
    pub const fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest(_) => 400,
            Self::AuthFailed(_) => 401,
            Self::Forbidden(_) => 403,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Unprocessable(_) => 422,
            Self::ServiceUnavailable(_) => 503,
            Self::Timeout(_) => 504,
            Self::ConfigError(_) | Self::Storage(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns true if this error should be logged as a serious error.
    #[must_use]
    pub const fn should_log(&self) -> bool {
        matches!(
            self,
            Self::Internal(_) | Self::ConfigError(_) | Self::Storage(_)
        )
    }

    /// Converts the error into an [`ErrorResponse`].
    #[must_use]
    pub fn into_error_response(self) -> ErrorResponse {
        self.into_error_response_with_id(None)
    }

    /// Converts the error into an [`ErrorResponse`] carrying a request ID.
    #[must_use]
    pub fn into_error_response_with_id(self, request_id: Option<String>) -> ErrorResponse {
        ErrorResponse {
            error: ErrorDetail {
                code: self.error_code().to_string(),
                message: self.to_string(),
            },
            request_id,
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Self::ConfigError(err.to_string())
    }
}

/// Structured error body for the HTTP boundary.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
    /// Optional request ID for tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error detail structure.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Stable code for programmatic handling
    pub code: String,
    /// Human-readable message; never includes server-internal detail
    pub message: String,
}
