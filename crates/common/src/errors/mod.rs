//! Error types for Chatforge services
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for different failure modes
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    MissingField,
    InvalidTenant,
    PayloadTooLarge,
    UnsupportedFormat,

    // Authentication errors (2xxx)
    Unauthorized,
    InvalidToken,
    ExpiredToken,

    // Authorization errors (3xxx)
    Forbidden,
    TenantMismatch,

    // Resource errors (4xxx)
    NotFound,
    RoomNotFound,
    DocumentNotFound,
    AgentNotFound,

    // Conflict errors (5xxx)
    Conflict,
    ConfirmationRequired,

    // Rate limiting (6xxx)
    RateLimited,

    // Database errors (7xxx)
    DatabaseError,
    ConnectionError,

    // External service errors (8xxx)
    VectorStoreError,
    EmbeddingError,
    LlmError,
    ExternalAgentError,
    UpstreamError,
    Timeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,

    // Service unavailable
    ServiceUnavailable,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::MissingField => 1002,
            ErrorCode::InvalidTenant => 1003,
            ErrorCode::PayloadTooLarge => 1004,
            ErrorCode::UnsupportedFormat => 1005,

            // Auth (2xxx)
            ErrorCode::Unauthorized => 2001,
            ErrorCode::InvalidToken => 2002,
            ErrorCode::ExpiredToken => 2003,

            // Authz (3xxx)
            ErrorCode::Forbidden => 3001,
            ErrorCode::TenantMismatch => 3002,

            // Resources (4xxx)
            ErrorCode::NotFound => 4001,
            ErrorCode::RoomNotFound => 4002,
            ErrorCode::DocumentNotFound => 4003,
            ErrorCode::AgentNotFound => 4004,

            // Conflicts (5xxx)
            ErrorCode::Conflict => 5001,
            ErrorCode::ConfirmationRequired => 5002,

            // Rate limits (6xxx)
            ErrorCode::RateLimited => 6001,

            // Database (7xxx)
            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,

            // External (8xxx)
            ErrorCode::VectorStoreError => 8001,
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::LlmError => 8003,
            ErrorCode::ExternalAgentError => 8004,
            ErrorCode::UpstreamError => 8005,
            ErrorCode::Timeout => 8006,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,

            ErrorCode::ServiceUnavailable => 9999,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Required field missing: {field}")]
    MissingField { field: String },

    #[error("Invalid tenant id: {tenant}")]
    InvalidTenant { tenant: String },

    #[error("Payload too large: {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Unsupported format: {extension}")]
    UnsupportedFormat { extension: String },

    // Authentication errors
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    #[error("Invalid token")]
    InvalidToken,

    #[error("Token expired")]
    ExpiredToken,

    // Authorization errors
    #[error("Forbidden: {message}")]
    Forbidden { message: String },

    #[error("Tenant mismatch")]
    TenantMismatch,

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Room not found: {id}")]
    RoomNotFound { id: String },

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    // Conflict errors
    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Confirmation required: {message}")]
    ConfirmationRequired { message: String },

    // Rate limiting
    #[error("Rate limit exceeded: {limit} requests per second")]
    RateLimited { limit: u32 },

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    // External service errors
    #[error("Vector store error: {message}")]
    VectorStore { message: String },

    #[error("Embedding service error: {message}")]
    Embedding { message: String },

    #[error("LLM error: {message}")]
    Llm { message: String },

    #[error("External agent directory error: {message}")]
    ExternalAgent { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Operation '{operation}' timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    // Internal errors
    #[error("Internal server error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Convenience constructor for field-qualified validation errors
    pub fn validation(message: impl Into<String>, field: Option<&str>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: field.map(String::from),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::MissingField { .. } => ErrorCode::MissingField,
            AppError::InvalidTenant { .. } => ErrorCode::InvalidTenant,
            AppError::PayloadTooLarge { .. } => ErrorCode::PayloadTooLarge,
            AppError::UnsupportedFormat { .. } => ErrorCode::UnsupportedFormat,
            AppError::Unauthorized { .. } => ErrorCode::Unauthorized,
            AppError::InvalidToken => ErrorCode::InvalidToken,
            AppError::ExpiredToken => ErrorCode::ExpiredToken,
            AppError::Forbidden { .. } => ErrorCode::Forbidden,
            AppError::TenantMismatch => ErrorCode::TenantMismatch,
            AppError::NotFound { .. } => ErrorCode::NotFound,
            AppError::RoomNotFound { .. } => ErrorCode::RoomNotFound,
            AppError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            AppError::Conflict { .. } => ErrorCode::Conflict,
            AppError::ConfirmationRequired { .. } => ErrorCode::ConfirmationRequired,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::VectorStore { .. } => ErrorCode::VectorStoreError,
            AppError::Embedding { .. } => ErrorCode::EmbeddingError,
            AppError::Llm { .. } => ErrorCode::LlmError,
            AppError::ExternalAgent { .. } => ErrorCode::ExternalAgentError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation { .. }
            | AppError::MissingField { .. }
            | AppError::InvalidTenant { .. }
            | AppError::UnsupportedFormat { .. }
            | AppError::ConfirmationRequired { .. } => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::Unauthorized { .. } | AppError::InvalidToken | AppError::ExpiredToken => {
                StatusCode::UNAUTHORIZED
            }

            // 403 Forbidden
            AppError::Forbidden { .. } | AppError::TenantMismatch => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::NotFound { .. }
            | AppError::RoomNotFound { .. }
            | AppError::DocumentNotFound { .. } => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Conflict { .. } => StatusCode::CONFLICT,

            // 413 Payload Too Large
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 500 Internal Server Error
            AppError::Database(_)
            | AppError::DatabaseConnection { .. }
            | AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::HttpClient(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            AppError::VectorStore { .. }
            | AppError::Embedding { .. }
            | AppError::Llm { .. }
            | AppError::ExternalAgent { .. }
            | AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Whether this error is a transient upstream failure worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::VectorStore { .. }
                | AppError::Embedding { .. }
                | AppError::Llm { .. }
                | AppError::ExternalAgent { .. }
                | AppError::HttpClient(_)
                | AppError::DatabaseConnection { .. }
                | AppError::ServiceUnavailable { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for the API.
///
/// The chat widget expects a flat `{success:false, error, field?}` envelope;
/// `code` is carried alongside for machine handling.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let field = match &self {
            AppError::Validation { field, .. } => field.clone(),
            AppError::MissingField { field } => Some(field.clone()),
            AppError::InvalidTenant { .. } => Some("tenant_id".to_string()),
            _ => None,
        };

        let body = ErrorResponse {
            success: false,
            error: message,
            code,
            field,
        };

        (status, Json(body)).into_response()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for AppError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        AppError::Timeout {
            operation: "unspecified".to_string(),
            timeout_ms: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::RoomNotFound { id: "test".into() };
        assert_eq!(err.code(), ErrorCode::RoomNotFound);
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_validation_error() {
        let err = AppError::Validation {
            message: "Question too short".into(),
            field: Some("question".into()),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
    }

    #[test]
    fn test_timeout_maps_to_504() {
        let err = AppError::Timeout {
            operation: "query".into(),
            timeout_ms: 30_000,
        };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code(), ErrorCode::Timeout);
    }

    #[test]
    fn test_upstream_errors_are_transient() {
        let err = AppError::Embedding {
            message: "connection reset".into(),
        };
        assert!(err.is_transient());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);

        let err = AppError::InvalidTenant { tenant: "a/b".into() };
        assert!(!err.is_transient());
    }

    #[test]
    fn test_confirmation_required_is_400() {
        let err = AppError::ConfirmationRequired {
            message: "pass confirm=true to delete tenant data".into(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
