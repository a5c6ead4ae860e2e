//! Error Types for PANTRY API
//!
//! This module defines error handling for the API layer, including:
//! - ApiError struct for structured error responses
//! - ErrorCode enum for categorizing errors
//! - IntoResponse implementation for Axum HTTP responses
//! - the mapping from the library taxonomy (`PantryError`)
//!
//! All errors are serialized as JSON with appropriate HTTP status codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pantry_core::{PantryError, ValidationError};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ERROR CODE ENUM
// ============================================================================

/// Error codes for API responses.
///
/// Each error code maps to a specific HTTP status code and represents
/// a category of error that can occur during API operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // ========================================================================
    // Validation Errors (400)
    // ========================================================================
    /// Request validation failed
    ValidationFailed,

    /// Request contains invalid input data
    InvalidInput,

    /// Required field is missing from request
    MissingField,

    /// Field format is incorrect
    InvalidFormat,

    /// A stored command body could not be parsed
    SerializationFailed,

    // ========================================================================
    // Not Found Errors (404)
    // ========================================================================
    /// Requested entity does not exist
    EntityNotFound,

    /// Requested dead-letter record does not exist
    DeadLetterNotFound,

    // ========================================================================
    // Conflict Errors (409)
    // ========================================================================
    /// Command precondition never held
    ApplyConflict,

    // ========================================================================
    // Server Errors (500, 503, 504)
    // ========================================================================
    /// Internal server error
    InternalError,

    /// Entity store operation failed
    StoreError,

    /// Broker could not accept the command
    BrokerUnavailable,

    /// Read cache is unreachable
    CacheUnavailable,

    /// Remote query service is unreachable
    QueryUnavailable,

    /// Operation timed out
    Timeout,
}

impl ErrorCode {
    /// Get the HTTP status code for this error code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::ValidationFailed
            | ErrorCode::InvalidInput
            | ErrorCode::MissingField
            | ErrorCode::InvalidFormat
            | ErrorCode::SerializationFailed => StatusCode::BAD_REQUEST,

            ErrorCode::EntityNotFound | ErrorCode::DeadLetterNotFound => StatusCode::NOT_FOUND,

            ErrorCode::ApplyConflict => StatusCode::CONFLICT,

            ErrorCode::BrokerUnavailable
            | ErrorCode::CacheUnavailable
            | ErrorCode::QueryUnavailable => StatusCode::SERVICE_UNAVAILABLE,

            ErrorCode::Timeout => StatusCode::GATEWAY_TIMEOUT,

            ErrorCode::InternalError | ErrorCode::StoreError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get a default message for this error code.
    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::ValidationFailed => "Request validation failed",
            ErrorCode::InvalidInput => "Invalid input data",
            ErrorCode::MissingField => "Required field is missing",
            ErrorCode::InvalidFormat => "Invalid format",
            ErrorCode::SerializationFailed => "Command body could not be parsed",
            ErrorCode::EntityNotFound => "Entity not found",
            ErrorCode::DeadLetterNotFound => "Dead-letter record not found",
            ErrorCode::ApplyConflict => "Command could not be applied",
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::StoreError => "Entity store operation failed",
            ErrorCode::BrokerUnavailable => "Command broker unavailable",
            ErrorCode::CacheUnavailable => "Read cache unavailable",
            ErrorCode::QueryUnavailable => "Query service unavailable",
            ErrorCode::Timeout => "Operation timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// API ERROR STRUCT
// ============================================================================

/// Structured error response for API operations.
///
/// This type is returned by all API endpoints when an error occurs.
/// It provides a consistent error format across REST and gRPC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct ApiError {
    /// Error code categorizing the error
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (offending field, etc.)
    #[serde(skip_serializing_if = "Option::is_none")]
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    /// Create a new API error with the given code, using the default message.
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Add additional details to the error.
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        self.code.status_code()
    }

    // ========================================================================
    // Convenience constructors for common errors
    // ========================================================================

    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ValidationFailed, message)
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    pub fn missing_field(field: &str) -> Self {
        Self::new(
            ErrorCode::MissingField,
            format!("Required field '{}' is missing", field),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn invalid_format(field: &str, expected: &str) -> Self {
        Self::new(
            ErrorCode::InvalidFormat,
            format!("Field '{}' has invalid format, expected: {}", field, expected),
        )
        .with_details(serde_json::json!({ "field": field }))
    }

    pub fn entity_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::EntityNotFound, format!("Entity {} not found", id))
    }

    pub fn dead_letter_not_found(id: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::DeadLetterNotFound,
            format!("Dead-letter record {} not found", id),
        )
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn broker_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BrokerUnavailable, message)
    }

    pub fn timeout(operation: &str) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Operation '{}' timed out", operation),
        )
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ApiError {}

// ============================================================================
// AXUM INTEGRATION
// ============================================================================

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(self);
        (status, body).into_response()
    }
}

// ============================================================================
// CONVERSIONS FROM LIBRARY ERRORS
// ============================================================================

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        match &err {
            ValidationError::RequiredFieldMissing { field } => ApiError::missing_field(field),
            ValidationError::InvalidValue { field, .. } => {
                ApiError::validation_failed(err.to_string())
                    .with_details(serde_json::json!({ "field": field }))
            }
        }
    }
}

impl From<PantryError> for ApiError {
    fn from(err: PantryError) -> Self {
        match err {
            PantryError::Validation(e) => e.into(),
            PantryError::NotFound { id } => ApiError::entity_not_found(id),
            PantryError::Serialization { reason } => {
                ApiError::new(ErrorCode::SerializationFailed, reason)
            }
            PantryError::ApplyConflict(e) => ApiError::new(ErrorCode::ApplyConflict, e.to_string()),
            PantryError::Broker(e) => {
                tracing::error!(error = %e, "Broker error");
                ApiError::broker_unavailable(e.to_string())
            }
            PantryError::Store(e) => {
                // Log the full error, return a generic one to avoid leaking internals
                tracing::error!(error = %e, "Store error");
                ApiError::from_code(ErrorCode::StoreError)
            }
            PantryError::Cache(e) => {
                tracing::error!(error = %e, "Cache error");
                ApiError::from_code(ErrorCode::CacheUnavailable)
            }
            PantryError::Timeout { operation, elapsed_ms } => ApiError::timeout(&operation)
                .with_details(serde_json::json!({ "elapsed_ms": elapsed_ms })),
            PantryError::QueryUnavailable { reason } => {
                tracing::error!(reason = %reason, "Query service unavailable");
                ApiError::from_code(ErrorCode::QueryUnavailable)
            }
        }
    }
}

impl From<uuid::Error> for ApiError {
    fn from(err: uuid::Error) -> Self {
        ApiError::invalid_format("id", &format!("valid UUID: {}", err))
    }
}

// ============================================================================
// RESULT TYPE ALIAS
// ============================================================================

/// Result type alias for API operations.
pub type ApiResult<T> = Result<T, ApiError>;
