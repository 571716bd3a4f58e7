//! HTTP error type for the API.
//!
//! Every error renders as `{"success": false, "code", "message", "details"?}`
//! with a matching status code.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::error::{ProtocolError, TransportError};

/// API error type that converts to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Device id never seen (404)
    #[error("Unknown device: {device_id}")]
    DeviceUnknown { device_id: String },

    /// Device disconnected and its grace window elapsed (410)
    #[error("Device {device_id} expired at {expired_at}")]
    DeviceExpired {
        device_id: String,
        expired_at: DateTime<Utc>,
    },

    /// Device has no open session (409)
    #[error("Device {device_id} is not connected")]
    DeviceNotConnected { device_id: String },

    /// Invalid request data (400)
    #[error("Bad request: {message}")]
    BadRequest { message: String },

    /// Validation error (422)
    #[error("Validation failed: {message}")]
    ValidationError {
        message: String,
        field: Option<String>,
    },

    /// Internal server error (500)
    #[error("Internal error: {message}")]
    Internal { message: String },

    /// Service unavailable (503)
    #[error("Service unavailable: {message}")]
    ServiceUnavailable { message: String },
}

impl ApiError {
    pub fn device_unknown(device_id: impl Into<String>) -> Self {
        Self::DeviceUnknown {
            device_id: device_id.into(),
        }
    }

    pub fn device_not_connected(device_id: impl Into<String>) -> Self {
        Self::DeviceNotConnected {
            device_id: device_id.into(),
        }
    }

    /// Create a bad request error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            message: message.into(),
        }
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>, field: Option<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field,
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DeviceUnknown { .. } => StatusCode::NOT_FOUND,
            Self::DeviceExpired { .. } => StatusCode::GONE,
            Self::DeviceNotConnected { .. } => StatusCode::CONFLICT,
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::ValidationError { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::DeviceUnknown { .. } => "DEVICE_UNKNOWN",
            Self::DeviceExpired { .. } => "DEVICE_EXPIRED",
            Self::DeviceNotConnected { .. } => "DEVICE_NOT_CONNECTED",
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
            Self::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
        }
    }
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        let field = match &e {
            ProtocolError::InvalidField { field, .. }
            | ProtocolError::MissingField(field)
            | ProtocolError::NonNumericField(field) => Some((*field).to_string()),
            _ => None,
        };
        Self::validation(e.to_string(), field)
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        Self::ServiceUnavailable {
            message: e.to_string(),
        }
    }
}

/// JSON error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Always `false`
    pub success: bool,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Additional error details.
#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code().to_string();
        let message = self.to_string();

        let details = match &self {
            ApiError::DeviceUnknown { device_id } | ApiError::DeviceNotConnected { device_id } => {
                Some(ErrorDetails {
                    device_id: Some(device_id.clone()),
                    field: None,
                    expired_at: None,
                })
            }
            ApiError::DeviceExpired {
                device_id,
                expired_at,
            } => Some(ErrorDetails {
                device_id: Some(device_id.clone()),
                field: None,
                expired_at: Some(*expired_at),
            }),
            ApiError::ValidationError { field, .. } => Some(ErrorDetails {
                device_id: None,
                field: field.clone(),
                expired_at: None,
            }),
            _ => None,
        };

        match &self {
            ApiError::Internal { .. } => tracing::error!(error = %self, "API error"),
            ApiError::DeviceUnknown { .. } | ApiError::DeviceExpired { .. } => {
                tracing::debug!(error = %self, "API error")
            }
            _ => tracing::warn!(error = %self, "API error"),
        }

        let body = ErrorResponse {
            success: false,
            code,
            message,
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
