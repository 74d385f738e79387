//! Error handling utilities for API responses.
//!
//! Provides the standard response envelope and the conversion from
//! service-layer errors to HTTP responses.
//!
//! # Response Format
//! All errors return consistent JSON responses containing:
//! - `message`: Human-readable message
//! - `error.error_type`: Machine-readable error category
//! - `error.retryable`: Whether the client may retry later
//!
//! # Error Handling Flow
//! 1. Services return a `ServiceError`
//! 2. `service_error_to_http` logs it once and picks the status code
//! 3. Credential failures always carry the same generic message

use crate::errors::{BrokerError, ServiceError};
use axum::{Json, http::StatusCode};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    /// Indicates if the request was successful
    pub success: bool,
    /// Response data (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    /// Human-readable message
    pub message: String,
    /// Error details (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
    /// Response timestamp
    pub timestamp: String,
}

/// Error details for failed requests
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Machine-readable error type identifier
    pub error_type: String,
    pub retryable: bool,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: message.into(),
            error: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: impl Into<String>, error_type: &str, retryable: bool) -> Self {
        Self {
            success: false,
            data: None,
            message: message.into(),
            error: Some(ErrorDetails {
                error_type: error_type.to_string(),
                retryable,
            }),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

pub type ApiError = (StatusCode, Json<ApiResponse<()>>);

/// Converts a service error into a status code and error envelope.
///
/// This is the single place request failures are logged.
pub fn service_error_to_http(error: ServiceError) -> ApiError {
    let retryable = error.is_retryable();
    let (status, error_type, message) = match &error {
        ServiceError::Validation { message } => {
            (StatusCode::BAD_REQUEST, "validation_error", message.clone())
        }
        ServiceError::InvalidCredentials => {
            tracing::info!("login rejected: invalid credentials");
            (
                StatusCode::UNAUTHORIZED,
                "invalid_credentials",
                "Invalid credentials".to_string(),
            )
        }
        ServiceError::SessionInvalid => (
            StatusCode::UNAUTHORIZED,
            "session_invalid",
            "Session is invalid or expired".to_string(),
        ),
        ServiceError::UpstreamUnavailable { message } => {
            tracing::warn!("Credential source unavailable: {}", message);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "upstream_unavailable",
                "Credential source temporarily unavailable".to_string(),
            )
        }
        ServiceError::Broker(BrokerError::Unavailable(message)) => {
            tracing::warn!("Installation token exchange unavailable: {}", message);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "broker_unavailable",
                "Upstream token service temporarily unavailable".to_string(),
            )
        }
        ServiceError::Broker(BrokerError::UpstreamRejected(message)) => {
            tracing::error!("Installation token exchange rejected: {}", message);
            (
                StatusCode::BAD_GATEWAY,
                "broker_rejected",
                "Upstream token service rejected the request".to_string(),
            )
        }
        ServiceError::InternalError { message } => {
            tracing::error!("Internal error: {}", message);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "Internal server error".to_string(),
            )
        }
    };

    (
        status,
        Json(ApiResponse::<()>::error(message, error_type, retryable)),
    )
}

/// Formats validator::ValidationErrors into a single message
pub fn validation_errors_to_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .into_iter()
        .flat_map(|(field, errors)| {
            errors.iter().map(move |error| {
                format!(
                    "{}: {}",
                    field,
                    error.message.as_ref().unwrap_or(&"Invalid value".into())
                )
            })
        })
        .collect();
    messages.sort();
    messages.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ServiceError::validation("username: required"), StatusCode::BAD_REQUEST),
            (ServiceError::InvalidCredentials, StatusCode::UNAUTHORIZED),
            (ServiceError::SessionInvalid, StatusCode::UNAUTHORIZED),
            (ServiceError::upstream_unavailable("down"), StatusCode::SERVICE_UNAVAILABLE),
            (
                ServiceError::from(BrokerError::Unavailable("timeout".into())),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                ServiceError::from(BrokerError::UpstreamRejected("401".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (ServiceError::internal_error("boom"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            let (status, _) = service_error_to_http(error);
            assert_eq!(status, expected);
        }
    }

    #[test]
    fn test_upstream_details_not_leaked() {
        let (_, Json(body)) =
            service_error_to_http(ServiceError::upstream_unavailable("10.0.0.7 refused"));
        assert!(!body.message.contains("10.0.0.7"));
        assert!(body.error.unwrap().retryable);
    }

    #[test]
    fn test_invalid_credentials_body() {
        let (_, Json(body)) = service_error_to_http(ServiceError::InvalidCredentials);
        assert!(!body.success);
        assert_eq!(body.message, "Invalid credentials");
        let details = body.error.unwrap();
        assert_eq!(details.error_type, "invalid_credentials");
        assert!(!details.retryable);
    }
}
