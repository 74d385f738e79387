//! Global application error types.
//!
//! This module defines the error taxonomy shared by the credential verifier,
//! the installation token broker and the session registry. Conversion to HTTP
//! responses lives in `api::common`.

use thiserror::Error;

/// Failures of the installation token exchange.
///
/// `Clone` so that every waiter on a shared refresh receives the same outcome.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    /// The upstream refused the exchange (bad key, revoked installation, ...).
    #[error("Upstream rejected token exchange: {0}")]
    UpstreamRejected(String),
    /// Network or transport failure, timeout, or a server-side upstream error.
    #[error("Token exchange unavailable: {0}")]
    Unavailable(String),
}

impl BrokerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Generic service error that can be used across all components
///
/// `Clone` so a shared credential fetch can hand its failure to every waiter.
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Bad password, unknown user and inactive account all collapse into this.
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Credential source unavailable: {message}")]
    UpstreamUnavailable { message: String },

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Session is invalid or expired")]
    SessionInvalid,

    #[error("Internal error: {message}")]
    InternalError { message: String },
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::UpstreamUnavailable {
            message: message.into(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Whether a client may reasonably retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::UpstreamUnavailable { .. } => true,
            ServiceError::Broker(err) => err.is_transient(),
            _ => false,
        }
    }
}
