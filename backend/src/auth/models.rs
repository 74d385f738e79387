//! Data structures for authentication requests and responses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::services::session_registry::SessionToken;

/// Login request payload
#[derive(Deserialize, Validate)]
pub struct LoginRequest {
    #[serde(default, alias = "email")]
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,

    #[serde(default)]
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

impl std::fmt::Debug for LoginRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginRequest")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Login response containing the session token
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub status: String,
    pub session_token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64, // Session lifetime in seconds
}

/// Logout response
#[derive(Debug, Serialize, Deserialize)]
pub struct LogoutResponse {
    pub message: String,
}

/// Details of the caller's current session
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionInfo {
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_expires_at: Option<DateTime<Utc>>,
}

impl From<&SessionToken> for SessionInfo {
    fn from(session: &SessionToken) -> Self {
        Self {
            username: session.username.clone(),
            issued_at: session.issued_at,
            expires_at: session.expires_at,
            upstream_expires_at: session.upstream_expires_at,
        }
    }
}
