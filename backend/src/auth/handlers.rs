//! Handler functions for authentication-related API endpoints.
//!
//! These functions parse incoming requests and delegate to
//! `auth::service::AuthService` for the login, logout and session flows.

use std::sync::Arc;

use crate::api::common::{ApiError, service_error_to_http};
use crate::auth::middleware::bearer_token;
use crate::auth::models::*;
use crate::auth::service::AuthService;
use crate::services::session_registry::SessionToken;
use axum::{
    extract::{Extension, Json},
    http::HeaderMap,
    response::Json as ResponseJson,
};

/// Handle user login request
#[axum::debug_handler]
pub async fn login(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<LoginRequest>,
) -> Result<ResponseJson<LoginResponse>, ApiError> {
    match auth_service.login(payload).await {
        Ok(response) => Ok(ResponseJson(response)),
        Err(error) => Err(service_error_to_http(error)),
    }
}

/// Handle logout request. Always succeeds.
#[axum::debug_handler]
pub async fn logout(
    Extension(auth_service): Extension<Arc<AuthService>>,
    headers: HeaderMap,
) -> ResponseJson<LogoutResponse> {
    ResponseJson(auth_service.logout(bearer_token(&headers)))
}

/// Get the caller's session (requires `session_auth`)
#[axum::debug_handler]
pub async fn session(Extension(session): Extension<SessionToken>) -> ResponseJson<SessionInfo> {
    ResponseJson(SessionInfo::from(&session))
}
