//! Middleware for protecting session-authenticated routes.

use std::sync::Arc;

use crate::api::common::{ApiError, service_error_to_http};
use crate::auth::service::AuthService;
use crate::errors::ServiceError;
use axum::{
    extract::Request,
    http::{HeaderMap, header::AUTHORIZATION},
    middleware::Next,
    response::Response,
};

/// Extracts the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Session authentication middleware
///
/// Validates the bearer session token and inserts the resolved
/// `SessionToken` into the request extensions.
pub async fn session_auth(mut request: Request, next: Next) -> Result<Response, ApiError> {
    let auth_service = request
        .extensions()
        .get::<Arc<AuthService>>()
        .cloned()
        .ok_or_else(|| {
            service_error_to_http(ServiceError::internal_error("auth service not configured"))
        })?;

    let token = bearer_token(request.headers())
        .ok_or_else(|| service_error_to_http(ServiceError::SessionInvalid))?;

    let session = auth_service
        .authenticate(token)
        .map_err(service_error_to_http)?;

    request.extensions_mut().insert(session);
    Ok(next.run(request).await)
}
