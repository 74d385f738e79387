//! Defines the HTTP routes specifically for authentication.
//!
//! These routes handle login, logout and session inspection and are designed
//! to be nested into the main Axum router.

use crate::auth::handlers::*;
use crate::auth::middleware::*;
use axum::{
    Router, middleware,
    routing::{get, post},
};

/// Creates the authentication router with all auth-related routes
pub fn auth_router() -> Router {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
        .route(
            "/session",
            get(session).layer(middleware::from_fn(session_auth)),
        )
}
