//! Main entry point for the session gate service.
//!
//! This file initializes tracing and configuration, wires the credential
//! verifier, installation token broker and session registry together, and
//! serves the Axum router until shutdown.

mod api;
mod auth;
mod config;
mod errors;
mod services;
#[cfg(test)]
mod test_support;
mod utils;

use crate::api::common::ApiResponse;
use crate::auth::service::AuthService;
use crate::services::credential_verifier::{CredentialVerifier, credential_source_from_config};
use crate::services::github_app::GitHubAppExchanger;
use crate::services::session_registry::SessionRegistry;
use crate::services::token_broker::{BrokerSettings, InstallationTokenBroker};
use crate::utils::clock::{Clock, SystemClock};
use anyhow::Context;
use axum::{
    Extension, Router,
    response::Json,
    routing::{get, post},
};
use config::Config;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    debug!(?config, "configuration loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let source = credential_source_from_config(&config)
        .context("failed to set up credential source")?;
    let verifier = Arc::new(CredentialVerifier::new(
        source,
        config.credentials_cache_ttl(),
        config.upstream_timeout(),
    ));

    let exchanger = GitHubAppExchanger::from_config(&config, clock.clone())
        .context("failed to set up GitHub App exchanger")?;
    let broker = Arc::new(InstallationTokenBroker::new(
        Arc::new(exchanger),
        clock.clone(),
        BrokerSettings {
            refresh_margin: config.refresh_margin(),
            retry_backoff: config.broker_retry_backoff(),
            call_timeout: config.upstream_timeout(),
        },
    ));

    let registry = Arc::new(SessionRegistry::new(config.session_lifetime(), clock));
    spawn_session_sweeper(
        registry.clone(),
        Duration::from_secs(config.session_sweep_interval_seconds),
    );

    let auth_service = Arc::new(AuthService::new(verifier.clone(), broker, registry));
    let app = app_router(auth_service);

    let bind_address = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {}", bind_address))?;

    info!("Starting session gate on port {}", config.server_port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    verifier.invalidate();
    info!("Session gate stopped");
    Ok(())
}

/// Builds the application router around a shared auth service.
pub fn app_router(auth_service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/login", post(auth::handlers::login))
        .route("/logout", post(auth::handlers::logout))
        .nest("/auth", auth::routes::auth_router())
        .layer(Extension(auth_service))
}

async fn root_handler(
    Extension(auth_service): Extension<Arc<AuthService>>,
) -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::success(
        serde_json::json!({
            "service": "Session Gate",
            "version": env!("CARGO_PKG_VERSION"),
            "active_sessions": auth_service.registry().active_sessions(),
            "installation_token_expires_at": auth_service.broker().cached_expiry(),
        }),
        "Welcome to Session Gate",
    ))
}

/// Periodically evicts expired sessions.
fn spawn_session_sweeper(registry: Arc<SessionRegistry>, every: Duration) {
    if every.is_zero() {
        return;
    }
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let purged = registry.purge_expired();
            if purged > 0 {
                debug!(purged, "evicted expired sessions");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
