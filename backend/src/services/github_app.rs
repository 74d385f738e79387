//! GitHub App installation token exchange.
//!
//! Signs an App JWT and trades it for an installation access token via
//! `POST /app/installations/{id}/access_tokens`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;
use crate::errors::{BrokerError, ServiceError, ServiceResult};
use crate::services::token_broker::{InstallationToken, TokenExchanger};
use crate::utils::clock::Clock;
use crate::utils::jwt::AppJwtSigner;

const USER_AGENT: &str = concat!("session-gate/", env!("CARGO_PKG_VERSION"));
const GITHUB_API_VERSION: &str = "2022-11-28";

/// Installation token response from GitHub
#[derive(Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Maps a non-success status from the access token endpoint to a broker error.
pub fn classify_status(status: u16, body: &str) -> BrokerError {
    let message = format!("GitHub API error ({}): {}", status, body.trim());
    match status {
        408 | 429 | 500..=599 => BrokerError::Unavailable(message),
        _ => BrokerError::UpstreamRejected(message),
    }
}

pub struct GitHubAppExchanger {
    client: reqwest::Client,
    api_url: String,
    installation_id: u64,
    signer: AppJwtSigner,
    clock: Arc<dyn Clock>,
}

impl GitHubAppExchanger {
    pub fn new(
        api_url: impl Into<String>,
        installation_id: u64,
        signer: AppJwtSigner,
        clock: Arc<dyn Clock>,
        timeout: std::time::Duration,
    ) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ServiceError::internal_error(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            installation_id,
            signer,
            clock,
        })
    }

    pub fn from_config(config: &Config, clock: Arc<dyn Clock>) -> ServiceResult<Self> {
        let signer = AppJwtSigner::from_pem(config.github_app_id.clone(), &config.github_private_key)?;
        Self::new(
            config.github_api_url.clone(),
            config.github_installation_id,
            signer,
            clock,
            config.upstream_timeout(),
        )
    }

    fn access_tokens_url(&self) -> String {
        format!(
            "{}/app/installations/{}/access_tokens",
            self.api_url, self.installation_id
        )
    }
}

#[async_trait]
impl TokenExchanger for GitHubAppExchanger {
    async fn exchange(&self) -> Result<InstallationToken, BrokerError> {
        let app_jwt = self
            .signer
            .sign(self.clock.now().timestamp())
            .map_err(|e| BrokerError::UpstreamRejected(format!("failed to sign App JWT: {}", e)))?;

        debug!(
            app_id = %self.signer.app_id(),
            installation_id = self.installation_id,
            "requesting installation token"
        );

        let response = self
            .client
            .post(self.access_tokens_url())
            .bearer_auth(app_jwt)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header("X-GitHub-Api-Version", GITHUB_API_VERSION)
            .json(&serde_json::json!({}))
            .send()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to call GitHub API: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(classify_status(status.as_u16(), &body));
        }

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .map_err(|e| BrokerError::Unavailable(format!("failed to parse response: {}", e)))?;

        Ok(InstallationToken {
            token: token_response.token,
            expires_at: token_response.expires_at,
        })
    }
}
