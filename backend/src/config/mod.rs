//! Central module for application-wide configuration settings.
//!
//! This module handles loading the credential source location, the GitHub App
//! identity, session lifetime and the upstream timing knobs from the environment.

use anyhow::{Context, Result, bail};
use std::env;
use std::fmt;
use std::time::Duration;

/// Where the credential list is fetched from.
#[derive(Clone, PartialEq, Eq)]
pub enum CredentialsLocation {
    /// Remote tabular file served over HTTP, with an optional bearer token.
    Http { url: String, token: Option<String> },
    /// Local CSV file.
    File { path: String },
}

impl fmt::Debug for CredentialsLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialsLocation::Http { url, token } => f
                .debug_struct("Http")
                .field("url", url)
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
            CredentialsLocation::File { path } => f.debug_struct("File").field("path", path).finish(),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub server_port: u16,
    pub credentials: CredentialsLocation,
    pub credentials_cache_ttl_seconds: u64,
    pub github_app_id: String,
    pub github_private_key: String,
    pub github_installation_id: u64,
    pub github_api_url: String,
    session_lifetime: chrono::Duration,
    pub session_sweep_interval_seconds: u64,
    token_refresh_margin: chrono::Duration,
    pub broker_retry_backoff_ms: u64,
    pub upstream_timeout_seconds: u64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_port", &self.server_port)
            .field("credentials", &self.credentials)
            .field("credentials_cache_ttl_seconds", &self.credentials_cache_ttl_seconds)
            .field("github_app_id", &self.github_app_id)
            .field("github_private_key", &"<redacted>")
            .field("github_installation_id", &self.github_installation_id)
            .field("github_api_url", &self.github_api_url)
            .field("session_lifetime", &self.session_lifetime)
            .field("session_sweep_interval_seconds", &self.session_sweep_interval_seconds)
            .field("token_refresh_margin", &self.token_refresh_margin)
            .field("broker_retry_backoff_ms", &self.broker_retry_backoff_ms)
            .field("upstream_timeout_seconds", &self.upstream_timeout_seconds)
            .finish()
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |names: &[&str]| names.iter().find_map(|name| lookup(*name)).filter(|v| !v.is_empty());

        let server_port = parse_or(var(&["SERVER_PORT"]), 3000u16)
            .context("SERVER_PORT must be a valid number")?;

        let credentials = if let Some(url) = var(&["CREDENTIALS_URL"]) {
            CredentialsLocation::Http {
                url,
                token: var(&["CREDENTIALS_TOKEN"]),
            }
        } else if let Some(path) = var(&["CREDENTIALS_FILE", "MANAGEMENT_CREDENTIALS_FILE"]) {
            CredentialsLocation::File { path }
        } else {
            bail!("either CREDENTIALS_URL or CREDENTIALS_FILE must be set");
        };

        let credentials_cache_ttl_seconds = parse_or(var(&["CREDENTIALS_CACHE_TTL_SECONDS"]), 60u64)
            .context("CREDENTIALS_CACHE_TTL_SECONDS must be a valid number")?;

        let github_app_id = var(&["GITHUB_APP_ID"]).context("GITHUB_APP_ID not set")?;

        let github_private_key = match (
            var(&["GITHUB_PRIVATE_KEY"]),
            var(&["GITHUB_PRIVATE_KEY_PATH"]),
        ) {
            (Some(pem), _) => pem.replace("\\n", "\n"),
            (None, Some(path)) => {
                let expanded = expanduser::expanduser(&path)
                    .with_context(|| format!("failed to expand GITHUB_PRIVATE_KEY_PATH '{}'", path))?;
                std::fs::read_to_string(&expanded).with_context(|| {
                    format!("failed to read private key from '{}'", expanded.display())
                })?
            }
            (None, None) => bail!("GITHUB_PRIVATE_KEY or GITHUB_PRIVATE_KEY_PATH must be set"),
        };

        let github_installation_id = var(&["GITHUB_INSTALLATION_ID", "INSTALLATION_ID"])
            .context("GITHUB_INSTALLATION_ID not set")?
            .parse::<u64>()
            .context("GITHUB_INSTALLATION_ID must be a valid number")?;

        let github_api_url = var(&["GITHUB_API_URL"])
            .unwrap_or_else(|| "https://api.github.com".to_string())
            .trim_end_matches('/')
            .to_string();

        let session_lifetime_seconds =
            parse_or(var(&["SESSION_LIFETIME_SECONDS", "TOKEN_EXPIRY"]), 900u64)
                .context("SESSION_LIFETIME_SECONDS must be a valid number")?;

        let session_sweep_interval_seconds =
            parse_or(var(&["SESSION_SWEEP_INTERVAL_SECONDS"]), 60u64)
                .context("SESSION_SWEEP_INTERVAL_SECONDS must be a valid number")?;

        let token_refresh_margin_seconds =
            parse_or(var(&["TOKEN_REFRESH_MARGIN_SECONDS"]), 300u64)
                .context("TOKEN_REFRESH_MARGIN_SECONDS must be a valid number")?;

        let broker_retry_backoff_ms = parse_or(var(&["BROKER_RETRY_BACKOFF_MS"]), 500u64)
            .context("BROKER_RETRY_BACKOFF_MS must be a valid number")?;

        let upstream_timeout_seconds = parse_or(var(&["UPSTREAM_TIMEOUT_SECONDS"]), 10u64)
            .context("UPSTREAM_TIMEOUT_SECONDS must be a valid number")?;

        if session_lifetime_seconds == 0 {
            bail!("SESSION_LIFETIME_SECONDS must be greater than zero");
        }
        let session_lifetime =
            seconds_to_delta("SESSION_LIFETIME_SECONDS", session_lifetime_seconds)?;
        let token_refresh_margin =
            seconds_to_delta("TOKEN_REFRESH_MARGIN_SECONDS", token_refresh_margin_seconds)?;
        if upstream_timeout_seconds == 0 {
            bail!("UPSTREAM_TIMEOUT_SECONDS must be greater than zero");
        }

        Ok(Config {
            server_port,
            credentials,
            credentials_cache_ttl_seconds,
            github_app_id,
            github_private_key,
            github_installation_id,
            github_api_url,
            session_lifetime,
            session_sweep_interval_seconds,
            token_refresh_margin,
            broker_retry_backoff_ms,
            upstream_timeout_seconds,
        })
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn credentials_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.credentials_cache_ttl_seconds)
    }

    pub fn refresh_margin(&self) -> chrono::Duration {
        self.token_refresh_margin
    }

    pub fn session_lifetime(&self) -> chrono::Duration {
        self.session_lifetime
    }

    pub fn broker_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.broker_retry_backoff_ms)
    }
}

/// Upper bound for configured lifetimes and margins, so timestamp arithmetic cannot overflow.
const MAX_CONFIGURED_SECONDS: u64 = 10 * 365 * 24 * 60 * 60;

fn seconds_to_delta(name: &str, seconds: u64) -> Result<chrono::Duration> {
    if seconds > MAX_CONFIGURED_SECONDS {
        bail!("{} must be at most {} seconds, got {}", name, MAX_CONFIGURED_SECONDS, seconds);
    }
    i64::try_from(seconds)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .with_context(|| format!("{} is out of range: {}", name, seconds))
}

fn parse_or<T>(value: Option<String>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => Ok(raw.trim().parse::<T>()?),
        None => Ok(default),
    }
}
