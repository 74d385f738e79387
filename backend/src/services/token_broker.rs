//! Installation token broker.
//!
//! Holds the single cached GitHub App installation token and refreshes it
//! lazily once it is within the safety margin of its expiry. Refreshes are
//! single-flight: the first caller to find the slot stale spawns the refresh
//! and publishes an in-flight marker (a `watch` receiver) under the slot lock;
//! every later caller subscribes to that marker instead of starting another
//! exchange and receives the same outcome.
//!
//! The refresh runs in its own task, so a caller that goes away does not
//! cancel an exchange other callers may be waiting on.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::BrokerError;
use crate::utils::clock::Clock;

/// Short-lived bearer credential for the App installation.
#[derive(Clone, PartialEq, Eq)]
pub struct InstallationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for InstallationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallationToken")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Performs one upstream exchange of the App identity for an installation token.
#[async_trait]
pub trait TokenExchanger: Send + Sync {
    async fn exchange(&self) -> Result<InstallationToken, BrokerError>;
}

/// Timing knobs for the broker.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// Tokens closer than this to expiry are refreshed.
    pub refresh_margin: chrono::Duration,
    /// Sleep before the single retry of a transient failure.
    pub retry_backoff: Duration,
    /// Upper bound on each exchange attempt.
    pub call_timeout: Duration,
}

type RefreshOutcome = Option<Result<InstallationToken, BrokerError>>;

#[derive(Default)]
struct TokenSlot {
    cached: Option<InstallationToken>,
    in_flight: Option<watch::Receiver<RefreshOutcome>>,
}

struct BrokerInner {
    exchanger: Arc<dyn TokenExchanger>,
    clock: Arc<dyn Clock>,
    settings: BrokerSettings,
    slot: Mutex<TokenSlot>,
}

pub struct InstallationTokenBroker {
    inner: Arc<BrokerInner>,
}

impl InstallationTokenBroker {
    pub fn new(
        exchanger: Arc<dyn TokenExchanger>,
        clock: Arc<dyn Clock>,
        settings: BrokerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                exchanger,
                clock,
                settings,
                slot: Mutex::new(TokenSlot::default()),
            }),
        }
    }

    /// Returns a token valid for at least the refresh margin, refreshing if needed.
    ///
    /// # Errors
    /// - `BrokerError::UpstreamRejected` if the exchange was refused
    /// - `BrokerError::Unavailable` on transport failure, after one retry
    pub async fn get_installation_token(&self) -> Result<InstallationToken, BrokerError> {
        let mut rx = {
            let mut slot = self.inner.slot.lock();

            if let Some(token) = slot.cached.as_ref() {
                if self.inner.is_fresh(token) {
                    return Ok(token.clone());
                }
            }

            match slot.in_flight.as_ref() {
                Some(rx) => {
                    debug!("joining in-flight installation token refresh");
                    rx.clone()
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    slot.in_flight = Some(rx.clone());
                    let inner = Arc::clone(&self.inner);
                    tokio::spawn(inner.refresh(tx));
                    rx
                }
            }
        };

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone(),
            Err(_) => None,
        };

        match outcome {
            Some(result) => result,
            None => {
                // Refresh task died without publishing; clear its marker
                let mut slot = self.inner.slot.lock();
                if slot
                    .in_flight
                    .as_ref()
                    .is_some_and(|current| current.same_channel(&rx))
                {
                    slot.in_flight = None;
                }
                Err(BrokerError::Unavailable(
                    "installation token refresh aborted".to_string(),
                ))
            }
        }
    }

    /// Expiry of the cached token, if any.
    pub fn cached_expiry(&self) -> Option<DateTime<Utc>> {
        self.inner
            .slot
            .lock()
            .cached
            .as_ref()
            .map(|token| token.expires_at)
    }

    /// Forgets the cached token. An in-flight refresh is left alone.
    pub fn invalidate(&self) {
        self.inner.slot.lock().cached = None;
    }
}

impl BrokerInner {
    fn is_fresh(&self, token: &InstallationToken) -> bool {
        self.clock.now() < token.expires_at - self.settings.refresh_margin
    }

    async fn refresh(self: Arc<Self>, tx: watch::Sender<RefreshOutcome>) {
        let outcome = self.exchange_with_retry().await.and_then(|token| {
            if self.is_fresh(&token) {
                Ok(token)
            } else {
                Err(BrokerError::UpstreamRejected(format!(
                    "installation token expires at {} which is inside the refresh margin",
                    token.expires_at
                )))
            }
        });

        match &outcome {
            Ok(token) => info!(expires_at = %token.expires_at, "installation token refreshed"),
            Err(err) => warn!(error = %err, "installation token refresh failed"),
        }

        {
            let mut slot = self.slot.lock();
            if let Ok(token) = &outcome {
                slot.cached = Some(token.clone());
            }
            slot.in_flight = None;
        }

        tx.send_replace(Some(outcome));
    }

    async fn exchange_with_retry(&self) -> Result<InstallationToken, BrokerError> {
        match self.exchange_once().await {
            Err(err) if err.is_transient() => {
                warn!(
                    error = %err,
                    backoff_ms = self.settings.retry_backoff.as_millis() as u64,
                    "installation token exchange failed, retrying once"
                );
                tokio::time::sleep(self.settings.retry_backoff).await;
                self.exchange_once().await
            }
            other => other,
        }
    }

    async fn exchange_once(&self) -> Result<InstallationToken, BrokerError> {
        tokio::time::timeout(self.settings.call_timeout, self.exchanger.exchange())
            .await
            .unwrap_or_else(|_| {
                Err(BrokerError::Unavailable(format!(
                    "token exchange timed out after {:?}",
                    self.settings.call_timeout
                )))
            })
    }
}
