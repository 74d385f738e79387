//! Credential verification against an externally owned credential list.
//!
//! The list is a CSV file with a header row, either served over HTTP or read
//! from local disk. It is treated as read-only and possibly stale: a fetched
//! copy is kept for a short TTL and then fetched again.

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, CredentialsLocation};
use crate::errors::{ServiceError, ServiceResult};

/// bcrypt ignores everything past this many bytes of input.
const BCRYPT_MAX_PASSWORD_BYTES: usize = 72;

const MIN_BCRYPT_COST: u32 = 4;
const MAX_BCRYPT_COST: u32 = 31;

/// Salt and digest of a valid bcrypt hash, reused for unknown-user checks.
const DECOY_HASH_BODY: &str = "R9h/cIPz0gi.URNNX3kh2OPST9/PgBkqquzi.Ss7KIUgO2t0jWMUW";
const DECOY_PLAINTEXT: &str = "session-gate-decoy-secret";

const USER_AGENT: &str = concat!("session-gate/", env!("CARGO_PKG_VERSION"));

/// One row of the credential list.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub username: String,
    /// bcrypt hash or plaintext password.
    pub secret: String,
    pub status: Option<String>,
}

impl std::fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .field("status", &self.status)
            .finish()
    }
}

impl CredentialRecord {
    /// A record without a status flag is active.
    pub fn is_active(&self) -> bool {
        match self.status.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(status) => ["active", "enabled", "true", "1", "yes"]
                .iter()
                .any(|flag| status.eq_ignore_ascii_case(flag)),
        }
    }
}

/// A user whose credentials matched an active record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedUser {
    pub username: String,
}

/// Capability to fetch the current credential list.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> ServiceResult<Vec<CredentialRecord>>;
}

/// Parses the credential CSV.
///
/// Accepts `username` or `email` for the user column, `password_hash` or
/// `password` for the secret, and an optional `status`/`active`/`role_status`
/// column. Rows missing a username or secret are skipped.
pub fn parse_credentials_csv(data: &[u8]) -> ServiceResult<Vec<CredentialRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(data);

    let headers = reader
        .headers()
        .map_err(|e| ServiceError::upstream_unavailable(format!("malformed credential data: {}", e)))?
        .clone();

    let column = |names: &[&str]| {
        headers
            .iter()
            .position(|header| names.iter().any(|name| header.eq_ignore_ascii_case(name)))
    };

    let username_idx = column(&["username", "email"]).ok_or_else(|| {
        ServiceError::upstream_unavailable("credential data has no username column")
    })?;
    let secret_idx = column(&["password_hash", "password"]).ok_or_else(|| {
        ServiceError::upstream_unavailable("credential data has no password column")
    })?;
    let status_idx = column(&["status", "active", "role_status"]);

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|e| {
            ServiceError::upstream_unavailable(format!("malformed credential data: {}", e))
        })?;

        let username = row.get(username_idx).unwrap_or_default();
        let secret = row.get(secret_idx).unwrap_or_default();
        if username.is_empty() || secret.is_empty() {
            continue;
        }

        records.push(CredentialRecord {
            username: username.to_string(),
            secret: secret.to_string(),
            status: status_idx
                .and_then(|idx| row.get(idx))
                .map(|value| value.to_string()),
        });
    }

    Ok(records)
}

/// Fetches the credential list over HTTP.
pub struct HttpCredentialSource {
    client: reqwest::Client,
    url: String,
    token: Option<String>,
}

impl HttpCredentialSource {
    pub fn new(url: String, token: Option<String>, timeout: Duration) -> ServiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ServiceError::internal_error(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { client, url, token })
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialSource {
    async fn fetch(&self) -> ServiceResult<Vec<CredentialRecord>> {
        let mut request = self.client.get(&self.url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        // GitHub contents API returns JSON metadata unless asked for the raw file
        if self.url.contains("/contents/") {
            request = request.header(reqwest::header::ACCEPT, "application/vnd.github.raw");
        }

        let response = request.send().await.map_err(|e| {
            ServiceError::upstream_unavailable(format!("failed to reach credential source: {}", e))
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::upstream_unavailable(format!(
                "credential source returned {}",
                status
            )));
        }

        let body = response.bytes().await.map_err(|e| {
            ServiceError::upstream_unavailable(format!("failed to read credential source: {}", e))
        })?;

        parse_credentials_csv(&body)
    }
}

/// Reads the credential list from a local CSV file.
pub struct FileCredentialSource {
    path: String,
}

impl FileCredentialSource {
    pub fn new(path: String) -> Self {
        Self { path }
    }
}

#[async_trait]
impl CredentialSource for FileCredentialSource {
    async fn fetch(&self) -> ServiceResult<Vec<CredentialRecord>> {
        let data = tokio::fs::read(&self.path).await.map_err(|e| {
            ServiceError::upstream_unavailable(format!(
                "failed to read credential file '{}': {}",
                self.path, e
            ))
        })?;
        parse_credentials_csv(&data)
    }
}

/// Builds the configured credential source.
pub fn credential_source_from_config(config: &Config) -> ServiceResult<Arc<dyn CredentialSource>> {
    match &config.credentials {
        CredentialsLocation::Http { url, token } => Ok(Arc::new(HttpCredentialSource::new(
            url.clone(),
            token.clone(),
            config.upstream_timeout(),
        )?)),
        CredentialsLocation::File { path } => Ok(Arc::new(FileCredentialSource::new(path.clone()))),
    }
}

/// The credential list keyed by username.
pub struct CredentialSet {
    records: HashMap<String, CredentialRecord>,
    /// Checked instead of a real secret when the username is unknown.
    decoy_secret: String,
}

impl CredentialSet {
    /// Later rows win on duplicate usernames.
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        let decoy_secret = records
            .iter()
            .filter_map(|record| bcrypt_cost(&record.secret))
            .max()
            .map(decoy_bcrypt_hash)
            .unwrap_or_else(|| DECOY_PLAINTEXT.to_string());

        let records = records
            .into_iter()
            .map(|record| (record.username.clone(), record))
            .collect();

        Self {
            records,
            decoy_secret,
        }
    }

    pub fn user_count(&self) -> usize {
        self.records.len()
    }

    /// The record for `username`, and the secret a password must be checked against.
    /// Unknown users get the decoy so both paths do the same work.
    fn lookup(&self, username: &str) -> (Option<&CredentialRecord>, &str) {
        match self.records.get(username) {
            Some(record) => (Some(record), record.secret.as_str()),
            None => (None, self.decoy_secret.as_str()),
        }
    }
}

struct CachedCredentials {
    credentials: Arc<CredentialSet>,
    fetched_at: Instant,
}

type FetchOutcome = Option<ServiceResult<Arc<CredentialSet>>>;

#[derive(Default)]
struct CacheSlot {
    cached: Option<CachedCredentials>,
    in_flight: Option<watch::Receiver<FetchOutcome>>,
}

struct VerifierInner {
    source: Arc<dyn CredentialSource>,
    ttl: Duration,
    fetch_timeout: Duration,
    slot: Mutex<CacheSlot>,
}

/// Checks username/password pairs against the credential source.
///
/// Fetches are single-flight and run in their own task bounded by
/// `fetch_timeout`, so a caller that goes away does not cancel a fetch
/// other callers are waiting on.
pub struct CredentialVerifier {
    inner: Arc<VerifierInner>,
}

impl CredentialVerifier {
    /// A zero `ttl` disables caching.
    pub fn new(source: Arc<dyn CredentialSource>, ttl: Duration, fetch_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(VerifierInner {
                source,
                ttl,
                fetch_timeout,
                slot: Mutex::new(CacheSlot::default()),
            }),
        }
    }

    /// Verifies a username/password pair.
    ///
    /// # Errors
    /// - `InvalidCredentials` for an unknown user, wrong password or inactive record
    /// - `UpstreamUnavailable` if the credential list cannot be fetched or parsed
    pub async fn verify(&self, username: &str, password: &str) -> ServiceResult<VerifiedUser> {
        if username.is_empty() || password.is_empty() {
            return Err(ServiceError::InvalidCredentials);
        }

        let credentials = self.credentials().await?;
        let (record, secret) = credentials.lookup(username);
        let matched = password_matches(secret, password).await;

        let Some(record) = record else {
            debug!(username = %username, "login for unknown user");
            return Err(ServiceError::InvalidCredentials);
        };

        if !matched {
            debug!(username = %username, "password mismatch");
            return Err(ServiceError::InvalidCredentials);
        }

        if !record.is_active() {
            debug!(username = %username, "login for inactive user");
            return Err(ServiceError::InvalidCredentials);
        }

        Ok(VerifiedUser {
            username: record.username.clone(),
        })
    }

    /// Drops the cached credential list. An in-flight fetch is left alone.
    pub fn invalidate(&self) {
        self.inner.slot.lock().cached = None;
    }

    /// Returns the cached list, fetching it when absent or older than the TTL.
    async fn credentials(&self) -> ServiceResult<Arc<CredentialSet>> {
        let mut rx = {
            let mut slot = self.inner.slot.lock();

            if let Some(cached) = slot.cached.as_ref() {
                if cached.fetched_at.elapsed() < self.inner.ttl {
                    return Ok(Arc::clone(&cached.credentials));
                }
            }

            match slot.in_flight.as_ref() {
                Some(rx) => rx.clone(),
                None => {
                    let (tx, rx) = watch::channel(None);
                    slot.in_flight = Some(rx.clone());
                    tokio::spawn(Arc::clone(&self.inner).refresh(tx));
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
                // Fetch task died without publishing; clear its marker
                let mut slot = self.inner.slot.lock();
                if slot
                    .in_flight
                    .as_ref()
                    .is_some_and(|current| current.same_channel(&rx))
                {
                    slot.in_flight = None;
                }
                Err(ServiceError::upstream_unavailable("credential fetch aborted"))
            }
        }
    }
}

impl VerifierInner {
    async fn refresh(self: Arc<Self>, tx: watch::Sender<FetchOutcome>) {
        let outcome = match tokio::time::timeout(self.fetch_timeout, self.source.fetch()).await {
            Ok(Ok(records)) => Ok(Arc::new(CredentialSet::new(records))),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ServiceError::upstream_unavailable(format!(
                "credential fetch timed out after {:?}",
                self.fetch_timeout
            ))),
        };

        match &outcome {
            Ok(credentials) => info!(records = credentials.user_count(), "credential list refreshed"),
            Err(err) => warn!(error = %err, "credential list fetch failed"),
        }

        {
            let mut slot = self.slot.lock();
            if let Ok(credentials) = &outcome {
                if !self.ttl.is_zero() {
                    slot.cached = Some(CachedCredentials {
                        credentials: Arc::clone(credentials),
                        fetched_at: Instant::now(),
                    });
                }
            }
            slot.in_flight = None;
        }

        tx.send_replace(Some(outcome));
    }
}

fn is_bcrypt_hash(secret: &str) -> bool {
    ["$2a$", "$2b$", "$2x$", "$2y$"]
        .iter()
        .any(|prefix| secret.starts_with(prefix))
}

/// Work factor of a `$2?$NN$...` hash.
fn bcrypt_cost(secret: &str) -> Option<u32> {
    if !is_bcrypt_hash(secret) || secret.as_bytes().get(6) != Some(&b'$') {
        return None;
    }
    secret
        .get(4..6)?
        .parse()
        .ok()
        .filter(|cost| (MIN_BCRYPT_COST..=MAX_BCRYPT_COST).contains(cost))
}

/// A well-formed hash no password is expected to match, at the given cost.
fn decoy_bcrypt_hash(cost: u32) -> String {
    format!("$2b${:02}${}", cost, DECOY_HASH_BODY)
}

async fn password_matches(secret: &str, password: &str) -> bool {
    if !is_bcrypt_hash(secret) {
        return plaintext_matches(secret, password);
    }

    let bytes = password.as_bytes();
    let truncated = bytes[..bytes.len().min(BCRYPT_MAX_PASSWORD_BYTES)].to_vec();
    let hash = secret.to_string();

    // Malformed hash counts as a mismatch
    tokio::task::spawn_blocking(move || bcrypt::verify(truncated, &hash).unwrap_or(false))
        .await
        .unwrap_or(false)
}

/// Compares digests so neither the content nor the length of the secret shows in timing.
fn plaintext_matches(secret: &str, password: &str) -> bool {
    let expected = Sha256::digest(secret.as_bytes());
    let given = Sha256::digest(password.as_bytes());
    expected.as_slice().ct_eq(given.as_slice()).into()
}
