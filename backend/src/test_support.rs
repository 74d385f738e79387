//! In-memory fakes for the credential source, token exchanger and clock.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::errors::{BrokerError, ServiceError, ServiceResult};
use crate::services::credential_verifier::{CredentialRecord, CredentialSource};
use crate::services::token_broker::{InstallationToken, TokenExchanger};
use crate::utils::clock::Clock;

/// Clock that only moves when told to.
pub struct ManualClock(Mutex<DateTime<Utc>>);

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2024, 2, 2, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.0.lock() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

/// Credential source serving a mutable in-memory list.
pub struct FakeCredentialSource {
    records: Mutex<Result<Vec<CredentialRecord>, String>>,
    delay: Duration,
    fetches: AtomicUsize,
    completed: AtomicUsize,
}

impl FakeCredentialSource {
    pub fn new(records: Vec<CredentialRecord>) -> Self {
        Self {
            records: Mutex::new(Ok(records)),
            delay: Duration::ZERO,
            fetches: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_records(&self, records: Vec<CredentialRecord>) {
        *self.records.lock() = Ok(records);
    }

    pub fn set_failing(&self, message: &str) {
        *self.records.lock() = Err(message.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Fetches that ran to the end rather than being dropped mid-way.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for FakeCredentialSource {
    async fn fetch(&self) -> ServiceResult<Vec<CredentialRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let records = self
            .records
            .lock()
            .clone()
            .map_err(ServiceError::upstream_unavailable);
        self.completed.fetch_add(1, Ordering::SeqCst);
        records
    }
}

/// Exchanger that issues `ghs_<n>` tokens expiring `lifetime` after the clock's now.
///
/// Scripted outcomes are consumed first, one per call.
pub struct FakeExchanger {
    clock: Arc<dyn Clock>,
    lifetime: chrono::Duration,
    delay: Duration,
    script: Mutex<VecDeque<Result<InstallationToken, BrokerError>>>,
    calls: AtomicUsize,
}

impl FakeExchanger {
    pub fn new(clock: Arc<dyn Clock>, lifetime: chrono::Duration) -> Self {
        Self {
            clock,
            lifetime,
            delay: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_script(self, script: Vec<Result<InstallationToken, BrokerError>>) -> Self {
        *self.script.lock() = script.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenExchanger for FakeExchanger {
    async fn exchange(&self) -> Result<InstallationToken, BrokerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(scripted) = self.script.lock().pop_front() {
            return scripted;
        }
        Ok(InstallationToken {
            token: format!("ghs_{}", n),
            expires_at: self.clock.now() + self.lifetime,
        })
    }
}
