//! In-memory registry of session tokens, at most one live session per user.
//!
//! Both indexes (username to session, token to username) sit behind a single
//! lock, so an `issue` that replaces a user's session is observed by
//! validators as one step: the old token stops validating at the same moment
//! the new one starts.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::errors::{ServiceError, ServiceResult};
use crate::utils::clock::Clock;
use crate::utils::generate_random_string::{SESSION_TOKEN_BYTES, generate_random_token};

/// Session token issued to a verified user.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken {
    pub token: String,
    pub username: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Expiry of the installation token that backed the login.
    pub upstream_expires_at: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("token", &"<redacted>")
            .field("username", &self.username)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("upstream_expires_at", &self.upstream_expires_at)
            .finish()
    }
}

#[derive(Default)]
struct Sessions {
    by_user: HashMap<String, SessionToken>,
    by_token: HashMap<String, String>,
}

impl Sessions {
    fn remove_user(&mut self, username: &str) -> Option<SessionToken> {
        let session = self.by_user.remove(username)?;
        self.by_token.remove(&session.token);
        Some(session)
    }
}

pub struct SessionRegistry {
    lifetime: chrono::Duration,
    clock: Arc<dyn Clock>,
    sessions: Mutex<Sessions>,
}

impl SessionRegistry {
    pub fn new(lifetime: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            lifetime,
            clock,
            sessions: Mutex::new(Sessions::default()),
        }
    }

    pub fn lifetime(&self) -> chrono::Duration {
        self.lifetime
    }

    /// Issues a fresh session for `username`, revoking any previous one.
    pub fn issue(&self, username: &str) -> SessionToken {
        self.issue_linked(username, None)
    }

    /// Like [`issue`](Self::issue), also recording the backing installation token expiry.
    pub fn issue_linked(
        &self,
        username: &str,
        upstream_expires_at: Option<DateTime<Utc>>,
    ) -> SessionToken {
        let issued_at = self.clock.now();
        let session = SessionToken {
            token: generate_random_token(SESSION_TOKEN_BYTES),
            username: username.to_string(),
            issued_at,
            expires_at: issued_at + self.lifetime,
            upstream_expires_at,
        };

        let mut sessions = self.sessions.lock();
        if sessions.remove_user(username).is_some() {
            debug!(username = %username, "replaced existing session");
        }
        sessions
            .by_token
            .insert(session.token.clone(), username.to_string());
        sessions
            .by_user
            .insert(username.to_string(), session.clone());

        session
    }

    /// Removes the session of `username`. Returns whether one existed.
    pub fn revoke(&self, username: &str) -> bool {
        self.sessions.lock().remove_user(username).is_some()
    }

    /// Removes the session owning `token`, returning its username.
    pub fn revoke_token(&self, token: &str) -> Option<String> {
        let mut sessions = self.sessions.lock();
        let username = sessions.by_token.get(token)?.clone();
        sessions.remove_user(&username);
        Some(username)
    }

    /// Resolves a token to its live session. Expired sessions are evicted.
    ///
    /// # Errors
    /// Returns `ServiceError::SessionInvalid` if the token is unknown, replaced, revoked or expired
    pub fn validate(&self, token: &str) -> ServiceResult<SessionToken> {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();

        let username = sessions
            .by_token
            .get(token)
            .cloned()
            .ok_or(ServiceError::SessionInvalid)?;

        let session = sessions
            .by_user
            .get(&username)
            .cloned()
            .ok_or(ServiceError::SessionInvalid)?;

        if now > session.expires_at {
            sessions.remove_user(&username);
            debug!(username = %username, "evicted expired session");
            return Err(ServiceError::SessionInvalid);
        }

        Ok(session)
    }

    /// Evicts every expired session, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions.lock();

        let expired: Vec<String> = sessions
            .by_user
            .values()
            .filter(|session| now > session.expires_at)
            .map(|session| session.username.clone())
            .collect();

        for username in &expired {
            sessions.remove_user(username);
        }
        expired.len()
    }

    /// Number of sessions that have not yet expired.
    pub fn active_sessions(&self) -> usize {
        let now = self.clock.now();
        self.sessions
            .lock()
            .by_user
            .values()
            .filter(|session| now <= session.expires_at)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ManualClock;
    use futures::future::join_all;

    fn registry() -> (Arc<SessionRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let registry = Arc::new(SessionRegistry::new(
            chrono::Duration::seconds(900),
            clock.clone(),
        ));
        (registry, clock)
    }

    #[test]
    fn test_issue_then_validate() {
        let (registry, clock) = registry();
        let session = registry.issue("alice");

        assert_eq!(session.username, "alice");
        assert_eq!(session.issued_at, clock.now());
        assert_eq!(session.expires_at, clock.now() + chrono::Duration::seconds(900));
        assert_eq!(registry.validate(&session.token).unwrap(), session);
    }

    #[test]
    fn test_second_issue_invalidates_first() {
        let (registry, _) = registry();
        let first = registry.issue("alice");
        let second = registry.issue("alice");

        assert_ne!(first.token, second.token);
        assert!(matches!(
            registry.validate(&first.token),
            Err(ServiceError::SessionInvalid)
        ));
        assert_eq!(registry.validate(&second.token).unwrap().username, "alice");
        assert_eq!(registry.active_sessions(), 1);
    }

    #[test]
    fn test_sessions_of_different_users_are_independent() {
        let (registry, _) = registry();
        let alice = registry.issue("alice");
        let bob = registry.issue("bob");

        registry.revoke("alice");
        assert!(registry.validate(&alice.token).is_err());
        assert_eq!(registry.validate(&bob.token).unwrap().username, "bob");
    }

    #[test]
    fn test_revoke_invalidates_and_is_idempotent() {
        let (registry, _) = registry();
        let first = registry.issue("alice");
        let second = registry.issue("alice");

        assert!(registry.revoke("alice"));
        assert!(!registry.revoke("alice"));
        assert!(!registry.revoke("nobody"));
        assert!(registry.validate(&first.token).is_err());
        assert!(registry.validate(&second.token).is_err());
    }

    #[test]
    fn test_revoke_token() {
        let (registry, _) = registry();
        let session = registry.issue("alice");

        assert_eq!(registry.revoke_token(&session.token), Some("alice".to_string()));
        assert_eq!(registry.revoke_token(&session.token), None);
        assert!(registry.validate(&session.token).is_err());
    }

    #[test]
    fn test_stale_token_cannot_revoke_current_session() {
        let (registry, _) = registry();
        let old = registry.issue("alice");
        let current = registry.issue("alice");

        assert_eq!(registry.revoke_token(&old.token), None);
        assert!(registry.validate(&current.token).is_ok());
    }

    #[test]
    fn test_expiry_boundary_and_eviction() {
        let (registry, clock) = registry();
        let session = registry.issue("alice");

        clock.set(session.expires_at);
        assert!(registry.validate(&session.token).is_ok());

        clock.advance(chrono::Duration::seconds(1));
        assert!(matches!(
            registry.validate(&session.token),
            Err(ServiceError::SessionInvalid)
        ));
        assert!(!registry.revoke("alice"), "expired entry should have been evicted");
    }

    #[test]
    fn test_purge_expired() {
        let (registry, clock) = registry();
        registry.issue("alice");
        clock.advance(chrono::Duration::seconds(600));
        let bob = registry.issue("bob");
        clock.advance(chrono::Duration::seconds(400));

        assert_eq!(registry.active_sessions(), 1);
        assert_eq!(registry.purge_expired(), 1);
        assert_eq!(registry.purge_expired(), 0);
        assert!(registry.validate(&bob.token).is_ok());
    }

    #[test]
    fn test_unknown_token_invalid() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.validate("not-a-token"),
            Err(ServiceError::SessionInvalid)
        ));
    }

    #[test]
    fn test_linked_upstream_expiry_recorded() {
        let (registry, clock) = registry();
        let upstream = clock.now() + chrono::Duration::hours(1);
        let session = registry.issue_linked("alice", Some(upstream));
        assert_eq!(
            registry.validate(&session.token).unwrap().upstream_expires_at,
            Some(upstream)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_issues_leave_exactly_one_valid_token() {
        let (registry, _) = registry();

        let tasks = (0..32).map(|_| {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.issue("alice") })
        });
        let sessions: Vec<SessionToken> = join_all(tasks)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        let valid: Vec<&SessionToken> = sessions
            .iter()
            .filter(|session| registry.validate(&session.token).is_ok())
            .collect();
        assert_eq!(valid.len(), 1);
        assert_eq!(registry.active_sessions(), 1);
    }
}
