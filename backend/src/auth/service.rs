//! Core business logic for the authentication system.

use std::sync::Arc;
use tracing::info;
use validator::Validate;

use crate::api::common::validation_errors_to_message;
use crate::auth::models::*;
use crate::errors::{ServiceError, ServiceResult};
use crate::services::credential_verifier::CredentialVerifier;
use crate::services::session_registry::{SessionRegistry, SessionToken};
use crate::services::token_broker::InstallationTokenBroker;

/// Authentication service composing verifier, broker and session registry
pub struct AuthService {
    verifier: Arc<CredentialVerifier>,
    broker: Arc<InstallationTokenBroker>,
    registry: Arc<SessionRegistry>,
}

impl AuthService {
    pub fn new(
        verifier: Arc<CredentialVerifier>,
        broker: Arc<InstallationTokenBroker>,
        registry: Arc<SessionRegistry>,
    ) -> Self {
        AuthService {
            verifier,
            broker,
            registry,
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn broker(&self) -> &InstallationTokenBroker {
        &self.broker
    }

    /// Verify credentials, make sure an installation token is available and
    /// issue a new session, replacing any existing one for the user.
    pub async fn login(&self, login_request: LoginRequest) -> ServiceResult<LoginResponse> {
        if let Err(validation_errors) = login_request.validate() {
            return Err(ServiceError::validation(validation_errors_to_message(
                &validation_errors,
            )));
        }

        let user = self
            .verifier
            .verify(&login_request.username, &login_request.password)
            .await?;

        let installation_token = self.broker.get_installation_token().await?;

        let session = self
            .registry
            .issue_linked(&user.username, Some(installation_token.expires_at));

        info!(
            username = %session.username,
            expires_at = %session.expires_at,
            "session issued"
        );

        Ok(LoginResponse {
            status: "ok".to_string(),
            session_token: session.token,
            expires_at: session.expires_at,
            expires_in: self.registry.lifetime().num_seconds().max(0) as u64,
        })
    }

    /// Revoke the session behind `token`, if any. Never fails.
    pub fn logout(&self, token: Option<&str>) -> LogoutResponse {
        if let Some(username) = token.and_then(|token| self.registry.revoke_token(token)) {
            info!(username = %username, "session revoked");
        }

        LogoutResponse {
            message: "Logged out successfully".to_string(),
        }
    }

    /// Resolve a bearer token to its live session.
    pub fn authenticate(&self, token: &str) -> ServiceResult<SessionToken> {
        self.registry.validate(token)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::BrokerError;
    use crate::services::credential_verifier::CredentialRecord;
    use crate::services::token_broker::BrokerSettings;
    use crate::test_support::{FakeCredentialSource, FakeExchanger, ManualClock};
    use crate::utils::clock::Clock;
    use std::time::Duration;

    pub(crate) struct Harness {
        pub service: Arc<AuthService>,
        pub source: Arc<FakeCredentialSource>,
        pub exchanger: Arc<FakeExchanger>,
        pub clock: Arc<ManualClock>,
    }

    pub(crate) fn harness_with(exchanger: FakeExchanger, clock: Arc<ManualClock>) -> Harness {
        let source = Arc::new(FakeCredentialSource::new(vec![
            CredentialRecord {
                username: "alice".to_string(),
                secret: "pw123".to_string(),
                status: Some("active".to_string()),
            },
            CredentialRecord {
                username: "carol".to_string(),
                secret: "pw456".to_string(),
                status: Some("inactive".to_string()),
            },
        ]));
        let exchanger = Arc::new(exchanger);

        let verifier = Arc::new(CredentialVerifier::new(
            source.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
        ));
        let broker = Arc::new(InstallationTokenBroker::new(
            exchanger.clone(),
            clock.clone(),
            BrokerSettings {
                refresh_margin: chrono::Duration::seconds(300),
                retry_backoff: Duration::from_millis(1),
                call_timeout: Duration::from_secs(5),
            },
        ));
        let registry = Arc::new(SessionRegistry::new(
            chrono::Duration::seconds(900),
            clock.clone(),
        ));

        Harness {
            service: Arc::new(AuthService::new(verifier, broker, registry)),
            source,
            exchanger,
            clock,
        }
    }

    pub(crate) fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        harness_with(
            FakeExchanger::new(clock.clone(), chrono::Duration::hours(1)),
            clock,
        )
    }

    fn login(username: &str, password: &str) -> LoginRequest {
        LoginRequest {
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_issues_valid_session() {
        let h = harness();
        let response = h.service.login(login("alice", "pw123")).await.unwrap();

        assert_eq!(response.status, "ok");
        assert_eq!(response.expires_in, 900);
        assert_eq!(response.expires_at, h.clock.now() + chrono::Duration::seconds(900));

        let session = h.service.authenticate(&response.session_token).unwrap();
        assert_eq!(session.username, "alice");
        assert_eq!(
            session.upstream_expires_at,
            Some(h.clock.now() + chrono::Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_second_login_revokes_first_session() {
        let h = harness();
        let first = h.service.login(login("alice", "pw123")).await.unwrap();
        let second = h.service.login(login("alice", "pw123")).await.unwrap();

        assert!(matches!(
            h.service.authenticate(&first.session_token),
            Err(ServiceError::SessionInvalid)
        ));
        assert!(h.service.authenticate(&second.session_token).is_ok());
        // Cached installation token reused for the second login
        assert_eq!(h.exchanger.calls(), 1);
    }

    #[tokio::test]
    async fn test_bad_credentials_skip_broker() {
        let h = harness();
        for (user, pass) in [("alice", "wrong"), ("bob", "x"), ("carol", "pw456")] {
            assert!(matches!(
                h.service.login(login(user, pass)).await,
                Err(ServiceError::InvalidCredentials)
            ));
        }
        assert_eq!(h.exchanger.calls(), 0);
        assert_eq!(h.service.registry().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_empty_fields_are_validation_errors() {
        let h = harness();
        let err = h.service.login(login("", "")).await.unwrap_err();
        match err {
            ServiceError::Validation { message } => {
                assert!(message.contains("Username is required"));
                assert!(message.contains("Password is required"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.source.fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_issues_no_session() {
        let clock = Arc::new(ManualClock::default());
        let exchanger = FakeExchanger::new(clock.clone(), chrono::Duration::hours(1))
            .with_script(vec![Err(BrokerError::UpstreamRejected("revoked".into()))]);
        let h = harness_with(exchanger, clock);

        assert!(matches!(
            h.service.login(login("alice", "pw123")).await,
            Err(ServiceError::Broker(BrokerError::UpstreamRejected(_)))
        ));
        assert_eq!(h.service.registry().active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_source_outage_surfaces_upstream_unavailable() {
        let h = harness();
        h.source.set_failing("dns failure");
        assert!(matches!(
            h.service.login(login("alice", "pw123")).await,
            Err(ServiceError::UpstreamUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_logout_is_idempotent() {
        let h = harness();
        let response = h.service.login(login("alice", "pw123")).await.unwrap();

        h.service.logout(Some(&response.session_token));
        h.service.logout(Some(&response.session_token));
        h.service.logout(Some("garbage"));
        h.service.logout(None);

        assert!(h.service.authenticate(&response.session_token).is_err());
    }
}
