//! GitHub App JWT utilities.
//!
//! Signs the short-lived RS256 JWT a GitHub App presents when requesting an
//! installation access token.

use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use crate::errors::{ServiceError, ServiceResult};

/// Backdate `iat` to tolerate clock drift against GitHub.
const APP_JWT_BACKDATE_SECS: i64 = 60;

/// GitHub rejects App JWTs valid for more than ten minutes.
const APP_JWT_LIFETIME_SECS: i64 = 540;

/// GitHub App JWT claims
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AppClaims {
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
    /// App ID
    pub iss: String,
}

/// Signs App JWTs with the App's private key.
pub struct AppJwtSigner {
    app_id: String,
    encoding_key: EncodingKey,
}

impl AppJwtSigner {
    /// Create a signer from a PEM-encoded RSA private key.
    pub fn from_pem(app_id: impl Into<String>, pem: &str) -> ServiceResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(pem.as_bytes()).map_err(|e| {
            ServiceError::internal_error(format!("invalid GitHub App private key: {}", e))
        })?;

        Ok(AppJwtSigner {
            app_id: app_id.into(),
            encoding_key,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    /// Build the claims for a JWT minted at `now_secs`.
    pub fn claims_at(&self, now_secs: i64) -> AppClaims {
        AppClaims {
            iat: now_secs - APP_JWT_BACKDATE_SECS,
            exp: now_secs + APP_JWT_LIFETIME_SECS,
            iss: self.app_id.clone(),
        }
    }

    /// Sign an App JWT minted at `now_secs`.
    pub fn sign(&self, now_secs: i64) -> Result<String, jsonwebtoken::errors::Error> {
        encode(
            &Header::new(Algorithm::RS256),
            &self.claims_at(now_secs),
            &self.encoding_key,
        )
    }
}
