//! JWT access token issuing and validation.
//!
//! Tokens are signed with an Ed25519 key pair loaded once at startup. Only
//! the configured algorithm is accepted on validation; the header's `alg`
//! is checked against it before any key is touched, and the verification
//! key is always the configured public key.

use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{ACCESS_TOKEN_AUDIENCE, JwtConfig};
use crate::database::models::{Role, User};
use crate::errors::ServiceError;

const SIGNING_ALGORITHM: Algorithm = Algorithm::EdDSA;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccessTokenError {
    #[error("malformed access token")]
    Malformed,
    #[error("access token signature is invalid")]
    SignatureInvalid,
    #[error("access token has expired")]
    Expired,
    #[error("access token algorithm is not supported")]
    UnsupportedAlgorithm,
    #[error("failed to sign access token: {0}")]
    Signing(String),
    #[error("failed to load signing keys: {0}")]
    KeyLoad(String),
}

impl From<AccessTokenError> for ServiceError {
    fn from(error: AccessTokenError) -> Self {
        match error {
            AccessTokenError::Expired => ServiceError::expired("Access token has expired"),
            AccessTokenError::Malformed
            | AccessTokenError::SignatureInvalid
            | AccessTokenError::UnsupportedAlgorithm => {
                ServiceError::invalid_credentials("Invalid access token")
            }
            AccessTokenError::Signing(message) | AccessTokenError::KeyLoad(message) => {
                ServiceError::internal_error(message)
            }
        }
    }
}

/// Identity claims carried by an access token. Never persisted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccessClaims {
    /// User ID
    pub sub: String,
    pub iss: String,
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub username: String,
    pub display_name: String,
    pub role: Role,
    /// Computed from the user at mint time, never copied from older claims.
    pub verification_required: bool,
}

impl AccessClaims {
    pub fn user_id(&self) -> &str {
        &self.sub
    }
}

/// Signs and validates access tokens.
pub struct AccessTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: String,
    ttl_seconds: i64,
}

impl AccessTokenIssuer {
    /// Loads the key pair named in the configuration.
    pub fn from_config(config: &JwtConfig) -> Result<Self, AccessTokenError> {
        let private_pem = std::fs::read(&config.private_key_path).map_err(|e| {
            AccessTokenError::KeyLoad(format!("{}: {e}", config.private_key_path))
        })?;
        let public_pem = std::fs::read(&config.public_key_path)
            .map_err(|e| AccessTokenError::KeyLoad(format!("{}: {e}", config.public_key_path)))?;

        Self::from_pem(
            &private_pem,
            &public_pem,
            config.issuer.clone(),
            config.access_ttl_seconds,
        )
    }

    pub fn from_pem(
        private_pem: &[u8],
        public_pem: &[u8],
        issuer: String,
        ttl_seconds: u64,
    ) -> Result<Self, AccessTokenError> {
        let encoding_key = EncodingKey::from_ed_pem(private_pem)
            .map_err(|e| AccessTokenError::KeyLoad(format!("private key: {e}")))?;
        let decoding_key = DecodingKey::from_ed_pem(public_pem)
            .map_err(|e| AccessTokenError::KeyLoad(format!("public key: {e}")))?;

        let mut validation = Validation::new(SIGNING_ALGORITHM);
        validation.set_audience(&[ACCESS_TOKEN_AUDIENCE]);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "nbf", "sub", "aud", "iss"]);
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;

        let ttl_seconds = i64::try_from(ttl_seconds)
            .map_err(|_| AccessTokenError::KeyLoad("access token TTL out of range".to_string()))?;

        Ok(AccessTokenIssuer {
            encoding_key,
            decoding_key,
            validation,
            issuer,
            ttl_seconds,
        })
    }

    /// Builds claims from current user state.
    pub fn claims_for(&self, user: &User) -> AccessClaims {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.ttl_seconds);

        AccessClaims {
            sub: user.id.clone(),
            iss: self.issuer.clone(),
            aud: ACCESS_TOKEN_AUDIENCE.to_string(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: exp.timestamp(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role: user.role,
            verification_required: user.verification_required(),
        }
    }

    pub fn issue(&self, claims: &AccessClaims) -> Result<String, AccessTokenError> {
        encode(&Header::new(SIGNING_ALGORITHM), claims, &self.encoding_key)
            .map_err(|e| AccessTokenError::Signing(e.to_string()))
    }

    /// Mints a fresh token for the user.
    pub fn issue_for_user(&self, user: &User) -> Result<String, AccessTokenError> {
        self.issue(&self.claims_for(user))
    }

    pub fn validate(&self, token: &str) -> Result<AccessClaims, AccessTokenError> {
        let header = decode_header(token).map_err(|_| AccessTokenError::Malformed)?;
        if header.alg != SIGNING_ALGORITHM {
            return Err(AccessTokenError::UnsupportedAlgorithm);
        }

        decode::<AccessClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AccessTokenError::Expired,
                ErrorKind::InvalidSignature => AccessTokenError::SignatureInvalid,
                ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
                    AccessTokenError::UnsupportedAlgorithm
                }
                _ => AccessTokenError::Malformed,
            })
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }
}
