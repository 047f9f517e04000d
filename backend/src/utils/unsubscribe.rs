//! Stateless unsubscribe tokens for email opt-out links.
//!
//! Layout: `base64url(hmac_sha256(secret, payload) ++ payload)` where the
//! payload is `email:unix_expiry`. The colon is not escaped, so an address
//! containing one decodes to more than two fields and is rejected.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::errors::ServiceError;
use crate::utils::crypto::{SIGNATURE_LEN, hmac_sha256, hmac_sha256_verify};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnsubscribeTokenError {
    #[error("invalid token encoding")]
    BadFormat,
    #[error("token too short")]
    TooShort,
    #[error("invalid token signature")]
    BadSignature,
    #[error("invalid token payload")]
    BadPayload,
    #[error("invalid token expiry")]
    BadExpiry,
    #[error("token expired")]
    Expired,
}

impl From<UnsubscribeTokenError> for ServiceError {
    fn from(error: UnsubscribeTokenError) -> Self {
        match error {
            UnsubscribeTokenError::Expired => ServiceError::expired("Unsubscribe link has expired"),
            other => ServiceError::validation(format!("Invalid unsubscribe link: {other}")),
        }
    }
}

#[derive(Clone)]
pub struct UnsubscribeCodec {
    secret: Vec<u8>,
}

impl UnsubscribeCodec {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    pub fn encode(&self, email: &str, expires_at: DateTime<Utc>) -> String {
        let payload = format!("{email}:{}", expires_at.timestamp());
        let signature = hmac_sha256(&self.secret, payload.as_bytes());

        let mut raw = Vec::with_capacity(SIGNATURE_LEN + payload.len());
        raw.extend_from_slice(&signature);
        raw.extend_from_slice(payload.as_bytes());
        URL_SAFE_NO_PAD.encode(raw)
    }

    /// Verifies a token and returns the email it was issued for.
    pub fn decode(&self, token: &str) -> Result<String, UnsubscribeTokenError> {
        self.decode_at(token, Utc::now())
    }

    fn decode_at(&self, token: &str, now: DateTime<Utc>) -> Result<String, UnsubscribeTokenError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim().as_bytes())
            .map_err(|_| UnsubscribeTokenError::BadFormat)?;
        if raw.len() < SIGNATURE_LEN {
            return Err(UnsubscribeTokenError::TooShort);
        }

        let (signature, payload) = raw.split_at(SIGNATURE_LEN);
        if !hmac_sha256_verify(&self.secret, payload, signature) {
            return Err(UnsubscribeTokenError::BadSignature);
        }

        let payload = std::str::from_utf8(payload).map_err(|_| UnsubscribeTokenError::BadPayload)?;
        let fields: Vec<&str> = payload.split(':').collect();
        let [email, expiry] = fields.as_slice() else {
            return Err(UnsubscribeTokenError::BadPayload);
        };

        let expiry: i64 = expiry
            .parse()
            .map_err(|_| UnsubscribeTokenError::BadExpiry)?;
        if now.timestamp() > expiry {
            return Err(UnsubscribeTokenError::Expired);
        }

        Ok((*email).to_string())
    }
}
