//! OAuth ID token verification.
//!
//! The provider's answer is trusted as-is; this module only carries the
//! request and normalizes the response.

use crate::config::OAuthConfig;
use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use serde::Deserialize;

/// Identity asserted by an OAuth provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthIdentity {
    pub provider: String,
    pub subject: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

#[async_trait]
pub trait OAuthVerifier: Send + Sync {
    async fn verify_id_token(&self, id_token: &str, audience: &str) -> ServiceResult<OAuthIdentity>;

    /// Audience this service expects in provider tokens.
    fn audience(&self) -> &str;
}

#[derive(Debug, Deserialize)]
struct TokenInfo {
    aud: String,
    sub: String,
    email: Option<String>,
    #[serde(default)]
    email_verified: Option<String>,
    name: Option<String>,
}

/// Verifies Google ID tokens against the tokeninfo endpoint.
pub struct GoogleOAuthVerifier {
    client: reqwest::Client,
    config: OAuthConfig,
}

impl GoogleOAuthVerifier {
    pub fn new(config: OAuthConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl OAuthVerifier for GoogleOAuthVerifier {
    async fn verify_id_token(&self, id_token: &str, audience: &str) -> ServiceResult<OAuthIdentity> {
        let response = self
            .client
            .get(&self.config.tokeninfo_url)
            .query(&[("id_token", id_token)])
            .send()
            .await
            .map_err(|e| ServiceError::external_service(format!("OAuth provider unreachable: {e}")))?;

        if response.status().is_client_error() {
            return Err(ServiceError::invalid_credentials("Invalid OAuth token"));
        }
        if !response.status().is_success() {
            return Err(ServiceError::external_service(format!(
                "OAuth provider returned {}",
                response.status()
            )));
        }

        let info: TokenInfo = response
            .json()
            .await
            .map_err(|e| ServiceError::external_service(format!("Bad OAuth response: {e}")))?;

        if info.aud != audience {
            return Err(ServiceError::invalid_credentials("Invalid OAuth token"));
        }

        // Only addresses the provider has verified are carried forward.
        let email = match info.email_verified.as_deref() {
            Some("true") => info.email,
            _ => None,
        };

        Ok(OAuthIdentity {
            provider: "google".to_string(),
            subject: info.sub,
            email,
            name: info.name,
        })
    }

    fn audience(&self) -> &str {
        &self.config.google_client_id
    }
}
