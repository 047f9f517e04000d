//! Central module for application-wide configuration settings.
//!
//! Configuration is read once at process start by [`Config::from_env`] and
//! handed by reference to every component constructor. Nothing below the
//! `main` entry point reads the environment directly.

use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

/// Fixed audience claim carried by every access token this service mints.
pub const ACCESS_TOKEN_AUDIENCE: &str = "auth-backend";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub server_port: u16,
    pub jwt: JwtConfig,
    pub refresh: RefreshTokenConfig,
    pub verification: VerificationConfig,
    pub unsubscribe: UnsubscribeConfig,
    pub password_hash_cost: u32,
    pub email: Option<EmailConfig>,
    pub oauth: Option<OAuthConfig>,
    pub company_directory_url: Option<String>,
}

/// Access token signing settings.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub issuer: String,
    pub access_ttl_seconds: u64,
}

/// Refresh token lifetime and storage settings.
#[derive(Debug, Clone)]
pub struct RefreshTokenConfig {
    pub ttl_days: i64,
    /// Server-side key for the keyed hash under which secrets are stored.
    pub pepper: String,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct VerificationConfig {
    pub enabled: bool,
    pub cooldown_seconds: i64,
    pub ttl_hours: i64,
    /// bcrypt cost used to hash one-time codes.
    pub code_hash_cost: u32,
}

#[derive(Debug, Clone)]
pub struct UnsubscribeConfig {
    pub secret: String,
    pub ttl_days: i64,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_email: String,
    pub from_name: String,
    pub base_url: String,
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub google_client_id: String,
    pub tokeninfo_url: String,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let max_connections = parse_or("DB_MAX_CONNECTIONS", 5u32)?;
        let acquire_timeout_seconds = parse_or("DB_ACQUIRE_TIMEOUT_SECONDS", 3u64)?;
        let server_port = parse_or("SERVER_PORT", 3000u16)?;

        let jwt = JwtConfig {
            private_key_path: env::var("JWT_PRIVATE_KEY_PATH")
                .context("JWT_PRIVATE_KEY_PATH not set")?,
            public_key_path: env::var("JWT_PUBLIC_KEY_PATH")
                .context("JWT_PUBLIC_KEY_PATH not set")?,
            issuer: env::var("JWT_ISSUER").unwrap_or_else(|_| "auth-backend".to_string()),
            access_ttl_seconds: parse_or("JWT_ACCESS_TTL_SECONDS", 900u64)?,
        };

        let refresh = RefreshTokenConfig {
            ttl_days: parse_or("REFRESH_TOKEN_TTL_DAYS", 30i64)?,
            pepper: env::var("REFRESH_TOKEN_PEPPER").context("REFRESH_TOKEN_PEPPER not set")?,
            sweep_interval_seconds: parse_or("REFRESH_TOKEN_SWEEP_INTERVAL_SECONDS", 3600u64)?,
        };

        let password_hash_cost = parse_or("PASSWORD_HASH_COST", bcrypt::DEFAULT_COST)?;

        let verification = VerificationConfig {
            enabled: parse_or("EMAIL_VERIFICATION_ENABLED", true)?,
            cooldown_seconds: parse_or("EMAIL_VERIFICATION_COOLDOWN_SECONDS", 120i64)?,
            ttl_hours: parse_or("EMAIL_VERIFICATION_TTL_HOURS", 24i64)?,
            code_hash_cost: password_hash_cost,
        };

        let unsubscribe = UnsubscribeConfig {
            secret: env::var("UNSUBSCRIBE_SECRET").context("UNSUBSCRIBE_SECRET not set")?,
            ttl_days: parse_or("UNSUBSCRIBE_TOKEN_TTL_DAYS", 365i64)?,
        };

        let oauth = match env::var("OAUTH_GOOGLE_CLIENT_ID") {
            Ok(google_client_id) => Some(OAuthConfig {
                google_client_id,
                tokeninfo_url: env::var("OAUTH_TOKENINFO_URL")
                    .unwrap_or_else(|_| "https://oauth2.googleapis.com/tokeninfo".to_string()),
            }),
            Err(_) => None,
        };

        Ok(Config {
            database_url,
            max_connections,
            acquire_timeout_seconds,
            server_port,
            jwt,
            refresh,
            verification,
            unsubscribe,
            password_hash_cost,
            email: EmailConfig::from_env()?,
            oauth,
            company_directory_url: env::var("COMPANY_DIRECTORY_URL").ok(),
        })
    }

    /// Returns the SMTP settings when the full group is configured.
    pub fn email_config(&self) -> Option<EmailConfig> {
        self.email.clone()
    }
}

impl EmailConfig {
    /// Reads the SMTP group. A missing `SMTP_HOST` disables SMTP delivery;
    /// a partially configured group is an error.
    fn from_env() -> Result<Option<Self>> {
        let Ok(smtp_host) = env::var("SMTP_HOST") else {
            return Ok(None);
        };

        Ok(Some(EmailConfig {
            smtp_host,
            smtp_port: parse_or("SMTP_PORT", 587u16)?,
            smtp_username: env::var("SMTP_USERNAME").context("SMTP_USERNAME not set")?,
            smtp_password: env::var("SMTP_PASSWORD").context("SMTP_PASSWORD not set")?,
            from_email: env::var("SMTP_FROM_EMAIL").context("SMTP_FROM_EMAIL not set")?,
            from_name: env::var("SMTP_FROM_NAME").unwrap_or_else(|_| "Auth Backend".to_string()),
            base_url: env::var("APP_BASE_URL").context("APP_BASE_URL not set")?,
        }))
    }
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} must be a valid value")),
        Err(_) => Ok(default),
    }
}

/// Lowest cost bcrypt accepts; keeps hashing fast under test.
#[cfg(test)]
const TEST_HASH_COST: u32 = 4;

#[cfg(test)]
impl Config {
    /// Configuration used by in-process tests: cheap hashing, fixture keys.
    pub fn for_tests() -> Self {
        Config {
            database_url: "sqlite::memory:".to_string(),
            max_connections: 1,
            acquire_timeout_seconds: 3,
            server_port: 0,
            jwt: JwtConfig {
                private_key_path: concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/fixtures/jwt_ed25519_private.pem"
                )
                .to_string(),
                public_key_path: concat!(
                    env!("CARGO_MANIFEST_DIR"),
                    "/fixtures/jwt_ed25519_public.pem"
                )
                .to_string(),
                issuer: "auth-backend-test".to_string(),
                access_ttl_seconds: 900,
            },
            refresh: RefreshTokenConfig {
                ttl_days: 30,
                pepper: "test-refresh-pepper".to_string(),
                sweep_interval_seconds: 3600,
            },
            verification: VerificationConfig {
                enabled: true,
                cooldown_seconds: 120,
                ttl_hours: 24,
                code_hash_cost: TEST_HASH_COST,
            },
            unsubscribe: UnsubscribeConfig {
                secret: "test-unsubscribe-secret".to_string(),
                ttl_days: 365,
            },
            password_hash_cost: TEST_HASH_COST,
            email: None,
            oauth: None,
            company_directory_url: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_or_falls_back_to_default() {
        let value: u32 = parse_or("AUTH_BACKEND_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
