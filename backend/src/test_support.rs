//! Shared fixtures for unit tests: an in-memory store, fixture signing keys
//! and in-process fakes for the outbound collaborators.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::service::{AuthDependencies, AuthService};
use crate::config::Config;
use crate::database::Database;
use crate::database::models::{CreateUser, Role, User};
use crate::errors::{ServiceError, ServiceResult};
use crate::repositories::user_repository::UserRepository;
use crate::services::company_directory::CompanyDirectory;
use crate::services::email_service::{EmailTransport, VerificationEmail};
use crate::services::email_verification_service::EmailVerificationService;
use crate::services::oauth_service::{OAuthIdentity, OAuthVerifier};
use crate::services::refresh_token_service::RefreshTokenService;
use crate::utils::jwt::AccessTokenIssuer;
use crate::utils::retry::Backoff;
use crate::utils::unsubscribe::UnsubscribeCodec;

pub const TEST_PASSWORD: &str = "correct horse battery";

pub fn issuer() -> AccessTokenIssuer {
    AccessTokenIssuer::from_config(&Config::for_tests().jwt).unwrap()
}

/// A user that exists only in memory.
pub fn sample_user(role: Role, email_verified: bool) -> User {
    let now = Utc::now();
    User {
        id: uuid::Uuid::now_v7().to_string(),
        username: "sample".to_string(),
        display_name: "Sample User".to_string(),
        email: Some("sample@example.com".to_string()),
        email_verified,
        role,
        password_hash: Some("unused".to_string()),
        oauth_provider: None,
        oauth_subject: None,
        created_at: now,
        updated_at: now,
    }
}

/// Inserts an unverified password user `{username}@example.com`.
pub async fn create_user(db: &Database, username: &str, role: Role) -> User {
    let password_hash = bcrypt::hash(TEST_PASSWORD, 4).unwrap();
    let mut conn = db.pool().acquire().await.unwrap();
    UserRepository::create_user(
        &mut conn,
        CreateUser {
            username: username.to_string(),
            display_name: format!("{username} display"),
            email: Some(format!("{username}@example.com")),
            email_verified: false,
            role,
            password_hash: Some(password_hash),
            oauth_provider: None,
            oauth_subject: None,
        },
    )
    .await
    .unwrap()
}

#[derive(Debug, Clone)]
pub struct SentEmail {
    pub to: String,
    pub code: String,
    pub expires_in_hours: i64,
    pub unsubscribe_token: Option<String>,
}

/// Records delivered messages; can be told to fail a number of attempts.
#[derive(Default)]
pub struct FakeEmailTransport {
    sent: Mutex<Vec<SentEmail>>,
    failures_left: AtomicU32,
    attempts: AtomicU32,
}

impl FakeEmailTransport {
    pub fn fail_next(&self, attempts: u32) {
        self.failures_left.store(attempts, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<SentEmail> {
        self.sent.lock().unwrap().last().cloned()
    }

    pub fn last_code(&self) -> Option<String> {
        self.last().map(|email| email.code)
    }
}

#[async_trait]
impl EmailTransport for FakeEmailTransport {
    async fn send_verification_email(&self, email: &VerificationEmail<'_>) -> ServiceResult<String> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(ServiceError::external_service("smtp unavailable"));
        }

        self.sent.lock().unwrap().push(SentEmail {
            to: email.to.to_string(),
            code: email.code.to_string(),
            expires_in_hours: email.expires_in_hours,
            unsubscribe_token: email.unsubscribe_token.map(str::to_string),
        });
        Ok(format!("<message-{attempt}@test>"))
    }
}

/// Accepts only the ID tokens registered with it.
#[derive(Default)]
pub struct FakeOAuthVerifier {
    identities: Mutex<HashMap<String, OAuthIdentity>>,
}

impl FakeOAuthVerifier {
    pub fn register(&self, id_token: &str, identity: OAuthIdentity) {
        self.identities
            .lock()
            .unwrap()
            .insert(id_token.to_string(), identity);
    }
}

#[async_trait]
impl OAuthVerifier for FakeOAuthVerifier {
    async fn verify_id_token(&self, id_token: &str, audience: &str) -> ServiceResult<OAuthIdentity> {
        assert_eq!(audience, self.audience());
        self.identities
            .lock()
            .unwrap()
            .get(id_token)
            .cloned()
            .ok_or_else(|| ServiceError::invalid_credentials("Invalid OAuth token"))
    }

    fn audience(&self) -> &str {
        "test-client-id"
    }
}

#[derive(Default)]
pub struct FakeCompanyDirectory {
    names: Mutex<HashSet<String>>,
}

impl FakeCompanyDirectory {
    pub fn register(&self, name: &str) {
        self.names.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl CompanyDirectory for FakeCompanyDirectory {
    async fn company_exists(&self, name: &str) -> ServiceResult<bool> {
        Ok(self.names.lock().unwrap().contains(name))
    }
}

/// The whole service wired against an in-memory store and fakes.
pub struct TestContext {
    pub config: Config,
    pub db: Database,
    pub issuer: Arc<AccessTokenIssuer>,
    pub refresh: Arc<RefreshTokenService>,
    pub verification: Arc<EmailVerificationService>,
    pub mailer: Arc<FakeEmailTransport>,
    pub oauth: Arc<FakeOAuthVerifier>,
    pub companies: Arc<FakeCompanyDirectory>,
    pub auth: Arc<AuthService>,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(Config::for_tests()).await
    }

    pub async fn with_config(config: Config) -> Self {
        Self::with_database(config, Database::in_memory().await).await
    }

    pub async fn with_database(config: Config, db: Database) -> Self {
        let issuer = Arc::new(AccessTokenIssuer::from_config(&config.jwt).unwrap());
        let refresh = Arc::new(RefreshTokenService::new(
            db.clone(),
            issuer.clone(),
            &config.refresh,
        ));

        let mailer = Arc::new(FakeEmailTransport::default());
        let verification = Arc::new(
            EmailVerificationService::new(
                db.clone(),
                mailer.clone(),
                &config.verification,
                &config.unsubscribe,
            )
            .with_backoff(Backoff {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_elapsed: Duration::from_millis(50),
            }),
        );

        let oauth = Arc::new(FakeOAuthVerifier::default());
        let companies = Arc::new(FakeCompanyDirectory::default());

        let auth = Arc::new(AuthService::new(AuthDependencies {
            db: db.clone(),
            issuer: issuer.clone(),
            refresh_tokens: refresh.clone(),
            verification: verification.clone(),
            unsubscribe: UnsubscribeCodec::new(config.unsubscribe.secret.clone()),
            oauth: Some(oauth.clone()),
            companies: companies.clone(),
            password_hash_cost: config.password_hash_cost,
        }));

        TestContext {
            config,
            db,
            issuer,
            refresh,
            verification,
            mailer,
            oauth,
            companies,
            auth,
        }
    }
}
