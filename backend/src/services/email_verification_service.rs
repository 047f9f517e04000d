//! Email verification challenges.
//!
//! A user has at most one active challenge. Creating a new one supersedes
//! whatever was active, inside the same write transaction. Codes are six
//! digits, stored only as bcrypt hashes, and expire a fixed time after the
//! record was created.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{UnsubscribeConfig, VerificationConfig};
use crate::database::Database;
use crate::database::models::{EmailVerification, User};
use crate::errors::ServiceError;
use crate::repositories::email_verification_repository::EmailVerificationRepository;
use crate::repositories::user_repository::UserRepository;
use crate::services::email_service::{EmailTransport, VerificationEmail};
use crate::utils::random::{generate_verification_code, is_verification_code};
use crate::utils::retry::{Backoff, retry_with_backoff};
use crate::utils::unsubscribe::UnsubscribeCodec;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("email is already verified")]
    AlreadyVerified,
    #[error("user not found")]
    UserNotFound,
    #[error("no active verification challenge")]
    ChallengeNotFound,
    #[error("invalid or expired verification code")]
    InvalidOrExpired,
    #[error("user has no email address")]
    NoEmail,
    #[error("verification requested too soon, retry after {retry_after_secs}s")]
    TooManyRequests { retry_after_secs: u64 },
    #[error("verification email delivery failed: {0}")]
    Delivery(String),
    #[error("failed to hash verification code: {0}")]
    Hashing(#[from] bcrypt::BcryptError),
    #[error("credential store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<VerificationError> for ServiceError {
    fn from(error: VerificationError) -> Self {
        match error {
            VerificationError::AlreadyVerified => {
                ServiceError::invalid_operation("Email is already verified")
            }
            VerificationError::UserNotFound => ServiceError::not_found("User", "current user"),
            VerificationError::ChallengeNotFound => {
                ServiceError::not_found("Verification challenge", "active challenge")
            }
            VerificationError::InvalidOrExpired => {
                ServiceError::invalid_credentials("Invalid or expired verification code")
            }
            VerificationError::NoEmail => {
                ServiceError::invalid_operation("No email address on this account")
            }
            VerificationError::TooManyRequests { retry_after_secs } => {
                ServiceError::TooManyRequests { retry_after_secs }
            }
            VerificationError::Delivery(message) => ServiceError::external_service(message),
            VerificationError::Hashing(e) => ServiceError::internal_error(e.to_string()),
            VerificationError::Store(e) => e.into(),
        }
    }
}

pub struct EmailVerificationService {
    db: Database,
    transport: Arc<dyn EmailTransport>,
    unsubscribe: UnsubscribeCodec,
    config: VerificationConfig,
    unsubscribe_ttl: Duration,
    backoff: Backoff,
}

impl EmailVerificationService {
    pub fn new(
        db: Database,
        transport: Arc<dyn EmailTransport>,
        config: &VerificationConfig,
        unsubscribe: &UnsubscribeConfig,
    ) -> Self {
        Self {
            db,
            transport,
            unsubscribe: UnsubscribeCodec::new(unsubscribe.secret.clone()),
            config: config.clone(),
            unsubscribe_ttl: Duration::days(unsubscribe.ttl_days),
            backoff: Backoff::email_delivery(),
        }
    }

    #[cfg(test)]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    fn cooldown(&self) -> Duration {
        Duration::seconds(self.config.cooldown_seconds)
    }

    fn code_ttl(&self) -> Duration {
        Duration::hours(self.config.ttl_hours)
    }

    /// Latest challenge still holding a code, if any.
    pub async fn pending_challenge(
        &self,
        user_id: &str,
    ) -> Result<Option<EmailVerification>, VerificationError> {
        let mut conn = self.db.pool().acquire().await?;
        Ok(EmailVerificationRepository::get_latest_active(&mut conn, user_id).await?)
    }

    /// Creates a new challenge for the user and mails its code.
    ///
    /// The cooldown check runs without a lock; two racing calls can both pass
    /// it and create a record each. Only the newest is ever read back.
    ///
    /// If delivery fails after the retry budget the error is returned but the
    /// record stays, so its code still validates and a later resend works.
    pub async fn send_challenge(
        &self,
        user_id: &str,
        email: &str,
        username: &str,
    ) -> Result<(), VerificationError> {
        if !self.config.enabled {
            debug!(user_id, "email verification disabled, skipping challenge");
            return Ok(());
        }

        let now = Utc::now();
        if let Some(active) = self.pending_challenge(user_id).await? {
            let elapsed = now - active.created_at;
            if elapsed < self.cooldown() {
                let remaining = (self.cooldown() - elapsed).num_seconds().max(1);
                info!(user_id, remaining, "verification resend inside cooldown");
                return Err(VerificationError::TooManyRequests {
                    retry_after_secs: remaining as u64,
                });
            }
        }

        let code = generate_verification_code();
        let code_hash = bcrypt::hash(&code, self.config.code_hash_cost)?;
        let unsubscribe_token = self.unsubscribe.encode(email, now + self.unsubscribe_ttl);

        let mut tx = self.db.begin_write().await?;
        let superseded = EmailVerificationRepository::supersede_active(&mut tx, user_id, now).await?;
        let record = EmailVerificationRepository::create_verification(
            &mut tx,
            user_id,
            &code_hash,
            Some(&unsubscribe_token),
            now,
        )
        .await?;
        tx.commit().await?;
        info!(user_id, verification_id = %record.id, superseded, "verification challenge created");

        let message = VerificationEmail {
            to: email,
            username,
            code: &code,
            expires_in_hours: self.config.ttl_hours,
            unsubscribe_token: Some(&unsubscribe_token),
        };
        let transport = self.transport.as_ref();
        let message = &message;
        let message_id = retry_with_backoff(self.backoff, "verification email delivery", move || {
            transport.send_verification_email(message)
        })
        .await
        .map_err(|e| VerificationError::Delivery(e.to_string()))?;

        self.record_message_id(&record.id, &message_id).await;
        Ok(())
    }

    async fn record_message_id(&self, verification_id: &str, message_id: &str) {
        let result = async {
            let mut conn = self.db.pool().acquire().await?;
            EmailVerificationRepository::set_message_id(&mut conn, verification_id, message_id)
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(verification_id, "failed to record verification message id: {e}");
        }
    }

    /// Checks a code against the user's active challenge.
    ///
    /// The hash comparison runs before the write transaction opens, off the
    /// async workers. The transaction then consumes the record only if it is
    /// still active, flags the email verified and returns the updated user.
    pub async fn verify(&self, user_id: &str, code: &str) -> Result<User, VerificationError> {
        let now = Utc::now();

        let mut conn = self.db.pool().acquire().await?;
        let user = UserRepository::get_user_by_id(&mut conn, user_id)
            .await?
            .ok_or(VerificationError::UserNotFound)?;
        if user.email_verified {
            return Err(VerificationError::AlreadyVerified);
        }
        let record = EmailVerificationRepository::get_latest_active(&mut conn, user_id)
            .await?
            .ok_or(VerificationError::ChallengeNotFound)?;
        drop(conn);

        if self.is_expired(&record, now) {
            let mut conn = self.db.pool().acquire().await?;
            EmailVerificationRepository::mark_used(&mut conn, &record.id, false, now).await?;
            info!(user_id, verification_id = %record.id, "verification code expired");
            return Err(VerificationError::InvalidOrExpired);
        }

        let matches = match record.code_hash.clone() {
            Some(hash) if is_verification_code(code) => code_matches(code.to_string(), hash).await,
            _ => false,
        };
        if !matches {
            debug!(user_id, "verification code mismatch");
            return Err(VerificationError::InvalidOrExpired);
        }

        self.consume_challenge(user_id, &record.id, now).await
    }

    /// Marks the challenge verified and the user's email verified together.
    /// Fails if the record was consumed or superseded after it was read.
    async fn consume_challenge(
        &self,
        user_id: &str,
        verification_id: &str,
        now: DateTime<Utc>,
    ) -> Result<User, VerificationError> {
        let mut tx = self.db.begin_write().await?;

        let user = UserRepository::get_user_by_id(&mut tx, user_id)
            .await?
            .ok_or(VerificationError::UserNotFound)?;
        if user.email_verified {
            return Err(VerificationError::AlreadyVerified);
        }
        if !EmailVerificationRepository::mark_used(&mut tx, verification_id, true, now).await? {
            debug!(user_id, verification_id, "verification challenge no longer active");
            return Err(VerificationError::InvalidOrExpired);
        }
        UserRepository::mark_email_verified(&mut tx, user_id).await?;
        let user = UserRepository::get_user_by_id(&mut tx, user_id)
            .await?
            .ok_or(VerificationError::UserNotFound)?;
        tx.commit().await?;

        info!(user_id, "email verified");
        Ok(user)
    }

    /// Sends a fresh challenge to the user's address on file.
    pub async fn resend(&self, user_id: &str) -> Result<(), VerificationError> {
        let mut conn = self.db.pool().acquire().await?;
        let user = UserRepository::get_user_by_id(&mut conn, user_id)
            .await?
            .ok_or(VerificationError::UserNotFound)?;
        drop(conn);

        let email = user.email.as_deref().ok_or(VerificationError::NoEmail)?;
        if user.email_verified {
            return Err(VerificationError::AlreadyVerified);
        }

        self.send_challenge(&user.id, email, &user.username).await
    }

    fn is_expired(&self, record: &EmailVerification, now: DateTime<Utc>) -> bool {
        now >= record.created_at + self.code_ttl()
    }
}

/// bcrypt comparison on the blocking pool. A failed task counts as a mismatch.
async fn code_matches(code: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || bcrypt::verify(&code, &hash).unwrap_or(false))
        .await
        .unwrap_or_else(|e| {
            warn!("verification code check failed: {e}");
            false
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Role;
    use crate::test_support::{TestContext, create_user};

    async fn backdate_challenges(db: &Database, user_id: &str, by: Duration) {
        sqlx::query("UPDATE email_verifications SET created_at = ? WHERE user_id = ?")
            .bind(Utc::now() - by)
            .bind(user_id)
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn record_count(db: &Database, user_id: &str) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM email_verifications WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_code_verifies_exactly_once() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let code = ctx.mailer.last_code().unwrap();
        assert_eq!(code.len(), 6);

        let verified = ctx.verification.verify(&user.id, &code).await.unwrap();
        assert!(verified.email_verified);
        assert!(!verified.verification_required());

        let replay = ctx.verification.verify(&user.id, &code).await;
        assert!(matches!(replay, Err(VerificationError::AlreadyVerified)));

        let record: EmailVerification = sqlx::query_as(
            "SELECT id, user_id, code_hash, message_id, unsubscribe_token, created_at, \
             consumed_at, verified_at FROM email_verifications WHERE user_id = ?",
        )
        .bind(&user.id)
        .fetch_one(ctx.db.pool())
        .await
        .unwrap();
        assert!(record.code_hash.is_none());
        assert!(record.verified_at.is_some());
        assert!(record.message_id.is_some());
        assert!(record.unsubscribe_token.is_some());
    }

    #[tokio::test]
    async fn test_code_is_stored_hashed() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let code = ctx.mailer.last_code().unwrap();
        let active = ctx.verification.pending_challenge(&user.id).await.unwrap().unwrap();

        let stored = active.code_hash.unwrap();
        assert_ne!(stored, code);
        assert!(bcrypt::verify(&code, &stored).unwrap());
    }

    #[tokio::test]
    async fn test_wrong_code_is_rejected_and_challenge_survives() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let code = ctx.mailer.last_code().unwrap();
        let wrong = if code == "000000" { "111111" } else { "000000" };

        let result = ctx.verification.verify(&user.id, wrong).await;
        assert!(matches!(result, Err(VerificationError::InvalidOrExpired)));
        let result = ctx.verification.verify(&user.id, "abc").await;
        assert!(matches!(result, Err(VerificationError::InvalidOrExpired)));

        assert!(ctx.verification.verify(&user.id, &code).await.is_ok());
    }

    #[tokio::test]
    async fn test_resend_inside_cooldown_is_rate_limited() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let first_code = ctx.mailer.last_code().unwrap();

        match ctx.verification.resend(&user.id).await {
            Err(VerificationError::TooManyRequests { retry_after_secs }) => {
                assert!(retry_after_secs > 0 && retry_after_secs <= 120);
            }
            other => panic!("expected TooManyRequests, got {other:?}"),
        }
        assert_eq!(ctx.mailer.sent_count(), 1);

        backdate_challenges(&ctx.db, &user.id, Duration::seconds(121)).await;
        ctx.verification.resend(&user.id).await.unwrap();
        let second_code = ctx.mailer.last_code().unwrap();
        assert_eq!(ctx.mailer.sent_count(), 2);
        assert_eq!(record_count(&ctx.db, &user.id).await, 2);

        // Codes collide one time in a million.
        if first_code != second_code {
            let stale = ctx.verification.verify(&user.id, &first_code).await;
            assert!(matches!(stale, Err(VerificationError::InvalidOrExpired)));
        }
        assert!(ctx.verification.verify(&user.id, &second_code).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_code_is_consumed_unverified() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let code = ctx.mailer.last_code().unwrap();
        backdate_challenges(&ctx.db, &user.id, Duration::hours(24) + Duration::seconds(1)).await;

        let result = ctx.verification.verify(&user.id, &code).await;
        assert!(matches!(result, Err(VerificationError::InvalidOrExpired)));

        assert!(ctx.verification.pending_challenge(&user.id).await.unwrap().is_none());
        let result = ctx.verification.verify(&user.id, &code).await;
        assert!(matches!(result, Err(VerificationError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_configured_ttl_governs_email_and_expiry() {
        let mut config = crate::config::Config::for_tests();
        config.verification.ttl_hours = 6;
        let ctx = TestContext::with_config(config).await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let sent = ctx.mailer.last().unwrap();
        assert_eq!(sent.expires_in_hours, 6);

        backdate_challenges(&ctx.db, &user.id, Duration::hours(6) + Duration::seconds(1)).await;
        let result = ctx.verification.verify(&user.id, &sent.code).await;
        assert!(matches!(result, Err(VerificationError::InvalidOrExpired)));
    }

    #[tokio::test]
    async fn test_challenge_superseded_after_read_is_not_consumed() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        let stale = ctx.verification.pending_challenge(&user.id).await.unwrap().unwrap();

        backdate_challenges(&ctx.db, &user.id, Duration::seconds(121)).await;
        ctx.verification.resend(&user.id).await.unwrap();

        let result = ctx
            .verification
            .consume_challenge(&user.id, &stale.id, Utc::now())
            .await;
        assert!(matches!(result, Err(VerificationError::InvalidOrExpired)));

        let mut conn = ctx.db.pool().acquire().await.unwrap();
        let reloaded = UserRepository::get_user_by_id(&mut conn, &user.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!reloaded.email_verified);
    }

    #[tokio::test]
    async fn test_resend_preconditions() {
        let ctx = TestContext::new().await;

        let result = ctx.verification.resend("missing").await;
        assert!(matches!(result, Err(VerificationError::UserNotFound)));

        let user = create_user(&ctx.db, "pub", Role::Publisher).await;
        sqlx::query("UPDATE users SET email = NULL WHERE id = ?")
            .bind(&user.id)
            .execute(ctx.db.pool())
            .await
            .unwrap();
        let result = ctx.verification.resend(&user.id).await;
        assert!(matches!(result, Err(VerificationError::NoEmail)));

        let verified = create_user(&ctx.db, "done", Role::Publisher).await;
        let mut conn = ctx.db.pool().acquire().await.unwrap();
        UserRepository::mark_email_verified(&mut conn, &verified.id).await.unwrap();
        drop(conn);
        let result = ctx.verification.resend(&verified.id).await;
        assert!(matches!(result, Err(VerificationError::AlreadyVerified)));
    }

    #[tokio::test]
    async fn test_verify_without_challenge() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        let result = ctx.verification.verify(&user.id, "123456").await;
        assert!(matches!(result, Err(VerificationError::ChallengeNotFound)));
    }

    #[tokio::test]
    async fn test_delivery_retries_transient_failures() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;
        ctx.mailer.fail_next(2);

        ctx.verification.resend(&user.id).await.unwrap();
        assert_eq!(ctx.mailer.attempts(), 3);
        assert_eq!(ctx.mailer.sent_count(), 1);
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_record() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;
        ctx.mailer.fail_next(u32::MAX);

        let result = ctx.verification.resend(&user.id).await;
        assert!(matches!(result, Err(VerificationError::Delivery(_))));

        let active = ctx.verification.pending_challenge(&user.id).await.unwrap();
        let active = active.unwrap();
        assert!(active.message_id.is_none());
        assert!(active.code_hash.is_some());
        assert!(active.consumed_at.is_none());
    }

    #[tokio::test]
    async fn test_disabled_verification_is_noop() {
        let mut config = crate::config::Config::for_tests();
        config.verification.enabled = false;
        let ctx = TestContext::with_config(config).await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;

        ctx.verification.resend(&user.id).await.unwrap();
        assert_eq!(ctx.mailer.sent_count(), 0);
        assert_eq!(record_count(&ctx.db, &user.id).await, 0);
    }
}
