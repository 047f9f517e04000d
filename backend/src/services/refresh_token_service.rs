//! Refresh token issuing, rotation and revocation.
//!
//! A refresh secret is exchanged at most once. Rotation looks the row up
//! inside a write transaction, deletes it and inserts its replacement before
//! committing, so a second exchange of the same secret finds nothing and is
//! indistinguishable from an unknown token.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::RefreshTokenConfig;
use crate::database::Database;
use crate::database::models::User;
use crate::errors::ServiceError;
use crate::repositories::refresh_token_repository::RefreshTokenRepository;
use crate::repositories::user_repository::UserRepository;
use crate::utils::crypto::hash_refresh_token;
use crate::utils::jwt::{AccessTokenError, AccessTokenIssuer};
use crate::utils::random::generate_token_secret;

#[derive(Debug, Error)]
pub enum RefreshTokenError {
    #[error("refresh token not found")]
    NotFound,
    #[error("refresh token expired")]
    Expired,
    #[error(transparent)]
    AccessToken(#[from] AccessTokenError),
    #[error("credential store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<RefreshTokenError> for ServiceError {
    fn from(error: RefreshTokenError) -> Self {
        match error {
            RefreshTokenError::NotFound => ServiceError::invalid_credentials("Invalid refresh token"),
            RefreshTokenError::Expired => ServiceError::expired("Refresh token has expired"),
            RefreshTokenError::AccessToken(e) => e.into(),
            RefreshTokenError::Store(e) => e.into(),
        }
    }
}

/// A newly issued opaque refresh secret. The secret is only ever held here
/// and by the client.
#[derive(Debug, Clone)]
pub struct IssuedRefreshToken {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

/// Result of a successful rotation.
#[derive(Debug, Clone)]
pub struct RotatedSession {
    pub user: User,
    pub access_token: String,
    pub refresh_token: IssuedRefreshToken,
}

pub struct RefreshTokenService {
    db: Database,
    issuer: Arc<AccessTokenIssuer>,
    pepper: String,
    ttl: Duration,
}

impl RefreshTokenService {
    pub fn new(db: Database, issuer: Arc<AccessTokenIssuer>, config: &RefreshTokenConfig) -> Self {
        Self {
            db,
            issuer,
            pepper: config.pepper.clone(),
            ttl: Duration::days(config.ttl_days),
        }
    }

    fn hash(&self, secret: &str) -> String {
        hash_refresh_token(&self.pepper, secret)
    }

    /// Creates a token row for the user on the given connection.
    ///
    /// Takes the connection so sign-up can issue inside the transaction that
    /// creates the user.
    pub async fn issue(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> Result<IssuedRefreshToken, RefreshTokenError> {
        let secret = generate_token_secret();
        let expires_at = Utc::now() + self.ttl;
        RefreshTokenRepository::create_token(conn, user_id, &self.hash(&secret), expires_at).await?;

        Ok(IssuedRefreshToken { secret, expires_at })
    }

    /// Exchanges a refresh secret for a new access token and a new secret.
    pub async fn refresh(&self, secret: &str) -> Result<RotatedSession, RefreshTokenError> {
        let token_hash = self.hash(secret);
        let mut tx = self.db.begin_write().await?;

        let Some(row) = RefreshTokenRepository::get_and_lock(&mut tx, &token_hash).await? else {
            debug!("refresh token not found");
            return Err(RefreshTokenError::NotFound);
        };

        if row.is_expired_at(Utc::now()) {
            drop(tx);
            info!(token_id = %row.id, user_id = %row.user_id, "refresh token expired");
            self.discard(&row.id).await;
            return Err(RefreshTokenError::Expired);
        }

        let Some(user) = UserRepository::get_user_by_id(&mut tx, &row.user_id).await? else {
            drop(tx);
            info!(token_id = %row.id, "refresh token owner no longer exists");
            self.discard(&row.id).await;
            return Err(RefreshTokenError::NotFound);
        };

        RefreshTokenRepository::delete_by_id(&mut tx, &row.id).await?;
        let refresh_token = self.issue(&mut tx, &user.id).await?;
        let access_token = self.issuer.issue_for_user(&user)?;

        tx.commit().await?;
        debug!(user_id = %user.id, "refresh token rotated");

        Ok(RotatedSession {
            user,
            access_token,
            refresh_token,
        })
    }

    /// Deletes the row for this secret. Unknown secrets are not an error.
    pub async fn revoke(&self, secret: &str) -> Result<(), RefreshTokenError> {
        let mut conn = self.db.pool().acquire().await?;
        let removed = RefreshTokenRepository::delete_by_hash(&mut conn, &self.hash(secret)).await?;
        debug!(removed, "refresh token revoked");
        Ok(())
    }

    /// Deletes every token of the user on the given connection.
    pub async fn revoke_all(
        &self,
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> Result<u64, RefreshTokenError> {
        let removed = RefreshTokenRepository::delete_by_user_id(conn, user_id).await?;
        info!(user_id, removed, "revoked all refresh tokens");
        Ok(removed)
    }

    /// Bulk-deletes every expired row.
    pub async fn sweep_expired(&self) -> Result<u64, RefreshTokenError> {
        let mut conn = self.db.pool().acquire().await?;
        let removed = RefreshTokenRepository::delete_expired(&mut conn, Utc::now()).await?;
        if removed > 0 {
            info!(removed, "swept expired refresh tokens");
        }
        Ok(removed)
    }

    /// Best-effort removal of a row found invalid during refresh.
    async fn discard(&self, token_id: &str) {
        let result = async {
            let mut conn = self.db.pool().acquire().await?;
            RefreshTokenRepository::delete_by_id(&mut conn, token_id).await
        }
        .await;

        if let Err(e) = result {
            warn!(token_id, "failed to delete invalid refresh token: {e}");
        }
    }
}

/// Runs `sweep_expired` forever at the given interval.
pub fn spawn_expiry_sweeper(
    service: Arc<RefreshTokenService>,
    interval_seconds: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(interval_seconds.max(1)));
        loop {
            interval.tick().await;
            if let Err(e) = service.sweep_expired().await {
                warn!("refresh token sweep failed: {e}");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::models::Role;
    use crate::test_support::{TestContext, create_user};

    async fn backdate(db: &Database, secret: &str, pepper: &str, expires_at: DateTime<Utc>) {
        sqlx::query("UPDATE refresh_tokens SET expires_at = ? WHERE token_hash = ?")
            .bind(expires_at)
            .bind(hash_refresh_token(pepper, secret))
            .execute(db.pool())
            .await
            .unwrap();
    }

    async fn token_count(db: &Database) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM refresh_tokens")
            .fetch_one(db.pool())
            .await
            .unwrap()
    }

    async fn issue_for(ctx: &TestContext, user_id: &str) -> IssuedRefreshToken {
        let mut conn = ctx.db.pool().acquire().await.unwrap();
        ctx.refresh.issue(&mut conn, user_id).await.unwrap()
    }

    #[tokio::test]
    async fn test_issue_stores_only_hash() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let issued = issue_for(&ctx, &user.id).await;

        let stored: String = sqlx::query_scalar("SELECT token_hash FROM refresh_tokens")
            .fetch_one(ctx.db.pool())
            .await
            .unwrap();
        assert_ne!(stored, issued.secret);
        assert_eq!(stored, hash_refresh_token(&ctx.config.refresh.pepper, &issued.secret));
        assert!(issued.expires_at > Utc::now() + Duration::days(29));
    }

    #[tokio::test]
    async fn test_refresh_rotates_exactly_once() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let original = issue_for(&ctx, &user.id).await;

        let rotated = ctx.refresh.refresh(&original.secret).await.unwrap();
        assert_ne!(rotated.refresh_token.secret, original.secret);
        let claims = ctx.issuer.validate(&rotated.access_token).unwrap();
        assert_eq!(claims.sub, user.id);

        let replay = ctx.refresh.refresh(&original.secret).await;
        assert!(matches!(replay, Err(RefreshTokenError::NotFound)));

        let again = ctx.refresh.refresh(&rotated.refresh_token.secret).await;
        assert!(again.is_ok());
        assert_eq!(token_count(&ctx.db).await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_refresh_has_single_winner() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let original = issue_for(&ctx, &user.id).await;

        let (first, second) = tokio::join!(
            ctx.refresh.refresh(&original.secret),
            ctx.refresh.refresh(&original.secret)
        );

        let outcomes = [first, second];
        let winners = outcomes.iter().filter(|r| r.is_ok()).count();
        let losers = outcomes
            .iter()
            .filter(|r| matches!(r, Err(RefreshTokenError::NotFound)))
            .count();
        assert_eq!(winners, 1);
        assert_eq!(losers, 1);
        assert_eq!(token_count(&ctx.db).await, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_refreshes_on_shared_store_have_single_winner() {
        const CALLERS: usize = 8;
        let dir = tempfile::tempdir().unwrap();
        let db = Database::on_disk(&dir.path().join("auth.db"), CALLERS as u32).await;
        let ctx = TestContext::with_database(crate::config::Config::for_tests(), db).await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let original = issue_for(&ctx, &user.id).await;

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let service = ctx.refresh.clone();
                let secret = original.secret.clone();
                tokio::spawn(async move { service.refresh(&secret).await })
            })
            .collect();

        let mut winners = 0;
        let mut losers = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => winners += 1,
                Err(RefreshTokenError::NotFound) => losers += 1,
                Err(other) => panic!("unexpected refresh failure: {other}"),
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(losers, CALLERS - 1);
        assert_eq!(token_count(&ctx.db).await, 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected_and_removed() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let issued = issue_for(&ctx, &user.id).await;
        backdate(
            &ctx.db,
            &issued.secret,
            &ctx.config.refresh.pepper,
            Utc::now() - Duration::seconds(1),
        )
        .await;

        let result = ctx.refresh.refresh(&issued.secret).await;
        assert!(matches!(result, Err(RefreshTokenError::Expired)));
        assert_eq!(token_count(&ctx.db).await, 0);
    }

    #[tokio::test]
    async fn test_unknown_secret_is_not_found() {
        let ctx = TestContext::new().await;
        let result = ctx.refresh.refresh("never-issued").await;
        assert!(matches!(result, Err(RefreshTokenError::NotFound)));
    }

    #[tokio::test]
    async fn test_refresh_mints_from_current_user_state() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "pub", Role::Publisher).await;
        let issued = issue_for(&ctx, &user.id).await;

        let before = ctx.refresh.refresh(&issued.secret).await.unwrap();
        assert!(ctx.issuer.validate(&before.access_token).unwrap().verification_required);

        let mut conn = ctx.db.pool().acquire().await.unwrap();
        UserRepository::mark_email_verified(&mut conn, &user.id).await.unwrap();
        drop(conn);

        let after = ctx.refresh.refresh(&before.refresh_token.secret).await.unwrap();
        assert!(!ctx.issuer.validate(&after.access_token).unwrap().verification_required);
    }

    #[tokio::test]
    async fn test_revoke_is_idempotent() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let issued = issue_for(&ctx, &user.id).await;

        ctx.refresh.revoke(&issued.secret).await.unwrap();
        ctx.refresh.revoke(&issued.secret).await.unwrap();
        assert!(matches!(
            ctx.refresh.refresh(&issued.secret).await,
            Err(RefreshTokenError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_revoke_all_and_sweep() {
        let ctx = TestContext::new().await;
        let alice = create_user(&ctx.db, "alice", Role::User).await;
        let bob = create_user(&ctx.db, "bob", Role::User).await;
        issue_for(&ctx, &alice.id).await;
        issue_for(&ctx, &alice.id).await;
        let stale = issue_for(&ctx, &bob.id).await;
        let fresh = issue_for(&ctx, &bob.id).await;

        let mut conn = ctx.db.pool().acquire().await.unwrap();
        assert_eq!(ctx.refresh.revoke_all(&mut conn, &alice.id).await.unwrap(), 2);
        drop(conn);

        backdate(
            &ctx.db,
            &stale.secret,
            &ctx.config.refresh.pepper,
            Utc::now() - Duration::hours(1),
        )
        .await;
        assert_eq!(ctx.refresh.sweep_expired().await.unwrap(), 1);
        assert!(ctx.refresh.refresh(&fresh.secret).await.is_ok());
    }

    #[tokio::test]
    async fn test_deleted_owner_yields_not_found() {
        let ctx = TestContext::new().await;
        let user = create_user(&ctx.db, "alice", Role::User).await;
        let issued = issue_for(&ctx, &user.id).await;

        // Bypass the cascade to leave an orphaned row behind.
        sqlx::query("PRAGMA foreign_keys = OFF")
            .execute(ctx.db.pool())
            .await
            .unwrap();
        sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(&user.id)
            .execute(ctx.db.pool())
            .await
            .unwrap();

        let result = ctx.refresh.refresh(&issued.secret).await;
        assert!(matches!(result, Err(RefreshTokenError::NotFound)));
        assert_eq!(token_count(&ctx.db).await, 0);
    }
}
