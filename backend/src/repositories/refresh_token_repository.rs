//! Database repository for refresh token rows.
//!
//! Only keyed hashes of token secrets are ever written here.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::database::models::RefreshToken;

pub struct RefreshTokenRepository;

impl RefreshTokenRepository {
    pub async fn create_token(
        conn: &mut SqliteConnection,
        user_id: &str,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> sqlx::Result<RefreshToken> {
        sqlx::query_as::<_, RefreshToken>(
            "INSERT INTO refresh_tokens (id, user_id, token_hash, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?) \
             RETURNING id, user_id, token_hash, expires_at, created_at",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(user_id)
        .bind(token_hash)
        .bind(expires_at)
        .bind(Utc::now())
        .fetch_one(conn)
        .await
    }

    /// Looks up a token row by hash.
    ///
    /// Must run on a transaction opened with `Database::begin_write`; the
    /// write lock held by that transaction is what serializes concurrent
    /// rotations of the same row.
    pub async fn get_and_lock(
        conn: &mut SqliteConnection,
        token_hash: &str,
    ) -> sqlx::Result<Option<RefreshToken>> {
        sqlx::query_as::<_, RefreshToken>(
            "SELECT id, user_id, token_hash, expires_at, created_at \
             FROM refresh_tokens WHERE token_hash = ?",
        )
        .bind(token_hash)
        .fetch_optional(conn)
        .await
    }

    pub async fn delete_by_id(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_hash(conn: &mut SqliteConnection, token_hash: &str) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .execute(conn)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn delete_by_user_id(conn: &mut SqliteConnection, user_id: &str) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE user_id = ?")
            .bind(user_id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected())
    }

    /// Bulk-deletes every row whose expiry is at or before `now`.
    pub async fn delete_expired(conn: &mut SqliteConnection, now: DateTime<Utc>) -> sqlx::Result<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at <= ?")
            .bind(now)
            .execute(conn)
            .await?;

        Ok(result.rows_affected())
    }
}
