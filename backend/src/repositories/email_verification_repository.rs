//! Database repository for email verification challenges.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::database::models::EmailVerification;

const VERIFICATION_COLUMNS: &str =
    "id, user_id, code_hash, message_id, unsubscribe_token, created_at, consumed_at, verified_at";

pub struct EmailVerificationRepository;

impl EmailVerificationRepository {
    pub async fn create_verification(
        conn: &mut SqliteConnection,
        user_id: &str,
        code_hash: &str,
        unsubscribe_token: Option<&str>,
        created_at: DateTime<Utc>,
    ) -> sqlx::Result<EmailVerification> {
        let query = format!(
            "INSERT INTO email_verifications (id, user_id, code_hash, unsubscribe_token, created_at) \
             VALUES (?, ?, ?, ?, ?) RETURNING {VERIFICATION_COLUMNS}"
        );
        sqlx::query_as::<_, EmailVerification>(&query)
            .bind(Uuid::now_v7().to_string())
            .bind(user_id)
            .bind(code_hash)
            .bind(unsubscribe_token)
            .bind(created_at)
            .fetch_one(conn)
            .await
    }

    /// Most recent record for the user that still holds a usable code.
    pub async fn get_latest_active(
        conn: &mut SqliteConnection,
        user_id: &str,
    ) -> sqlx::Result<Option<EmailVerification>> {
        let query = format!(
            "SELECT {VERIFICATION_COLUMNS} FROM email_verifications \
             WHERE user_id = ? AND code_hash IS NOT NULL AND consumed_at IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT 1"
        );
        sqlx::query_as::<_, EmailVerification>(&query)
            .bind(user_id)
            .fetch_optional(conn)
            .await
    }

    /// Marks every active record of the user as used without verifying it.
    ///
    /// # Returns
    /// Number of records that were superseded
    pub async fn supersede_active(
        conn: &mut SqliteConnection,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> sqlx::Result<u64> {
        let result = sqlx::query(
            "UPDATE email_verifications SET code_hash = NULL, consumed_at = ? \
             WHERE user_id = ? AND code_hash IS NOT NULL AND consumed_at IS NULL",
        )
        .bind(now)
        .bind(user_id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected())
    }

    /// Marks a single record used. `verified` distinguishes a successful
    /// consumption from an expiry detected on use.
    pub async fn mark_used(
        conn: &mut SqliteConnection,
        id: &str,
        verified: bool,
        now: DateTime<Utc>,
    ) -> sqlx::Result<bool> {
        let verified_at = verified.then_some(now);
        let result = sqlx::query(
            "UPDATE email_verifications SET code_hash = NULL, consumed_at = ?, verified_at = ? \
             WHERE id = ? AND code_hash IS NOT NULL AND consumed_at IS NULL",
        )
        .bind(now)
        .bind(verified_at)
        .bind(id)
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_message_id(
        conn: &mut SqliteConnection,
        id: &str,
        message_id: &str,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE email_verifications SET message_id = ? WHERE id = ?")
            .bind(message_id)
            .bind(id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
