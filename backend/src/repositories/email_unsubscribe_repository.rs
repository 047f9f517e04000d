//! Database repository for email opt-outs.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

pub struct EmailUnsubscribeRepository;

impl EmailUnsubscribeRepository {
    /// Records an opt-out. Write-once per address; repeats are no-ops.
    ///
    /// # Returns
    /// `true` if a new record was written
    pub async fn insert_if_absent(conn: &mut SqliteConnection, email: &str) -> sqlx::Result<bool> {
        let result = sqlx::query(
            "INSERT INTO email_unsubscribes (id, email, created_at) VALUES (?, ?, ?) \
             ON CONFLICT (email) DO NOTHING",
        )
        .bind(Uuid::now_v7().to_string())
        .bind(email)
        .bind(Utc::now())
        .execute(conn)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
