//! Database repository for user management operations.
//!
//! Every method takes the connection to run on explicitly, so the caller
//! decides whether it runs inside a transaction.

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::database::models::{CreateUser, User};

const USER_COLUMNS: &str = "id, username, display_name, email, email_verified, role, \
     password_hash, oauth_provider, oauth_subject, created_at, updated_at";

/// Repository for user database operations.
pub struct UserRepository;

impl UserRepository {
    /// Creates a new user in the database.
    ///
    /// # Returns
    /// The newly created User with all fields populated
    pub async fn create_user(conn: &mut SqliteConnection, user: CreateUser) -> sqlx::Result<User> {
        let now = Utc::now();
        let query = format!(
            "INSERT INTO users (id, username, display_name, email, email_verified, role, \
             password_hash, oauth_provider, oauth_subject, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) RETURNING {USER_COLUMNS}"
        );

        sqlx::query_as::<_, User>(&query)
            .bind(Uuid::now_v7().to_string())
            .bind(user.username)
            .bind(user.display_name)
            .bind(user.email)
            .bind(user.email_verified)
            .bind(user.role)
            .bind(user.password_hash)
            .bind(user.oauth_provider)
            .bind(user.oauth_subject)
            .bind(now)
            .bind(now)
            .fetch_one(conn)
            .await
    }

    /// Retrieves a user by their unique identifier.
    pub async fn get_user_by_id(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?");
        sqlx::query_as::<_, User>(&query)
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Retrieves a user by their username.
    pub async fn get_user_by_username(
        conn: &mut SqliteConnection,
        username: &str,
    ) -> sqlx::Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE username = ?");
        sqlx::query_as::<_, User>(&query)
            .bind(username)
            .fetch_optional(conn)
            .await
    }

    /// Retrieves a user by their email.
    pub async fn get_user_by_email(
        conn: &mut SqliteConnection,
        email: &str,
    ) -> sqlx::Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?");
        sqlx::query_as::<_, User>(&query)
            .bind(email)
            .fetch_optional(conn)
            .await
    }

    /// Retrieves the user bound to an OAuth provider identity.
    pub async fn get_user_by_oauth_identity(
        conn: &mut SqliteConnection,
        provider: &str,
        subject: &str,
    ) -> sqlx::Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users WHERE oauth_provider = ? AND oauth_subject = ?"
        );
        sqlx::query_as::<_, User>(&query)
            .bind(provider)
            .bind(subject)
            .fetch_optional(conn)
            .await
    }

    /// Checks if a username already exists in the system.
    pub async fn username_exists(conn: &mut SqliteConnection, username: &str) -> sqlx::Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(conn)
            .await?;

        Ok(count > 0)
    }

    /// Checks if a display name is taken, optionally ignoring one user.
    pub async fn display_name_exists(
        conn: &mut SqliteConnection,
        display_name: &str,
        exclude_user_id: Option<&str>,
    ) -> sqlx::Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM users WHERE display_name = ? AND (? IS NULL OR id != ?)",
        )
        .bind(display_name)
        .bind(exclude_user_id)
        .bind(exclude_user_id)
        .fetch_one(conn)
        .await?;

        Ok(count > 0)
    }

    /// Flags the user's email as verified.
    ///
    /// # Returns
    /// `true` if a user row was updated
    pub async fn mark_email_verified(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<bool> {
        let result =
            sqlx::query("UPDATE users SET email_verified = 1, updated_at = ? WHERE id = ?")
                .bind(Utc::now())
                .bind(id)
                .execute(conn)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_password_hash(
        conn: &mut SqliteConnection,
        id: &str,
        password_hash: &str,
    ) -> sqlx::Result<bool> {
        let result = sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn update_display_name(
        conn: &mut SqliteConnection,
        id: &str,
        display_name: &str,
    ) -> sqlx::Result<Option<User>> {
        let query = format!(
            "UPDATE users SET display_name = ?, updated_at = ? WHERE id = ? RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&query)
            .bind(display_name)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Binds an OAuth identity to an existing account. Callers only link
    /// accounts whose email is already verified; the flag is set again here
    /// since the provider vouches for the same address.
    pub async fn link_oauth_identity(
        conn: &mut SqliteConnection,
        id: &str,
        provider: &str,
        subject: &str,
    ) -> sqlx::Result<Option<User>> {
        let query = format!(
            "UPDATE users SET oauth_provider = ?, oauth_subject = ?, email_verified = 1, \
             updated_at = ? WHERE id = ? RETURNING {USER_COLUMNS}"
        );
        sqlx::query_as::<_, User>(&query)
            .bind(provider)
            .bind(subject)
            .bind(Utc::now())
            .bind(id)
            .fetch_optional(conn)
            .await
    }

    /// Deletes a user. Refresh tokens and verification records cascade.
    pub async fn delete_user(conn: &mut SqliteConnection, id: &str) -> sqlx::Result<bool> {
        let result = sqlx::query("DELETE FROM users WHERE id = ?")
            .bind(id)
            .execute(conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
