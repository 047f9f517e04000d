//! Request and response shapes for the authentication endpoints.
//!
//! Requests are checked with `validator` before any store access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::database::models::{Role, User};
use crate::utils::random::is_verification_code;

fn validate_username(username: &str) -> Result<(), ValidationError> {
    if username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
    {
        Ok(())
    } else {
        Err(ValidationError::new("username_charset").with_message(
            "Username may only contain letters, digits, '.', '_' and '-'".into(),
        ))
    }
}

fn validate_code(code: &str) -> Result<(), ValidationError> {
    if is_verification_code(code) {
        Ok(())
    } else {
        Err(ValidationError::new("verification_code")
            .with_message("Verification code must be 6 digits".into()))
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignUpRequest {
    #[validate(
        length(min = 3, max = 32, message = "Username must be 3 to 32 characters"),
        custom(function = "validate_username")
    )]
    pub username: String,

    #[validate(length(min = 1, max = 64, message = "Display name must be 1 to 64 characters"))]
    pub display_name: String,

    #[validate(email(message = "Invalid email format"))]
    pub email: Option<String>,

    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    pub password: String,

    /// Defaults to `user`.
    #[serde(default)]
    pub role: Option<Role>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct SignInRequest {
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,

    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct OAuthSignInRequest {
    #[validate(length(min = 1, message = "ID token is required"))]
    pub id_token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshTokenRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct LogoutRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,

    #[validate(length(min = 8, max = 128, message = "Password must be 8 to 128 characters"))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct UpdateProfileRequest {
    #[validate(length(min = 1, max = 64, message = "Display name must be 1 to 64 characters"))]
    pub display_name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct VerifyEmailRequest {
    #[validate(custom(function = "validate_code"))]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeQuery {
    pub token: String,
}

/// Public view of a user.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub role: Role,
    pub verification_required: bool,
}

impl From<&User> for UserInfo {
    fn from(user: &User) -> Self {
        UserInfo {
            id: user.id.clone(),
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            email: user.email.clone(),
            email_verified: user.email_verified,
            role: user.role,
            verification_required: user.verification_required(),
        }
    }
}

/// Token pair handed out by sign-up, sign-in and refresh.
#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
    /// Access token lifetime in seconds
    pub expires_in: i64,
    pub refresh_expires_at: DateTime<Utc>,
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct VerifyEmailResponse {
    /// Re-minted so the verification flag is cleared right away.
    pub access_token: String,
    pub expires_in: i64,
    pub user: UserInfo,
}

#[derive(Debug, Serialize)]
pub struct UnsubscribeResponse {
    pub email: String,
    /// False when the address had already opted out.
    pub newly_unsubscribed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_up_validation() {
        let valid = SignUpRequest {
            username: "alice_01".to_string(),
            display_name: "Alice".to_string(),
            email: Some("alice@example.com".to_string()),
            password: "long enough".to_string(),
            role: None,
        };
        assert!(valid.validate().is_ok());

        let bad = SignUpRequest {
            username: "a b".to_string(),
            display_name: String::new(),
            email: Some("not-an-email".to_string()),
            password: "short".to_string(),
            role: Some(Role::Publisher),
        };
        let errors = bad.validate().unwrap_err();
        let fields = errors.field_errors();
        assert!(fields.contains_key("username"));
        assert!(fields.contains_key("display_name"));
        assert!(fields.contains_key("email"));
        assert!(fields.contains_key("password"));
    }

    #[test]
    fn test_verification_code_validation() {
        assert!(VerifyEmailRequest { code: "012345".to_string() }.validate().is_ok());
        assert!(VerifyEmailRequest { code: "12345".to_string() }.validate().is_err());
        assert!(VerifyEmailRequest { code: "12345a".to_string() }.validate().is_err());
    }

    #[test]
    fn test_role_defaults_when_absent() {
        let request: SignUpRequest = serde_json::from_str(
            r#"{"username":"bob","display_name":"Bob","password":"password123"}"#,
        )
        .unwrap();
        assert_eq!(request.role, None);
        assert_eq!(request.email, None);

        let request: SignUpRequest = serde_json::from_str(
            r#"{"username":"acme","display_name":"Acme","password":"password123","role":"publisher","email":"a@b.com"}"#,
        )
        .unwrap();
        assert_eq!(request.role, Some(Role::Publisher));
    }
}
