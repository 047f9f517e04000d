//! Core business logic for the authentication system.
//!
//! `AuthService` is the session facade: it composes the access token issuer,
//! refresh token rotation and the email verification lifecycle into the
//! account use cases, and folds their typed errors into [`ServiceError`].

use sqlx::SqliteConnection;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

use crate::auth::models::*;
use crate::database::Database;
use crate::database::models::{CreateUser, Role, User};
use crate::errors::{ServiceError, ServiceResult, is_unique_violation};
use crate::repositories::email_unsubscribe_repository::EmailUnsubscribeRepository;
use crate::repositories::user_repository::UserRepository;
use crate::services::company_directory::CompanyDirectory;
use crate::services::email_verification_service::EmailVerificationService;
use crate::services::oauth_service::{OAuthIdentity, OAuthVerifier};
use crate::services::refresh_token_service::{IssuedRefreshToken, RefreshTokenService};
use crate::utils::jwt::{AccessClaims, AccessTokenIssuer};
use crate::utils::random::{generate_token_secret, generate_verification_code};
use crate::utils::unsubscribe::UnsubscribeCodec;

/// Longest handle derived from an OAuth profile before suffixing.
const DERIVED_HANDLE_MAX: usize = 24;
const HANDLE_ATTEMPTS: usize = 8;

pub struct AuthService {
    db: Database,
    issuer: Arc<AccessTokenIssuer>,
    refresh_tokens: Arc<RefreshTokenService>,
    verification: Arc<EmailVerificationService>,
    unsubscribe: UnsubscribeCodec,
    oauth: Option<Arc<dyn OAuthVerifier>>,
    companies: Arc<dyn CompanyDirectory>,
    password_hash_cost: u32,
    /// Compared against when sign-in finds no password hash, so a miss costs
    /// the same bcrypt work as a wrong password.
    dummy_password_hash: Option<String>,
}

/// Collaborators the facade is built from.
pub struct AuthDependencies {
    pub db: Database,
    pub issuer: Arc<AccessTokenIssuer>,
    pub refresh_tokens: Arc<RefreshTokenService>,
    pub verification: Arc<EmailVerificationService>,
    pub unsubscribe: UnsubscribeCodec,
    pub oauth: Option<Arc<dyn OAuthVerifier>>,
    pub companies: Arc<dyn CompanyDirectory>,
    pub password_hash_cost: u32,
}

/// Turns `validator` output into a single validation error.
fn validate_request<T: Validate>(request: &T) -> ServiceResult<()> {
    request.validate().map_err(|validation_errors| {
        let error_messages: Vec<String> = validation_errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |error| {
                    format!(
                        "{}: {}",
                        field,
                        error.message.as_ref().unwrap_or(&"Invalid value".into())
                    )
                })
            })
            .collect();
        ServiceError::validation(error_messages.join(", "))
    })
}

/// Lowercased ASCII handle built from an OAuth profile field.
fn derive_handle(source: &str) -> String {
    let handle: String = source
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.')
        .take(DERIVED_HANDLE_MAX)
        .collect::<String>()
        .to_ascii_lowercase();

    if handle.len() < 3 { "user".to_string() } else { handle }
}

impl AuthService {
    pub fn new(deps: AuthDependencies) -> Self {
        let dummy_password_hash =
            bcrypt::hash(generate_token_secret(), deps.password_hash_cost).ok();

        AuthService {
            db: deps.db,
            issuer: deps.issuer,
            refresh_tokens: deps.refresh_tokens,
            verification: deps.verification,
            unsubscribe: deps.unsubscribe,
            oauth: deps.oauth,
            companies: deps.companies,
            password_hash_cost: deps.password_hash_cost,
            dummy_password_hash,
        }
    }

    /// Validates a bearer token for the request middleware.
    pub fn authenticate(&self, token: &str) -> ServiceResult<AccessClaims> {
        Ok(self.issuer.validate(token)?)
    }

    fn hash_password(&self, password: &str) -> ServiceResult<String> {
        bcrypt::hash(password, self.password_hash_cost)
            .map_err(|e| ServiceError::internal_error(format!("Failed to hash password: {e}")))
    }

    fn session_response(
        &self,
        user: &User,
        refresh_token: IssuedRefreshToken,
    ) -> ServiceResult<AuthResponse> {
        let access_token = self.issuer.issue_for_user(user)?;

        Ok(AuthResponse {
            access_token,
            refresh_token: refresh_token.secret,
            token_type: "Bearer",
            expires_in: self.issuer.ttl_seconds(),
            refresh_expires_at: refresh_token.expires_at,
            user: UserInfo::from(user),
        })
    }

    /// Best-effort challenge for users who must verify. Never fails the
    /// surrounding operation.
    async fn start_verification(&self, user: &User) {
        let Some(email) = user.email.as_deref() else {
            return;
        };
        if let Err(e) = self
            .verification
            .send_challenge(&user.id, email, &user.username)
            .await
        {
            warn!(user_id = %user.id, "could not start email verification: {e}");
        }
    }

    async fn load_user(&self, user_id: &str) -> ServiceResult<User> {
        let mut conn = self.db.pool().acquire().await?;
        UserRepository::get_user_by_id(&mut conn, user_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", user_id))
    }

    /// Registers a password account and signs it in.
    pub async fn sign_up(&self, request: SignUpRequest) -> ServiceResult<AuthResponse> {
        validate_request(&request)?;

        let role = request.role.unwrap_or(Role::User);
        let email = request.email.map(|e| e.trim().to_ascii_lowercase());
        if role == Role::Publisher && email.is_none() {
            return Err(ServiceError::validation("email: Publishers must provide an email"));
        }

        {
            let mut conn = self.db.pool().acquire().await?;
            if UserRepository::username_exists(&mut conn, &request.username).await? {
                return Err(ServiceError::already_exists("User", &request.username));
            }
            if UserRepository::display_name_exists(&mut conn, &request.display_name, None).await? {
                return Err(ServiceError::already_exists("Display name", &request.display_name));
            }
            if let Some(email) = email.as_deref() {
                if UserRepository::get_user_by_email(&mut conn, email).await?.is_some() {
                    return Err(ServiceError::already_exists("Email", email));
                }
            }
        }

        if role == Role::Publisher && self.companies.company_exists(&request.display_name).await? {
            return Err(ServiceError::already_exists("Company", &request.display_name));
        }

        let password_hash = self.hash_password(&request.password)?;

        let mut tx = self.db.begin_write().await?;
        let user = UserRepository::create_user(
            &mut tx,
            CreateUser {
                username: request.username.clone(),
                display_name: request.display_name,
                email,
                email_verified: false,
                role,
                password_hash: Some(password_hash),
                oauth_provider: None,
                oauth_subject: None,
            },
        )
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                ServiceError::already_exists("User", &request.username)
            } else {
                e.into()
            }
        })?;
        let refresh_token = self.refresh_tokens.issue(&mut tx, &user.id).await?;
        tx.commit().await?;

        info!(user_id = %user.id, role = %user.role, "user signed up");

        if user.verification_required() {
            self.start_verification(&user).await;
        }

        self.session_response(&user, refresh_token)
    }

    /// Password sign-in. Unknown user and wrong password are not told apart.
    pub async fn sign_in(&self, request: SignInRequest) -> ServiceResult<AuthResponse> {
        validate_request(&request)?;

        let mut conn = self.db.pool().acquire().await?;
        let user = UserRepository::get_user_by_username(&mut conn, &request.username).await?;

        let authenticated = match user.as_ref().and_then(|u| u.password_hash.as_deref()) {
            Some(hash) => bcrypt::verify(&request.password, hash).unwrap_or(false),
            None => {
                if let Some(dummy) = self.dummy_password_hash.as_deref() {
                    let _ = bcrypt::verify(&request.password, dummy);
                }
                false
            }
        };
        let user = match user {
            Some(user) if authenticated => user,
            _ => {
                info!("sign-in rejected");
                return Err(ServiceError::invalid_credentials("Invalid username or password"));
            }
        };

        let refresh_token = self.refresh_tokens.issue(&mut conn, &user.id).await?;
        drop(conn);
        info!(user_id = %user.id, "user signed in");

        if user.verification_required() && self.verification.is_enabled() {
            match self.verification.pending_challenge(&user.id).await {
                Ok(Some(_)) => {}
                Ok(None) => self.start_verification(&user).await,
                Err(e) => warn!(user_id = %user.id, "could not check pending verification: {e}"),
            }
        }

        self.session_response(&user, refresh_token)
    }

    /// Signs in with a provider ID token, creating or linking the account on
    /// first use.
    pub async fn oauth_sign_in(&self, request: OAuthSignInRequest) -> ServiceResult<AuthResponse> {
        validate_request(&request)?;

        let verifier = self
            .oauth
            .as_ref()
            .ok_or_else(|| ServiceError::invalid_operation("OAuth sign-in is not configured"))?;
        let identity = verifier
            .verify_id_token(&request.id_token, verifier.audience())
            .await?;

        let mut tx = self.db.begin_write().await?;
        let user = self.resolve_oauth_user(&mut tx, &identity).await?;
        let refresh_token = self.refresh_tokens.issue(&mut tx, &user.id).await?;
        tx.commit().await?;

        info!(user_id = %user.id, provider = %identity.provider, "user signed in with OAuth");
        self.session_response(&user, refresh_token)
    }

    async fn resolve_oauth_user(
        &self,
        conn: &mut SqliteConnection,
        identity: &OAuthIdentity,
    ) -> ServiceResult<User> {
        if let Some(user) =
            UserRepository::get_user_by_oauth_identity(conn, &identity.provider, &identity.subject)
                .await?
        {
            return Ok(user);
        }

        let email = identity.email.as_deref().map(str::to_ascii_lowercase);

        if let Some(email) = email.as_deref() {
            if let Some(existing) = UserRepository::get_user_by_email(conn, email).await? {
                // An unverified address may belong to someone else entirely.
                if existing.oauth_provider.is_some() || !existing.email_verified {
                    warn!(user_id = %existing.id, "refusing to link OAuth identity to account");
                    return Err(ServiceError::already_exists("Email", email));
                }
                info!(user_id = %existing.id, provider = %identity.provider, "linking OAuth identity");
                return UserRepository::link_oauth_identity(
                    conn,
                    &existing.id,
                    &identity.provider,
                    &identity.subject,
                )
                .await?
                .ok_or_else(|| ServiceError::not_found("User", &existing.id));
            }
        }

        let base = email
            .as_deref()
            .and_then(|e| e.split('@').next())
            .or(identity.name.as_deref())
            .unwrap_or("user");
        let username = Self::available_username(conn, &derive_handle(base)).await?;
        let display_name = Self::available_display_name(
            conn,
            identity.name.as_deref().unwrap_or(&username),
        )
        .await?;

        let user = UserRepository::create_user(
            conn,
            CreateUser {
                username,
                display_name,
                email_verified: email.is_some(),
                email,
                role: Role::User,
                password_hash: None,
                oauth_provider: Some(identity.provider.clone()),
                oauth_subject: Some(identity.subject.clone()),
            },
        )
        .await?;

        info!(user_id = %user.id, provider = %identity.provider, "user created from OAuth identity");
        Ok(user)
    }

    async fn available_username(conn: &mut SqliteConnection, base: &str) -> ServiceResult<String> {
        let mut candidate = base.to_string();
        for _ in 0..HANDLE_ATTEMPTS {
            if !UserRepository::username_exists(conn, &candidate).await? {
                return Ok(candidate);
            }
            candidate = format!("{base}{}", generate_verification_code());
        }
        Err(ServiceError::already_exists("User", base))
    }

    async fn available_display_name(
        conn: &mut SqliteConnection,
        base: &str,
    ) -> ServiceResult<String> {
        let mut candidate = base.to_string();
        for _ in 0..HANDLE_ATTEMPTS {
            if !UserRepository::display_name_exists(conn, &candidate, None).await? {
                return Ok(candidate);
            }
            candidate = format!("{base} {}", generate_verification_code());
        }
        Err(ServiceError::already_exists("Display name", base))
    }

    /// Rotates a refresh token into a new token pair.
    pub async fn refresh(&self, request: RefreshTokenRequest) -> ServiceResult<AuthResponse> {
        validate_request(&request)?;

        let rotated = self.refresh_tokens.refresh(&request.refresh_token).await?;

        Ok(AuthResponse {
            access_token: rotated.access_token,
            refresh_token: rotated.refresh_token.secret,
            token_type: "Bearer",
            expires_in: self.issuer.ttl_seconds(),
            refresh_expires_at: rotated.refresh_token.expires_at,
            user: UserInfo::from(&rotated.user),
        })
    }

    pub async fn logout(&self, request: LogoutRequest) -> ServiceResult<()> {
        validate_request(&request)?;
        self.refresh_tokens.revoke(&request.refresh_token).await?;
        Ok(())
    }

    pub async fn me(&self, claims: &AccessClaims) -> ServiceResult<UserInfo> {
        let user = self.load_user(claims.user_id()).await?;
        Ok(UserInfo::from(&user))
    }

    pub async fn update_profile(
        &self,
        user_id: &str,
        request: UpdateProfileRequest,
    ) -> ServiceResult<UserInfo> {
        validate_request(&request)?;

        let mut tx = self.db.begin_write().await?;
        if UserRepository::display_name_exists(&mut tx, &request.display_name, Some(user_id)).await?
        {
            return Err(ServiceError::already_exists("Display name", &request.display_name));
        }
        let updated = UserRepository::update_display_name(&mut tx, user_id, &request.display_name)
            .await?
            .ok_or_else(|| ServiceError::not_found("User", user_id))?;
        tx.commit().await?;

        info!(user_id, "display name updated");
        Ok(UserInfo::from(&updated))
    }

    /// Replaces the password and signs out every session of the user.
    pub async fn change_password(
        &self,
        user_id: &str,
        request: ChangePasswordRequest,
    ) -> ServiceResult<()> {
        validate_request(&request)?;

        let user = self.load_user(user_id).await?;
        let current_hash = user.password_hash.as_deref().ok_or_else(|| {
            ServiceError::invalid_operation("Account signs in through an OAuth provider")
        })?;
        if !bcrypt::verify(&request.current_password, current_hash).unwrap_or(false) {
            return Err(ServiceError::invalid_credentials("Current password is incorrect"));
        }

        let new_hash = self.hash_password(&request.new_password)?;

        let mut tx = self.db.begin_write().await?;
        UserRepository::update_password_hash(&mut tx, user_id, &new_hash).await?;
        self.refresh_tokens.revoke_all(&mut tx, user_id).await?;
        tx.commit().await?;

        info!(user_id, "password changed");
        Ok(())
    }

    /// Deletes the account. Refresh tokens and verification records cascade.
    pub async fn delete_account(&self, user_id: &str) -> ServiceResult<()> {
        let mut tx = self.db.begin_write().await?;
        if !UserRepository::delete_user(&mut tx, user_id).await? {
            return Err(ServiceError::not_found("User", user_id));
        }
        tx.commit().await?;

        info!(user_id, "account deleted");
        Ok(())
    }

    pub async fn verify_email(
        &self,
        user_id: &str,
        request: VerifyEmailRequest,
    ) -> ServiceResult<VerifyEmailResponse> {
        validate_request(&request)?;

        let user = self.verification.verify(user_id, &request.code).await?;
        let access_token = self.issuer.issue_for_user(&user)?;

        Ok(VerifyEmailResponse {
            access_token,
            expires_in: self.issuer.ttl_seconds(),
            user: UserInfo::from(&user),
        })
    }

    pub async fn resend_verification(&self, user_id: &str) -> ServiceResult<()> {
        Ok(self.verification.resend(user_id).await?)
    }

    /// Redeems an unsubscribe link. Repeat redemptions succeed.
    pub async fn unsubscribe(&self, token: &str) -> ServiceResult<UnsubscribeResponse> {
        let email = self.unsubscribe.decode(token)?;

        let mut conn = self.db.pool().acquire().await?;
        let newly_unsubscribed = EmailUnsubscribeRepository::insert_if_absent(&mut conn, &email)
            .await
            .map_err(|e| {
                error!("failed to record unsubscribe: {e}");
                ServiceError::from(e)
            })?;

        if newly_unsubscribed {
            info!("email address unsubscribed");
        }

        Ok(UnsubscribeResponse {
            email,
            newly_unsubscribed,
        })
    }
}
