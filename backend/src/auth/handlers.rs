//! Handler functions for authentication-related API endpoints.
//!
//! These functions parse request data and hand it to `auth::service`, which
//! owns validation and the business rules.

use crate::api::common::{ApiResponse, HttpError, service_error_to_http};
use crate::auth::models::*;
use crate::auth::service::AuthService;
use crate::utils::jwt::AccessClaims;
use axum::{
    extract::{Extension, Json},
    response::Json as ResponseJson,
};
use std::sync::Arc;

type AuthResult<T> = Result<ResponseJson<ApiResponse<T>>, HttpError>;

#[axum::debug_handler]
pub async fn sign_up(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<SignUpRequest>,
) -> AuthResult<AuthResponse> {
    match auth_service.sign_up(payload).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(
            response,
            "Account created successfully",
        ))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn sign_in(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<SignInRequest>,
) -> AuthResult<AuthResponse> {
    match auth_service.sign_in(payload).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(response, "Signed in"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn oauth_sign_in(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<OAuthSignInRequest>,
) -> AuthResult<AuthResponse> {
    match auth_service.oauth_sign_in(payload).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(response, "Signed in"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

/// Handle token refresh request
#[axum::debug_handler]
pub async fn refresh_token(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<RefreshTokenRequest>,
) -> AuthResult<AuthResponse> {
    match auth_service.refresh(payload).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(response, "Token refreshed"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn logout(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Json(payload): Json<LogoutRequest>,
) -> AuthResult<()> {
    match auth_service.logout(payload).await {
        Ok(()) => Ok(ResponseJson(ApiResponse::success((), "Logged out successfully"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

/// Get current user information from token
#[axum::debug_handler]
pub async fn me(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
) -> AuthResult<UserInfo> {
    match auth_service.me(&claims).await {
        Ok(user) => Ok(ResponseJson(ApiResponse::success(user, "Current user"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn update_profile(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
    Json(payload): Json<UpdateProfileRequest>,
) -> AuthResult<UserInfo> {
    match auth_service.update_profile(claims.user_id(), payload).await {
        Ok(user) => Ok(ResponseJson(ApiResponse::success(user, "Profile updated"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn change_password(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
    Json(payload): Json<ChangePasswordRequest>,
) -> AuthResult<()> {
    match auth_service.change_password(claims.user_id(), payload).await {
        Ok(()) => Ok(ResponseJson(ApiResponse::success(
            (),
            "Password changed, all sessions signed out",
        ))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn delete_account(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
) -> AuthResult<()> {
    match auth_service.delete_account(claims.user_id()).await {
        Ok(()) => Ok(ResponseJson(ApiResponse::success((), "Account deleted"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn verify_email(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
    Json(payload): Json<VerifyEmailRequest>,
) -> AuthResult<VerifyEmailResponse> {
    match auth_service.verify_email(claims.user_id(), payload).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(response, "Email verified"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}

#[axum::debug_handler]
pub async fn resend_verification(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Extension(claims): Extension<AccessClaims>,
) -> AuthResult<()> {
    match auth_service.resend_verification(claims.user_id()).await {
        Ok(()) => Ok(ResponseJson(ApiResponse::success((), "Verification email sent"))),
        Err(error) => Err(service_error_to_http(error)),
    }
}
