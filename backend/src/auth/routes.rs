//! Defines the HTTP routes specifically for authentication.
//!
//! These are designed to be nested under `/auth` in the main Axum router.

use crate::auth::handlers::*;
use crate::auth::middleware::*;
use axum::{
    Router, middleware,
    routing::{delete, get, post, put},
};

/// Creates the authentication router with all auth-related routes
pub fn auth_router() -> Router {
    Router::new()
        .route("/signup", post(sign_up))
        .route("/signin", post(sign_in))
        .route("/oauth", post(oauth_sign_in))
        .route("/refresh", post(refresh_token))
        .route("/logout", post(logout))
        .route("/me", get(me).layer(middleware::from_fn(jwt_auth)))
        .route(
            "/profile",
            put(update_profile).layer(middleware::from_fn(jwt_auth)),
        )
        .route(
            "/password",
            post(change_password).layer(middleware::from_fn(jwt_auth)),
        )
        .route(
            "/account",
            delete(delete_account).layer(middleware::from_fn(jwt_auth)),
        )
        .route(
            "/verify-email",
            post(verify_email).layer(middleware::from_fn(jwt_auth)),
        )
        .route(
            "/resend-verification",
            post(resend_verification).layer(middleware::from_fn(jwt_auth)),
        )
}
