//! Main entry point for the auth backend.
//!
//! This file initializes the Axum web server, sets up database connections,
//! wires the session services to their collaborators, and registers all
//! routes and middleware.

mod api;
mod auth;
mod config;
mod database;
mod errors;
mod repositories;
mod services;
#[cfg(test)]
mod test_support;
mod utils;

use crate::api::common::ApiResponse;
use crate::auth::service::{AuthDependencies, AuthService};
use crate::services::company_directory::{
    CompanyDirectory, EmptyCompanyDirectory, HttpCompanyDirectory,
};
use crate::services::email_service::{EmailTransport, LogEmailTransport, SmtpEmailTransport};
use crate::services::email_verification_service::EmailVerificationService;
use crate::services::oauth_service::{GoogleOAuthVerifier, OAuthVerifier};
use crate::services::refresh_token_service::{RefreshTokenService, spawn_expiry_sweeper};
use crate::utils::jwt::AccessTokenIssuer;
use crate::utils::unsubscribe::UnsubscribeCodec;
use anyhow::{Context, Result};
use axum::{Extension, Router, response::Json, routing::get};
use config::Config;
use database::Database;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let db = Database::new(&config).await?;
    db.migrate().await?;

    let issuer = Arc::new(
        AccessTokenIssuer::from_config(&config.jwt).context("failed to load JWT signing keys")?,
    );

    let refresh_tokens = Arc::new(RefreshTokenService::new(
        db.clone(),
        issuer.clone(),
        &config.refresh,
    ));

    let transport: Arc<dyn EmailTransport> = match config.email_config() {
        Some(email_config) => Arc::new(
            SmtpEmailTransport::new(email_config).context("failed to set up SMTP transport")?,
        ),
        None => {
            warn!("SMTP not configured, verification emails will only be logged");
            Arc::new(LogEmailTransport)
        }
    };

    let verification = Arc::new(EmailVerificationService::new(
        db.clone(),
        transport,
        &config.verification,
        &config.unsubscribe,
    ));

    let oauth = config
        .oauth
        .clone()
        .map(|oauth_config| Arc::new(GoogleOAuthVerifier::new(oauth_config)) as Arc<dyn OAuthVerifier>);

    let companies: Arc<dyn CompanyDirectory> = match &config.company_directory_url {
        Some(url) => Arc::new(HttpCompanyDirectory::new(url.clone())),
        None => Arc::new(EmptyCompanyDirectory),
    };

    let auth_service = Arc::new(AuthService::new(AuthDependencies {
        db: db.clone(),
        issuer,
        refresh_tokens: refresh_tokens.clone(),
        verification,
        unsubscribe: UnsubscribeCodec::new(config.unsubscribe.secret.clone()),
        oauth,
        companies,
        password_hash_cost: config.password_hash_cost,
    }));

    spawn_expiry_sweeper(refresh_tokens, config.refresh.sweep_interval_seconds);

    let app = app(auth_service);

    let bind_address = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;

    info!("Starting auth backend on port {}", config.server_port);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    db.close().await;
    Ok(())
}

/// Builds the full HTTP surface around the session facade.
fn app(auth_service: Arc<AuthService>) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .nest("/auth", auth::routes::auth_router())
        .nest("/email", api::unsubscribe::routes::unsubscribe_router())
        .layer(Extension(auth_service))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

async fn root_handler() -> Json<ApiResponse<serde_json::Value>> {
    Json(ApiResponse::success(
        serde_json::json!({
            "service": "auth-backend",
            "version": env!("CARGO_PKG_VERSION")
        }),
        "Welcome to the auth backend",
    ))
}
