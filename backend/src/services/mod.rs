//! Module for core business logic services.
//!
//! Refresh token rotation and the email verification lifecycle live here,
//! next to the outbound collaborators they depend on.

pub mod company_directory;
pub mod email_service;
pub mod email_verification_service;
pub mod oauth_service;
pub mod refresh_token_service;
