//! Stateless data access for the credential store.
//!
//! Every function takes an explicit `&mut SqliteConnection`, which is either
//! a pooled connection or an open transaction.

pub mod email_unsubscribe_repository;
pub mod email_verification_repository;
pub mod refresh_token_repository;
pub mod user_repository;
