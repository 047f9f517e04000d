//! Authentication module for managing user accounts, sessions, and access control.
//!
//! This module provides the public interface for sign-up, sign-in, token
//! management, email verification, and the bearer token middleware.

pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod service;
