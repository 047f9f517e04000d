//! One-click opt-out links from outbound email.

pub mod handlers;
pub mod routes;
