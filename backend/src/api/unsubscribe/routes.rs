//! Defines the HTTP routes for email preferences.

use super::handlers::unsubscribe;
use axum::{Router, routing::get};

pub fn unsubscribe_router() -> Router {
    Router::new().route("/unsubscribe", get(unsubscribe).post(unsubscribe))
}
