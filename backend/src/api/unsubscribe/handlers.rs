//! Handler functions for the email unsubscribe endpoint.

use crate::api::common::{ApiResponse, HttpError, service_error_to_http};
use crate::auth::models::{UnsubscribeQuery, UnsubscribeResponse};
use crate::auth::service::AuthService;
use axum::{
    extract::{Extension, Query},
    response::Json as ResponseJson,
};
use std::sync::Arc;

/// Redeems the token from an unsubscribe link. Serves both the link itself
/// (GET) and mail clients' one-click POST.
#[axum::debug_handler]
pub async fn unsubscribe(
    Extension(auth_service): Extension<Arc<AuthService>>,
    Query(query): Query<UnsubscribeQuery>,
) -> Result<ResponseJson<ApiResponse<UnsubscribeResponse>>, HttpError> {
    match auth_service.unsubscribe(&query.token).await {
        Ok(response) => Ok(ResponseJson(ApiResponse::success(
            response,
            "You have been unsubscribed",
        ))),
        Err(error) => Err(service_error_to_http(error)),
    }
}
