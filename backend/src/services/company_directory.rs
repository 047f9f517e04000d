//! Lookup of registered company names, consulted when a publisher signs up.

use crate::errors::{ServiceError, ServiceResult};
use async_trait::async_trait;
use serde::Deserialize;

#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn company_exists(&self, name: &str) -> ServiceResult<bool>;
}

/// Used when no directory is configured: no name ever collides.
pub struct EmptyCompanyDirectory;

#[async_trait]
impl CompanyDirectory for EmptyCompanyDirectory {
    async fn company_exists(&self, _name: &str) -> ServiceResult<bool> {
        Ok(false)
    }
}

#[derive(Debug, Deserialize)]
struct ExistsResponse {
    exists: bool,
}

/// Queries `GET {base_url}/companies/exists?name=...`.
pub struct HttpCompanyDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCompanyDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl CompanyDirectory for HttpCompanyDirectory {
    async fn company_exists(&self, name: &str) -> ServiceResult<bool> {
        let url = format!("{}/companies/exists", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .get(url)
            .query(&[("name", name)])
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| ServiceError::external_service(format!("Company directory failed: {e}")))?;

        let body: ExistsResponse = response.json().await.map_err(|e| {
            ServiceError::external_service(format!("Bad company directory response: {e}"))
        })?;

        Ok(body.exists)
    }
}
