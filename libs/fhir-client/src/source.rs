//! Transport seam between the aggregation pipeline and a FHIR server.

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderValue, ACCEPT};
use serde_json::Value;
use std::time::Duration;

const FHIR_JSON: &str = "application/fhir+json";

/// Read-only access to a FHIR REST endpoint.
///
/// Implement this trait to plug in another transport (e.g. an in-memory fixture in tests).
#[async_trait]
pub trait FhirSource: Send + Sync {
    /// Base URL of the server, without a trailing slash (e.g. `http://localhost:8080/fhir`).
    fn base_url(&self) -> &str;

    /// GET an absolute URL and decode the body as JSON.
    ///
    /// Used for search pages, where the server hands out the URL of the next page.
    async fn get_bundle(&self, url: &str) -> Result<Value>;

    /// GET `{base}/{resource_type}/{id}`.
    async fn read(&self, resource_type: &str, id: &str) -> Result<Value> {
        let url = format!("{}/{}/{}", self.base_url(), resource_type, id);
        self.get_bundle(&url).await
    }
}

/// [`FhirSource`] backed by `reqwest`.
///
/// Every call is bounded by the configured timeout. There are no retries:
/// callers treat a failed call as a terminal partial result.
#[derive(Debug, Clone)]
pub struct HttpFhirSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFhirSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("iidi-aggregator/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl FhirSource for HttpFhirSource {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_bundle(&self, url: &str) -> Result<Value> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, HeaderValue::from_static(FHIR_JSON))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| Error::Decode {
            url: url.to_string(),
            message: e.to_string(),
        })
    }
}

/// Validate a base URL and strip trailing slashes so paths can be appended with `/`.
pub(crate) fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    url::Url::parse(trimmed).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        message: e.to_string(),
    })?;
    Ok(trimmed.to_string())
}
