//! Error types for FHIR REST access

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("FHIR server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Malformed response body from {url}: {message}")]
    Decode { url: String, message: String },

    #[error("Invalid URL '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}
