//! Bearer-token authentication for the aggregation endpoint.
//!
//! Tokens are verified against a public key read once at startup. In local development a
//! missing key disables authentication; everywhere else it is a startup error.

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde_json::{json, Value};
use std::path::Path;

use crate::{config::AuthConfig, state::AppState, Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No `Authorization: Bearer <token>` header.
    MissingToken,
    /// Signature, algorithm or claim validation failed.
    InvalidToken(String),
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        match self {
            Self::MissingToken => {
                let mut response = (
                    StatusCode::UNAUTHORIZED,
                    Json(json!({ "error": "Unauthorized" })),
                )
                    .into_response();
                response
                    .headers_mut()
                    .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
                response
            }
            Self::InvalidToken(reason) => {
                tracing::warn!(reason = %reason, "Rejected bearer token");
                (
                    StatusCode::FORBIDDEN,
                    Json(json!({ "error": "Invalid token" })),
                )
                    .into_response()
            }
        }
    }
}

/// Public key plus the validation rules applied to every token.
#[derive(Clone)]
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn from_pem(pem: &[u8], config: &AuthConfig) -> Result<Self> {
        let algorithm = config.algorithm().map_err(Error::Config)?;
        let key = decoding_key(pem, algorithm)
            .map_err(|e| Error::PublicKey(format!("unusable {algorithm:?} public key: {e}")))?;

        let mut validation = Validation::new(algorithm);
        // `exp` and `nbf` are checked when present but not demanded. No clock skew allowance.
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_nbf = true;
        validation.leeway = 0;
        validation.validate_aud = false;
        if let Some(audience) = non_blank(config.audience.as_deref()) {
            validation.set_audience(&[audience]);
            validation.validate_aud = true;
            validation.required_spec_claims.insert("aud".to_string());
        }
        if let Some(issuer) = non_blank(config.issuer.as_deref()) {
            validation.set_issuer(&[issuer]);
            validation.required_spec_claims.insert("iss".to_string());
        }

        Ok(Self { key, validation })
    }

    /// Decoded claims of a valid token.
    pub fn verify(&self, token: &str) -> std::result::Result<Value, AuthError> {
        decode::<Value>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))
    }
}

fn decoding_key(
    pem: &[u8],
    algorithm: Algorithm,
) -> std::result::Result<DecodingKey, jsonwebtoken::errors::Error> {
    match algorithm {
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
        _ => DecodingKey::from_rsa_pem(pem),
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Read and trim the PEM file named by `auth.public_key_path`.
pub fn load_public_key(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::PublicKey(format!("{}: {e}", path.display())))?;
    let contents = contents.trim();
    if contents.is_empty() {
        return Err(Error::PublicKey(format!(
            "{}: public key file is empty",
            path.display()
        )));
    }
    Ok(contents.to_string())
}

/// Decides whether requests need a token and verifies the ones that carry one.
#[derive(Clone)]
pub struct AuthManager {
    verifier: Option<TokenVerifier>,
}

impl AuthManager {
    /// Load the configured key.
    ///
    /// A missing or empty key is fatal unless `auth.local_dev` is set, in which case
    /// authentication is turned off. A key that loads is always enforced.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        match load_public_key(&config.public_key_path) {
            Ok(pem) => {
                let verifier = TokenVerifier::from_pem(pem.as_bytes(), config)?;
                tracing::info!(
                    path = %config.public_key_path,
                    algorithm = %config.algorithm,
                    "Public key loaded; bearer tokens required"
                );
                Ok(Self::enforcing(verifier))
            }
            Err(e) if config.local_dev => {
                tracing::warn!(
                    error = %e,
                    "Public key unavailable in local development mode; authentication disabled"
                );
                Ok(Self::disabled())
            }
            Err(e) => Err(e),
        }
    }

    pub fn enforcing(verifier: TokenVerifier) -> Self {
        Self {
            verifier: Some(verifier),
        }
    }

    pub fn disabled() -> Self {
        Self { verifier: None }
    }

    pub fn requires_auth(&self) -> bool {
        self.verifier.is_some()
    }

    /// Check the `Authorization` header. Always succeeds when authentication is off.
    pub fn validate_headers(&self, headers: &HeaderMap) -> std::result::Result<(), AuthError> {
        let Some(verifier) = &self.verifier else {
            return Ok(());
        };
        let token = bearer_token(headers).ok_or(AuthError::MissingToken)?;
        let claims = verifier.verify(token)?;
        tracing::debug!(
            sub = claims.get("sub").and_then(|sub| sub.as_str()),
            "Bearer token accepted"
        );
        Ok(())
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// Guards `/aggregated-data`.
pub async fn auth_middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match state.auth.validate_headers(req.headers()) {
        Ok(()) => next.run(req).await,
        Err(e) => e.into_response(),
    }
}
