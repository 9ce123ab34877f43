//! Configuration management for the aggregator

use crate::normalize::{AgeGrouping, AgeReference, Jurisdiction};
use jsonwebtoken::Algorithm;
use serde::Deserialize;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub fhir: FhirConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to call the API from a browser. Empty disables CORS headers.
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// Upstream FHIR server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct FhirConfig {
    /// Base URL of the FHIR server, e.g. `http://localhost:8080/fhir`.
    /// Environment variable: `AGGREGATOR__FHIR__BASE_URL` (legacy: `FHIR_URL`)
    #[serde(default = "default_fhir_base_url")]
    pub base_url: String,
    /// `_count` requested for every search page. Default: 500
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Stop paging after this many pages. Unset follows `next` links to the end.
    #[serde(default)]
    pub max_pages: Option<usize>,
    /// Timeout for a single upstream request in seconds. Default: 10
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
    /// Number of Patient resources kept in the LRU cache. Default: 1000
    #[serde(default = "default_patient_cache_capacity")]
    pub patient_cache_capacity: usize,
    /// Public base URLs the server advertises in `next` links; rewritten onto `base_url`.
    #[serde(default)]
    pub public_base_urls: Vec<String>,
}

impl Default for FhirConfig {
    fn default() -> Self {
        Self {
            base_url: default_fhir_base_url(),
            page_size: default_page_size(),
            max_pages: None,
            request_timeout_seconds: default_request_timeout(),
            patient_cache_capacity: default_patient_cache_capacity(),
            public_base_urls: Vec::new(),
        }
    }
}

impl FhirConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Seconds an aggregation result is served before it is recomputed.
    /// Environment variable: `AGGREGATOR__AGGREGATION__INTERVAL_SECONDS` (legacy: `AGGREGATION_INTERVAL`)
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// `BC` or `ON`. When unset the jurisdiction is inferred from `fhir.base_url`.
    #[serde(default)]
    pub jurisdiction: Option<String>,
    /// `years` (default) or `buckets`.
    #[serde(default = "default_age_grouping")]
    pub age_grouping: String,
    /// `today` (default) or `occurrence`.
    #[serde(default = "default_age_reference")]
    pub age_reference: String,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval(),
            jurisdiction: None,
            age_grouping: default_age_grouping(),
            age_reference: default_age_reference(),
        }
    }
}

impl AggregationConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }

    pub fn age_grouping(&self) -> Result<AgeGrouping, String> {
        self.age_grouping.parse()
    }

    pub fn age_reference(&self) -> Result<AgeReference, String> {
        self.age_reference.parse()
    }

    /// Configured jurisdiction, or the one inferred from the FHIR base URL.
    pub fn resolve_jurisdiction(&self, base_url: &str) -> Result<Jurisdiction, String> {
        match self.jurisdiction.as_deref().map(str::trim) {
            Some(explicit) if !explicit.is_empty() => explicit.parse(),
            _ => {
                let inferred = Jurisdiction::infer_from_url(base_url);
                tracing::warn!(
                    jurisdiction = %inferred,
                    base_url,
                    "aggregation.jurisdiction not set; inferred from FHIR base URL"
                );
                Ok(inferred)
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// PEM-encoded public key used to verify bearer tokens.
    /// Environment variable: `AGGREGATOR__AUTH__PUBLIC_KEY_PATH` (legacy: `PUBLIC_KEY_PATH`)
    #[serde(default = "default_public_key_path")]
    pub public_key_path: String,
    /// Local development: a missing key disables authentication instead of failing startup.
    /// Environment variable: `AGGREGATOR__AUTH__LOCAL_DEV` (legacy: `IS_LOCAL_DEV`)
    #[serde(default)]
    pub local_dev: bool,
    /// JWT signature algorithm. Only asymmetric algorithms are accepted. Default: RS256
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Expected `aud` claim. Not checked when unset.
    #[serde(default)]
    pub audience: Option<String>,
    /// Expected `iss` claim. Not checked when unset.
    #[serde(default)]
    pub issuer: Option<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_key_path: default_public_key_path(),
            local_dev: false,
            algorithm: default_algorithm(),
            audience: None,
            issuer: None,
        }
    }
}

impl AuthConfig {
    pub fn algorithm(&self) -> Result<Algorithm, String> {
        let algorithm = Algorithm::from_str(self.algorithm.trim())
            .map_err(|_| format!("unknown JWT algorithm '{}'", self.algorithm))?;
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Err(format!(
                "auth.algorithm {:?} is symmetric; a public key requires RSA, PSS, ECDSA or EdDSA",
                algorithm
            )),
            other => Ok(other),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON formatting for logs (recommended for production)
    #[serde(default)]
    pub json: bool,

    /// Enable file logging in addition to console
    #[serde(default)]
    pub file_enabled: bool,

    /// Directory for log files (default: ./logs)
    #[serde(default = "default_log_directory")]
    pub file_directory: String,

    /// Log file prefix (default: aggregator)
    #[serde(default = "default_log_file_prefix")]
    pub file_prefix: String,

    /// Log rotation: daily, hourly, minutely, never (default: daily)
    #[serde(default = "default_log_rotation")]
    pub file_rotation: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file_enabled: false,
            file_directory: default_log_directory(),
            file_prefix: default_log_file_prefix(),
            file_rotation: default_log_rotation(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_fhir_base_url() -> String {
    "http://localhost:8080/fhir".to_string()
}

fn default_page_size() -> usize {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_patient_cache_capacity() -> usize {
    iidi_fhir_client::DEFAULT_PATIENT_CACHE_CAPACITY
}

fn default_interval() -> u64 {
    60
}

fn default_age_grouping() -> String {
    "years".to_string()
}

fn default_age_reference() -> String {
    "today".to_string()
}

fn default_public_key_path() -> String {
    "/secrets/public_key.pem".to_string()
}

fn default_algorithm() -> String {
    "RS256".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_directory() -> String {
    "./logs".to_string()
}

fn default_log_file_prefix() -> String {
    "aggregator".to_string()
}

fn default_log_rotation() -> String {
    "daily".to_string()
}

/// Legacy environment variables honoured when no prefixed override is present.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("FHIR_URL", "AGGREGATOR__FHIR__BASE_URL"),
    ("AGGREGATION_INTERVAL", "AGGREGATOR__AGGREGATION__INTERVAL_SECONDS"),
    ("PUBLIC_KEY_PATH", "AGGREGATOR__AUTH__PUBLIC_KEY_PATH"),
    ("IS_LOCAL_DEV", "AGGREGATOR__AUTH__LOCAL_DEV"),
];

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        // Load .env file if present
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("server.host", default_host())?
            .set_default("server.port", default_port())?
            .set_default("fhir.base_url", default_fhir_base_url())?
            .set_default("fhir.page_size", default_page_size() as i64)?
            .set_default("fhir.request_timeout_seconds", default_request_timeout())?
            .set_default(
                "fhir.patient_cache_capacity",
                default_patient_cache_capacity() as i64,
            )?
            .set_default("aggregation.interval_seconds", default_interval())?
            .set_default("aggregation.age_grouping", default_age_grouping())?
            .set_default("aggregation.age_reference", default_age_reference())?
            .set_default("auth.public_key_path", default_public_key_path())?
            .set_default("auth.local_dev", false)?
            .set_default("auth.algorithm", default_algorithm())?
            .set_default("logging.level", default_log_level())?
            .set_default("logging.json", false)?
            .set_default("logging.file_enabled", false)?
            .set_default("logging.file_directory", default_log_directory())?
            .set_default("logging.file_prefix", default_log_file_prefix())?
            .set_default("logging.file_rotation", default_log_rotation())?
            // Add config file if exists
            .add_source(config::File::with_name("config").required(false))
            // Override with environment variables
            // Example: AGGREGATOR__FHIR__BASE_URL → config.fhir.base_url
            // Arrays use comma separator: AGGREGATOR__SERVER__CORS_ORIGINS=https://a.com,https://b.com
            .add_source(
                config::Environment::with_prefix("AGGREGATOR")
                    .prefix_separator("__")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins")
                    .with_list_parse_key("fhir.public_base_urls")
                    .try_parsing(true),
            );

        // Convenience escape hatch: the variables used by earlier deployments still apply
        // when the prefixed variable is absent.
        for (legacy, prefixed) in LEGACY_ENV {
            if std::env::var(prefixed).is_err() {
                if let Ok(value) = std::env::var(legacy) {
                    builder = builder.set_override(legacy_key(legacy), legacy_value(legacy, value))?;
                }
            }
        }

        let config: Self = builder.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.server.host, self.server.port);
        Ok(addr.parse()?)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        let base_url = self.fhir.base_url.trim();
        if base_url.is_empty() {
            return Err("fhir.base_url must be set".to_string());
        }
        url::Url::parse(base_url)
            .map_err(|e| format!("fhir.base_url '{base_url}' is not a valid URL: {e}"))?;

        if self.fhir.page_size == 0 {
            return Err("fhir.page_size must be > 0".to_string());
        }
        if self.fhir.max_pages == Some(0) {
            return Err("fhir.max_pages must be > 0 when set".to_string());
        }
        if self.fhir.request_timeout_seconds == 0 {
            return Err("fhir.request_timeout_seconds must be > 0".to_string());
        }
        if self.fhir.patient_cache_capacity == 0 {
            return Err("fhir.patient_cache_capacity must be > 0".to_string());
        }

        if let Some(jurisdiction) = self.aggregation.jurisdiction.as_deref() {
            if !jurisdiction.trim().is_empty() {
                jurisdiction
                    .parse::<Jurisdiction>()
                    .map_err(|e| format!("aggregation.jurisdiction: {e}"))?;
            }
        }
        self.aggregation
            .age_grouping()
            .map_err(|e| format!("aggregation.age_grouping: {e}"))?;
        self.aggregation
            .age_reference()
            .map_err(|e| format!("aggregation.age_reference: {e}"))?;

        self.auth.algorithm()?;
        if !self.auth.local_dev && self.auth.public_key_path.trim().is_empty() {
            return Err("auth.public_key_path must be set unless auth.local_dev=true".to_string());
        }

        if !matches!(
            self.logging.file_rotation.as_str(),
            "daily" | "hourly" | "minutely" | "never"
        ) {
            return Err(format!(
                "logging.file_rotation must be one of daily, hourly, minutely, never (got '{}')",
                self.logging.file_rotation
            ));
        }

        Ok(())
    }
}

fn legacy_key(legacy: &str) -> &'static str {
    match legacy {
        "FHIR_URL" => "fhir.base_url",
        "AGGREGATION_INTERVAL" => "aggregation.interval_seconds",
        "PUBLIC_KEY_PATH" => "auth.public_key_path",
        _ => "auth.local_dev",
    }
}

fn legacy_value(legacy: &str, value: String) -> config::Value {
    match legacy {
        "IS_LOCAL_DEV" => config::Value::from(value.trim().eq_ignore_ascii_case("true")),
        "AGGREGATION_INTERVAL" => match value.trim().parse::<i64>() {
            Ok(seconds) => config::Value::from(seconds),
            Err(_) => config::Value::from(value),
        },
        _ => config::Value::from(value),
    }
}
