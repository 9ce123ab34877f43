//! Shared application state

use crate::{
    auth::AuthManager,
    config::Config,
    normalize::Normalizer,
    services::{AggregationCache, AggregationService},
    Error, Result,
};
use iidi_fhir_client::{FetchOptions, FhirSource, HttpFhirSource, PatientResolver, ResourceFetcher};
use std::sync::Arc;

/// Shared application state passed to all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthManager>,
    pub cache: Arc<AggregationCache>,
    pub resolver: Arc<PatientResolver>,
}

impl AppState {
    /// Wire the pipeline against the configured FHIR server and load the public key.
    pub fn new(config: Config) -> Result<Self> {
        let source = HttpFhirSource::new(&config.fhir.base_url, config.fhir.request_timeout())?;
        let auth = AuthManager::new(&config.auth)?;
        Self::with_parts(config, Arc::new(source), auth)
    }

    /// Same wiring with a caller-supplied upstream and auth policy.
    pub fn with_parts(
        config: Config,
        source: Arc<dyn FhirSource>,
        auth: AuthManager,
    ) -> Result<Self> {
        let service = build_service(&config, source)?;
        let resolver = service.resolver().clone();
        let cache = AggregationCache::new(Arc::new(service), config.aggregation.interval());

        tracing::info!(
            fhir_url = %config.fhir.base_url,
            interval_seconds = config.aggregation.interval_seconds,
            auth_required = auth.requires_auth(),
            "Application state initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            auth: Arc::new(auth),
            cache: Arc::new(cache),
            resolver,
        })
    }
}

/// Fetcher, Patient cache and normalizer for one upstream.
pub fn build_service(config: &Config, source: Arc<dyn FhirSource>) -> Result<AggregationService> {
    let jurisdiction = config
        .aggregation
        .resolve_jurisdiction(source.base_url())
        .map_err(Error::Config)?;
    let normalizer = Normalizer::new(
        jurisdiction,
        config.aggregation.age_grouping().map_err(Error::Config)?,
    )
    .with_age_reference(config.aggregation.age_reference().map_err(Error::Config)?);

    let fetcher = ResourceFetcher::new(
        source.clone(),
        FetchOptions {
            page_size: config.fhir.page_size,
            max_pages: config.fhir.max_pages,
            public_base_urls: config.fhir.public_base_urls.clone(),
        },
    );
    let resolver = Arc::new(PatientResolver::new(
        source,
        config.fhir.patient_cache_capacity,
    ));

    Ok(AggregationService::new(fetcher, resolver, normalizer))
}
