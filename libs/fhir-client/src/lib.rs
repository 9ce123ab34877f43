//! FHIR REST access for the immunization aggregator.
//!
//! The crate covers the two network-facing steps of an aggregation pass:
//!
//! - [`ResourceFetcher`] walks a paginated search (`GET {base}/{type}?_count=N`)
//!   following `next` links until the bundle chain is exhausted.
//! - [`PatientResolver`] reads individual `Patient` resources referenced by
//!   Immunization records and memoizes them in a bounded LRU cache.
//!
//! Both sit on top of the [`FhirSource`] trait so the transport can be swapped
//! (the HTTP implementation is [`HttpFhirSource`]).

pub mod error;
pub mod fetcher;
pub mod patient;
pub mod source;

pub use error::{Error, Result};
pub use fetcher::{FetchOptions, ResourceFetcher};
pub use patient::{
    patient_id_from_reference, PatientCacheStats, PatientResolver, DEFAULT_PATIENT_CACHE_CAPACITY,
};
pub use source::{FhirSource, HttpFhirSource};
