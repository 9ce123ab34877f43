//! Immunization aggregator: pulls Immunization and Patient resources from a FHIR server,
//! normalizes them into de-identified facts and serves grouped counts over HTTP.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod normalize;
pub mod services;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
