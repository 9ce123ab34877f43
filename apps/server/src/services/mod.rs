//! Business logic layer
//!
//! The aggregation service turns upstream FHIR resources into count rows; the cache
//! decides when that (expensive) pass has to run again.

pub mod aggregation;
pub mod cache;

pub use aggregation::{group_facts, AggregateRow, AggregationService, Aggregator};
pub use cache::{AggregationCache, CachedAggregation};
