//! Time-boxed memoization of the aggregation result.

use super::aggregation::{AggregateRow, Aggregator};
use crate::metrics::METRICS;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// A computed payload and when it was produced.
#[derive(Debug, Clone)]
pub struct CachedAggregation {
    pub rows: Arc<[AggregateRow]>,
    pub computed_at: Instant,
}

/// Single-slot cache in front of an [`Aggregator`].
///
/// Staleness is resolved lazily: the first request after `interval` has elapsed recomputes.
/// The pass runs on its own task which owns the slot lock until it has stored the result.
/// Concurrent requests wait for that one pass, and a caller that goes away mid-pass does
/// not cancel it.
pub struct AggregationCache {
    aggregator: Arc<dyn Aggregator>,
    interval: Duration,
    slot: Arc<Mutex<Option<CachedAggregation>>>,
}

impl AggregationCache {
    pub fn new(aggregator: Arc<dyn Aggregator>, interval: Duration) -> Self {
        Self {
            aggregator,
            interval,
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Current rows, recomputed first when the slot is empty or older than `interval`.
    pub async fn get(&self) -> CachedAggregation {
        let mut slot = self.slot.clone().lock_owned().await;

        if let Some(cached) = slot.as_ref() {
            let age = cached.computed_at.elapsed();
            if age < self.interval {
                METRICS.aggregation_cache_hits.inc();
                tracing::info!(
                    "Returning cached data. Next aggregation in {:.2} seconds.",
                    (self.interval - age).as_secs_f64()
                );
                return cached.clone();
            }
        }

        tracing::info!("Calculating new aggregated data...");
        let aggregator = self.aggregator.clone();
        let pass = tokio::spawn(async move {
            let rows: Arc<[AggregateRow]> = aggregator.aggregate().await.into();
            let fresh = CachedAggregation {
                rows,
                computed_at: Instant::now(),
            };
            *slot = Some(fresh.clone());
            fresh
        });

        match pass.await {
            Ok(fresh) => fresh,
            Err(e) => {
                // The slot keeps its previous contents; the next request retries.
                tracing::error!(error = %e, "Aggregation pass did not complete");
                CachedAggregation {
                    rows: Arc::from(Vec::new()),
                    computed_at: Instant::now(),
                }
            }
        }
    }
}
