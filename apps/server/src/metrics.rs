//! Prometheus metrics for the aggregation pipeline.

use crate::Result;
use iidi_fhir_client::PatientCacheStats;
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub aggregation_runs: IntCounter,
    pub aggregation_cache_hits: IntCounter,
    pub aggregation_duration: Histogram,
    pub records_processed: IntCounter,
    pub records_skipped: IntCounter,
    pub aggregate_rows: IntGauge,
    patient_cache_entries: IntGauge,
    patient_cache_hits: IntGauge,
    patient_cache_misses: IntGauge,
    patient_fetch_failures: IntGauge,
}

lazy_static! {
    pub static ref METRICS: Metrics = Metrics::new().expect("metric definitions are valid");
}

impl Metrics {
    fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("aggregator".to_string()), None)?;

        let aggregation_runs = IntCounter::new(
            "aggregation_runs_total",
            "Aggregation passes computed (cache misses)",
        )?;
        let aggregation_cache_hits = IntCounter::new(
            "aggregation_cache_hits_total",
            "Requests served from the cached aggregation",
        )?;
        let aggregation_duration = Histogram::with_opts(
            HistogramOpts::new(
                "aggregation_duration_seconds",
                "Wall time of one aggregation pass",
            )
            .buckets(vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]),
        )?;
        let records_processed = IntCounter::new(
            "records_processed_total",
            "Immunization records normalized into facts",
        )?;
        let records_skipped = IntCounter::new(
            "records_skipped_total",
            "Immunization records skipped (no patient reference or unresolved Patient)",
        )?;
        let aggregate_rows = IntGauge::new(
            "aggregate_rows",
            "Rows in the most recent aggregation result",
        )?;
        let patient_cache_entries =
            IntGauge::new("patient_cache_entries", "Patients held in the LRU cache")?;
        let patient_cache_hits =
            IntGauge::new("patient_cache_hits", "Patient lookups answered from cache")?;
        let patient_cache_misses = IntGauge::new(
            "patient_cache_misses",
            "Patient lookups that required an upstream read",
        )?;
        let patient_fetch_failures = IntGauge::new(
            "patient_fetch_failures",
            "Upstream Patient reads that failed",
        )?;

        registry.register(Box::new(aggregation_runs.clone()))?;
        registry.register(Box::new(aggregation_cache_hits.clone()))?;
        registry.register(Box::new(aggregation_duration.clone()))?;
        registry.register(Box::new(records_processed.clone()))?;
        registry.register(Box::new(records_skipped.clone()))?;
        registry.register(Box::new(aggregate_rows.clone()))?;
        registry.register(Box::new(patient_cache_entries.clone()))?;
        registry.register(Box::new(patient_cache_hits.clone()))?;
        registry.register(Box::new(patient_cache_misses.clone()))?;
        registry.register(Box::new(patient_fetch_failures.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            aggregation_runs,
            aggregation_cache_hits,
            aggregation_duration,
            records_processed,
            records_skipped,
            aggregate_rows,
            patient_cache_entries,
            patient_cache_hits,
            patient_cache_misses,
            patient_fetch_failures,
        })
    }

    pub fn observe_patient_cache(&self, stats: PatientCacheStats) {
        self.patient_cache_entries.set(stats.len as i64);
        self.patient_cache_hits.set(stats.hits as i64);
        self.patient_cache_misses.set(stats.misses as i64);
        self.patient_fetch_failures.set(stats.failures as i64);
    }

    /// Prometheus text exposition of every registered metric.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| crate::Error::Internal(e.to_string()))
    }
}
