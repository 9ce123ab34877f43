//! Memoized resolution of `Patient` references.

use crate::source::FhirSource;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Default number of Patient resources kept in memory.
pub const DEFAULT_PATIENT_CACHE_CAPACITY: usize = 1000;

/// Snapshot of the patient cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatientCacheStats {
    pub len: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

/// Resolves `Patient/{id}` references through a bounded LRU cache.
///
/// Only successful reads are cached; a failed read is logged and retried the next time the
/// same id is requested. Entries have no TTL, they leave the cache only through eviction.
pub struct PatientResolver {
    source: Arc<dyn FhirSource>,
    cache: Mutex<LruCache<String, Arc<Value>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
}

impl PatientResolver {
    pub fn new(source: Arc<dyn FhirSource>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            source,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Look up the Patient behind `reference`, reading it from the server on a cache miss.
    ///
    /// Returns `None` when the reference carries no usable id or the read fails.
    pub async fn resolve(&self, reference: &str) -> Option<Arc<Value>> {
        let Some(patient_id) = patient_id_from_reference(reference) else {
            tracing::debug!(reference, "Reference does not point at a Patient");
            return None;
        };

        if let Some(patient) = self.cached(patient_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(patient);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // The lock is released before the read; concurrent misses on the same id may both
        // hit the server and the later insert wins.
        let patient = match self.source.read("Patient", patient_id).await {
            Ok(value) if value.is_object() => Arc::new(value),
            Ok(_) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(patient_id, "Patient response is not a JSON object");
                return None;
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    patient_id,
                    error = %e,
                    "Error fetching Patient data for {}",
                    patient_id
                );
                return None;
            }
        };

        self.lock()
            .put(patient_id.to_string(), Arc::clone(&patient));
        Some(patient)
    }

    pub fn stats(&self) -> PatientCacheStats {
        let cache = self.lock();
        PatientCacheStats {
            len: cache.len(),
            capacity: cache.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    fn cached(&self, patient_id: &str) -> Option<Arc<Value>> {
        self.lock().get(patient_id).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<Value>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Extract the logical id from a Patient reference.
///
/// Accepts `Patient/{id}`, absolute URLs ending in `Patient/{id}`, version-specific
/// references (`Patient/{id}/_history/{vid}`) and bare ids. References to other resource
/// types and contained references (`#id`) yield `None`.
pub fn patient_id_from_reference(reference: &str) -> Option<&str> {
    let mut path = reference.trim();
    if path.is_empty() || path.starts_with('#') {
        return None;
    }
    if let Some(idx) = path.find("/_history/") {
        path = &path[..idx];
    }

    let mut segments = path.rsplit('/');
    let id = segments.next()?.trim();
    if id.is_empty() {
        return None;
    }
    match segments.next() {
        None | Some("Patient") => Some(id),
        Some(_) => None,
    }
}
