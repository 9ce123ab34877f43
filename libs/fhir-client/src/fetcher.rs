//! Paginated retrieval of a FHIR resource collection.

use crate::source::FhirSource;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Search paging settings.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// `_count` requested from the server for every page.
    pub page_size: usize,
    /// Stop after this many pages. `None` follows `next` links until exhausted.
    pub max_pages: Option<usize>,
    /// Public base URLs the server may advertise in `next` links. A link starting with
    /// one of these is rewritten onto the configured base URL (servers behind a proxy
    /// hand out their public address, which is not reachable from inside the cluster).
    pub public_base_urls: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 500,
            max_pages: None,
            public_base_urls: Vec::new(),
        }
    }
}

/// Walks `GET {base}/{type}?_count=N` and every `next` link that follows.
#[derive(Clone)]
pub struct ResourceFetcher {
    source: Arc<dyn FhirSource>,
    options: FetchOptions,
}

impl ResourceFetcher {
    pub fn new(source: Arc<dyn FhirSource>, options: FetchOptions) -> Self {
        Self { source, options }
    }

    /// Retrieve every `Bundle.entry` of a resource type, in server order.
    ///
    /// Failures never propagate: a network error, non-2xx status or malformed body on any
    /// page ends pagination and the entries gathered so far are returned. An unknown or
    /// empty resource type therefore yields an empty vector.
    pub async fn fetch_all(&self, resource_type: &str) -> Vec<Value> {
        let mut next = Some(format!(
            "{}/{}?_count={}",
            self.source.base_url(),
            resource_type,
            self.options.page_size
        ));
        let mut visited = HashSet::new();
        let mut entries = Vec::new();
        let mut pages = 0usize;

        while let Some(url) = next.take() {
            if let Some(max_pages) = self.options.max_pages {
                if pages >= max_pages {
                    tracing::debug!(resource_type, max_pages, "Page limit reached");
                    break;
                }
            }
            if !visited.insert(url.clone()) {
                tracing::warn!(resource_type, url = %url, "Next link points to an already visited page");
                break;
            }

            let bundle = match self.source.get_bundle(&url).await {
                Ok(bundle) => bundle,
                Err(e) => {
                    tracing::error!(
                        resource_type,
                        url = %url,
                        error = %e,
                        "Error fetching {} data from FHIR server",
                        resource_type
                    );
                    break;
                }
            };
            pages += 1;

            let Value::Object(mut bundle) = bundle else {
                tracing::error!(resource_type, url = %url, "Search response is not a JSON object");
                break;
            };

            next = next_link(&bundle).and_then(|link| self.resolve_next(&url, link));

            if let Some(Value::Array(items)) = bundle.remove("entry") {
                entries.extend(items.into_iter().filter(Value::is_object));
            }
        }

        tracing::info!(
            resource_type,
            count = entries.len(),
            pages,
            "Fetched {} {} records",
            entries.len(),
            resource_type
        );
        entries
    }

    /// Turn a `next` link into the URL to request: relative links are resolved against the
    /// current page, advertised public bases are swapped for the configured one.
    fn resolve_next(&self, current: &str, link: &str) -> Option<String> {
        let absolute = match url::Url::parse(link) {
            Ok(url) => url.to_string(),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                let base = url::Url::parse(current).ok()?;
                match base.join(link) {
                    Ok(url) => url.to_string(),
                    Err(e) => {
                        tracing::warn!(link, error = %e, "Unusable next link");
                        return None;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(link, error = %e, "Unusable next link");
                return None;
            }
        };

        Some(rewrite_base(
            &absolute,
            &self.options.public_base_urls,
            self.source.base_url(),
        ))
    }
}

fn next_link(bundle: &serde_json::Map<String, Value>) -> Option<&str> {
    bundle
        .get("link")?
        .as_array()?
        .iter()
        .find(|link| link.get("relation").and_then(Value::as_str) == Some("next"))
        .and_then(|link| link.get("url"))
        .and_then(Value::as_str)
        .filter(|url| !url.trim().is_empty())
}

fn rewrite_base(url: &str, public_bases: &[String], base_url: &str) -> String {
    for public in public_bases {
        let public = public.trim_end_matches('/');
        if public.is_empty() {
            continue;
        }
        if let Some(rest) = url.strip_prefix(public) {
            if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') {
                return format!("{base_url}{rest}");
            }
        }
    }
    url.to_string()
}
