//! Test harness: a stub upstream FHIR server on an ephemeral port and the aggregator
//! router driven in-process.

use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{header, HeaderMap, Method, Request, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use http_body_util::BodyExt;
use iidi_aggregator::{
    api::create_router,
    auth::{AuthManager, TokenVerifier},
    config::Config,
    state::AppState,
};
use iidi_fhir_client::HttpFhirSource;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;

pub const PUBLIC_KEY: &str = include_str!("../fixtures/public_key.pem");
pub const PRIVATE_KEY: &str = include_str!("../fixtures/private_key.pem");
pub const OTHER_PRIVATE_KEY: &str = include_str!("../fixtures/other_private_key.pem");

// ---------------------------------------------------------------------------
// Upstream FHIR stub
// ---------------------------------------------------------------------------

/// Canned Immunization pages and Patients, plus request counters.
#[derive(Default)]
pub struct Upstream {
    pages: Vec<Vec<Value>>,
    patients: HashMap<String, Value>,
    failing_pages: HashSet<usize>,
    immunization_requests: AtomicUsize,
    patient_requests: Mutex<HashMap<String, usize>>,
}

impl Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one page of Immunization resources.
    pub fn with_page(mut self, resources: Vec<Value>) -> Self {
        self.pages.push(resources);
        self
    }

    pub fn with_patient(mut self, patient: Value) -> Self {
        let id = patient["id"].as_str().unwrap_or_default().to_string();
        self.patients.insert(id, patient);
        self
    }

    /// Answer the given (zero-based) page with HTTP 500.
    pub fn failing_page(mut self, page: usize) -> Self {
        self.failing_pages.insert(page);
        self
    }

    pub fn immunization_requests(&self) -> usize {
        self.immunization_requests.load(Ordering::SeqCst)
    }

    pub fn patient_requests(&self, id: &str) -> usize {
        self.patient_requests
            .lock()
            .unwrap()
            .get(id)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Clone)]
struct StubState {
    upstream: Arc<Upstream>,
    base_url: String,
}

/// Running stub; aborted on drop.
pub struct StubServer {
    pub base_url: String,
    pub upstream: Arc<Upstream>,
    handle: tokio::task::JoinHandle<()>,
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Serve `upstream` under `prefix` (e.g. `/fhir`) on 127.0.0.1.
pub async fn spawn_upstream(upstream: Upstream, prefix: &str) -> anyhow::Result<StubServer> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}{}", listener.local_addr()?, prefix);
    let upstream = Arc::new(upstream);

    let fhir = Router::new()
        .route("/Immunization", get(search_immunizations))
        .route("/Patient/:id", get(read_patient))
        .with_state(StubState {
            upstream: upstream.clone(),
            base_url: base_url.clone(),
        });
    let app = Router::new().nest(prefix, fhir);

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    Ok(StubServer {
        base_url,
        upstream,
        handle,
    })
}

async fn search_immunizations(
    State(stub): State<StubState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    stub.upstream
        .immunization_requests
        .fetch_add(1, Ordering::SeqCst);

    let page: usize = params
        .get("page")
        .and_then(|p| p.parse().ok())
        .unwrap_or(0);
    if stub.upstream.failing_pages.contains(&page) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response();
    }

    let resources = stub.upstream.pages.get(page).cloned().unwrap_or_default();
    let mut bundle = json!({ "resourceType": "Bundle", "type": "searchset" });
    if !resources.is_empty() {
        bundle["entry"] = resources
            .into_iter()
            .map(|resource| json!({ "resource": resource }))
            .collect();
    }
    if page + 1 < stub.upstream.pages.len() {
        bundle["link"] = json!([{
            "relation": "next",
            "url": format!("{}/Immunization?page={}", stub.base_url, page + 1),
        }]);
    }
    Json(bundle).into_response()
}

async fn read_patient(State(stub): State<StubState>, Path(id): Path<String>) -> Response {
    *stub
        .upstream
        .patient_requests
        .lock()
        .unwrap()
        .entry(id.clone())
        .or_default() += 1;

    match stub.upstream.patients.get(&id) {
        Some(patient) => Json(patient.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({
                "resourceType": "OperationOutcome",
                "issue": [{ "severity": "error", "code": "not-found" }]
            })),
        )
            .into_response(),
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn immunization(patient_ref: &str, occurrence: &str, dose: &str) -> Value {
    json!({
        "resourceType": "Immunization",
        "status": "completed",
        "patient": { "reference": patient_ref },
        "occurrenceDateTime": occurrence,
        "protocolApplied": [{ "doseNumberString": dose }]
    })
}

pub fn patient(id: &str, gender: &str, birth_date: &str) -> Value {
    json!({
        "resourceType": "Patient",
        "id": id,
        "gender": gender,
        "birthDate": birth_date
    })
}

pub fn sign_token(claims: Value) -> String {
    sign_with(PRIVATE_KEY, claims)
}

pub fn sign_with(private_key: &str, claims: Value) -> String {
    encode(
        &Header::new(Algorithm::RS256),
        &claims,
        &EncodingKey::from_rsa_pem(private_key.as_bytes()).expect("fixture key"),
    )
    .expect("sign token")
}

pub fn valid_token() -> String {
    sign_token(json!({
        "sub": "federator",
        "exp": chrono::Utc::now().timestamp() + 300
    }))
}

// ---------------------------------------------------------------------------
// Aggregator under test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Disabled,
    Enforced,
}

/// Knobs for [`TestApp::spawn_with`].
#[derive(Debug, Clone)]
pub struct TestOptions {
    /// Path prefix of the stub FHIR base URL.
    pub prefix: &'static str,
    pub interval_seconds: u64,
    pub auth: AuthMode,
    pub age_reference: &'static str,
    pub jurisdiction: Option<&'static str>,
    pub cors_origins: Vec<String>,
}

impl Default for TestOptions {
    fn default() -> Self {
        Self {
            prefix: "/fhir",
            interval_seconds: 3600,
            auth: AuthMode::Disabled,
            age_reference: "occurrence",
            jurisdiction: None,
            cors_origins: Vec::new(),
        }
    }
}

pub struct TestApp {
    router: Router,
    pub stub: StubServer,
    pub state: AppState,
}

impl TestApp {
    pub async fn spawn(upstream: Upstream) -> anyhow::Result<Self> {
        Self::spawn_with(upstream, TestOptions::default()).await
    }

    pub async fn spawn_with(upstream: Upstream, options: TestOptions) -> anyhow::Result<Self> {
        let stub = spawn_upstream(upstream, options.prefix).await?;

        let mut config = Config::default();
        config.fhir.base_url = stub.base_url.clone();
        config.aggregation.interval_seconds = options.interval_seconds;
        config.aggregation.age_reference = options.age_reference.to_string();
        config.aggregation.jurisdiction = options.jurisdiction.map(str::to_string);
        config.server.cors_origins = options.cors_origins.clone();
        config.auth.local_dev = options.auth == AuthMode::Disabled;
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid test config: {e}"))?;

        let auth = match options.auth {
            AuthMode::Disabled => AuthManager::disabled(),
            AuthMode::Enforced => {
                AuthManager::enforcing(TokenVerifier::from_pem(PUBLIC_KEY.as_bytes(), &config.auth)?)
            }
        };
        let source = HttpFhirSource::new(&stub.base_url, Duration::from_secs(5))?;
        let state = AppState::with_parts(config, Arc::new(source), auth)?;
        let router = create_router(state.clone());

        Ok(Self {
            router,
            stub,
            state,
        })
    }

    pub fn upstream(&self) -> &Upstream {
        &self.stub.upstream
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        self.request_with_extra_headers(method, path, body, &[])
            .await
    }

    pub async fn request_with_extra_headers(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, HeaderMap, Value)> {
        let (status, headers, bytes) = self
            .raw_request(method, path, body, extra_headers)
            .await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        Ok((status, headers, value))
    }

    pub async fn raw_request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        extra_headers: &[(&str, &str)],
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let mut builder = Request::builder().method(method).uri(path);
        for (name, value) in extra_headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_vec(&body)?))?,
            None => builder.body(Body::empty())?,
        };

        let response = self.router.clone().oneshot(request).await?;
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await?.to_bytes();
        Ok((status, headers, bytes))
    }

    /// GET /aggregated-data with an optional bearer token.
    pub async fn get_aggregated(
        &self,
        token: Option<&str>,
    ) -> anyhow::Result<(StatusCode, HeaderMap, Bytes)> {
        let authorization = token.map(|t| format!("Bearer {t}"));
        let headers: Vec<(&str, &str)> = authorization
            .as_deref()
            .map(|value| vec![("authorization", value)])
            .unwrap_or_default();
        self.raw_request(Method::GET, "/aggregated-data", None, &headers)
            .await
    }
}

pub fn assert_status(actual: StatusCode, expected: StatusCode, context: &str) {
    assert_eq!(
        actual, expected,
        "{context}: expected HTTP {expected}, got {actual}"
    );
}

pub fn json_body(bytes: &Bytes) -> Value {
    serde_json::from_slice(bytes).expect("JSON body")
}
