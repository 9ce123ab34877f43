//! Aggregation engine: fetch Immunizations, normalize, group and count.

use crate::metrics::METRICS;
use crate::normalize::{reference_date, Jurisdiction, NormalizedFact, Normalizer};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use iidi_fhir_client::{PatientResolver, ResourceFetcher};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

const IMMUNIZATION: &str = "Immunization";

/// One output row: a distinct combination of categorical fields and how often it occurred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AggregateRow {
    pub occurrence_year: String,
    pub jurisdiction: Jurisdiction,
    pub sex: String,
    pub age_group: String,
    pub dose: u32,
    pub count: u64,
    pub reference_date: String,
}

/// Anything that can produce a full set of aggregate rows.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self) -> Vec<AggregateRow>;
}

/// Count facts per (OccurrenceYear, Jurisdiction, Sex, AgeGroup, Dose).
///
/// Rows come out sorted by that tuple.
pub fn group_facts<I>(facts: I) -> Vec<AggregateRow>
where
    I: IntoIterator<Item = NormalizedFact>,
{
    let mut groups: BTreeMap<NormalizedFact, u64> = BTreeMap::new();
    for fact in facts {
        *groups.entry(fact).or_default() += 1;
    }

    groups
        .into_iter()
        .map(|(fact, count)| AggregateRow {
            reference_date: reference_date(&fact.occurrence_year),
            occurrence_year: fact.occurrence_year,
            jurisdiction: fact.jurisdiction,
            sex: fact.sex,
            age_group: fact.age_group,
            dose: fact.dose,
            count,
        })
        .collect()
}

/// Runs a full aggregation pass against the upstream FHIR server.
pub struct AggregationService {
    fetcher: ResourceFetcher,
    resolver: Arc<PatientResolver>,
    normalizer: Normalizer,
}

impl AggregationService {
    pub fn new(
        fetcher: ResourceFetcher,
        resolver: Arc<PatientResolver>,
        normalizer: Normalizer,
    ) -> Self {
        Self {
            fetcher,
            resolver,
            normalizer,
        }
    }

    pub fn resolver(&self) -> &Arc<PatientResolver> {
        &self.resolver
    }

    /// Aggregate with ages measured against `today`.
    ///
    /// Upstream failures are never surfaced: missing pages or patients shrink the result,
    /// in the worst case to an empty vector.
    pub async fn aggregate_on(&self, today: NaiveDate) -> Vec<AggregateRow> {
        let started = Instant::now();

        tracing::info!("Fetching Immunization resources...");
        let entries = self.fetcher.fetch_all(IMMUNIZATION).await;
        if entries.is_empty() {
            tracing::warn!("No Immunization records found.");
            return Vec::new();
        }

        let mut facts = Vec::with_capacity(entries.len());
        let mut skipped = 0usize;
        for entry in &entries {
            let Some(immunization) = entry.get("resource").filter(|r| r.is_object()) else {
                skipped += 1;
                continue;
            };
            match self.normalize(immunization, today).await {
                Some(fact) => facts.push(fact),
                None => skipped += 1,
            }
        }

        METRICS.records_processed.inc_by(facts.len() as u64);
        METRICS.records_skipped.inc_by(skipped as u64);

        if facts.is_empty() {
            tracing::warn!(skipped, "No valid records processed.");
            return Vec::new();
        }

        let processed = facts.len();
        let rows = group_facts(facts);

        tracing::info!(
            fetched = entries.len(),
            processed,
            skipped,
            groups = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Aggregation pass complete"
        );
        rows
    }

    async fn normalize(&self, immunization: &Value, today: NaiveDate) -> Option<NormalizedFact> {
        let fact = self
            .normalizer
            .normalize_record(immunization, &self.resolver, today)
            .await;
        if fact.is_none() {
            tracing::debug!(
                immunization_id = immunization.get("id").and_then(|id| id.as_str()),
                "Skipping Immunization without a resolvable patient"
            );
        }
        fact
    }
}

#[async_trait]
impl Aggregator for AggregationService {
    async fn aggregate(&self) -> Vec<AggregateRow> {
        let timer = METRICS.aggregation_duration.start_timer();
        let rows = self.aggregate_on(Utc::now().date_naive()).await;
        timer.observe_duration();

        METRICS.aggregation_runs.inc();
        METRICS.aggregate_rows.set(rows.len() as i64);
        METRICS.observe_patient_cache(self.resolver.stats());
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{AgeGrouping, UNKNOWN};
    use iidi_fhir_client::{Error as ClientError, FetchOptions, FhirSource};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::Mutex;

    const BASE: &str = "http://fhir.bc.test/fhir";

    /// Single-page Immunization search plus a Patient map; counts Patient reads.
    struct FixtureSource {
        immunizations: Vec<Value>,
        patients: HashMap<String, Value>,
        patient_reads: Mutex<usize>,
    }

    impl FixtureSource {
        fn new(immunizations: Vec<Value>, patients: Vec<Value>) -> Arc<Self> {
            let patients = patients
                .into_iter()
                .map(|p| (p["id"].as_str().unwrap().to_string(), p))
                .collect();
            Arc::new(Self {
                immunizations,
                patients,
                patient_reads: Mutex::new(0),
            })
        }

        fn patient_reads(&self) -> usize {
            *self.patient_reads.lock().unwrap()
        }
    }

    #[async_trait]
    impl FhirSource for FixtureSource {
        fn base_url(&self) -> &str {
            BASE
        }

        async fn get_bundle(&self, url: &str) -> iidi_fhir_client::Result<Value> {
            if let Some(id) = url.strip_prefix(&format!("{BASE}/Patient/")) {
                *self.patient_reads.lock().unwrap() += 1;
                return self.patients.get(id).cloned().ok_or(ClientError::Status {
                    status: 404,
                    url: url.to_string(),
                });
            }
            let entry: Vec<Value> = self
                .immunizations
                .iter()
                .map(|r| json!({ "resource": r }))
                .collect();
            Ok(json!({ "resourceType": "Bundle", "entry": entry }))
        }
    }

    fn service(source: Arc<FixtureSource>) -> AggregationService {
        let resolver = Arc::new(PatientResolver::new(source.clone(), 1000));
        let fetcher = ResourceFetcher::new(source, FetchOptions::default());
        let normalizer = Normalizer::new(Jurisdiction::infer_from_url(BASE), AgeGrouping::Years);
        AggregationService::new(fetcher, resolver, normalizer)
    }

    fn immunization(patient: Option<&str>, occurrence: &str, dose: &str) -> Value {
        let mut imm = json!({
            "resourceType": "Immunization",
            "occurrenceDateTime": occurrence,
            "protocolApplied": [{ "doseNumberString": dose }]
        });
        if let Some(patient) = patient {
            imm["patient"] = json!({ "reference": patient });
        }
        imm
    }

    fn patient(id: &str, gender: &str, birth: &str) -> Value {
        json!({ "resourceType": "Patient", "id": id, "gender": gender, "birthDate": birth })
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2022, 6, 1).unwrap()
    }

    #[tokio::test]
    async fn single_record_becomes_one_row() {
        let source = FixtureSource::new(
            vec![immunization(Some("Patient/1"), "2022-05-01", "2")],
            vec![patient("1", "female", "2020-01-01")],
        );

        let rows = service(source).aggregate_on(today()).await;

        assert_eq!(
            rows,
            vec![AggregateRow {
                occurrence_year: "2022".to_string(),
                jurisdiction: Jurisdiction::BC,
                sex: "Female".to_string(),
                age_group: "2 years".to_string(),
                dose: 2,
                count: 1,
                reference_date: "2022-12-31".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn counts_match_group_membership() {
        let source = FixtureSource::new(
            vec![
                immunization(Some("Patient/1"), "2021-03-01", "1"),
                immunization(Some("Patient/1"), "2021-09-01", "1"),
                immunization(Some("Patient/2"), "2021-04-01", "1"),
                immunization(Some("Patient/2"), "2022-04-01", "2"),
                immunization(Some("Patient/3"), "", "1"),
            ],
            vec![
                patient("1", "male", "1980-01-01"),
                patient("2", "male", "1980-02-01"),
                patient("3", "female", "1980-01-01"),
            ],
        );

        let rows = service(source.clone()).aggregate_on(today()).await;

        let summary: Vec<(&str, &str, u32, u64, &str)> = rows
            .iter()
            .map(|r| {
                (
                    r.occurrence_year.as_str(),
                    r.sex.as_str(),
                    r.dose,
                    r.count,
                    r.reference_date.as_str(),
                )
            })
            .collect();
        assert_eq!(
            summary,
            vec![
                ("2021", "Male", 1, 3, "2021-12-31"),
                ("2022", "Male", 2, 1, "2022-12-31"),
                (UNKNOWN, "Female", 1, 1, UNKNOWN),
            ]
        );
        assert_eq!(rows.iter().map(|r| r.count).sum::<u64>(), 5);
        // One read per distinct patient.
        assert_eq!(source.patient_reads(), 3);
    }

    #[tokio::test]
    async fn records_without_patient_contribute_nothing() {
        let source = FixtureSource::new(
            vec![
                immunization(None, "2022-05-01", "1"),
                immunization(Some("Patient/404"), "2022-05-01", "1"),
                immunization(Some("Patient/1"), "2022-05-01", "1"),
            ],
            vec![patient("1", "female", "2020-01-01")],
        );

        let rows = service(source).aggregate_on(today()).await;

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].count, 1);
    }

    #[tokio::test]
    async fn all_skipped_yields_empty() {
        let source = FixtureSource::new(vec![immunization(None, "2022-05-01", "1")], vec![]);
        assert!(service(source).aggregate_on(today()).await.is_empty());
    }

    #[tokio::test]
    async fn no_entries_yields_empty() {
        let source = FixtureSource::new(vec![], vec![]);
        assert!(service(source).aggregate_on(today()).await.is_empty());
    }

    #[test]
    fn grouping_sorts_by_key_tuple() {
        let fact = |year: &str, jurisdiction, sex: &str, dose| NormalizedFact {
            occurrence_year: year.to_string(),
            jurisdiction,
            sex: sex.to_string(),
            age_group: "1 year".to_string(),
            dose,
        };
        let rows = group_facts(vec![
            fact("2023", Jurisdiction::ON, "Male", 1),
            fact("2022", Jurisdiction::ON, "Male", 2),
            fact("2022", Jurisdiction::BC, "Male", 1),
            fact("2022", Jurisdiction::ON, "Female", 1),
            fact("2022", Jurisdiction::ON, "Male", 2),
        ]);

        let keys: Vec<(String, Jurisdiction, String, u32, u64)> = rows
            .into_iter()
            .map(|r| (r.occurrence_year, r.jurisdiction, r.sex, r.dose, r.count))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("2022".into(), Jurisdiction::BC, "Male".into(), 1, 1),
                ("2022".into(), Jurisdiction::ON, "Female".into(), 1, 1),
                ("2022".into(), Jurisdiction::ON, "Male".into(), 2, 2),
                ("2023".into(), Jurisdiction::ON, "Male".into(), 1, 1),
            ]
        );
    }

    #[test]
    fn rows_serialize_with_column_names() {
        let row = AggregateRow {
            occurrence_year: "2022".to_string(),
            jurisdiction: Jurisdiction::ON,
            sex: "Male".to_string(),
            age_group: "3 years".to_string(),
            dose: 1,
            count: 4,
            reference_date: "2022-12-31".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&row).unwrap(),
            json!({
                "OccurrenceYear": "2022",
                "Jurisdiction": "ON",
                "Sex": "Male",
                "AgeGroup": "3 years",
                "Dose": 1,
                "Count": 4,
                "ReferenceDate": "2022-12-31"
            })
        );
    }
}
