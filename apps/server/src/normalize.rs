//! Per-record normalization of Immunization + Patient pairs.
//!
//! FHIR resources are handled as loosely typed JSON; every field read is defensive and an
//! absent or malformed field falls back to `"Unknown"` (or dose 1) instead of failing the
//! record. A record is skipped only when it has no patient reference or the Patient cannot
//! be resolved.

use chrono::NaiveDate;
use iidi_fhir_client::PatientResolver;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

pub const UNKNOWN: &str = "Unknown";

/// Provincial source system of the data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Jurisdiction {
    BC,
    ON,
}

impl Jurisdiction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BC => "BC",
            Self::ON => "ON",
        }
    }

    /// Fallback used when no jurisdiction is configured: a base URL containing `bc`
    /// (any case) belongs to BC, anything else to ON.
    pub fn infer_from_url(url: &str) -> Self {
        if url.to_ascii_lowercase().contains("bc") {
            Self::BC
        } else {
            Self::ON
        }
    }
}

impl fmt::Display for Jurisdiction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Jurisdiction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BC" => Ok(Self::BC),
            "ON" => Ok(Self::ON),
            other => Err(format!("unknown jurisdiction '{other}' (expected BC or ON)")),
        }
    }
}

/// How a patient's age is rendered into the `AgeGroup` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgeGrouping {
    /// Whole years: `"1 year"` up to age 1, then `"{age} years"`.
    #[default]
    Years,
    /// `"0-2 years"`, `"3-5 years"`, `"6-17 years"`, `"18+ years"`.
    Buckets,
}

impl AgeGrouping {
    pub fn label(self, age: i64) -> String {
        match self {
            Self::Years if age <= 1 => "1 year".to_string(),
            Self::Years => format!("{age} years"),
            Self::Buckets if age < 2 => "0-2 years".to_string(),
            Self::Buckets if age < 5 => "3-5 years".to_string(),
            Self::Buckets if age < 18 => "6-17 years".to_string(),
            Self::Buckets => "18+ years".to_string(),
        }
    }
}

impl FromStr for AgeGrouping {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "years" => Ok(Self::Years),
            "buckets" => Ok(Self::Buckets),
            other => Err(format!(
                "unknown age grouping '{other}' (expected years or buckets)"
            )),
        }
    }
}

/// Point in time ages are measured against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgeReference {
    /// The date of the aggregation pass.
    #[default]
    Today,
    /// The immunization's occurrence date (age at vaccination). Falls back to the pass date
    /// when the occurrence is missing or not a full date.
    Occurrence,
}

impl FromStr for AgeReference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "today" | "now" => Ok(Self::Today),
            "occurrence" => Ok(Self::Occurrence),
            other => Err(format!(
                "unknown age reference '{other}' (expected today or occurrence)"
            )),
        }
    }
}

/// Categorical view of one Immunization. Lives only for one aggregation pass.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NormalizedFact {
    pub occurrence_year: String,
    pub jurisdiction: Jurisdiction,
    pub sex: String,
    pub age_group: String,
    pub dose: u32,
}

/// Deployment-wide normalization settings.
#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    pub jurisdiction: Jurisdiction,
    pub age_grouping: AgeGrouping,
    pub age_reference: AgeReference,
}

impl Normalizer {
    pub fn new(jurisdiction: Jurisdiction, age_grouping: AgeGrouping) -> Self {
        Self {
            jurisdiction,
            age_grouping,
            age_reference: AgeReference::default(),
        }
    }

    pub fn with_age_reference(mut self, age_reference: AgeReference) -> Self {
        self.age_reference = age_reference;
        self
    }

    /// Normalize one Immunization, resolving its Patient through `resolver`.
    ///
    /// Returns `None` (skip) when the patient reference is missing or the Patient cannot
    /// be read.
    pub async fn normalize_record(
        &self,
        immunization: &Value,
        resolver: &PatientResolver,
        today: NaiveDate,
    ) -> Option<NormalizedFact> {
        let reference = patient_reference(immunization)?;
        let patient = resolver.resolve(reference).await?;
        Some(self.normalize(immunization, &patient, today))
    }

    /// Derive the categorical fields from an already resolved Patient.
    pub fn normalize(
        &self,
        immunization: &Value,
        patient: &Value,
        today: NaiveDate,
    ) -> NormalizedFact {
        let reference_date = match self.age_reference {
            AgeReference::Today => today,
            AgeReference::Occurrence => occurrence_date(immunization).unwrap_or(today),
        };

        NormalizedFact {
            occurrence_year: occurrence_year(immunization),
            jurisdiction: self.jurisdiction,
            sex: sex(patient),
            age_group: age_group(patient, reference_date, self.age_grouping),
            dose: dose_number(immunization),
        }
    }
}

/// `Immunization.patient.reference`, if present and non-blank.
pub fn patient_reference(immunization: &Value) -> Option<&str> {
    immunization
        .get("patient")?
        .get("reference")?
        .as_str()
        .filter(|r| !r.trim().is_empty())
}

/// First four characters of `occurrenceDateTime`, or `"Unknown"` when the timestamp is
/// absent or does not start with a four digit year.
pub fn occurrence_year(immunization: &Value) -> String {
    let Some(occurrence) = immunization
        .get("occurrenceDateTime")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
    else {
        return UNKNOWN.to_string();
    };

    let prefix: String = occurrence.chars().take(4).collect();
    let year = prefix.trim();
    if is_year(year) {
        year.to_string()
    } else {
        UNKNOWN.to_string()
    }
}

fn occurrence_date(immunization: &Value) -> Option<NaiveDate> {
    let occurrence = immunization.get("occurrenceDateTime")?.as_str()?.trim();
    let date = occurrence.get(..10)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

/// `Patient.gender` with the first letter upper-cased and the rest lower-cased.
pub fn sex(patient: &Value) -> String {
    patient
        .get("gender")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .map(capitalize)
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Whole years between `birth_date` and `today` (days / 365, floored).
///
/// `None` when the date is not a full `YYYY-MM-DD` calendar date or lies in the future.
pub fn age_in_years(birth_date: &str, today: NaiveDate) -> Option<i64> {
    let birth = NaiveDate::parse_from_str(birth_date.trim(), "%Y-%m-%d").ok()?;
    if birth > today {
        return None;
    }
    Some((today - birth).num_days() / 365)
}

pub fn age_group(patient: &Value, today: NaiveDate, grouping: AgeGrouping) -> String {
    patient
        .get("birthDate")
        .and_then(Value::as_str)
        .and_then(|birth| age_in_years(birth, today))
        .map(|age| grouping.label(age))
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Dose number of the first `protocolApplied` entry; 1 when absent, non-numeric or zero.
pub fn dose_number(immunization: &Value) -> u32 {
    let Some(protocol) = immunization
        .get("protocolApplied")
        .and_then(Value::as_array)
        .and_then(|entries| entries.first())
    else {
        return 1;
    };

    let from_string = protocol
        .get("doseNumberString")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|s| s.parse::<u32>().ok());
    let from_int = || {
        protocol
            .get("doseNumberPositiveInt")
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };

    from_string
        .or_else(from_int)
        .filter(|&n| n >= 1)
        .unwrap_or(1)
}

/// `"2022"` → `"2022-12-31"`; anything that is not a four digit year → `"Unknown"`.
pub fn reference_date(occurrence_year: &str) -> String {
    if is_year(occurrence_year) {
        format!("{occurrence_year}-12-31")
    } else {
        UNKNOWN.to_string()
    }
}

fn is_year(s: &str) -> bool {
    s.len() == 4 && s.bytes().all(|b| b.is_ascii_digit())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first
            .to_uppercase()
            .chain(chars.flat_map(char::to_lowercase))
            .collect(),
        None => String::new(),
    }
}
