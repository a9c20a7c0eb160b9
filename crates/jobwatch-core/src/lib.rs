//! Core domain model for jobwatch: canonical job records, batches and market analysis.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

mod identity;
mod search_key;

pub use identity::{canonical_id, normalize_text};
pub use search_key::{SearchKey, SearchTarget};

pub const CRATE_NAME: &str = "jobwatch-core";

/// Maximum number of characters kept from a provider description.
pub const SNIPPET_LIMIT: usize = 280;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    FullTime,
    PartTime,
    Contract,
    Temporary,
    Internship,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteType {
    Remote,
    Hybrid,
    Onsite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeniorityLevel {
    Entry,
    Mid,
    Senior,
    Lead,
    Executive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SalaryPeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

/// Canonical, provider-agnostic job posting.
///
/// Salary and date fields are `None` when the provider did not supply them;
/// they are never coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// `"{provider}:{external_id}"`.
    pub id: String,
    pub external_id: String,
    /// Composite dedup key. Absent when both company and title are empty.
    #[serde(default)]
    pub canonical_id: Option<String>,
    pub title: String,
    pub company: String,
    pub location: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub salary_min: Option<f64>,
    #[serde(default)]
    pub salary_max: Option<f64>,
    #[serde(default)]
    pub salary_currency: Option<String>,
    #[serde(default)]
    pub salary_period: Option<SalaryPeriod>,
    #[serde(default)]
    pub posted_date: Option<DateTime<Utc>>,
    pub job_type: JobType,
    pub remote_type: RemoteType,
    pub seniority_level: SeniorityLevel,
    pub provider: String,
    #[serde(default)]
    pub region: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub search_terms_matched: BTreeSet<String>,
}

impl JobRecord {
    /// Key used by the dedup pass: the canonical id, or the provider id when absent.
    pub fn dedup_key(&self) -> &str {
        self.canonical_id.as_deref().unwrap_or(&self.id)
    }

    pub fn has_salary(&self) -> bool {
        salary_midpoint(self.salary_min, self.salary_max).is_some()
    }

    pub fn salary_midpoint(&self) -> Option<f64> {
        salary_midpoint(self.salary_min, self.salary_max)
    }

    /// Highest advertised salary figure, used to prioritise analysis work.
    pub fn salary_ceiling(&self) -> f64 {
        positive(self.salary_max)
            .or(positive(self.salary_min))
            .unwrap_or(0.0)
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

/// Representative salary for a range.
///
/// Both bounds: midpoint. Only a maximum: 90% of it. Only a minimum: 110% of it.
/// Non-positive bounds count as missing.
pub fn salary_midpoint(min: Option<f64>, max: Option<f64>) -> Option<f64> {
    match (positive(min), positive(max)) {
        (Some(min), Some(max)) => Some((min + max) / 2.0),
        (None, Some(max)) => Some(max * 0.9),
        (Some(min), None) => Some(min * 1.1),
        (None, None) => None,
    }
}

/// Truncate free text to [`SNIPPET_LIMIT`] characters on a char boundary.
pub fn truncate_snippet(text: &str) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(SNIPPET_LIMIT) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}

/// Parse a provider timestamp. Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS`
/// (assumed UTC) and bare dates.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Output ordering: newest post date first, undated last, then title, then id.
pub fn compare_for_output(a: &JobRecord, b: &JobRecord) -> Ordering {
    let da = a.posted_date.map(|d| d.timestamp_millis()).unwrap_or(0);
    let db = b.posted_date.map(|d| d.timestamp_millis()).unwrap_or(0);
    db.cmp(&da)
        .then_with(|| a.title.cmp(&b.title))
        .then_with(|| a.id.cmp(&b.id))
}

pub fn sort_for_output(jobs: &mut [JobRecord]) {
    jobs.sort_by(compare_for_output);
}

/// Persisted batch document, fully replaced on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsBatch {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub jobs: Vec<JobRecord>,
}

impl JobsBatch {
    pub fn new(generated_at: DateTime<Utc>, jobs: Vec<JobRecord>) -> Self {
        Self {
            generated_at,
            total: jobs.len(),
            jobs,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionType {
    Remote,
    Onsite,
}

/// A location to search, supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    #[serde(rename = "where")]
    pub where_: String,
    #[serde(rename = "type")]
    pub kind: RegionType,
}

impl Region {
    pub fn is_remote(&self) -> bool {
        self.kind == RegionType::Remote
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPosition {
    Below,
    Average,
    Above,
    Excellent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DemandLevel {
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendDirection {
    Declining,
    Stable,
    Growing,
    Hot,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SalaryBand {
    pub min: f64,
    pub max: f64,
}

/// Comparison of one job's salary against a market sample.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SalaryAnalysis {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_salary: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_range: Option<SalaryBand>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub market_position: Option<MarketPosition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demand_level: Option<DemandLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend_direction: Option<TrendDirection>,
    pub confidence: f64,
}

impl SalaryAnalysis {
    pub fn low_confidence() -> Self {
        Self {
            confidence: 0.1,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobWithAnalysis {
    #[serde(flatten)]
    pub job: JobRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary_analysis: Option<SalaryAnalysis>,
}

/// Batch document carrying market analysis for a subset of jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedBatch {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub analyzed: usize,
    pub jobs: Vec<JobWithAnalysis>,
}
