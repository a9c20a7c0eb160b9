//! Tolerant conversion of provider payloads into [`JobRecord`]s.
//!
//! Provider shapes disagree on nearly every field: company may be an object
//! with `display_name`, a bare string or an `employer` field; salaries may be
//! numbers or numeric strings. Everything missing resolves to empty text or
//! `None`, never to an error.

use std::collections::BTreeSet;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jobwatch_core::{
    canonical_id, parse_timestamp, truncate_snippet, JobRecord, JobType, RemoteType,
    SeniorityLevel,
};
use serde_json::Value as JsonValue;

use crate::SearchContext;

const ID_FALLBACK_CHARS: usize = 128;
const REMOTE_MARKERS: &[&str] = &["remote", "work from home", "wfh", "anywhere in canada", "hybrid"];

pub(crate) fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    cur.as_str().map(str::trim).filter(|s| !s.is_empty())
}

/// Number at `path`, accepting numeric strings. Non-positive values count as missing.
pub(crate) fn json_f64(value: &JsonValue, path: &[&str]) -> Option<f64> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    let n = match cur {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().replace(',', "").parse::<f64>().ok(),
        _ => None,
    }?;
    (n.is_finite() && n > 0.0).then_some(n)
}

fn json_id(value: &JsonValue) -> Option<String> {
    match value.get("id")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_str<'a>(value: &'a JsonValue, paths: &[&[&str]]) -> Option<&'a str> {
    paths.iter().find_map(|p| json_str(value, p))
}

fn first_f64(value: &JsonValue, paths: &[&[&str]]) -> Option<f64> {
    paths.iter().find_map(|p| json_f64(value, p))
}

pub(crate) fn company_of(raw: &JsonValue) -> String {
    first_str(
        raw,
        &[
            &["company", "display_name"],
            &["company", "name"],
            &["company"],
            &["employer", "display_name"],
            &["employer", "name"],
            &["employer"],
        ],
    )
    .unwrap_or_default()
    .to_string()
}

pub(crate) fn location_of(raw: &JsonValue, fallback: &str) -> String {
    first_str(
        raw,
        &[&["location", "display_name"], &["city"], &["location"]],
    )
    .unwrap_or(fallback)
    .to_string()
}

pub(crate) fn posted_date_of(raw: &JsonValue) -> Option<chrono::DateTime<chrono::Utc>> {
    first_str(raw, &[&["created"], &["date"], &["postedDate"], &["publishDate"]])
        .and_then(parse_timestamp)
}

pub(crate) fn salary_bounds_of(raw: &JsonValue) -> (Option<f64>, Option<f64>) {
    (
        first_f64(raw, &[&["salary_min"], &["salaryMin"]]),
        first_f64(raw, &[&["salary_max"], &["salaryMax"]]),
    )
}

/// Provider id, or base64 of the leading characters of the URL (or title) when
/// the payload carries none.
pub fn external_id_of(raw: &JsonValue) -> String {
    if let Some(id) = json_id(raw) {
        return id;
    }
    let basis = first_str(raw, &[&["redirect_url"], &["url"], &["jobUrl"]])
        .or_else(|| json_str(raw, &["title"]))
        .unwrap_or_default();
    let prefix = basis.chars().take(ID_FALLBACK_CHARS).collect::<String>();
    BASE64.encode(prefix.as_bytes())
}

/// Shared raw-to-canonical mapping. Providers adjust currency and period afterwards.
pub fn normalize_raw(provider: &str, raw: &JsonValue, ctx: &SearchContext) -> JobRecord {
    let title = json_str(raw, &["title"]).unwrap_or_default().to_string();
    let description = json_str(raw, &["description"]).unwrap_or_default();
    let company = company_of(raw);
    let location = location_of(raw, &ctx.location);
    let url = first_str(raw, &[&["redirect_url"], &["url"], &["jobUrl"]])
        .unwrap_or_default()
        .to_string();
    let (salary_min, salary_max) = salary_bounds_of(raw);
    let external_id = external_id_of(raw);

    JobRecord {
        id: format!("{provider}:{external_id}"),
        external_id,
        canonical_id: canonical_id(&company, &title, &location),
        job_type: infer_job_type(&title, description),
        remote_type: infer_remote_type(&title, description, &location),
        seniority_level: infer_seniority(&title),
        description: truncate_snippet(description),
        title,
        company,
        location,
        url,
        salary_min,
        salary_max,
        salary_currency: json_str(raw, &["salary_currency"])
            .or_else(|| json_str(raw, &["currency"]))
            .map(ToString::to_string),
        salary_period: None,
        posted_date: posted_date_of(raw),
        provider: provider.to_string(),
        region: ctx.region.clone(),
        first_seen_at: ctx.fetched_at,
        last_seen_at: ctx.fetched_at,
        search_terms_matched: BTreeSet::from([ctx.search_term.clone()]),
    }
}

fn words(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn has_word(words: &[String], needle: &str) -> bool {
    words.iter().any(|w| w == needle)
}

pub fn infer_job_type(title: &str, description: &str) -> JobType {
    let title_lower = title.to_lowercase();
    let desc_lower = description.to_lowercase();
    let title_words = words(title);

    if has_word(&title_words, "intern") || title_lower.contains("internship") || desc_lower.contains("internship") {
        JobType::Internship
    } else if title_lower.contains("contract") || desc_lower.contains("contractor") {
        JobType::Contract
    } else if title_lower.contains("part time") || title_lower.contains("part-time") || desc_lower.contains("part-time") {
        JobType::PartTime
    } else if title_lower.contains("temporary") || has_word(&title_words, "temp") {
        JobType::Temporary
    } else {
        JobType::FullTime
    }
}

pub fn infer_remote_type(title: &str, description: &str, location: &str) -> RemoteType {
    let text = format!("{title} {description} {location}").to_lowercase();
    if text.contains("remote") || text.contains("work from home") {
        RemoteType::Remote
    } else if text.contains("hybrid") {
        RemoteType::Hybrid
    } else {
        RemoteType::Onsite
    }
}

pub fn infer_seniority(title: &str) -> SeniorityLevel {
    let w = words(title);
    let any = |needles: &[&str]| needles.iter().any(|n| has_word(&w, n));
    if any(&["senior", "sr"]) {
        SeniorityLevel::Senior
    } else if any(&["lead", "principal"]) {
        SeniorityLevel::Lead
    } else if any(&["director", "vp", "chief"]) {
        SeniorityLevel::Executive
    } else if any(&["junior", "jr", "entry"]) {
        SeniorityLevel::Entry
    } else {
        SeniorityLevel::Mid
    }
}

/// Textual remote heuristic applied to title plus snippet for remote regions.
pub fn looks_remote(text: &str) -> bool {
    let lower = text.to_lowercase();
    REMOTE_MARKERS.iter().any(|m| lower.contains(m))
}
