use std::sync::Arc;

use async_trait::async_trait;
use jobwatch_core::JobRecord;
use jobwatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;

use crate::{
    normalize_raw, parse_body, validate_query, AdapterFetchError, JobProvider, RawRecord,
    SearchContext, SearchOptions,
};

/// A keyed JSON job feed (WorkBC style). The body is either `{"results": [..]}`
/// or a bare array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonFeedConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
}

impl JsonFeedConfig {
    pub fn is_configured(&self) -> bool {
        !self.base_url.trim().is_empty() && !self.api_key.trim().is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct JsonFeedProvider {
    config: JsonFeedConfig,
    http: Arc<HttpFetcher>,
}

impl JsonFeedProvider {
    pub fn new(config: JsonFeedConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn items(&self, body: JsonValue) -> Result<Vec<JsonValue>, AdapterFetchError> {
        match body {
            JsonValue::Array(items) => Ok(items),
            JsonValue::Object(mut map) => match map.remove("results") {
                Some(JsonValue::Array(items)) => Ok(items),
                _ => Err(AdapterFetchError::MissingResults {
                    provider: self.config.name.clone(),
                    message: map
                        .get("message")
                        .and_then(JsonValue::as_str)
                        .unwrap_or("unknown error")
                        .to_string(),
                }),
            },
            _ => Err(AdapterFetchError::MissingResults {
                provider: self.config.name.clone(),
                message: "unexpected body shape".to_string(),
            }),
        }
    }
}

#[async_trait]
impl JobProvider for JsonFeedProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn fetch(
        &self,
        role: &str,
        location: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawRecord>, AdapterFetchError> {
        validate_query(role, location)?;
        if !self.config.is_configured() {
            return Err(AdapterFetchError::MissingCredentials {
                provider: self.config.name.clone(),
            });
        }
        let query = [
            ("what", role.to_string()),
            ("where", location.to_string()),
            ("page", options.page.max(1).to_string()),
            ("limit", options.results_per_page.max(1).to_string()),
        ];
        let headers = [("apikey", self.config.api_key.clone())];
        let resp = self
            .http
            .get(&self.config.name, &self.config.base_url, &query, &headers)
            .await
            .map_err(|e| AdapterFetchError::from_fetch(&self.config.name, e))?;
        let body = parse_body(&self.config.name, &resp.body)?;
        Ok(self.items(body)?.into_iter().map(RawRecord).collect())
    }

    fn normalize(&self, raw: &RawRecord, ctx: &SearchContext) -> JobRecord {
        normalize_raw(&self.config.name, &raw.0, ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use jobwatch_core::{JobType, SeniorityLevel};
    use jobwatch_storage::HttpClientConfig;
    use mockito::Matcher;
    use std::path::PathBuf;

    fn fixture(name: &str) -> String {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures").join(name);
        std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    fn provider(base_url: String) -> JsonFeedProvider {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
        JsonFeedProvider::new(
            JsonFeedConfig {
                name: "workbc".into(),
                base_url,
                api_key: "secret".into(),
            },
            http,
        )
    }

    fn ctx() -> SearchContext {
        SearchContext {
            search_term: "data analyst".into(),
            location: "British Columbia".into(),
            region: Some("BC".into()),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    #[tokio::test]
    async fn wrapped_results_are_normalized_with_flat_fields() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/jobs")
            .match_header("apikey", "secret")
            .match_query(Matcher::UrlEncoded("what".into(), "data analyst".into()))
            .with_status(200)
            .with_body(fixture("workbc_feed.json"))
            .create_async()
            .await;

        let feed = provider(format!("{}/jobs", server.url()));
        let jobs = feed
            .search("data analyst", "British Columbia", &SearchOptions::default(), &ctx())
            .await
            .unwrap();
        mock.assert_async().await;

        assert_eq!(jobs.len(), 2);
        let analyst = &jobs[0];
        assert_eq!(analyst.id, "workbc:WBC-88231");
        assert_eq!(analyst.company, "Province of British Columbia");
        assert_eq!(analyst.location, "Victoria");
        assert_eq!(analyst.salary_min, Some(52_000.0));
        assert_eq!(analyst.salary_max, Some(61_000.0));
        assert_eq!(analyst.salary_currency.as_deref(), Some("CAD"));
        assert_eq!(analyst.job_type, JobType::PartTime);
        assert_eq!(analyst.seniority_level, SeniorityLevel::Entry);
        assert_eq!(analyst.url, "https://www.workbc.ca/jobs/WBC-88231");
        assert!(analyst.posted_date.is_some());

        let lead = &jobs[1];
        assert_eq!(lead.company, "Coastal Freight");
        assert_eq!(lead.location, "Surrey");
        assert_eq!(lead.seniority_level, SeniorityLevel::Lead);
        assert!(lead.id.starts_with("workbc:"));
        assert_ne!(lead.external_id, "");
    }

    #[tokio::test]
    async fn bare_array_bodies_are_accepted() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/jobs")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"[{"id": 1, "title": "Analyst", "company": "Initech", "city": "Kelowna"}]"#)
            .create_async()
            .await;

        let raws = provider(format!("{}/jobs", server.url()))
            .fetch("analyst", "BC", &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(raws.len(), 1);
    }

    #[tokio::test]
    async fn unexpected_shapes_are_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/jobs")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(r#"{"message": "quota exceeded"}"#)
            .create_async()
            .await;
        let err = provider(format!("{}/jobs", server.url()))
            .fetch("analyst", "BC", &SearchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterFetchError::MissingResults { ref message, .. } if message == "quota exceeded"));
    }
}
