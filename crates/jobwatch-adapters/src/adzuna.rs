use std::sync::Arc;

use async_trait::async_trait;
use jobwatch_core::{JobRecord, SalaryPeriod};
use jobwatch_storage::HttpFetcher;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::normalize::{json_str, posted_date_of, salary_bounds_of};
use crate::{
    normalize_raw, parse_body, validate_query, AdapterFetchError, JobProvider, MarketPosting,
    MarketSampleSource, RawRecord, SearchContext, SearchOptions,
};

pub const ADZUNA_DEFAULT_BASE_URL: &str = "https://api.adzuna.com/v1/api/jobs";
const PROVIDER: &str = "adzuna";
const MARKET_SAMPLE_SIZE: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdzunaConfig {
    pub app_id: String,
    pub app_key: String,
    pub country: String,
    pub base_url: String,
}

impl Default for AdzunaConfig {
    fn default() -> Self {
        Self {
            app_id: String::new(),
            app_key: String::new(),
            country: "ca".to_string(),
            base_url: ADZUNA_DEFAULT_BASE_URL.to_string(),
        }
    }
}

impl AdzunaConfig {
    pub fn has_credentials(&self) -> bool {
        !self.app_id.trim().is_empty() && !self.app_key.trim().is_empty()
    }
}

/// Adzuna search API. Salaries are reported yearly in the country's currency.
#[derive(Debug, Clone)]
pub struct AdzunaProvider {
    config: AdzunaConfig,
    http: Arc<HttpFetcher>,
}

impl AdzunaProvider {
    pub fn new(config: AdzunaConfig, http: Arc<HttpFetcher>) -> Self {
        Self { config, http }
    }

    fn search_url(&self, page: u32) -> String {
        format!(
            "{}/{}/search/{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.country,
            page.max(1)
        )
    }

    fn currency(&self) -> &'static str {
        match self.config.country.as_str() {
            "gb" => "GBP",
            "us" => "USD",
            "au" => "AUD",
            "de" | "fr" | "nl" | "it" | "es" | "at" => "EUR",
            _ => "CAD",
        }
    }

    async fn get_results(
        &self,
        page: u32,
        query: Vec<(&str, String)>,
    ) -> Result<Vec<JsonValue>, AdapterFetchError> {
        if !self.config.has_credentials() {
            return Err(AdapterFetchError::MissingCredentials {
                provider: PROVIDER.to_string(),
            });
        }
        let mut params = vec![
            ("app_id", self.config.app_id.clone()),
            ("app_key", self.config.app_key.clone()),
        ];
        params.extend(query);
        params.push(("content-type", "application/json".to_string()));

        let url = self.search_url(page);
        let resp = self
            .http
            .get(PROVIDER, &url, &params, &[])
            .await
            .map_err(|e| AdapterFetchError::from_fetch(PROVIDER, e))?;
        let body = parse_body(PROVIDER, &resp.body)?;

        match body.get("results").and_then(JsonValue::as_array) {
            Some(results) => {
                debug!(
                    provider = PROVIDER,
                    count = body.get("count").and_then(JsonValue::as_u64),
                    returned = results.len(),
                    "adzuna page received"
                );
                Ok(results.clone())
            }
            None => Err(AdapterFetchError::MissingResults {
                provider: PROVIDER.to_string(),
                message: json_str(&body, &["message"])
                    .or_else(|| json_str(&body, &["exception"]))
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
        }
    }
}

#[async_trait]
impl JobProvider for AdzunaProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn fetch(
        &self,
        role: &str,
        location: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawRecord>, AdapterFetchError> {
        validate_query(role, location)?;
        let mut query = vec![
            ("what", role.to_string()),
            ("where", location.to_string()),
            ("results_per_page", options.results_per_page.max(1).to_string()),
            ("sort_by", "date".to_string()),
        ];
        if let Some(salary_min) = options.salary_min {
            query.push(("salary_min", salary_min.to_string()));
        }
        if let Some(days) = options.max_days_old {
            query.push(("max_days_old", days.to_string()));
        }
        let results = self.get_results(options.page, query).await?;
        Ok(results.into_iter().map(RawRecord).collect())
    }

    fn normalize(&self, raw: &RawRecord, ctx: &SearchContext) -> JobRecord {
        let mut job = normalize_raw(PROVIDER, &raw.0, ctx);
        job.salary_currency = Some(self.currency().to_string());
        job.salary_period = Some(SalaryPeriod::Yearly);
        job
    }
}

#[async_trait]
impl MarketSampleSource for AdzunaProvider {
    async fn fetch_sample(&self, role: &str, location: &str) -> Result<Vec<MarketPosting>, AdapterFetchError> {
        validate_query(role, location)?;
        let query = vec![
            ("what", role.to_string()),
            ("where", location.to_string()),
            ("results_per_page", MARKET_SAMPLE_SIZE.to_string()),
            ("sort_by", "salary".to_string()),
        ];
        let results = self.get_results(1, query).await?;
        Ok(results
            .iter()
            .map(|raw| {
                let (salary_min, salary_max) = salary_bounds_of(raw);
                MarketPosting {
                    salary_min,
                    salary_max,
                    created: posted_date_of(raw),
                }
            })
            .collect())
    }
}
