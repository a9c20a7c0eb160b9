//! Job provider contracts and the provider implementations.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobwatch_core::JobRecord;
use jobwatch_storage::{classify_status, FetchError, HttpFetcher, RetryDisposition};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

mod adzuna;
mod feed;
mod normalize;

pub use adzuna::{AdzunaConfig, AdzunaProvider, ADZUNA_DEFAULT_BASE_URL};
pub use feed::{JsonFeedConfig, JsonFeedProvider};
pub use normalize::{
    external_id_of, infer_job_type, infer_remote_type, infer_seniority, looks_remote,
    normalize_raw,
};

pub const CRATE_NAME: &str = "jobwatch-adapters";

/// One untyped posting exactly as the provider returned it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRecord(pub JsonValue);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOptions {
    pub page: u32,
    pub results_per_page: u32,
    pub salary_min: Option<u64>,
    pub max_days_old: Option<u32>,
    /// Keep only postings whose title or snippet reads as remote.
    pub remote_only: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            page: 1,
            results_per_page: 50,
            salary_min: None,
            max_days_old: None,
            remote_only: false,
        }
    }
}

/// Where a raw record came from; stamped onto every normalized record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchContext {
    pub search_term: String,
    pub location: String,
    pub region: Option<String>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterFetchError {
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("{provider}: credentials not configured")]
    MissingCredentials { provider: String },
    #[error("{provider}: http status {status} for {url}")]
    Http {
        provider: String,
        status: u16,
        url: String,
    },
    #[error("{provider}: {source}")]
    Transport {
        provider: String,
        #[source]
        source: FetchError,
    },
    #[error("{provider}: malformed response body: {source}")]
    MalformedBody {
        provider: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{provider}: response has no results array ({message})")]
    MissingResults { provider: String, message: String },
}

impl AdapterFetchError {
    pub(crate) fn from_fetch(provider: &str, err: FetchError) -> Self {
        match err {
            FetchError::HttpStatus { status, url } => AdapterFetchError::Http {
                provider: provider.to_string(),
                status,
                url,
            },
            other => AdapterFetchError::Transport {
                provider: provider.to_string(),
                source: other,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AdapterFetchError::InvalidQuery(_)
            | AdapterFetchError::MissingCredentials { .. }
            | AdapterFetchError::MissingResults { .. } => false,
            AdapterFetchError::Http { status, .. } => reqwest::StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            AdapterFetchError::Transport { source, .. } => {
                source.disposition() == RetryDisposition::Retryable
            }
            AdapterFetchError::MalformedBody { .. } => true,
        }
    }
}

pub(crate) fn validate_query(role: &str, location: &str) -> Result<(), AdapterFetchError> {
    if role.trim().is_empty() {
        return Err(AdapterFetchError::InvalidQuery("role must not be empty".into()));
    }
    if location.trim().is_empty() {
        return Err(AdapterFetchError::InvalidQuery("location must not be empty".into()));
    }
    Ok(())
}

/// A third-party job search API.
///
/// `fetch` performs one outbound call and nothing else; retries belong to the
/// caller. `normalize` is pure and total.
#[async_trait]
pub trait JobProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(
        &self,
        role: &str,
        location: &str,
        options: &SearchOptions,
    ) -> Result<Vec<RawRecord>, AdapterFetchError>;

    fn normalize(&self, raw: &RawRecord, ctx: &SearchContext) -> JobRecord;

    /// Fetch, normalize and apply the remote-only filter.
    async fn search(
        &self,
        role: &str,
        location: &str,
        options: &SearchOptions,
        ctx: &SearchContext,
    ) -> Result<Vec<JobRecord>, AdapterFetchError> {
        let raws = self.fetch(role, location, options).await?;
        let mut jobs = raws
            .iter()
            .map(|raw| self.normalize(raw, ctx))
            .collect::<Vec<_>>();
        if options.remote_only {
            jobs.retain(|j| looks_remote(&format!("{} {}", j.title, j.description)));
        }
        Ok(jobs)
    }
}

/// Salary-relevant slice of a comparison posting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketPosting {
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub created: Option<DateTime<Utc>>,
}

impl MarketPosting {
    pub fn midpoint(&self) -> Option<f64> {
        jobwatch_core::salary_midpoint(self.salary_min, self.salary_max)
    }
}

/// Source of comparison samples for market analysis. One call is one unit of quota.
#[async_trait]
pub trait MarketSampleSource: Send + Sync {
    async fn fetch_sample(&self, role: &str, location: &str) -> Result<Vec<MarketPosting>, AdapterFetchError>;
}

/// Credentials and endpoints for every known provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderSettings {
    pub adzuna: Option<AdzunaConfig>,
    pub json_feed: Option<JsonFeedConfig>,
}

/// Providers constructed once at startup, in a fixed order.
#[derive(Clone, Default)]
pub struct ProviderSet {
    pub providers: Vec<Arc<dyn JobProvider>>,
    pub market: Option<Arc<dyn MarketSampleSource>>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet")
            .field(
                "providers",
                &self.providers.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .field("market", &self.market.is_some())
            .finish()
    }
}

pub fn build_providers(settings: &ProviderSettings, http: Arc<HttpFetcher>) -> ProviderSet {
    let mut set = ProviderSet::default();

    match settings.adzuna.clone().filter(AdzunaConfig::has_credentials) {
        Some(config) => {
            let adzuna = Arc::new(AdzunaProvider::new(config, http.clone()));
            set.providers.push(adzuna.clone());
            set.market = Some(adzuna as Arc<dyn MarketSampleSource>);
        }
        None => info!(provider = "adzuna", "credentials missing, provider skipped"),
    }

    match settings.json_feed.clone().filter(JsonFeedConfig::is_configured) {
        Some(config) => set.providers.push(Arc::new(JsonFeedProvider::new(config, http))),
        None => info!(provider = "workbc", "endpoint or key missing, provider skipped"),
    }

    set
}

pub(crate) fn parse_body(provider: &str, body: &[u8]) -> Result<JsonValue, AdapterFetchError> {
    serde_json::from_slice(body).map_err(|source| AdapterFetchError::MalformedBody {
        provider: provider.to_string(),
        source,
    })
}
