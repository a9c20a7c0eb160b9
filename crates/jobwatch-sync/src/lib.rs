//! Sync orchestration: configuration, dedup, freshness, market analysis,
//! the provider matrix run, the refresh-queue worker and the cache-first feed.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobwatch_adapters::{build_providers, ProviderSet};
use jobwatch_core::{EnrichedBatch, Region};
use jobwatch_storage::{BatchStore, HttpFetcher, SqliteStore};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

mod config;
mod dedup;
mod feed;
mod freshness;
mod market;
mod pipeline;
mod refresh;

pub use config::{ConfigError, SyncConfig, Watchlist, WatchlistConfig};
pub use dedup::dedup_jobs;
pub use feed::{FeedResult, FeedSource, JobFeed};
pub use freshness::{apply_freshness, load_first_seen, FirstSeenLookup, SeenEntry, SeenIndex};
pub use market::{
    compute_analysis, demand_level, market_position, trend_direction, MarketAnalysisEngine,
    MarketConfig,
};
pub use pipeline::{search_with_retry, SyncPipeline, SyncRunSummary};
pub use refresh::{RefreshSummary, RefreshWorker};

pub const CRATE_NAME: &str = "jobwatch-sync";

/// Long-lived collaborators built once from [`SyncConfig`] and shared by the
/// binary, the scheduler and the web server.
#[derive(Clone)]
pub struct Services {
    pub config: SyncConfig,
    pub store: Arc<SqliteStore>,
    pub providers: ProviderSet,
    pub batches: BatchStore,
}

impl std::fmt::Debug for Services {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Services")
            .field("database_url", &self.config.database_url)
            .field("output_dir", &self.batches.dir())
            .field("providers", &self.providers)
            .finish()
    }
}

impl Services {
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let store = SqliteStore::connect(&config.database_url)
            .await
            .with_context(|| format!("opening {}", config.database_url))?;
        store.migrate().await.context("running migrations")?;
        let http = HttpFetcher::new(config.http_client_config()).context("building http client")?;
        let providers = build_providers(&config.providers, Arc::new(http));
        let batches = BatchStore::new(config.output_dir.clone());
        Ok(Self {
            config,
            store: Arc::new(store),
            providers,
            batches,
        })
    }

    pub fn pipeline(&self, watchlists: WatchlistConfig) -> SyncPipeline {
        SyncPipeline::new(
            self.config.clone(),
            watchlists,
            self.providers.providers.clone(),
            self.batches.clone(),
        )
        .with_cache(self.store.clone())
    }

    pub fn refresh_worker(&self, regions: &[Region]) -> RefreshWorker {
        RefreshWorker::new(
            self.providers.providers.clone(),
            self.store.clone(),
            self.store.clone(),
            self.config.cache_ttl(),
        )
        .with_results_per_page(self.config.results_per_page)
        .with_regions(regions)
    }

    pub fn feed(&self) -> JobFeed {
        JobFeed::new(self.store.clone(), self.store.clone(), self.batches.clone())
    }

    pub fn market_engine(&self) -> MarketAnalysisEngine {
        MarketAnalysisEngine::new(
            self.providers.market.clone(),
            self.store.clone(),
            MarketConfig {
                max_daily_calls: self.config.market_max_daily_calls,
                min_sample_postings: self.config.market_min_sample_postings,
                ..MarketConfig::default()
            },
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalyzeSummary {
    pub generated_at: DateTime<Utc>,
    pub total: usize,
    pub analyzed: usize,
    pub enriched_path: String,
}

/// Enrich the persisted batch with market analysis and write `jobs_enriched.json`.
pub async fn analyze_batch(
    batches: &BatchStore,
    engine: &MarketAnalysisEngine,
    now: DateTime<Utc>,
) -> Result<AnalyzeSummary> {
    let batch = batches
        .load_batch()
        .await?
        .with_context(|| format!("no batch at {}; run sync first", batches.batch_path().display()))?;
    let jobs = engine.enrich(batch.jobs, now).await;
    let analyzed = jobs.iter().filter(|j| j.salary_analysis.is_some()).count();
    let enriched = EnrichedBatch {
        generated_at: now,
        total: jobs.len(),
        analyzed,
        jobs,
    };
    let path = batches
        .persist_enriched(&enriched)
        .await
        .context("persisting enriched batch")?;
    info!(total = enriched.total, analyzed, path = %path.display(), "enriched batch written");
    Ok(AnalyzeSummary {
        generated_at: now,
        total: enriched.total,
        analyzed,
        enriched_path: path.display().to_string(),
    })
}

/// Cron jobs for the matrix sync and the refresh-queue drain. `None` when disabled.
pub async fn maybe_build_scheduler(services: &Services) -> Result<Option<JobScheduler>> {
    if !services.config.scheduler_enabled {
        return Ok(None);
    }
    let watchlists = services.config.load_watchlists()?;
    let worker = Arc::new(services.refresh_worker(&watchlists.regions));
    let pipeline = Arc::new(services.pipeline(watchlists));

    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let sync_cron = &services.config.sync_cron;
    let job = Job::new_async(sync_cron.as_str(), move |_uuid, _l| {
        let pipeline = pipeline.clone();
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(run_id = %summary.run_id, total = summary.total, "scheduled sync finished"),
                Err(err) => error!(error = %err, "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {sync_cron}"))?;
    sched.add(job).await.context("adding sync job")?;

    let refresh_cron = &services.config.refresh_cron;
    let job = Job::new_async(refresh_cron.as_str(), move |_uuid, _l| {
        let worker = worker.clone();
        Box::pin(async move {
            match worker.drain(RefreshWorker::DEFAULT_BATCH).await {
                Ok(summary) => info!(
                    processed = summary.processed,
                    failed = summary.failed,
                    "scheduled refresh finished"
                ),
                Err(err) => error!(error = %err, "scheduled refresh failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {refresh_cron}"))?;
    sched.add(job).await.context("adding refresh job")?;

    Ok(Some(sched))
}

pub async fn run_sync_once_from_env() -> Result<SyncRunSummary> {
    let config = SyncConfig::from_env();
    let watchlists = config.load_watchlists()?;
    let services = Services::from_config(config).await?;
    services.pipeline(watchlists).run_once().await
}


#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use jobwatch_adapters::{
        normalize_raw, AdapterFetchError, JobProvider, RawRecord, SearchContext, SearchOptions,
    };
    use jobwatch_core::{canonical_id, JobRecord, JobType, RemoteType, SeniorityLevel};
    use serde_json::{json, Value as JsonValue};

    pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 0, 0).single().unwrap()
    }

    pub fn job(provider: &str, external_id: &str, company: &str, title: &str, location: &str) -> JobRecord {
        JobRecord {
            id: format!("{provider}:{external_id}"),
            external_id: external_id.to_string(),
            canonical_id: canonical_id(company, title, location),
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            description: String::new(),
            url: String::new(),
            salary_min: None,
            salary_max: None,
            salary_currency: None,
            salary_period: None,
            posted_date: None,
            job_type: JobType::FullTime,
            remote_type: RemoteType::Onsite,
            seniority_level: SeniorityLevel::Mid,
            provider: provider.to_string(),
            region: None,
            first_seen_at: at(1, 0),
            last_seen_at: at(1, 0),
            search_terms_matched: Default::default(),
        }
    }

    pub fn posting(id: &str, company: &str, title: &str, location: &str) -> JsonValue {
        json!({"id": id, "company": {"display_name": company}, "title": title, "location": {"display_name": location}})
    }

    /// Scripted provider: answers per role, optionally fails with a status.
    pub struct FakeProvider {
        name: String,
        by_role: Mutex<HashMap<String, Vec<JsonValue>>>,
        fail_status: Mutex<Option<u16>>,
        pub calls: AtomicUsize,
    }

    impl FakeProvider {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                by_role: Mutex::new(HashMap::new()),
                fail_status: Mutex::new(None),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn with(self, role: &str, postings: Vec<JsonValue>) -> Self {
            self.set(role, postings);
            self
        }

        pub fn set(&self, role: &str, postings: Vec<JsonValue>) {
            self.by_role.lock().unwrap().insert(role.to_string(), postings);
        }

        pub fn failing(self, status: u16) -> Self {
            *self.fail_status.lock().unwrap() = Some(status);
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobProvider for FakeProvider {
        fn name(&self) -> &str {
            &self.name
        }

        async fn fetch(
            &self,
            role: &str,
            _location: &str,
            _options: &SearchOptions,
        ) -> Result<Vec<RawRecord>, AdapterFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(status) = *self.fail_status.lock().unwrap() {
                return Err(AdapterFetchError::Http {
                    provider: self.name.clone(),
                    status,
                    url: "http://fake".into(),
                });
            }
            let postings = self.by_role.lock().unwrap().get(role).cloned().unwrap_or_default();
            Ok(postings.into_iter().map(RawRecord).collect())
        }

        fn normalize(&self, raw: &RawRecord, ctx: &SearchContext) -> JobRecord {
            normalize_raw(&self.name, &raw.0, ctx)
        }
    }
}
