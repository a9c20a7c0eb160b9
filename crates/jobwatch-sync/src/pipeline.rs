//! Provider × role × region matrix run.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use jobwatch_adapters::{AdapterFetchError, JobProvider, SearchContext, SearchOptions};
use jobwatch_core::{sort_for_output, JobRecord, JobsBatch, Region, SearchKey, SearchTarget};
use jobwatch_storage::{retry_with_backoff, BackoffPolicy, BatchStore, CacheEntry, CacheStore};
use serde::Serialize;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{SyncConfig, WatchlistConfig};
use crate::dedup::dedup_jobs;
use crate::freshness::{apply_freshness, load_first_seen};

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub cells: usize,
    pub failed_fetches: usize,
    pub fetched: usize,
    pub total: usize,
    pub new_jobs: usize,
    pub batch_path: String,
}

#[derive(Debug, Clone)]
struct Cell {
    role: String,
    region: Region,
}

#[derive(Debug)]
struct CellOutcome {
    target: SearchTarget,
    jobs: Vec<JobRecord>,
    failures: usize,
    any_ok: bool,
}

/// One provider search with retries on retryable failures.
pub async fn search_with_retry(
    provider: &dyn JobProvider,
    target: &SearchTarget,
    options: &SearchOptions,
    ctx: &SearchContext,
    policy: &BackoffPolicy,
) -> Result<Vec<JobRecord>, AdapterFetchError> {
    retry_with_backoff(
        policy,
        |attempt| {
            if attempt > 0 {
                debug!(provider = provider.name(), attempt, "retrying provider search");
            }
            provider.search(&target.role, &target.location, options, ctx)
        },
        AdapterFetchError::is_retryable,
    )
    .await
}

pub struct SyncPipeline {
    config: SyncConfig,
    watchlists: WatchlistConfig,
    providers: Vec<Arc<dyn JobProvider>>,
    cache: Option<Arc<dyn CacheStore>>,
    batches: BatchStore,
    backoff: BackoffPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        watchlists: WatchlistConfig,
        providers: Vec<Arc<dyn JobProvider>>,
        batches: BatchStore,
    ) -> Self {
        Self {
            config,
            watchlists,
            providers,
            cache: None,
            batches,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Warm the search cache with every cell's results.
    pub fn with_cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn batches(&self) -> &BatchStore {
        &self.batches
    }

    /// Watchlist → region → synonym order; a synonym shared by two watchlists runs once per region.
    fn cells(&self) -> Vec<Cell> {
        let mut seen = HashSet::new();
        let mut cells = Vec::new();
        for watchlist in &self.watchlists.watchlists {
            for region in &self.watchlists.regions {
                for role in &watchlist.synonyms {
                    if seen.insert((role.clone(), region.name.clone())) {
                        cells.push(Cell {
                            role: role.clone(),
                            region: region.clone(),
                        });
                    }
                }
            }
        }
        cells
    }

    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        self.run_at(Utc::now()).await
    }

    /// Run the full matrix and replace the batch. Only persistence failures are errors.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id);
        async move {
            let started_at = Utc::now();
            let cells = self.cells();
            if self.providers.is_empty() {
                warn!("no providers configured; the batch will be empty");
            }
            info!(cells = cells.len(), providers = self.providers.len(), "sync run started");

            let cell_futures: Vec<_> = cells.iter().map(|cell| self.run_cell(cell, now)).collect();
            let outcomes: Vec<CellOutcome> = stream::iter(cell_futures)
                .buffered(self.config.concurrency.max(1))
                .collect()
                .await;

            let failed_fetches: usize = outcomes.iter().map(|o| o.failures).sum();
            self.warm_cache(&outcomes, now).await;
            let all: Vec<JobRecord> = outcomes.into_iter().flat_map(|o| o.jobs).collect();
            let fetched = all.len();

            let mut jobs = dedup_jobs(all);
            let (lookup, mut index) = load_first_seen(&self.batches).await;
            apply_freshness(&mut jobs, &lookup, now);
            sort_for_output(&mut jobs);
            let new_jobs = jobs.iter().filter(|j| j.first_seen_at == now).count();

            // Index before batch: a published batch always has its sightings recorded.
            index.record(&jobs, now, self.config.seen_retention());
            index
                .persist(&self.batches)
                .await
                .context("persisting seen index")?;
            let batch = JobsBatch::new(now, jobs);
            let batch_path = self.batches.persist_batch(&batch).await.context("persisting batch")?;

            let finished_at = Utc::now();
            info!(
                total = batch.total,
                fetched,
                new_jobs,
                failed_fetches,
                path = %batch_path.display(),
                "sync run finished"
            );
            Ok(SyncRunSummary {
                run_id,
                started_at,
                finished_at,
                cells: cells.len(),
                failed_fetches,
                fetched,
                total: batch.total,
                new_jobs,
                batch_path: batch_path.display().to_string(),
            })
        }
        .instrument(span)
        .await
    }

    /// One cache write per search key. Synonyms that normalize to the same key
    /// share an entry, so their successful cells are merged first.
    async fn warm_cache(&self, outcomes: &[CellOutcome], now: DateTime<Utc>) {
        let Some(cache) = &self.cache else {
            return;
        };
        let mut order: Vec<SearchKey> = Vec::new();
        let mut merged: HashMap<SearchKey, (&SearchTarget, Vec<JobRecord>)> = HashMap::new();
        for outcome in outcomes.iter().filter(|o| o.any_ok) {
            let key = outcome.target.key();
            merged
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push(key);
                    (&outcome.target, Vec::new())
                })
                .1
                .extend(outcome.jobs.iter().cloned());
        }
        for key in order {
            let Some((target, jobs)) = merged.remove(&key) else {
                continue;
            };
            let entry = CacheEntry::new(target, dedup_jobs(jobs), now, self.config.cache_ttl());
            if let Err(err) = cache.upsert(&entry).await {
                warn!(search_key = %entry.key, error = %err, "cache upsert failed");
            }
        }
    }

    async fn run_cell(&self, cell: &Cell, now: DateTime<Utc>) -> CellOutcome {
        let target = SearchTarget::new(cell.role.clone(), cell.region.where_.clone());
        let options = self.config.search_options(&cell.region);
        let ctx = SearchContext {
            search_term: cell.role.clone(),
            location: cell.region.where_.clone(),
            region: Some(cell.region.name.clone()),
            fetched_at: now,
        };

        let mut outcome = CellOutcome {
            target: target.clone(),
            jobs: Vec::new(),
            failures: 0,
            any_ok: false,
        };
        for provider in &self.providers {
            let span = info_span!(
                "provider_cell",
                role = %target.role,
                location = %target.location,
                provider = provider.name()
            );
            match search_with_retry(provider.as_ref(), &target, &options, &ctx, &self.backoff)
                .instrument(span)
                .await
            {
                Ok(found) => {
                    debug!(role = %target.role, location = %target.location, provider = provider.name(), count = found.len(), "provider search ok");
                    outcome.any_ok = true;
                    outcome.jobs.extend(found);
                }
                Err(err) => {
                    outcome.failures += 1;
                    warn!(
                        role = %target.role,
                        location = %target.location,
                        provider = provider.name(),
                        error = %err,
                        "provider search failed; cell continues without it"
                    );
                }
            }
        }
        outcome
    }
}
