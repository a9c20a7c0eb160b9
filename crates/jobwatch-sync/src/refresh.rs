//! Background drain of the refresh queue.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use jobwatch_adapters::{looks_remote, JobProvider, SearchContext, SearchOptions};
use jobwatch_core::{Region, SearchKey};
use jobwatch_storage::{BackoffPolicy, CacheEntry, CacheStore, RefreshQueue, RefreshRequest};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::dedup::dedup_jobs;
use crate::pipeline::search_with_retry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshSummary {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
}

/// What the configured regions say about one normalized location.
#[derive(Debug, Clone)]
struct RegionHint {
    name: String,
    remote_only: bool,
}

pub struct RefreshWorker {
    providers: Vec<Arc<dyn JobProvider>>,
    regions: HashMap<String, RegionHint>,
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn RefreshQueue>,
    ttl: Duration,
    options: SearchOptions,
    backoff: BackoffPolicy,
}

impl RefreshWorker {
    pub const DEFAULT_BATCH: usize = 20;

    pub fn new(
        providers: Vec<Arc<dyn JobProvider>>,
        cache: Arc<dyn CacheStore>,
        queue: Arc<dyn RefreshQueue>,
        ttl: Duration,
    ) -> Self {
        Self {
            providers,
            regions: HashMap::new(),
            cache,
            queue,
            ttl,
            options: SearchOptions::default(),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_results_per_page(mut self, results_per_page: u32) -> Self {
        self.options.results_per_page = results_per_page;
        self
    }

    /// Refresh keys the way the sync run fills them: a location searched by a
    /// remote region keeps only remote postings. When an onsite region shares
    /// the location, its unfiltered results win.
    pub fn with_regions(mut self, regions: &[Region]) -> Self {
        for region in regions {
            let location = SearchKey::new("", &region.where_).location().to_string();
            self.regions
                .entry(location)
                .and_modify(|hint| hint.remote_only &= region.is_remote())
                .or_insert_with(|| RegionHint {
                    name: region.name.clone(),
                    remote_only: region.is_remote(),
                });
        }
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn drain(&self, limit: usize) -> Result<RefreshSummary> {
        self.drain_at(limit, Utc::now()).await
    }

    /// Process up to `limit` pending requests in queue order. A failed key is
    /// marked failed and the drain moves on; only queue errors abort.
    pub async fn drain_at(&self, limit: usize, now: DateTime<Utc>) -> Result<RefreshSummary> {
        let pending = self.queue.pending(limit).await?;
        let mut summary = RefreshSummary::default();
        for request in pending {
            summary.processed += 1;
            let span = info_span!("refresh", search_key = %request.key);
            match self.refresh_one(&request, now).instrument(span).await {
                Ok(count) => {
                    self.queue.mark_complete(&request.key, now).await?;
                    summary.completed += 1;
                    info!(search_key = %request.key, jobs = count, requesters = request.requesters.len(), "refreshed");
                }
                Err(err) => {
                    self.queue.mark_failed(&request.key, &err.to_string(), now).await?;
                    summary.failed += 1;
                    warn!(search_key = %request.key, error = %err, "refresh failed");
                }
            }
        }
        Ok(summary)
    }

    async fn refresh_one(&self, request: &RefreshRequest, now: DateTime<Utc>) -> Result<usize> {
        if self.providers.is_empty() {
            return Err(anyhow!("no providers configured"));
        }
        let target = request.target();
        let hint = self.regions.get(request.key.location());
        let options = SearchOptions {
            remote_only: hint.map_or_else(|| looks_remote(&target.location), |h| h.remote_only),
            ..self.options.clone()
        };
        let ctx = SearchContext {
            search_term: target.role.clone(),
            location: target.location.clone(),
            region: hint.map(|h| h.name.clone()),
            fetched_at: now,
        };

        let mut jobs = Vec::new();
        let mut last_error = None;
        let mut any_ok = false;
        for provider in &self.providers {
            match search_with_retry(provider.as_ref(), &target, &options, &ctx, &self.backoff).await {
                Ok(found) => {
                    any_ok = true;
                    jobs.extend(found);
                }
                Err(err) => {
                    warn!(
                        role = %target.role,
                        location = %target.location,
                        provider = provider.name(),
                        error = %err,
                        "provider search failed during refresh"
                    );
                    last_error = Some(err);
                }
            }
        }
        if !any_ok {
            return Err(match last_error {
                Some(err) => anyhow!(err),
                None => anyhow!("no provider answered"),
            });
        }

        let jobs = dedup_jobs(jobs);
        let count = jobs.len();
        let entry = CacheEntry::new(&target, jobs, now, self.ttl);
        self.cache.upsert(&entry).await?;
        Ok(count)
    }
}
