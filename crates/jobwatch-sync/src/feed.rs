//! Cache-first read path for per-user interests.
//!
//! Reads never wait on a provider: fresh cache entries are served as they
//! are, stale keys are queued for the refresh worker, and when the cache has
//! nothing to offer the last persisted batch is returned instead.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobwatch_core::{sort_for_output, JobRecord, SearchKey, SearchTarget};
use jobwatch_storage::{BatchStore, CacheStore, RefreshQueue};
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedSource {
    Cache,
    Batch,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedResult {
    pub source: FeedSource,
    pub generated_at: Option<DateTime<Utc>>,
    pub total: usize,
    pub jobs: Vec<JobRecord>,
    /// Keys that were absent or expired and have been queued for refresh.
    pub stale: Vec<String>,
}

pub struct JobFeed {
    cache: Arc<dyn CacheStore>,
    queue: Arc<dyn RefreshQueue>,
    batches: BatchStore,
    priority: i64,
}

impl JobFeed {
    pub fn new(cache: Arc<dyn CacheStore>, queue: Arc<dyn RefreshQueue>, batches: BatchStore) -> Self {
        Self {
            cache,
            queue,
            batches,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Absent or expired keys for the role × location matrix.
    pub async fn stale_searches(
        &self,
        roles: &[String],
        locations: &[String],
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SearchKey>> {
        let (_, keys) = targets_and_keys(roles, locations);
        self.cache.stale_searches(&keys, now).await
    }

    /// Queue every absent or expired key of the matrix for refresh and return those keys.
    pub async fn queue_stale(
        &self,
        roles: &[String],
        locations: &[String],
        requester: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Vec<SearchKey>> {
        let (targets, keys) = targets_and_keys(roles, locations);
        let stale = self.cache.stale_searches(&keys, now).await?;
        self.enqueue(&targets, &stale, requester, now).await?;
        Ok(stale)
    }

    async fn enqueue(
        &self,
        targets: &[SearchTarget],
        stale: &[SearchKey],
        requester: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if stale.is_empty() {
            return Ok(());
        }
        let stale_set = stale.iter().collect::<HashSet<_>>();
        let to_refresh = targets
            .iter()
            .filter(|t| stale_set.contains(&t.key()))
            .cloned()
            .collect::<Vec<_>>();
        self.queue
            .request_refresh(&to_refresh, requester, self.priority, now)
            .await
    }

    pub async fn load_for_interests(&self, roles: &[String], locations: &[String], requester: &str) -> FeedResult {
        self.load_for_interests_at(roles, locations, requester, Utc::now()).await
    }

    pub async fn load_for_interests_at(
        &self,
        roles: &[String],
        locations: &[String],
        requester: &str,
        now: DateTime<Utc>,
    ) -> FeedResult {
        let (targets, keys) = targets_and_keys(roles, locations);
        if keys.is_empty() {
            return self.from_batch(Vec::new()).await;
        }

        let jobs = match self.cache.fresh_jobs_for(&keys, now).await {
            Ok(jobs) => jobs,
            Err(err) => {
                warn!(error = %err, "search cache unreadable, serving the persisted batch");
                return self.from_batch(Vec::new()).await;
            }
        };

        let stale = match self.cache.stale_searches(&keys, now).await {
            Ok(stale) => stale,
            Err(err) => {
                warn!(error = %err, "stale search check failed");
                Vec::new()
            }
        };
        if let Err(err) = self.enqueue(&targets, &stale, requester, now).await {
            warn!(error = %err, requester, "queueing refresh requests failed");
        }
        let stale = stale.iter().map(ToString::to_string).collect::<Vec<_>>();

        if jobs.is_empty() {
            return self.from_batch(stale).await;
        }

        debug!(jobs = jobs.len(), stale = stale.len(), "serving feed from cache");
        let mut jobs = jobs;
        sort_for_output(&mut jobs);
        FeedResult {
            source: FeedSource::Cache,
            generated_at: None,
            total: jobs.len(),
            jobs,
            stale,
        }
    }

    async fn from_batch(&self, stale: Vec<String>) -> FeedResult {
        match self.batches.load_batch().await {
            Ok(Some(batch)) => FeedResult {
                source: FeedSource::Batch,
                generated_at: Some(batch.generated_at),
                total: batch.total,
                jobs: batch.jobs,
                stale,
            },
            Ok(None) => FeedResult {
                source: FeedSource::Empty,
                generated_at: None,
                total: 0,
                jobs: Vec::new(),
                stale,
            },
            Err(err) => {
                warn!(error = %err, "persisted batch unreadable");
                FeedResult {
                    source: FeedSource::Empty,
                    generated_at: None,
                    total: 0,
                    jobs: Vec::new(),
                    stale,
                }
            }
        }
    }
}

/// Matrix targets, first target per key, and the distinct keys in order.
fn targets_and_keys(roles: &[String], locations: &[String]) -> (Vec<SearchTarget>, Vec<SearchKey>) {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();
    let mut keys = Vec::new();
    for target in SearchTarget::matrix(roles, locations) {
        if target.role.trim().is_empty() || target.location.trim().is_empty() {
            continue;
        }
        let key = target.key();
        if seen.insert(key.clone()) {
            keys.push(key);
            targets.push(target);
        }
    }
    (targets, keys)
}
