use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use jobwatch_core::{JobRecord, SearchKey, SearchTarget};
use serde::{Deserialize, Serialize};

/// Stored result set for one search key. Entries are overwritten whole, never
/// patched in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: SearchKey,
    pub role: String,
    pub location: String,
    pub jobs: Vec<JobRecord>,
    pub fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    /// `ttl` is clamped to at least one second so `expires_at > fetched_at` holds.
    pub fn new(target: &SearchTarget, jobs: Vec<JobRecord>, fetched_at: DateTime<Utc>, ttl: Duration) -> Self {
        let ttl = ttl.max(Duration::seconds(1));
        Self {
            key: target.key(),
            role: target.role.clone(),
            location: target.location.clone(),
            jobs,
            fetched_at,
            expires_at: fetched_at + ttl,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Fresh(CacheEntry),
    Expired(CacheEntry),
    Missing,
}

impl CacheLookup {
    pub fn is_stale(&self) -> bool {
        !self.is_fresh_hit()
    }

    pub fn is_fresh_hit(&self) -> bool {
        matches!(self, CacheLookup::Fresh(_))
    }
}

/// Keyed result-set store: upsert by key, range query by key list.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn upsert(&self, entry: &CacheEntry) -> anyhow::Result<()>;

    async fn entries_for(&self, keys: &[SearchKey]) -> anyhow::Result<Vec<CacheEntry>>;

    async fn lookup(&self, key: &SearchKey, now: DateTime<Utc>) -> anyhow::Result<CacheLookup> {
        let entry = self.entries_for(std::slice::from_ref(key)).await?.into_iter().next();
        Ok(match entry {
            Some(entry) if entry.is_fresh(now) => CacheLookup::Fresh(entry),
            Some(entry) => CacheLookup::Expired(entry),
            None => CacheLookup::Missing,
        })
    }

    /// Requested keys that are absent or expired, in request order, without duplicates.
    async fn stale_searches(&self, keys: &[SearchKey], now: DateTime<Utc>) -> anyhow::Result<Vec<SearchKey>> {
        let fresh = self
            .entries_for(keys)
            .await?
            .into_iter()
            .filter(|e| e.is_fresh(now))
            .map(|e| e.key)
            .collect::<HashSet<_>>();
        let mut seen = HashSet::new();
        Ok(keys
            .iter()
            .filter(|k| !fresh.contains(*k) && seen.insert((*k).clone()))
            .cloned()
            .collect())
    }

    /// Jobs from unexpired entries for `keys`, first occurrence of each dedup key kept.
    async fn fresh_jobs_for(&self, keys: &[SearchKey], now: DateTime<Utc>) -> anyhow::Result<Vec<JobRecord>> {
        let entries = self.entries_for(keys).await?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for key in keys {
            let Some(entry) = entries.iter().find(|e| &e.key == key && e.is_fresh(now)) else {
                continue;
            };
            for job in &entry.jobs {
                if seen.insert(job.dedup_key().to_string()) {
                    out.push(job.clone());
                }
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshStatus {
    Pending,
    Complete,
    Failed,
}

impl RefreshStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Pending => "pending",
            RefreshStatus::Complete => "complete",
            RefreshStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(RefreshStatus::Pending),
            "complete" => Some(RefreshStatus::Complete),
            "failed" => Some(RefreshStatus::Failed),
            _ => None,
        }
    }
}

/// A queued re-fetch of one search key and everyone who asked for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub key: SearchKey,
    pub role: String,
    pub location: String,
    pub requesters: BTreeSet<String>,
    pub priority: i64,
    pub status: RefreshStatus,
    pub requested_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl RefreshRequest {
    pub fn target(&self) -> SearchTarget {
        SearchTarget::new(self.role.clone(), self.location.clone())
    }
}

/// Refresh queue: one row per key, requester sets merged on re-insertion.
#[async_trait]
pub trait RefreshQueue: Send + Sync {
    async fn request_refresh(
        &self,
        targets: &[SearchTarget],
        requester: &str,
        priority: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Pending requests, highest priority first, then most requesters, then oldest.
    async fn pending(&self, limit: usize) -> anyhow::Result<Vec<RefreshRequest>>;

    async fn get_request(&self, key: &SearchKey) -> anyhow::Result<Option<RefreshRequest>>;

    async fn mark_complete(&self, key: &SearchKey, now: DateTime<Utc>) -> anyhow::Result<()>;

    async fn mark_failed(&self, key: &SearchKey, error: &str, now: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Durable per-day call counter for the market-analysis quota.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, day: NaiveDate) -> anyhow::Result<u32>;

    /// Atomically add one call for `day` and return the new count.
    async fn increment(&self, day: NaiveDate) -> anyhow::Result<u32>;
}
