//! First-seen / last-seen bookkeeping across runs.
//!
//! Two sources feed the first-seen lookup: the previous batch document and the
//! seen index. The previous batch only knows about records that survived the
//! last run; the seen index remembers every id and canonical id for the
//! retention window, so a posting that drops out for a few runs keeps its
//! original first-seen timestamp when it returns.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use jobwatch_core::{parse_timestamp, JobRecord};
use jobwatch_storage::{read_if_exists, BatchStore, PersistenceError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Default, Deserialize)]
struct PriorBatch {
    #[serde(default)]
    generated_at: Option<String>,
    #[serde(default)]
    jobs: Vec<PriorRecord>,
}

/// Only the fields freshness needs; everything else in an old batch is ignored.
#[derive(Debug, Default, Deserialize)]
struct PriorRecord {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    canonical_id: Option<String>,
    #[serde(default)]
    first_seen_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeenEntry {
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Durable id → sighting window map, keyed by both provider id and canonical id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeenIndex {
    #[serde(default)]
    pub entries: BTreeMap<String, SeenEntry>,
}

impl SeenIndex {
    /// Missing or unreadable index files start empty.
    pub async fn load(path: &Path) -> Self {
        match read_if_exists(path).await {
            Ok(Some(text)) => serde_json::from_str(&text).unwrap_or_else(|err| {
                warn!(path = %path.display(), error = %err, "seen index unparsable, starting empty");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "seen index unreadable, starting empty");
                Self::default()
            }
        }
    }

    pub async fn persist(&self, store: &BatchStore) -> Result<(), PersistenceError> {
        store.persist_json(&store.seen_index_path(), self).await
    }

    fn observe(&mut self, key: &str, first_seen_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.entries
            .entry(key.to_string())
            .and_modify(|e| {
                e.first_seen_at = e.first_seen_at.min(first_seen_at);
                e.last_seen_at = e.last_seen_at.max(now);
            })
            .or_insert(SeenEntry {
                first_seen_at,
                last_seen_at: now,
            });
    }

    /// Record every job of the new batch, then drop entries not seen within `retention`.
    pub fn record(&mut self, jobs: &[JobRecord], now: DateTime<Utc>, retention: Duration) {
        for job in jobs {
            self.observe(&job.id, job.first_seen_at, now);
            if let Some(canonical) = &job.canonical_id {
                self.observe(canonical, job.first_seen_at, now);
            }
        }
        let cutoff = now - retention;
        let before = self.entries.len();
        self.entries.retain(|_, e| e.last_seen_at >= cutoff);
        debug!(pruned = before - self.entries.len(), kept = self.entries.len(), "seen index pruned");
    }
}

/// Earliest known first-seen timestamp per provider id and per canonical id.
#[derive(Debug, Clone, Default)]
pub struct FirstSeenLookup {
    by_key: HashMap<String, DateTime<Utc>>,
}

impl FirstSeenLookup {
    fn offer(&mut self, key: &str, ts: DateTime<Utc>) {
        self.by_key
            .entry(key.to_string())
            .and_modify(|cur| *cur = (*cur).min(ts))
            .or_insert(ts);
    }

    /// Lenient parse of the previous batch; a record without `first_seen_at`
    /// inherits the batch's `generated_at`. Unparsable text is a cold start.
    pub fn from_previous_batch(text: &str) -> Self {
        let mut lookup = Self::default();
        let prior: PriorBatch = match serde_json::from_str(text) {
            Ok(prior) => prior,
            Err(err) => {
                warn!(error = %err, "previous batch unparsable, treating as cold start");
                return lookup;
            }
        };
        let generated_at = prior.generated_at.as_deref().and_then(parse_timestamp);
        for record in prior.jobs {
            let Some(ts) = record
                .first_seen_at
                .as_deref()
                .and_then(parse_timestamp)
                .or(generated_at)
            else {
                continue;
            };
            if let Some(id) = &record.id {
                lookup.offer(id, ts);
            }
            if let Some(canonical) = &record.canonical_id {
                lookup.offer(canonical, ts);
            }
        }
        lookup
    }

    pub fn merge_seen_index(&mut self, index: &SeenIndex) {
        for (key, entry) in &index.entries {
            self.offer(key, entry.first_seen_at);
        }
    }

    pub fn first_seen(&self, job: &JobRecord) -> Option<DateTime<Utc>> {
        let by_id = self.by_key.get(&job.id).copied();
        let by_canonical = job
            .canonical_id
            .as_ref()
            .and_then(|c| self.by_key.get(c))
            .copied();
        match (by_id, by_canonical) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// `first_seen_at` comes from the lookup when known, otherwise `now`;
/// `last_seen_at` is always `now`.
pub fn apply_freshness(jobs: &mut [JobRecord], lookup: &FirstSeenLookup, now: DateTime<Utc>) {
    for job in jobs {
        job.first_seen_at = lookup.first_seen(job).unwrap_or(now);
        job.last_seen_at = now;
    }
}

/// Build the lookup for a run from the batch directory. Never fails.
pub async fn load_first_seen(store: &BatchStore) -> (FirstSeenLookup, SeenIndex) {
    let batch_path = store.batch_path();
    let mut lookup = match read_if_exists(&batch_path).await {
        Ok(Some(text)) => FirstSeenLookup::from_previous_batch(&text),
        Ok(None) => FirstSeenLookup::default(),
        Err(err) => {
            warn!(path = %batch_path.display(), error = %err, "previous batch unreadable, treating as cold start");
            FirstSeenLookup::default()
        }
    };
    let index = SeenIndex::load(&store.seen_index_path()).await;
    lookup.merge_seen_index(&index);
    (lookup, index)
}
