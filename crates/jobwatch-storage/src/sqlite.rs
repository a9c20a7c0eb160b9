use std::collections::BTreeSet;
use std::str::FromStr;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use jobwatch_core::{JobRecord, SearchKey, SearchTarget};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::debug;

use crate::cache::{CacheEntry, CacheStore, QuotaStore, RefreshQueue, RefreshRequest, RefreshStatus};

/// SQLite-backed cache store, refresh queue and quota counter.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

fn ts(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("parsing stored timestamp {raw}"))?
        .with_timezone(&Utc))
}

fn day_key(day: NaiveDate) -> String {
    day.format("%Y-%m-%d").to_string()
}

impl SqliteStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        Ok(Self { pool })
    }

    /// Private in-memory database on a single pinned connection.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("opening in-memory sqlite")?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running sqlite migrations")
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn cache_entry_from_row(row: &SqliteRow) -> anyhow::Result<CacheEntry> {
        let stored_key: String = row.try_get("search_key")?;
        let key = SearchKey::from_stored(&stored_key)
            .ok_or_else(|| anyhow!("malformed search key {stored_key}"))?;
        let jobs_json: String = row.try_get("jobs_json")?;
        let jobs: Vec<JobRecord> = serde_json::from_str(&jobs_json)
            .with_context(|| format!("parsing cached jobs for {stored_key}"))?;
        Ok(CacheEntry {
            key,
            role: row.try_get("role")?,
            location: row.try_get("location")?,
            jobs,
            fetched_at: parse_ts(&row.try_get::<String, _>("fetched_at")?)?,
            expires_at: parse_ts(&row.try_get::<String, _>("expires_at")?)?,
        })
    }

    async fn requesters_for(&self, stored_key: &str) -> anyhow::Result<BTreeSet<String>> {
        let rows = sqlx::query(
            "SELECT requester FROM refresh_requesters WHERE search_key = ?1 ORDER BY requester",
        )
        .bind(stored_key)
        .fetch_all(&self.pool)
        .await
        .context("loading refresh requesters")?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("requester").map_err(Into::into))
            .collect()
    }

    async fn request_from_row(&self, row: &SqliteRow) -> anyhow::Result<RefreshRequest> {
        let stored_key: String = row.try_get("search_key")?;
        let key = SearchKey::from_stored(&stored_key)
            .ok_or_else(|| anyhow!("malformed search key {stored_key}"))?;
        let status: String = row.try_get("status")?;
        Ok(RefreshRequest {
            key,
            role: row.try_get("role")?,
            location: row.try_get("location")?,
            requesters: self.requesters_for(&stored_key).await?,
            priority: row.try_get("priority")?,
            status: RefreshStatus::parse(&status)
                .ok_or_else(|| anyhow!("unknown refresh status {status}"))?,
            requested_at: parse_ts(&row.try_get::<String, _>("requested_at")?)?,
            last_error: row.try_get("last_error")?,
        })
    }

    async fn set_status(
        &self,
        key: &SearchKey,
        status: RefreshStatus,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE refresh_requests SET status = ?1, last_error = ?2, updated_at = ?3 WHERE search_key = ?4",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(ts(now))
        .bind(key.to_string())
        .execute(&self.pool)
        .await
        .with_context(|| format!("marking refresh {key} {}", status.as_str()))?;
        Ok(())
    }
}

#[async_trait]
impl CacheStore for SqliteStore {
    async fn upsert(&self, entry: &CacheEntry) -> anyhow::Result<()> {
        let jobs_json = serde_json::to_string(&entry.jobs).context("serializing cached jobs")?;
        sqlx::query(
            r#"
            INSERT INTO job_cache (search_key, role, location, jobs_json, fetched_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(search_key) DO UPDATE SET
                role = excluded.role,
                location = excluded.location,
                jobs_json = excluded.jobs_json,
                fetched_at = excluded.fetched_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(entry.key.to_string())
        .bind(&entry.role)
        .bind(&entry.location)
        .bind(jobs_json)
        .bind(ts(entry.fetched_at))
        .bind(ts(entry.expires_at))
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting cache entry {}", entry.key))?;
        debug!(search_key = %entry.key, jobs = entry.jobs.len(), "cache entry written");
        Ok(())
    }

    async fn entries_for(&self, keys: &[SearchKey]) -> anyhow::Result<Vec<CacheEntry>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT search_key, role, location, jobs_json, fetched_at, expires_at FROM job_cache WHERE search_key IN (",
        );
        let mut separated = qb.separated(", ");
        for key in keys {
            separated.push_bind(key.to_string());
        }
        separated.push_unseparated(")");
        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .context("querying cache entries")?;
        rows.iter().map(Self::cache_entry_from_row).collect()
    }
}

#[async_trait]
impl RefreshQueue for SqliteStore {
    async fn request_refresh(
        &self,
        targets: &[SearchTarget],
        requester: &str,
        priority: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting refresh transaction")?;
        for target in targets {
            let stored_key = target.key().to_string();
            // A finished round's requesters are not waiting on the next one.
            sqlx::query(
                r#"
                DELETE FROM refresh_requesters
                 WHERE search_key = ?1
                   AND EXISTS (
                       SELECT 1 FROM refresh_requests
                        WHERE search_key = ?1 AND status != 'pending'
                   )
                "#,
            )
            .bind(&stored_key)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing finished requesters for {stored_key}"))?;

            sqlx::query(
                r#"
                INSERT INTO refresh_requests (search_key, role, location, priority, status, requested_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?5)
                ON CONFLICT(search_key) DO UPDATE SET
                    priority = MAX(refresh_requests.priority, excluded.priority),
                    requested_at = CASE
                        WHEN refresh_requests.status = 'pending' THEN refresh_requests.requested_at
                        ELSE excluded.requested_at
                    END,
                    status = 'pending',
                    last_error = NULL,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&stored_key)
            .bind(&target.role)
            .bind(&target.location)
            .bind(priority)
            .bind(ts(now))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("queueing refresh {stored_key}"))?;

            sqlx::query(
                "INSERT OR IGNORE INTO refresh_requesters (search_key, requester) VALUES (?1, ?2)",
            )
            .bind(&stored_key)
            .bind(requester)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("recording requester for {stored_key}"))?;
        }
        tx.commit().await.context("committing refresh requests")?;
        Ok(())
    }

    async fn pending(&self, limit: usize) -> anyhow::Result<Vec<RefreshRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT r.search_key, r.role, r.location, r.priority, r.status, r.requested_at, r.last_error,
                   (SELECT COUNT(*) FROM refresh_requesters q WHERE q.search_key = r.search_key) AS requester_count
              FROM refresh_requests r
             WHERE r.status = 'pending'
             ORDER BY r.priority DESC, requester_count DESC, r.requested_at ASC, r.search_key ASC
             LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .context("loading pending refresh requests")?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            out.push(self.request_from_row(row).await?);
        }
        Ok(out)
    }

    async fn get_request(&self, key: &SearchKey) -> anyhow::Result<Option<RefreshRequest>> {
        let row = sqlx::query(
            "SELECT search_key, role, location, priority, status, requested_at, last_error FROM refresh_requests WHERE search_key = ?1",
        )
        .bind(key.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("loading refresh request")?;
        match row {
            Some(row) => Ok(Some(self.request_from_row(&row).await?)),
            None => Ok(None),
        }
    }

    async fn mark_complete(&self, key: &SearchKey, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.set_status(key, RefreshStatus::Complete, None, now).await
    }

    async fn mark_failed(&self, key: &SearchKey, error: &str, now: DateTime<Utc>) -> anyhow::Result<()> {
        self.set_status(key, RefreshStatus::Failed, Some(error), now).await
    }
}

#[async_trait]
impl QuotaStore for SqliteStore {
    async fn get(&self, day: NaiveDate) -> anyhow::Result<u32> {
        let calls: Option<i64> = sqlx::query_scalar("SELECT calls FROM market_quota WHERE day = ?1")
            .bind(day_key(day))
            .fetch_optional(&self.pool)
            .await
            .context("reading market quota")?;
        Ok(calls.unwrap_or(0).max(0) as u32)
    }

    async fn increment(&self, day: NaiveDate) -> anyhow::Result<u32> {
        let calls: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO market_quota (day, calls) VALUES (?1, 1)
            ON CONFLICT(day) DO UPDATE SET calls = calls + 1
            RETURNING calls
            "#,
        )
        .bind(day_key(day))
        .fetch_one(&self.pool)
        .await
        .context("incrementing market quota")?;
        Ok(calls.max(0) as u32)
    }
}
