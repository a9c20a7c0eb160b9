//! Salary market analysis under a daily outbound-call quota.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Local, NaiveDate, Utc};
use futures::future::join_all;
use jobwatch_adapters::{MarketPosting, MarketSampleSource};
use jobwatch_core::{
    DemandLevel, JobRecord, JobWithAnalysis, MarketPosition, SalaryAnalysis, SalaryBand, SearchKey,
    TrendDirection,
};
use jobwatch_storage::QuotaStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MarketConfig {
    pub max_daily_calls: u32,
    pub sample_ttl: Duration,
    /// Expired samples are kept this long as a fallback, then dropped.
    pub sample_retention: Duration,
    /// Samples with fewer postings than this produce no analysis. Zero disables the gate.
    pub min_sample_postings: usize,
    pub max_jobs_per_run: usize,
    pub batch_size: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            max_daily_calls: 50,
            sample_ttl: Duration::hours(24),
            sample_retention: Duration::days(7),
            min_sample_postings: 0,
            max_jobs_per_run: 15,
            batch_size: 3,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedSample {
    postings: Vec<MarketPosting>,
    fetched_at: DateTime<Utc>,
}

pub struct MarketAnalysisEngine {
    source: Option<Arc<dyn MarketSampleSource>>,
    quota: Arc<dyn QuotaStore>,
    config: MarketConfig,
    samples: Mutex<HashMap<SearchKey, CachedSample>>,
    key_locks: Mutex<HashMap<SearchKey, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for MarketAnalysisEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketAnalysisEngine")
            .field("source", &self.source.is_some())
            .field("config", &self.config)
            .finish()
    }
}

fn local_day(now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&Local).date_naive()
}

impl MarketAnalysisEngine {
    pub fn new(
        source: Option<Arc<dyn MarketSampleSource>>,
        quota: Arc<dyn QuotaStore>,
        config: MarketConfig,
    ) -> Self {
        Self {
            source,
            quota,
            config,
            samples: Mutex::new(HashMap::new()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn analyze_salary(&self, job: &JobRecord) -> Option<SalaryAnalysis> {
        self.analyze_salary_at(job, Utc::now()).await
    }

    /// `None` when the job has no salary, when no sample can be had (quota spent
    /// and nothing cached, or no source configured), or when the sample is
    /// smaller than `min_sample_postings`.
    pub async fn analyze_salary_at(&self, job: &JobRecord, now: DateTime<Utc>) -> Option<SalaryAnalysis> {
        let job_midpoint = job.salary_midpoint()?;
        let postings = self.sample_for(&job.title, &job.location, now).await?;
        if self.config.min_sample_postings > 0 && postings.len() < self.config.min_sample_postings {
            debug!(job_id = %job.id, sample = postings.len(), "market sample below minimum size");
            return None;
        }
        Some(compute_analysis(job_midpoint, &postings, now))
    }

    async fn key_lock(&self, key: &SearchKey) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().await;
        // Only the map holds an idle lock; clones are taken under this guard.
        locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
        locks.entry(key.clone()).or_default().clone()
    }

    /// Cache first, then quota, then one outbound call. Expired samples are
    /// the fallback whenever a fresh fetch is not possible.
    async fn sample_for(&self, role: &str, location: &str, now: DateTime<Utc>) -> Option<Vec<MarketPosting>> {
        let key = SearchKey::new(role, location);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let cached = self
            .samples
            .lock()
            .await
            .get(&key)
            .filter(|s| now - s.fetched_at < self.config.sample_retention)
            .cloned();
        if let Some(sample) = &cached {
            if now - sample.fetched_at < self.config.sample_ttl {
                debug!(search_key = %key, "market sample cache hit");
                return Some(sample.postings.clone());
            }
        }
        let fallback = || cached.as_ref().map(|s| s.postings.clone());

        let Some(source) = &self.source else {
            return fallback();
        };

        let day = local_day(now);
        let used = match self.quota.get(day).await {
            Ok(used) => used,
            Err(err) => {
                warn!(search_key = %key, error = %err, "quota unreadable, skipping market fetch");
                return fallback();
            }
        };
        if used >= self.config.max_daily_calls {
            warn!(search_key = %key, used, max = self.config.max_daily_calls, "daily market quota exhausted");
            return fallback();
        }
        // The call is counted before it is made.
        match self.quota.increment(day).await {
            Ok(count) if count > self.config.max_daily_calls => {
                warn!(search_key = %key, count, "daily market quota exhausted");
                return fallback();
            }
            Ok(count) => info!(search_key = %key, calls_today = count, max = self.config.max_daily_calls, "fetching market sample"),
            Err(err) => {
                warn!(search_key = %key, error = %err, "quota increment failed, skipping market fetch");
                return fallback();
            }
        }

        match source.fetch_sample(role, location).await {
            Ok(postings) => {
                let mut samples = self.samples.lock().await;
                let retention = self.config.sample_retention;
                samples.retain(|_, s| now - s.fetched_at < retention);
                samples.insert(
                    key,
                    CachedSample {
                        postings: postings.clone(),
                        fetched_at: now,
                    },
                );
                Some(postings)
            }
            Err(err) => {
                warn!(search_key = %key, error = %err, "market sample fetch failed");
                fallback()
            }
        }
    }

    /// Analyze the best-paid salary-bearing jobs in small concurrent batches.
    ///
    /// Output order: analyzed jobs by descending salary, then jobs without
    /// salary, then salary-bearing jobs beyond the per-run limit.
    pub async fn enrich(&self, jobs: Vec<JobRecord>, now: DateTime<Utc>) -> Vec<JobWithAnalysis> {
        let (mut with_salary, without_salary): (Vec<_>, Vec<_>) =
            jobs.into_iter().partition(JobRecord::has_salary);
        with_salary.sort_by(|a, b| b.salary_ceiling().total_cmp(&a.salary_ceiling()));
        let rest = with_salary.split_off(self.config.max_jobs_per_run.min(with_salary.len()));

        let mut out = Vec::with_capacity(with_salary.len() + without_salary.len() + rest.len());
        for batch in with_salary.chunks(self.config.batch_size.max(1)) {
            let analyses = join_all(batch.iter().map(|job| self.analyze_salary_at(job, now))).await;
            out.extend(batch.iter().cloned().zip(analyses).map(|(job, salary_analysis)| JobWithAnalysis {
                job,
                salary_analysis,
            }));
        }
        out.extend(without_salary.into_iter().chain(rest).map(|job| JobWithAnalysis {
            job,
            salary_analysis: None,
        }));
        out
    }
}

/// Statistics of `postings` relative to a job paying `job_midpoint`.
pub fn compute_analysis(job_midpoint: f64, postings: &[MarketPosting], now: DateTime<Utc>) -> SalaryAnalysis {
    let mut midpoints = postings
        .iter()
        .filter_map(MarketPosting::midpoint)
        .collect::<Vec<_>>();
    if midpoints.is_empty() {
        return SalaryAnalysis::low_confidence();
    }
    midpoints.sort_by(f64::total_cmp);

    let n = midpoints.len();
    let average = midpoints.iter().sum::<f64>() / n as f64;
    let nearest_rank = |q: f64| midpoints[((n as f64 * q).floor() as usize).min(n - 1)];

    SalaryAnalysis {
        average_salary: Some(average.round()),
        salary_range: Some(SalaryBand {
            min: nearest_rank(0.25),
            max: nearest_rank(0.75),
        }),
        market_position: market_position(job_midpoint, average),
        demand_level: Some(demand_level(postings.len())),
        trend_direction: Some(trend_direction(postings, now)),
        confidence: (n as f64 / 20.0).min(0.9),
    }
}

pub fn market_position(job_midpoint: f64, average: f64) -> Option<MarketPosition> {
    if job_midpoint <= 0.0 || average <= 0.0 {
        return None;
    }
    let ratio = job_midpoint / average;
    Some(if ratio >= 1.3 {
        MarketPosition::Excellent
    } else if ratio >= 1.1 {
        MarketPosition::Above
    } else if ratio >= 0.9 {
        MarketPosition::Average
    } else {
        MarketPosition::Below
    })
}

pub fn demand_level(sample_count: usize) -> DemandLevel {
    match sample_count {
        n if n >= 100 => DemandLevel::VeryHigh,
        n if n >= 50 => DemandLevel::High,
        n if n >= 20 => DemandLevel::Medium,
        _ => DemandLevel::Low,
    }
}

/// Share of the sample posted within the last seven days.
pub fn trend_direction(postings: &[MarketPosting], now: DateTime<Utc>) -> TrendDirection {
    let week_ago = now - Duration::days(7);
    let recent = postings
        .iter()
        .filter(|p| p.created.is_some_and(|c| c > week_ago))
        .count();
    let ratio = recent as f64 / postings.len().max(1) as f64;
    if ratio >= 0.7 {
        TrendDirection::Hot
    } else if ratio >= 0.4 {
        TrendDirection::Growing
    } else if ratio >= 0.2 {
        TrendDirection::Stable
    } else {
        TrendDirection::Declining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{at, job};
    use async_trait::async_trait;
    use jobwatch_adapters::AdapterFetchError;
    use jobwatch_storage::SqliteStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeSource {
        calls: AtomicUsize,
        postings: Vec<MarketPosting>,
        fail: bool,
    }

    impl FakeSource {
        fn new(postings: Vec<MarketPosting>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                postings,
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                postings: Vec::new(),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MarketSampleSource for FakeSource {
        async fn fetch_sample(&self, _role: &str, _location: &str) -> Result<Vec<MarketPosting>, AdapterFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(AdapterFetchError::MissingResults {
                    provider: "fake".into(),
                    message: "down".into(),
                });
            }
            Ok(self.postings.clone())
        }
    }

    fn posting(min: Option<f64>, max: Option<f64>, created: Option<DateTime<Utc>>) -> MarketPosting {
        MarketPosting {
            salary_min: min,
            salary_max: max,
            created,
        }
    }

    fn salaried(title: &str, location: &str, min: f64, max: f64) -> JobRecord {
        let mut j = job("adzuna", title, "Acme", title, location);
        j.salary_min = Some(min);
        j.salary_max = Some(max);
        j
    }

    async fn new_engine(source: Arc<FakeSource>, config: MarketConfig) -> (MarketAnalysisEngine, Arc<SqliteStore>) {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let engine = MarketAnalysisEngine::new(
            Some(source as Arc<dyn MarketSampleSource>),
            store.clone(),
            config,
        );
        (engine, store)
    }

    #[test]
    fn ratio_of_exactly_one_point_three_is_excellent() {
        assert_eq!(market_position(130_000.0, 100_000.0), Some(MarketPosition::Excellent));
        assert_eq!(market_position(110_000.0, 100_000.0), Some(MarketPosition::Above));
        assert_eq!(market_position(90_000.0, 100_000.0), Some(MarketPosition::Average));
        assert_eq!(market_position(89_999.0, 100_000.0), Some(MarketPosition::Below));
        assert_eq!(market_position(0.0, 100_000.0), None);
    }

    #[test]
    fn demand_and_trend_steps() {
        assert_eq!(demand_level(100), DemandLevel::VeryHigh);
        assert_eq!(demand_level(50), DemandLevel::High);
        assert_eq!(demand_level(20), DemandLevel::Medium);
        assert_eq!(demand_level(19), DemandLevel::Low);

        let now = at(10, 0);
        let recent = Some(now - Duration::days(1));
        let old = Some(now - Duration::days(30));
        let mk = |recent_count: usize, total: usize| {
            (0..total)
                .map(|i| posting(None, None, if i < recent_count { recent } else { old }))
                .collect::<Vec<_>>()
        };
        assert_eq!(trend_direction(&mk(7, 10), now), TrendDirection::Hot);
        assert_eq!(trend_direction(&mk(4, 10), now), TrendDirection::Growing);
        assert_eq!(trend_direction(&mk(2, 10), now), TrendDirection::Stable);
        assert_eq!(trend_direction(&mk(1, 10), now), TrendDirection::Declining);
        assert_eq!(trend_direction(&[], now), TrendDirection::Declining);
    }

    #[test]
    fn statistics_use_midpoints_and_nearest_rank_band() {
        let now = at(10, 0);
        let postings = vec![
            posting(Some(80_000.0), Some(100_000.0), None), // 90k
            posting(None, Some(100_000.0), None),           // 90k
            posting(Some(100_000.0), None, None),           // 110k
            posting(Some(120_000.0), Some(140_000.0), None), // 130k
            posting(None, None, None),                      // excluded
        ];
        let analysis = compute_analysis(130_000.0, &postings, now);
        assert_eq!(analysis.average_salary, Some(105_000.0));
        let band = analysis.salary_range.unwrap();
        assert!((band.min - 90_000.0).abs() < 1e-6);
        assert!((band.max - 130_000.0).abs() < 1e-6);
        assert_eq!(analysis.market_position, Some(MarketPosition::Above));
        assert_eq!(analysis.demand_level, Some(DemandLevel::Low));
        assert!((analysis.confidence - 0.2).abs() < 1e-9);
    }

    #[test]
    fn confidence_is_capped() {
        let postings = (0..40)
            .map(|i| posting(Some(50_000.0 + i as f64 * 1000.0), None, None))
            .collect::<Vec<_>>();
        assert!((compute_analysis(60_000.0, &postings, at(1, 0)).confidence - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn market_position_boundary_scenario() {
        let source = FakeSource::new(vec![
            posting(Some(100_000.0), Some(100_000.0), None),
            posting(Some(90_000.0), Some(110_000.0), None),
        ]);
        let (engine, _) = new_engine(source, MarketConfig::default()).await;
        let analysis = engine
            .analyze_salary_at(&salaried("Backend Engineer", "Toronto", 120_000.0, 140_000.0), at(1, 12))
            .await
            .unwrap();
        assert_eq!(analysis.average_salary, Some(100_000.0));
        assert_eq!(analysis.market_position, Some(MarketPosition::Excellent));
    }

    #[tokio::test]
    async fn empty_pool_yields_low_confidence_only() {
        let (engine, _) = new_engine(FakeSource::new(vec![]), MarketConfig::default()).await;
        let analysis = engine
            .analyze_salary_at(&salaried("Dev", "Toronto", 1.0, 2.0), at(1, 12))
            .await
            .unwrap();
        assert_eq!(analysis, SalaryAnalysis::low_confidence());

        let (engine, _) = engine_with_postings(vec![posting(None, None, None)]).await;
        let analysis = engine
            .analyze_salary_at(&salaried("Dev", "Toronto", 1.0, 2.0), at(1, 12))
            .await
            .unwrap();
        assert_eq!(analysis, SalaryAnalysis::low_confidence());
    }

    async fn engine_with_postings(postings: Vec<MarketPosting>) -> (MarketAnalysisEngine, Arc<SqliteStore>) {
        new_engine(FakeSource::new(postings), MarketConfig::default()).await
    }

    #[tokio::test]
    async fn jobs_without_salary_are_skipped_without_calls() {
        let source = FakeSource::new(vec![posting(Some(1.0), None, None)]);
        let (engine, _) = new_engine(source.clone(), MarketConfig::default()).await;
        let unsalaried = job("adzuna", "1", "Acme", "Dev", "Toronto");
        assert!(engine.analyze_salary_at(&unsalaried, at(1, 12)).await.is_none());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn minimum_sample_gate_returns_none() {
        let source = FakeSource::new(vec![posting(Some(100.0), None, None)]);
        let config = MarketConfig {
            min_sample_postings: 5,
            ..MarketConfig::default()
        };
        let (engine, _) = new_engine(source, config).await;
        assert!(engine
            .analyze_salary_at(&salaried("Dev", "Toronto", 1.0, 2.0), at(1, 12))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn samples_are_cached_per_normalized_key() {
        let source = FakeSource::new(vec![posting(Some(100.0), Some(200.0), None)]);
        let (engine, store) = new_engine(source.clone(), MarketConfig::default()).await;
        let now = at(1, 12);
        engine
            .analyze_salary_at(&salaried("Senior Rust Developer", "Toronto", 1.0, 2.0), now)
            .await
            .unwrap();
        engine
            .analyze_salary_at(&salaried("rust engineer", "toronto, Canada", 1.0, 2.0), now + Duration::hours(3))
            .await
            .unwrap();
        assert_eq!(source.calls(), 1);
        assert_eq!(store.get(local_day(now)).await.unwrap(), 1);

        engine
            .analyze_salary_at(&salaried("Rust Developer", "Toronto", 1.0, 2.0), now + Duration::hours(25))
            .await
            .unwrap();
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn quota_exhaustion_makes_zero_calls_and_falls_back_to_cache() {
        let source = FakeSource::new(vec![posting(Some(100.0), Some(200.0), None)]);
        let config = MarketConfig {
            max_daily_calls: 2,
            ..MarketConfig::default()
        };
        let (engine, store) = new_engine(source.clone(), config).await;
        let now = at(1, 12);

        for role in ["Data Analyst", "Designer"] {
            assert!(engine.analyze_salary_at(&salaried(role, "Toronto", 1.0, 2.0), now).await.is_some());
        }
        assert_eq!(source.calls(), 2);

        // Third distinct key: quota spent, nothing cached.
        assert!(engine
            .analyze_salary_at(&salaried("Product Manager", "Toronto", 1.0, 2.0), now)
            .await
            .is_none());
        assert_eq!(source.calls(), 2);
        assert_eq!(store.get(local_day(now)).await.unwrap(), 2);

        // Expired entry for a known key is still served while the quota is spent.
        let later = now + Duration::hours(25);
        store.increment(local_day(later)).await.unwrap();
        store.increment(local_day(later)).await.unwrap();
        assert!(engine
            .analyze_salary_at(&salaried("Data Analyst", "Toronto", 1.0, 2.0), later)
            .await
            .is_some());
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn quota_survives_engine_restart() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let config = MarketConfig {
            max_daily_calls: 1,
            ..MarketConfig::default()
        };
        let now = at(1, 12);
        let first = FakeSource::new(vec![]);
        let engine = MarketAnalysisEngine::new(
            Some(first.clone() as Arc<dyn MarketSampleSource>),
            store.clone(),
            config.clone(),
        );
        engine.analyze_salary_at(&salaried("Dev", "Toronto", 1.0, 2.0), now).await;
        assert_eq!(first.calls(), 1);

        let second = FakeSource::new(vec![]);
        let restarted = MarketAnalysisEngine::new(Some(second.clone() as Arc<dyn MarketSampleSource>), store, config);
        assert!(restarted
            .analyze_salary_at(&salaried("Dev", "Toronto", 1.0, 2.0), now)
            .await
            .is_none());
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn failed_fetch_uses_expired_sample() {
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let good = FakeSource::new(vec![posting(Some(100.0), Some(200.0), None)]);
        let engine = MarketAnalysisEngine::new(
            Some(good as Arc<dyn MarketSampleSource>),
            store.clone(),
            MarketConfig::default(),
        );
        let now = at(1, 12);
        let j = salaried("Dev", "Toronto", 1.0, 2.0);
        engine.analyze_salary_at(&j, now).await.unwrap();

        let failing = FakeSource::failing();
        let engine = MarketAnalysisEngine {
            source: Some(failing.clone() as Arc<dyn MarketSampleSource>),
            ..engine
        };
        let analysis = engine.analyze_salary_at(&j, now + Duration::hours(30)).await;
        assert_eq!(failing.calls(), 1);
        assert_eq!(analysis.and_then(|a| a.average_salary), Some(150.0));
    }

    #[tokio::test]
    async fn old_samples_and_idle_locks_are_pruned() {
        let source = FakeSource::new(vec![posting(Some(100.0), Some(200.0), None)]);
        let (engine, _store) = new_engine(source.clone(), MarketConfig::default()).await;
        let now = at(1, 12);
        for role in ["Data Analyst", "Designer", "Product Manager"] {
            engine.analyze_salary_at(&salaried(role, "Toronto", 1.0, 2.0), now).await.unwrap();
        }
        assert_eq!(engine.samples.lock().await.len(), 3);

        let week_later = now + Duration::days(8);
        engine
            .analyze_salary_at(&salaried("Rust Developer", "Toronto", 1.0, 2.0), week_later)
            .await
            .unwrap();
        let samples = engine.samples.lock().await;
        assert_eq!(samples.len(), 1);
        assert!(samples.contains_key(&SearchKey::new("Rust Developer", "Toronto")));
        drop(samples);
        assert_eq!(engine.key_locks.lock().await.len(), 1);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test]
    async fn enrich_analyzes_top_jobs_and_keeps_everything() {
        let source = FakeSource::new(vec![posting(Some(100_000.0), None, None)]);
        let config = MarketConfig {
            max_jobs_per_run: 2,
            batch_size: 1,
            ..MarketConfig::default()
        };
        let (engine, _) = new_engine(source, config).await;
        let jobs = vec![
            salaried("Low", "Toronto", 40_000.0, 50_000.0),
            job("adzuna", "none", "Acme", "No Salary", "Toronto"),
            salaried("High", "Toronto", 150_000.0, 180_000.0),
            salaried("Mid", "Toronto", 90_000.0, 100_000.0),
        ];
        let out = engine.enrich(jobs, at(1, 12)).await;
        let titles = out.iter().map(|j| j.job.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["High", "Mid", "No Salary", "Low"]);
        assert!(out[0].salary_analysis.is_some());
        assert!(out[1].salary_analysis.is_some());
        assert!(out[2].salary_analysis.is_none());
        assert!(out[3].salary_analysis.is_none());
    }
}
