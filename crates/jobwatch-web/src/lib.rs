//! Read-only JSON API over the persisted batch and the cache-first feed.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use jobwatch_core::{EnrichedBatch, JobRecord, JobsBatch};
use jobwatch_storage::{read_if_exists, BatchStore};
use jobwatch_sync::{JobFeed, Services};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "jobwatch-web";

#[derive(Clone)]
pub struct AppState {
    pub batches: BatchStore,
    pub feed: Arc<JobFeed>,
}

impl AppState {
    pub fn new(batches: BatchStore, feed: JobFeed) -> Self {
        Self {
            batches,
            feed: Arc::new(feed),
        }
    }

    pub fn from_services(services: &Services) -> Self {
        Self::new(services.batches.clone(), services.feed())
    }
}

#[derive(Debug, Deserialize, Default)]
struct JobsQuery {
    provider: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

/// Comma-separated lists, e.g. `?roles=Rust Developer,Data Analyst&locations=Toronto`.
#[derive(Debug, Deserialize, Default)]
struct InterestsQuery {
    #[serde(default)]
    roles: String,
    #[serde(default)]
    locations: String,
    requester: Option<String>,
}

impl InterestsQuery {
    fn roles(&self) -> Vec<String> {
        split_list(&self.roles)
    }

    fn locations(&self) -> Vec<String> {
        split_list(&self.locations)
    }
}

#[derive(Debug, Serialize)]
struct JobsPage {
    generated_at: DateTime<Utc>,
    total: usize,
    page: usize,
    per_page: usize,
    total_pages: usize,
    provider_counts: BTreeMap<String, usize>,
    jobs: Vec<JobRecord>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/jobs", get(jobs_handler))
        .route("/api/jobs/{id}", get(job_detail_handler))
        .route("/api/jobs/enriched", get(enriched_handler))
        .route("/api/feed", get(feed_handler))
        .route("/api/searches/stale", get(stale_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(services: &Services) -> anyhow::Result<()> {
    let port = services.config.web_port;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving read api");
    axum::serve(listener, app(AppState::from_services(services))).await?;
    Ok(())
}

async fn health_handler() -> Response {
    Json(json!({"status": "ok"})).into_response()
}

async fn jobs_handler(State(state): State<Arc<AppState>>, Query(query): Query<JobsQuery>) -> Response {
    match state.batches.load_batch().await {
        Ok(Some(batch)) => Json(paginate(batch, &query)).into_response(),
        Ok(None) => no_batch(),
        Err(err) => server_error(err),
    }
}

async fn job_detail_handler(State(state): State<Arc<AppState>>, AxumPath(id): AxumPath<String>) -> Response {
    match state.batches.load_batch().await {
        Ok(Some(batch)) => match batch.jobs.into_iter().find(|j| j.id == id) {
            Some(job) => Json(job).into_response(),
            None => not_found(format!("job {id} not in the current batch")),
        },
        Ok(None) => no_batch(),
        Err(err) => server_error(err),
    }
}

async fn enriched_handler(State(state): State<Arc<AppState>>) -> Response {
    let path = state.batches.enriched_path();
    let text = match read_if_exists(&path).await {
        Ok(Some(text)) => text,
        Ok(None) => return not_found("no enriched batch has been produced yet".to_string()),
        Err(err) => return server_error(err),
    };
    match serde_json::from_str::<EnrichedBatch>(&text) {
        Ok(enriched) => Json(enriched).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn feed_handler(State(state): State<Arc<AppState>>, Query(query): Query<InterestsQuery>) -> Response {
    let requester = query.requester.clone().unwrap_or_else(|| "anonymous".to_string());
    let result = state
        .feed
        .load_for_interests(&query.roles(), &query.locations(), &requester)
        .await;
    Json(result).into_response()
}

async fn stale_handler(State(state): State<Arc<AppState>>, Query(query): Query<InterestsQuery>) -> Response {
    match state
        .feed
        .stale_searches(&query.roles(), &query.locations(), Utc::now())
        .await
    {
        Ok(keys) => {
            let keys = keys.iter().map(ToString::to_string).collect::<Vec<_>>();
            Json(json!({"stale": keys})).into_response()
        }
        Err(err) => server_error(err),
    }
}

fn paginate(batch: JobsBatch, query: &JobsQuery) -> JobsPage {
    let mut provider_counts = BTreeMap::<String, usize>::new();
    for job in &batch.jobs {
        *provider_counts.entry(job.provider.clone()).or_default() += 1;
    }
    let selected = query.provider.clone().unwrap_or_default();
    let filtered = batch
        .jobs
        .into_iter()
        .filter(|j| selected.is_empty() || j.provider == selected)
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(50).clamp(1, 500);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let jobs = filtered
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .collect();

    JobsPage {
        generated_at: batch.generated_at,
        total,
        page,
        per_page,
        total_pages,
        provider_counts,
        jobs,
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn no_batch() -> Response {
    not_found("no batch has been produced yet".to_string())
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({"error": message}))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err:#}")})),
    )
        .into_response()
}
