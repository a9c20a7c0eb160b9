//! Outbound HTTP for providers: a shared client, in-flight limits per provider,
//! a politeness token bucket, and the retry policy applied by callers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// 5xx and 429 are worth another attempt; every other status is final.
pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RetryDisposition::Retryable,
        s if s.is_server_error() => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    match err.status() {
        Some(status) => classify_status(status),
        None if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() => {
            RetryDisposition::Retryable
        }
        None => RetryDisposition::NonRetryable,
    }
}

/// Doubling delay between attempts. `max_retries` excludes the first attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl BackoffPolicy {
    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    /// Delay after the failed attempt `retry_index` (zero-based).
    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        let shift = u32::try_from(retry_index).unwrap_or(u32::MAX).min(31);
        self.base_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

/// Run `op` until it succeeds, fails with an error `is_retryable` rejects, or
/// the policy runs out of attempts. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &BackoffPolicy,
    mut op: F,
    is_retryable: R,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= policy.max_retries || !is_retryable(&err) {
            return Err(err);
        }
        let delay = policy.delay_for_attempt(attempt);
        debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "attempt failed, backing off");
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Requests in flight across all providers.
    pub max_in_flight: usize,
    pub max_in_flight_per_provider: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 8,
            max_in_flight_per_provider: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Politeness throttle shared by every provider call: up to `capacity`
/// requests back to back, then one per `refill_every`.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<(u32, Instant)>,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new((capacity, Instant::now())),
        }
    }

    /// Wait until a token is available and consume it.
    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let wait = {
                let mut guard = self.state.lock().await;
                let (tokens, since) = &mut *guard;
                let earned = since.elapsed().as_nanos() / self.refill_every.as_nanos();
                if earned > 0 {
                    *tokens = tokens
                        .saturating_add(u32::try_from(earned).unwrap_or(u32::MAX))
                        .min(self.capacity);
                    *since += self.refill_every.saturating_mul(u32::try_from(earned).unwrap_or(u32::MAX));
                }
                if *tokens > 0 {
                    *tokens -= 1;
                    return;
                }
                self.refill_every.saturating_sub(since.elapsed())
            };
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    /// URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => match StatusCode::from_u16(*status) {
                Ok(status) => classify_status(status),
                Err(_) => RetryDisposition::NonRetryable,
            },
            FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }
}

/// One `reqwest` client for every provider. A call is a single attempt.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Semaphore,
    per_provider_limit: usize,
    per_provider: Mutex<HashMap<String, Arc<Semaphore>>>,
    bucket: Option<TokenBucket>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.timeout)
            .gzip(true)
            .brotli(true);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        Ok(Self {
            client: builder.build().context("building provider http client")?,
            in_flight: Semaphore::new(config.max_in_flight.max(1)),
            per_provider_limit: config.max_in_flight_per_provider.max(1),
            per_provider: Mutex::new(HashMap::new()),
            bucket: config
                .token_bucket
                .map(|b| TokenBucket::new(b.capacity, b.refill_every)),
        })
    }

    async fn provider_slots(&self, provider: &str) -> Arc<Semaphore> {
        self.per_provider
            .lock()
            .await
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_provider_limit)))
            .clone()
    }

    /// GET `url` for `provider`. Any non-2xx status is returned as [`FetchError::HttpStatus`].
    pub async fn get(
        &self,
        provider: &str,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let slots = self.provider_slots(provider).await;
        let _provider_permit = slots.acquire().await.map_err(|_| FetchError::Closed)?;
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;
        if let Some(bucket) = &self.bucket {
            bucket.take().await;
        }

        let mut request = self.client.get(url).query(query);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            debug!(status = status.as_u16(), bytes = body.len(), "provider response");
            Ok(FetchedResponse { status, url, body })
        }
        .instrument(info_span!("provider_http", provider, url))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn quick() -> BackoffPolicy {
        BackoffPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(3),
        }
    }

    #[test]
    fn default_policy_is_three_attempts_from_half_a_second() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.attempts(), 3);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(usize::MAX), Duration::from_secs(4));
    }

    #[test]
    fn rate_limits_and_server_errors_are_retryable() {
        assert_eq!(classify_status(StatusCode::SERVICE_UNAVAILABLE), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        let err = FetchError::HttpStatus {
            status: 502,
            url: "https://api.example/jobs".into(),
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[tokio::test]
    async fn gives_up_after_the_last_attempt() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = retry_with_backoff(
            &quick(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("503".to_string()) }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Err("503".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), quick().attempts());
    }

    #[tokio::test]
    async fn zero_retries_means_a_single_attempt() {
        let policy = BackoffPolicy {
            max_retries: 0,
            ..quick()
        };
        let seen = std::sync::Mutex::new(Vec::new());
        let result: Result<(), String> = retry_with_backoff(
            &policy,
            |attempt| {
                seen.lock().unwrap().push(attempt);
                async { Err("timeout".to_string()) }
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(*seen.lock().unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn recovers_on_a_later_attempt() {
        let result: Result<&str, String> = retry_with_backoff(
            &quick(),
            |attempt| async move {
                match attempt {
                    0 | 1 => Err(format!("flaky {attempt}")),
                    _ => Ok("results"),
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok("results"));
    }

    #[tokio::test]
    async fn final_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let _ = retry_with_backoff(
            &quick(),
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("401".to_string()) }
            },
            |err: &String| err != "401",
        )
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn politeness_bucket_spaces_out_calls() {
        let bucket = TokenBucket::new(1, Duration::from_millis(40));
        let start = Instant::now();
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(40));
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn zero_interval_never_waits() {
        let bucket = TokenBucket::new(1, Duration::ZERO);
        let start = Instant::now();
        for _ in 0..50 {
            bucket.take().await;
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
