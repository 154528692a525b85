//! In-memory snapshot history + HTTP fetch utilities for PriceTracker Pro.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use ptp_core::Snapshot;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ptp-storage";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HistoryError {
    #[error("snapshot collected at {attempted} is not after the last snapshot ({last})")]
    NonMonotonicTimestamp {
        last: DateTime<Utc>,
        attempted: DateTime<Utc>,
    },
}

impl HistoryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NonMonotonicTimestamp { .. } => "non_monotonic_timestamp",
        }
    }
}

/// Append-only sequence of snapshots ordered by `collected_at`.
///
/// The sequence is copy-on-write: `all()` hands out the current
/// `Arc<[Arc<Snapshot>]>` and an append swaps in a new one, so a reader holds
/// either the sequence before an append or after it.
#[derive(Debug)]
pub struct History {
    snapshots: RwLock<Arc<[Arc<Snapshot>]>>,
}

impl Default for History {
    fn default() -> Self {
        Self::new()
    }
}

impl History {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(Arc::from(Vec::new())),
        }
    }

    pub fn append(&self, snapshot: Snapshot) -> Result<Arc<Snapshot>, HistoryError> {
        let mut guard = self.snapshots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = guard.last() {
            if snapshot.collected_at <= last.collected_at {
                return Err(HistoryError::NonMonotonicTimestamp {
                    last: last.collected_at,
                    attempted: snapshot.collected_at,
                });
            }
        }

        let snapshot = Arc::new(snapshot);
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(Arc::clone(&snapshot));
        *guard = Arc::from(next);
        debug!(
            run_id = %snapshot.run_id,
            collected_at = %snapshot.collected_at,
            listings = snapshot.listings.len(),
            "snapshot appended"
        );
        Ok(snapshot)
    }

    pub fn all(&self) -> Arc<[Arc<Snapshot>]> {
        Arc::clone(&self.snapshots.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.snapshots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn at(&self, collected_at: DateTime<Utc>) -> Option<Arc<Snapshot>> {
        let all = self.all();
        all.binary_search_by_key(&collected_at, |s| s.collected_at)
            .ok()
            .map(|idx| Arc::clone(&all[idx]))
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only handle on a [`History`] owned by someone else.
#[derive(Debug, Clone)]
pub struct HistoryView {
    inner: Arc<History>,
}

impl HistoryView {
    pub fn new(inner: Arc<History>) -> Self {
        Self { inner }
    }

    pub fn all(&self) -> Arc<[Arc<Snapshot>]> {
        self.inner.all()
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.latest()
    }

    pub fn at(&self, collected_at: DateTime<Utc>) -> Option<Arc<Snapshot>> {
        self.inner.at(collected_at)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

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
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Deadline for a single outbound request.
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, run_id: Uuid, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            let retries_left = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                    debug!(%status, attempt, "retryable status");
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || !retries_left {
                        return Err(FetchError::Request(err));
                    }
                    debug!(error = %err, attempt, "retryable request error");
                }
            }
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn snapshot_at(minute: u32) -> Snapshot {
        Snapshot::new(
            Uuid::new_v4(),
            Utc.with_ymd_and_hms(2026, 3, 1, 12, minute, 0).single().unwrap(),
            Vec::new(),
        )
    }

    #[test]
    fn appends_keep_insertion_order() {
        let history = History::new();
        for minute in [0, 15, 30] {
            history.append(snapshot_at(minute)).expect("append");
        }
        let all = history.all();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].collected_at < w[1].collected_at));
        assert_eq!(history.latest().unwrap().collected_at, all[2].collected_at);
    }

    #[test]
    fn non_increasing_timestamp_is_rejected_without_mutation() {
        let history = History::new();
        history.append(snapshot_at(15)).expect("append");

        let err = history.append(snapshot_at(15)).unwrap_err();
        assert_eq!(err.kind(), "non_monotonic_timestamp");
        let err = history.append(snapshot_at(5)).unwrap_err();
        assert!(matches!(err, HistoryError::NonMonotonicTimestamp { .. }));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn previously_returned_view_is_not_affected_by_appends() {
        let history = Arc::new(History::new());
        let view = HistoryView::new(Arc::clone(&history));
        history.append(snapshot_at(0)).expect("append");

        let before = view.all();
        history.append(snapshot_at(1)).expect("append");

        assert_eq!(before.len(), 1);
        assert_eq!(view.all().len(), 2);
        assert!(view.at(before[0].collected_at).is_some());
        assert!(view.at(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).single().unwrap()).is_none());
    }

    #[test]
    fn empty_history_has_no_latest() {
        let history = History::default();
        assert!(history.is_empty());
        assert!(history.latest().is_none());
        assert!(history.all().is_empty());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn only_server_errors_and_throttling_are_retried() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    /// Answers GET / with `statuses` in order, repeating the last one, and counts requests.
    async fn scripted_server(statuses: Vec<u16>) -> (String, Arc<std::sync::atomic::AtomicUsize>) {
        use axum::{routing::get, Router};
        use std::sync::atomic::{AtomicUsize, Ordering};

        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                let statuses = statuses.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    let code = statuses[n.min(statuses.len() - 1)];
                    (StatusCode::from_u16(code).unwrap(), "<html>ok</html>")
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), hits)
    }

    fn quick_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("ptp-test".to_string()),
            backoff: BackoffPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(50),
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn unavailable_page_is_retried_until_it_loads() {
        use std::sync::atomic::Ordering;

        let (url, hits) = scripted_server(vec![503, 200]).await;
        let resp = quick_fetcher().fetch_bytes(Uuid::new_v4(), &url).await.unwrap();

        assert_eq!(resp.status, StatusCode::OK);
        assert_eq!(resp.body, b"<html>ok</html>");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_page_is_not_retried() {
        use std::sync::atomic::Ordering;

        let (url, hits) = scripted_server(vec![404]).await;
        let err = quick_fetcher().fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_stop_at_the_configured_limit() {
        use std::sync::atomic::Ordering;

        let (url, hits) = scripted_server(vec![503]).await;
        let err = quick_fetcher().fetch_bytes(Uuid::new_v4(), &url).await.unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
