use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use refsync_core::CatalogItem;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

use crate::{CatalogSource, SeedData, SourceError};

/// Capped exponential pauses between attempts at one upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub retries: usize,
    pub first_pause: Duration,
    pub max_pause: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            retries: 3,
            first_pause: Duration::from_millis(250),
            max_pause: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    /// Pause before the zero-based `retry`, or `None` once retries are spent.
    pub fn pause_before(&self, retry: usize) -> Option<Duration> {
        if retry >= self.retries {
            return None;
        }
        let doubling = u32::try_from(retry)
            .ok()
            .and_then(|r| 1u32.checked_shl(r))
            .unwrap_or(u32::MAX);
        Some(self.first_pause.saturating_mul(doubling).min(self.max_pause))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retries: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: Some(format!("refsync/{}", env!("CARGO_PKG_VERSION"))),
            retries: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("undecodable response from {url}: {message}")]
    Decode { url: String, message: String },
}

/// Throttling and server-side failures may clear up on their own.
fn transient_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

fn transient_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// One failed attempt, and whether another attempt could succeed.
struct AttemptFailure {
    error: FetchError,
    transient: bool,
}

impl From<reqwest::Error> for AttemptFailure {
    fn from(err: reqwest::Error) -> Self {
        Self {
            transient: transient_error(&err),
            error: FetchError::Request(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    retries: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = config.user_agent {
            builder = builder.user_agent(user_agent);
        }
        let client = builder.build().context("building upstream http client")?;
        Ok(Self {
            client,
            retries: config.retries,
        })
    }

    /// Sends the request built by `build`, retrying transient failures, and
    /// decodes a successful body as JSON.
    pub async fn send_json<T, F>(&self, url: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        self.send_with_retry(url, build)
            .instrument(info_span!("upstream_fetch", url))
            .await
    }

    async fn send_with_retry<T, F>(&self, url: &str, build: F) -> Result<T, FetchError>
    where
        T: DeserializeOwned,
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut retry = 0;
        loop {
            let failure = match self.attempt(url, build(&self.client)).await {
                Ok(value) => return Ok(value),
                Err(failure) => failure,
            };
            let pause = if failure.transient {
                self.retries.pause_before(retry)
            } else {
                None
            };
            let Some(pause) = pause else {
                return Err(failure.error);
            };
            warn!(error = %failure.error, retry, ?pause, "upstream call failed; retrying");
            tokio::time::sleep(pause).await;
            retry += 1;
        }
    }

    async fn attempt<T: DeserializeOwned>(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, AttemptFailure> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            debug!(status = status.as_u16(), "upstream answered with an error status");
            return Err(AttemptFailure {
                error: FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                },
                transient: transient_status(status),
            });
        }
        let body = resp.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| AttemptFailure {
            error: FetchError::Decode {
                url: url.to_string(),
                message: e.to_string(),
            },
            transient: false,
        })
    }
}

/// The upstream integration: `POST {base}/init` and `GET {base}/delta`.
#[derive(Debug, Clone)]
pub struct HttpCatalogSource {
    base_url: String,
    fetcher: HttpFetcher,
}

impl HttpCatalogSource {
    pub fn new(base_url: impl Into<String>, fetcher: HttpFetcher) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            fetcher,
        }
    }
}

#[async_trait]
impl CatalogSource for HttpCatalogSource {
    fn name(&self) -> &'static str {
        "upstream"
    }

    async fn initial_load(&self) -> Result<SeedData, SourceError> {
        let url = format!("{}/init", self.base_url);
        Ok(self.fetcher.send_json(&url, |c| c.post(&url)).await?)
    }

    async fn delta(&self, since: Option<DateTime<Utc>>) -> Result<Vec<CatalogItem>, SourceError> {
        let url = format!("{}/delta", self.base_url);
        let since = since.map(|ts| ts.to_rfc3339_opts(SecondsFormat::Millis, true));
        let items = self
            .fetcher
            .send_json(&url, |c| match &since {
                Some(since) => c.get(&url).query(&[("since", since)]),
                None => c.get(&url),
            })
            .await?;
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use axum::extract::{Query, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    fn fast_fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            retries: RetrySchedule {
                retries: 3,
                first_pause: Duration::from_millis(1),
                max_pause: Duration::from_millis(5),
            },
        })
        .expect("client")
    }

    async fn spawn(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        format!("http://{addr}/")
    }

    #[test]
    fn pauses_double_up_to_the_ceiling_then_stop() {
        let schedule = RetrySchedule {
            retries: 4,
            first_pause: Duration::from_millis(100),
            max_pause: Duration::from_millis(350),
        };
        let pauses: Vec<Option<Duration>> = (0..5).map(|r| schedule.pause_before(r)).collect();
        assert_eq!(
            pauses,
            vec![
                Some(Duration::from_millis(100)),
                Some(Duration::from_millis(200)),
                Some(Duration::from_millis(350)),
                Some(Duration::from_millis(350)),
                None,
            ]
        );
    }

    #[test]
    fn only_throttling_and_server_errors_are_transient() {
        assert!(transient_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(transient_status(StatusCode::BAD_GATEWAY));
        assert!(!transient_status(StatusCode::NOT_FOUND));
        assert!(!transient_status(StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn persistent_server_errors_give_up_after_the_schedule() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/init",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::SERVICE_UNAVAILABLE
                }),
            )
            .with_state(Arc::clone(&calls));
        let base = spawn(app).await;

        let err = HttpCatalogSource::new(base, fast_fetcher())
            .initial_load()
            .await
            .expect_err("unavailable");
        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 503, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn delta_retries_transient_failures_and_forwards_since() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/delta",
                get(
                    |State(calls): State<Arc<AtomicUsize>>,
                     Query(q): Query<HashMap<String, String>>| async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            return Err(AxumStatus::SERVICE_UNAVAILABLE);
                        }
                        let name = q.get("since").cloned().unwrap_or_default();
                        Ok(Json(vec![CatalogItem::new(7, 1, name)]))
                    },
                ),
            )
            .with_state(Arc::clone(&calls));
        let base = spawn(app).await;

        let source = HttpCatalogSource::new(base, fast_fetcher());
        let since = DateTime::parse_from_rfc3339("2026-01-02T03:04:05Z")
            .expect("ts")
            .with_timezone(&Utc);
        let items = source.delta(Some(since)).await.expect("delta");

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "2026-01-02T03:04:05.000Z");
    }

    #[tokio::test]
    async fn non_retryable_status_surfaces_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let app = Router::new()
            .route(
                "/init",
                post(|State(calls): State<Arc<AtomicUsize>>| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    AxumStatus::FORBIDDEN
                }),
            )
            .with_state(Arc::clone(&calls));
        let base = spawn(app).await;

        let err = HttpCatalogSource::new(base, fast_fetcher())
            .initial_load()
            .await
            .expect_err("forbidden");
        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 403, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn initial_load_decodes_seed_payload() {
        let app = Router::new().route(
            "/init",
            post(|| async {
                Json(serde_json::json!({
                    "tags": [{"name": "fire"}],
                    "categoryGroups": [{"number": 1, "name": "generation i"}],
                }))
            }),
        );
        let base = spawn(app).await;

        let seed = HttpCatalogSource::new(base, fast_fetcher())
            .initial_load()
            .await
            .expect("init");
        assert_eq!(seed.tags.len(), 1);
        assert_eq!(seed.category_groups[0].number, 1);
        assert!(seed.items.is_empty());
    }
}
