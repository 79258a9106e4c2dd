//! Resilient HTTP retrieval: the only network boundary of the monitor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use rand::Rng;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

/// Anything that can turn a URL into page HTML.
///
/// `None` means "nothing usable this time"; implementations log the reason
/// and never surface it to the caller.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> Option<String>;
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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Attempts made after the first one.
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Randomized pause before every request, to stay under upstream rate limits.
#[derive(Debug, Clone, Copy)]
pub struct JitterPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_millis(600),
        }
    }
}

impl JitterPolicy {
    pub fn none() -> Self {
        Self {
            min: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let min = self.min.as_millis() as u64;
        let max = self.max.as_millis() as u64;
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub jitter: JitterPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: "partner-monitor/0.1 (+directory mirror)".to_string(),
            max_in_flight: 8,
            backoff: BackoffPolicy::default(),
            jitter: JitterPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Closed,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    backoff: BackoffPolicy,
    jitter: JitterPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            backoff: config.backoff,
            jitter: config.jitter,
        })
    }

    /// Fetch a page body, retrying throttling, server errors and transport
    /// failures according to the backoff policy.
    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self.in_flight.acquire().await.map_err(|_| FetchError::Closed)?;

        let span = info_span!("http_fetch", url);
        async {
            let mut attempt = 0usize;
            loop {
                tokio::time::sleep(self.jitter.sample()).await;

                let (disposition, err) = match self.client.get(url).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        if !status.is_success() {
                            (
                                classify_status(status),
                                FetchError::HttpStatus {
                                    status: status.as_u16(),
                                    url: resp.url().to_string(),
                                },
                            )
                        } else {
                            match resp.text().await {
                                Ok(body) => return Ok(body),
                                Err(source) => (
                                    classify_reqwest_error(&source),
                                    FetchError::Request {
                                        url: url.to_string(),
                                        source,
                                    },
                                ),
                            }
                        }
                    }
                    Err(source) => (
                        classify_reqwest_error(&source),
                        FetchError::Request {
                            url: url.to_string(),
                            source,
                        },
                    ),
                };

                if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                    let delay = self.backoff.delay_for_attempt(attempt);
                    debug!(attempt, ?delay, error = %err, "retrying fetch");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                return Err(err);
            }
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_html(&self, url: &str) -> Option<String> {
        match self.fetch_text(url).await {
            Ok(body) => Some(body),
            Err(err) => {
                warn!(url, error = %err, "fetch failed; treating page as empty");
                None
            }
        }
    }
}
