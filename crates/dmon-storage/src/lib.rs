//! Remote table store access + upstream HTTP fetch utilities for the depot monitor.

mod cache;
mod client;
#[cfg(any(test, feature = "testing"))]
mod memory;
mod pool;

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub use cache::{CacheEntry, ResponseCache};
pub use client::{StoreClient, StoreConfig, StoreRequest};
#[cfg(any(test, feature = "testing"))]
pub use memory::{MemoryStore, StoreOp};
pub use pool::{ConnectionPool, PooledConnection};

pub const CRATE_NAME: &str = "dmon-storage";

/// Errors surfaced by the store layer. Every store operation returns these as values.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("http status {status} for {method} {url}: {body}")]
    HttpStatus {
        method: String,
        status: u16,
        url: String,
        body: String,
    },
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("failed to acquire a store connection after {attempts} attempts: {last_error}")]
    ConnectionExhausted { attempts: usize, last_error: String },
    #[error("failed to decode response from `{endpoint}`: {message}")]
    Decode { endpoint: String, message: String },
}

impl StoreError {
    /// PostgREST reports an unknown relation with SQLSTATE `42P01`.
    pub fn is_missing_table(&self) -> bool {
        matches!(self, StoreError::HttpStatus { body, .. } if body.contains("42P01"))
    }

    pub fn is_connection_exhausted(&self) -> bool {
        matches!(self, StoreError::ConnectionExhausted { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Transport(err.to_string())
    }
}

/// Result of a chunked insert. A set `error` with `inserted > 0` is a partial batch
/// failure: earlier chunks stay committed, later chunks were never sent.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub error: Option<StoreError>,
}

impl BatchOutcome {
    pub fn is_partial(&self) -> bool {
        self.error.is_some() && self.inserted > 0
    }

    pub fn into_result(self) -> Result<usize, StoreError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.inserted),
        }
    }
}

/// Table-level operations the sync engine and query layer need from a store.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Filtered read. `params` are PostgREST query parameters.
    async fn select(
        &self,
        table: &str,
        params: &[(String, String)],
        use_cache: bool,
    ) -> Result<Vec<JsonValue>, StoreError>;

    /// Every row of `table`, paging until exhausted.
    async fn select_all(&self, table: &str, columns: &str) -> Result<Vec<JsonValue>, StoreError>;

    async fn insert_rows(&self, table: &str, rows: &[JsonValue]) -> BatchOutcome;

    async fn delete_all(&self, table: &str) -> Result<(), StoreError>;

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;

    /// Cheap existence probe per table, results in input order.
    async fn probe_tables(&self, tables: &[String]) -> Vec<Result<(), StoreError>>;
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    /// Constant delay between attempts; `attempts` counts the first try.
    pub fn fixed(attempts: usize, delay: Duration) -> Self {
        Self {
            max_retries: attempts.saturating_sub(1),
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Retrying GET client for the upstream report export.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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

    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        url: &str,
        params: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_with_retries(url, params).instrument(span).await
    }

    async fn fetch_with_retries(
        &self,
        url: &str,
        params: &[(String, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).query(params).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(reqwest::header::CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(attempt, status = status.as_u16(), "retrying export fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tracing::warn!(attempt, error = %err, "retrying export fetch");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
