use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::StoreConfig;
use crate::StoreError;

/// Authenticated handle onto the store endpoint. Owned by exactly one caller between
/// `acquire` and `release`.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub endpoint: String,
    pub auth_headers: HeaderMap,
    pub last_used: Instant,
}

/// Bounded pool of validated connections. New connections are probed against the
/// REST root before use; acquisition retries under the configured backoff.
#[derive(Debug)]
pub struct ConnectionPool {
    http: reqwest::Client,
    config: StoreConfig,
    idle: Mutex<Vec<PooledConnection>>,
}

impl ConnectionPool {
    pub fn new(http: reqwest::Client, config: StoreConfig) -> Self {
        Self {
            http,
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    pub async fn acquire(&self) -> Result<PooledConnection, StoreError> {
        let policy = self.config.acquire_backoff;
        let mut last_error = String::new();

        for attempt in 0..policy.attempts() {
            if let Some(conn) = self.idle.lock().await.pop() {
                return Ok(conn);
            }

            match self.open().await {
                Ok(conn) => return Ok(conn),
                Err(err @ StoreError::Configuration(_)) => return Err(err),
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "store connection attempt failed");
                    last_error = err.to_string();
                    if attempt + 1 < policy.attempts() {
                        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;
                    }
                }
            }
        }

        Err(StoreError::ConnectionExhausted {
            attempts: policy.attempts(),
            last_error,
        })
    }

    /// Returns the handle to the pool when there is spare capacity, otherwise drops it.
    pub async fn release(&self, mut conn: PooledConnection) {
        let mut idle = self.idle.lock().await;
        if idle.len() < self.config.max_pool_size {
            conn.last_used = Instant::now();
            idle.push(conn);
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    pub async fn close_all(&self) {
        self.idle.lock().await.clear();
    }

    async fn open(&self) -> Result<PooledConnection, StoreError> {
        self.config.validate()?;
        let auth_headers = auth_headers(&self.config.api_key)?;
        let endpoint = self.config.base_url.trim_end_matches('/').to_string();
        let probe_url = format!("{endpoint}/rest/v1/");

        let resp = self
            .http
            .get(&probe_url)
            .headers(auth_headers.clone())
            .timeout(self.config.timeout)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(StoreError::HttpStatus {
                method: "GET".into(),
                status,
                url: probe_url,
                body,
            });
        }

        debug!(endpoint = %endpoint, "opened store connection");
        Ok(PooledConnection {
            endpoint,
            auth_headers,
            last_used: Instant::now(),
        })
    }
}

fn auth_headers(api_key: &str) -> Result<HeaderMap, StoreError> {
    let key = HeaderValue::from_str(api_key)
        .map_err(|e| StoreError::Configuration(format!("invalid api key: {e}")))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {api_key}"))
        .map_err(|e| StoreError::Configuration(format!("invalid api key: {e}")))?;

    let mut headers = HeaderMap::new();
    headers.insert("apikey", key);
    headers.insert(AUTHORIZATION, bearer);
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}
