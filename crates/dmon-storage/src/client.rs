use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::header::{HeaderValue, CONTENT_RANGE};
use reqwest::Method;
use serde_json::Value as JsonValue;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::ResponseCache;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::{BackoffPolicy, BatchOutcome, StoreError, TableStore};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
    pub max_pool_size: usize,
    pub acquire_backoff: BackoffPolicy,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub page_size: usize,
}

impl StoreConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(30),
            max_pool_size: 5,
            acquire_backoff: BackoffPolicy::fixed(3, Duration::from_secs(1)),
            cache_capacity: 1000,
            cache_ttl: Duration::from_secs(300),
            batch_size: 100,
            max_concurrent: 10,
            page_size: 1000,
        }
    }

    pub fn validate(&self) -> Result<(), StoreError> {
        if self.base_url.trim().is_empty() || self.api_key.trim().is_empty() {
            return Err(StoreError::Configuration(
                "missing store url or api key".to_string(),
            ));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(StoreError::Configuration(format!(
                "store url must start with http:// or https://, got `{}`",
                self.base_url
            )));
        }
        Ok(())
    }
}

/// One REST call against the store. `endpoint` is the path below `/rest/v1/`.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    pub method: Method,
    pub endpoint: String,
    pub body: Option<JsonValue>,
    pub params: Vec<(String, String)>,
    pub use_cache: bool,
    pub prefer: Option<&'static str>,
}

impl StoreRequest {
    pub fn new(method: Method, endpoint: impl Into<String>) -> Self {
        Self {
            method,
            endpoint: endpoint.into(),
            body: None,
            params: Vec::new(),
            use_cache: false,
            prefer: None,
        }
    }

    pub fn get(endpoint: impl Into<String>) -> Self {
        Self::new(Method::GET, endpoint)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn params(mut self, params: &[(String, String)]) -> Self {
        self.params.extend_from_slice(params);
        self
    }

    pub fn body(mut self, body: JsonValue) -> Self {
        self.body = Some(body);
        self
    }

    pub fn cached(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    pub fn prefer(mut self, prefer: &'static str) -> Self {
        self.prefer = Some(prefer);
        self
    }
}

/// Pooled, cached, concurrency-limited client for the resource-per-table REST store.
#[derive(Debug)]
pub struct StoreClient {
    http: reqwest::Client,
    pool: ConnectionPool,
    cache: ResponseCache,
    in_flight: Arc<Semaphore>,
    config: StoreConfig,
}

impl StoreClient {
    pub fn new(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("building http client: {e}")))?;
        Ok(Self {
            pool: ConnectionPool::new(http.clone(), config.clone()),
            cache: ResponseCache::new(config.cache_capacity, config.cache_ttl),
            in_flight: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
            http,
            config,
        })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub async fn request(&self, req: &StoreRequest) -> Result<JsonValue, StoreError> {
        let cache_key = (req.use_cache && req.method == Method::GET)
            .then(|| ResponseCache::key(&req.method, &req.endpoint, &req.params));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                debug!(endpoint = %req.endpoint, "store cache hit");
                return Ok(hit);
            }
        }

        let resp = self.send(req).await?;
        let payload = decode_body(&req.endpoint, resp).await?;

        match cache_key {
            Some(key) => self.cache.insert(key, &req.endpoint, payload.clone()).await,
            None if req.method != Method::GET => {
                self.cache.invalidate_endpoint(&req.endpoint).await
            }
            None => {}
        }
        Ok(payload)
    }

    async fn send(&self, req: &StoreRequest) -> Result<reqwest::Response, StoreError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| StoreError::Transport("store client is closed".to_string()))?;
        let conn = self.pool.acquire().await?;
        let result = self.send_on(&conn, req).await;
        self.pool.release(conn).await;
        result
    }

    async fn send_on(
        &self,
        conn: &PooledConnection,
        req: &StoreRequest,
    ) -> Result<reqwest::Response, StoreError> {
        let url = format!("{}/rest/v1/{}", conn.endpoint, req.endpoint);
        let mut builder = self
            .http
            .request(req.method.clone(), &url)
            .headers(conn.auth_headers.clone())
            .query(&req.params);
        if let Some(prefer) = req.prefer {
            builder = builder.header("Prefer", HeaderValue::from_static(prefer));
        }
        if let Some(body) = &req.body {
            builder = builder.json(body);
        }

        let resp = builder.send().await.map_err(|e| {
            let err = StoreError::from(e);
            error!(
                method = %req.method,
                endpoint = %req.endpoint,
                error = %err,
                "store request failed"
            );
            err
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let err = StoreError::HttpStatus {
                method: req.method.to_string(),
                status: status.as_u16(),
                url,
                body,
            };
            error!(error = %err, "store request rejected");
            return Err(err);
        }
        Ok(resp)
    }

    pub async fn get(
        &self,
        endpoint: &str,
        params: &[(String, String)],
        use_cache: bool,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let req = StoreRequest::get(endpoint).params(params).cached(use_cache);
        into_rows(endpoint, self.request(&req).await?)
    }

    /// Reads every row of `table` ordered by `id`, one page at a time.
    pub async fn fetch_all(
        &self,
        table: &str,
        columns: &str,
    ) -> Result<Vec<JsonValue>, StoreError> {
        let page_size = self.config.page_size.max(1);
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let req = StoreRequest::get(table)
                .param("select", columns)
                .param("order", "id.asc")
                .param("limit", page_size.to_string())
                .param("offset", offset.to_string());
            let page = into_rows(table, self.request(&req).await?)?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        Ok(rows)
    }

    /// Inserts `rows` in fixed-size chunks, sequentially. The first failing chunk stops
    /// the batch; chunks already written are not rolled back.
    pub async fn batch_insert(&self, table: &str, rows: &[JsonValue]) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        if rows.is_empty() {
            return outcome;
        }

        for (index, chunk) in rows.chunks(self.config.batch_size.max(1)).enumerate() {
            let mut req = StoreRequest::new(Method::POST, table)
                .body(JsonValue::Array(chunk.to_vec()))
                .prefer("return=minimal");
            if let Some(columns) = column_list(chunk) {
                req = req.param("columns", columns);
            }

            if let Err(err) = self.request(&req).await {
                warn!(
                    table,
                    chunk = index + 1,
                    inserted = outcome.inserted,
                    error = %err,
                    "batch insert halted"
                );
                outcome.error = Some(err);
                return outcome;
            }
            outcome.inserted += chunk.len();
            debug!(table, chunk = index + 1, "inserted batch");
        }
        outcome
    }

    /// Deletes every row using an always-true filter on `id`.
    pub async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        let req = StoreRequest::new(Method::DELETE, table).param("id", "gte.0");
        self.request(&req).await.map(|_| ())
    }

    /// Exact row count taken from the `Content-Range` total.
    pub async fn count_rows(&self, table: &str, use_cache: bool) -> Result<u64, StoreError> {
        let req = StoreRequest::get(table)
            .param("select", "id")
            .param("limit", "1")
            .prefer("count=exact");
        let key = ResponseCache::key(&Method::GET, table, &[("count".into(), "exact".into())]);
        if use_cache {
            if let Some(hit) = self.cache.get(&key).await.and_then(|v| v.as_u64()) {
                return Ok(hit);
            }
        }

        let resp = self.send(&req).await?;
        let count = resp
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range_total)
            .ok_or_else(|| StoreError::Decode {
                endpoint: table.to_string(),
                message: "missing or open-ended Content-Range total".to_string(),
            })?;

        if use_cache {
            self.cache.insert(key, table, JsonValue::from(count)).await;
        }
        Ok(count)
    }

    /// Runs independent requests with bounded concurrency. Every request runs to
    /// completion; results come back in input order.
    pub async fn parallel_requests(
        &self,
        requests: Vec<StoreRequest>,
    ) -> Vec<Result<JsonValue, StoreError>> {
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
        let tasks = requests.into_iter().map(|req| {
            let limit = limit.clone();
            async move {
                let _permit = limit
                    .acquire()
                    .await
                    .map_err(|_| StoreError::Transport("request limiter closed".to_string()))?;
                self.request(&req).await
            }
        });
        join_all(tasks).await
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.request(&StoreRequest::get("").param("limit", "1"))
            .await
            .map(|_| ())
    }

    /// Periodic liveness check that logs failures until `cancel` fires.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.ping().await {
                            warn!(error = %err, "store health check failed");
                        }
                    }
                }
            }
        })
    }

    pub async fn close(&self) {
        self.in_flight.close();
        self.pool.close_all().await;
        self.cache.clear().await;
        info!("store client closed");
    }
}

#[async_trait]
impl TableStore for StoreClient {
    async fn select(
        &self,
        table: &str,
        params: &[(String, String)],
        use_cache: bool,
    ) -> Result<Vec<JsonValue>, StoreError> {
        self.get(table, params, use_cache).await
    }

    async fn select_all(&self, table: &str, columns: &str) -> Result<Vec<JsonValue>, StoreError> {
        self.fetch_all(table, columns).await
    }

    async fn insert_rows(&self, table: &str, rows: &[JsonValue]) -> BatchOutcome {
        self.batch_insert(table, rows).await
    }

    async fn delete_all(&self, table: &str) -> Result<(), StoreError> {
        StoreClient::delete_all(self, table).await
    }

    async fn count_rows(&self, table: &str) -> Result<u64, StoreError> {
        StoreClient::count_rows(self, table, true).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        StoreClient::ping(self).await
    }

    async fn probe_tables(&self, tables: &[String]) -> Vec<Result<(), StoreError>> {
        let requests = tables
            .iter()
            .map(|t| StoreRequest::get(t.as_str()).param("limit", "1"))
            .collect();
        self.parallel_requests(requests)
            .await
            .into_iter()
            .map(|r| r.map(|_| ()))
            .collect()
    }
}

async fn decode_body(endpoint: &str, resp: reqwest::Response) -> Result<JsonValue, StoreError> {
    let bytes = resp.bytes().await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(JsonValue::Null);
    }
    serde_json::from_slice(&bytes).map_err(|e| StoreError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn into_rows(endpoint: &str, payload: JsonValue) -> Result<Vec<JsonValue>, StoreError> {
    match payload {
        JsonValue::Array(rows) => Ok(rows),
        JsonValue::Null => Ok(Vec::new()),
        other => Err(StoreError::Decode {
            endpoint: endpoint.to_string(),
            message: format!("expected an array of rows, got {other}"),
        }),
    }
}

fn column_list(chunk: &[JsonValue]) -> Option<String> {
    let first = chunk.first()?.as_object()?;
    Some(first.keys().cloned().collect::<Vec<_>>().join(","))
}

/// `0-0/42` -> 42, `*/0` -> 0, `0-0/*` -> None.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit_once('/')?.1.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store_server() -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .mount(&server)
            .await;
        server
    }

    fn client_for(server: &MockServer) -> StoreClient {
        StoreClient::new(StoreConfig {
            acquire_backoff: BackoffPolicy::fixed(3, Duration::from_millis(5)),
            ..StoreConfig::new(server.uri(), "anon-key")
        })
        .expect("client")
    }

    async fn requests_to(server: &MockServer, verb: &str, route: &str) -> Vec<wiremock::Request> {
        server
            .received_requests()
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.method.as_str() == verb && r.url.path() == route)
            .collect()
    }

    fn rows(n: usize) -> Vec<JsonValue> {
        (0..n)
            .map(|i| json!({"order_number": format!("ORD-{i}"), "volume": i}))
            .collect()
    }

    #[tokio::test]
    async fn batch_insert_halts_on_failed_chunk_without_rollback() {
        let server = store_server().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/depot_manager"))
            .respond_with(ResponseTemplate::new(201))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/depot_manager"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .with_priority(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client.batch_insert("depot_manager", &rows(250)).await;

        assert_eq!(outcome.inserted, 100);
        assert!(outcome.is_partial());
        assert!(matches!(outcome.error, Some(StoreError::HttpStatus { status: 500, .. })));

        let posts = requests_to(&server, "POST", "/rest/v1/depot_manager").await;
        assert_eq!(posts.len(), 2);
        for post in &posts {
            let body: JsonValue = serde_json::from_slice(&post.body).unwrap();
            assert_eq!(body.as_array().unwrap().len(), 100);
        }
    }

    #[tokio::test]
    async fn batch_insert_splits_into_fixed_chunks() {
        let server = store_server().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/loaded"))
            .and(query_param("columns", "order_number,volume"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let outcome = client.batch_insert("loaded", &rows(250)).await;
        assert_eq!(outcome.clone().into_result().unwrap(), 250);

        let sizes: Vec<usize> = requests_to(&server, "POST", "/rest/v1/loaded")
            .await
            .iter()
            .map(|r| {
                serde_json::from_slice::<JsonValue>(&r.body)
                    .unwrap()
                    .as_array()
                    .unwrap()
                    .len()
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 50]);
    }

    #[tokio::test]
    async fn cached_reads_hit_upstream_once_until_a_write() {
        let server = store_server().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/approved"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/rest/v1/approved"))
            .and(query_param("id", "gte.0"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let params = vec![("limit".to_string(), "10".to_string())];
        let first = client.get("approved", &params, true).await.unwrap();
        let second = client.get("approved", &params, true).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(requests_to(&server, "GET", "/rest/v1/approved").await.len(), 1);

        client.delete_all("approved").await.unwrap();
        client.get("approved", &params, true).await.unwrap();
        assert_eq!(requests_to(&server, "GET", "/rest/v1/approved").await.len(), 2);
    }

    #[tokio::test]
    async fn fetch_all_pages_until_short_page() {
        let server = store_server().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/loaded_history"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}, {"id": 2}])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/loaded_history"))
            .and(query_param("offset", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 3}])))
            .mount(&server)
            .await;

        let client = StoreClient::new(StoreConfig {
            page_size: 2,
            ..StoreConfig::new(server.uri(), "anon-key")
        })
        .unwrap();
        let all = client.fetch_all("loaded_history", "*").await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn count_rows_reads_content_range_total() {
        let server = store_server().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/marked"))
            .respond_with(
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", "0-0/42")
                    .set_body_json(json!([{"id": 7}])),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert_eq!(client.count_rows("marked", true).await.unwrap(), 42);
        assert_eq!(client.count_rows("marked", true).await.unwrap(), 42);
        assert_eq!(requests_to(&server, "GET", "/rest/v1/marked").await.len(), 1);
    }

    #[tokio::test]
    async fn parallel_requests_gather_every_result() {
        let server = store_server().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/ordered"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/missing"))
            .respond_with(
                ResponseTemplate::new(404).set_body_string(r#"{"code":"42P01"}"#),
            )
            .mount(&server)
            .await;

        let client = client_for(&server);
        let results = client
            .parallel_requests(vec![
                StoreRequest::get("ordered"),
                StoreRequest::get("missing"),
                StoreRequest::get("ordered").param("limit", "1"),
            ])
            .await;

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].as_ref().unwrap_err().is_missing_table());
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn transport_failures_are_returned_not_raised() {
        let client = StoreClient::new(StoreConfig {
            acquire_backoff: BackoffPolicy::fixed(2, Duration::from_millis(1)),
            timeout: Duration::from_millis(200),
            ..StoreConfig::new("http://127.0.0.1:9", "anon-key")
        })
        .unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(err.is_connection_exhausted());
    }

    #[test]
    fn content_range_parsing() {
        assert_eq!(parse_content_range_total("0-0/42"), Some(42));
        assert_eq!(parse_content_range_total("*/0"), Some(0));
        assert_eq!(parse_content_range_total("0-0/*"), None);
    }

    #[test]
    fn config_rejects_non_http_urls() {
        let err = StoreConfig::new("ftp://store", "key").validate().unwrap_err();
        assert!(matches!(err, StoreError::Configuration(_)));
        assert!(StoreConfig::new("https://store.example", "key").validate().is_ok());
    }
}
