// ============================================================================
// SOURCES & REQUEST CACHE
// ============================================================================
// A `Source` is one configured appliance endpoint. `RequestCache` fetches it
// through an `HttpTransport` and remembers the last result for `cache_ttl`,
// so several readers inside one pass cause a single network call.
// ============================================================================

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client as HttpClient;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::{ArchstatsError, ArchstatsResult, FetchError, FetchResult};
use crate::transform::{MetricRecord, Transform};

// ----------------------------------------------------------------------------
// Transport Seam
// ----------------------------------------------------------------------------

/// Status and body of one GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Outbound HTTP. The process owns one instance and shares it by `Arc`.
#[async_trait]
pub trait HttpTransport: Send + Sync + fmt::Debug {
    async fn get(&self, url: &str, params: &[(String, String)]) -> FetchResult<HttpResponse>;
}

/// Production transport backed by a pooled reqwest client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: HttpClient,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> ArchstatsResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(4)
            .gzip(true)
            .build()
            .map_err(|e| ArchstatsError::Internal(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> FetchResult<HttpResponse> {
        let response = self.client.get(url).query(params).send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout {
                    url: url.to_string(),
                    timeout_ms: self.timeout.as_millis() as u64,
                }
            } else {
                FetchError::transport(url, e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| FetchError::transport(url, format!("Failed to read body: {}", e)))?;
        Ok(HttpResponse { status, body })
    }
}

// ----------------------------------------------------------------------------
// Fixture Transport
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum FixtureReply {
    Respond(HttpResponse),
    Fail(String),
}

/// Canned responses keyed by URL (query string included). Used by tests and
/// dry runs; unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct FixtureTransport {
    replies: Mutex<HashMap<String, FixtureReply>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FixtureTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `url` with 200 and `body`.
    pub fn set_json(&self, url: &str, body: impl Into<String>) {
        self.set_status(url, 200, body);
    }

    pub fn set_status(&self, url: &str, status: u16, body: impl Into<String>) {
        self.replies.lock().insert(
            url.to_string(),
            FixtureReply::Respond(HttpResponse {
                status,
                body: body.into(),
            }),
        );
    }

    /// Make `url` fail at the transport level.
    pub fn set_failure(&self, url: &str, message: impl Into<String>) {
        self.replies
            .lock()
            .insert(url.to_string(), FixtureReply::Fail(message.into()));
    }

    /// Number of requests made for `url`.
    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl HttpTransport for FixtureTransport {
    async fn get(&self, url: &str, params: &[(String, String)]) -> FetchResult<HttpResponse> {
        let full = full_url(url, params);
        *self.calls.lock().entry(full.clone()).or_insert(0) += 1;

        let reply = self.replies.lock().get(&full).cloned();
        match reply {
            Some(FixtureReply::Respond(response)) => Ok(response),
            Some(FixtureReply::Fail(message)) => Err(FetchError::transport(full, message)),
            None => Ok(HttpResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

/// `url` with its query parameters appended.
pub fn full_url(url: &str, params: &[(String, String)]) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}?{}", url, query.join("&"))
}

// ----------------------------------------------------------------------------
// Source
// ----------------------------------------------------------------------------

/// The cached outcome of one successful fetch.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub at: Instant,
    pub raw_text: Arc<str>,
    pub records: Arc<Vec<MetricRecord>>,
}

/// One configured appliance endpoint.
#[derive(Debug, Clone)]
pub struct Source {
    pub url: String,
    pub params: Vec<(String, String)>,
    pub transform: Transform,
    pub cache_ttl: Duration,
    last_fetch: Option<FetchRecord>,
}

impl Source {
    pub fn new(url: impl Into<String>, transform: Transform, cache_ttl: Duration) -> Self {
        Self {
            url: url.into(),
            params: Vec::new(),
            transform,
            cache_ttl,
            last_fetch: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// URL including the query string, for logs.
    pub fn display_url(&self) -> String {
        full_url(&self.url, &self.params)
    }

    pub fn last_fetch(&self) -> Option<&FetchRecord> {
        self.last_fetch.as_ref()
    }

    fn fresh_fetch(&self, now: Instant) -> Option<&FetchRecord> {
        self.last_fetch
            .as_ref()
            .filter(|record| now.saturating_duration_since(record.at) < self.cache_ttl)
    }
}

// ----------------------------------------------------------------------------
// Request Cache
// ----------------------------------------------------------------------------

/// TTL-deduplicated fetches over a shared transport.
///
/// Deduplication covers sequential access only; two tasks fetching the same
/// stale source at once both hit the network.
#[derive(Debug, Clone)]
pub struct RequestCache {
    transport: Arc<dyn HttpTransport>,
}

impl RequestCache {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    /// Raw text and parsed records of `source`, from cache when fresh.
    pub async fn fetch(&self, source: &mut Source) -> FetchResult<FetchRecord> {
        let now = Instant::now();
        if let Some(cached) = source.fresh_fetch(now) {
            trace!(target: "archstats::source", url = %source.url, "Serving cached response");
            return Ok(cached.clone());
        }

        let display_url = source.display_url();
        let response = self.transport.get(&source.url, &source.params).await?;
        if response.status != 200 {
            return Err(FetchError::status(display_url, response.status));
        }

        let records = source.transform.apply(&display_url, &response.body)?;
        debug!(
            target: "archstats::source",
            url = %display_url,
            transform = source.transform.as_str(),
            records = records.len(),
            "Fetched source"
        );

        let record = FetchRecord {
            at: Instant::now(),
            raw_text: Arc::from(response.body),
            records: Arc::new(records),
        };
        source.last_fetch = Some(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "http://appliance/mgmt/bpl/getApplianceMetricsForAppliance";
    const BODY: &str = r#"[{"name": "Total PV count", "value": "10", "source": "mgmt"}]"#;

    fn cache_with(transport: &Arc<FixtureTransport>) -> RequestCache {
        RequestCache::new(transport.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_is_cached_within_ttl() {
        let transport = Arc::new(FixtureTransport::new());
        transport.set_json(URL, BODY);
        let cache = cache_with(&transport);
        let mut source = Source::new(URL, Transform::DetailedMetrics, Duration::from_secs(1));

        let first = cache.fetch(&mut source).await.unwrap();
        let second = cache.fetch(&mut source).await.unwrap();
        assert_eq!(transport.calls(URL), 1);
        assert_eq!(first.records, second.records);
        assert_eq!(&*first.raw_text, BODY);

        tokio::time::advance(Duration::from_millis(1001)).await;
        cache.fetch(&mut source).await.unwrap();
        assert_eq!(transport.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_zero_ttl_always_fetches() {
        let transport = Arc::new(FixtureTransport::new());
        transport.set_json(URL, BODY);
        let cache = cache_with(&transport);
        let mut source = Source::new(URL, Transform::DetailedMetrics, Duration::ZERO);

        cache.fetch(&mut source).await.unwrap();
        cache.fetch(&mut source).await.unwrap();
        assert_eq!(transport.calls(URL), 2);
    }

    #[tokio::test]
    async fn test_non_200_is_a_fetch_error() {
        let transport = Arc::new(FixtureTransport::new());
        transport.set_status(URL, 500, "boom");
        let cache = cache_with(&transport);
        let mut source = Source::new(URL, Transform::DetailedMetrics, Duration::ZERO);

        let err = cache.fetch(&mut source).await.unwrap_err();
        assert_eq!(err, FetchError::status(URL, 500));
        assert!(source.last_fetch().is_none());
    }

    #[tokio::test]
    async fn test_query_parameters_are_part_of_the_key() {
        let transport = Arc::new(FixtureTransport::new());
        let keyed = format!("{}?appliance=appliance0", URL);
        transport.set_json(&keyed, BODY);
        let cache = cache_with(&transport);
        let mut source =
            Source::new(URL, Transform::DetailedMetrics, Duration::ZERO).with_param("appliance", "appliance0");

        let fetched = cache.fetch(&mut source).await.unwrap();
        assert_eq!(fetched.records.len(), 1);
        assert_eq!(transport.calls(&keyed), 1);
        assert_eq!(source.display_url(), keyed);
    }

    #[tokio::test]
    async fn test_transport_failure_and_malformed_payload() {
        let transport = Arc::new(FixtureTransport::new());
        transport.set_failure(URL, "connection refused");
        let cache = cache_with(&transport);
        let mut source = Source::new(URL, Transform::DetailedMetrics, Duration::ZERO);
        assert!(matches!(
            cache.fetch(&mut source).await,
            Err(FetchError::Transport { .. })
        ));

        transport.set_json(URL, "not json");
        assert!(matches!(
            cache.fetch(&mut source).await,
            Err(FetchError::Payload { .. })
        ));
    }

    #[tokio::test]
    async fn test_reqwest_transport_passes_params() {
        let server = httpmock::MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(httpmock::Method::GET)
                    .path("/detail")
                    .query_param("appliance", "a0");
                then.status(200).body(BODY);
            })
            .await;
        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();

        let params = vec![("appliance".to_string(), "a0".to_string())];
        let response = transport.get(&server.url("/detail"), &params).await.unwrap();
        mock.assert_async().await;
        assert_eq!(response, HttpResponse { status: 200, body: BODY.to_string() });
    }

    #[tokio::test]
    async fn test_reqwest_transport_applies_timeout() {
        let server = httpmock::MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/slow");
                then.status(200).delay(Duration::from_secs(2)).body("[]");
            })
            .await;
        let transport = ReqwestTransport::new(Duration::from_millis(100)).unwrap();

        let result = transport.get(&server.url("/slow"), &[]).await;
        assert_eq!(
            result,
            Err(FetchError::Timeout {
                url: server.url("/slow"),
                timeout_ms: 100,
            })
        );
    }
}
