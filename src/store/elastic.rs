//! Elasticsearch-compatible REST backend.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, StatusCode};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

use super::{Document, DocumentStore, SearchQuery};
use crate::error::{PersistenceError, PersistenceResult};
use crate::{IDENTITY_FIELD, TIMESTAMP_FIELD};

/// Talks to `<url>/<index>` endpoints with a pooled client.
#[derive(Debug, Clone)]
pub struct ElasticStore {
    client: HttpClient,
    base_url: String,
    timeout: Duration,
}

impl ElasticStore {
    pub fn new(url: &str, timeout: Duration) -> PersistenceResult<Self> {
        let client = HttpClient::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .build()
            .map_err(|e| PersistenceError::unreachable(url, format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn map_send_error(&self, operation: &str, e: reqwest::Error) -> PersistenceError {
        if e.is_timeout() {
            PersistenceError::timeout(operation, self.timeout.as_millis() as u64)
        } else {
            PersistenceError::unreachable(&self.base_url, e.to_string())
        }
    }

    /// Index settings sent on creation: exact-match identity, sortable timestamp.
    pub fn index_mappings() -> JsonValue {
        json!({
            "mappings": {
                "properties": {
                    IDENTITY_FIELD: {"type": "keyword"},
                    TIMESTAMP_FIELD: {"type": "date"},
                }
            }
        })
    }

    /// Request body for the newest document, optionally filtered by identity.
    ///
    /// The `.keyword` subfield covers indices created with dynamic mappings.
    pub fn search_body(query: &SearchQuery) -> JsonValue {
        let keyword_field = format!("{}.keyword", IDENTITY_FIELD);
        let filter = match &query.identity {
            Some(identity) => json!({
                "bool": {
                    "should": [
                        {"term": {IDENTITY_FIELD: identity}},
                        {"term": {keyword_field: identity}},
                    ],
                    "minimum_should_match": 1,
                }
            }),
            None => json!({"match_all": {}}),
        };
        json!({
            "size": 1,
            "sort": [{TIMESTAMP_FIELD: {"order": "desc"}}],
            "query": filter,
        })
    }
}

#[async_trait]
impl DocumentStore for ElasticStore {
    fn backend(&self) -> &'static str {
        "elastic"
    }

    async fn ensure_namespace(&self, namespace: &str) -> PersistenceResult<()> {
        let response = self
            .client
            .put(self.endpoint(namespace))
            .json(&Self::index_mappings())
            .send()
            .await
            .map_err(|e| self.map_send_error("ensure_namespace", e))?;

        match response.status() {
            status if status.is_success() => Ok(()),
            // index already exists
            StatusCode::BAD_REQUEST => {
                debug!(target: "archstats::store", namespace = %namespace, "Index already present");
                Ok(())
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(PersistenceError::rejected("ensure_namespace", status.as_u16(), body))
            }
        }
    }

    async fn create(&self, namespace: &str, id: &str, document: &Document) -> PersistenceResult<()> {
        let response = self
            .client
            .put(self.endpoint(&format!("{}/_create/{}", namespace, id)))
            .json(&document.to_json())
            .send()
            .await
            .map_err(|e| self.map_send_error("create", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(PersistenceError::rejected("create", status.as_u16(), body))
    }

    async fn search_latest(&self, query: &SearchQuery) -> PersistenceResult<Option<Document>> {
        let response = self
            .client
            .post(self.endpoint(&format!("{}/_search", query.namespace_glob)))
            .query(&[("ignore_unavailable", "true"), ("allow_no_indices", "true")])
            .json(&Self::search_body(query))
            .send()
            .await
            .map_err(|e| self.map_send_error("search", e))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PersistenceError::rejected("search", status.as_u16(), body));
        }

        let body: JsonValue = response
            .json()
            .await
            .map_err(|e| PersistenceError::malformed(format!("search response: {}", e)))?;
        latest_hit(&body)
    }
}

/// `_source` of the first hit, if the response has one.
fn latest_hit(body: &JsonValue) -> PersistenceResult<Option<Document>> {
    match body.pointer("/hits/hits/0/_source") {
        Some(source) => Document::from_json(source).map(Some),
        None => Ok(None),
    }
}
