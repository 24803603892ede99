//! In-memory document store for tests and dry runs.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Document, DocumentStore, SearchQuery};
use crate::error::{PersistenceError, PersistenceResult};

#[derive(Debug, Default)]
struct MemoryInner {
    namespaces: BTreeMap<String, Vec<(String, Document)>>,
    unavailable: bool,
    create_delay: Option<Duration>,
}

/// Documents held in process memory, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the store were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.write().unavailable = unavailable;
    }

    /// Delay each `create` by `delay`.
    pub fn set_create_delay(&self, delay: Option<Duration>) {
        self.inner.write().create_delay = delay;
    }

    /// Seed a document directly, bypassing `create`.
    pub fn insert(&self, namespace: &str, id: &str, document: Document) {
        self.inner
            .write()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .push((id.to_string(), document));
    }

    /// Documents of `namespace` in insertion order.
    pub fn documents(&self, namespace: &str) -> Vec<Document> {
        self.inner
            .read()
            .namespaces
            .get(namespace)
            .map(|docs| docs.iter().map(|(_, doc)| doc.clone()).collect())
            .unwrap_or_default()
    }

    pub fn ids(&self, namespace: &str) -> Vec<String> {
        self.inner
            .read()
            .namespaces
            .get(namespace)
            .map(|docs| docs.iter().map(|(id, _)| id.clone()).collect())
            .unwrap_or_default()
    }

    /// Total number of documents across namespaces.
    pub fn count(&self) -> usize {
        self.inner.read().namespaces.values().map(Vec::len).sum()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.inner.read().namespaces.keys().cloned().collect()
    }

    fn check_available(&self) -> PersistenceResult<()> {
        if self.inner.read().unavailable {
            return Err(PersistenceError::unreachable("memory://", "store marked unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn ensure_namespace(&self, namespace: &str) -> PersistenceResult<()> {
        self.check_available()?;
        self.inner
            .write()
            .namespaces
            .entry(namespace.to_string())
            .or_default();
        Ok(())
    }

    async fn create(&self, namespace: &str, id: &str, document: &Document) -> PersistenceResult<()> {
        self.check_available()?;
        let delay = self.inner.read().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = self.inner.write();
        let docs = inner.namespaces.entry(namespace.to_string()).or_default();
        if docs.iter().any(|(existing, _)| existing == id) {
            return Err(PersistenceError::rejected("create", 409, format!("document '{}' exists", id)));
        }
        docs.push((id.to_string(), document.clone()));
        Ok(())
    }

    async fn search_latest(&self, query: &SearchQuery) -> PersistenceResult<Option<Document>> {
        self.check_available()?;
        let inner = self.inner.read();
        Ok(inner
            .namespaces
            .iter()
            .filter(|(namespace, _)| query.matches_namespace(namespace))
            .flat_map(|(_, docs)| docs.iter().map(|(_, doc)| doc))
            .filter(|doc| query.accepts(doc))
            .max_by_key(|doc| doc.timestamp)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_latest_by_timestamp_and_identity() {
        let store = MemoryStore::new();
        let older = Document::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
            .with_field("identity", json!("a0"));
        let newer = Document::new(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap())
            .with_field("identity", json!("a0"));
        let other = Document::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap())
            .with_field("identity", json!("a1"));

        store.create("ns-2024.02", "2", &newer).await.unwrap();
        store.create("ns-2024.01", "1", &older).await.unwrap();
        store.create("ns-2024.03", "3", &other).await.unwrap();

        let query = SearchQuery::new("ns*").with_identity(Some("a0".into()));
        assert_eq!(store.search_latest(&query).await.unwrap(), Some(newer));
        assert_eq!(store.search_latest(&SearchQuery::new("ns*")).await.unwrap(), Some(other));
        assert_eq!(store.search_latest(&SearchQuery::new("missing")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let store = MemoryStore::new();
        let doc = Document::new(Utc::now());
        store.create("ns", "id", &doc).await.unwrap();
        let err = store.create("ns", "id", &doc).await.unwrap_err();
        assert!(matches!(err, PersistenceError::Rejected { status: 409, .. }));
        assert_eq!(store.count(), 1);
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(store.ensure_namespace("ns").await.is_err());
        store.set_unavailable(false);
        store.ensure_namespace("ns").await.unwrap();
        store.ensure_namespace("ns").await.unwrap();
        assert_eq!(store.namespaces(), vec!["ns"]);
    }
}
