//! Append-only JSON-lines store: one `<namespace>.jsonl` file per namespace.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use super::{Document, DocumentStore, SearchQuery};
use crate::error::{PersistenceError, PersistenceResult};

const EXTENSION: &str = "jsonl";

/// Documents appended as `{"_id": ..., "_source": {...}}` lines.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// `location` is a directory path, optionally as a `file://` URL.
    pub fn new(location: &str) -> Self {
        let root = location.strip_prefix("file://").unwrap_or(location);
        Self {
            root: PathBuf::from(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, namespace: &str) -> PathBuf {
        self.root.join(format!("{}.{}", namespace, EXTENSION))
    }

    async fn latest_in(&self, path: &Path, query: &SearchQuery) -> PersistenceResult<Option<Document>> {
        let file = fs::File::open(path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut latest: Option<Document> = None;

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let parsed = serde_json::from_str::<JsonValue>(&line)
                .map_err(|e| PersistenceError::malformed(e.to_string()))
                .and_then(|entry| Document::from_json(&entry["_source"]));
            match parsed {
                Ok(doc) if query.accepts(&doc) => {
                    if latest.as_ref().map_or(true, |l| doc.timestamp >= l.timestamp) {
                        latest = Some(doc);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(
                    target: "archstats::store",
                    path = %path.display(),
                    error = %e,
                    "Skipping malformed line"
                ),
            }
        }
        Ok(latest)
    }
}

#[async_trait]
impl DocumentStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn ensure_namespace(&self, namespace: &str) -> PersistenceResult<()> {
        fs::create_dir_all(&self.root).await?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(namespace))
            .await?;
        Ok(())
    }

    async fn create(&self, namespace: &str, id: &str, document: &Document) -> PersistenceResult<()> {
        let entry = json!({"_id": id, "_source": document.to_json()});
        let mut line = serde_json::to_string(&entry).map_err(|e| PersistenceError::malformed(e.to_string()))?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(namespace))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn search_latest(&self, query: &SearchQuery) -> PersistenceResult<Option<Document>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut latest: Option<Document> = None;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !query.matches_namespace(stem) {
                continue;
            }
            if let Some(doc) = self.latest_in(&path, query).await? {
                if latest.as_ref().map_or(true, |l| doc.timestamp > l.timestamp) {
                    latest = Some(doc);
                }
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_append_and_search() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_str().unwrap());
        store.ensure_namespace("metrics_a0").await.unwrap();
        store.ensure_namespace("metrics_a0").await.unwrap();

        let first = Document::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).with_field("n", json!(1));
        let second = Document::new(Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap()).with_field("n", json!(2));
        store.create("metrics_a0", "id-1", &first).await.unwrap();
        store.create("metrics_a0", "id-2", &second).await.unwrap();

        let found = store.search_latest(&SearchQuery::new("metrics_a0*")).await.unwrap();
        assert_eq!(found, Some(second));

        let contents = std::fs::read_to_string(dir.path().join("metrics_a0.jsonl")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(&format!("file://{}", dir.path().display()));
        let doc = Document::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        store.create("ns", "a", &doc).await.unwrap();
        std::fs::write(
            dir.path().join("ns.jsonl"),
            format!(
                "{}\nnot json\n{{\"_id\": \"b\", \"_source\": {{\"n\": 1}}}}\n",
                std::fs::read_to_string(dir.path().join("ns.jsonl")).unwrap().trim_end()
            ),
        )
        .unwrap();

        assert_eq!(store.search_latest(&SearchQuery::new("ns")).await.unwrap(), Some(doc));
    }

    #[tokio::test]
    async fn test_missing_root_means_no_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("absent").to_str().unwrap());
        assert_eq!(store.search_latest(&SearchQuery::new("ns")).await.unwrap(), None);
    }
}
