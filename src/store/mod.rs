// ============================================================================
// DOCUMENT STORE
// ============================================================================
// Append-only snapshot storage. The persistence gateway only needs three
// operations: make sure a namespace exists, append a document under a fresh
// id, and fetch the most recent document matching a namespace glob.
// Backends are chosen by configuration.
// ============================================================================

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::{PersistenceError, PersistenceResult};
use crate::{IDENTITY_FIELD, TIMESTAMP_FIELD};

pub mod elastic;
pub mod file;
pub mod memory;

pub use elastic::ElasticStore;
pub use file::FileStore;
pub use memory::MemoryStore;

// ----------------------------------------------------------------------------
// Document
// ----------------------------------------------------------------------------

/// An immutable, timestamped snapshot of a group's slot values.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub timestamp: DateTime<Utc>,
    pub fields: BTreeMap<String, JsonValue>,
}

impl Document {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: JsonValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// The partition identity embedded in the document, if any.
    pub fn identity(&self) -> Option<&str> {
        self.fields.get(IDENTITY_FIELD).and_then(JsonValue::as_str)
    }

    /// Flat JSON object: the timestamp plus every field.
    pub fn to_json(&self) -> JsonValue {
        let mut object = Map::new();
        for (name, value) in &self.fields {
            object.insert(name.clone(), value.clone());
        }
        object.insert(
            TIMESTAMP_FIELD.to_string(),
            JsonValue::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        JsonValue::Object(object)
    }

    pub fn from_json(value: &JsonValue) -> PersistenceResult<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| PersistenceError::malformed("document is not a JSON object"))?;
        let raw_timestamp = object
            .get(TIMESTAMP_FIELD)
            .ok_or_else(|| PersistenceError::malformed("document has no timestamp"))?;
        let timestamp = parse_timestamp(raw_timestamp)?;

        let fields = object
            .iter()
            .filter(|(name, _)| name.as_str() != TIMESTAMP_FIELD)
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        Ok(Self { timestamp, fields })
    }
}

/// ISO-8601 with or without an offset (offset-less is UTC), or epoch seconds.
pub fn parse_timestamp(value: &JsonValue) -> PersistenceResult<DateTime<Utc>> {
    match value {
        JsonValue::String(text) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                return Ok(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
                .map(|naive| naive.and_utc())
                .ok_or_else(|| PersistenceError::malformed(format!("unparseable timestamp '{}'", text)))
        }
        JsonValue::Number(n) => {
            let seconds = n
                .as_f64()
                .ok_or_else(|| PersistenceError::malformed("timestamp out of range"))?;
            let nanos = (seconds.fract() * 1e9).round() as u32;
            Utc.timestamp_opt(seconds.trunc() as i64, nanos)
                .single()
                .ok_or_else(|| PersistenceError::malformed(format!("timestamp {} out of range", seconds)))
        }
        other => Err(PersistenceError::malformed(format!("timestamp has type {}", json_type(other)))),
    }
}

fn json_type(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

// ----------------------------------------------------------------------------
// Store Interface
// ----------------------------------------------------------------------------

/// "Latest document" query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    /// Namespace or glob (`*` suffix) covering time-partitioned namespaces
    pub namespace_glob: String,
    /// Only documents whose identity field equals this value
    pub identity: Option<String>,
}

impl SearchQuery {
    pub fn new(namespace_glob: impl Into<String>) -> Self {
        Self {
            namespace_glob: namespace_glob.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    /// Whether `document` passes the identity filter.
    pub fn accepts(&self, document: &Document) -> bool {
        match &self.identity {
            Some(identity) => document.identity() == Some(identity.as_str()),
            None => true,
        }
    }

    /// Whether `namespace` is covered by the glob.
    pub fn matches_namespace(&self, namespace: &str) -> bool {
        glob::Pattern::new(&self.namespace_glob)
            .map(|pattern| pattern.matches(namespace))
            .unwrap_or_else(|_| self.namespace_glob == namespace)
    }
}

/// Append-only document storage.
#[async_trait]
pub trait DocumentStore: Send + Sync + fmt::Debug {
    /// Backend name for logs
    fn backend(&self) -> &'static str;

    /// Create `namespace` if missing; "already exists" is success.
    async fn ensure_namespace(&self, namespace: &str) -> PersistenceResult<()>;

    /// Append `document` under `id`.
    async fn create(&self, namespace: &str, id: &str, document: &Document) -> PersistenceResult<()>;

    /// The newest matching document by timestamp.
    async fn search_latest(&self, query: &SearchQuery) -> PersistenceResult<Option<Document>>;
}

/// Construct the backend selected by `config`.
pub fn from_config(config: &DatabaseConfig) -> PersistenceResult<Arc<dyn DocumentStore>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let store: Arc<dyn DocumentStore> = match config.backend {
        DatabaseBackend::Elastic => Arc::new(ElasticStore::new(&config.url, timeout)?),
        DatabaseBackend::File => Arc::new(FileStore::new(&config.url)),
        DatabaseBackend::Memory => Arc::new(MemoryStore::new()),
    };
    Ok(store)
}
