// ============================================================================
// PERSISTENCE GATEWAY
// ============================================================================
// Restore-on-create and store-on-change for one group. Restore never fails:
// any problem is logged and the group starts from its fetched values. Stores
// for the same group are serialized through an async mutex, which `close`
// also takes to drain an in-flight store on shutdown.
// ============================================================================

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{PersistenceError, PersistenceResult};
use crate::group::Group;
use crate::store::{Document, DocumentStore, SearchQuery};
use crate::value::TypedValue;
use crate::{DEFAULT_NON_FINITE_SENTINEL, DEFAULT_STORE_TIMEOUT_SECS, IDENTITY_FIELD, TIMESTAMP_FIELD};

/// What a restore did to the group.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoreReport {
    pub document: Document,
    /// Slots written from the document
    pub restored: usize,
    /// Stored fields with no matching slot, or whose value no longer fits it
    pub dropped_fields: Vec<String>,
}

#[derive(Debug, Default)]
struct StoreState {
    ensured_namespace: Option<String>,
    stored: u64,
}

/// Restore/store protocol for one group against a document store.
#[derive(Debug)]
pub struct PersistenceGateway {
    store: Arc<dyn DocumentStore>,
    group: String,
    namespace: String,
    namespace_suffix: Option<String>,
    identity: Option<String>,
    sentinel: f64,
    timeout: Duration,
    restore_on_startup: bool,
    state: TokioMutex<StoreState>,
    closed: AtomicBool,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn DocumentStore>, group: &Group) -> Self {
        Self {
            store,
            group: group.name().to_string(),
            namespace: group.namespace().to_string(),
            namespace_suffix: None,
            identity: group.identity().map(str::to_string),
            sentinel: DEFAULT_NON_FINITE_SENTINEL,
            timeout: Duration::from_secs(DEFAULT_STORE_TIMEOUT_SECS),
            restore_on_startup: true,
            state: TokioMutex::new(StoreState::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Apply the `[database]` settings.
    pub fn configured(mut self, config: &DatabaseConfig) -> Self {
        self.namespace_suffix = config.namespace_suffix.clone().filter(|s| !s.is_empty());
        self.sentinel = config.non_finite_sentinel;
        self.timeout = Duration::from_secs(config.timeout_secs);
        self.restore_on_startup = config.restore_on_startup;
        self
    }

    pub fn with_namespace_suffix(mut self, pattern: Option<String>) -> Self {
        self.namespace_suffix = pattern;
        self
    }

    pub fn with_sentinel(mut self, sentinel: f64) -> Self {
        self.sentinel = sentinel;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_restore(mut self, enabled: bool) -> Self {
        self.restore_on_startup = enabled;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Namespace a document stamped `at` is written to.
    pub fn namespace_for(&self, at: DateTime<Utc>) -> String {
        match &self.namespace_suffix {
            Some(pattern) => format!("{}{}", self.namespace, at.format(pattern)),
            None => self.namespace.clone(),
        }
    }

    /// Glob covering every namespace this gateway may have written.
    pub fn search_glob(&self) -> String {
        match &self.namespace_suffix {
            Some(_) => format!("{}*", self.namespace),
            None => self.namespace.clone(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of documents this gateway has written.
    pub async fn stored(&self) -> u64 {
        self.state.lock().await.stored
    }

    async fn bounded<T, F>(&self, operation: &str, fut: F) -> PersistenceResult<T>
    where
        F: Future<Output = PersistenceResult<T>>,
    {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| PersistenceError::timeout(operation, self.timeout.as_millis() as u64))?
    }

    // ------------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------------

    /// Load the newest document and write its values into the group's slots.
    ///
    /// Returns `None` when restore is disabled, nothing was found, or the
    /// store could not be queried. Restored writes carry the document's
    /// timestamp and do not count as changes.
    pub async fn restore(&self, group: &mut Group) -> Option<RestoreReport> {
        if !self.restore_on_startup {
            info!(target: "archstats::persistence", group = %self.group, "Restore disabled");
            return None;
        }

        let query = SearchQuery::new(self.search_glob()).with_identity(self.identity.clone());
        let document = match self.bounded("search", self.store.search_latest(&query)).await {
            Ok(Some(document)) => document,
            Ok(None) => {
                warn!(
                    target: "archstats::persistence",
                    group = %self.group,
                    namespace = %query.namespace_glob,
                    "No document found to restore from"
                );
                return None;
            }
            Err(e) => {
                error!(
                    target: "archstats::persistence",
                    group = %self.group,
                    backend = self.store.backend(),
                    error = %e,
                    "Failed to get the latest document"
                );
                return None;
            }
        };

        let mut restored = 0;
        let mut dropped_fields = Vec::new();
        for (field, stored) in &document.fields {
            if field == TIMESTAMP_FIELD || field == IDENTITY_FIELD {
                continue;
            }
            let Some(slot) = group.slot(field) else {
                warn!(
                    target: "archstats::persistence",
                    group = %self.group,
                    attr = %field,
                    value = %stored,
                    "Attribute no longer valid"
                );
                dropped_fields.push(field.clone());
                continue;
            };

            let written = TypedValue::from_json(stored, slot.kind)
                .ok_or_else(|| format!("cannot hold {} as {}", stored, slot.kind))
                .and_then(|value| {
                    group
                        .host()
                        .write(slot.handle, value, document.timestamp)
                        .map_err(|e| e.to_string())
                });
            match written {
                Ok(()) => {
                    debug!(target: "archstats::persistence", attr = %field, value = %stored, "Restored");
                    restored += 1;
                }
                Err(reason) => {
                    warn!(
                        target: "archstats::persistence",
                        group = %self.group,
                        attr = %field,
                        reason = %reason,
                        "Failed to restore"
                    );
                    dropped_fields.push(field.clone());
                }
            }
        }

        info!(
            target: "archstats::persistence",
            group = %self.group,
            restored,
            dropped = dropped_fields.len(),
            timestamp = %document.timestamp,
            "Restored group from document"
        );
        group.mark_restored(document.clone());
        Some(RestoreReport {
            document,
            restored,
            dropped_fields,
        })
    }

    // ------------------------------------------------------------------------
    // Store
    // ------------------------------------------------------------------------

    /// Current slot values as a document; non-finite numbers become the sentinel.
    pub fn snapshot(&self, group: &Group) -> PersistenceResult<Document> {
        let mut latest: Option<DateTime<Utc>> = None;
        let mut document = Document::new(Utc::now());

        for slot in group.slots() {
            let Ok((value, timestamp)) = group.host().read(slot.handle) else {
                continue;
            };
            latest = Some(latest.map_or(timestamp, |l| l.max(timestamp)));
            document.fields.insert(slot.attr.clone(), value.to_json(self.sentinel));
        }

        document.timestamp = latest.ok_or_else(|| PersistenceError::EmptyDocument {
            group: self.group.clone(),
        })?;
        if let Some(identity) = &self.identity {
            document.fields.insert(IDENTITY_FIELD.to_string(), identity.clone().into());
        }
        Ok(document)
    }

    /// Append a snapshot of `group` under a fresh id. Returns the id.
    pub async fn store(&self, group: &Group) -> PersistenceResult<String> {
        if self.is_closed() {
            return Err(PersistenceError::Closed {
                group: self.group.clone(),
            });
        }

        let mut state = self.state.lock().await;
        // close() may have run while this call waited for the lock
        if self.is_closed() {
            return Err(PersistenceError::Closed {
                group: self.group.clone(),
            });
        }

        let document = self.snapshot(group)?;
        let namespace = self.namespace_for(document.timestamp);
        if state.ensured_namespace.as_deref() != Some(namespace.as_str()) {
            self.bounded("ensure_namespace", self.store.ensure_namespace(&namespace))
                .await?;
            state.ensured_namespace = Some(namespace.clone());
        }

        let id = Uuid::new_v4().to_string();
        self.bounded("create", self.store.create(&namespace, &id, &document))
            .await?;
        state.stored += 1;

        debug!(
            target: "archstats::persistence",
            group = %self.group,
            namespace = %namespace,
            id = %id,
            fields = document.fields.len(),
            "Stored document"
        );
        Ok(id)
    }

    /// Refuse new stores and wait up to `grace` for one in flight.
    ///
    /// Returns false if the in-flight store did not finish in time.
    pub async fn close(&self, grace: Duration) -> bool {
        self.closed.store(true, Ordering::Release);
        match tokio::time::timeout(grace, self.state.lock()).await {
            Ok(_) => {
                debug!(target: "archstats::persistence", group = %self.group, "Gateway closed");
                true
            }
            Err(_) => {
                warn!(
                    target: "archstats::persistence",
                    group = %self.group,
                    grace_ms = grace.as_millis() as u64,
                    "In-flight store did not finish before shutdown"
                );
                false
            }
        }
    }
}
