// ============================================================================
// GROUPS & SCHEMA SYNTHESIS
// ============================================================================
// A `Group` is a frozen set of slots built from the first fetch of its
// sources. After `GroupBuilder::build` returns, slots are never added or
// removed and their record kinds never change; reconciliation only updates
// values.
// ============================================================================

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::channel::{ChannelHost, SlotHandle, SlotOptions};
use crate::error::{ChannelError, FetchResult};
use crate::identifier::{fallback_attribute_name, to_attribute_name};
use crate::source::{FetchRecord, RequestCache, Source};
use crate::store::Document;
use crate::transform::MetricRecord;
use crate::value::{Coercer, RecordKind, TypedValue};
use crate::{IDENTITY_FIELD, TIMESTAMP_FIELD};

/// Document fields that metric attributes may not shadow
const RESERVED_ATTRIBUTES: &[&str] = &[TIMESTAMP_FIELD, IDENTITY_FIELD];

// ----------------------------------------------------------------------------
// Slot & State
// ----------------------------------------------------------------------------

/// One typed observation owned by a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Full channel name, group prefix included
    pub channel: String,
    /// Bare identifier used as the document field name
    pub attr: String,
    pub handle: SlotHandle,
    pub kind: RecordKind,
    pub options: SlotOptions,
}

/// Whether the group has a persisted baseline yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistState {
    /// No restored document and nothing stored so far
    AwaitingFirstPersist,
    Active,
}

/// A raw key whose slot was taken over by a later key with the same identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub attr: String,
    pub shadowed_key: String,
    pub key: String,
}

/// Result of applying one incoming record to the group.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotUpdate {
    Unchanged,
    Changed,
    /// Key not part of the frozen schema
    Unknown,
    /// Key whose channel is owned by another group
    Foreign,
    Failed(ChannelError),
}

// ----------------------------------------------------------------------------
// Group
// ----------------------------------------------------------------------------

/// A named, addressable bundle of slots plus the sources feeding them.
#[derive(Debug)]
pub struct Group {
    name: String,
    prefix: String,
    namespace: String,
    identity: Option<String>,
    slots: BTreeMap<String, Slot>,
    sources: Vec<Source>,
    key_to_attr: HashMap<String, String>,
    persist_state: PersistState,
    init_document: Option<Document>,
    collisions: Vec<Collision>,
    foreign_channels: Vec<String>,
    fetched_sources: usize,
    coercer: Arc<Coercer>,
    host: Arc<dyn ChannelHost>,
}

impl Group {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn persist_state(&self) -> PersistState {
        self.persist_state
    }

    /// The document restored at startup, if any.
    pub fn init_document(&self) -> Option<&Document> {
        self.init_document.as_ref()
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    /// Channels left out because another group registered them first.
    pub fn foreign_channels(&self) -> &[String] {
        &self.foreign_channels
    }

    /// Sources that answered during the build.
    pub fn fetched_sources(&self) -> usize {
        self.fetched_sources
    }

    /// Slots keyed by attribute name.
    pub fn slots(&self) -> impl Iterator<Item = &Slot> {
        self.slots.values()
    }

    pub fn slot(&self, attr: &str) -> Option<&Slot> {
        self.slots.get(attr)
    }

    /// The slot fed by raw appliance key `key` (scope included).
    pub fn slot_for_key(&self, key: &str) -> Option<&Slot> {
        self.key_to_attr.get(key).and_then(|attr| self.slots.get(attr))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn host(&self) -> &Arc<dyn ChannelHost> {
        &self.host
    }

    /// Current value and timestamp of the slot called `attr`.
    pub fn read(&self, attr: &str) -> Option<(TypedValue, DateTime<Utc>)> {
        let slot = self.slots.get(attr)?;
        self.host.read(slot.handle).ok()
    }

    pub(crate) fn mark_restored(&mut self, document: Document) {
        self.init_document = Some(document);
        self.persist_state = PersistState::Active;
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.persist_state = PersistState::Active;
    }

    /// Fetch every source through `cache`; failures are returned, not raised.
    pub async fn fetch_all(&mut self, cache: &RequestCache) -> Vec<(String, FetchResult<FetchRecord>)> {
        let mut results = Vec::with_capacity(self.sources.len());
        for source in &mut self.sources {
            let url = source.display_url();
            results.push((url, cache.fetch(source).await));
        }
        results
    }

    /// Coerce `record`, convert it to its slot's kind and write it if it differs.
    pub fn apply(&self, record: &MetricRecord, timestamp: DateTime<Utc>) -> SlotUpdate {
        let Some(attr) = self.key_to_attr.get(&record_key(record)) else {
            return SlotUpdate::Unknown;
        };
        let Some(slot) = self.slots.get(attr) else {
            return SlotUpdate::Foreign;
        };

        let incoming = record.resolve(&self.coercer).value;
        let Some(converted) = incoming.convert_to(slot.kind) else {
            return SlotUpdate::Failed(ChannelError::TypeMismatch {
                channel: slot.channel.clone(),
                expected: slot.kind.as_str(),
                got: incoming.to_string(),
            });
        };

        match self.host.read(slot.handle) {
            Ok((current, _)) if current.same_as(&converted) => SlotUpdate::Unchanged,
            Ok(_) => match self.host.write(slot.handle, converted, timestamp) {
                Ok(()) => SlotUpdate::Changed,
                Err(e) => SlotUpdate::Failed(e),
            },
            Err(e) => SlotUpdate::Failed(e),
        }
    }
}

/// Map key for a record: the scope keeps per-instance keys apart.
pub fn record_key(record: &MetricRecord) -> String {
    match &record.scope {
        Some(scope) => format!("{}:{}", scope, record.key),
        None => record.key.clone(),
    }
}

// ----------------------------------------------------------------------------
// Schema Synthesizer
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct PendingSlot {
    channel: String,
    value: TypedValue,
    doc: String,
}

/// Builds a `Group` from the first fetch of its sources.
#[derive(Debug, Clone)]
pub struct GroupBuilder {
    name: String,
    prefix: String,
    namespace: String,
    identity: Option<String>,
    sources: Vec<Source>,
    coercer: Arc<Coercer>,
}

impl GroupBuilder {
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            namespace: name.to_lowercase(),
            name,
            prefix: prefix.into(),
            identity: None,
            sources: Vec::new(),
            coercer: Arc::new(Coercer::default()),
        }
    }

    pub fn source(mut self, source: Source) -> Self {
        self.sources.push(source);
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn identity(mut self, identity: Option<String>) -> Self {
        self.identity = identity;
        self
    }

    pub fn coercer(mut self, coercer: Arc<Coercer>) -> Self {
        self.coercer = coercer;
        self
    }

    /// Fetch every source once and register one slot per distinct identifier.
    ///
    /// A source that fails contributes nothing; the group is still returned.
    pub async fn build(mut self, cache: &RequestCache, host: Arc<dyn ChannelHost>) -> Group {
        let mut order: Vec<String> = Vec::new();
        let mut pending: HashMap<String, PendingSlot> = HashMap::new();
        let mut key_to_attr: HashMap<String, String> = HashMap::new();
        let mut collisions = Vec::new();
        let mut fetched_sources = 0;

        for source in &mut self.sources {
            let fetched = match cache.fetch(source).await {
                Ok(fetched) => {
                    fetched_sources += 1;
                    fetched
                }
                Err(e) => {
                    warn!(
                        target: "archstats::group",
                        group = %self.name,
                        url = %e.url(),
                        error = %e,
                        "Source failed during group build"
                    );
                    continue;
                }
            };

            for record in fetched.records.iter() {
                let resolved = record.resolve(&self.coercer);
                let mut attr = to_attribute_name(&resolved.channel);
                if RESERVED_ATTRIBUTES.contains(&attr.as_str()) {
                    let renamed = fallback_attribute_name(&resolved.channel);
                    warn!(
                        target: "archstats::group",
                        group = %self.name,
                        attr = %attr,
                        renamed = %renamed,
                        "Attribute name is reserved for document metadata, using fallback"
                    );
                    attr = renamed;
                }
                let key = record_key(record);

                if pending.contains_key(&attr) {
                    let shadowed: Vec<String> = key_to_attr
                        .iter()
                        .filter(|(k, a)| **a == attr && **k != key)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for shadowed_key in shadowed {
                        warn!(
                            target: "archstats::group",
                            group = %self.name,
                            attr = %attr,
                            shadowed = %shadowed_key,
                            key = %key,
                            "Identifier collision, later key wins"
                        );
                        key_to_attr.remove(&shadowed_key);
                        collisions.push(Collision {
                            attr: attr.clone(),
                            shadowed_key,
                            key: key.clone(),
                        });
                    }
                } else {
                    order.push(attr.clone());
                }

                pending.insert(
                    attr.clone(),
                    PendingSlot {
                        channel: resolved.channel,
                        value: resolved.value,
                        doc: resolved.doc,
                    },
                );
                key_to_attr.insert(key, attr);
            }
        }

        let mut slots = BTreeMap::new();
        let mut foreign_channels = Vec::new();
        for attr in order {
            let Some(PendingSlot { channel, value, doc }) = pending.remove(&attr) else {
                continue;
            };
            let kind = value.record_kind();
            let options = SlotOptions::for_kind(kind, doc);
            let channel = format!("{}{}", self.prefix, channel);
            let handle = match host.register_slot(&channel, value, kind, options.clone()) {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(
                        target: "archstats::group",
                        group = %self.name,
                        channel = %channel,
                        error = %e,
                        "Channel belongs to another group, leaving it out"
                    );
                    foreign_channels.push(channel);
                    continue;
                }
            };
            slots.insert(
                attr.clone(),
                Slot {
                    channel,
                    attr,
                    handle,
                    kind,
                    options,
                },
            );
        }

        info!(
            target: "archstats::group",
            group = %self.name,
            slots = slots.len(),
            collisions = collisions.len(),
            foreign = foreign_channels.len(),
            fetched_sources,
            namespace = %self.namespace,
            "Group built"
        );
        debug!(target: "archstats::group", group = %self.name, attrs = ?slots.keys().collect::<Vec<_>>(), "Group schema");

        Group {
            name: self.name,
            prefix: self.prefix,
            namespace: self.namespace,
            identity: self.identity,
            slots,
            sources: self.sources,
            key_to_attr,
            persist_state: PersistState::AwaitingFirstPersist,
            init_document: None,
            collisions,
            foreign_channels,
            fetched_sources,
            coercer: self.coercer,
            host,
        }
    }
}
