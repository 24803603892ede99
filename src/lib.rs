//! # Archstats - Archiver Appliance Statistics Bridge
//!
//! Polls the archiver appliance management API, turns its irregular JSON
//! metrics into a frozen set of typed channels, keeps those channels current,
//! and snapshots every change to an append-only document store so that the
//! last known state survives restarts.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │  SOURCES → REQUEST CACHE → GROUP BUILDER → RECONCILER → PERSISTENCE      │
//! │                                  │              │                        │
//! │                                  └── CHANNEL TREE ◄┘                      │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod bridge;
pub mod channel;
pub mod config;
pub mod error;
pub mod group;
pub mod identifier;
pub mod logging;
pub mod persistence;
pub mod reconciler;
pub mod source;
pub mod store;
pub mod transform;
pub mod value;

pub use bridge::Bridge;
pub use channel::{ChannelHost, ChannelTree, SlotHandle, SlotOptions};
pub use config::BridgeConfig;
pub use error::{ArchstatsError, ArchstatsResult, FetchError, PersistenceError};
pub use group::{Collision, Group, GroupBuilder, PersistState, Slot, SlotUpdate};
pub use identifier::{normalize, to_attribute_name};
pub use persistence::{PersistenceGateway, RestoreReport};
pub use reconciler::{GroupReport, PassReport, Reconciler, RetryPolicy, ShutdownSignal};
pub use source::{FixtureTransport, HttpTransport, ReqwestTransport, RequestCache, Source};
pub use store::{Document, DocumentStore, ElasticStore, FileStore, MemoryStore, SearchQuery};
pub use transform::{MetricRecord, Transform};
pub use value::{coerce, Coercer, RecordKind, TypedValue};

// ============================================================================
// CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Bridge version - follows semantic versioning
pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const BRIDGE_NAME: &str = "archstats";
pub const BRIDGE_FULL_NAME: &str = "Archiver Appliance Statistics Bridge";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default pause between reconciliation passes (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Minimum allowed pause between passes (seconds)
pub const MIN_POLL_INTERVAL_SECS: u64 = 1;

/// Yield between two groups inside one pass (milliseconds)
pub const DEFAULT_INTER_GROUP_DELAY_MS: u64 = 100;

/// Extra sleep after a pass failed (seconds)
pub const DEFAULT_FAILURE_BACKOFF_SECS: u64 = 10;

/// Default timeout for appliance HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Default timeout for document store calls (seconds)
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 10;

/// Default request cache lifetime (milliseconds)
pub const DEFAULT_CACHE_TTL_MS: u64 = 1000;

/// Grace period for draining in-flight stores on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Channels & Documents
// ----------------------------------------------------------------------------

/// Default prefix for every published channel
pub const DEFAULT_PREFIX: &str = "ARCH:";

/// Maximum length of a string-input channel
pub const MAX_STRING_LENGTH: usize = 2000;

/// Name of the heartbeat channel bumped after every pass
pub const UPDATER_CHANNEL: &str = "__UPDATER__";

/// Reserved document field holding the snapshot time
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Reserved document field holding the partition identity
pub const IDENTITY_FIELD: &str = "identity";

/// Marker prefix for attribute names synthesized from a content hash
pub const FALLBACK_ATTRIBUTE_PREFIX: &str = "json_";

/// Value persisted in place of NaN and infinities
pub const DEFAULT_NON_FINITE_SENTINEL: f64 = 0.0;

// ----------------------------------------------------------------------------
// Appliance API
// ----------------------------------------------------------------------------

/// Default appliance management URL
pub const DEFAULT_APPLIANCE_URL: &str = "http://localhost:17665/";

/// Default document store URL
pub const DEFAULT_DATABASE_URL: &str = "http://localhost:9200";

/// Default namespace template; `{instance}` is replaced by the lowercased instance
pub const DEFAULT_NAMESPACE_TEMPLATE: &str = "archiver_appliance_metrics_{instance}";

pub const APPLIANCE_METRICS_PATH: &str = "mgmt/bpl/getApplianceMetrics";
pub const APPLIANCE_DETAIL_PATH: &str = "mgmt/bpl/getApplianceMetricsForAppliance";
pub const STORAGE_METRICS_PATH: &str = "mgmt/bpl/getStorageMetricsForAppliance";
pub const PROCESS_METRICS_PATH: &str = "mgmt/bpl/getProcessMetricsDataForAppliance";
