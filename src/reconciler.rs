// ============================================================================
// POLLING RECONCILER
// ============================================================================
// One pass: for every registered group, in registration order, refetch its
// sources, diff each record against the frozen slots, write what changed and
// store a snapshot when something changed (or when the group has never been
// persisted). `supervise` wraps passes in a loop that survives errors and
// panics and only ends on shutdown.
// ============================================================================

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::channel::{ChannelHost, SlotHandle, SlotOptions};
use crate::config::BridgeSettings;
use crate::error::{ArchstatsError, ArchstatsResult};
use crate::group::{record_key, Group, PersistState, SlotUpdate};
use crate::logging::PassTimer;
use crate::persistence::PersistenceGateway;
use crate::source::RequestCache;
use crate::value::{RecordKind, TypedValue};
use crate::{DEFAULT_FAILURE_BACKOFF_SECS, DEFAULT_INTER_GROUP_DELAY_MS, DEFAULT_POLL_INTERVAL_SECS, UPDATER_CHANNEL};

// ----------------------------------------------------------------------------
// Shutdown Signal
// ----------------------------------------------------------------------------

/// Latching shutdown flag with async waiters.
#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Resolves once `trigger` has been called, including before this call.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

// ----------------------------------------------------------------------------
// Retry Policy
// ----------------------------------------------------------------------------

/// Sleep durations of the supervised loop. There is no retry cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub poll_interval: Duration,
    pub inter_group_delay: Duration,
    /// Added before the poll interval after a failed pass
    pub failure_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            inter_group_delay: Duration::from_millis(DEFAULT_INTER_GROUP_DELAY_MS),
            failure_backoff: Duration::from_secs(DEFAULT_FAILURE_BACKOFF_SECS),
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        Self {
            poll_interval: Duration::from_secs(settings.poll_interval_secs),
            inter_group_delay: Duration::from_millis(settings.inter_group_delay_ms),
            failure_backoff: Duration::from_secs(settings.failure_backoff_secs),
        }
    }

    /// Pause before the next pass.
    pub fn pause_after(&self, failed: bool) -> Duration {
        if failed {
            self.failure_backoff + self.poll_interval
        } else {
            self.poll_interval
        }
    }
}

// ----------------------------------------------------------------------------
// Reports
// ----------------------------------------------------------------------------

/// Outcome of updating one group.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupReport {
    pub group: String,
    pub changed: usize,
    pub unchanged: usize,
    /// Keys outside the frozen schema
    pub unknown_keys: Vec<String>,
    /// Keys whose channel belongs to another group
    pub foreign: usize,
    /// Keys whose value could not be written to their slot
    pub failed_updates: Vec<String>,
    pub fetch_errors: Vec<String>,
    /// Id of the stored document
    pub stored: Option<String>,
    pub store_error: Option<String>,
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PassReport {
    /// 1-based pass counter
    pub pass: u64,
    pub groups: Vec<GroupReport>,
}

impl PassReport {
    pub fn changed(&self) -> usize {
        self.groups.iter().map(|g| g.changed).sum()
    }

    /// Number of documents written during the pass
    pub fn stores(&self) -> usize {
        self.groups.iter().filter(|g| g.stored.is_some()).count()
    }

    pub fn unknown_keys(&self) -> Vec<&str> {
        self.groups
            .iter()
            .flat_map(|g| g.unknown_keys.iter().map(String::as_str))
            .collect()
    }

    pub fn fetch_errors(&self) -> usize {
        self.groups.iter().map(|g| g.fetch_errors.len()).sum()
    }

    pub fn group(&self, name: &str) -> Option<&GroupReport> {
        self.groups.iter().find(|g| g.group == name)
    }
}

// ----------------------------------------------------------------------------
// Reconciler
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct ManagedGroup {
    group: Group,
    gateway: Arc<PersistenceGateway>,
    /// A store failed; retry even without new changes
    store_pending: bool,
}

/// Supervises all groups.
#[derive(Debug)]
pub struct Reconciler {
    groups: Vec<ManagedGroup>,
    cache: RequestCache,
    host: Arc<dyn ChannelHost>,
    policy: RetryPolicy,
    shutdown: Arc<ShutdownSignal>,
    updater: SlotHandle,
    passes: u64,
    warn_threshold_ms: u64,
}

impl Reconciler {
    /// Registers the `<prefix>__UPDATER__` heartbeat channel on `host`.
    pub fn new(
        prefix: &str,
        cache: RequestCache,
        host: Arc<dyn ChannelHost>,
        policy: RetryPolicy,
        shutdown: Arc<ShutdownSignal>,
    ) -> ArchstatsResult<Self> {
        let updater = host.register_slot(
            &format!("{}{}", prefix, UPDATER_CHANNEL),
            TypedValue::Int(0),
            RecordKind::LongInput,
            SlotOptions::for_kind(RecordKind::LongInput, "Completed reconciliation passes").read_only(),
        )?;
        Ok(Self {
            groups: Vec::new(),
            cache,
            host,
            policy,
            shutdown,
            updater,
            passes: 0,
            warn_threshold_ms: 5000,
        })
    }

    pub fn with_warn_threshold(mut self, threshold_ms: u64) -> Self {
        self.warn_threshold_ms = threshold_ms;
        self
    }

    /// Add a group; passes visit groups in registration order.
    pub fn register(&mut self, group: Group, gateway: Arc<PersistenceGateway>) {
        info!(
            target: "archstats::reconciler",
            group = %group.name(),
            slots = group.len(),
            state = ?group.persist_state(),
            "Registered group"
        );
        self.groups.push(ManagedGroup {
            group,
            gateway,
            store_pending: false,
        });
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.iter().map(|m| &m.group)
    }

    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Close every gateway, draining in-flight stores. True if all drained.
    pub async fn close(&self, grace: Duration) -> bool {
        let closes = self.groups.iter().map(|m| m.gateway.close(grace));
        futures::future::join_all(closes).await.into_iter().all(|drained| drained)
    }

    /// One refetch-and-diff cycle over every group.
    pub async fn run_pass(&mut self) -> ArchstatsResult<PassReport> {
        let timer = PassTimer::with_threshold("reconciliation_pass", self.warn_threshold_ms);
        let mut report = PassReport {
            pass: self.passes + 1,
            groups: Vec::with_capacity(self.groups.len()),
        };

        for index in 0..self.groups.len() {
            if self.shutdown.is_triggered() {
                return Err(ArchstatsError::ShuttingDown);
            }
            report.groups.push(self.update_group(index).await);

            if index + 1 < self.groups.len() {
                tokio::select! {
                    _ = self.shutdown.wait() => return Err(ArchstatsError::ShuttingDown),
                    _ = tokio::time::sleep(self.policy.inter_group_delay) => {}
                }
            }
        }

        self.passes += 1;
        self.host
            .write(self.updater, TypedValue::Int(self.passes as i64), Utc::now())?;

        let elapsed_ms = timer.stop();
        debug!(
            target: "archstats::reconciler",
            pass = report.pass,
            changed = report.changed(),
            stores = report.stores(),
            fetch_errors = report.fetch_errors(),
            elapsed_ms,
            "Pass complete"
        );
        Ok(report)
    }

    async fn update_group(&mut self, index: usize) -> GroupReport {
        let managed = &mut self.groups[index];
        let timer = PassTimer::with_threshold(format!("update:{}", managed.group.name()), self.warn_threshold_ms);
        let mut report = GroupReport {
            group: managed.group.name().to_string(),
            ..GroupReport::default()
        };

        let fetches = managed.group.fetch_all(&self.cache).await;
        let now = Utc::now();
        for (url, fetched) in fetches {
            let fetched = match fetched {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(
                        target: "archstats::reconciler",
                        group = %report.group,
                        url = %url,
                        error = %e,
                        "Source fetch failed, keeping previous values"
                    );
                    report.fetch_errors.push(e.to_string());
                    continue;
                }
            };

            for record in fetched.records.iter() {
                match managed.group.apply(record, now) {
                    SlotUpdate::Unchanged => report.unchanged += 1,
                    SlotUpdate::Changed => report.changed += 1,
                    SlotUpdate::Unknown => {
                        let key = record_key(record);
                        warn!(
                            target: "archstats::reconciler",
                            group = %report.group,
                            key = %key,
                            value = %record.raw,
                            "Saw new entry"
                        );
                        report.unknown_keys.push(key);
                    }
                    SlotUpdate::Foreign => {
                        debug!(
                            target: "archstats::reconciler",
                            group = %report.group,
                            key = %record.key,
                            "Skipping key owned by another group"
                        );
                        report.foreign += 1;
                    }
                    SlotUpdate::Failed(e) => {
                        warn!(
                            target: "archstats::reconciler",
                            group = %report.group,
                            key = %record.key,
                            error = %e,
                            "Failed to update slot"
                        );
                        report.failed_updates.push(record_key(record));
                    }
                }
            }
        }

        let first_persist = managed.group.persist_state() == PersistState::AwaitingFirstPersist;
        let wants_store = report.changed > 0 || first_persist || managed.store_pending;
        if wants_store && !managed.group.is_empty() {
            match managed.gateway.store(&managed.group).await {
                Ok(id) => {
                    managed.group.mark_persisted();
                    managed.store_pending = false;
                    report.stored = Some(id);
                }
                Err(e) => {
                    error!(
                        target: "archstats::reconciler",
                        group = %report.group,
                        category = "persistence",
                        error = %e,
                        "Store failed, retrying next pass"
                    );
                    managed.store_pending = true;
                    report.store_error = Some(e.to_string());
                }
            }
        }

        timer.stop();
        report
    }

    /// Run passes until shutdown. Errors and panics inside a pass are logged
    /// and followed by the failure backoff; nothing escapes.
    pub async fn supervise(&mut self) {
        info!(
            target: "archstats::reconciler",
            groups = self.groups.len(),
            poll_interval_secs = self.policy.poll_interval.as_secs(),
            "Reconciler started"
        );

        while !self.shutdown.is_triggered() {
            let outcome = AssertUnwindSafe(self.run_pass()).catch_unwind().await;
            let failed = match outcome {
                Ok(Ok(_)) => false,
                Ok(Err(ArchstatsError::ShuttingDown)) => break,
                Ok(Err(e)) => {
                    error!(
                        target: "archstats::reconciler",
                        category = e.category(),
                        error = %e,
                        "Update failed"
                    );
                    true
                }
                Err(panic) => {
                    let e = ArchstatsError::PassPanicked {
                        message: panic_message(panic.as_ref()),
                    };
                    error!(target: "archstats::reconciler", error = %e, "Update failed");
                    true
                }
            };

            let pause = self.policy.pause_after(failed);
            tokio::select! {
                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        info!(target: "archstats::reconciler", passes = self.passes, "Reconciler stopped");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelTree;
    use crate::error::ChannelError;
    use crate::group::GroupBuilder;
    use crate::source::{FixtureTransport, Source};
    use crate::store::{Document, MemoryStore};
    use crate::transform::Transform;
    use chrono::DateTime;
    use serde_json::json;

    const URL: &str = "http://appliance/detail";
    const NS: &str = "metrics_a0";
    const BODY: &str = r#"[{"name": "Total PV count", "value": "10"}, {"name": "Status", "value": "Working"}]"#;

    struct Fixture {
        transport: Arc<FixtureTransport>,
        tree: Arc<ChannelTree>,
        store: Arc<MemoryStore>,
        shutdown: Arc<ShutdownSignal>,
    }

    impl Fixture {
        fn new() -> Self {
            let transport = Arc::new(FixtureTransport::new());
            transport.set_json(URL, BODY);
            Self {
                transport,
                tree: Arc::new(ChannelTree::new()),
                store: Arc::new(MemoryStore::new()),
                shutdown: Arc::new(ShutdownSignal::new()),
            }
        }

        async fn reconciler_with(&self, host: Arc<dyn ChannelHost>, restore: bool) -> Reconciler {
            let cache = RequestCache::new(self.transport.clone());
            let mut group = GroupBuilder::new("DetailedMetricsGroupa0", "ARCH:a0:")
                .namespace(NS)
                .source(Source::new(URL, Transform::DetailedMetrics, Duration::ZERO))
                .build(&cache, host.clone())
                .await;
            let gateway = Arc::new(PersistenceGateway::new(self.store.clone(), &group));
            if restore {
                gateway.restore(&mut group).await;
            }
            let mut reconciler =
                Reconciler::new("ARCH:", cache, host, RetryPolicy::default(), self.shutdown.clone()).unwrap();
            reconciler.register(group, gateway);
            reconciler
        }

        async fn reconciler(&self, restore: bool) -> Reconciler {
            self.reconciler_with(self.tree.clone(), restore).await
        }
    }

    #[tokio::test]
    async fn test_first_pass_stores_exactly_once() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(true).await;

        let first = reconciler.run_pass().await.unwrap();
        assert_eq!(first.changed(), 0);
        assert_eq!(first.stores(), 1);

        let second = reconciler.run_pass().await.unwrap();
        assert_eq!(second.stores(), 0);
        assert_eq!(fx.store.count(), 1);
        assert_eq!(fx.tree.value_of("ARCH:__UPDATER__"), Some(TypedValue::Int(2)));
    }

    #[tokio::test]
    async fn test_restored_group_does_not_store_without_change() {
        let fx = Fixture::new();
        fx.store.insert(
            NS,
            "prior",
            Document::new(Utc::now())
                .with_field("total_pv_count", json!(10))
                .with_field("status", json!("Working")),
        );
        let mut reconciler = fx.reconciler(true).await;

        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.stores(), 0);
        assert_eq!(fx.store.count(), 1);
    }

    #[tokio::test]
    async fn test_change_triggers_store() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(true).await;
        reconciler.run_pass().await.unwrap();

        fx.transport
            .set_json(URL, r#"[{"name": "Total PV count", "value": "11"}, {"name": "Status", "value": "Working"}]"#);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.changed(), 1);
        assert_eq!(report.stores(), 1);
        assert_eq!(fx.tree.value_of("ARCH:a0:TotalPvCount"), Some(TypedValue::Int(11)));
        assert_eq!(fx.store.documents(NS)[1].fields["total_pv_count"], json!(11));
    }

    #[tokio::test]
    async fn test_new_key_is_reported_not_added() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(true).await;
        reconciler.run_pass().await.unwrap();
        let before = fx.tree.len();

        fx.transport.set_json(
            URL,
            r#"[{"name": "Total PV count", "value": "10"}, {"name": "Brand new metric", "value": "1"}]"#,
        );
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.unknown_keys(), vec!["Brand new metric"]);
        assert_eq!(fx.tree.len(), before);
        assert_eq!(report.stores(), 0);
    }

    #[tokio::test]
    async fn test_foreign_channel_never_triggers_store() {
        let fx = Fixture::new();
        fx.tree
            .register_slot("ARCH:a0:Status", TypedValue::Int(7), RecordKind::LongInput, SlotOptions::default())
            .unwrap();
        let mut reconciler = fx.reconciler(true).await;

        assert_eq!(reconciler.run_pass().await.unwrap().stores(), 1);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.stores(), 0);
        assert_eq!(report.changed(), 0);
        assert_eq!(report.groups[0].foreign, 1);
        assert!(report.unknown_keys().is_empty());
        assert_eq!(fx.tree.value_of("ARCH:a0:Status"), Some(TypedValue::Int(7)));
        assert_eq!(fx.tree.kind_of("ARCH:a0:Status"), Some(RecordKind::LongInput));
    }

    #[tokio::test]
    async fn test_updater_channel_is_registered_once() {
        let fx = Fixture::new();
        let cache = RequestCache::new(fx.transport.clone());
        let _first =
            Reconciler::new("ARCH:", cache.clone(), fx.tree.clone(), RetryPolicy::default(), fx.shutdown.clone())
                .unwrap();

        let second = Reconciler::new("ARCH:", cache, fx.tree.clone(), RetryPolicy::default(), fx.shutdown.clone());
        assert!(matches!(
            second,
            Err(ArchstatsError::Channel(ChannelError::AlreadyRegistered { channel })) if channel == "ARCH:__UPDATER__"
        ));
    }

    #[tokio::test]
    async fn test_http_500_keeps_slots() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(true).await;
        reconciler.run_pass().await.unwrap();

        fx.transport.set_status(URL, 500, "");
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.fetch_errors(), 1);
        assert_eq!(fx.tree.value_of("ARCH:a0:TotalPvCount"), Some(TypedValue::Int(10)));
    }

    #[tokio::test]
    async fn test_failed_store_is_retried() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(false).await;
        fx.store.set_unavailable(true);

        let report = reconciler.run_pass().await.unwrap();
        assert!(report.groups[0].store_error.is_some());
        assert_eq!(
            reconciler.groups().next().map(Group::persist_state),
            Some(PersistState::AwaitingFirstPersist)
        );

        fx.store.set_unavailable(false);
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.stores(), 1);
        assert_eq!(fx.store.count(), 1);
    }

    #[test]
    fn test_pause_after_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.pause_after(false), Duration::from_secs(60));
        assert_eq!(policy.pause_after(true), Duration::from_secs(70));
    }

    /// Panics on the first heartbeat write.
    #[derive(Debug)]
    struct PanicOnceHost {
        inner: ChannelTree,
        armed: AtomicBool,
        updater_name: &'static str,
    }

    impl ChannelHost for PanicOnceHost {
        fn register_slot(
            &self,
            name: &str,
            initial: TypedValue,
            kind: RecordKind,
            options: SlotOptions,
        ) -> Result<SlotHandle, ChannelError> {
            self.inner.register_slot(name, initial, kind, options)
        }

        fn write(&self, handle: SlotHandle, value: TypedValue, timestamp: DateTime<Utc>) -> Result<(), ChannelError> {
            if Some(handle) == self.inner.lookup(self.updater_name) && self.armed.swap(false, Ordering::SeqCst) {
                panic!("channel server went away");
            }
            self.inner.write(handle, value, timestamp)
        }

        fn read(&self, handle: SlotHandle) -> Result<(TypedValue, DateTime<Utc>), ChannelError> {
            self.inner.read(handle)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_survives_panic_and_backs_off() {
        let fx = Fixture::new();
        let host = Arc::new(PanicOnceHost {
            inner: ChannelTree::new(),
            armed: AtomicBool::new(true),
            updater_name: "ARCH:__UPDATER__",
        });
        let mut reconciler = fx.reconciler_with(host.clone(), false).await;
        let handle = tokio::spawn(async move {
            reconciler.supervise().await;
            reconciler.passes()
        });

        // t=0 pass panics; next pass only after backoff + interval (70s)
        tokio::time::sleep(Duration::from_secs(65)).await;
        assert_eq!(host.inner.value_of("ARCH:__UPDATER__"), Some(TypedValue::Int(0)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(host.inner.value_of("ARCH:__UPDATER__"), Some(TypedValue::Int(2)));

        fx.shutdown.trigger();
        assert_eq!(handle.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_polls_on_interval_until_shutdown() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(false).await;
        let tree = fx.tree.clone();
        let handle = tokio::spawn(async move { reconciler.supervise().await });

        tokio::time::sleep(Duration::from_secs(125)).await;
        assert_eq!(tree.value_of("ARCH:__UPDATER__"), Some(TypedValue::Int(3)));
        assert_eq!(fx.store.count(), 1);

        fx.shutdown.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_before_pass() {
        let fx = Fixture::new();
        let mut reconciler = fx.reconciler(false).await;
        fx.shutdown.trigger();
        assert!(matches!(reconciler.run_pass().await, Err(ArchstatsError::ShuttingDown)));
        fx.shutdown.wait().await;
    }
}
