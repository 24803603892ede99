// ============================================================================
// BRIDGE
// ============================================================================
// Composition root. Owns the shared HTTP transport, the channel host and the
// document store; discovers appliance instances, builds and restores one
// group per instance, then hands everything to the reconciler.
// ============================================================================

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::channel::{ChannelHost, ChannelTree};
use crate::config::BridgeConfig;
use crate::error::{ArchstatsError, ArchstatsResult};
use crate::group::{Group, GroupBuilder};
use crate::persistence::PersistenceGateway;
use crate::reconciler::{Reconciler, RetryPolicy, ShutdownSignal};
use crate::source::{HttpTransport, ReqwestTransport, RequestCache, Source};
use crate::store::{self, DocumentStore};
use crate::transform::Transform;
use crate::value::Coercer;
use crate::{
    APPLIANCE_DETAIL_PATH, APPLIANCE_METRICS_PATH, BRIDGE_VERSION, PROCESS_METRICS_PATH, STORAGE_METRICS_PATH,
};

/// Name of the optional group built from the instance list itself
pub const SUMMARY_GROUP: &str = "ApplianceMetricsGroup";

/// Namespace of the summary group
pub const SUMMARY_NAMESPACE: &str = "archiver_appliance_metrics";

/// Channel prefix of the summary group, below the bridge prefix
pub const SUMMARY_PREFIX: &str = "Appliances:";

/// Group name for one appliance instance
pub fn detailed_group_name(instance: &str) -> String {
    format!("DetailedMetricsGroup{}", instance)
}

/// The running bridge.
#[derive(Debug)]
pub struct Bridge {
    config: BridgeConfig,
    host: Arc<dyn ChannelHost>,
    cache: RequestCache,
    store: Arc<dyn DocumentStore>,
    coercer: Arc<Coercer>,
    shutdown: Arc<ShutdownSignal>,
}

impl Bridge {
    /// Wire the bridge from explicit collaborators.
    pub fn new(
        config: BridgeConfig,
        host: Arc<dyn ChannelHost>,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let coercer = Coercer::default().with_float_keys(config.appliance.extra_float_keys.iter().cloned());
        Self {
            host,
            cache: RequestCache::new(transport),
            store,
            coercer: Arc::new(coercer),
            shutdown: Arc::new(ShutdownSignal::new()),
            config,
        }
    }

    /// Production wiring: in-process channel tree, reqwest, configured store.
    pub fn from_config(config: BridgeConfig) -> ArchstatsResult<Self> {
        let transport = Arc::new(ReqwestTransport::new(config.appliance.http_timeout())?);
        let store = store::from_config(&config.database)?;
        Ok(Self::new(config, Arc::new(ChannelTree::new()), transport, store))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn host(&self) -> &Arc<dyn ChannelHost> {
        &self.host
    }

    pub fn shutdown_signal(&self) -> Arc<ShutdownSignal> {
        self.shutdown.clone()
    }

    fn instance_list_source(&self) -> Source {
        Source::new(
            self.config.appliance.endpoint(APPLIANCE_METRICS_PATH),
            Transform::InstanceList,
            self.config.appliance.cache_ttl(),
        )
    }

    /// Fetch the instance list, retrying until it succeeds or shutdown.
    pub async fn discover_instances(&self) -> ArchstatsResult<Vec<String>> {
        let mut source = self.instance_list_source();
        loop {
            if self.shutdown.is_triggered() {
                return Err(ArchstatsError::ShuttingDown);
            }

            let failure = match self.cache.fetch(&mut source).await {
                Ok(fetched) => match Transform::instances(&source.url, &fetched.raw_text) {
                    Ok(instances) => {
                        info!(
                            target: "archstats::bridge",
                            instances = ?instances,
                            "Discovered appliance instances"
                        );
                        return Ok(instances);
                    }
                    Err(e) => e,
                },
                Err(e) => e,
            };

            warn!(
                target: "archstats::bridge",
                url = %failure.url(),
                error = %failure,
                retry_secs = self.config.bridge.bootstrap_retry_secs,
                "Instance discovery failed, retrying"
            );
            tokio::select! {
                _ = self.shutdown.wait() => return Err(ArchstatsError::ShuttingDown),
                _ = tokio::time::sleep(self.config.bridge.bootstrap_retry()) => {}
            }
        }
    }

    /// Sources feeding the group of `instance`.
    pub fn instance_sources(&self, instance: &str) -> Vec<Source> {
        let appliance = &self.config.appliance;
        let ttl = appliance.cache_ttl();
        let mut sources = vec![
            Source::new(appliance.endpoint(APPLIANCE_DETAIL_PATH), Transform::DetailedMetrics, ttl)
                .with_param("appliance", instance),
        ];
        if appliance.storage_metrics {
            sources.push(
                Source::new(appliance.endpoint(STORAGE_METRICS_PATH), Transform::StorageMetrics, ttl)
                    .with_param("appliance", instance),
            );
        }
        if appliance.process_metrics {
            sources.push(
                Source::new(appliance.endpoint(PROCESS_METRICS_PATH), Transform::ProcessMetrics, ttl)
                    .with_param("appliance", instance),
            );
        }
        sources
    }

    /// Build a group, retrying until at least one of its sources answers or shutdown.
    ///
    /// A build where every source failed would freeze an empty schema.
    pub async fn build_group(&self, builder: GroupBuilder) -> ArchstatsResult<Group> {
        let builder = builder
            .identity(self.config.database.identity.clone())
            .coercer(self.coercer.clone());
        loop {
            if self.shutdown.is_triggered() {
                return Err(ArchstatsError::ShuttingDown);
            }

            let group = builder.clone().build(&self.cache, self.host.clone()).await;
            if group.fetched_sources() > 0 || group.sources().is_empty() {
                return Ok(group);
            }

            warn!(
                target: "archstats::bridge",
                group = %group.name(),
                sources = group.sources().len(),
                retry_secs = self.config.bridge.bootstrap_retry_secs,
                "No source answered during group build, retrying"
            );
            tokio::select! {
                _ = self.shutdown.wait() => return Err(ArchstatsError::ShuttingDown),
                _ = tokio::time::sleep(self.config.bridge.bootstrap_retry()) => {}
            }
        }
    }

    async fn build_and_restore(&self, builder: GroupBuilder) -> ArchstatsResult<(Group, Arc<PersistenceGateway>)> {
        let mut group = self.build_group(builder).await?;
        let gateway = PersistenceGateway::new(self.store.clone(), &group).configured(&self.config.database);
        gateway.restore(&mut group).await;
        Ok((group, Arc::new(gateway)))
    }

    /// Discover instances, build and restore every group, register them.
    pub async fn bootstrap(&self) -> ArchstatsResult<Reconciler> {
        let started = Instant::now();
        let instances = self.discover_instances().await?;
        let prefix = &self.config.bridge.prefix;

        let mut reconciler = Reconciler::new(
            prefix,
            self.cache.clone(),
            self.host.clone(),
            RetryPolicy::from_settings(&self.config.bridge),
            self.shutdown.clone(),
        )?
        .with_warn_threshold(self.config.bridge.pass_warn_threshold_ms);

        if self.config.appliance.summary_group {
            let builder = GroupBuilder::new(SUMMARY_GROUP, format!("{}{}", prefix, SUMMARY_PREFIX))
                .namespace(SUMMARY_NAMESPACE)
                .source(self.instance_list_source());
            let (group, gateway) = self.build_and_restore(builder).await?;
            reconciler.register(group, gateway);
        }

        for instance in &instances {
            let mut builder = GroupBuilder::new(detailed_group_name(instance), format!("{}{}:", prefix, instance))
                .namespace(self.config.database.namespace_for(instance));
            for source in self.instance_sources(instance) {
                builder = builder.source(source);
            }
            let (group, gateway) = self.build_and_restore(builder).await?;
            reconciler.register(group, gateway);
        }

        info!(
            target: "archstats::bridge",
            groups = reconciler.groups().count(),
            backend = self.store.backend(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Bootstrap complete"
        );
        Ok(reconciler)
    }

    /// Bootstrap, run until shutdown, then drain in-flight stores.
    pub async fn run(&self) -> ArchstatsResult<()> {
        info!(
            target: "archstats::bridge",
            version = BRIDGE_VERSION,
            appliance = %self.config.appliance.url,
            prefix = %self.config.bridge.prefix,
            "Starting bridge"
        );

        let mut reconciler = match self.bootstrap().await {
            Ok(reconciler) => reconciler,
            Err(ArchstatsError::ShuttingDown) => {
                info!(target: "archstats::bridge", "Shutdown requested during bootstrap");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        reconciler.supervise().await;

        info!(target: "archstats::bridge", "Starting graceful shutdown");
        let grace = self.config.bridge.shutdown_timeout();
        if !reconciler.close(grace).await {
            error!(
                target: "archstats::bridge",
                grace_secs = grace.as_secs(),
                "Some stores were still in flight at shutdown"
            );
        }
        info!(target: "archstats::bridge", passes = reconciler.passes(), "Bridge stopped");
        Ok(())
    }

    /// Trigger shutdown on SIGINT or SIGTERM.
    pub fn install_signal_handlers(&self) {
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            shutdown.trigger();
        });
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(target: "archstats::bridge", error = %e, "Failed to set up SIGTERM handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(target: "archstats::bridge", "Received SIGINT");
            }
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => info!(target: "archstats::bridge", "Received SIGTERM"),
        _ = tokio::signal::ctrl_c() => info!(target: "archstats::bridge", "Received SIGINT"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(target: "archstats::bridge", "Received SIGINT");
    }
}
