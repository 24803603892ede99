//! End-to-end scenarios through the public API, with fixture HTTP responses
//! and in-process stores.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;

use archstats::config::DatabaseBackend;
use archstats::{
    coerce, BridgeConfig, Bridge, ChannelTree, DocumentStore, FileStore, FixtureTransport, GroupBuilder, MemoryStore,
    PersistState, PersistenceGateway, Reconciler, RequestCache, RetryPolicy, ShutdownSignal, Source, Transform,
    TypedValue, APPLIANCE_DETAIL_PATH, APPLIANCE_METRICS_PATH, STORAGE_METRICS_PATH,
};

const BASE: &str = "http://appliance:17665/";
const NAMESPACE: &str = "archiver_appliance_metrics_appliance0";

const DETAIL: &str = r#"[
    {"name": "Total PV count", "value": "160,732", "source": "mgmt"},
    {"name": "Status", "value": "Working", "source": "mgmt"},
    {"name": "Estimated bytes transferred in ETL(KB)", "value": "2048", "source": "etl"},
    {"name": "Event rate", "value": "NaN", "source": "pv"}
]"#;

fn detail_url() -> String {
    format!("{}{}?appliance=appliance0", BASE, APPLIANCE_DETAIL_PATH)
}

fn appliance() -> Arc<FixtureTransport> {
    let transport = Arc::new(FixtureTransport::new());
    transport.set_json(
        &format!("{}{}", BASE, APPLIANCE_METRICS_PATH),
        r#"[{"instance": "appliance0", "status": "Working"}]"#,
    );
    transport.set_json(&detail_url(), DETAIL);
    transport.set_json(
        &format!("{}{}?appliance=appliance0", BASE, STORAGE_METRICS_PATH),
        r#"[{"name": "STS", "capacityUtilized": "0.25", "totalSpaceGB": "100"}]"#,
    );
    transport
}

fn config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.appliance.url = BASE.to_string();
    config.appliance.cache_ttl_ms = 0;
    config.database.backend = DatabaseBackend::Memory;
    config
}

async fn start(
    transport: &Arc<FixtureTransport>,
    store: Arc<dyn DocumentStore>,
) -> (Arc<ChannelTree>, Reconciler) {
    let tree = Arc::new(ChannelTree::new());
    let bridge = Bridge::new(config(), tree.clone(), transport.clone(), store);
    let reconciler = bridge.bootstrap().await.expect("bootstrap");
    (tree, reconciler)
}

#[test]
fn thousands_separators_coerce_like_plain_integers() {
    assert_eq!(coerce("Total PV count", "160,732").value, TypedValue::Int(160732));
    assert_eq!(coerce("Total PV count", "160732").value, TypedValue::Int(160732));
}

#[test]
fn unit_suffix_is_rescaled_to_megabytes() {
    let coerced = coerce("Estimated bytes transferred in ETL(KB)", "2048");
    assert!(coerced.key.ends_with("(MB)"));
    assert_eq!(coerced.value, TypedValue::Float(2.0));
}

#[test]
fn nan_is_non_finite_for_any_key() {
    for key in ["Event rate", "Status", "anything"] {
        assert!(!coerce(key, "NaN").value.is_finite());
    }
}

#[tokio::test]
async fn first_pass_stores_once_and_sentinel_replaces_nan() {
    let transport = appliance();
    let store = Arc::new(MemoryStore::new());
    let (tree, mut reconciler) = start(&transport, store.clone()).await;

    assert_eq!(reconciler.run_pass().await.unwrap().stores(), 1);
    assert_eq!(reconciler.run_pass().await.unwrap().stores(), 0);
    assert_eq!(store.count(), 1);
    assert!(uuid::Uuid::parse_str(&store.ids(NAMESPACE)[0]).is_ok());
    // discovery, two sources at build, two sources per pass
    assert_eq!(transport.total_calls(), 7);

    let live = tree.value_of("ARCH:appliance0:EventRate").unwrap();
    assert!(matches!(live, TypedValue::Float(v) if v.is_nan()));

    let document = &store.documents(NAMESPACE)[0];
    assert_eq!(document.fields["event_rate"], json!(0.0));
    assert_eq!(document.fields["total_pv_count"], json!(160732));
    assert_eq!(document.fields["estimated_bytes_transferred_in_etl_mb"], json!(2.0));
}

#[tokio::test]
async fn restart_restores_without_duplicate_documents() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_string_lossy().to_string();
    let transport = appliance();
    // The NaN sentinel would restore as 0.0 and differ from the next fetch.
    transport.set_json(
        &detail_url(),
        r#"[{"name": "Total PV count", "value": "160,732"}, {"name": "Status", "value": "Working"}]"#,
    );

    {
        let (_, mut reconciler) = start(&transport, Arc::new(FileStore::new(&root))).await;
        assert_eq!(reconciler.run_pass().await.unwrap().stores(), 1);
        assert!(reconciler.close(Duration::from_secs(1)).await);
    }

    let (tree, mut reconciler) = start(&transport, Arc::new(FileStore::new(&root))).await;
    let group = reconciler.groups().next().unwrap();
    assert_eq!(group.persist_state(), PersistState::Active);
    assert!(group.init_document().is_some());
    assert_eq!(tree.value_of("ARCH:appliance0:TotalPvCount"), Some(TypedValue::Int(160732)));

    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.changed(), 0);
    assert_eq!(report.stores(), 0);
}

#[tokio::test]
async fn new_upstream_key_is_logged_not_added() {
    let transport = appliance();
    let (tree, mut reconciler) = start(&transport, Arc::new(MemoryStore::new())).await;
    reconciler.run_pass().await.unwrap();
    let channels = tree.len();

    transport.set_json(
        &detail_url(),
        r#"[{"name": "Total PV count", "value": "160,733"}, {"name": "Disconnected PVs", "value": "4"}]"#,
    );
    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.unknown_keys(), vec!["Disconnected PVs"]);
    assert_eq!(report.changed(), 1);
    assert_eq!(tree.len(), channels);
    assert_eq!(tree.lookup("ARCH:appliance0:DisconnectedPvs"), None);
}

#[tokio::test]
async fn http_500_leaves_slots_untouched() {
    let transport = appliance();
    let store = Arc::new(MemoryStore::new());
    let (tree, mut reconciler) = start(&transport, store.clone()).await;
    reconciler.run_pass().await.unwrap();

    transport.set_status(&detail_url(), 500, "Internal Server Error");
    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.fetch_errors(), 1);
    assert_eq!(report.stores(), 0);
    assert_eq!(tree.value_of("ARCH:appliance0:TotalPvCount"), Some(TypedValue::Int(160732)));
    assert_eq!(tree.value_of("ARCH:appliance0:Status"), Some(TypedValue::Text("Working".into())));
    assert_eq!(store.count(), 1);
}

#[tokio::test]
async fn colliding_identifiers_keep_the_later_key() {
    let url = "http://appliance/detail";
    let transport = Arc::new(FixtureTransport::new());
    transport.set_json(
        url,
        r#"[{"name": "Total PV count", "value": "1"}, {"name": "Total-PV-count", "value": "2"}]"#,
    );
    let cache = RequestCache::new(transport.clone());
    let tree = Arc::new(ChannelTree::new());

    let group = GroupBuilder::new("DetailedMetricsGroupa0", "ARCH:a0:")
        .source(Source::new(url, Transform::DetailedMetrics, Duration::ZERO))
        .build(&cache, tree.clone())
        .await;

    assert_eq!(group.len(), 1);
    assert_eq!(group.collisions().len(), 1);
    assert_eq!(group.collisions()[0].key, "Total-PV-count");
    assert_eq!(tree.value_of("ARCH:a0:TotalPvCount"), Some(TypedValue::Int(2)));

    let store = Arc::new(MemoryStore::new());
    let gateway = Arc::new(PersistenceGateway::new(store.clone(), &group));
    let mut reconciler =
        Reconciler::new("ARCH:", cache, tree.clone(), RetryPolicy::default(), Arc::new(ShutdownSignal::new()))
            .unwrap();
    reconciler.register(group, gateway);

    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.unknown_keys(), vec!["Total PV count"]);
    assert_eq!(tree.value_of("ARCH:a0:TotalPvCount"), Some(TypedValue::Int(2)));
}

#[tokio::test]
async fn summary_group_stores_only_on_change() {
    let transport = appliance();
    let store = Arc::new(MemoryStore::new());
    let tree = Arc::new(ChannelTree::new());
    let mut config = config();
    config.appliance.summary_group = true;
    let bridge = Bridge::new(config, tree.clone(), transport.clone(), store.clone());
    let mut reconciler = bridge.bootstrap().await.expect("bootstrap");

    assert_eq!(reconciler.run_pass().await.unwrap().stores(), 2);
    for _ in 0..3 {
        let report = reconciler.run_pass().await.unwrap();
        assert_eq!(report.stores(), 0);
        assert_eq!(report.changed(), 0);
    }
    assert_eq!(tree.value_of("ARCH:appliance0:Status"), Some(TypedValue::Text("Working".into())));
    assert_eq!(
        tree.value_of("ARCH:Appliances:appliance0:Status"),
        Some(TypedValue::Text("Working".into()))
    );

    transport.set_json(
        &format!("{}{}", BASE, APPLIANCE_METRICS_PATH),
        r#"[{"instance": "appliance0", "status": "Stopped"}]"#,
    );
    let report = reconciler.run_pass().await.unwrap();
    assert_eq!(report.changed(), 1);
    assert_eq!(report.stores(), 1);
    assert_eq!(store.count(), 3);
}
