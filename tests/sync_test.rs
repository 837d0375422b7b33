//! End-to-end cluster sync tests over loopback TLS.
//!
//! Each test boots a real control plane on an ephemeral port and drives a
//! real data plane client against it using a shared self-signed certificate.
//! The full path (TLS pin, websocket handshake, basic_info, version gate,
//! snapshot push, apply, heartbeat) is exercised in process.

use fleetsync::cluster::control_plane::ControlPlane;
use fleetsync::cluster::data_plane::DataPlane;
use fleetsync::cluster::tls::{client_config_shared, TlsGate, TlsIdentity};
use fleetsync::cluster::types::{inventory_from, PluginDescriptor, SyncStatus, ZERO_HASH};
use fleetsync::cluster::{config_hash, Broadcaster, LocalCache, PeerRegistry, SnapshotCache, StatusStore};
use fleetsync::{FileConfigSource, RuntimeCache};
use rustls::pki_types::{PrivateKeyDer, ServerName};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;

fn shared_identity() -> (TlsIdentity, TlsIdentity) {
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = rcgen::CertificateParams::new(vec!["cluster.test".to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();
    let make = || TlsIdentity {
        certs: vec![cert.der().clone()],
        key: PrivateKeyDer::try_from(key.serialize_der()).unwrap(),
    };
    (make(), make())
}

fn write_declarative(dir: &Path, tree: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.join("declarative.json");
    fs::write(&path, serde_json::to_vec(tree).unwrap()).unwrap();
    path
}

struct TestControlPlane {
    addr: String,
    registry: PeerRegistry,
    status: Arc<StatusStore>,
    broadcaster_handle: fleetsync::BroadcastHandle,
    shutdown: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

async fn start_control_plane(
    identity: TlsIdentity,
    tree: &serde_json::Value,
    cp_plugins: Vec<PluginDescriptor>,
) -> TestControlPlane {
    let dir = tempfile::tempdir().unwrap();
    let declarative = write_declarative(dir.path(), tree);
    let db = sled::open(dir.path().join("status.db")).unwrap();
    let status = Arc::new(StatusStore::open(&db, Duration::from_secs(300)).unwrap());
    let source = Arc::new(FileConfigSource::new(declarative));
    let snapshot = Arc::new(SnapshotCache::new());
    let registry = PeerRegistry::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let broadcaster = Broadcaster::new(
        registry.clone(),
        snapshot.clone(),
        source.clone(),
        Duration::from_secs(1),
        shutdown_rx.clone(),
    );
    let broadcaster_handle = broadcaster.handle();
    tokio::spawn(broadcaster.run());

    let control_plane = Arc::new(ControlPlane {
        version: "3.0.0".to_string(),
        plugins: inventory_from(cp_plugins),
        registry: registry.clone(),
        snapshot,
        source,
        status: status.clone(),
        gate: Arc::new(TlsGate::shared(identity).unwrap()),
        shutdown: shutdown_rx,
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(control_plane.run(listener));

    TestControlPlane {
        addr,
        registry,
        status,
        broadcaster_handle,
        shutdown: shutdown_tx,
        _dir: dir,
    }
}

struct TestDataPlane {
    dp: Arc<DataPlane>,
    runtime: Arc<RuntimeCache>,
    shutdown: watch::Sender<bool>,
    dir: tempfile::TempDir,
}

fn build_data_plane(
    identity: TlsIdentity,
    addr: &str,
    version: &str,
    plugins: Vec<PluginDescriptor>,
) -> TestDataPlane {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(RuntimeCache::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let dp = Arc::new(DataPlane::new(
        addr.to_string(),
        ServerName::try_from("127.0.0.1").unwrap(),
        Arc::new(client_config_shared(identity).unwrap()),
        "node-e2e".to_string(),
        "dp-e2e.internal".to_string(),
        version.to_string(),
        plugins,
        runtime.clone(),
        LocalCache::new(dir.path()),
        shutdown_rx,
    ));
    TestDataPlane { dp, runtime, shutdown: shutdown_tx, dir }
}

/// Poll until `check` passes or the budget runs out.
async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..150 {
        if check() {
            return;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_syncs_and_heartbeats() {
    let (cp_identity, dp_identity) = shared_identity();
    let tree = json!({
        "_format_version": "3.0",
        "services": [{"name": "s1", "host": "upstream.internal"}],
        "plugins": [{"name": "key-auth", "service": "s1"}],
    });
    let expected_hash = config_hash(&tree);

    let plugins = vec![PluginDescriptor::new("key-auth", Some("3.0.0"))];
    let cp = start_control_plane(cp_identity, &tree, plugins.clone()).await;
    let dp = build_data_plane(dp_identity, &cp.addr, "3.0.0", plugins);

    tokio::spawn(dp.dp.clone().run());

    wait_for("configuration applied", || {
        dp.runtime.current_hash().as_deref() == Some(expected_hash.as_str())
    })
    .await;
    assert_eq!(dp.dp.applied_hash(), expected_hash);
    assert_eq!(cp.registry.len(), 1);

    // The post-apply heartbeat lands in the peer record.
    let status = cp.status.clone();
    let expected = expected_hash.clone();
    wait_for("heartbeat recorded", move || {
        status
            .get("node-e2e")
            .unwrap()
            .is_some_and(|r| r.config_hash.as_deref() == Some(expected.as_str()))
    })
    .await;
    let record = cp.status.get("node-e2e").unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Normal);
    assert_eq!(record.hostname, "dp-e2e.internal");
    assert_eq!(record.version, "3.0.0");

    // Applied snapshot was persisted for cold start.
    assert_eq!(
        LocalCache::new(dp.dir.path()).load().unwrap().unwrap(),
        tree
    );

    dp.shutdown.send(true).ok();
    cp.shutdown.send(true).ok();
}

#[tokio::test]
async fn major_version_mismatch_is_recorded_and_rejected() {
    let (cp_identity, dp_identity) = shared_identity();
    let tree = json!({"plugins": []});
    let cp = start_control_plane(cp_identity, &tree, vec![]).await;
    let dp = build_data_plane(dp_identity, &cp.addr, "2.8.1", vec![]);

    tokio::spawn(dp.dp.clone().run());

    let status = cp.status.clone();
    wait_for("incompatibility recorded", move || {
        status
            .get("node-e2e")
            .unwrap()
            .is_some_and(|r| r.sync_status == SyncStatus::VersionIncompatible)
    })
    .await;

    // No snapshot ever made it across.
    assert!(dp.runtime.current_hash().is_none());
    assert_eq!(dp.dp.applied_hash(), ZERO_HASH);

    dp.shutdown.send(true).ok();
    cp.shutdown.send(true).ok();
}

#[tokio::test]
async fn missing_configured_plugin_suppresses_push_but_keeps_connection() {
    let (cp_identity, dp_identity) = shared_identity();
    let tree = json!({
        "services": [{"name": "s1"}],
        "plugins": [{"name": "rate-limiting", "service": "s1"}],
    });
    let cp_plugins = vec![PluginDescriptor::new("rate-limiting", Some("3.0.0"))];
    let cp = start_control_plane(cp_identity, &tree, cp_plugins).await;
    // Data plane advertises no plugins at all.
    let dp = build_data_plane(dp_identity, &cp.addr, "3.0.0", vec![]);

    tokio::spawn(dp.dp.clone().run());

    wait_for("session registered", || cp.registry.len() == 1).await;

    // The push is dropped for this peer, the session stays up.
    sleep(Duration::from_secs(3)).await;
    assert!(dp.runtime.current_hash().is_none());
    assert_eq!(dp.dp.applied_hash(), ZERO_HASH);
    assert_eq!(cp.registry.len(), 1);

    dp.shutdown.send(true).ok();
    cp.shutdown.send(true).ok();
}

#[tokio::test]
async fn cold_start_applies_cache_before_any_connection() {
    let (_, dp_identity) = shared_identity();
    let tree = json!({"services": [{"name": "cached"}], "plugins": []});
    let expected_hash = config_hash(&tree);

    // Unreachable endpoint: the cache is the only config source.
    let dp = build_data_plane(dp_identity, "127.0.0.1:1", "3.0.0", vec![]);
    LocalCache::new(dp.dir.path()).store(&tree).unwrap();

    dp.dp.warm_from_cache();
    assert_eq!(dp.dp.applied_hash(), expected_hash);
    assert_eq!(dp.runtime.current_hash().as_deref(), Some(expected_hash.as_str()));
}

#[tokio::test]
async fn config_change_propagates_to_connected_peer() {
    let (cp_identity, dp_identity) = shared_identity();
    let v1 = json!({"plugins": [], "services": [{"name": "s1"}]});
    let cp = start_control_plane(cp_identity, &v1, vec![]).await;
    let dp = build_data_plane(dp_identity, &cp.addr, "3.0.0", vec![]);

    tokio::spawn(dp.dp.clone().run());
    let v1_hash = config_hash(&v1);
    wait_for("initial sync", || {
        dp.runtime.current_hash().as_deref() == Some(v1_hash.as_str())
    })
    .await;

    // Edit the authoritative store, then burst the change signal; the
    // coalesced push delivers the new tree.
    let v2 = json!({"plugins": [], "services": [{"name": "s1"}, {"name": "s2"}]});
    write_declarative(cp._dir.path(), &v2);
    for _ in 0..20 {
        cp.broadcaster_handle.notify_change();
    }

    let v2_hash = config_hash(&v2);
    wait_for("updated sync", || {
        dp.runtime.current_hash().as_deref() == Some(v2_hash.as_str())
    })
    .await;
    assert_eq!(dp.dp.applied_hash(), v2_hash);

    dp.shutdown.send(true).ok();
    cp.shutdown.send(true).ok();
}
