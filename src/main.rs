//! Fleetsync node entry point.
//!
//! One binary, two roles. `fleetsync cp` serves the authoritative
//! configuration to connected data planes; `fleetsync dp` maintains the
//! connection, applies pushed snapshots and survives cold starts from its
//! local cache. On unix, SIGHUP tells a control plane to rebroadcast.

use clap::{Parser, Subcommand};
use fleetsync::cluster::types::{inventory_from, SHARED_SERVER_NAME};
use fleetsync::cluster::{
    client_config_pki, client_config_shared, load_ca, MtlsMode, TlsGate, TlsIdentity,
};
use fleetsync::{
    ensure_node_id, Broadcaster, ClusterConfig, ControlPlane, DataPlane, FileConfigSource,
    LocalCache, PeerRegistry, RuntimeCache, SnapshotCache, StatusStore,
};
use rustls::pki_types::ServerName;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "fleetsync", version, about = "Gateway fleet configuration distribution")]
struct Args {
    /// JSON config file; flags and defaults fill the rest
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Working directory override (status db, node id, snapshot cache)
    #[arg(short, long)]
    prefix: Option<PathBuf>,

    #[command(subcommand)]
    role: Role,
}

#[derive(Subcommand)]
enum Role {
    /// Run the control plane
    Cp {
        /// Declarative configuration file exported to data planes
        #[arg(short, long)]
        declarative: Option<PathBuf>,
    },
    /// Run a data plane
    Dp,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleetsync=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match ClusterConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load config: {e}");
                return;
            }
        },
        None => ClusterConfig::default(),
    };
    if let Some(prefix) = args.prefix {
        config.prefix = prefix;
    }
    if let Err(e) = std::fs::create_dir_all(&config.prefix) {
        error!("cannot create prefix {}: {e}", config.prefix.display());
        return;
    }

    info!("════════════════════════════════════════════════════════════");
    info!("  Fleetsync v{VERSION} — gateway configuration distribution");
    info!("════════════════════════════════════════════════════════════");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let result = match args.role {
        Role::Cp { declarative } => {
            run_control_plane(config, declarative, shutdown_tx, shutdown_rx).await
        }
        Role::Dp => run_data_plane(config, shutdown_tx, shutdown_rx).await,
    };
    if let Err(e) = result {
        error!("fatal: {e}");
    }
}

async fn run_control_plane(
    config: ClusterConfig,
    declarative: Option<PathBuf>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = TlsIdentity::load(&config.cluster_cert, &config.cluster_cert_key)?;
    let gate = match config.cluster_mtls {
        MtlsMode::Shared => {
            info!("cluster mtls: shared certificate, pin {}", identity.leaf_fingerprint());
            TlsGate::shared(identity)?
        }
        MtlsMode::Pki => {
            let ca_path = config.cluster_ca_cert.as_ref().expect("validated");
            let roots = load_ca(ca_path)?;
            info!("cluster mtls: pki, ocsp {:?}", config.cluster_ocsp);
            TlsGate::pki(identity, roots, config.cluster_ocsp)?
        }
    };

    let db = sled::open(config.prefix.join("status.db"))?;
    let status = Arc::new(StatusStore::open(&db, config.purge_delay())?);
    let declarative =
        declarative.unwrap_or_else(|| config.prefix.join("declarative.json"));
    info!("authoritative configuration: {}", declarative.display());
    let source = Arc::new(FileConfigSource::new(declarative));
    let snapshot = Arc::new(SnapshotCache::new());
    let registry = PeerRegistry::new();

    let broadcaster = Broadcaster::new(
        registry.clone(),
        snapshot.clone(),
        source.clone(),
        config.update_frequency(),
        shutdown_rx.clone(),
    );
    let changes = broadcaster.handle();

    #[cfg(unix)]
    {
        let changes = changes.clone();
        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
        tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                info!("SIGHUP: rebroadcasting configuration");
                changes.notify_change();
            }
        });
    }

    let control_plane = Arc::new(ControlPlane {
        version: VERSION.to_string(),
        plugins: inventory_from(config.plugins.clone()),
        registry: registry.clone(),
        snapshot,
        source,
        status: status.clone(),
        gate: Arc::new(gate),
        shutdown: shutdown_rx.clone(),
    });
    let listener = TcpListener::bind(&config.cluster_listen).await?;
    info!("control plane listening on {}", config.cluster_listen);

    let push_loop = tokio::spawn(broadcaster.run());
    let accept_loop = tokio::spawn(control_plane.run(listener));

    // Status printer
    {
        let registry = registry.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = interval.tick() => info!("status: {} data planes connected", registry.len()),
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    shutdown_tx.send(true).ok();
    push_loop.await.ok();
    accept_loop.await.ok();
    Ok(())
}

async fn run_data_plane(
    config: ClusterConfig,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error>> {
    let identity = TlsIdentity::load(&config.cluster_cert, &config.cluster_cert_key)?;
    let (tls, server_name) = match config.cluster_mtls {
        MtlsMode::Shared => (
            client_config_shared(identity)?,
            ServerName::try_from(SHARED_SERVER_NAME.to_string())?,
        ),
        MtlsMode::Pki => {
            let ca_path = config.cluster_ca_cert.as_ref().expect("validated");
            let name = config
                .cluster_server_name
                .clone()
                .unwrap_or_else(|| config.control_plane_host().to_string());
            (
                client_config_pki(identity, load_ca(ca_path)?)?,
                ServerName::try_from(name)?,
            )
        }
    };

    let node_id = match &config.node_id {
        Some(id) => id.clone(),
        None => ensure_node_id(&config.prefix)?,
    };
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    info!(%node_id, %hostname, "data plane identity");

    let runtime = Arc::new(RuntimeCache::new());
    let data_plane = Arc::new(DataPlane::new(
        config.cluster_control_plane.clone(),
        server_name,
        Arc::new(tls),
        node_id,
        hostname,
        VERSION.to_string(),
        config.plugins.clone(),
        runtime,
        LocalCache::new(&config.prefix),
        shutdown_rx,
    ));

    let client = tokio::spawn(data_plane.run());

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down...");
    shutdown_tx.send(true).ok();
    client.await.ok();
    Ok(())
}
