//! Data plane: one persistent connection to the control plane.
//!
//! The outer structure is a reconnect loop with bounded-exponential jittered
//! delay. Inside a connection three tasks run: the sole reader stages
//! inbound snapshots, the sole writer heartbeats the applied fingerprint,
//! and the applier feeds staged snapshots through the apply path. Any task
//! exiting tears the connection down and the loop starts over; a data plane
//! never misses anything across reconnects because the control plane always
//! opens with the latest snapshot.

use super::cache::LocalCache;
use super::hash;
use super::message::{BasicInfo, MessageError, Reconfigure};
use super::types::{
    PluginDescriptor, CLUSTERING_MAX_PAYLOAD, CLUSTERING_PATH, CLUSTERING_TIMEOUT, PING_INTERVAL,
    ZERO_HASH,
};
use crate::types::ConfigTable;
use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{watch, Notify};
use tokio::time::{sleep, timeout};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Declarative-config collaborator: parses and loads a tree into the
/// runtime cache under the given fingerprint.
pub trait DeclarativeConfig: Send + Sync + 'static {
    fn load(&self, tree: &ConfigTable, hash: &str) -> Result<(), BoxError>;
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("message: {0}")]
    Message(#[from] MessageError),
    #[error("control plane closed the channel: {0}")]
    Closed(&'static str),
}

// =============================================================================
// RECONNECT DELAY
// =============================================================================

const RECONNECT_JITTER_MIN: u64 = 5;
const RECONNECT_JITTER_MAX: u64 = 10;
const RECONNECT_DELAY_CAP: u64 = 60;

/// Bounded exponential backoff seeded from a 5..10s jitter window.
struct ReconnectDelay {
    attempts: u32,
}

impl ReconnectDelay {
    fn new() -> Self {
        Self { attempts: 0 }
    }

    fn next(&mut self) -> Duration {
        let base = rand::thread_rng().gen_range(RECONNECT_JITTER_MIN..=RECONNECT_JITTER_MAX);
        let delay = base
            .saturating_mul(1u64 << self.attempts.min(4))
            .min(RECONNECT_DELAY_CAP);
        self.attempts = self.attempts.saturating_add(1);
        Duration::from_secs(delay)
    }

    fn reset(&mut self) {
        self.attempts = 0;
    }
}

// =============================================================================
// DATA PLANE
// =============================================================================

struct DpState {
    applied_hash: Mutex<String>,
    next_config: Mutex<Option<ConfigTable>>,
    config_signal: Notify,
    ping_immediately: AtomicBool,
}

pub struct DataPlane {
    endpoint: String,
    server_name: ServerName<'static>,
    tls: Arc<ClientConfig>,
    node_id: String,
    hostname: String,
    version: String,
    plugins: Vec<PluginDescriptor>,
    declarative: Arc<dyn DeclarativeConfig>,
    cache: LocalCache,
    state: DpState,
    shutdown: watch::Receiver<bool>,
}

impl DataPlane {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        endpoint: String,
        server_name: ServerName<'static>,
        tls: Arc<ClientConfig>,
        node_id: String,
        hostname: String,
        version: String,
        plugins: Vec<PluginDescriptor>,
        declarative: Arc<dyn DeclarativeConfig>,
        cache: LocalCache,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            endpoint,
            server_name,
            tls,
            node_id,
            hostname,
            version,
            plugins,
            declarative,
            cache,
            state: DpState {
                applied_hash: Mutex::new(ZERO_HASH.to_string()),
                next_config: Mutex::new(None),
                config_signal: Notify::new(),
                ping_immediately: AtomicBool::new(false),
            },
            shutdown,
        }
    }

    /// Fingerprint of the currently applied configuration.
    pub fn applied_hash(&self) -> String {
        self.state.applied_hash.lock().unwrap().clone()
    }

    /// Cold-start path: feed the on-disk snapshot through the apply path
    /// before the first connection attempt. Any failure just means we wait
    /// for the control plane to deliver a fresh snapshot.
    pub fn warm_from_cache(&self) {
        match self.cache.load() {
            Ok(Some(tree)) => match self.update_config(&tree, false) {
                Ok(true) => info!(
                    hash = %self.applied_hash(),
                    "applied cached configuration from {}",
                    self.cache.path().display()
                ),
                Ok(false) => {}
                Err(e) => warn!("cached configuration rejected: {e}"),
            },
            Ok(None) => debug!("no cached configuration"),
            Err(e) => warn!("cached configuration unreadable: {e}"),
        }
    }

    /// Reconnect loop. Runs until shutdown.
    pub async fn run(self: Arc<Self>) {
        self.warm_from_cache();
        let mut shutdown = self.shutdown.clone();
        let mut delay = ReconnectDelay::new();
        loop {
            if *shutdown.borrow_and_update() {
                return;
            }
            match self.clone().connect_and_run().await {
                Ok(()) => {
                    info!("control plane connection closed");
                    delay.reset();
                }
                Err(e) => warn!("control plane connection failed: {e}"),
            }
            if *shutdown.borrow_and_update() {
                return;
            }
            let wait = delay.next();
            info!("reconnecting to control plane in {}s", wait.as_secs());
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    async fn connect_and_run(self: Arc<Self>) -> Result<(), ClientError> {
        let tcp = TcpStream::connect(&self.endpoint).await?;
        let connector = TlsConnector::from(self.tls.clone());
        let tls = connector.connect(self.server_name.clone(), tcp).await?;

        let url = format!(
            "wss://{}{}?node_id={}&node_hostname={}&node_version={}",
            self.endpoint, CLUSTERING_PATH, self.node_id, self.hostname, self.version
        );
        let request = url.into_client_request()?;
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(CLUSTERING_MAX_PAYLOAD))
            .max_frame_size(Some(CLUSTERING_MAX_PAYLOAD));
        let (ws, _) = tokio_tungstenite::client_async_with_config(request, tls, Some(ws_config)).await?;
        let (mut sink, mut stream) = ws.split();

        let basic_info = BasicInfo { plugins: self.plugins.clone() };
        sink.send(Message::Binary(basic_info.to_json()?.into())).await?;
        info!(endpoint = %self.endpoint, "connected to control plane");

        // First heartbeat goes out promptly so the control plane records us
        // without waiting a full ping interval.
        self.state.ping_immediately.store(true, Ordering::SeqCst);
        let mut writer = tokio::spawn(ping_loop(sink, self.clone()));
        let mut applier = tokio::spawn(apply_loop(self.clone()));

        let result = tokio::select! {
            read = self.read_loop(&mut stream) => read,
            write = &mut writer => write.unwrap_or(Ok(())),
            apply = &mut applier => apply.unwrap_or(Ok(())),
        };
        writer.abort();
        applier.abort();
        result
    }

    /// Sole reader. Binary frames stage the next snapshot for the applier;
    /// the staging slot holds one tree, a newer snapshot replaces an
    /// un-applied older one.
    async fn read_loop(
        &self,
        stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
    ) -> Result<(), ClientError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            match timeout(CLUSTERING_TIMEOUT, stream.next()).await {
                Err(_) => continue,
                Ok(None) => return Err(ClientError::Closed("stream ended")),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(Message::Binary(data)))) => {
                    let envelope = Reconfigure::inflate(&data)?;
                    debug!("received config push ({} bytes deflated)", data.len());
                    *self.state.next_config.lock().unwrap() = Some(envelope.config_table);
                    self.state.config_signal.notify_one();
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    debug!("close frame: {frame:?}");
                    return Err(ClientError::Closed("close frame"));
                }
                // Pong replies to our heartbeats carry nothing we act on.
                Ok(Some(Ok(Message::Pong(_)))) => {}
                Ok(Some(Ok(other))) => {
                    warn!("ignoring unexpected frame from control plane: {other:?}");
                }
            }
        }
    }

    /// Apply path. No-ops when the fingerprint already matches; on success
    /// persists the raw tree (cache write failures are logged, the apply
    /// still counts) and returns whether anything changed.
    pub fn update_config(&self, tree: &ConfigTable, persist: bool) -> Result<bool, BoxError> {
        let new_hash = hash::config_hash(tree);
        if *self.state.applied_hash.lock().unwrap() == new_hash {
            debug!(hash = %new_hash, "configuration unchanged");
            return Ok(false);
        }
        self.declarative.load(tree, &new_hash)?;
        *self.state.applied_hash.lock().unwrap() = new_hash;
        if persist {
            if let Err(e) = self.cache.store(tree) {
                error!("failed to persist configuration cache: {e}");
            }
        }
        Ok(true)
    }
}

/// Sole writer. Heartbeats the applied fingerprint every ping interval,
/// sleeping in 1-second ticks so shutdown and a fresh apply cut the wait
/// short.
async fn ping_loop(
    mut sink: impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    dp: Arc<DataPlane>,
) -> Result<(), ClientError> {
    let mut shutdown = dp.shutdown.clone();
    loop {
        let mut waited = 0;
        while waited < PING_INTERVAL.as_secs() {
            sleep(Duration::from_secs(1)).await;
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            if dp.state.ping_immediately.swap(false, Ordering::SeqCst) {
                break;
            }
            waited += 1;
        }
        let hash = dp.applied_hash();
        sink.send(Message::Ping(Bytes::from(hash.into_bytes()))).await?;
    }
}

/// Applier. Waits on the coalescing signal, takes the staged tree and runs
/// the apply path; a failed apply keeps the previous configuration and the
/// staged slot stays cleared.
async fn apply_loop(dp: Arc<DataPlane>) -> Result<(), ClientError> {
    loop {
        dp.state.config_signal.notified().await;
        if *dp.shutdown.borrow() {
            return Ok(());
        }
        let Some(tree) = dp.state.next_config.lock().unwrap().take() else {
            continue;
        };
        match dp.update_config(&tree, true) {
            Ok(true) => {
                dp.state.ping_immediately.store(true, Ordering::SeqCst);
                info!(hash = %dp.applied_hash(), "configuration applied");
            }
            Ok(false) => {}
            Err(e) => error!("declarative load failed, keeping previous configuration: {e}"),
        }
    }
}
