//! Control plane: per-peer sessions and the process-wide peer registry.
//!
//! Each accepted connection runs through the TLS gate, the handshake URL
//! check, the `basic_info` exchange and the version gate before it is
//! registered. A registered session owns exactly two tasks: the sole reader
//! (heartbeats, liveness) and the sole writer (queue drain). Either task
//! exiting tears the session down.

use super::compat::{self, CompatError};
use super::message::{BasicInfo, Outbound};
use super::snapshot::{ConfigSource, SnapshotCache, SnapshotError};
use super::status::{StatusStore, StoreError};
use super::tls::{TlsError, TlsGate};
use super::types::{
    PeerRecord, PluginInventory, SyncStatus, inventory_from, CLUSTERING_MAX_PAYLOAD,
    CLUSTERING_PATH, CLUSTERING_TIMEOUT, PING_WAIT,
};
use crate::types::now;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Bytes, Message};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("tls: {0}")]
    Tls(#[from] TlsError),
    #[error("websocket: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("compatibility: {0}")]
    Compat(#[from] CompatError),
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("status store: {0}")]
    Store(#[from] StoreError),
    #[error("no ping within liveness window")]
    LivenessExpired,
}

// =============================================================================
// PEER REGISTRY
// =============================================================================

/// Handle to one registered data plane session.
pub struct PeerHandle {
    pub id: String,
    outbound: mpsc::UnboundedSender<Outbound>,
}

/// Registry of connected peers. Sessions register after the version gate and
/// deregister on teardown; the broadcast loop iterates it to fan a payload
/// out. Locked only for short, non-awaiting critical sections.
#[derive(Clone, Default)]
pub struct PeerRegistry {
    inner: Arc<Mutex<HashMap<u64, PeerHandle>>>,
    next_id: Arc<AtomicU64>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue one payload to every registered session. Sessions whose
    /// writer already went away are skipped; teardown will reap them.
    pub fn broadcast(&self, payload: Bytes) -> usize {
        let peers = self.inner.lock().unwrap();
        peers
            .values()
            .filter(|handle| {
                handle
                    .outbound
                    .send(Outbound::Payload(payload.clone()))
                    .is_ok()
            })
            .count()
    }

    fn register(&self, handle: PeerHandle) -> u64 {
        let session = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.lock().unwrap().insert(session, handle);
        session
    }

    fn deregister(&self, session: u64) {
        self.inner.lock().unwrap().remove(&session);
    }
}

// =============================================================================
// SESSION STATE
// =============================================================================

/// Handshake URL parameters. `node_id` and `node_version` are mandatory.
#[derive(Debug, Clone)]
struct HandshakeParams {
    id: String,
    hostname: String,
    version: String,
}

/// State shared between one session's reader and writer.
struct SessionShared {
    peer: String,
    params: HandshakeParams,
    ip: String,
    dp_plugins: PluginInventory,
    last_seen: AtomicU64,
    config_hash: Mutex<Option<String>>,
    sync_status: Mutex<SyncStatus>,
}

impl SessionShared {
    fn record(&self) -> PeerRecord {
        PeerRecord {
            id: self.params.id.clone(),
            hostname: self.params.hostname.clone(),
            ip: self.ip.clone(),
            version: self.params.version.clone(),
            last_seen: self.last_seen.load(Ordering::Relaxed),
            config_hash: self.config_hash.lock().unwrap().clone(),
            sync_status: *self.sync_status.lock().unwrap(),
        }
    }
}

// =============================================================================
// CONTROL PLANE
// =============================================================================

pub struct ControlPlane {
    pub version: String,
    pub plugins: PluginInventory,
    pub registry: PeerRegistry,
    pub snapshot: Arc<SnapshotCache>,
    pub source: Arc<dyn ConfigSource>,
    pub status: Arc<StatusStore>,
    pub gate: Arc<TlsGate>,
    pub shutdown: watch::Receiver<bool>,
}

impl ControlPlane {
    /// Accept loop. Each connection gets its own task; the loop itself only
    /// stops on shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("control plane listener stopping");
                        return;
                    }
                }
                accepted = listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("accept failed: {e}");
                            continue;
                        }
                    };
                    let cp = self.clone();
                    tokio::spawn(async move {
                        match cp.handle_connection(stream, addr).await {
                            Ok(()) => debug!(%addr, "session closed"),
                            Err(e) => info!(%addr, "session ended: {e}"),
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), SessionError> {
        // Identity first: no peer record exists for a connection that fails
        // the TLS gate.
        let tls_stream = self.gate.accept(stream).await?;
        let chain: Vec<_> = tls_stream
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();
        self.gate.verify_revocation(&chain).await?;

        // Handshake URL. Missing node_id or node_version is a 400.
        let captured: Arc<Mutex<Option<HandshakeParams>>> = Arc::new(Mutex::new(None));
        let slot = captured.clone();
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            match parse_handshake(req) {
                Ok(params) => {
                    *slot.lock().unwrap() = Some(params);
                    Ok(resp)
                }
                Err(reason) => Err(Response::builder()
                    .status(400)
                    .body(Some(reason))
                    .expect("static error response")),
            }
        };
        let ws_config = WebSocketConfig::default()
            .max_message_size(Some(CLUSTERING_MAX_PAYLOAD))
            .max_frame_size(Some(CLUSTERING_MAX_PAYLOAD));
        let ws = tokio_tungstenite::accept_hdr_async_with_config(
            tls_stream,
            callback,
            Some(ws_config),
        )
        .await?;
        let params = captured
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| SessionError::Protocol("handshake rejected".into()))?;
        let peer = format!("{}@{}", params.id, addr.ip());
        info!(%peer, version = %params.version, "data plane connected");

        let (mut sink, mut source_stream) = ws.split();

        // First application frame must be the plugin inventory.
        let basic_info = match timeout(CLUSTERING_TIMEOUT, source_stream.next()).await {
            Ok(Some(Ok(Message::Binary(data)))) => BasicInfo::from_json(&data)
                .map_err(|e| SessionError::Protocol(format!("bad basic_info: {e}"))),
            Ok(Some(Ok(other))) => Err(SessionError::Protocol(format!(
                "expected basic_info, got {} frame",
                frame_kind(&other)
            ))),
            Ok(Some(Err(e))) => Err(SessionError::Ws(e)),
            Ok(None) => Err(SessionError::Protocol("closed before basic_info".into())),
            Err(_) => Err(SessionError::Protocol("no basic_info within timeout".into())),
        };
        let basic_info = match basic_info {
            Ok(info) => info,
            Err(e) => {
                error!(%peer, "{e}");
                let _ = sink
                    .send(close_frame(CloseCode::Protocol, "invalid handshake"))
                    .await;
                return Err(e);
            }
        };
        let dp_plugins = inventory_from(basic_info.plugins);

        // Version gate. A failure is recorded before the channel closes so
        // operators can see why the peer never syncs.
        let shared = Arc::new(SessionShared {
            peer: peer.clone(),
            ip: addr.ip().to_string(),
            params,
            dp_plugins,
            last_seen: AtomicU64::new(now()),
            config_hash: Mutex::new(None),
            sync_status: Mutex::new(SyncStatus::Unknown),
        });
        match compat::check_version(
            &peer,
            &self.version,
            &shared.params.version,
            &self.plugins,
            &shared.dp_plugins,
        ) {
            Ok(status) => *shared.sync_status.lock().unwrap() = status,
            Err(e) => {
                error!(%peer, "rejecting data plane: {e}");
                *shared.sync_status.lock().unwrap() = e.sync_status();
                self.status.upsert(shared.record())?;
                let _ = sink
                    .send(close_frame(CloseCode::Policy, "version incompatible"))
                    .await;
                return Err(e.into());
            }
        }

        // Register and push the current snapshot as the first outbound item.
        let (tx, rx) = mpsc::unbounded_channel();
        match self.snapshot.ensure(self.source.as_ref()).await {
            Ok(prepared) => {
                let _ = tx.send(Outbound::Payload(prepared.payload));
            }
            Err(e) => error!(%peer, "initial snapshot unavailable: {e}"),
        }
        let session = self.registry.register(PeerHandle {
            id: shared.params.id.clone(),
            outbound: tx.clone(),
        });

        let mut writer = tokio::spawn(write_loop(
            sink,
            rx,
            shared.clone(),
            self.snapshot.clone(),
            self.plugins.clone(),
        ));

        let result = tokio::select! {
            read = self.read_loop(&mut source_stream, &shared, &tx) => read,
            write = &mut writer => write.unwrap_or(Ok(())),
        };

        self.registry.deregister(session);
        writer.abort();
        result
    }

    /// Sole reader. Valid inbound traffic is pings (fingerprint heartbeats)
    /// and close frames; everything else is a protocol violation.
    async fn read_loop(
        &self,
        stream: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
                  + Unpin),
        shared: &SessionShared,
        outbound: &mpsc::UnboundedSender<Outbound>,
    ) -> Result<(), SessionError> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            match timeout(CLUSTERING_TIMEOUT, stream.next()).await {
                Err(_) => {
                    let idle = now().saturating_sub(shared.last_seen.load(Ordering::Relaxed));
                    if idle > PING_WAIT.as_secs() {
                        warn!(peer = %shared.peer, "no ping for {idle}s, dropping session");
                        return Err(SessionError::LivenessExpired);
                    }
                }
                Ok(None) => return Ok(()),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(Message::Ping(body)))) => {
                    shared.last_seen.store(now(), Ordering::Relaxed);
                    let hash = String::from_utf8_lossy(&body).into_owned();
                    *shared.config_hash.lock().unwrap() =
                        (!hash.is_empty()).then_some(hash);
                    self.status.upsert(shared.record())?;
                    let _ = outbound.send(Outbound::Pong);
                }
                Ok(Some(Ok(Message::Close(_)))) => return Ok(()),
                Ok(Some(Ok(other))) => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected {} frame from data plane",
                        frame_kind(&other)
                    )));
                }
            }
        }
    }
}

/// Sole writer. Pongs go out as-is; payloads pass the configuration gate
/// for this specific peer first. An incompatible peer keeps its connection,
/// only the push is dropped.
async fn write_loop(
    mut sink: impl futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    shared: Arc<SessionShared>,
    snapshot: Arc<SnapshotCache>,
    cp_plugins: PluginInventory,
) -> Result<(), SessionError> {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Pong => sink.send(Message::Pong(Bytes::new())).await?,
            Outbound::Payload(payload) => {
                let configured = snapshot
                    .current()
                    .await
                    .map(|s| s.configured_plugins)
                    .unwrap_or_default();
                match compat::check_configuration(&configured, &cp_plugins, &shared.dp_plugins) {
                    Ok(()) => {
                        *shared.sync_status.lock().unwrap() = SyncStatus::Normal;
                        sink.send(Message::Binary(payload)).await?;
                        debug!(peer = %shared.peer, "config pushed");
                    }
                    Err(e) => {
                        *shared.sync_status.lock().unwrap() = e.sync_status();
                        warn!(peer = %shared.peer, "config push suppressed: {e}");
                    }
                }
            }
        }
    }
    Ok(())
}

fn close_frame(code: CloseCode, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame { code, reason: reason.into() }))
}

fn frame_kind(message: &Message) -> &'static str {
    match message {
        Message::Text(_) => "text",
        Message::Binary(_) => "binary",
        Message::Ping(_) => "ping",
        Message::Pong(_) => "pong",
        Message::Close(_) => "close",
        Message::Frame(_) => "raw",
    }
}

/// Extract and validate the handshake URL parameters.
fn parse_handshake(req: &Request) -> Result<HandshakeParams, String> {
    if req.uri().path() != CLUSTERING_PATH {
        return Err(format!("unknown path {}", req.uri().path()));
    }
    let mut id = None;
    let mut hostname = None;
    let mut version = None;
    for pair in req.uri().query().unwrap_or_default().split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        match key {
            "node_id" => id = non_empty(value),
            "node_hostname" => hostname = non_empty(value),
            "node_version" => version = non_empty(value),
            _ => {}
        }
    }
    let id = id.ok_or("node_id required")?;
    let version = version.ok_or("node_version required")?;
    Ok(HandshakeParams {
        id,
        hostname: hostname.unwrap_or_else(|| "unknown".to_string()),
        version,
    })
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uri: &str) -> Request {
        Request::builder().uri(uri).body(()).unwrap()
    }

    #[test]
    fn handshake_requires_id_and_version() {
        assert!(parse_handshake(&request(
            "wss://cp/v1/outlet?node_id=a&node_version=3.0.0"
        ))
        .is_ok());
        assert!(parse_handshake(&request("wss://cp/v1/outlet?node_version=3.0.0")).is_err());
        assert!(parse_handshake(&request("wss://cp/v1/outlet?node_id=a")).is_err());
        assert!(parse_handshake(&request("wss://cp/v1/outlet?node_id=&node_version=3.0.0")).is_err());
    }

    #[test]
    fn handshake_rejects_other_paths() {
        assert!(parse_handshake(&request("wss://cp/v2/outlet?node_id=a&node_version=1.0.0")).is_err());
    }

    #[test]
    fn handshake_defaults_hostname() {
        let params = parse_handshake(&request(
            "wss://cp/v1/outlet?node_id=a&node_version=3.0.0",
        ))
        .unwrap();
        assert_eq!(params.hostname, "unknown");
    }

    #[test]
    fn registry_broadcast_counts_live_peers() {
        let registry = PeerRegistry::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();
        registry.register(PeerHandle { id: "a".into(), outbound: tx_a });
        registry.register(PeerHandle { id: "b".into(), outbound: tx_b });
        drop(rx_b);

        let sent = registry.broadcast(Bytes::from_static(b"payload"));
        assert_eq!(sent, 1);
        assert!(matches!(rx_a.try_recv().unwrap(), Outbound::Payload(_)));
    }

    #[test]
    fn registry_deregister_removes_session() {
        let registry = PeerRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = registry.register(PeerHandle { id: "a".into(), outbound: tx });
        assert_eq!(registry.len(), 1);
        registry.deregister(session);
        assert!(registry.is_empty());
    }
}
