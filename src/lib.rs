pub mod cluster;
pub mod config;
pub mod store;
pub mod types;

pub use cluster::{
    BroadcastHandle, Broadcaster, ControlPlane, DataPlane, DeclarativeConfig, LocalCache,
    PeerRegistry, SnapshotCache, StatusStore, SyncStatus, TlsGate, TlsIdentity,
};
pub use config::{ensure_node_id, ClusterConfig};
pub use store::{FileConfigSource, RuntimeCache};
pub use types::{now, now_f64, ConfigTable};
