//! Cluster configuration distribution layer.
//!
//! One control plane holds the authoritative configuration and pushes
//! compressed snapshots to many data planes over an mTLS WebSocket channel;
//! data planes heartbeat their applied fingerprint back and survive cold
//! starts from a local snapshot cache.

pub mod broadcast;
pub mod cache;
pub mod compat;
pub mod control_plane;
pub mod data_plane;
pub mod hash;
pub mod message;
pub mod ocsp;
pub mod snapshot;
pub mod status;
pub mod tls;
pub mod types;

// Re-exports
pub use broadcast::{BroadcastHandle, Broadcaster};
pub use cache::{CacheError, LocalCache, CACHE_FILE};
pub use compat::{check_configuration, check_version, CompatError};
pub use control_plane::{ControlPlane, PeerRegistry, SessionError};
pub use data_plane::{ClientError, DataPlane, DeclarativeConfig};
pub use hash::{canonical, config_hash};
pub use message::{BasicInfo, MessageError, Outbound, Reconfigure};
pub use ocsp::{OcspError, RevocationStatus};
pub use snapshot::{ConfigSource, PreparedSnapshot, SnapshotCache, SnapshotError};
pub use status::{StatusStore, StoreError};
pub use tls::{
    client_config_pki, client_config_shared, leaf_fingerprint, load_ca, MtlsMode, OcspPolicy,
    TlsError, TlsGate, TlsIdentity,
};
pub use types::*;
