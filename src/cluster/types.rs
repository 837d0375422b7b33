//! Cluster protocol constants and types shared by both roles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// =============================================================================
// PROTOCOL IDENTIFICATION
// =============================================================================

/// Handshake path a data plane connects to on the control plane.
pub const CLUSTERING_PATH: &str = "/v1/outlet";

/// SNI presented by the data plane when both sides share one cluster
/// certificate. A fixed name because the pinned certificate is not tied to
/// any real hostname.
pub const SHARED_SERVER_NAME: &str = "kong_clustering";

// =============================================================================
// TIMING
// =============================================================================

/// Heartbeat interval. The data plane sends a ping carrying its applied
/// fingerprint this often.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Liveness window: a peer is dead after 1.5 ping intervals without a ping.
pub const PING_WAIT: Duration = Duration::from_secs(PING_INTERVAL.as_secs() * 3 / 2);

/// Per-frame I/O timeout on the channel.
pub const CLUSTERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Upper bound on a single inbound frame. Snapshots are gzip-deflated JSON;
/// 4 MiB covers large configurations with headroom.
pub const CLUSTERING_MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Bound on the whole OCSP exchange during the handshake gate.
pub const OCSP_TIMEOUT: Duration = Duration::from_secs(10);

/// Peer records expire this long after the last heartbeat unless configured
/// otherwise (14 days).
pub const DEFAULT_PURGE_DELAY: u64 = 14 * 24 * 60 * 60;

/// Default minimum quiet period between two broadcasts, in seconds.
pub const DEFAULT_DB_UPDATE_FREQUENCY: u64 = 30;

// =============================================================================
// FINGERPRINT
// =============================================================================

/// Sentinel fingerprint a data plane advertises before its first apply.
pub const ZERO_HASH: &str = "00000000000000000000000000000000";

/// Width of a fingerprint in hex characters.
pub const HASH_LEN: usize = 32;

// =============================================================================
// VERSIONS
// =============================================================================

/// Dotted version split into numeric components. Only major and minor
/// participate in compatibility decisions; patch is informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct NodeVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl NodeVersion {
    /// Parse "3.4.1" (or "3.4", or "3.4.1.0-enterprise" style suffixes on
    /// the patch segment). Returns `None` unless both major and minor are
    /// present and numeric.
    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts
            .next()
            .map(|p| {
                let digits: String = p.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl fmt::Display for NodeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// =============================================================================
// PLUGINS
// =============================================================================

/// One plugin as advertised in the handshake `basic_info` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: Option<&str>) -> Self {
        Self { name: name.into(), version: version.map(str::to_owned) }
    }

    /// Parsed form of the advertised version, when present and well-formed.
    pub fn parsed_version(&self) -> Option<NodeVersion> {
        self.version.as_deref().and_then(NodeVersion::parse)
    }
}

/// Plugins known to one side, keyed by name.
pub type PluginInventory = BTreeMap<String, PluginDescriptor>;

/// Build an inventory from a descriptor list (the wire carries a list).
pub fn inventory_from(plugins: impl IntoIterator<Item = PluginDescriptor>) -> PluginInventory {
    plugins.into_iter().map(|p| (p.name.clone(), p)).collect()
}

// =============================================================================
// SYNC STATUS
// =============================================================================

/// Why (if) a peer is out of sync. Persisted verbatim in peer records, so
/// the wire spellings are load-bearing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "KONG_VERSION_INCOMPATIBLE")]
    VersionIncompatible,
    #[serde(rename = "PLUGIN_SET_INCOMPATIBLE")]
    PluginSetIncompatible,
    #[serde(rename = "PLUGIN_VERSION_INCOMPATIBLE")]
    PluginVersionIncompatible,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "UNKNOWN",
            SyncStatus::Normal => "NORMAL",
            SyncStatus::VersionIncompatible => "KONG_VERSION_INCOMPATIBLE",
            SyncStatus::PluginSetIncompatible => "PLUGIN_SET_INCOMPATIBLE",
            SyncStatus::PluginVersionIncompatible => "PLUGIN_VERSION_INCOMPATIBLE",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PEER RECORDS
// =============================================================================

/// Persisted view of one data plane, refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub version: String,
    pub last_seen: u64,
    /// Applied-config fingerprint; absent until the peer reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub sync_status: SyncStatus,
}
