//! Node configuration.
//!
//! One struct serves both roles; a JSON config file seeds it and CLI flags
//! override individual fields. Field names follow the cluster option names
//! operators already know.

use crate::cluster::tls::{MtlsMode, OcspPolicy};
use crate::cluster::types::{PluginDescriptor, DEFAULT_DB_UPDATE_FREQUENCY, DEFAULT_PURGE_DELAY};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("cluster_mtls = pki requires cluster_ca_cert")]
    MissingCa,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Control plane endpoint a data plane connects to.
    pub cluster_control_plane: String,
    /// Listen address for the control plane role.
    pub cluster_listen: String,
    pub cluster_mtls: MtlsMode,
    pub cluster_cert: PathBuf,
    pub cluster_cert_key: PathBuf,
    pub cluster_ca_cert: Option<PathBuf>,
    pub cluster_ocsp: OcspPolicy,
    /// SNI override when connecting in pki mode.
    pub cluster_server_name: Option<String>,
    /// TTL of control-plane peer records, in seconds.
    pub cluster_data_plane_purge_delay: u64,
    /// Minimum quiet period between broadcasts, in seconds.
    pub db_update_frequency: u64,
    /// Working directory: status db, node id, snapshot cache.
    pub prefix: PathBuf,
    /// Stable node identity; generated and persisted when unset.
    pub node_id: Option<String>,
    /// Plugins installed on this node, advertised during the handshake.
    pub plugins: Vec<PluginDescriptor>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_control_plane: "127.0.0.1:8005".to_string(),
            cluster_listen: "0.0.0.0:8005".to_string(),
            cluster_mtls: MtlsMode::Shared,
            cluster_cert: PathBuf::from("cluster.crt"),
            cluster_cert_key: PathBuf::from("cluster.key"),
            cluster_ca_cert: None,
            cluster_ocsp: OcspPolicy::Off,
            cluster_server_name: None,
            cluster_data_plane_purge_delay: DEFAULT_PURGE_DELAY,
            db_update_frequency: DEFAULT_DB_UPDATE_FREQUENCY,
            prefix: PathBuf::from("."),
            node_id: None,
            plugins: Vec::new(),
        }
    }
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let bytes = fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster_mtls == MtlsMode::Pki && self.cluster_ca_cert.is_none() {
            return Err(ConfigError::MissingCa);
        }
        Ok(())
    }

    pub fn purge_delay(&self) -> Duration {
        Duration::from_secs(self.cluster_data_plane_purge_delay)
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.db_update_frequency)
    }

    /// Host part of the control plane endpoint, for SNI fallback.
    pub fn control_plane_host(&self) -> &str {
        self.cluster_control_plane
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(&self.cluster_control_plane)
    }
}

/// Stable node identity under the prefix: read `node.id`, or generate a
/// 32-hex id and persist it so restarts keep the same identity.
pub fn ensure_node_id(prefix: &Path) -> Result<String, ConfigError> {
    let path = prefix.join("node.id");
    match fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let mut raw = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut raw);
    let id = hex::encode(raw);
    fs::write(&path, &id)?;
    Ok(id)
}
