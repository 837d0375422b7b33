//! Version and plugin compatibility between control plane and data plane.
//!
//! Two gates with different severities. The version gate runs once at
//! handshake and may reject the connection outright. The configuration gate
//! runs before every push and only ever suppresses that push; an
//! incompatible peer stays connected so the operator can fix the fleet
//! without flapping.

use super::types::{NodeVersion, PluginInventory, SyncStatus};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompatError {
    #[error("version incompatible with control plane: {0}")]
    Version(String),
    #[error("configured plugin {0} is missing from data plane")]
    PluginMissing(String),
    #[error("plugin {name} version mismatch: control plane {cp}, data plane {dp}")]
    PluginVersion { name: String, cp: String, dp: String },
}

impl CompatError {
    /// Status code persisted in the peer record for this failure.
    pub fn sync_status(&self) -> SyncStatus {
        match self {
            CompatError::Version(_) => SyncStatus::VersionIncompatible,
            CompatError::PluginMissing(_) => SyncStatus::PluginSetIncompatible,
            CompatError::PluginVersion { .. } => SyncStatus::PluginVersionIncompatible,
        }
    }
}

/// Minor-version drift log ladder. Distance 0 logs nothing. The two top
/// rungs (notice, warn) both map to `warn!`; tracing has no notice level.
fn log_minor_drift(distance: u64, what: &str, peer: &str, cp: NodeVersion, dp: NodeVersion) {
    match distance {
        0 => {}
        1 => debug!(%peer, "{what} minor version differs: {cp} vs {dp}"),
        2 => info!(%peer, "{what} minor version differs: {cp} vs {dp}"),
        _ => warn!(%peer, "{what} minor version differs: {cp} vs {dp}"),
    }
}

/// Handshake gate. Fatal on unparseable versions or a major-version split;
/// everything else is advisory logging. Returns the status to persist.
pub fn check_version(
    peer: &str,
    cp_version: &str,
    dp_version: &str,
    cp_plugins: &PluginInventory,
    dp_plugins: &PluginInventory,
) -> Result<SyncStatus, CompatError> {
    let cp = NodeVersion::parse(cp_version)
        .ok_or_else(|| CompatError::Version(format!("unparseable control plane version {cp_version:?}")))?;
    let dp = NodeVersion::parse(dp_version)
        .ok_or_else(|| CompatError::Version(format!("unparseable data plane version {dp_version:?}")))?;

    if cp.major != dp.major {
        return Err(CompatError::Version(format!(
            "major version differs: control plane {cp}, data plane {dp}"
        )));
    }
    log_minor_drift(cp.minor.abs_diff(dp.minor), "node", peer, cp, dp);

    for (name, cp_plugin) in cp_plugins {
        let Some(dp_plugin) = dp_plugins.get(name) else {
            warn!(%peer, "plugin {name} is missing from data plane");
            continue;
        };
        match (cp_plugin.parsed_version(), dp_plugin.parsed_version()) {
            (Some(cpv), Some(dpv)) => {
                if cpv.major != dpv.major {
                    warn!(%peer, "plugin {name} major version differs: {cpv} vs {dpv}");
                } else {
                    match cpv.minor.abs_diff(dpv.minor) {
                        0 => {}
                        1 => debug!(%peer, "plugin {name} minor version differs: {cpv} vs {dpv}"),
                        2 => info!(%peer, "plugin {name} minor version differs: {cpv} vs {dpv}"),
                        _ => warn!(%peer, "plugin {name} minor version differs: {cpv} vs {dpv}"),
                    }
                }
            }
            _ => warn!(%peer, "plugin {name} version unknown on one side"),
        }
    }

    Ok(SyncStatus::Normal)
}

/// Push gate. Every plugin that appears in the current configuration must
/// exist on the data plane with a matching major version.
pub fn check_configuration(
    configured: &BTreeSet<String>,
    cp_plugins: &PluginInventory,
    dp_plugins: &PluginInventory,
) -> Result<(), CompatError> {
    for name in configured {
        let Some(dp_plugin) = dp_plugins.get(name) else {
            return Err(CompatError::PluginMissing(name.clone()));
        };
        let cp_version = cp_plugins.get(name).and_then(|p| p.parsed_version());
        let dp_version = dp_plugin.parsed_version();
        if let (Some(cpv), Some(dpv)) = (cp_version, dp_version) {
            if cpv.major != dpv.major {
                return Err(CompatError::PluginVersion {
                    name: name.clone(),
                    cp: cpv.to_string(),
                    dp: dpv.to_string(),
                });
            }
        }
    }
    Ok(())
}
