//! Snapshot building and the in-memory payload cache.
//!
//! The control plane serves every peer the same byte buffer: the exported
//! tree wrapped in a reconfigure envelope, JSON-encoded and gzip-deflated.
//! The cache holds the latest payload together with the set of plugin names
//! the current configuration actually uses, which gates pushes per peer.

use super::message::{MessageError, Reconfigure};
use crate::types::{now_f64, ConfigTable};
use bytes::Bytes;
use serde_json::Value;
use std::collections::BTreeSet;
use thiserror::Error;
use tokio::sync::RwLock;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Authoritative-store collaborator. Yields the full current config tree.
pub trait ConfigSource: Send + Sync + 'static {
    fn export(&self) -> Result<ConfigTable, BoxError>;
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("config export failed: {0}")]
    Export(#[source] BoxError),
    #[error("snapshot encode failed: {0}")]
    Encode(#[from] MessageError),
}

/// One built snapshot: the shared wire payload plus the plugin names that
/// appear in at least one record of the configuration.
#[derive(Debug, Clone)]
pub struct PreparedSnapshot {
    pub payload: Bytes,
    pub configured_plugins: BTreeSet<String>,
}

/// Latest prepared snapshot. Rebuilt on every broadcast trigger and lazily
/// on first request; a failed rebuild leaves the previous value in place.
/// Concurrent rebuilds are benign, last writer wins.
#[derive(Default)]
pub struct SnapshotCache {
    inner: RwLock<Option<PreparedSnapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<PreparedSnapshot> {
        self.inner.read().await.clone()
    }

    /// Export, envelope, deflate, swap.
    pub async fn rebuild(&self, source: &dyn ConfigSource) -> Result<PreparedSnapshot, SnapshotError> {
        let tree = source.export().map_err(SnapshotError::Export)?;
        let configured_plugins = configured_plugins(&tree);
        let envelope = Reconfigure { timestamp: now_f64(), config_table: tree };
        let prepared = PreparedSnapshot {
            payload: Bytes::from(envelope.deflate()?),
            configured_plugins,
        };
        *self.inner.write().await = Some(prepared.clone());
        Ok(prepared)
    }

    /// Current snapshot, building one if none exists yet.
    pub async fn ensure(&self, source: &dyn ConfigSource) -> Result<PreparedSnapshot, SnapshotError> {
        if let Some(prepared) = self.current().await {
            return Ok(prepared);
        }
        self.rebuild(source).await
    }
}

/// Names of plugins referenced by the `plugins` collection of a tree.
fn configured_plugins(tree: &ConfigTable) -> BTreeSet<String> {
    tree.get("plugins")
        .and_then(Value::as_array)
        .map(|records| {
            records
                .iter()
                .filter_map(|r| r.get("name").and_then(Value::as_str))
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}
