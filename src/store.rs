//! Concrete collaborators for the binary: the authoritative config export
//! and the data plane runtime cache.
//!
//! Both are intentionally thin. The export side reads a declarative JSON
//! file; the runtime cache holds the latest applied tree in memory where a
//! full gateway would rebuild its router and plugin chains.

use crate::cluster::data_plane::DeclarativeConfig;
use crate::cluster::snapshot::ConfigSource;
use crate::types::ConfigTable;
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::info;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Authoritative store backed by a declarative JSON file. Re-read on every
/// export so an edited file plus a change trigger is a full workflow.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ConfigSource for FileConfigSource {
    fn export(&self) -> Result<ConfigTable, BoxError> {
        let bytes = fs::read(&self.path)
            .map_err(|e| format!("read {}: {e}", self.path.display()))?;
        let tree = serde_json::from_slice(&bytes)
            .map_err(|e| format!("parse {}: {e}", self.path.display()))?;
        Ok(tree)
    }
}

/// In-memory runtime configuration of a data plane node.
#[derive(Default)]
pub struct RuntimeCache {
    current: RwLock<Option<(String, ConfigTable)>>,
}

impl RuntimeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_hash(&self) -> Option<String> {
        self.current
            .read()
            .unwrap()
            .as_ref()
            .map(|(hash, _)| hash.clone())
    }
}

impl DeclarativeConfig for RuntimeCache {
    fn load(&self, tree: &ConfigTable, hash: &str) -> Result<(), BoxError> {
        if !tree.is_object() {
            return Err("configuration root must be a table".into());
        }
        *self.current.write().unwrap() = Some((hash.to_string(), tree.clone()));
        info!(%hash, "runtime configuration swapped");
        Ok(())
    }
}
