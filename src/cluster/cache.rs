//! On-disk snapshot cache for data plane cold start.
//!
//! Holds the raw decoded tree of the most recently applied snapshot, gzip
//! compressed. Consulted exactly once per process start, before the first
//! connection attempt, so a data plane can serve traffic while the control
//! plane is unreachable.

use super::message::{gzip_deflate, gzip_inflate, MessageError};
use crate::types::ConfigTable;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Cache file name under the node prefix.
pub const CACHE_FILE: &str = "config.cache.json.gz";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("decode: {0}")]
    Decode(#[from] MessageError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// The data plane's local snapshot file.
pub struct LocalCache {
    path: PathBuf,
}

impl LocalCache {
    pub fn new(prefix: &Path) -> Self {
        Self { path: prefix.join(CACHE_FILE) }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached tree. A missing file is pre-created empty with
    /// owner-only permissions so later writes do not race the umask; an
    /// empty file yields `None`.
    pub fn load(&self) -> Result<Option<ConfigTable>, CacheError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.precreate()?;
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if bytes.is_empty() {
            return Ok(None);
        }
        let json = gzip_inflate(&bytes)?;
        Ok(Some(serde_json::from_slice(&json)?))
    }

    /// Persist the raw tree after a successful apply. Writes to a temp file
    /// in the same directory, then renames over the cache.
    pub fn store(&self, tree: &ConfigTable) -> Result<(), CacheError> {
        let deflated = gzip_deflate(&serde_json::to_vec(tree)?)?;
        let tmp = self.path.with_extension("tmp");
        let mut file = owner_only(OpenOptions::new().write(true).create(true).truncate(true))
            .open(&tmp)?;
        file.write_all(&deflated)?;
        file.sync_all()?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn precreate(&self) -> Result<(), CacheError> {
        match owner_only(OpenOptions::new().write(true).create_new(true)).open(&self.path) {
            Ok(_) => Ok(()),
            // Lost the create race to another process; the file exists now.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn owner_only(options: &mut OpenOptions) -> &mut OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;
    options.mode(0o600)
}

#[cfg(not(unix))]
fn owner_only(options: &mut OpenOptions) -> &mut OpenOptions {
    options
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn load_precreates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        assert!(cache.load().unwrap().is_none());
        assert!(cache.path().exists());

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let mode = fs::metadata(cache.path()).unwrap().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn store_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        let tree = json!({"plugins": [{"name": "key-auth"}], "_format_version": "3.0"});
        cache.store(&tree).unwrap();
        assert_eq!(cache.load().unwrap().unwrap(), tree);
    }

    #[test]
    fn empty_file_is_no_cache() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        fs::write(cache.path(), b"").unwrap();
        assert!(cache.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_file_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        fs::write(cache.path(), b"definitely not gzip").unwrap();
        assert!(cache.load().is_err());
    }

    #[test]
    fn store_replaces_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let cache = LocalCache::new(dir.path());
        cache.store(&json!({"v": 1})).unwrap();
        cache.store(&json!({"v": 2})).unwrap();
        assert_eq!(cache.load().unwrap().unwrap(), json!({"v": 2}));
    }
}
