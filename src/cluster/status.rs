//! Persisted data plane status records.
//!
//! Upserted on every heartbeat and on fatal compatibility failures. Records
//! carry a TTL; sled has no native expiry, so expired entries are dropped
//! lazily whenever they are read or scanned. Session teardown deliberately
//! leaves the stored status untouched: the record ages out instead.

use super::types::PeerRecord;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use crate::types::now;

const STATUS_TREE: &str = "data_plane_status";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("record encode: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct StoredRecord {
    expires_at: u64,
    #[serde(flatten)]
    record: PeerRecord,
}

/// sled-backed peer record store.
pub struct StatusStore {
    tree: sled::Tree,
    ttl: Duration,
}

impl StatusStore {
    pub fn open(db: &sled::Db, ttl: Duration) -> Result<Self, StoreError> {
        Ok(Self { tree: db.open_tree(STATUS_TREE)?, ttl })
    }

    /// Insert or refresh a record; the TTL clock restarts from now.
    pub fn upsert(&self, record: PeerRecord) -> Result<(), StoreError> {
        let key = record.id.clone();
        let stored = StoredRecord {
            expires_at: now().saturating_add(self.ttl.as_secs()),
            record,
        };
        self.tree.insert(key.as_bytes(), serde_json::to_vec(&stored)?)?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PeerRecord>, StoreError> {
        let Some(bytes) = self.tree.get(id.as_bytes())? else {
            return Ok(None);
        };
        match self.decode_live(&bytes)? {
            Some(record) => Ok(Some(record)),
            None => {
                self.tree.remove(id.as_bytes())?;
                Ok(None)
            }
        }
    }

    /// All live records; expired ones are removed as a side effect.
    pub fn list(&self) -> Result<Vec<PeerRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.tree.iter() {
            let (key, bytes) = entry?;
            match self.decode_live(&bytes)? {
                Some(record) => records.push(record),
                None => {
                    self.tree.remove(key)?;
                }
            }
        }
        Ok(records)
    }

    fn decode_live(&self, bytes: &[u8]) -> Result<Option<PeerRecord>, StoreError> {
        let stored: StoredRecord = serde_json::from_slice(bytes)?;
        if now() >= stored.expires_at {
            Ok(None)
        } else {
            Ok(Some(stored.record))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::SyncStatus;

    fn record(id: &str, status: SyncStatus) -> PeerRecord {
        PeerRecord {
            id: id.to_string(),
            hostname: "dp-1.internal".to_string(),
            ip: "10.0.0.7".to_string(),
            version: "3.0.0".to_string(),
            last_seen: now(),
            config_hash: None,
            sync_status: status,
        }
    }

    fn open_store(ttl: Duration) -> (tempfile::TempDir, StatusStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        (dir, StatusStore::open(&db, ttl).unwrap())
    }

    #[test]
    fn upsert_and_get() {
        let (_dir, store) = open_store(Duration::from_secs(60));
        store.upsert(record("node-a", SyncStatus::Normal)).unwrap();
        let got = store.get("node-a").unwrap().unwrap();
        assert_eq!(got.sync_status, SyncStatus::Normal);
        assert_eq!(got.hostname, "dp-1.internal");
    }

    #[test]
    fn status_spelling_survives_storage() {
        let (_dir, store) = open_store(Duration::from_secs(60));
        store
            .upsert(record("node-a", SyncStatus::VersionIncompatible))
            .unwrap();
        let raw = store.tree.get(b"node-a").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["sync_status"], "KONG_VERSION_INCOMPATIBLE");
    }

    #[test]
    fn expired_records_drop_on_read() {
        let (_dir, store) = open_store(Duration::from_secs(0));
        store.upsert(record("node-a", SyncStatus::Normal)).unwrap();
        assert!(store.get("node-a").unwrap().is_none());
        assert!(store.tree.get(b"node-a").unwrap().is_none());
    }

    #[test]
    fn list_skips_and_removes_expired() {
        let (_dir, store) = open_store(Duration::from_secs(0));
        store.upsert(record("stale", SyncStatus::Normal)).unwrap();
        let (_dir2, live_store) = open_store(Duration::from_secs(60));
        live_store.upsert(record("live", SyncStatus::Normal)).unwrap();

        assert!(store.list().unwrap().is_empty());
        assert_eq!(live_store.list().unwrap().len(), 1);
    }

    #[test]
    fn upsert_refreshes_ttl_and_fields() {
        let (_dir, store) = open_store(Duration::from_secs(60));
        store.upsert(record("node-a", SyncStatus::Normal)).unwrap();
        let mut updated = record("node-a", SyncStatus::Normal);
        updated.config_hash = Some("ab".repeat(16));
        store.upsert(updated).unwrap();
        let got = store.get("node-a").unwrap().unwrap();
        assert_eq!(got.config_hash.as_deref(), Some("abababababababababababababababab"));
    }
}
