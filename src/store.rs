//! Durable peer-table persistence.
//!
//! One JSON file per local node identity (`peers_{node_id}.json`) so
//! co-located nodes never clobber each other's peer knowledge. Loading is
//! deliberately forgiving: an absent or unparseable file yields an empty
//! table, and malformed individual records are skipped with a warning.

use crate::error::Result;
use crate::peer::PeerRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Version tag written into the peer file for forward compatibility.
pub const PEER_FILE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeerFile {
    version: u32,
    last_updated: DateTime<Utc>,
    peers: serde_json::Map<String, serde_json::Value>,
}

/// Load/save of the full peer table. Single writer at a time, guarded by
/// the manager's lock; not internally re-entrant.
#[derive(Debug, Clone)]
pub struct PeerStore {
    path: PathBuf,
}

impl PeerStore {
    pub fn new(data_dir: &Path, node_id: &str) -> Self {
        Self {
            path: data_dir.join(format!("peers_{}.json", node_id)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Serialize the full peer table to disk.
    pub async fn save(&self, peers: &HashMap<String, PeerRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut entries = serde_json::Map::new();
        for (url, record) in peers {
            entries.insert(url.clone(), serde_json::to_value(record)?);
        }

        let file = PeerFile {
            version: PEER_FILE_VERSION,
            last_updated: Utc::now(),
            peers: entries,
        };

        let body = serde_json::to_string_pretty(&file)?;
        tokio::fs::write(&self.path, body).await?;
        debug!(path = %self.path.display(), count = peers.len(), "Persisted peer table");
        Ok(())
    }

    /// Restore the peer table. Every restored record comes back inactive;
    /// reachability must be re-earned by a live probe.
    pub async fn load(&self) -> HashMap<String, PeerRecord> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No persisted peer file");
                return HashMap::new();
            }
            Err(err) => {
                warn!(path = %self.path.display(), %err, "Failed to read peer file");
                return HashMap::new();
            }
        };

        let file: PeerFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %self.path.display(), %err, "Unparseable peer file, starting empty");
                return HashMap::new();
            }
        };

        let mut peers = HashMap::new();
        for (url, value) in file.peers {
            match serde_json::from_value::<PeerRecord>(value) {
                Ok(mut record) => {
                    if record.url.is_empty() {
                        record.url = url.clone();
                    }
                    record.is_active = false;
                    peers.insert(url, record);
                }
                Err(err) => {
                    warn!(url = %url, %err, "Skipping malformed persisted peer record");
                }
            }
        }

        info!(path = %self.path.display(), count = peers.len(), "Loaded persisted peers");
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_table() -> HashMap<String, PeerRecord> {
        let mut peers = HashMap::new();
        let mut a = PeerRecord::new("http://127.0.0.1:7601");
        a.record_success(0.25);
        a.node_id = "peer-a".to_string();
        a.chain_length = 42;
        let mut b = PeerRecord::new("http://127.0.0.1:7602");
        b.record_failure();
        peers.insert(a.url.clone(), a);
        peers.insert(b.url.clone(), b);
        peers
    }

    #[tokio::test]
    async fn test_round_trip_forces_inactive() {
        let dir = tempdir().unwrap();
        let store = PeerStore::new(dir.path(), "n1");

        let peers = sample_table();
        assert!(peers["http://127.0.0.1:7601"].is_active);
        store.save(&peers).await.unwrap();

        let restored = store.load().await;
        assert_eq!(restored.len(), 2);
        let a = &restored["http://127.0.0.1:7601"];
        assert!(!a.is_active);
        assert_eq!(a.node_id, "peer-a");
        assert_eq!(a.chain_length, 42);
        assert_eq!(a.successes, 1);
        assert!((a.peer_score - peers["http://127.0.0.1:7601"].peer_score).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_file_yields_empty_table() {
        let dir = tempdir().unwrap();
        let store = PeerStore::new(dir.path(), "absent");
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_garbage_file_yields_empty_table() {
        let dir = tempdir().unwrap();
        let store = PeerStore::new(dir.path(), "garbage");
        tokio::fs::write(store.path(), "not json at all").await.unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_record_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let store = PeerStore::new(dir.path(), "mixed");

        let body = serde_json::json!({
            "version": PEER_FILE_VERSION,
            "lastUpdated": Utc::now(),
            "peers": {
                "http://127.0.0.1:7601": serde_json::to_value(PeerRecord::new("http://127.0.0.1:7601")).unwrap(),
                "http://127.0.0.1:7602": {"successes": "not-a-number"},
            }
        });
        tokio::fs::write(store.path(), serde_json::to_string(&body).unwrap())
            .await
            .unwrap();

        let restored = store.load().await;
        assert_eq!(restored.len(), 1);
        assert!(restored.contains_key("http://127.0.0.1:7601"));
    }

    #[tokio::test]
    async fn test_per_node_file_isolation() {
        let dir = tempdir().unwrap();
        let store_a = PeerStore::new(dir.path(), "a");
        let store_b = PeerStore::new(dir.path(), "b");
        assert_ne!(store_a.path(), store_b.path());

        store_a.save(&sample_table()).await.unwrap();
        assert!(store_b.load().await.is_empty());
        assert_eq!(store_a.load().await.len(), 2);
    }
}
