//! Wire types for the HTTP+JSON peer protocol.
//!
//! The surrounding server layer owns the routes; this module owns the
//! shapes. Inbound types decode leniently (missing fields default) so a
//! malformed peer can never abort a whole batch.

use crate::peer::PeerRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Response to `GET /status`, the universal liveness probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StatusResponse {
    pub node_id: String,
    pub blockchain_length: u64,
    pub version: String,
    pub protocol_version: String,
}

/// Response to `GET /getpeers` (pull gossip).
///
/// Entries stay as raw JSON values so one malformed record can be
/// skipped without dropping the rest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerListResponse {
    pub peers: Vec<serde_json::Value>,
    pub count: usize,
}

impl PeerListResponse {
    pub fn from_records(records: Vec<PeerRecord>) -> Self {
        let peers: Vec<serde_json::Value> = records
            .into_iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .collect();
        Self {
            count: peers.len(),
            peers,
        }
    }
}

/// Body of `POST /sharepeers` (push gossip).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePeersRequest {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub peers: Vec<serde_json::Value>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Summary returned to a gossip sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharePeersResponse {
    pub status: String,
    pub peers_received: usize,
    pub new_peers_added: usize,
}

/// Body of `POST /addpeer`, used by operator tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPeerRequest {
    pub peer_url: String,
}

/// Per-peer outcome of a broadcast fan-out.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastReport {
    pub total_peers: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: HashMap<String, bool>,
}

/// One row of the observability snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub url: String,
    pub is_active: bool,
    pub peer_score: f64,
    pub failures: u32,
    pub chain_length: u64,
}

/// Snapshot returned by `PeerNetworkManager::get_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStatus {
    pub node_id: String,
    pub total_peers: usize,
    pub active_peers: usize,
    pub pooled_connections: usize,
    pub target_connections: usize,
    pub peers: Vec<PeerSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_decode_tolerates_extra_and_missing_fields() {
        let status: StatusResponse = serde_json::from_value(serde_json::json!({
            "nodeId": "abc",
            "uptime": 123,
        }))
        .unwrap();
        assert_eq!(status.node_id, "abc");
        assert_eq!(status.blockchain_length, 0);
        assert_eq!(status.version, "");
    }

    #[test]
    fn test_peer_list_roundtrip() {
        let list = PeerListResponse::from_records(vec![
            PeerRecord::new("http://127.0.0.1:7601"),
            PeerRecord::new("http://127.0.0.1:7602"),
        ]);
        assert_eq!(list.count, 2);

        let encoded = serde_json::to_string(&list).unwrap();
        let decoded: PeerListResponse = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.peers.len(), 2);
        assert_eq!(decoded.peers[0]["url"], "http://127.0.0.1:7601");
    }

    #[test]
    fn test_share_request_defaults_timestamp() {
        let request: SharePeersRequest =
            serde_json::from_value(serde_json::json!({"nodeId": "n1", "peers": []})).unwrap();
        assert_eq!(request.node_id, "n1");
        assert!(request.peers.is_empty());
    }
}
