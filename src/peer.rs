//! Peer records and quality scoring.
//!
//! Each known remote node is tracked as a [`PeerRecord`]. The derived
//! `peer_score` (0-100) is the single ranking key used for discovery,
//! gossip target selection and connection-pool eviction. It rewards
//! long-lived, fast, reliable peers:
//!
//! ```text
//! score = success_rate * 60 + age_factor * 20 + response_factor * 20
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weight of the success/failure ratio in the score.
pub const SUCCESS_WEIGHT: f64 = 60.0;
/// Weight of peer age in the score.
pub const AGE_WEIGHT: f64 = 20.0;
/// Weight of probe latency in the score.
pub const RESPONSE_WEIGHT: f64 = 20.0;
/// Peers observed for a full day get maximum age credit.
pub const AGE_CREDIT_SECS: f64 = 86_400.0;
/// A probe at or above this latency floors its response credit.
pub const RESPONSE_CEILING_SECS: f64 = 5.0;
/// Minimum response credit, regardless of latency.
pub const RESPONSE_FLOOR: f64 = 0.1;
/// Probe failures since the last success before a peer is deactivated.
pub const PROBE_FAILURE_THRESHOLD: u32 = 5;

fn default_now() -> DateTime<Utc> {
    Utc::now()
}

/// One entry per known remote node, keyed by its API endpoint URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// scheme+host+port identifying the peer's API endpoint. Unique key.
    #[serde(default)]
    pub url: String,
    /// Self-reported identifier, empty until the first successful probe.
    #[serde(default)]
    pub node_id: String,
    #[serde(default = "default_now")]
    pub first_seen: DateTime<Utc>,
    #[serde(default = "default_now")]
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub successes: u32,
    /// Failure streak since the last successful probe.
    #[serde(default)]
    pub failures: u32,
    /// Most recent probe latency in seconds.
    #[serde(default)]
    pub response_time: f64,
    /// Last reported blockchain length. A hint only, never authoritative.
    #[serde(default)]
    pub chain_length: u64,
    #[serde(default)]
    pub is_active: bool,
    /// Derived 0-100 quality score, recomputed after every mutation.
    #[serde(default)]
    pub peer_score: f64,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub protocol_version: String,
}

impl PeerRecord {
    pub fn new(url: impl Into<String>) -> Self {
        let now = Utc::now();
        let mut record = Self {
            url: url.into(),
            node_id: String::new(),
            first_seen: now,
            last_seen: now,
            successes: 0,
            failures: 0,
            response_time: 0.0,
            chain_length: 0,
            is_active: false,
            peer_score: 0.0,
            version: String::new(),
            protocol_version: String::new(),
        };
        record.recompute_score();
        record
    }

    /// Create a record seeded from informational fields of a gossiped record.
    /// Counters start fresh; reachability must be earned by a live probe.
    pub fn seeded_from(url: impl Into<String>, info: &PeerRecord) -> Self {
        let mut record = Self::new(url);
        record.node_id = info.node_id.clone();
        record.version = info.version.clone();
        record.protocol_version = info.protocol_version.clone();
        record.chain_length = info.chain_length;
        record.recompute_score();
        record
    }

    /// Recompute `peer_score` from the current counters and timestamps.
    ///
    /// Called synchronously after every mutation so the score is never stale.
    pub fn recompute_score(&mut self) {
        let total = self.successes + self.failures;
        // No observations yet: neutral 0.5 ratio, which lands a fresh record at 50.
        let success_rate = if total == 0 {
            0.5
        } else {
            f64::from(self.successes) / f64::from(total)
        };

        let age_secs = (Utc::now() - self.first_seen).num_seconds().max(0) as f64;
        let age_factor = (age_secs / AGE_CREDIT_SECS).min(1.0);

        let response_factor =
            (1.0 - self.response_time / RESPONSE_CEILING_SECS).max(RESPONSE_FLOOR);

        self.peer_score =
            success_rate * SUCCESS_WEIGHT + age_factor * AGE_WEIGHT + response_factor * RESPONSE_WEIGHT;
    }

    /// Record a successful probe. Resets the failure streak and reactivates.
    pub fn record_success(&mut self, response_time: f64) {
        self.successes += 1;
        self.failures = 0;
        self.response_time = response_time;
        self.last_seen = Utc::now();
        self.is_active = true;
        self.recompute_score();
    }

    /// Record a failed probe. Returns true only when this failure pushed a
    /// previously active peer over [`PROBE_FAILURE_THRESHOLD`], so callers
    /// see the deactivation transition exactly once.
    pub fn record_failure(&mut self) -> bool {
        self.failures += 1;
        let deactivated = self.is_active && self.failures >= PROBE_FAILURE_THRESHOLD;
        if deactivated {
            self.is_active = false;
        }
        self.recompute_score();
        deactivated
    }

    /// Restore a peer that answered a discovery scan after being deactivated.
    pub fn reactivate(&mut self) {
        self.failures = 0;
        self.is_active = true;
        self.last_seen = Utc::now();
        self.recompute_score();
    }
}
