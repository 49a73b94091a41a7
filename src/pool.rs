//! Bounded pool of live outbound sessions.
//!
//! The pool holds between zero and `max_connections` reqwest sessions
//! toward active peers, targeting `target_connections`. Each session
//! carries a health value in [0,1] that is independent of the peer score:
//! health decays on failed status probes, grows on success, and drives
//! eviction from the pool only, never from the peer table.

use crate::error::Result;
use dashmap::DashMap;
use reqwest::header::{HeaderMap, HeaderValue, CONNECTION};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

pub const USER_AGENT: &str = concat!("peernet-node/", env!("CARGO_PKG_VERSION"));

/// Health boost for a successful status probe.
pub const HEALTH_SUCCESS_NUDGE: f64 = 0.1;
/// Health decay for a non-200 status response.
pub const HEALTH_HTTP_DECAY: f64 = 0.2;
/// Health decay for a transport-level failure.
pub const HEALTH_ERROR_DECAY: f64 = 0.3;
/// Connections below this health are dropped after a health-check pass.
pub const HEALTH_EVICT_THRESHOLD: f64 = 0.1;
/// Bounded wait when joining the health-check task on stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one health probe against a pooled peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ok,
    HttpError,
    Unreachable,
}

/// An open outbound session toward one peer.
#[derive(Debug, Clone)]
pub struct PooledConnection {
    pub peer_url: String,
    pub client: reqwest::Client,
    pub health: f64,
    pub opened_at: chrono::DateTime<chrono::Utc>,
}

/// Bounded, health-scored set of outbound sessions.
pub struct ConnectionPool {
    connections: Arc<DashMap<String, PooledConnection>>,
    target: usize,
    max: usize,
    health_interval: Duration,
    probe_timeout: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(
        target: usize,
        max: usize,
        health_interval: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            target,
            max,
            health_interval,
            probe_timeout,
            shutdown: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub fn target_connections(&self) -> usize {
        self.target
    }

    pub fn max_connections(&self) -> usize {
        self.max
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.connections.contains_key(url)
    }

    pub fn health_of(&self, url: &str) -> Option<f64> {
        self.connections.get(url).map(|c| c.health)
    }

    pub fn active_urls(&self) -> Vec<String> {
        self.connections.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_connection(&self, url: &str) -> Option<PooledConnection> {
        self.connections.get(url).map(|e| e.value().clone())
    }

    fn build_client(&self) -> Result<reqwest::Client> {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .default_headers(headers)
            .timeout(self.probe_timeout)
            .build()
            .map_err(|e| crate::error::PeerNetError::Network(e.to_string()))?;
        Ok(client)
    }

    /// Open a session toward `url`. No-op if one already exists. When the
    /// pool is at capacity the lowest-health connection is evicted first,
    /// so the new peer is never rejected outright.
    pub fn add_connection(&self, url: &str) -> Result<bool> {
        if self.connections.contains_key(url) {
            return Ok(false);
        }

        while self.connections.len() >= self.max {
            match self.lowest_health_url() {
                Some(victim) => {
                    warn!(url = %victim, "Evicting lowest-health connection for capacity");
                    self.connections.remove(&victim);
                }
                None => break,
            }
        }

        let connection = PooledConnection {
            peer_url: url.to_string(),
            client: self.build_client()?,
            health: 1.0,
            opened_at: chrono::Utc::now(),
        };
        self.connections.insert(url.to_string(), connection);
        debug!(url = %url, pooled = self.connections.len(), "Opened outbound connection");
        Ok(true)
    }

    pub fn remove_connection(&self, url: &str) -> bool {
        let removed = self.connections.remove(url).is_some();
        if removed {
            debug!(url = %url, "Closed outbound connection");
        }
        removed
    }

    fn lowest_health_url(&self) -> Option<String> {
        self.connections
            .iter()
            .min_by(|a, b| {
                a.health
                    .partial_cmp(&b.health)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|e| e.key().clone())
    }

    /// Apply one probe outcome to a pooled connection's health.
    fn apply_outcome(connections: &DashMap<String, PooledConnection>, url: &str, outcome: ProbeOutcome) {
        if let Some(mut entry) = connections.get_mut(url) {
            entry.health = match outcome {
                ProbeOutcome::Ok => (entry.health + HEALTH_SUCCESS_NUDGE).min(1.0),
                ProbeOutcome::HttpError => (entry.health - HEALTH_HTTP_DECAY).max(0.0),
                ProbeOutcome::Unreachable => (entry.health - HEALTH_ERROR_DECAY).max(0.0),
            };
        }
    }

    /// Drop every connection whose health fell below the eviction threshold.
    fn evict_unhealthy(connections: &DashMap<String, PooledConnection>) {
        let doomed: Vec<String> = connections
            .iter()
            .filter(|e| e.health < HEALTH_EVICT_THRESHOLD)
            .map(|e| e.key().clone())
            .collect();
        for url in doomed {
            info!(url = %url, "Removing unhealthy connection");
            connections.remove(&url);
        }
    }

    /// One pass of the health-check loop: probe every pooled peer's status
    /// endpoint, adjust health, then sweep. Only touches connections already
    /// in the pool; it never creates new ones.
    async fn run_health_pass(connections: &DashMap<String, PooledConnection>) {
        let snapshot: Vec<(String, reqwest::Client)> = connections
            .iter()
            .map(|e| (e.key().clone(), e.client.clone()))
            .collect();

        for (url, client) in snapshot {
            let outcome = match client.get(format!("{}/status", url)).send().await {
                Ok(resp) if resp.status().is_success() => ProbeOutcome::Ok,
                Ok(resp) => {
                    debug!(url = %url, status = %resp.status(), "Health probe rejected");
                    ProbeOutcome::HttpError
                }
                Err(err) => {
                    debug!(url = %url, %err, "Health probe failed");
                    ProbeOutcome::Unreachable
                }
            };
            Self::apply_outcome(connections, &url, outcome);
        }

        Self::evict_unhealthy(connections);
    }

    /// Start the background health-check loop. Idempotent.
    pub async fn start(&self) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }

        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock().await = Some(tx);

        let connections = Arc::clone(&self.connections);
        let interval = self.health_interval;
        *task = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(interval) => {}
                    _ = rx.changed() => break,
                }
                Self::run_health_pass(&connections).await;
            }
            debug!("Connection health-check loop stopped");
        }));
        info!(interval_secs = interval.as_secs(), "Connection pool started");
    }

    /// Stop the health-check loop and drop all sessions. Idempotent;
    /// joins the task with a bounded timeout.
    pub async fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.task.lock().await.take() {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Health-check task did not stop in time, abandoning");
            }
        }
        self.connections.clear();
        info!("Connection pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(8, 12, Duration::from_secs(30), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_add_is_idempotent_per_url() {
        let pool = pool();
        assert!(pool.add_connection("http://127.0.0.1:7601").unwrap());
        assert!(!pool.add_connection("http://127.0.0.1:7601").unwrap());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_invariant_evicts_lowest_health() {
        let pool = pool();
        for port in 0..12 {
            pool.add_connection(&format!("http://127.0.0.1:{}", 7600 + port))
                .unwrap();
        }
        assert_eq!(pool.len(), 12);

        // Degrade one connection below the rest.
        ConnectionPool::apply_outcome(
            &pool.connections,
            "http://127.0.0.1:7605",
            ProbeOutcome::Unreachable,
        );

        pool.add_connection("http://127.0.0.1:7999").unwrap();
        assert_eq!(pool.len(), 12);
        assert!(!pool.contains("http://127.0.0.1:7605"));
        assert!(pool.contains("http://127.0.0.1:7999"));
    }

    #[tokio::test]
    async fn test_health_arithmetic_caps_and_floors() {
        let pool = pool();
        pool.add_connection("http://127.0.0.1:7601").unwrap();

        // Already at 1.0; success must not exceed the cap.
        ConnectionPool::apply_outcome(&pool.connections, "http://127.0.0.1:7601", ProbeOutcome::Ok);
        assert_eq!(pool.health_of("http://127.0.0.1:7601"), Some(1.0));

        ConnectionPool::apply_outcome(
            &pool.connections,
            "http://127.0.0.1:7601",
            ProbeOutcome::HttpError,
        );
        assert!((pool.health_of("http://127.0.0.1:7601").unwrap() - 0.8).abs() < 1e-9);

        for _ in 0..5 {
            ConnectionPool::apply_outcome(
                &pool.connections,
                "http://127.0.0.1:7601",
                ProbeOutcome::Unreachable,
            );
        }
        assert_eq!(pool.health_of("http://127.0.0.1:7601"), Some(0.0));
    }

    #[tokio::test]
    async fn test_sweep_removes_below_threshold() {
        let pool = pool();
        pool.add_connection("http://127.0.0.1:7601").unwrap();
        pool.add_connection("http://127.0.0.1:7602").unwrap();

        for _ in 0..4 {
            ConnectionPool::apply_outcome(
                &pool.connections,
                "http://127.0.0.1:7602",
                ProbeOutcome::Unreachable,
            );
        }
        ConnectionPool::evict_unhealthy(&pool.connections);

        assert!(pool.contains("http://127.0.0.1:7601"));
        assert!(!pool.contains("http://127.0.0.1:7602"));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let pool = pool();
        pool.start().await;
        pool.start().await;
        pool.add_connection("http://127.0.0.1:7601").unwrap();
        pool.stop().await;
        pool.stop().await;
        assert!(pool.is_empty());
    }
}
