//! Peer network manager: the orchestrating façade of the overlay.
//!
//! Owns the peer table and active set, drives bootstrap, discovery
//! (port scan + pull peer exchange), periodic push gossip and broadcast,
//! and feeds the outbound connection pool. Network errors are never fatal
//! here; every externally-facing call degrades to a failure-counted,
//! logged outcome.
//!
//! Concurrency model: one background task per loop (discovery, gossip;
//! the pool runs its own health-check loop) plus foreground calls from
//! the HTTP layer. The peer table lives behind a single `RwLock` and all
//! network I/O happens outside it, on copied snapshots. When the table
//! lock and the pool are both needed, the table lock is released first.

use crate::config::PeerNetConfig;
use crate::error::{PeerNetError, Result};
use crate::peer::PeerRecord;
use crate::pool::{ConnectionPool, USER_AGENT};
use crate::protocol::{
    BroadcastReport, NetworkStatus, PeerListResponse, PeerSummary, SharePeersRequest,
    SharePeersResponse, StatusResponse,
};
use crate::store::PeerStore;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Consecutive scan failures before an active peer is marked inactive.
/// Deliberately distinct from [`crate::peer::PROBE_FAILURE_THRESHOLD`]:
/// the scan keeps its own counter, separate from probe failures.
pub const SCAN_FAILURE_THRESHOLD: u32 = 3;
/// Bounded wait when joining each background loop on stop.
const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a manager instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Peer table plus the derived bookkeeping that must stay consistent
/// with it. Guarded as one unit by a single lock.
#[derive(Default)]
struct PeerTable {
    records: HashMap<String, PeerRecord>,
    active: HashSet<String>,
    /// Consecutive port-scan failures per active peer. In-memory only.
    scan_failures: HashMap<String, u32>,
}

struct ManagerInner {
    config: PeerNetConfig,
    table: RwLock<PeerTable>,
    pool: ConnectionPool,
    store: PeerStore,
    client: reqwest::Client,
    state: RwLock<ManagerState>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Cheap clonable handle to the overlay. One instance per process,
/// constructed at startup and handed to the HTTP layer; no globals.
#[derive(Clone)]
pub struct PeerNetworkManager {
    inner: Arc<ManagerInner>,
}

impl PeerNetworkManager {
    pub fn new(config: PeerNetConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| PeerNetError::Config(e.to_string()))?;

        let pool = ConnectionPool::new(
            config.target_connections,
            config.max_connections,
            config.health_check_interval,
            config.probe_timeout,
        );
        let store = PeerStore::new(&config.data_dir, &config.node_id);

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                table: RwLock::new(PeerTable::default()),
                pool,
                store,
                client,
                state: RwLock::new(ManagerState::Stopped),
                shutdown: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn config(&self) -> &PeerNetConfig {
        &self.inner.config
    }

    pub async fn state(&self) -> ManagerState {
        *self.inner.state.read().await
    }

    /// Start the overlay: load persisted peers, start the pool, launch the
    /// discovery and gossip loops, then contact bootstrap seeds. No-op if
    /// already running.
    pub async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().await;
            if *state != ManagerState::Stopped {
                debug!(state = ?*state, "start() ignored, manager not stopped");
                return Ok(());
            }
            *state = ManagerState::Starting;
        }
        info!(node_id = %inner.config.node_id, url = %inner.config.self_url(), "Starting peer network manager");

        let loaded = inner.store.load().await;
        if !loaded.is_empty() {
            let mut table = inner.table.write().await;
            table.records.extend(loaded);
        }

        inner.pool.start().await;

        let (tx, rx) = watch::channel(false);
        *inner.shutdown.lock().await = Some(tx);

        let mut tasks = inner.tasks.lock().await;
        tasks.push(tokio::spawn(
            Arc::clone(inner).run_discovery_loop(rx.clone()),
        ));
        tasks.push(tokio::spawn(Arc::clone(inner).run_gossip_loop(rx)));
        drop(tasks);

        inner.set_state(ManagerState::Running).await;
        inner.bootstrap_network().await;
        Ok(())
    }

    /// Stop the overlay: halt both loops with bounded joins, stop the pool,
    /// persist the table. Idempotent.
    pub async fn stop(&self) {
        let inner = &self.inner;
        {
            let mut state = inner.state.write().await;
            if *state != ManagerState::Running {
                debug!(state = ?*state, "stop() ignored, manager not running");
                return;
            }
            *state = ManagerState::Stopping;
        }

        if let Some(tx) = inner.shutdown.lock().await.take() {
            let _ = tx.send(true);
        }
        for handle in inner.tasks.lock().await.drain(..) {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("Background loop did not stop in time, abandoning");
            }
        }

        inner.pool.stop().await;
        inner.persist().await;
        inner.set_state(ManagerState::Stopped).await;
    }

    /// Persist the current peer table. Failures are logged, never fatal.
    pub async fn persist(&self) {
        self.inner.persist().await;
    }

    /// Learn a peer and probe it synchronously. Returns whether the peer
    /// is reachable right now. Rejects the local node's own endpoint.
    pub async fn add_peer(&self, url: &str, seed_info: Option<&PeerRecord>) -> bool {
        self.inner.add_peer(url, seed_info).await
    }

    /// Ingest a pushed peer list (the inbound side of gossip).
    pub async fn handle_peer_share(
        &self,
        sender_id: &str,
        shared: &[serde_json::Value],
    ) -> SharePeersResponse {
        self.inner.handle_peer_share(sender_id, shared).await
    }

    /// The peer list this node serves for pull gossip.
    pub async fn peer_list(&self) -> PeerListResponse {
        self.inner.peer_list().await
    }

    /// Fan a POST of `payload` out to every active peer in parallel.
    pub async fn broadcast_to_peers(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        self.inner.broadcast_to_peers(endpoint, payload, timeout).await
    }

    /// Observability snapshot of the whole overlay.
    pub async fn get_status(&self) -> NetworkStatus {
        self.inner.get_status().await
    }
}

impl ManagerInner {
    async fn set_state(&self, next: ManagerState) {
        let mut state = self.state.write().await;
        info!(from = ?*state, to = ?next, "Manager state transition");
        *state = next;
    }

    /// Persist the current peer table. Failures are logged, never fatal.
    async fn persist(&self) {
        let snapshot = {
            let table = self.table.read().await;
            table.records.clone()
        };
        if let Err(err) = self.store.save(&snapshot).await {
            warn!(%err, "Failed to persist peer table");
        }
    }

    // ------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------

    /// Contact every configured seed with retries. One unreachable seed
    /// never aborts the rest.
    async fn bootstrap_network(&self) {
        let seeds = self.config.bootstrap_peers.clone();
        if seeds.is_empty() {
            debug!("No bootstrap seeds configured");
            return;
        }

        for seed in seeds {
            let mut reached = false;
            for attempt in 1..=self.config.bootstrap_attempts {
                debug!(seed = %seed, attempt, "Bootstrap attempt");
                if self.add_peer(&seed, None).await {
                    info!(seed = %seed, attempt, "Bootstrap seed reachable");
                    self.request_peers_from(&seed).await;
                    reached = true;
                    break;
                }
                if attempt < self.config.bootstrap_attempts {
                    sleep(self.config.bootstrap_retry_delay).await;
                }
            }
            if !reached {
                warn!(seed = %seed, attempts = self.config.bootstrap_attempts, "Bootstrap seed unreachable, moving on");
            }
        }
        self.persist().await;
    }

    // ------------------------------------------------------------------
    // Foreground operations
    // ------------------------------------------------------------------

    async fn add_peer(&self, url: &str, seed_info: Option<&PeerRecord>) -> bool {
        let url = url.trim_end_matches('/');
        if url == self.config.self_url() {
            debug!(url = %url, "Rejecting self-peering attempt");
            return false;
        }

        {
            let mut table = self.table.write().await;
            if !table.records.contains_key(url) {
                let record = match seed_info {
                    Some(info) => PeerRecord::seeded_from(url, info),
                    None => PeerRecord::new(url),
                };
                table.records.insert(url.to_string(), record);
            }
        }

        match self.probe_status(url, self.config.probe_timeout).await {
            Ok((status, elapsed)) => {
                {
                    let mut table = self.table.write().await;
                    if let Some(record) = table.records.get_mut(url) {
                        record.record_success(elapsed);
                        if !status.node_id.is_empty() {
                            record.node_id = status.node_id;
                        }
                        if !status.version.is_empty() {
                            record.version = status.version;
                        }
                        if !status.protocol_version.is_empty() {
                            record.protocol_version = status.protocol_version;
                        }
                        record.chain_length = status.blockchain_length;
                        debug!(url = %url, score = record.peer_score, "Peer probe succeeded");
                    }
                    table.active.insert(url.to_string());
                    table.scan_failures.remove(url);
                }
                if self.pool.len() < self.config.target_connections {
                    if let Err(err) = self.pool.add_connection(url) {
                        warn!(url = %url, %err, "Failed to open pooled connection");
                    }
                }
                true
            }
            Err(err) => {
                let deactivated = {
                    let mut table = self.table.write().await;
                    let deactivated = match table.records.get_mut(url) {
                        Some(record) => record.record_failure(),
                        None => false,
                    };
                    if deactivated {
                        table.active.remove(url);
                    }
                    deactivated
                };
                if deactivated {
                    self.pool.remove_connection(url);
                    info!(url = %url, "Peer deactivated after repeated probe failures");
                } else {
                    debug!(url = %url, %err, "Peer probe failed");
                }
                false
            }
        }
    }

    /// Unknown URLs from the shared batch are attempted via `add_peer`;
    /// malformed entries are skipped, never aborting the batch.
    /// Idempotent: a replayed payload adds nothing.
    async fn handle_peer_share(
        &self,
        sender_id: &str,
        shared: &[serde_json::Value],
    ) -> SharePeersResponse {
        let mut added = 0usize;

        for value in shared {
            let record: PeerRecord = match serde_json::from_value(value.clone()) {
                Ok(record) => record,
                Err(err) => {
                    warn!(sender = %sender_id, %err, "Skipping malformed gossiped record");
                    continue;
                }
            };
            if record.url.is_empty() {
                warn!(sender = %sender_id, "Skipping gossiped record without url");
                continue;
            }

            let url = record.url.trim_end_matches('/').to_string();
            let known = {
                let table = self.table.read().await;
                table.records.contains_key(&url)
            };
            if known {
                continue;
            }

            let _ = self.add_peer(&url, Some(&record)).await;
            let created = {
                let table = self.table.read().await;
                table.records.contains_key(&url)
            };
            if created {
                added += 1;
            }
        }

        info!(sender = %sender_id, received = shared.len(), added, "Processed gossiped peer list");
        if added > 0 {
            self.persist().await;
        }

        SharePeersResponse {
            status: "success".to_string(),
            peers_received: shared.len(),
            new_peers_added: added,
        }
    }

    /// Top-scoring records first, bounded by the gossip batch size.
    async fn peer_list(&self) -> PeerListResponse {
        let records = self.top_scored_records(self.config.gossip_batch_size).await;
        PeerListResponse::from_records(records)
    }

    /// Parallel fan-out bounded by the worker cap, each call under its
    /// own timeout. One slow peer never stretches the whole broadcast
    /// beyond its own timeout.
    async fn broadcast_to_peers(
        &self,
        endpoint: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        let timeout = timeout.unwrap_or(self.config.broadcast_timeout);
        let endpoint = endpoint.trim_start_matches('/').to_string();
        let targets: Vec<String> = {
            let table = self.table.read().await;
            table.active.iter().cloned().collect()
        };
        let total = targets.len();

        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.config.broadcast_workers));
        let handles: Vec<JoinHandle<(String, bool)>> = targets
            .into_iter()
            .map(|url| {
                let client = self.client.clone();
                let semaphore = Arc::clone(&semaphore);
                let endpoint = endpoint.clone();
                let payload = payload.clone();
                tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return (url, false),
                    };
                    let delivered = match client
                        .post(format!("{}/{}", url, endpoint))
                        .timeout(timeout)
                        .json(&payload)
                        .send()
                        .await
                    {
                        Ok(resp) => resp.status().is_success(),
                        Err(_) => false,
                    };
                    (url, delivered)
                })
            })
            .collect();

        let mut results = HashMap::with_capacity(total);
        let mut successful = 0usize;
        for outcome in futures::future::join_all(handles).await {
            if let Ok((url, delivered)) = outcome {
                if delivered {
                    successful += 1;
                }
                results.insert(url, delivered);
            }
        }

        let report = BroadcastReport {
            total_peers: total,
            successful,
            failed: total - successful,
            results,
        };
        info!(endpoint = %endpoint, total = report.total_peers, successful = report.successful, "Broadcast complete");
        report
    }

    async fn get_status(&self) -> NetworkStatus {
        let table = self.table.read().await;
        let mut peers: Vec<PeerSummary> = table
            .records
            .values()
            .map(|record| PeerSummary {
                url: record.url.clone(),
                is_active: record.is_active,
                peer_score: record.peer_score,
                failures: record.failures,
                chain_length: record.chain_length,
            })
            .collect();
        peers.sort_by(|a, b| {
            b.peer_score
                .partial_cmp(&a.peer_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        NetworkStatus {
            node_id: self.config.node_id.clone(),
            total_peers: table.records.len(),
            active_peers: table.active.len(),
            pooled_connections: self.pool.len(),
            target_connections: self.config.target_connections,
            peers,
        }
    }

    // ------------------------------------------------------------------
    // Discovery loop
    // ------------------------------------------------------------------

    async fn run_discovery_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.discovery_interval.as_secs(), "Discovery loop started");
        loop {
            tokio::select! {
                _ = sleep(self.config.discovery_interval) => {}
                _ = shutdown.changed() => break,
            }
            let before = self.known_peer_count().await;
            self.discover_local_ports().await;
            self.exchange_peers().await;
            self.maintain_peer_connections().await;
            // Opportunistic persistence whenever the pass learned peers.
            if self.known_peer_count().await > before {
                self.persist().await;
            }
        }
        debug!("Discovery loop stopped");
    }

    async fn known_peer_count(&self) -> usize {
        self.table.read().await.records.len()
    }

    /// Port-scan discovery over the configured local range, skipping the
    /// local node's own port.
    async fn discover_local_ports(&self) {
        for port in self.config.scan_port_start..=self.config.scan_port_end {
            if port == self.config.port {
                continue;
            }
            let url = format!("http://{}:{}", self.config.scan_host, port);

            let (known, active) = {
                let table = self.table.read().await;
                match table.records.get(url.as_str()) {
                    Some(record) => (true, record.is_active),
                    None => (false, false),
                }
            };

            let responsive = self.quick_probe(&url).await;
            match (known, active, responsive) {
                (false, _, true) => {
                    info!(url = %url, "Port scan found a new peer");
                    self.add_peer(&url, None).await;
                }
                (true, false, true) => {
                    let mut table = self.table.write().await;
                    if let Some(record) = table.records.get_mut(url.as_str()) {
                        record.reactivate();
                        info!(url = %url, "Reactivated peer after successful scan");
                    }
                    table.active.insert(url.clone());
                    table.scan_failures.remove(url.as_str());
                }
                (true, true, true) => {
                    let mut table = self.table.write().await;
                    table.scan_failures.remove(url.as_str());
                }
                (true, true, false) => {
                    let mut table = self.table.write().await;
                    let streak = {
                        let counter = table.scan_failures.entry(url.clone()).or_insert(0);
                        *counter += 1;
                        *counter
                    };
                    if streak >= SCAN_FAILURE_THRESHOLD {
                        if let Some(record) = table.records.get_mut(url.as_str()) {
                            record.is_active = false;
                        }
                        table.active.remove(url.as_str());
                        table.scan_failures.remove(url.as_str());
                        info!(url = %url, streak, "Peer marked inactive after repeated scan failures");
                    }
                }
                _ => {}
            }
        }
    }

    /// Pull peer exchange: ask the best-scoring active peers for their
    /// peer lists and merge anything new.
    async fn exchange_peers(&self) {
        let targets = self.top_active_urls(self.config.exchange_fanout).await;
        for url in targets {
            self.request_peers_from(&url).await;
        }
    }

    /// Fetch one peer's list and merge unknown URLs via `add_peer`.
    async fn request_peers_from(&self, url: &str) {
        let response = match self
            .client
            .get(format!("{}/getpeers", url))
            .timeout(self.config.exchange_timeout)
            .send()
            .await
        {
            Ok(resp) if resp.status().is_success() => resp,
            Ok(resp) => {
                debug!(url = %url, status = %resp.status(), "Peer list request rejected");
                return;
            }
            Err(err) => {
                debug!(url = %url, %err, "Peer list request failed");
                return;
            }
        };

        let list: PeerListResponse = match response.json().await {
            Ok(list) => list,
            Err(err) => {
                warn!(url = %url, %err, "Unparseable peer list");
                return;
            }
        };

        let mut merged = 0usize;
        for value in list.peers {
            let record: PeerRecord = match serde_json::from_value(value) {
                Ok(record) => record,
                Err(err) => {
                    warn!(url = %url, %err, "Skipping malformed exchanged record");
                    continue;
                }
            };
            if record.url.is_empty() {
                continue;
            }
            let target = record.url.trim_end_matches('/').to_string();
            let known = {
                let table = self.table.read().await;
                table.records.contains_key(&target)
            };
            if !known {
                self.add_peer(&target, Some(&record)).await;
                merged += 1;
            }
        }
        if merged > 0 {
            info!(url = %url, merged, "Merged peers from exchange");
        }
    }

    /// Top up the outbound pool toward the target: rank active, un-pooled
    /// peers by score and open connections for the best ones.
    async fn maintain_peer_connections(&self) {
        let pooled = self.pool.len();
        if pooled >= self.config.target_connections {
            return;
        }
        let needed = self.config.target_connections - pooled;

        let mut candidates: Vec<(String, f64)> = {
            let table = self.table.read().await;
            table
                .active
                .iter()
                .filter(|url| !self.pool.contains(url))
                .filter_map(|url| {
                    table
                        .records
                        .get(url.as_str())
                        .map(|r| (url.clone(), r.peer_score))
                })
                .collect()
        };
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (url, score) in candidates.into_iter().take(needed) {
            match self.pool.add_connection(&url) {
                Ok(true) => debug!(url = %url, score, "Topped up outbound pool"),
                Ok(false) => {}
                Err(err) => warn!(url = %url, %err, "Failed to open pooled connection"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Gossip loop
    // ------------------------------------------------------------------

    async fn run_gossip_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.config.gossip_interval.as_secs(), "Gossip loop started");
        loop {
            tokio::select! {
                _ = sleep(self.config.gossip_interval) => {}
                _ = shutdown.changed() => break,
            }
            self.gossip_once().await;
        }
        debug!("Gossip loop stopped");
    }

    /// Push this node's top-scoring records to a few random active peers.
    async fn gossip_once(&self) {
        let batch = self.top_scored_records(self.config.gossip_batch_size).await;
        if batch.is_empty() {
            return;
        }

        let mut targets: Vec<String> = {
            let table = self.table.read().await;
            table.active.iter().cloned().collect()
        };
        if targets.is_empty() {
            return;
        }
        {
            let mut rng = rand::rng();
            targets.shuffle(&mut rng);
        }
        targets.truncate(self.config.gossip_fanout);

        let request = SharePeersRequest {
            node_id: self.config.node_id.clone(),
            peers: batch
                .iter()
                .filter_map(|r| serde_json::to_value(r).ok())
                .collect(),
            timestamp: chrono::Utc::now(),
        };

        for url in targets {
            match self
                .client
                .post(format!("{}/sharepeers", url))
                .timeout(self.config.exchange_timeout)
                .json(&request)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, shared = request.peers.len(), "Gossip push delivered");
                }
                Ok(resp) => debug!(url = %url, status = %resp.status(), "Gossip push rejected"),
                Err(err) => debug!(url = %url, %err, "Gossip push failed"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Snapshot helpers (short critical sections, I/O outside the lock)
    // ------------------------------------------------------------------

    async fn top_scored_records(&self, limit: usize) -> Vec<PeerRecord> {
        let table = self.table.read().await;
        let mut records: Vec<PeerRecord> = table.records.values().cloned().collect();
        records.sort_by(|a, b| {
            b.peer_score
                .partial_cmp(&a.peer_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        records.truncate(limit);
        records
    }

    async fn top_active_urls(&self, limit: usize) -> Vec<String> {
        let table = self.table.read().await;
        let mut active: Vec<(String, f64)> = table
            .active
            .iter()
            .filter_map(|url| {
                table
                    .records
                    .get(url.as_str())
                    .map(|r| (url.clone(), r.peer_score))
            })
            .collect();
        active.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        active.into_iter().take(limit).map(|(url, _)| url).collect()
    }

    // ------------------------------------------------------------------
    // Probes
    // ------------------------------------------------------------------

    /// Synchronous liveness probe: GET `{url}/status` with latency tracking.
    async fn probe_status(&self, url: &str, timeout: Duration) -> Result<(StatusResponse, f64)> {
        let started = std::time::Instant::now();
        let response = self
            .client
            .get(format!("{}/status", url))
            .timeout(timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PeerNetError::Network(format!(
                "status probe returned {}",
                response.status()
            )));
        }
        let status: StatusResponse = response.json().await.unwrap_or_default();
        Ok((status, started.elapsed().as_secs_f64()))
    }

    /// Short-timeout probe used by the port scan. Only reachability matters.
    async fn quick_probe(&self, url: &str) -> bool {
        match self
            .client
            .get(format!("{}/status", url))
            .timeout(self.config.scan_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}
