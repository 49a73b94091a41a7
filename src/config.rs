use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the peer discovery overlay.
///
/// Defaults mirror the network's production tuning; every value can be
/// overridden through `PEERNET_*` environment variables via [`PeerNetConfig::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerNetConfig {
    /// Host this node's API is reachable on.
    pub host: String,
    /// Port this node's API is reachable on.
    pub port: u16,
    /// Stable identifier for this node, also keys the persisted peer file.
    pub node_id: String,
    /// Seed URLs contacted at startup.
    pub bootstrap_peers: Vec<String>,
    /// Directory holding `peers_{node_id}.json`.
    pub data_dir: PathBuf,

    /// Desired number of pooled outbound connections.
    pub target_connections: usize,
    /// Hard cap on pooled outbound connections.
    pub max_connections: usize,

    pub discovery_interval: Duration,
    pub gossip_interval: Duration,
    pub health_check_interval: Duration,

    /// Host probed during local port-scan discovery.
    pub scan_host: String,
    pub scan_port_start: u16,
    pub scan_port_end: u16,

    /// Timeout for the synchronous status probe in `add_peer` and pool health checks.
    pub probe_timeout: Duration,
    /// Short timeout used by the port-scan probes.
    pub scan_timeout: Duration,
    /// Timeout for peer-exchange and gossip-push calls.
    pub exchange_timeout: Duration,
    /// Default per-peer timeout for broadcasts.
    pub broadcast_timeout: Duration,

    pub bootstrap_attempts: u32,
    pub bootstrap_retry_delay: Duration,

    /// Maximum number of records advertised per gossip push.
    pub gossip_batch_size: usize,
    /// Number of random active peers a gossip push targets.
    pub gossip_fanout: usize,
    /// Number of active peers asked for their peer list each discovery pass.
    pub exchange_fanout: usize,
    /// Concurrency cap for broadcast fan-out.
    pub broadcast_workers: usize,
}

impl Default for PeerNetConfig {
    fn default() -> Self {
        let host = "127.0.0.1".to_string();
        let port = 7600;
        Self {
            node_id: format!("node-{}-{}", host, port),
            host,
            port,
            bootstrap_peers: Vec::new(),
            data_dir: PathBuf::from("./data"),
            target_connections: 8,
            max_connections: 12,
            discovery_interval: Duration::from_secs(30),
            gossip_interval: Duration::from_secs(60),
            health_check_interval: Duration::from_secs(30),
            scan_host: "127.0.0.1".to_string(),
            scan_port_start: 7600,
            scan_port_end: 7609,
            probe_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(2),
            exchange_timeout: Duration::from_secs(10),
            broadcast_timeout: Duration::from_secs(5),
            bootstrap_attempts: 3,
            bootstrap_retry_delay: Duration::from_secs(3),
            gossip_batch_size: 50,
            gossip_fanout: 3,
            exchange_fanout: 5,
            broadcast_workers: 10,
        }
    }
}

fn env_u64(key: &str, fallback: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl PeerNetConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Ok(host) = env::var("PEERNET_HOST") {
            config.host = host;
        }
        if let Some(port) = env::var("PEERNET_PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
        }
        config.node_id = env::var("PEERNET_NODE_ID")
            .unwrap_or_else(|_| format!("node-{}-{}", config.host, config.port));

        config.bootstrap_peers = env::var("PEERNET_BOOTSTRAP")
            .unwrap_or_default()
            .split(',')
            .filter(|s| !s.is_empty())
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .collect();

        if let Ok(dir) = env::var("PEERNET_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }

        config.scan_host =
            env::var("PEERNET_SCAN_HOST").unwrap_or_else(|_| config.host.clone());
        if let Some(start) = env::var("PEERNET_SCAN_PORT_START")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.scan_port_start = start;
        }
        if let Some(end) = env::var("PEERNET_SCAN_PORT_END")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.scan_port_end = end;
        }

        config.discovery_interval = Duration::from_secs(env_u64(
            "PEERNET_DISCOVERY_INTERVAL_SECS",
            config.discovery_interval.as_secs(),
        ));
        config.gossip_interval = Duration::from_secs(env_u64(
            "PEERNET_GOSSIP_INTERVAL_SECS",
            config.gossip_interval.as_secs(),
        ));

        config
    }

    /// This node's own API endpoint. Never allowed into the peer table.
    pub fn self_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults() {
        let config = PeerNetConfig::default();
        assert_eq!(config.target_connections, 8);
        assert_eq!(config.max_connections, 12);
        assert_eq!(config.discovery_interval, Duration::from_secs(30));
        assert_eq!(config.gossip_interval, Duration::from_secs(60));
        assert_eq!(config.bootstrap_attempts, 3);
        assert_eq!(config.gossip_batch_size, 50);
        assert_eq!(config.self_url(), "http://127.0.0.1:7600");
    }

    #[test]
    #[serial]
    fn test_load_from_env() {
        env::set_var("PEERNET_HOST", "10.0.0.5");
        env::set_var("PEERNET_PORT", "7700");
        env::set_var("PEERNET_BOOTSTRAP", "http://10.0.0.1:7600, http://10.0.0.2:7600/");

        let config = PeerNetConfig::load();
        assert_eq!(config.self_url(), "http://10.0.0.5:7700");
        assert_eq!(
            config.bootstrap_peers,
            vec!["http://10.0.0.1:7600", "http://10.0.0.2:7600"]
        );
        assert_eq!(config.node_id, "node-10.0.0.5-7700");

        env::remove_var("PEERNET_HOST");
        env::remove_var("PEERNET_PORT");
        env::remove_var("PEERNET_BOOTSTRAP");
    }
}
