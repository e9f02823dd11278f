//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of per-node counter slices between
//! gateway instances.

use std::net::SocketAddr;
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to stop cluster: {0}")]
    ShutdownError(String),
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "outproxy".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }
}

/// Key identifying one window slice of a counter in the cluster state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterKey {
    /// The namespaced client key.
    pub key: String,
    /// The window slice index.
    pub slice: u64,
}

impl CounterKey {
    /// Create a new counter key.
    pub fn new(key: &str, slice: u64) -> Self {
        Self {
            key: key.to_string(),
            slice,
        }
    }

    /// Convert to a chitchat key string.
    /// Format: "counter|{key}|{slice}"
    pub fn to_chitchat_key(&self) -> String {
        format!("counter|{}|{}", self.key, self.slice)
    }

    /// Parse from a chitchat key string.
    pub fn from_chitchat_key(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("counter|")?;

        // Split from the right so keys may contain the delimiter
        let (key, slice) = rest.rsplit_once('|')?;
        let slice: u64 = slice.parse().ok()?;

        Some(Self {
            key: key.to_string(),
            slice,
        })
    }
}

/// The cluster handle for distributed state management.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id,
            handle,
        })
    }

    /// Increment our contribution to a counter slice and return the
    /// slice total across all live nodes.
    pub async fn increment_counter(&self, key: &CounterKey, amount: u64) -> u64 {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let current_local: u64 = chitchat
            .self_node_state()
            .get(&chitchat_key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let new_local = current_local + amount;
        chitchat.self_node_state().set(&chitchat_key, new_local.to_string());

        debug!(
            key = %chitchat_key,
            local_value = new_local,
            "Incremented local counter"
        );

        sum_counter(&chitchat, &chitchat_key)
    }

    /// Sum several counter slices across all live nodes under one lock.
    pub async fn get_counts(&self, keys: &[CounterKey]) -> u64 {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        keys.iter()
            .map(|key| sum_counter(&chitchat, &key.to_chitchat_key()))
            .sum()
    }

    /// Remove our contribution to the given counter slices.
    pub async fn delete_counters(&self, keys: &[CounterKey]) {
        if keys.is_empty() {
            return;
        }
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let node_state = chitchat.self_node_state();
        for key in keys {
            node_state.delete(&key.to_chitchat_key());
        }
        debug!(count = keys.len(), "Deleted stale counter slices");
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

/// Sum a counter across all live nodes, ourselves included.
fn sum_counter(chitchat: &chitchat::Chitchat, key: &str) -> u64 {
    chitchat
        .live_nodes()
        .filter_map(|node_id| chitchat.node_state(node_id))
        .filter_map(|node_state| node_state.get(key))
        .filter_map(|value| value.parse::<u64>().ok())
        .sum()
}
