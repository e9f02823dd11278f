//! Configuration management for Outproxy.
//!
//! Settings come from an optional YAML file overlaid with `OUTPROXY__`
//! environment variables (`OUTPROXY__RATE_LIMITING__INITIAL_CEILING=100`).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, Result};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{ClientKeySource, PacingPolicy, SlidingWindow, DEFAULT_NAMESPACE};

/// Main configuration for the Outproxy service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Upstream origin configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the gateway listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// How client keys are derived
    #[serde(default)]
    pub client_key: ClientKeySource,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            client_key: ClientKeySource::default(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 80))
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Ceiling in effect at startup, until changed through `POST /rate`
    #[serde(default = "default_initial_ceiling")]
    pub initial_ceiling: u64,

    /// Length of the rate window in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Number of slices the window is divided into
    #[serde(default = "default_granularity")]
    pub granularity: u32,

    /// Prefix for counter keys in the shared store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Pacing delays at or below this are skipped
    #[serde(default = "default_min_pause_ms")]
    pub min_pause_ms: u64,

    /// Longest a request may stay parked over the ceiling before it is
    /// answered with 429. Unset waits indefinitely.
    #[serde(default = "default_max_stall_ms")]
    pub max_stall_ms: Option<u64>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            initial_ceiling: default_initial_ceiling(),
            window_ms: default_window_ms(),
            granularity: default_granularity(),
            namespace: default_namespace(),
            min_pause_ms: default_min_pause_ms(),
            max_stall_ms: default_max_stall_ms(),
        }
    }
}

fn default_initial_ceiling() -> u64 {
    500
}

fn default_window_ms() -> u64 {
    1000
}

fn default_granularity() -> u32 {
    100
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_min_pause_ms() -> u64 {
    10
}

fn default_max_stall_ms() -> Option<u64> {
    Some(30_000)
}

impl RateLimitingConfig {
    /// The configured sliding window.
    pub fn window(&self) -> Result<SlidingWindow> {
        SlidingWindow::new(Duration::from_millis(self.window_ms), self.granularity)
    }

    /// The configured pacing policy.
    pub fn pacing(&self) -> PacingPolicy {
        PacingPolicy {
            min_pause: Duration::from_millis(self.min_pause_ms),
            max_stall: self.max_stall_ms.map(Duration::from_millis),
        }
    }
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process-local counters
    Memory,
    /// A Redis server shared by all instances
    Redis {
        #[serde(default = "default_redis_url")]
        url: String,
    },
    /// A gossip mesh between instances
    Mesh(MeshConfig),
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Redis {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://redis:6379".to_string()
}

/// Gossip mesh configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Node identifier, random when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers, defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Peers to contact on startup
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Nodes only gossip with peers using the same cluster ID
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    /// Gossip interval in milliseconds
    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "outproxy".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

impl MeshConfig {
    /// Cluster settings for this node.
    pub fn cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }
}

/// Upstream origin configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// The origin every admitted request is forwarded to
    #[serde(default = "default_upstream_url")]
    pub url: String,

    /// Endpoint serving the PEM root the upstream certificate chains to.
    /// Unset uses the bundled web PKI roots.
    #[serde(default = "default_ca_url")]
    pub ca_url: Option<String>,

    /// Where the fetched root is cached
    #[serde(default = "default_ca_cache_path")]
    pub ca_cache_path: PathBuf,

    /// Connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// TCP keepalive in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            ca_url: default_ca_url(),
            ca_cache_path: default_ca_cache_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_upstream_url() -> String {
    "https://dumbserver/".to_string()
}

fn default_ca_url() -> Option<String> {
    Some("http://vault:8200/v1/pki/ca/pem".to_string())
}

fn default_ca_cache_path() -> PathBuf {
    PathBuf::from("ca.pem")
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_keepalive_secs() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl GatewayConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let config: GatewayConfig = builder
            .add_source(
                config::Environment::with_prefix("OUTPROXY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| GatewayError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatewayConfig =
            serde_yaml::from_str(yaml).map_err(|e| GatewayError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.rate_limiting.initial_ceiling == 0 {
            return Err(GatewayError::Config(
                "rate_limiting.initial_ceiling must be greater than 0".to_string(),
            ));
        }
        self.rate_limiting
            .window()
            .map_err(|e| GatewayError::Config(e.to_string()))?;
        if self.upstream.url.is_empty() {
            return Err(GatewayError::Config("upstream.url is required".to_string()));
        }
        Ok(())
    }
}
