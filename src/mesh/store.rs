//! Counter store replicated over the gossip mesh.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use super::cluster::{Cluster, CounterKey};
use crate::ratelimit::{CounterStore, SlidingWindow, StoreResult};

/// A counter store with no central server.
///
/// Every node owns its own slice counters in the chitchat state and reads sum
/// the slices published by all live nodes. Totals are eventually consistent:
/// hits recorded on a peer become visible after the next gossip round.
pub struct MeshStore {
    /// The gossip cluster
    cluster: Arc<Cluster>,
    /// Slices this node has written, by key, so stale ones can be removed
    written: Mutex<HashMap<String, BTreeSet<u64>>>,
}

impl MeshStore {
    /// Create a store on top of a running cluster.
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self {
            cluster,
            written: Mutex::new(HashMap::new()),
        }
    }

    /// Record `slice` as written for `key` and return the slices that have
    /// slid out of the window.
    fn track(&self, key: &str, slice: u64, window: &SlidingWindow) -> Vec<CounterKey> {
        let mut written = self.written.lock();
        let slices = written.entry(key.to_string()).or_default();
        slices.insert(slice);
        split_stale(key, slices, *window.active_buckets(slice).start())
    }

    /// Delete this node's slices that have left the window for every key,
    /// forgetting keys with nothing left. Returns how many slices were removed.
    pub async fn purge_expired(&self, window: &SlidingWindow) -> usize {
        let stale = self.collect_stale(Self::current_slice(window), window);
        self.cluster.delete_counters(&stale).await;
        if !stale.is_empty() {
            trace!(slices = stale.len(), "Purged expired mesh counters");
        }
        stale.len()
    }

    fn collect_stale(&self, current: u64, window: &SlidingWindow) -> Vec<CounterKey> {
        let oldest = *window.active_buckets(current).start();
        let mut stale = Vec::new();
        self.written.lock().retain(|key, slices| {
            stale.extend(split_stale(key, slices, oldest));
            !slices.is_empty()
        });
        stale
    }

    fn window_keys(key: &str, window: &SlidingWindow, current: u64) -> Vec<CounterKey> {
        window
            .active_buckets(current)
            .map(|slice| CounterKey::new(key, slice))
            .collect()
    }

    fn current_slice(window: &SlidingWindow) -> u64 {
        window.bucket_at(chrono::Utc::now().timestamp_millis().max(0) as u64)
    }
}

/// Remove slices older than `oldest` from `slices` and key them for deletion.
fn split_stale(key: &str, slices: &mut BTreeSet<u64>, oldest: u64) -> Vec<CounterKey> {
    let live = slices.split_off(&oldest);
    std::mem::replace(slices, live)
        .into_iter()
        .map(|stale_slice| CounterKey::new(key, stale_slice))
        .collect()
}

#[async_trait]
impl CounterStore for MeshStore {
    async fn increment(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        let current = Self::current_slice(window);

        self.cluster
            .increment_counter(&CounterKey::new(key, current), 1)
            .await;

        let stale = self.track(key, current, window);
        self.cluster.delete_counters(&stale).await;

        let total = self
            .cluster
            .get_counts(&Self::window_keys(key, window, current))
            .await;
        trace!(key = %key, slice = current, total = total, "Incremented mesh counter");
        Ok(total)
    }

    async fn count(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        let current = Self::current_slice(window);
        Ok(self
            .cluster
            .get_counts(&Self::window_keys(key, window, current))
            .await)
    }

    fn name(&self) -> &'static str {
        "mesh"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ClusterConfig;
    use std::time::Duration;

    fn test_cluster_config(port: u16) -> ClusterConfig {
        let addr: std::net::SocketAddr = ([127, 0, 0, 1], port).into();
        ClusterConfig {
            node_id: format!("test-node-{}", port),
            listen_addr: addr,
            advertise_addr: addr,
            seed_nodes: Vec::new(),
            cluster_id: "test-cluster".to_string(),
            gossip_interval: Duration::from_millis(50),
            dead_node_grace_period: Duration::from_secs(60),
        }
    }

    #[tokio::test]
    async fn test_mesh_store_increment_and_count() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18946)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            // A long window keeps both hits inside it regardless of timing
            let window = SlidingWindow::new(Duration::from_secs(60), 10).unwrap();

            assert_eq!(store.count("outproxy:a", &window).await.unwrap(), 0);
            assert_eq!(store.increment("outproxy:a", &window).await.unwrap(), 1);
            assert_eq!(store.increment("outproxy:a", &window).await.unwrap(), 2);
            assert_eq!(store.count("outproxy:a", &window).await.unwrap(), 2);
            assert_eq!(store.count("outproxy:b", &window).await.unwrap(), 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_track_returns_stale_slices() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18947)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            let window = SlidingWindow::new(Duration::from_secs(1), 10).unwrap();

            assert!(store.track("k", 100, &window).is_empty());
            assert!(store.track("k", 105, &window).is_empty());

            let stale = store.track("k", 112, &window);
            assert_eq!(stale, vec![CounterKey::new("k", 100)]);

            let stale = store.track("k", 200, &window);
            assert_eq!(
                stale,
                vec![CounterKey::new("k", 105), CounterKey::new("k", 112)]
            );
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_collect_stale_covers_idle_keys() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18948)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            let window = SlidingWindow::new(Duration::from_secs(1), 10).unwrap();

            store.track("idle", 100, &window);
            store.track("idle", 101, &window);
            store.track("busy", 100, &window);
            store.track("busy", 205, &window);

            let mut stale = store.collect_stale(206, &window);
            stale.sort_by(|a, b| (&a.key, a.slice).cmp(&(&b.key, b.slice)));
            assert_eq!(
                stale,
                vec![
                    CounterKey::new("busy", 100),
                    CounterKey::new("idle", 100),
                    CounterKey::new("idle", 101),
                ]
            );

            let written = store.written.lock();
            assert!(!written.contains_key("idle"));
            assert_eq!(written["busy"].iter().copied().collect::<Vec<_>>(), vec![205]);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_purge_expired_removes_gossip_state() {
        let cluster = Arc::new(Cluster::start(test_cluster_config(18949)).await.unwrap());

        {
            let store = MeshStore::new(cluster.clone());
            let window = SlidingWindow::new(Duration::from_millis(200), 4).unwrap();

            store.increment("outproxy:gone", &window).await.unwrap();
            assert_eq!(store.purge_expired(&window).await, 0);

            tokio::time::sleep(Duration::from_millis(400)).await;
            assert_eq!(store.purge_expired(&window).await, 1);
            assert!(store.written.lock().is_empty());
            assert_eq!(store.count("outproxy:gone", &window).await.unwrap(), 0);
        }

        Arc::try_unwrap(cluster).unwrap().shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_store_sums_across_nodes() {
        let cluster1 = Arc::new(Cluster::start(test_cluster_config(18950)).await.unwrap());
        let mut config2 = test_cluster_config(18951);
        config2.seed_nodes = vec!["127.0.0.1:18950".to_string()];
        let cluster2 = Arc::new(Cluster::start(config2).await.unwrap());

        tokio::time::sleep(Duration::from_millis(500)).await;

        {
            let store1 = MeshStore::new(cluster1.clone());
            let store2 = MeshStore::new(cluster2.clone());
            let window = SlidingWindow::new(Duration::from_secs(60), 10).unwrap();

            store1.increment("outproxy:shared", &window).await.unwrap();
            store2.increment("outproxy:shared", &window).await.unwrap();

            tokio::time::sleep(Duration::from_millis(300)).await;

            assert_eq!(store1.count("outproxy:shared", &window).await.unwrap(), 2);
            assert_eq!(store2.count("outproxy:shared", &window).await.unwrap(), 2);
        }

        Arc::try_unwrap(cluster1).unwrap().shutdown().await.unwrap();
        Arc::try_unwrap(cluster2).unwrap().shutdown().await.unwrap();
    }
}
