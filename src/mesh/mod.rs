//! Peer mesh networking module using Chitchat.
//!
//! Gateway instances that do not share a central counter store can form a
//! gossip mesh instead. Each node publishes its own counter slices and reads
//! the sum across all live peers.

mod cluster;
mod store;

pub use cluster::{Cluster, ClusterConfig, ClusterError, CounterKey};
pub use store::MeshStore;
