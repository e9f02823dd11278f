//! In-process counter store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use super::store::{CounterStore, StoreError, StoreResult};
use super::window::SlidingWindow;

/// A counter store kept in local memory.
///
/// Only shared between tasks of one process, so it suits single-instance
/// deployments and tests. Time is read from the tokio clock, which makes
/// window behavior deterministic under `tokio::time::pause`.
pub struct MemoryStore {
    /// Slice counters indexed by key
    counters: DashMap<String, BTreeMap<u64, u64>>,
    /// Reference point for slice numbering
    epoch: Instant,
    /// When false every operation fails as if the store were down
    available: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            counters: DashMap::new(),
            epoch: Instant::now(),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the store going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys currently holding at least one live slice.
    pub fn key_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop slices that have left the window, and keys left empty.
    pub fn purge_expired(&self, window: &SlidingWindow) {
        let current = self.current_bucket(window);
        self.counters.retain(|_, slices| {
            slices.retain(|bucket, _| !window.is_stale(*bucket, current));
            !slices.is_empty()
        });
    }

    fn current_bucket(&self, window: &SlidingWindow) -> u64 {
        window.bucket_at(self.epoch.elapsed().as_millis() as u64)
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store disabled".to_string()))
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        self.check_available()?;
        let current = self.current_bucket(window);

        let mut slices = self.counters.entry(key.to_string()).or_default();
        slices.retain(|bucket, _| !window.is_stale(*bucket, current));
        *slices.entry(current).or_insert(0) += 1;
        let total: u64 = slices.values().sum();

        trace!(key = %key, bucket = current, total = total, "Incremented memory counter");
        Ok(total)
    }

    async fn count(&self, key: &str, window: &SlidingWindow) -> StoreResult<u64> {
        self.check_available()?;
        let current = self.current_bucket(window);

        Ok(self
            .counters
            .get(key)
            .map(|slices| {
                slices
                    .range(window.active_buckets(current))
                    .map(|(_, count)| *count)
                    .sum::<u64>()
            })
            .unwrap_or(0))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_increment_and_count() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        assert_eq!(store.count("a", &window).await.unwrap(), 0);
        assert_eq!(store.increment("a", &window).await.unwrap(), 1);
        assert_eq!(store.increment("a", &window).await.unwrap(), 2);
        assert_eq!(store.count("a", &window).await.unwrap(), 2);
        assert_eq!(store.count("b", &window).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_can_go_negative() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        for _ in 0..3 {
            store.increment("a", &window).await.unwrap();
        }
        assert_eq!(store.remaining("a", &window, 5).await.unwrap(), 2);
        assert_eq!(store.remaining("a", &window, 2).await.unwrap(), -1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_saturates_for_huge_ceiling() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        assert_eq!(
            store.remaining("a", &window, u64::MAX).await.unwrap(),
            i64::MAX
        );
        store.increment("a", &window).await.unwrap();
        assert_eq!(
            store.remaining("a", &window, i64::MAX as u64 + 1).await.unwrap(),
            i64::MAX
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        store.increment("a", &window).await.unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        store.increment("a", &window).await.unwrap();
        assert_eq!(store.count("a", &window).await.unwrap(), 2);

        // The first hit leaves the window, the second is still inside it
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(store.count("a", &window).await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(store.count("a", &window).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        store.increment("a", &window).await.unwrap();
        store.increment("b", &window).await.unwrap();
        assert_eq!(store.key_count(), 2);

        tokio::time::sleep(Duration::from_secs(2)).await;
        store.purge_expired(&window);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_fails() {
        let store = MemoryStore::new();
        let window = SlidingWindow::default();

        store.set_available(false);
        assert!(matches!(
            store.increment("a", &window).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.count("a", &window).await.is_err());

        store.set_available(true);
        assert_eq!(store.increment("a", &window).await.unwrap(), 1);
    }
}
