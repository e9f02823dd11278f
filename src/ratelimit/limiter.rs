//! Rate limiter metering per-client hits against a ceiling.

use std::sync::Arc;
use tracing::trace;

use super::key::ClientKey;
use super::store::{CounterStore, StoreResult};
use super::window::SlidingWindow;

/// Namespace prefixed to every counter key when none is configured.
pub const DEFAULT_NAMESPACE: &str = "outproxy";

/// A metering view over a [`CounterStore`] for one ceiling.
///
/// The limiter never refuses anything itself: `inc` records a hit whether or
/// not the ceiling was reached, and enforcement is up to the caller. A limiter
/// is a value; changing the ceiling means building a new one.
#[derive(Clone)]
pub struct RateLimiter {
    /// The shared counter store
    store: Arc<dyn CounterStore>,
    /// Prefix separating this gateway's keys from other store users
    namespace: String,
    /// Window the ceiling applies to
    window: SlidingWindow,
    /// Hits allowed per window
    ceiling: u64,
}

impl RateLimiter {
    /// Create a new rate limiter.
    pub fn new(
        store: Arc<dyn CounterStore>,
        namespace: impl Into<String>,
        window: SlidingWindow,
        ceiling: u64,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            window,
            ceiling,
        }
    }

    /// The same limiter bound to a different ceiling.
    pub fn with_ceiling(&self, ceiling: u64) -> Self {
        Self {
            ceiling,
            ..self.clone()
        }
    }

    /// Hits recorded for `key` in the current window.
    pub async fn count(&self, key: &ClientKey) -> StoreResult<u64> {
        self.store.count(&self.store_key(key), &self.window).await
    }

    /// Hits left for `key` before the ceiling. Negative when over.
    pub async fn remaining(&self, key: &ClientKey) -> StoreResult<i64> {
        self.store
            .remaining(&self.store_key(key), &self.window, self.ceiling)
            .await
    }

    /// Whether `key` has reached the ceiling.
    pub async fn exceeded(&self, key: &ClientKey) -> StoreResult<bool> {
        let count = self.count(key).await?;
        trace!(key = %key, count = count, ceiling = self.ceiling, "Checked ceiling");
        Ok(count >= self.ceiling)
    }

    /// Record one hit for `key`.
    pub async fn inc(&self, key: &ClientKey) -> StoreResult<()> {
        let total = self.store.increment(&self.store_key(key), &self.window).await?;
        trace!(key = %key, total = total, "Recorded hit");
        Ok(())
    }

    /// Hits allowed per window.
    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// The window the ceiling applies to.
    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    /// Counter key namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Backend name of the underlying store.
    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    fn store_key(&self, key: &ClientKey) -> String {
        format!("{}:{}", self.namespace, key)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("store", &self.store.name())
            .field("namespace", &self.namespace)
            .field("window", &self.window)
            .field("ceiling", &self.ceiling)
            .finish()
    }
}
